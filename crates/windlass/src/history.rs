//! Durable history events
//!
//! The append-only event history is the sole authoritative record of a
//! workflow's progress. Events are immutable once committed; workflow state
//! is reconstructed by replaying them in sequence order.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use uuid::Uuid;

use crate::activity::ActivityError;
use crate::payload::Payload;
use crate::workflow::WorkflowError;

/// The atomic unit of durable history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Globally unique token, used for idempotent delivery
    pub id: Uuid,

    /// Monotonic position within the instance history, assigned when the
    /// event is persisted (0 until then)
    #[serde(default)]
    pub sequence_id: i64,

    /// When the event was created
    pub timestamp: DateTime<Utc>,

    /// The command that originated this event; result events carry the same
    /// value as their schedule event, correlating outcomes to prior intents
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule_event_id: Option<i64>,

    /// Variant payload keyed by event type
    pub attributes: EventAttributes,

    /// Delivery barrier: the backend must not hand the event to a worker
    /// before `now >= visible_at`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub visible_at: Option<DateTime<Utc>>,
}

impl Event {
    /// Create a new event with a fresh ID and no correlation
    pub fn new(timestamp: DateTime<Utc>, attributes: EventAttributes) -> Self {
        Self {
            id: Uuid::now_v7(),
            sequence_id: 0,
            timestamp,
            schedule_event_id: None,
            attributes,
            visible_at: None,
        }
    }

    /// Correlate this event to the command that originated it
    pub fn with_schedule_event_id(mut self, schedule_event_id: i64) -> Self {
        self.schedule_event_id = Some(schedule_event_id);
        self
    }

    /// Delay delivery of this event until the given instant
    pub fn with_visible_at(mut self, visible_at: DateTime<Utc>) -> Self {
        self.visible_at = Some(visible_at);
        self
    }

    /// The type tag of this event
    pub fn event_type(&self) -> EventType {
        self.attributes.event_type()
    }

    /// Whether committing this event ends the execution.
    ///
    /// `WorkflowExecutionCanceled` is deliberately not included: cancellation
    /// is a cooperative request delivered into the workflow, which then ends
    /// its execution with a `WorkflowExecutionFinished`.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.event_type(),
            EventType::WorkflowExecutionFinished | EventType::WorkflowExecutionTerminated
        )
    }
}

/// Closed set of event types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    WorkflowExecutionStarted,
    WorkflowExecutionFinished,
    WorkflowExecutionTerminated,
    WorkflowExecutionCanceled,
    ActivityScheduled,
    ActivityCompleted,
    ActivityFailed,
    TimerScheduled,
    TimerFired,
    TimerCanceled,
    SubWorkflowScheduled,
    SubWorkflowCompleted,
    SubWorkflowFailed,
    SubWorkflowCancellationRequested,
    SignalReceived,
    SideEffectResult,
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::WorkflowExecutionStarted => "workflow_execution_started",
            Self::WorkflowExecutionFinished => "workflow_execution_finished",
            Self::WorkflowExecutionTerminated => "workflow_execution_terminated",
            Self::WorkflowExecutionCanceled => "workflow_execution_canceled",
            Self::ActivityScheduled => "activity_scheduled",
            Self::ActivityCompleted => "activity_completed",
            Self::ActivityFailed => "activity_failed",
            Self::TimerScheduled => "timer_scheduled",
            Self::TimerFired => "timer_fired",
            Self::TimerCanceled => "timer_canceled",
            Self::SubWorkflowScheduled => "sub_workflow_scheduled",
            Self::SubWorkflowCompleted => "sub_workflow_completed",
            Self::SubWorkflowFailed => "sub_workflow_failed",
            Self::SubWorkflowCancellationRequested => "sub_workflow_cancellation_requested",
            Self::SignalReceived => "signal_received",
            Self::SideEffectResult => "side_effect_result",
        };
        write!(f, "{name}")
    }
}

/// Typed attributes for each event variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventAttributes {
    /// Execution began with the given input
    WorkflowExecutionStarted {
        /// Registered workflow name
        name: String,

        /// Optional workflow version
        #[serde(default, skip_serializing_if = "Option::is_none")]
        version: Option<String>,

        /// Encoded workflow input
        input: Payload,
    },

    /// Execution reached a terminal state
    WorkflowExecutionFinished {
        /// Encoded result when the workflow returned a value
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<Payload>,

        /// Error when the workflow failed
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<WorkflowError>,
    },

    /// Execution was force-killed by an operator
    WorkflowExecutionTerminated {
        /// Reason recorded for the termination
        reason: String,
    },

    /// Cancellation was requested for this execution
    WorkflowExecutionCanceled {},

    /// An activity was scheduled for execution
    ActivityScheduled {
        /// Registered activity name
        name: String,

        /// Optional activity version
        #[serde(default, skip_serializing_if = "Option::is_none")]
        version: Option<String>,

        /// Encoded activity input
        input: Payload,

        /// Attempt number (1-based; retries re-schedule with a higher attempt)
        attempt: u32,

        /// Maximum execution time enforced by the activity worker
        #[serde(default, with = "option_duration_millis")]
        start_to_close_timeout: Option<Duration>,
    },

    /// An activity returned a value
    ActivityCompleted {
        /// Encoded activity result
        result: Payload,
    },

    /// An activity returned an error
    ActivityFailed {
        /// Error details
        error: ActivityError,
    },

    /// A timer was scheduled
    TimerScheduled {
        /// When the timer fires
        fire_at: DateTime<Utc>,
    },

    /// A timer's delay elapsed
    TimerFired {
        /// When the timer fired
        fire_at: DateTime<Utc>,
    },

    /// A timer was canceled before firing
    TimerCanceled {},

    /// A sub-workflow was scheduled
    SubWorkflowScheduled {
        /// Instance ID chosen for the sub-workflow
        instance_id: String,

        /// Registered workflow name
        name: String,

        /// Optional workflow version
        #[serde(default, skip_serializing_if = "Option::is_none")]
        version: Option<String>,

        /// Encoded sub-workflow input
        input: Payload,
    },

    /// A sub-workflow completed successfully
    SubWorkflowCompleted {
        /// Encoded sub-workflow result
        result: Payload,
    },

    /// A sub-workflow failed
    SubWorkflowFailed {
        /// Error from the sub-workflow
        error: WorkflowError,
    },

    /// Cancellation was requested for a sub-workflow.
    ///
    /// Appears twice per request: in the parent history (correlated to the
    /// `CancelSubWorkflow` command via `schedule_event_id`) and as an inbound
    /// event in the child (no `schedule_event_id`).
    SubWorkflowCancellationRequested {},

    /// An external signal was delivered
    SignalReceived {
        /// Signal channel name
        name: String,

        /// Encoded signal payload
        payload: Payload,
    },

    /// A side effect's first-execution value
    SideEffectResult {
        /// Encoded value captured when the side effect first ran
        value: Payload,
    },
}

impl EventAttributes {
    /// The type tag for this attribute variant
    pub fn event_type(&self) -> EventType {
        match self {
            Self::WorkflowExecutionStarted { .. } => EventType::WorkflowExecutionStarted,
            Self::WorkflowExecutionFinished { .. } => EventType::WorkflowExecutionFinished,
            Self::WorkflowExecutionTerminated { .. } => EventType::WorkflowExecutionTerminated,
            Self::WorkflowExecutionCanceled {} => EventType::WorkflowExecutionCanceled,
            Self::ActivityScheduled { .. } => EventType::ActivityScheduled,
            Self::ActivityCompleted { .. } => EventType::ActivityCompleted,
            Self::ActivityFailed { .. } => EventType::ActivityFailed,
            Self::TimerScheduled { .. } => EventType::TimerScheduled,
            Self::TimerFired { .. } => EventType::TimerFired,
            Self::TimerCanceled {} => EventType::TimerCanceled,
            Self::SubWorkflowScheduled { .. } => EventType::SubWorkflowScheduled,
            Self::SubWorkflowCompleted { .. } => EventType::SubWorkflowCompleted,
            Self::SubWorkflowFailed { .. } => EventType::SubWorkflowFailed,
            Self::SubWorkflowCancellationRequested {} => {
                EventType::SubWorkflowCancellationRequested
            }
            Self::SignalReceived { .. } => EventType::SignalReceived,
            Self::SideEffectResult { .. } => EventType::SideEffectResult,
        }
    }
}

/// Serde support for Option<Duration> as milliseconds
pub(crate) mod option_duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.map(|d| d.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis: Option<u64> = Option::deserialize(deserializer)?;
        Ok(millis.map(Duration::from_millis))
    }
}
