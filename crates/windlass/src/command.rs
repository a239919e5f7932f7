//! Workflow commands
//!
//! Commands are the intents a workflow emits during one task execution. The
//! worker translates pending commands into durable events; during replay the
//! executor reconciles re-emitted commands against the schedule events
//! already in history.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::history::{option_duration_millis, Event, EventType};
use crate::payload::Payload;
use crate::workflow::WorkflowError;

/// Lifecycle of a command within one task execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandState {
    /// Emitted this slice, not yet reconciled or translated
    Pending,

    /// Matched against a schedule event already in history
    Committed,

    /// Canceled before translation
    Canceled,

    /// Fully handled (result already known at emission time)
    Done,
}

/// An intent emitted by workflow code.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    /// Unique within the instance; assigned by the workflow state's
    /// monotonic counter
    pub id: i64,

    /// Reconciliation state
    pub state: CommandState,

    /// Variant payload keyed by command type
    pub attributes: CommandAttributes,
}

/// Typed attributes for each command variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CommandAttributes {
    /// Schedule one activity attempt
    ScheduleActivity {
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        version: Option<String>,
        input: Payload,
        attempt: u32,
        #[serde(default, with = "option_duration_millis")]
        start_to_close_timeout: Option<Duration>,
    },

    /// Schedule a timer that fires at an absolute instant
    ScheduleTimer { fire_at: DateTime<Utc> },

    /// Cancel a previously scheduled timer
    CancelTimer {
        /// The `ScheduleTimer` command being canceled
        timer_schedule_event_id: i64,
    },

    /// Schedule a sub-workflow
    ScheduleSubWorkflow {
        instance_id: String,
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        version: Option<String>,
        input: Payload,
    },

    /// Request cancellation of a sub-workflow
    CancelSubWorkflow { instance_id: String },

    /// Record a side effect's first-execution value
    SideEffect { value: Payload },

    /// End this execution with a result or an error
    CompleteWorkflow {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<Payload>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<WorkflowError>,
    },
}

impl Command {
    /// Create a pending command
    pub fn new(id: i64, attributes: CommandAttributes) -> Self {
        Self {
            id,
            state: CommandState::Pending,
            attributes,
        }
    }

    /// The schedule event type this command produces when translated
    pub fn schedule_event_type(&self) -> EventType {
        match &self.attributes {
            CommandAttributes::ScheduleActivity { .. } => EventType::ActivityScheduled,
            CommandAttributes::ScheduleTimer { .. } => EventType::TimerScheduled,
            CommandAttributes::CancelTimer { .. } => EventType::TimerCanceled,
            CommandAttributes::ScheduleSubWorkflow { .. } => EventType::SubWorkflowScheduled,
            CommandAttributes::CancelSubWorkflow { .. } => {
                EventType::SubWorkflowCancellationRequested
            }
            CommandAttributes::SideEffect { .. } => EventType::SideEffectResult,
            CommandAttributes::CompleteWorkflow { .. } => EventType::WorkflowExecutionFinished,
        }
    }

    /// Whether the given schedule event corresponds to this command.
    ///
    /// A `TimerCanceled` event carries the *timer's* command ID so the
    /// backend can correlate it with the pending `TimerFired`; everything
    /// else carries the emitting command's own ID.
    pub fn matches_event(&self, event: &Event) -> bool {
        if event.event_type() != self.schedule_event_type() {
            return false;
        }
        match &self.attributes {
            CommandAttributes::CancelTimer {
                timer_schedule_event_id,
            } => event.schedule_event_id == Some(*timer_schedule_event_id),
            _ => event.schedule_event_id == Some(self.id),
        }
    }
}
