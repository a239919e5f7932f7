//! Backend contract
//!
//! The backend is the abstract task queue and event store the engine runs
//! against. Concrete drivers (relational, embedded KV, the in-memory
//! reference driver) all satisfy [`Backend`]; the engine performs no other
//! interaction with storage.

pub mod memory;

pub use memory::InMemoryBackend;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::clock::Clock;
use crate::history::Event;
use crate::instance::WorkflowInstance;
use crate::payload::Payload;
use crate::workflow::WorkflowError;

/// Error type for backend operations
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    /// Instance not found
    #[error("workflow instance not found: {0}")]
    InstanceNotFound(String),

    /// An instance with this ID already exists under another execution
    #[error("workflow instance already exists: {0}")]
    InstanceAlreadyExists(String),

    /// Operation targets an instance that already reached a terminal state
    #[error("workflow instance is terminal: {0}")]
    InstanceTerminal(String),

    /// The lease backing an in-flight task was lost
    #[error("task lease lost for instance {0}")]
    LeaseLost(String),

    /// Stored history violates an invariant
    #[error("corrupt history for instance {instance_id}: {reason}")]
    CorruptHistory {
        instance_id: String,
        reason: String,
    },

    /// Transient driver error; callers retry with backoff
    #[error("backend error: {0}")]
    Other(#[from] anyhow::Error),
}

/// Status of a workflow instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    /// Instance may still produce events
    Running,

    /// Instance completed (successfully or with a workflow error)
    Finished,

    /// Instance was force-killed by an operator
    Terminated,
}

impl InstanceStatus {
    /// Whether no further events may be appended
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finished | Self::Terminated)
    }
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::Finished => write!(f, "finished"),
            Self::Terminated => write!(f, "terminated"),
        }
    }
}

/// Read model of one instance, served to clients.
#[derive(Debug, Clone)]
pub struct InstanceState {
    /// The instance identity
    pub instance: WorkflowInstance,

    /// Current status
    pub status: InstanceStatus,

    /// Encoded result once the instance finished successfully
    pub result: Option<Payload>,

    /// Error once the instance failed
    pub error: Option<WorkflowError>,
}

/// A leased batch of workflow events handed to the workflow worker.
#[derive(Debug, Clone)]
pub struct WorkflowTask {
    /// The instance being executed
    pub instance: WorkflowInstance,

    /// Registered workflow name (from the start event)
    pub workflow_name: String,

    /// Last history sequence already acknowledged
    pub last_sequence_id: i64,

    /// Committed history, ordered by sequence
    pub history: Vec<Event>,

    /// Newly visible pending events to apply this slice
    pub new_events: Vec<Event>,

    /// Lease token; completion fails if the lease was lost
    pub lease_token: Uuid,
}

/// A leased activity invocation handed to the activity worker.
#[derive(Debug, Clone)]
pub struct ActivityTask {
    /// Unique task ID
    pub id: Uuid,

    /// Instance that scheduled the activity
    pub instance: WorkflowInstance,

    /// The originating `ActivityScheduled` event
    pub schedule_event: Event,

    /// Lease token; completion fails if the lease was lost
    pub lease_token: Uuid,
}

/// A message produced by completing a workflow task, routed to another
/// instance (or back to the same one) in the same atomic commit.
#[derive(Debug, Clone)]
pub enum InstanceMessage {
    /// Create a new instance and deliver its start event
    CreateInstance {
        /// The new instance, parent linkage included
        instance: WorkflowInstance,

        /// The `WorkflowExecutionStarted` event to deliver
        event: Event,
    },

    /// Append a pending event to an existing instance
    DeliverEvent {
        /// Target instance ID
        target_instance_id: String,

        /// The event to deliver
        event: Event,
    },
}

/// Abstract task queue and event store.
///
/// Every completion operation is a single atomic boundary (one transaction,
/// or an equivalent compare-and-set chain); the engine's durability
/// guarantees collapse otherwise. Implementations must be thread-safe.
#[async_trait]
pub trait Backend: Send + Sync + 'static {
    /// The time source this backend stamps and filters events with
    fn clock(&self) -> Arc<dyn Clock>;

    // =========================================================================
    // Instance Operations
    // =========================================================================

    /// Create a new workflow instance and deliver its start event.
    ///
    /// Idempotent for the same `(instance_id, execution_id)`; fails when the
    /// instance ID is taken by a different execution.
    async fn create_workflow_instance(
        &self,
        instance: WorkflowInstance,
        start_event: Event,
    ) -> Result<(), BackendError>;

    /// Append a pending event (signal, cancellation request) to an instance,
    /// making it runnable. Fails if the instance is terminal.
    async fn signal_workflow_instance(
        &self,
        instance_id: &str,
        event: Event,
    ) -> Result<(), BackendError>;

    /// Force-kill an instance, appending `WorkflowExecutionTerminated`
    /// directly to its history.
    async fn terminate_workflow_instance(
        &self,
        instance_id: &str,
        reason: &str,
    ) -> Result<(), BackendError>;

    /// Read the current status and outcome of an instance
    async fn get_workflow_instance_state(
        &self,
        instance_id: &str,
    ) -> Result<InstanceState, BackendError>;

    /// Read the committed history of an instance
    async fn get_workflow_history(&self, instance_id: &str) -> Result<Vec<Event>, BackendError>;

    // =========================================================================
    // Workflow Task Operations
    // =========================================================================

    /// Lease a workflow task for an instance that has at least one pending
    /// event with `visible_at <= now` and is not currently leased.
    ///
    /// Blocks up to `timeout`; returns `None` when no task became available.
    async fn get_workflow_task(
        &self,
        timeout: Duration,
    ) -> Result<Option<WorkflowTask>, BackendError>;

    /// Renew the lease on an in-flight workflow task
    async fn extend_workflow_task_lease(&self, task: &WorkflowTask) -> Result<(), BackendError>;

    /// Atomically commit the outcome of a workflow task: append
    /// `executed_events` to history, enqueue `activity_events` as activity
    /// tasks, enqueue `timer_events` as delayed pending events, deliver
    /// `messages`, release the lease, and advance the acknowledged sequence.
    ///
    /// Fails with [`BackendError::LeaseLost`] when the lease expired; nothing
    /// is committed in that case.
    async fn complete_workflow_task(
        &self,
        task: &WorkflowTask,
        executed_events: Vec<Event>,
        activity_events: Vec<Event>,
        timer_events: Vec<Event>,
        messages: Vec<InstanceMessage>,
    ) -> Result<(), BackendError>;

    // =========================================================================
    // Activity Task Operations
    // =========================================================================

    /// Lease an activity task. Blocks up to `timeout`; returns `None` when
    /// no task became available.
    async fn get_activity_task(
        &self,
        timeout: Duration,
    ) -> Result<Option<ActivityTask>, BackendError>;

    /// Renew the lease on an in-flight activity task
    async fn extend_activity_task_lease(&self, task: &ActivityTask) -> Result<(), BackendError>;

    /// Atomically append the result event to the scheduling instance and
    /// delete the activity task.
    ///
    /// Completing an already-deleted task is a no-op: activity delivery is
    /// at-least-once and duplicates reconcile idempotently by event ID.
    async fn complete_activity_task(
        &self,
        task: &ActivityTask,
        result_event: Event,
    ) -> Result<(), BackendError>;
}
