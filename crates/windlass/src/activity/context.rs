//! Activity execution context

use tokio::sync::mpsc;
use uuid::Uuid;

use crate::instance::WorkflowInstance;

/// Context provided to activity functions during execution.
///
/// Carries the identity of the invocation and a heartbeat handle. The
/// activity worker already renews the task lease on a fixed interval;
/// explicit heartbeats additionally renew it immediately, which long-running
/// activities can use between expensive steps.
#[derive(Debug)]
pub struct ActivityContext {
    /// ID of the activity task being executed
    pub task_id: Uuid,

    /// Workflow instance that scheduled this activity
    pub instance: WorkflowInstance,

    /// Registered name of the activity
    pub activity_name: String,

    /// Attempt number (1-based)
    pub attempt: u32,

    heartbeat_tx: Option<mpsc::Sender<()>>,
}

impl ActivityContext {
    /// Create a new activity context
    pub fn new(
        task_id: Uuid,
        instance: WorkflowInstance,
        activity_name: impl Into<String>,
        attempt: u32,
    ) -> Self {
        Self {
            task_id,
            instance,
            activity_name: activity_name.into(),
            attempt,
            heartbeat_tx: None,
        }
    }

    /// Attach a heartbeat channel drained by the activity worker
    pub fn with_heartbeat(mut self, tx: mpsc::Sender<()>) -> Self {
        self.heartbeat_tx = Some(tx);
        self
    }

    /// Record a heartbeat, renewing the task lease immediately.
    ///
    /// A no-op when the worker did not attach a heartbeat channel (e.g. in
    /// tests that invoke activities inline).
    pub async fn heartbeat(&self) {
        if let Some(tx) = &self.heartbeat_tx {
            let _ = tx.send(()).await;
        }
    }
}
