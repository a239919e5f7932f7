//! Workers
//!
//! A [`Worker`] runs the long-lived loops that drive an instance of the
//! engine: a workflow worker (poll → execute → commit) and an activity
//! worker (poll → invoke → report), each with bounded concurrency and lease
//! heartbeating. Workers are freely multi-threaded; the single-threaded
//! discipline applies only inside each workflow task execution.

pub(crate) mod activity_worker;
pub(crate) mod workflow_worker;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, instrument};

use crate::activity::ActivityExecutor;
use crate::backend::Backend;
use crate::executor::WorkflowExecutor;
use crate::payload::{Converter, JsonConverter};
use crate::registry::Registry;

/// Worker configuration.
///
/// Lease duration is a property of the backend (the lease issuer); the
/// worker only controls how often it renews via `heartbeat_interval`.
#[derive(Clone)]
pub struct WorkerOptions {
    /// Maximum workflow tasks processed concurrently (always across
    /// distinct instances; the backend leases one worker per instance)
    pub max_concurrent_workflow_tasks: usize,

    /// Maximum activity tasks processed concurrently
    pub max_concurrent_activity_tasks: usize,

    /// How long each workflow task poll blocks on the backend
    pub workflow_poll_interval: Duration,

    /// How long each activity task poll blocks on the backend
    pub activity_poll_interval: Duration,

    /// Interval between lease renewals for in-flight tasks
    pub heartbeat_interval: Duration,

    /// Payload converter shared by executors
    pub converter: Arc<dyn Converter>,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            max_concurrent_workflow_tasks: 10,
            max_concurrent_activity_tasks: 10,
            workflow_poll_interval: Duration::from_secs(1),
            activity_poll_interval: Duration::from_secs(1),
            // 25 s heartbeat against the default 30 s lease
            heartbeat_interval: Duration::from_secs(25),
            converter: Arc::new(JsonConverter),
        }
    }
}

impl WorkerOptions {
    /// Create options with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the maximum concurrent workflow tasks
    pub fn with_max_concurrent_workflow_tasks(mut self, max: usize) -> Self {
        self.max_concurrent_workflow_tasks = max.max(1);
        self
    }

    /// Set the maximum concurrent activity tasks
    pub fn with_max_concurrent_activity_tasks(mut self, max: usize) -> Self {
        self.max_concurrent_activity_tasks = max.max(1);
        self
    }

    /// Set the workflow poll interval
    pub fn with_workflow_poll_interval(mut self, interval: Duration) -> Self {
        self.workflow_poll_interval = interval;
        self
    }

    /// Set the activity poll interval
    pub fn with_activity_poll_interval(mut self, interval: Duration) -> Self {
        self.activity_poll_interval = interval;
        self
    }

    /// Set the lease heartbeat interval
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Set the payload converter
    pub fn with_converter(mut self, converter: Arc<dyn Converter>) -> Self {
        self.converter = converter;
        self
    }
}

/// Worker errors
#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    /// Worker already running
    #[error("worker is already running")]
    AlreadyRunning,
}

/// Long-running process that polls tasks, routes them to the executors, and
/// commits their outcomes.
///
/// # Example
///
/// ```ignore
/// let worker = Worker::new(backend, Arc::new(registry), WorkerOptions::default());
/// worker.start().await?;
/// // ...
/// worker.shutdown().await;
/// ```
pub struct Worker {
    backend: Arc<dyn Backend>,
    registry: Arc<Registry>,
    options: WorkerOptions,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    handles: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl Worker {
    /// Create a worker over a backend and registry
    pub fn new(backend: Arc<dyn Backend>, registry: Arc<Registry>, options: WorkerOptions) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            backend,
            registry,
            options,
            shutdown_tx,
            shutdown_rx,
            handles: std::sync::Mutex::new(Vec::new()),
        }
    }

    /// Start the workflow and activity loops
    #[instrument(skip(self))]
    pub async fn start(&self) -> Result<(), WorkerError> {
        {
            let handles = self.handles.lock().unwrap();
            if !handles.is_empty() {
                return Err(WorkerError::AlreadyRunning);
            }
        }

        info!(
            workflows = ?self.registry.workflow_names().collect::<Vec<_>>(),
            activities = ?self.registry.activity_names().collect::<Vec<_>>(),
            "starting worker"
        );

        let workflow_executor = Arc::new(WorkflowExecutor::new(
            Arc::clone(&self.registry),
            Arc::clone(&self.options.converter),
        ));
        let activity_executor = Arc::new(ActivityExecutor::new(
            Arc::clone(&self.registry),
            Arc::clone(&self.options.converter),
            self.backend.clock(),
        ));

        let workflow_handles = workflow_worker::start(
            Arc::clone(&self.backend),
            workflow_executor,
            self.options.clone(),
            self.shutdown_rx.clone(),
        );
        let activity_handles = activity_worker::start(
            Arc::clone(&self.backend),
            activity_executor,
            self.options.clone(),
            self.shutdown_rx.clone(),
        );

        let mut handles = self.handles.lock().unwrap();
        handles.extend(workflow_handles);
        handles.extend(activity_handles);
        Ok(())
    }

    /// Stop polling and wait for loops to exit.
    ///
    /// Tears down pollers only; in-flight durable state is never touched.
    /// Uncommitted tasks are simply redelivered after their leases expire.
    #[instrument(skip(self))]
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);

        let handles: Vec<JoinHandle<()>> = {
            let mut guard = self.handles.lock().unwrap();
            guard.drain(..).collect()
        };
        for handle in handles {
            let _ = handle.await;
        }

        info!("worker stopped");
    }
}
