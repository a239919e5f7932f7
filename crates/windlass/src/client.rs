//! Client surface over the backend
//!
//! Thin wrapper for starting instances, signaling them, and awaiting their
//! results. Clients never talk to workers; everything goes through the
//! backend contract.

use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{info, instrument};

use crate::backend::{Backend, BackendError, InstanceStatus};
use crate::history::{Event, EventAttributes};
use crate::instance::WorkflowInstance;
use crate::payload::{decode, encode, ConversionError, Converter, JsonConverter};
use crate::workflow::WorkflowError;

/// How often result polling re-reads the instance state
const RESULT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Errors from client operations
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// Backend error
    #[error("backend error: {0}")]
    Backend(#[from] BackendError),

    /// Payload conversion failed
    #[error("conversion error: {0}")]
    Conversion(#[from] ConversionError),

    /// The workflow finished with an error
    #[error("workflow failed: {0}")]
    WorkflowFailed(WorkflowError),

    /// The workflow did not finish within the wait timeout
    #[error("timed out waiting for workflow {0}")]
    Timeout(String),

    /// The workflow finished without recording a result
    #[error("workflow {0} finished without a result")]
    MissingResult(String),
}

/// Options for creating a workflow instance.
#[derive(Debug, Clone)]
pub struct WorkflowInstanceOptions {
    /// Caller-chosen instance ID
    pub instance_id: String,

    /// Registered workflow name
    pub name: String,

    /// Optional workflow version
    pub version: Option<String>,
}

impl WorkflowInstanceOptions {
    /// Create options for a named workflow
    pub fn new(instance_id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            instance_id: instance_id.into(),
            name: name.into(),
            version: None,
        }
    }

    /// Set the workflow version
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }
}

/// Client for creating, signaling, and observing workflow instances.
///
/// # Example
///
/// ```ignore
/// let client = Client::new(backend);
/// let instance = client
///     .create_workflow_instance(WorkflowInstanceOptions::new("order-1", "order"), &input)
///     .await?;
/// let result: OrderResult = client
///     .get_workflow_result(&instance.instance_id, Duration::from_secs(30))
///     .await?;
/// ```
pub struct Client {
    backend: Arc<dyn Backend>,
    converter: Arc<dyn Converter>,
}

impl Client {
    /// Create a client with the default JSON converter
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self {
            backend,
            converter: Arc::new(JsonConverter),
        }
    }

    /// Replace the payload converter
    pub fn with_converter(mut self, converter: Arc<dyn Converter>) -> Self {
        self.converter = converter;
        self
    }

    /// Create and start a new workflow instance
    #[instrument(skip(self, input), fields(instance_id = %options.instance_id, workflow = %options.name))]
    pub async fn create_workflow_instance<I: Serialize>(
        &self,
        options: WorkflowInstanceOptions,
        input: &I,
    ) -> Result<WorkflowInstance, ClientError> {
        let instance = WorkflowInstance::new(options.instance_id);
        let start_event = Event::new(
            self.backend.clock().now(),
            EventAttributes::WorkflowExecutionStarted {
                name: options.name,
                version: options.version,
                input: encode(&*self.converter, input)?,
            },
        );

        self.backend
            .create_workflow_instance(instance.clone(), start_event)
            .await?;
        info!("workflow instance created");
        Ok(instance)
    }

    /// Deliver a signal to a running instance
    #[instrument(skip(self, payload))]
    pub async fn signal_workflow<T: Serialize>(
        &self,
        instance_id: &str,
        name: &str,
        payload: &T,
    ) -> Result<(), ClientError> {
        let event = Event::new(
            self.backend.clock().now(),
            EventAttributes::SignalReceived {
                name: name.to_string(),
                payload: encode(&*self.converter, payload)?,
            },
        );
        self.backend
            .signal_workflow_instance(instance_id, event)
            .await?;
        Ok(())
    }

    /// Request cooperative cancellation of a running instance
    #[instrument(skip(self))]
    pub async fn cancel_workflow_instance(&self, instance_id: &str) -> Result<(), ClientError> {
        let event = Event::new(
            self.backend.clock().now(),
            EventAttributes::WorkflowExecutionCanceled {},
        );
        self.backend
            .signal_workflow_instance(instance_id, event)
            .await?;
        Ok(())
    }

    /// Force-kill an instance without running any workflow code
    #[instrument(skip(self))]
    pub async fn terminate_workflow_instance(
        &self,
        instance_id: &str,
        reason: &str,
    ) -> Result<(), ClientError> {
        self.backend
            .terminate_workflow_instance(instance_id, reason)
            .await?;
        Ok(())
    }

    /// Wait for an instance to finish and decode its result.
    ///
    /// Polls the backend read model; a workflow error surfaces as
    /// [`ClientError::WorkflowFailed`].
    pub async fn get_workflow_result<R: DeserializeOwned>(
        &self,
        instance_id: &str,
        timeout: Duration,
    ) -> Result<R, ClientError> {
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            let state = self.backend.get_workflow_instance_state(instance_id).await?;
            match state.status {
                InstanceStatus::Running => {}
                InstanceStatus::Finished | InstanceStatus::Terminated => {
                    if let Some(error) = state.error {
                        return Err(ClientError::WorkflowFailed(error));
                    }
                    let payload = state
                        .result
                        .ok_or_else(|| ClientError::MissingResult(instance_id.to_string()))?;
                    return Ok(decode(&*self.converter, &payload)?);
                }
            }

            if tokio::time::Instant::now() >= deadline {
                return Err(ClientError::Timeout(instance_id.to_string()));
            }
            tokio::time::sleep(RESULT_POLL_INTERVAL).await;
        }
    }
}
