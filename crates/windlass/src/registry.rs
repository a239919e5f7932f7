//! Workflow and activity registry
//!
//! Write-once maps from registered names to boxed invocation wrappers. The
//! wrappers erase the concrete input/output types: they decode the payload,
//! call the typed function, and encode the result. Registration happens
//! before workers start; afterwards the registry is read-only and shared via
//! `Arc` without locking.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use futures::future::{BoxFuture, LocalBoxFuture};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::activity::{ActivityContext, ActivityError};
use crate::payload::{decode, encode, Converter, Payload};
use crate::workflow::{WorkflowContext, WorkflowError};

/// Type-erased workflow invoker.
///
/// The returned future is not `Send`: it runs inside the single-threaded
/// cooperative scheduler of one task execution.
pub type WorkflowFunction = Box<
    dyn Fn(WorkflowContext, Payload) -> LocalBoxFuture<'static, Result<Payload, WorkflowError>>
        + Send
        + Sync,
>;

/// Type-erased activity invoker; runs on the worker's async runtime.
pub type ActivityFunction = Box<
    dyn Fn(
            ActivityContext,
            Arc<dyn Converter>,
            Payload,
        ) -> BoxFuture<'static, Result<Payload, ActivityError>>
        + Send
        + Sync,
>;

/// Errors from registry operations
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// Workflow name not registered
    #[error("unknown workflow: {0}")]
    UnknownWorkflow(String),

    /// Activity name not registered
    #[error("unknown activity: {0}")]
    UnknownActivity(String),
}

/// Registry of workflow and activity functions.
///
/// # Example
///
/// ```ignore
/// let mut registry = Registry::new();
/// registry.add_workflow("transfer", transfer_workflow);
/// registry.add_activity("debit", debit_activity);
/// let registry = Arc::new(registry);
/// ```
#[derive(Default)]
pub struct Registry {
    workflows: HashMap<String, WorkflowFunction>,
    activities: HashMap<String, ActivityFunction>,
}

fn registration_key(name: &str, version: Option<&str>) -> String {
    match version {
        Some(version) => format!("{name}@{version}"),
        None => name.to_string(),
    }
}

impl Registry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a workflow function under a name
    pub fn add_workflow<I, O, F, Fut>(&mut self, name: &str, f: F)
    where
        I: DeserializeOwned + 'static,
        O: Serialize + 'static,
        F: Fn(WorkflowContext, I) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<O, WorkflowError>> + 'static,
    {
        self.add_workflow_version(name, None, f)
    }

    /// Register a workflow function under a name and explicit version
    pub fn add_workflow_version<I, O, F, Fut>(&mut self, name: &str, version: Option<&str>, f: F)
    where
        I: DeserializeOwned + 'static,
        O: Serialize + 'static,
        F: Fn(WorkflowContext, I) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<O, WorkflowError>> + 'static,
    {
        let f = Arc::new(f);
        let invoker: WorkflowFunction = Box::new(move |ctx: WorkflowContext, input: Payload| {
            let f = Arc::clone(&f);
            Box::pin(async move {
                let input: I = ctx.decode_payload(&input)?;
                let output = f(ctx.clone(), input).await?;
                ctx.encode_payload(&output)
            })
        });
        self.workflows
            .insert(registration_key(name, version), invoker);
    }

    /// Register an activity function under a name
    pub fn add_activity<I, O, F, Fut>(&mut self, name: &str, f: F)
    where
        I: DeserializeOwned + Send + 'static,
        O: Serialize + 'static,
        F: Fn(ActivityContext, I) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<O, ActivityError>> + Send + 'static,
    {
        self.add_activity_version(name, None, f)
    }

    /// Register an activity function under a name and explicit version
    pub fn add_activity_version<I, O, F, Fut>(&mut self, name: &str, version: Option<&str>, f: F)
    where
        I: DeserializeOwned + Send + 'static,
        O: Serialize + 'static,
        F: Fn(ActivityContext, I) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<O, ActivityError>> + Send + 'static,
    {
        let f = Arc::new(f);
        let invoker: ActivityFunction = Box::new(
            move |ctx: ActivityContext, converter: Arc<dyn Converter>, input: Payload| {
                let f = Arc::clone(&f);
                Box::pin(async move {
                    let input: I = decode(&*converter, &input)
                        .map_err(|e| ActivityError::non_retryable(e.to_string()))?;
                    let output = f(ctx, input).await?;
                    encode(&*converter, &output)
                        .map_err(|e| ActivityError::non_retryable(e.to_string()))
                })
            },
        );
        self.activities
            .insert(registration_key(name, version), invoker);
    }

    /// Look up a workflow invoker
    pub fn workflow(
        &self,
        name: &str,
        version: Option<&str>,
    ) -> Result<&WorkflowFunction, RegistryError> {
        self.workflows
            .get(&registration_key(name, version))
            .ok_or_else(|| RegistryError::UnknownWorkflow(registration_key(name, version)))
    }

    /// Look up an activity invoker
    pub fn activity(
        &self,
        name: &str,
        version: Option<&str>,
    ) -> Result<&ActivityFunction, RegistryError> {
        self.activities
            .get(&registration_key(name, version))
            .ok_or_else(|| RegistryError::UnknownActivity(registration_key(name, version)))
    }

    /// Registered workflow names
    pub fn workflow_names(&self) -> impl Iterator<Item = &str> {
        self.workflows.keys().map(|s| s.as_str())
    }

    /// Registered activity names
    pub fn activity_names(&self) -> impl Iterator<Item = &str> {
        self.activities.keys().map(|s| s.as_str())
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("workflows", &self.workflows.keys().collect::<Vec<_>>())
            .field("activities", &self.activities.keys().collect::<Vec<_>>())
            .finish()
    }
}
