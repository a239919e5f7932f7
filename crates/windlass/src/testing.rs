//! Single-threaded test harness
//!
//! Drives workflows to completion against the in-memory backend and a
//! [`MockClock`], without workers or real time. Activities run inline,
//! either through the registry or through per-name expectation mocks; the
//! clock auto-advances to the next visibility barrier or scheduled callback
//! whenever the instance is idle.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use crate::activity::{ActivityError, ActivityExecutor};
use crate::backend::{Backend, BackendError, InMemoryBackend};
use crate::clock::{Clock, MockClock};
use crate::executor::{ExecutorError, WorkflowExecutor};
use crate::history::{Event, EventAttributes};
use crate::instance::WorkflowInstance;
use crate::payload::{decode, encode, ConversionError, Converter, JsonConverter, Payload};
use crate::registry::Registry;
use crate::worker::workflow_worker::translate_commands;
use crate::workflow::WorkflowError;

/// Instance ID used for the workflow under test
pub const TEST_INSTANCE_ID: &str = "test-workflow";

/// Errors from harness runs
#[derive(Debug, thiserror::Error)]
pub enum TestError {
    /// Backend error
    #[error("backend error: {0}")]
    Backend(#[from] BackendError),

    /// Executor error (including non-determinism)
    #[error("executor error: {0}")]
    Executor(#[from] ExecutorError),

    /// Payload conversion failed
    #[error("conversion error: {0}")]
    Conversion(#[from] ConversionError),

    /// The workflow finished with an error
    #[error("workflow failed: {0}")]
    WorkflowFailed(WorkflowError),

    /// The workflow finished without recording a result
    #[error("workflow finished without a result")]
    MissingResult,

    /// Nothing can unblock the workflow: no runnable task, no pending
    /// timer, no scheduled callback
    #[error("workflow is blocked: {0}")]
    Blocked(String),
}

type MockActivityFn = Box<dyn FnMut(Payload) -> Result<Payload, ActivityError> + Send>;

enum CallbackAction {
    Signal {
        instance_id: String,
        name: String,
        payload: Payload,
    },
    Cancel {
        instance_id: String,
    },
}

struct TimedCallback {
    at: DateTime<Utc>,
    action: CallbackAction,
}

/// Harness for executing workflows under a mock clock.
///
/// # Example
///
/// ```ignore
/// let mut test = WorkflowTest::new();
/// test.register_workflow("order", order_workflow);
/// test.mock_activity("charge", |amount: u64| Ok(Receipt { amount }));
/// let result: OrderResult = test.execute_workflow("order", &input).await?;
/// ```
pub struct WorkflowTest {
    registry: Registry,
    shared_registry: Option<Arc<Registry>>,
    clock: Arc<MockClock>,
    backend: Arc<InMemoryBackend>,
    converter: Arc<dyn Converter>,
    start_time: DateTime<Utc>,
    callbacks: Vec<TimedCallback>,
    mocks: HashMap<String, MockActivityFn>,
}

impl Default for WorkflowTest {
    fn default() -> Self {
        Self::new()
    }
}

impl WorkflowTest {
    /// Create a harness with the clock frozen at the current wall time
    pub fn new() -> Self {
        let start_time = Utc::now();
        let clock = Arc::new(MockClock::new(start_time));
        let backend = Arc::new(InMemoryBackend::with_clock(clock.clone()));
        Self {
            registry: Registry::new(),
            shared_registry: None,
            clock,
            backend,
            converter: Arc::new(JsonConverter),
            start_time,
            callbacks: Vec::new(),
            mocks: HashMap::new(),
        }
    }

    /// The instant the mock clock started at
    pub fn start_time(&self) -> DateTime<Utc> {
        self.start_time
    }

    /// The mock clock's current instant
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// The mock clock, for manual control
    pub fn clock(&self) -> Arc<MockClock> {
        Arc::clone(&self.clock)
    }

    /// The backing in-memory backend, for assertions
    pub fn backend(&self) -> Arc<InMemoryBackend> {
        Arc::clone(&self.backend)
    }

    /// Register a workflow function. Call before executing.
    pub fn register_workflow<I, O, F, Fut>(&mut self, name: &str, f: F)
    where
        I: DeserializeOwned + 'static,
        O: Serialize + 'static,
        F: Fn(crate::workflow::WorkflowContext, I) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<O, WorkflowError>> + 'static,
    {
        self.registry.add_workflow(name, f);
    }

    /// Register a real activity function. Call before executing.
    pub fn register_activity<I, O, F, Fut>(&mut self, name: &str, f: F)
    where
        I: DeserializeOwned + Send + 'static,
        O: Serialize + 'static,
        F: Fn(crate::activity::ActivityContext, I) -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<O, ActivityError>> + Send + 'static,
    {
        self.registry.add_activity(name, f);
    }

    /// Mock an activity by name. The closure runs inline whenever the
    /// workflow schedules the activity; mocks take precedence over
    /// registered functions.
    pub fn mock_activity<I, O, F>(&mut self, name: &str, mut f: F)
    where
        I: DeserializeOwned,
        O: Serialize,
        F: FnMut(I) -> Result<O, ActivityError> + Send + 'static,
    {
        let converter = Arc::clone(&self.converter);
        self.mocks.insert(
            name.to_string(),
            Box::new(move |input: Payload| {
                let input: I = decode(&*converter, &input)
                    .map_err(|e| ActivityError::non_retryable(e.to_string()))?;
                let output = f(input)?;
                encode(&*converter, &output)
                    .map_err(|e| ActivityError::non_retryable(e.to_string()))
            }),
        );
    }

    /// Schedule a signal to the workflow under test at `start + delay`
    pub fn signal_after<T: Serialize>(
        &mut self,
        delay: Duration,
        name: &str,
        value: &T,
    ) -> Result<(), TestError> {
        self.signal_instance_after(delay, TEST_INSTANCE_ID, name, value)
    }

    /// Schedule a signal to a specific instance at `start + delay`
    pub fn signal_instance_after<T: Serialize>(
        &mut self,
        delay: Duration,
        instance_id: &str,
        name: &str,
        value: &T,
    ) -> Result<(), TestError> {
        let payload = encode(&*self.converter, value)?;
        self.callbacks.push(TimedCallback {
            at: self.clock.now()
                + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero()),
            action: CallbackAction::Signal {
                instance_id: instance_id.to_string(),
                name: name.to_string(),
                payload,
            },
        });
        Ok(())
    }

    /// Schedule a cancellation request for the workflow under test at
    /// `start + delay`
    pub fn cancel_after(&mut self, delay: Duration) {
        self.callbacks.push(TimedCallback {
            at: self.clock.now()
                + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero()),
            action: CallbackAction::Cancel {
                instance_id: TEST_INSTANCE_ID.to_string(),
            },
        });
    }

    /// Execute a workflow to completion and decode its result.
    ///
    /// Runs workflow tasks and activities inline, firing scheduled
    /// callbacks and advancing the mock clock whenever everything is idle.
    pub async fn execute_workflow<I, R>(&mut self, name: &str, input: &I) -> Result<R, TestError>
    where
        I: Serialize,
        R: DeserializeOwned,
    {
        let registry = self.shared_registry();
        let workflow_executor =
            WorkflowExecutor::new(Arc::clone(&registry), Arc::clone(&self.converter));
        let activity_executor =
            ActivityExecutor::new(registry, Arc::clone(&self.converter), self.clock.clone());

        let instance = WorkflowInstance::new(TEST_INSTANCE_ID);
        let start_event = Event::new(
            self.clock.now(),
            EventAttributes::WorkflowExecutionStarted {
                name: name.to_string(),
                version: None,
                input: encode(&*self.converter, input)?,
            },
        );
        self.backend
            .create_workflow_instance(instance.clone(), start_event)
            .await?;

        loop {
            if self.fire_due_callbacks().await? {
                continue;
            }

            if let Some(task) = self.backend.get_workflow_task(Duration::ZERO).await? {
                let execution = workflow_executor.execute_task(&task)?;
                let translation = translate_commands(
                    &task.instance,
                    &execution.commands,
                    self.clock.now(),
                );
                let mut executed_events = execution.executed_events;
                executed_events.extend(translation.executed_events);

                self.backend
                    .complete_workflow_task(
                        &task,
                        executed_events,
                        translation.activity_events,
                        translation.timer_events,
                        translation.messages,
                    )
                    .await?;
                continue;
            }

            if let Some(task) = self.backend.get_activity_task(Duration::ZERO).await? {
                let result_event = self.run_activity(&activity_executor, &task).await;
                self.backend
                    .complete_activity_task(&task, result_event)
                    .await?;
                continue;
            }

            let state = self
                .backend
                .get_workflow_instance_state(TEST_INSTANCE_ID)
                .await?;
            if state.status.is_terminal() {
                if let Some(error) = state.error {
                    return Err(TestError::WorkflowFailed(error));
                }
                let payload = state.result.ok_or(TestError::MissingResult)?;
                return Ok(decode(&*self.converter, &payload)?);
            }

            self.advance_to_next_wakeup()?;
        }
    }

    /// Committed history of an instance
    pub async fn history(&self, instance_id: &str) -> Result<Vec<Event>, TestError> {
        Ok(self.backend.get_workflow_history(instance_id).await?)
    }

    fn shared_registry(&mut self) -> Arc<Registry> {
        if let Some(shared) = &self.shared_registry {
            return Arc::clone(shared);
        }
        let shared = Arc::new(std::mem::take(&mut self.registry));
        self.shared_registry = Some(Arc::clone(&shared));
        shared
    }

    async fn fire_due_callbacks(&mut self) -> Result<bool, TestError> {
        let now = self.clock.now();
        let mut fired = false;

        let mut index = 0;
        while index < self.callbacks.len() {
            if self.callbacks[index].at > now {
                index += 1;
                continue;
            }
            let callback = self.callbacks.remove(index);
            fired = true;

            match callback.action {
                CallbackAction::Signal {
                    instance_id,
                    name,
                    payload,
                } => {
                    let event = Event::new(
                        now,
                        EventAttributes::SignalReceived { name, payload },
                    );
                    match self.backend.signal_workflow_instance(&instance_id, event).await {
                        Ok(()) => {}
                        Err(BackendError::InstanceTerminal(_))
                        | Err(BackendError::InstanceNotFound(_)) => {
                            debug!(%instance_id, "callback signal dropped");
                        }
                        Err(err) => return Err(err.into()),
                    }
                }
                CallbackAction::Cancel { instance_id } => {
                    let event = Event::new(now, EventAttributes::WorkflowExecutionCanceled {});
                    match self.backend.signal_workflow_instance(&instance_id, event).await {
                        Ok(()) => {}
                        Err(BackendError::InstanceTerminal(_))
                        | Err(BackendError::InstanceNotFound(_)) => {
                            debug!(%instance_id, "callback cancellation dropped");
                        }
                        Err(err) => return Err(err.into()),
                    }
                }
            }
        }

        Ok(fired)
    }

    async fn run_activity(
        &mut self,
        activity_executor: &ActivityExecutor,
        task: &crate::backend::ActivityTask,
    ) -> Event {
        let name = match &task.schedule_event.attributes {
            EventAttributes::ActivityScheduled { name, .. } => name.clone(),
            _ => String::new(),
        };

        if let Some(mock) = self.mocks.get_mut(&name) {
            let input = match &task.schedule_event.attributes {
                EventAttributes::ActivityScheduled { input, .. } => input.clone(),
                _ => Payload::new(Vec::new()),
            };
            let attributes = match mock(input) {
                Ok(result) => EventAttributes::ActivityCompleted { result },
                Err(error) => EventAttributes::ActivityFailed { error },
            };
            return Event::new(self.clock.now(), attributes)
                .with_schedule_event_id(task.schedule_event.schedule_event_id.unwrap_or_default());
        }

        activity_executor.execute(task, None).await
    }

    /// Advance the mock clock to the earliest instant at which anything can
    /// happen: a pending event's visibility barrier or a scheduled callback.
    fn advance_to_next_wakeup(&mut self) -> Result<(), TestError> {
        let next_event = self.backend.next_visible_at();
        let next_callback = self.callbacks.iter().map(|c| c.at).min();

        let wakeup = match (next_event, next_callback) {
            (Some(a), Some(b)) => a.min(b),
            (Some(a), None) => a,
            (None, Some(b)) => b,
            (None, None) => {
                return Err(TestError::Blocked(
                    "no runnable task, pending timer, or scheduled callback".to_string(),
                ))
            }
        };

        debug!(%wakeup, "advancing mock clock");
        self.clock.set(wakeup);
        Ok(())
    }
}
