//! Workflow executor with deterministic replay
//!
//! The executor runs once per workflow task. It re-executes the workflow
//! function from the top on a cooperative scheduler, short-circuiting every
//! future with values drawn from history (phase 1), then applies the task's
//! new events (phase 2) and collects the commands the workflow emitted
//! beyond what history already records.
//!
//! During replay, schedule events in history must line up exactly with the
//! commands the workflow re-emits; any divergence fails the task with a
//! non-determinism error before a single event is committed.

use std::rc::Rc;
use std::sync::Arc;

use tracing::{debug, instrument, warn};

use crate::backend::WorkflowTask;
use crate::command::{Command, CommandAttributes};
use crate::history::{Event, EventAttributes, EventType};
use crate::payload::{encode, ConversionError, Converter, Payload};
use crate::registry::{Registry, RegistryError};
use crate::scheduler::{Scheduler, WakeSignal};
use crate::workflow::futures::CancelScope;
use crate::workflow::state::{SharedState, WorkflowState};
use crate::workflow::{WorkflowContext, WorkflowError};

/// Configuration for the workflow executor
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Upper bound on history size per instance (for safety)
    pub max_history_events: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_history_events: 10_000,
        }
    }
}

/// Errors from executor operations
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    /// Replay diverged from recorded history. Fatal for the current task;
    /// nothing is committed and the instance stays runnable.
    #[error("non-deterministic workflow execution: {0}")]
    NonDeterminism(String),

    /// Workflow name not registered
    #[error("registry error: {0}")]
    Registry(#[from] RegistryError),

    /// History violates a structural invariant
    #[error("invalid history: {0}")]
    History(String),

    /// Instance exceeded the configured history bound
    #[error("workflow has too many events ({count} > {max})")]
    TooManyEvents { count: usize, max: usize },

    /// Payload conversion failed
    #[error("conversion error: {0}")]
    Conversion(#[from] ConversionError),
}

/// Outcome of one workflow task execution.
#[derive(Debug)]
pub struct ExecutionResult {
    /// Commands emitted beyond recorded history, in emission order; the
    /// worker translates these into fresh events and messages
    pub commands: Vec<Command>,

    /// The new events that were applied this slice, to be appended to
    /// history on completion
    pub executed_events: Vec<Event>,

    /// Whether the workflow reached a terminal state in this slice
    pub completed: bool,
}

/// Drives workflow functions against their histories.
///
/// # Example
///
/// ```ignore
/// let executor = WorkflowExecutor::new(registry, converter);
/// let result = executor.execute_task(&task)?;
/// // translate result.commands into events, commit via the backend
/// ```
pub struct WorkflowExecutor {
    registry: Arc<Registry>,
    converter: Arc<dyn Converter>,
    config: ExecutorConfig,
}

impl WorkflowExecutor {
    /// Create an executor with default configuration
    pub fn new(registry: Arc<Registry>, converter: Arc<dyn Converter>) -> Self {
        Self {
            registry,
            converter,
            config: ExecutorConfig::default(),
        }
    }

    /// Create an executor with custom configuration
    pub fn with_config(
        registry: Arc<Registry>,
        converter: Arc<dyn Converter>,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            registry,
            converter,
            config,
        }
    }

    /// Execute one workflow task: replay prior history, apply new events,
    /// collect newly emitted commands.
    ///
    /// Synchronous by design: everything inside runs on the single-threaded
    /// cooperative scheduler and never touches real I/O.
    #[instrument(skip_all, fields(instance = %task.instance.instance_id))]
    pub fn execute_task(&self, task: &WorkflowTask) -> Result<ExecutionResult, ExecutorError> {
        let event_count = task.history.len() + task.new_events.len();
        if event_count > self.config.max_history_events {
            return Err(ExecutorError::TooManyEvents {
                count: event_count,
                max: self.config.max_history_events,
            });
        }

        let first = task.history.first().or_else(|| task.new_events.first());
        match first {
            Some(event) if event.event_type() == EventType::WorkflowExecutionStarted => {}
            Some(event) => {
                return Err(ExecutorError::History(format!(
                    "first event must be workflow_execution_started, found {}",
                    event.event_type()
                )))
            }
            None => {
                return Err(ExecutorError::History("task contains no events".to_string()))
            }
        }

        let signal = WakeSignal::default();
        let state = WorkflowState::new(
            task.instance.clone(),
            Arc::clone(&self.converter),
            signal.clone(),
        );

        // Side-effect values resolve at their call sites during replay, so
        // they are indexed up front rather than delivered in order.
        for event in &task.history {
            if let EventAttributes::SideEffectResult { value } = &event.attributes {
                if let Some(id) = event.schedule_event_id {
                    state.borrow_mut().record_side_effect_result(id, value.clone());
                }
            }
        }

        let mut execution = ActiveExecution {
            executor: self,
            state: Rc::clone(&state),
            scheduler: Scheduler::new(signal.clone()),
            root_scope: CancelScope::new_root(signal),
            root_started: false,
        };

        // Phase 1: replay. Commands re-emitted by the workflow must match
        // the schedule events already in history.
        state.borrow_mut().set_replaying(true);
        for event in &task.history {
            execution.apply(event)?;
        }

        // Phase 2: new events. Commands emitted from here on stay pending
        // and are translated into fresh schedule events by the worker.
        state.borrow_mut().set_replaying(false);
        for event in &task.new_events {
            execution.apply(event)?;
        }

        execution.scheduler.run_until_blocked();

        let state = state.borrow();
        let commands = state.pending_commands();
        let completed = state
            .commands()
            .iter()
            .any(|c| matches!(c.attributes, CommandAttributes::CompleteWorkflow { .. }));

        debug!(
            commands = commands.len(),
            completed, "workflow task executed"
        );

        Ok(ExecutionResult {
            commands,
            executed_events: task.new_events.clone(),
            completed,
        })
    }
}

/// Mutable machinery of one in-flight task execution.
struct ActiveExecution<'a> {
    executor: &'a WorkflowExecutor,
    state: SharedState,
    scheduler: Scheduler,
    root_scope: CancelScope,
    root_started: bool,
}

impl ActiveExecution<'_> {
    /// Deliver one event into the workflow and drain the scheduler.
    fn apply(&mut self, event: &Event) -> Result<(), ExecutorError> {
        self.state.borrow_mut().set_now(event.timestamp);

        match &event.attributes {
            EventAttributes::WorkflowExecutionStarted {
                name,
                version,
                input,
            } => self.start_root(event, name, version.as_deref(), input)?,

            EventAttributes::ActivityCompleted { result } => {
                self.resolve(event, Ok(result.clone()))?;
            }

            EventAttributes::ActivityFailed { error } => {
                self.resolve(event, Err(error.clone().into()))?;
            }

            EventAttributes::TimerFired { .. } => {
                let unit = encode(&*self.executor.converter, &())?;
                self.resolve(event, Ok(unit))?;
            }

            EventAttributes::SubWorkflowCompleted { result } => {
                self.resolve(event, Ok(result.clone()))?;
            }

            EventAttributes::SubWorkflowFailed { error } => {
                self.resolve(event, Err(error.clone()))?;
            }

            EventAttributes::SignalReceived { name, payload } => {
                self.state.borrow_mut().deliver_signal(name, payload.clone());
            }

            EventAttributes::WorkflowExecutionCanceled {} => {
                self.root_scope.cancel();
            }

            // In the parent's own history this is a schedule event; as an
            // inbound message (no schedule_event_id) it drives the child's
            // context cancellation.
            EventAttributes::SubWorkflowCancellationRequested {} => {
                if event.schedule_event_id.is_some() {
                    self.match_schedule_event(event)?;
                } else {
                    self.root_scope.cancel();
                }
            }

            EventAttributes::WorkflowExecutionTerminated { .. } => {
                debug!("terminated event delivered; instance is already dead");
            }

            EventAttributes::ActivityScheduled { .. }
            | EventAttributes::TimerScheduled { .. }
            | EventAttributes::TimerCanceled {}
            | EventAttributes::SubWorkflowScheduled { .. }
            | EventAttributes::SideEffectResult { .. }
            | EventAttributes::WorkflowExecutionFinished { .. } => {
                if self.state.borrow().replaying() {
                    self.match_schedule_event(event)?;
                } else {
                    return Err(ExecutorError::History(format!(
                        "schedule event {} delivered outside history",
                        event.event_type()
                    )));
                }
            }
        }

        self.scheduler.run_until_blocked();
        Ok(())
    }

    fn start_root(
        &mut self,
        event: &Event,
        name: &str,
        version: Option<&str>,
        input: &Payload,
    ) -> Result<(), ExecutorError> {
        if self.root_started {
            return Err(ExecutorError::History(format!(
                "duplicate workflow_execution_started at sequence {}",
                event.sequence_id
            )));
        }
        self.root_started = true;

        let invoker = self.executor.registry.workflow(name, version)?;
        let ctx = WorkflowContext::new(
            Rc::clone(&self.state),
            self.scheduler.spawner(),
            self.root_scope.clone(),
        );
        let future = invoker(ctx, input.clone());

        // The root coroutine ends the execution by emitting CompleteWorkflow;
        // the command ID it draws is deterministic because every coroutine
        // scheduled before it has run to quiescence by then.
        let state = Rc::clone(&self.state);
        self.scheduler.spawner().spawn(async move {
            let result = future.await;
            let mut state = state.borrow_mut();
            let id = state.take_command_id();
            let attributes = match result {
                Ok(payload) => CommandAttributes::CompleteWorkflow {
                    result: Some(payload),
                    error: None,
                },
                Err(error) => CommandAttributes::CompleteWorkflow {
                    result: None,
                    error: Some(error),
                },
            };
            state.push_command(Command::new(id, attributes));
        });

        Ok(())
    }

    /// Resolve the in-flight future a result event correlates to.
    fn resolve(
        &mut self,
        event: &Event,
        result: Result<Payload, WorkflowError>,
    ) -> Result<(), ExecutorError> {
        let schedule_event_id = event.schedule_event_id.ok_or_else(|| {
            ExecutorError::History(format!(
                "result event {} has no schedule_event_id",
                event.event_type()
            ))
        })?;

        if !self
            .state
            .borrow_mut()
            .resolve_future(schedule_event_id, result)
        {
            // Results for canceled or abandoned operations can arrive late;
            // they are not an error.
            warn!(
                schedule_event_id,
                event_type = %event.event_type(),
                "no pending future for result event"
            );
        }
        Ok(())
    }

    fn match_schedule_event(&mut self, event: &Event) -> Result<(), ExecutorError> {
        self.state
            .borrow_mut()
            .match_schedule_event(event)
            .map_err(ExecutorError::NonDeterminism)
    }
}
