//! Workflow execution context
//!
//! The context is the only handle workflow code has on the outside world.
//! Every operation routes through commands and durable history; nothing here
//! touches real time, real randomness, or real I/O.

use std::future::Future;
use std::rc::Rc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::command::{Command, CommandAttributes, CommandState};
use crate::history::option_duration_millis;
use crate::payload::{decode, encode, Payload};
use crate::retry::RetryPolicy;
use crate::scheduler::{Spawner, Yield};
use crate::workflow::channel::{Channel, SignalChannel};
use crate::workflow::futures::{CancelScope, WorkflowFuture};
use crate::workflow::state::SharedState;
use crate::workflow::WorkflowError;

/// Options for scheduling an activity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityOptions {
    /// Retry policy; the default never retries
    pub retry: RetryPolicy,

    /// Maximum execution time enforced by the activity worker
    #[serde(default, with = "option_duration_millis")]
    pub start_to_close_timeout: Option<Duration>,

    /// Activity version to dispatch to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

impl Default for ActivityOptions {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::no_retry(),
            start_to_close_timeout: None,
            version: None,
        }
    }
}

impl ActivityOptions {
    /// Set the retry policy
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Set the start-to-close timeout
    pub fn with_start_to_close_timeout(mut self, timeout: Duration) -> Self {
        self.start_to_close_timeout = Some(timeout);
        self
    }

    /// Set the activity version
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }
}

/// Options for scheduling a sub-workflow.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SubWorkflowOptions {
    /// Workflow version to dispatch to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

impl SubWorkflowOptions {
    /// Set the workflow version
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }
}

/// Handle through which a workflow function interacts with the engine.
///
/// Cloning is cheap; clones share the same underlying task state. A clone
/// created through [`with_cancel`](Self::with_cancel) carries its own cancel
/// scope.
#[derive(Clone)]
pub struct WorkflowContext {
    state: SharedState,
    spawner: Spawner,
    scope: CancelScope,
}

impl WorkflowContext {
    pub(crate) fn new(state: SharedState, spawner: Spawner, scope: CancelScope) -> Self {
        Self {
            state,
            spawner,
            scope,
        }
    }

    /// The instance this execution belongs to
    pub fn instance(&self) -> crate::instance::WorkflowInstance {
        self.state.borrow().instance().clone()
    }

    /// The instance's logical clock: the timestamp of the most recently
    /// delivered event. Never read a host clock from workflow code.
    pub fn now(&self) -> DateTime<Utc> {
        self.state.borrow().now()
    }

    /// Whether the executor is currently replaying prior history.
    ///
    /// Useful to suppress non-durable observations (e.g. log lines) that
    /// would otherwise repeat on every replay.
    pub fn is_replaying(&self) -> bool {
        self.state.borrow().replaying()
    }

    /// Whether cancellation has been requested for this context
    pub fn is_canceled(&self) -> bool {
        self.scope.is_canceled()
    }

    /// Schedule an activity with default options
    pub fn schedule_activity<I, R>(&self, name: &str, input: &I) -> WorkflowFuture<R>
    where
        I: Serialize,
        R: DeserializeOwned + 'static,
    {
        self.schedule_activity_with_options(ActivityOptions::default(), name, input)
    }

    /// Schedule an activity.
    ///
    /// When the options carry a retry policy, a failed attempt schedules a
    /// backoff timer and re-issues the activity; every attempt and every
    /// backoff timer is captured in history.
    pub fn schedule_activity_with_options<I, R>(
        &self,
        options: ActivityOptions,
        name: &str,
        input: &I,
    ) -> WorkflowFuture<R>
    where
        I: Serialize,
        R: DeserializeOwned + 'static,
    {
        let input = match self.encode_payload(input) {
            Ok(payload) => payload,
            Err(err) => return WorkflowFuture::ready_err(err),
        };

        if options.retry.max_attempts <= 1 {
            return self.schedule_activity_attempt(name, &options, input, 1);
        }

        let ctx = self.clone();
        let name = name.to_string();
        WorkflowFuture::from_future(Box::pin(async move {
            let mut attempt = 1;
            loop {
                let future: WorkflowFuture<R> =
                    ctx.schedule_activity_attempt(&name, &options, input.clone(), attempt);
                match future.await {
                    Ok(value) => return Ok(value),
                    Err(err) => {
                        if !err.retryable || !options.retry.has_attempts_remaining(attempt) {
                            return Err(err);
                        }
                        let delay = options.retry.delay_for_attempt(attempt + 1);
                        if !delay.is_zero() {
                            ctx.schedule_timer(delay).await?;
                        }
                        attempt += 1;
                    }
                }
            }
        }))
    }

    fn schedule_activity_attempt<R>(
        &self,
        name: &str,
        options: &ActivityOptions,
        input: Payload,
        attempt: u32,
    ) -> WorkflowFuture<R> {
        let mut state = self.state.borrow_mut();
        let id = state.take_command_id();
        state.push_command(Command::new(
            id,
            CommandAttributes::ScheduleActivity {
                name: name.to_string(),
                version: options.version.clone(),
                input,
                attempt,
                start_to_close_timeout: options.start_to_close_timeout,
            },
        ));
        let cell = state.register_future(id);
        let converter = state.converter();
        drop(state);

        WorkflowFuture::from_cell(cell, id, converter, self.scope.clone())
    }

    /// Schedule a timer that fires after the given delay
    pub fn schedule_timer(&self, delay: Duration) -> WorkflowFuture<()> {
        let fire_at = self.now()
            + chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::MAX);
        self.schedule_timer_at(fire_at)
    }

    /// Schedule a timer that fires at an absolute instant
    pub fn schedule_timer_at(&self, fire_at: DateTime<Utc>) -> WorkflowFuture<()> {
        let mut state = self.state.borrow_mut();
        let id = state.take_command_id();
        state.push_command(Command::new(id, CommandAttributes::ScheduleTimer { fire_at }));
        let cell = state.register_future(id);
        let converter = state.converter();
        drop(state);

        WorkflowFuture::from_cell(cell, id, converter, self.scope.clone())
    }

    /// Cancel a previously scheduled timer.
    ///
    /// Emits a `TimerCanceled` event so the pending `TimerFired` becomes
    /// undeliverable, and rejects the timer's future with a canceled error.
    /// Canceling an already-fired timer is a no-op.
    pub fn cancel_timer(&self, timer: &WorkflowFuture<()>) {
        let Some(timer_id) = timer.schedule_event_id() else {
            warn!("cancel_timer called on a future that is not a timer");
            return;
        };

        let mut state = self.state.borrow_mut();
        let cell = state.future(timer_id);
        if cell.as_ref().is_some_and(|c| c.is_completed()) {
            return;
        }

        let id = state.take_command_id();
        state.push_command(Command::new(
            id,
            CommandAttributes::CancelTimer {
                timer_schedule_event_id: timer_id,
            },
        ));
        drop(state);

        if let Some(cell) = cell {
            cell.complete(Err(WorkflowError::canceled()));
        }
    }

    /// Schedule a sub-workflow with default options
    pub fn schedule_sub_workflow<I, R>(
        &self,
        instance_id: &str,
        name: &str,
        input: &I,
    ) -> WorkflowFuture<R>
    where
        I: Serialize,
        R: DeserializeOwned + 'static,
    {
        self.schedule_sub_workflow_with_options(
            SubWorkflowOptions::default(),
            instance_id,
            name,
            input,
        )
    }

    /// Schedule a sub-workflow.
    ///
    /// The future resolves when the sub-workflow finishes; a parent that
    /// does not await it simply exits without waiting.
    pub fn schedule_sub_workflow_with_options<I, R>(
        &self,
        options: SubWorkflowOptions,
        instance_id: &str,
        name: &str,
        input: &I,
    ) -> WorkflowFuture<R>
    where
        I: Serialize,
        R: DeserializeOwned + 'static,
    {
        let input = match self.encode_payload(input) {
            Ok(payload) => payload,
            Err(err) => return WorkflowFuture::ready_err(err),
        };

        let mut state = self.state.borrow_mut();
        let id = state.take_command_id();
        state.push_command(Command::new(
            id,
            CommandAttributes::ScheduleSubWorkflow {
                instance_id: instance_id.to_string(),
                name: name.to_string(),
                version: options.version,
                input,
            },
        ));
        let cell = state.register_future(id);
        let converter = state.converter();
        drop(state);

        WorkflowFuture::from_cell(cell, id, converter, self.scope.clone())
    }

    /// Request cancellation of a sub-workflow.
    ///
    /// Delivery is asynchronous; the sub-workflow's future still resolves
    /// with whatever outcome the child records.
    pub fn cancel_sub_workflow<T>(&self, sub_workflow: &WorkflowFuture<T>) {
        let Some(schedule_event_id) = sub_workflow.schedule_event_id() else {
            warn!("cancel_sub_workflow called on a future that is not a sub-workflow");
            return;
        };

        let mut state = self.state.borrow_mut();
        let Some(instance_id) = state.commands().iter().find_map(|c| match &c.attributes {
            CommandAttributes::ScheduleSubWorkflow { instance_id, .. }
                if c.id == schedule_event_id =>
            {
                Some(instance_id.clone())
            }
            _ => None,
        }) else {
            warn!(
                schedule_event_id,
                "cancel_sub_workflow: no sub-workflow scheduled under this command"
            );
            return;
        };

        let id = state.take_command_id();
        state.push_command(Command::new(
            id,
            CommandAttributes::CancelSubWorkflow { instance_id },
        ));
    }

    /// Get the signal channel for a name.
    ///
    /// Idempotent: repeated calls with the same name return views over the
    /// same channel.
    pub fn signal_channel<T: DeserializeOwned>(&self, name: &str) -> SignalChannel<T> {
        let mut state = self.state.borrow_mut();
        let raw = state.signal_channel(name);
        let converter = state.converter();
        drop(state);

        SignalChannel::new(name.to_string(), raw, converter)
    }

    /// Create a channel for coordinating coroutines within this instance
    pub fn channel<T>(&self) -> Channel<T> {
        Channel::new(self.state.borrow().wake_signal())
    }

    /// Run a non-deterministic computation once and persist its value.
    ///
    /// On first execution `f` runs and its result is recorded as a
    /// `SideEffectResult` event; on replay the recorded value is returned
    /// without running `f`. The returned future is already resolved.
    pub fn side_effect<T, F>(&self, f: F) -> WorkflowFuture<T>
    where
        T: Serialize + DeserializeOwned + 'static,
        F: FnOnce() -> T,
    {
        let mut state = self.state.borrow_mut();
        let id = state.take_command_id();

        if let Some(value) = state.side_effect_result(id) {
            let mut command = Command::new(
                id,
                CommandAttributes::SideEffect {
                    value: value.clone(),
                },
            );
            command.state = CommandState::Done;
            state.push_command(command);
            let cell = state.register_future(id);
            cell.complete(Ok(value));
            let converter = state.converter();
            drop(state);
            return WorkflowFuture::from_cell(cell, id, converter, self.scope.clone());
        }
        drop(state);

        let value = f();
        let payload = match self.encode_payload(&value) {
            Ok(payload) => payload,
            Err(err) => return WorkflowFuture::ready_err(err),
        };

        let mut state = self.state.borrow_mut();
        state.push_command(Command::new(
            id,
            CommandAttributes::SideEffect {
                value: payload.clone(),
            },
        ));
        let cell = state.register_future(id);
        cell.complete(Ok(payload));
        let converter = state.converter();
        drop(state);

        WorkflowFuture::from_cell(cell, id, converter, self.scope.clone())
    }

    /// Start a child coroutine within this instance.
    ///
    /// The coroutine is enqueued and runs at the scheduler's next pass; it
    /// never starts immediately.
    pub fn spawn(&self, future: impl Future<Output = ()> + 'static) {
        self.spawner.spawn(future);
    }

    /// Suspend the current coroutine once, letting other ready coroutines run
    pub async fn yield_now(&self) {
        let signal = self.state.borrow().wake_signal();
        Yield::new(signal).await;
    }

    /// Derive a context with its own cancel scope.
    ///
    /// Canceling the returned scope rejects every pending future created
    /// through the derived context; the parent context is unaffected.
    /// Canceling the parent cancels the child as well.
    pub fn with_cancel(&self) -> (WorkflowContext, CancelScope) {
        let scope = self.scope.child();
        let ctx = Self {
            state: Rc::clone(&self.state),
            spawner: self.spawner.clone(),
            scope: scope.clone(),
        };
        (ctx, scope)
    }

    pub(crate) fn encode_payload<T: Serialize>(&self, value: &T) -> Result<Payload, WorkflowError> {
        let converter = self.state.borrow().converter();
        encode(&*converter, value).map_err(WorkflowError::from)
    }

    pub(crate) fn decode_payload<T: DeserializeOwned>(
        &self,
        payload: &Payload,
    ) -> Result<T, WorkflowError> {
        let converter = self.state.borrow().converter();
        decode(&*converter, payload).map_err(WorkflowError::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::WorkflowInstance;
    use crate::payload::JsonConverter;
    use crate::scheduler::{Scheduler, WakeSignal};
    use crate::workflow::state::WorkflowState;
    use std::sync::Arc;

    fn test_context() -> (WorkflowContext, SharedState) {
        let signal = WakeSignal::default();
        let state = WorkflowState::new(
            WorkflowInstance::new("test"),
            Arc::new(JsonConverter),
            signal.clone(),
        );
        let scheduler = Scheduler::new(signal.clone());
        let ctx = WorkflowContext::new(
            Rc::clone(&state),
            scheduler.spawner(),
            CancelScope::new_root(signal),
        );
        (ctx, state)
    }

    #[test]
    fn test_schedule_activity_emits_command() {
        let (ctx, state) = test_context();

        let future: WorkflowFuture<i32> = ctx.schedule_activity("compute", &5);

        assert_eq!(future.schedule_event_id(), Some(1));
        let commands = state.borrow().pending_commands();
        assert_eq!(commands.len(), 1);
        assert!(matches!(
            commands[0].attributes,
            CommandAttributes::ScheduleActivity { ref name, attempt: 1, .. } if name == "compute"
        ));
    }

    #[test]
    fn test_schedule_timer_uses_logical_clock() {
        let (ctx, state) = test_context();
        let t0 = Utc::now();
        state.borrow_mut().set_now(t0);

        let _timer = ctx.schedule_timer(Duration::from_secs(30));

        let commands = state.borrow().pending_commands();
        match &commands[0].attributes {
            CommandAttributes::ScheduleTimer { fire_at } => {
                assert_eq!(*fire_at, t0 + chrono::Duration::seconds(30));
            }
            other => panic!("expected timer command, got {other:?}"),
        }
    }

    #[test]
    fn test_cancel_timer_emits_cancel_and_rejects_future() {
        let (ctx, state) = test_context();

        let timer = ctx.schedule_timer(Duration::from_secs(30));
        ctx.cancel_timer(&timer);

        let commands = state.borrow().commands().to_vec();
        assert_eq!(commands.len(), 2);
        assert!(matches!(
            commands[1].attributes,
            CommandAttributes::CancelTimer {
                timer_schedule_event_id: 1
            }
        ));

        let cell = state.borrow().future(1).unwrap();
        assert!(matches!(cell.peek(), Some(Err(ref e)) if e.is_canceled()));
    }

    #[test]
    fn test_cancel_fired_timer_is_noop() {
        let (ctx, state) = test_context();

        let timer = ctx.schedule_timer(Duration::from_secs(30));
        let payload = encode(&JsonConverter, &()).unwrap();
        state.borrow_mut().resolve_future(1, Ok(payload));

        ctx.cancel_timer(&timer);

        assert_eq!(state.borrow().commands().len(), 1);
    }

    #[test]
    fn test_side_effect_runs_once_and_persists() {
        let (ctx, state) = test_context();

        let mut calls = 0;
        let _ = ctx.side_effect(|| {
            calls += 1;
            42
        });

        assert_eq!(calls, 1);
        let commands = state.borrow().pending_commands();
        assert_eq!(commands.len(), 1);
        assert!(matches!(
            commands[0].attributes,
            CommandAttributes::SideEffect { .. }
        ));
    }

    #[test]
    fn test_side_effect_replays_recorded_value() {
        let (ctx, state) = test_context();

        let recorded = encode(&JsonConverter, &7).unwrap();
        state.borrow_mut().record_side_effect_result(1, recorded);

        let mut ran = false;
        let _future: WorkflowFuture<i32> = ctx.side_effect(|| {
            ran = true;
            99
        });

        assert!(!ran);
        // Replayed side effects are already reconciled, nothing to translate.
        assert!(state.borrow().pending_commands().is_empty());
        let cell = state.borrow().future(1).unwrap();
        let payload = cell.peek().unwrap().unwrap();
        let value: i32 = decode(&JsonConverter, &payload).unwrap();
        assert_eq!(value, 7);
    }

    #[test]
    fn test_cancel_sub_workflow_targets_child_instance() {
        let (ctx, state) = test_context();

        let sub: WorkflowFuture<i32> = ctx.schedule_sub_workflow("child-1", "child", &1);
        ctx.cancel_sub_workflow(&sub);

        let commands = state.borrow().pending_commands();
        assert_eq!(commands.len(), 2);
        assert!(matches!(
            commands[1].attributes,
            CommandAttributes::CancelSubWorkflow { ref instance_id } if instance_id == "child-1"
        ));
    }

    #[test]
    fn test_with_cancel_scope_is_independent() {
        let (ctx, _state) = test_context();

        let (child_ctx, scope) = ctx.with_cancel();
        assert!(!child_ctx.is_canceled());

        scope.cancel();
        assert!(child_ctx.is_canceled());
        assert!(!ctx.is_canceled());
    }

    #[test]
    fn test_side_effect_command_state_done_on_replay() {
        let (ctx, state) = test_context();

        let recorded = encode(&JsonConverter, &1).unwrap();
        state.borrow_mut().record_side_effect_result(1, recorded);
        let _f: WorkflowFuture<i32> = ctx.side_effect(|| 1);

        assert_eq!(state.borrow().commands()[0].state, CommandState::Done);
    }
}
