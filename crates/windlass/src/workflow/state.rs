//! Per-task workflow runtime state
//!
//! Lives for exactly one task execution and is rebuilt from history on the
//! next one. Shared between the context handles held by workflow code and
//! the executor driving the replay.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::command::{Command, CommandAttributes, CommandState};
use crate::history::Event;
use crate::instance::WorkflowInstance;
use crate::payload::{Converter, Payload};
use crate::scheduler::WakeSignal;
use crate::workflow::channel::Channel;
use crate::workflow::futures::FutureCell;

pub(crate) type SharedState = Rc<RefCell<WorkflowState>>;

/// Runtime-only state of one workflow task execution.
pub(crate) struct WorkflowState {
    instance: WorkflowInstance,
    converter: Arc<dyn Converter>,
    signal: WakeSignal,

    /// Monotonic command ID counter; deterministic because the workflow
    /// re-emits commands in the same order every replay
    next_command_id: i64,

    /// Commands emitted this slice, in emission order
    commands: Vec<Command>,

    /// In-flight futures keyed by command ID
    futures: HashMap<i64, Rc<FutureCell>>,

    /// Signal channels keyed by signal name
    signal_channels: HashMap<String, Channel<Payload>>,

    /// Side-effect values already recorded in history, keyed by command ID
    side_effect_results: HashMap<i64, Payload>,

    /// Logical clock: timestamp of the most recently delivered event
    now: DateTime<Utc>,

    /// Whether the executor is replaying prior history
    replaying: bool,
}

impl WorkflowState {
    pub(crate) fn new(
        instance: WorkflowInstance,
        converter: Arc<dyn Converter>,
        signal: WakeSignal,
    ) -> SharedState {
        Rc::new(RefCell::new(Self {
            instance,
            converter,
            signal,
            next_command_id: 1,
            commands: Vec::new(),
            futures: HashMap::new(),
            signal_channels: HashMap::new(),
            side_effect_results: HashMap::new(),
            now: DateTime::<Utc>::MIN_UTC,
            replaying: false,
        }))
    }

    pub(crate) fn instance(&self) -> &WorkflowInstance {
        &self.instance
    }

    pub(crate) fn converter(&self) -> Arc<dyn Converter> {
        Arc::clone(&self.converter)
    }

    pub(crate) fn wake_signal(&self) -> WakeSignal {
        self.signal.clone()
    }

    pub(crate) fn now(&self) -> DateTime<Utc> {
        self.now
    }

    /// Advance the logical clock; it never moves backwards
    pub(crate) fn set_now(&mut self, now: DateTime<Utc>) {
        if now > self.now {
            self.now = now;
        }
    }

    pub(crate) fn replaying(&self) -> bool {
        self.replaying
    }

    pub(crate) fn set_replaying(&mut self, replaying: bool) {
        self.replaying = replaying;
    }

    pub(crate) fn take_command_id(&mut self) -> i64 {
        let id = self.next_command_id;
        self.next_command_id += 1;
        id
    }

    pub(crate) fn push_command(&mut self, command: Command) {
        self.commands.push(command);
    }

    pub(crate) fn commands(&self) -> &[Command] {
        &self.commands
    }

    /// Commands still pending at the end of the slice, for the worker to
    /// translate into fresh events
    pub(crate) fn pending_commands(&self) -> Vec<Command> {
        self.commands
            .iter()
            .filter(|c| c.state == CommandState::Pending)
            .cloned()
            .collect()
    }

    /// Register an in-flight future for the given command ID
    pub(crate) fn register_future(&mut self, schedule_event_id: i64) -> Rc<FutureCell> {
        let cell = FutureCell::new(self.signal.clone());
        self.futures.insert(schedule_event_id, Rc::clone(&cell));
        cell
    }

    pub(crate) fn future(&self, schedule_event_id: i64) -> Option<Rc<FutureCell>> {
        self.futures.get(&schedule_event_id).map(Rc::clone)
    }

    /// Resolve the in-flight future correlated to a result event. Returns
    /// false when no future is registered under the ID (e.g. the result of a
    /// canceled operation arriving late).
    pub(crate) fn resolve_future(
        &mut self,
        schedule_event_id: i64,
        result: Result<Payload, crate::workflow::WorkflowError>,
    ) -> bool {
        match self.futures.get(&schedule_event_id) {
            Some(cell) => {
                cell.complete(result);
                true
            }
            None => false,
        }
    }

    /// Get or create the signal channel for a name
    pub(crate) fn signal_channel(&mut self, name: &str) -> Channel<Payload> {
        let signal = self.signal.clone();
        self.signal_channels
            .entry(name.to_string())
            .or_insert_with(|| Channel::new(signal))
            .clone()
    }

    pub(crate) fn deliver_signal(&mut self, name: &str, payload: Payload) {
        self.signal_channel(name).send(payload);
    }

    pub(crate) fn record_side_effect_result(&mut self, schedule_event_id: i64, value: Payload) {
        self.side_effect_results.insert(schedule_event_id, value);
    }

    pub(crate) fn side_effect_result(&self, schedule_event_id: i64) -> Option<Payload> {
        self.side_effect_results.get(&schedule_event_id).cloned()
    }

    /// Reconcile a schedule event from history against the commands the
    /// workflow has re-emitted this slice.
    ///
    /// Schedule events must appear in the exact order the commands were
    /// emitted; any divergence is a non-determinism error. `SideEffectResult`
    /// is the exception: its value is consumed at the call site, so it is
    /// matched by ID rather than by position.
    pub(crate) fn match_schedule_event(&mut self, event: &Event) -> Result<(), String> {
        if event.event_type() == crate::history::EventType::SideEffectResult {
            let id = event.schedule_event_id.unwrap_or_default();
            return match self.commands.iter_mut().find(|c| c.id == id) {
                Some(command)
                    if matches!(command.attributes, CommandAttributes::SideEffect { .. }) =>
                {
                    if command.state == CommandState::Pending {
                        command.state = CommandState::Done;
                    }
                    Ok(())
                }
                Some(command) => Err(format!(
                    "history expects a side effect for command {id}, workflow produced {:?}",
                    command.schedule_event_type()
                )),
                None => Err(format!(
                    "history contains a side effect result for command {id} the workflow did not produce"
                )),
            };
        }

        let Some(command) = self
            .commands
            .iter_mut()
            .find(|c| c.state == CommandState::Pending)
        else {
            return Err(format!(
                "history contains {} (schedule event {:?}) but the workflow produced no more commands",
                event.event_type(),
                event.schedule_event_id,
            ));
        };

        if !command.matches_event(event) {
            return Err(format!(
                "history expects {} (schedule event {:?}), workflow produced {} (command {})",
                event.event_type(),
                event.schedule_event_id,
                command.schedule_event_type(),
                command.id,
            ));
        }

        command.state = CommandState::Committed;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::EventAttributes;
    use crate::payload::{encode, JsonConverter};

    fn new_state() -> SharedState {
        WorkflowState::new(
            WorkflowInstance::new("test"),
            Arc::new(JsonConverter),
            WakeSignal::default(),
        )
    }

    #[test]
    fn test_command_ids_are_monotonic() {
        let state = new_state();
        let mut state = state.borrow_mut();

        assert_eq!(state.take_command_id(), 1);
        assert_eq!(state.take_command_id(), 2);
        assert_eq!(state.take_command_id(), 3);
    }

    #[test]
    fn test_matching_in_emission_order() {
        let state = new_state();
        let mut state = state.borrow_mut();

        let fire_at = Utc::now();
        state.push_command(Command::new(1, CommandAttributes::ScheduleTimer { fire_at }));
        state.push_command(Command::new(2, CommandAttributes::ScheduleTimer { fire_at }));

        let first = Event::new(fire_at, EventAttributes::TimerScheduled { fire_at })
            .with_schedule_event_id(1);
        let second = Event::new(fire_at, EventAttributes::TimerScheduled { fire_at })
            .with_schedule_event_id(2);

        state.match_schedule_event(&first).unwrap();
        state.match_schedule_event(&second).unwrap();

        assert!(state.pending_commands().is_empty());
    }

    #[test]
    fn test_out_of_order_match_is_nondeterministic() {
        let state = new_state();
        let mut state = state.borrow_mut();

        let fire_at = Utc::now();
        state.push_command(Command::new(1, CommandAttributes::ScheduleTimer { fire_at }));

        let wrong = Event::new(fire_at, EventAttributes::TimerScheduled { fire_at })
            .with_schedule_event_id(5);

        assert!(state.match_schedule_event(&wrong).is_err());
    }

    #[test]
    fn test_unexpected_event_is_nondeterministic() {
        let state = new_state();
        let mut state = state.borrow_mut();

        let fire_at = Utc::now();
        let event = Event::new(fire_at, EventAttributes::TimerScheduled { fire_at })
            .with_schedule_event_id(1);

        assert!(state.match_schedule_event(&event).is_err());
    }

    #[test]
    fn test_side_effect_matched_by_id() {
        let state = new_state();
        let mut state = state.borrow_mut();

        let value = encode(&JsonConverter, &10).unwrap();
        state.push_command(Command::new(
            2,
            CommandAttributes::SideEffect {
                value: value.clone(),
            },
        ));

        let event = Event::new(Utc::now(), EventAttributes::SideEffectResult { value })
            .with_schedule_event_id(2);

        state.match_schedule_event(&event).unwrap();
        assert!(state.pending_commands().is_empty());
    }

    #[test]
    fn test_resolve_unknown_future_reports_missing() {
        let state = new_state();
        let mut state = state.borrow_mut();

        let payload = encode(&JsonConverter, &1).unwrap();
        assert!(!state.resolve_future(9, Ok(payload)));
    }

    #[test]
    fn test_signal_channels_are_idempotent_per_name() {
        let state = new_state();
        let mut state = state.borrow_mut();

        let a = state.signal_channel("approval");
        let b = state.signal_channel("approval");

        a.send(encode(&JsonConverter, &"x").unwrap());
        assert_eq!(b.len(), 1);
    }

    #[test]
    fn test_logical_clock_never_goes_backwards() {
        let state = new_state();
        let mut state = state.borrow_mut();

        let t1 = Utc::now();
        let t0 = t1 - chrono::Duration::seconds(10);

        state.set_now(t1);
        state.set_now(t0);

        assert_eq!(state.now(), t1);
    }
}
