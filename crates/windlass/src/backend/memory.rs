//! In-memory backend
//!
//! Reference implementation of the [`Backend`] contract. Every completion
//! operation runs under one mutex, which is the in-process analog of the
//! single transaction the contract requires. Used by the test harness and as
//! the template concrete drivers are written against.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{
    ActivityTask, Backend, BackendError, InstanceMessage, InstanceState, InstanceStatus,
    WorkflowTask,
};
use crate::clock::{Clock, WallClock};
use crate::history::{Event, EventAttributes, EventType};
use crate::instance::WorkflowInstance;
use crate::payload::Payload;
use crate::workflow::WorkflowError;

/// Granularity for re-checking visibility barriers and lease expiry while
/// blocked in a poll
const POLL_GRANULARITY: Duration = Duration::from_millis(20);

#[derive(Debug, Clone)]
struct Lease {
    token: Uuid,
    expires_at: DateTime<Utc>,
}

impl Lease {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

struct InstanceRecord {
    instance: WorkflowInstance,
    workflow_name: String,
    status: InstanceStatus,
    history: Vec<Event>,
    pending: Vec<Event>,
    result: Option<Payload>,
    error: Option<WorkflowError>,
    lease: Option<Lease>,
    next_sequence: i64,
}

impl InstanceRecord {
    /// Enqueue a pending event, ignoring duplicates by event ID
    /// (at-least-once delivery reconciles idempotently).
    fn push_pending(&mut self, event: Event) {
        let duplicate = self.pending.iter().any(|e| e.id == event.id)
            || self.history.iter().any(|e| e.id == event.id);
        if duplicate {
            debug!(event_id = %event.id, "dropping duplicate pending event");
            return;
        }
        self.pending.push(event);
    }
}

struct ActivityRecord {
    id: Uuid,
    instance: WorkflowInstance,
    schedule_event: Event,
    lease: Option<Lease>,
}

#[derive(Default)]
struct SharedState {
    // BTreeMap keeps claiming order deterministic across runs
    instances: BTreeMap<String, InstanceRecord>,
    activities: Vec<ActivityRecord>,
}

/// In-memory implementation of the [`Backend`] contract.
///
/// # Example
///
/// ```
/// use windlass::backend::InMemoryBackend;
///
/// let backend = InMemoryBackend::new();
/// ```
pub struct InMemoryBackend {
    state: Mutex<SharedState>,
    clock: Arc<dyn Clock>,
    lease_duration: Duration,
    workflow_signal: Notify,
    activity_signal: Notify,
}

impl Default for InMemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBackend {
    /// Create a backend on the wall clock with a 30 s lease
    pub fn new() -> Self {
        Self::with_clock(Arc::new(WallClock))
    }

    /// Create a backend on a custom time source
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(SharedState::default()),
            clock,
            lease_duration: Duration::from_secs(30),
            workflow_signal: Notify::new(),
            activity_signal: Notify::new(),
        }
    }

    /// Set the lease duration for workflow and activity tasks
    pub fn with_lease_duration(mut self, lease_duration: Duration) -> Self {
        self.lease_duration = lease_duration;
        self
    }

    /// The earliest instant at which a currently invisible pending event
    /// becomes deliverable. Test harnesses advance their mock clock to this.
    pub fn next_visible_at(&self) -> Option<DateTime<Utc>> {
        let now = self.clock.now();
        let state = self.state.lock();
        state
            .instances
            .values()
            .filter(|r| !r.status.is_terminal())
            .flat_map(|r| r.pending.iter())
            .filter_map(|e| e.visible_at)
            .filter(|at| *at > now)
            .min()
    }

    /// Number of activity tasks waiting to be claimed
    pub fn pending_activity_count(&self) -> usize {
        let now = self.clock.now();
        self.state
            .lock()
            .activities
            .iter()
            .filter(|a| a.lease.as_ref().is_none_or(|l| l.is_expired(now)))
            .count()
    }

    fn new_lease(&self, now: DateTime<Utc>) -> Lease {
        Lease {
            token: Uuid::now_v7(),
            expires_at: now
                + chrono::Duration::from_std(self.lease_duration)
                    .unwrap_or(chrono::Duration::MAX),
        }
    }

    fn try_claim_workflow_task(&self) -> Option<WorkflowTask> {
        let now = self.clock.now();
        let mut state = self.state.lock();

        for record in state.instances.values_mut() {
            if record.status.is_terminal() {
                continue;
            }
            if record.lease.as_ref().is_some_and(|l| !l.is_expired(now)) {
                continue;
            }

            let new_events: Vec<Event> = record
                .pending
                .iter()
                .filter(|e| e.visible_at.is_none_or(|at| at <= now))
                .cloned()
                .collect();
            if new_events.is_empty() {
                continue;
            }

            let lease = self.new_lease(now);
            let token = lease.token;
            record.lease = Some(lease);

            return Some(WorkflowTask {
                instance: record.instance.clone(),
                workflow_name: record.workflow_name.clone(),
                last_sequence_id: record.next_sequence - 1,
                history: record.history.clone(),
                new_events,
                lease_token: token,
            });
        }

        None
    }

    fn try_claim_activity_task(&self) -> Option<ActivityTask> {
        let now = self.clock.now();
        let mut state = self.state.lock();

        for record in state.activities.iter_mut() {
            if record.lease.as_ref().is_some_and(|l| !l.is_expired(now)) {
                continue;
            }

            let lease = self.new_lease(now);
            let token = lease.token;
            record.lease = Some(lease);

            return Some(ActivityTask {
                id: record.id,
                instance: record.instance.clone(),
                schedule_event: record.schedule_event.clone(),
                lease_token: token,
            });
        }

        None
    }

    fn deliver_message(state: &mut SharedState, message: InstanceMessage) {
        match message {
            InstanceMessage::CreateInstance { instance, event } => {
                if let Some(existing) = state.instances.get(&instance.instance_id) {
                    if existing.instance.execution_id == instance.execution_id {
                        debug!(instance_id = %instance.instance_id, "instance already created");
                    } else {
                        warn!(
                            instance_id = %instance.instance_id,
                            "instance id already taken by another execution; dropping start"
                        );
                    }
                    return;
                }
                let workflow_name = match &event.attributes {
                    EventAttributes::WorkflowExecutionStarted { name, .. } => name.clone(),
                    other => {
                        warn!(
                            "create message carries {} instead of a start event; dropping",
                            other.event_type()
                        );
                        return;
                    }
                };
                let record = InstanceRecord {
                    instance: instance.clone(),
                    workflow_name,
                    status: InstanceStatus::Running,
                    history: Vec::new(),
                    pending: vec![event],
                    result: None,
                    error: None,
                    lease: None,
                    next_sequence: 1,
                };
                state.instances.insert(instance.instance_id.clone(), record);
            }
            InstanceMessage::DeliverEvent {
                target_instance_id,
                event,
            } => match state.instances.get_mut(&target_instance_id) {
                Some(record) if record.status.is_terminal() => {
                    debug!(
                        instance_id = %target_instance_id,
                        event_type = %event.event_type(),
                        "dropping message to terminal instance"
                    );
                }
                Some(record) => record.push_pending(event),
                None => {
                    warn!(
                        instance_id = %target_instance_id,
                        "dropping message to unknown instance"
                    );
                }
            },
        }
    }
}

#[async_trait]
impl Backend for InMemoryBackend {
    fn clock(&self) -> Arc<dyn Clock> {
        Arc::clone(&self.clock)
    }

    async fn create_workflow_instance(
        &self,
        instance: WorkflowInstance,
        start_event: Event,
    ) -> Result<(), BackendError> {
        let workflow_name = match &start_event.attributes {
            EventAttributes::WorkflowExecutionStarted { name, .. } => name.clone(),
            other => {
                return Err(BackendError::CorruptHistory {
                    instance_id: instance.instance_id.clone(),
                    reason: format!(
                        "instance must start with workflow_execution_started, got {}",
                        other.event_type()
                    ),
                })
            }
        };

        {
            let mut state = self.state.lock();
            if let Some(existing) = state.instances.get(&instance.instance_id) {
                return if existing.instance.execution_id == instance.execution_id {
                    Ok(())
                } else {
                    Err(BackendError::InstanceAlreadyExists(
                        instance.instance_id.clone(),
                    ))
                };
            }

            let record = InstanceRecord {
                instance: instance.clone(),
                workflow_name,
                status: InstanceStatus::Running,
                history: Vec::new(),
                pending: vec![start_event],
                result: None,
                error: None,
                lease: None,
                next_sequence: 1,
            };
            state.instances.insert(instance.instance_id.clone(), record);
        }

        self.workflow_signal.notify_waiters();
        Ok(())
    }

    async fn signal_workflow_instance(
        &self,
        instance_id: &str,
        event: Event,
    ) -> Result<(), BackendError> {
        {
            let mut state = self.state.lock();
            let record = state
                .instances
                .get_mut(instance_id)
                .ok_or_else(|| BackendError::InstanceNotFound(instance_id.to_string()))?;

            if record.status.is_terminal() {
                return Err(BackendError::InstanceTerminal(instance_id.to_string()));
            }
            record.push_pending(event);
        }

        self.workflow_signal.notify_waiters();
        Ok(())
    }

    async fn terminate_workflow_instance(
        &self,
        instance_id: &str,
        reason: &str,
    ) -> Result<(), BackendError> {
        let now = self.clock.now();
        {
            let mut state = self.state.lock();
            let record = state
                .instances
                .get_mut(instance_id)
                .ok_or_else(|| BackendError::InstanceNotFound(instance_id.to_string()))?;

            if record.status.is_terminal() {
                return Ok(());
            }

            let mut event = Event::new(
                now,
                EventAttributes::WorkflowExecutionTerminated {
                    reason: reason.to_string(),
                },
            );
            event.sequence_id = record.next_sequence;
            record.next_sequence += 1;
            record.history.push(event);
            record.status = InstanceStatus::Terminated;
            record.error = Some(WorkflowError::new(format!("terminated: {reason}")));
            record.pending.clear();
        }

        self.workflow_signal.notify_waiters();
        Ok(())
    }

    async fn get_workflow_instance_state(
        &self,
        instance_id: &str,
    ) -> Result<InstanceState, BackendError> {
        let state = self.state.lock();
        let record = state
            .instances
            .get(instance_id)
            .ok_or_else(|| BackendError::InstanceNotFound(instance_id.to_string()))?;

        Ok(InstanceState {
            instance: record.instance.clone(),
            status: record.status,
            result: record.result.clone(),
            error: record.error.clone(),
        })
    }

    async fn get_workflow_history(&self, instance_id: &str) -> Result<Vec<Event>, BackendError> {
        let state = self.state.lock();
        let record = state
            .instances
            .get(instance_id)
            .ok_or_else(|| BackendError::InstanceNotFound(instance_id.to_string()))?;
        Ok(record.history.clone())
    }

    async fn get_workflow_task(
        &self,
        timeout: Duration,
    ) -> Result<Option<WorkflowTask>, BackendError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(task) = self.try_claim_workflow_task() {
                return Ok(Some(task));
            }
            if timeout.is_zero() || tokio::time::Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::select! {
                _ = self.workflow_signal.notified() => {}
                _ = tokio::time::sleep(POLL_GRANULARITY) => {}
                _ = tokio::time::sleep_until(deadline) => return Ok(None),
            }
        }
    }

    async fn extend_workflow_task_lease(&self, task: &WorkflowTask) -> Result<(), BackendError> {
        let now = self.clock.now();
        let mut state = self.state.lock();
        let record = state
            .instances
            .get_mut(&task.instance.instance_id)
            .ok_or_else(|| BackendError::InstanceNotFound(task.instance.instance_id.clone()))?;

        match &mut record.lease {
            Some(lease) if lease.token == task.lease_token && !lease.is_expired(now) => {
                lease.expires_at = now
                    + chrono::Duration::from_std(self.lease_duration)
                        .unwrap_or(chrono::Duration::MAX);
                Ok(())
            }
            _ => Err(BackendError::LeaseLost(task.instance.instance_id.clone())),
        }
    }

    async fn complete_workflow_task(
        &self,
        task: &WorkflowTask,
        executed_events: Vec<Event>,
        activity_events: Vec<Event>,
        timer_events: Vec<Event>,
        messages: Vec<InstanceMessage>,
    ) -> Result<(), BackendError> {
        let now = self.clock.now();
        {
            let mut state = self.state.lock();

            // Timers canceled in this same batch must never become visible.
            let canceled_timers: Vec<i64> = executed_events
                .iter()
                .filter(|e| e.event_type() == EventType::TimerCanceled)
                .filter_map(|e| e.schedule_event_id)
                .collect();

            let record = state
                .instances
                .get_mut(&task.instance.instance_id)
                .ok_or_else(|| BackendError::InstanceNotFound(task.instance.instance_id.clone()))?;

            match &record.lease {
                Some(lease) if lease.token == task.lease_token && !lease.is_expired(now) => {}
                _ => return Err(BackendError::LeaseLost(task.instance.instance_id.clone())),
            }
            if record.status.is_terminal() {
                return Err(BackendError::InstanceTerminal(
                    task.instance.instance_id.clone(),
                ));
            }

            for mut event in executed_events {
                record.pending.retain(|p| p.id != event.id);
                event.sequence_id = record.next_sequence;
                record.next_sequence += 1;

                match &event.attributes {
                    EventAttributes::WorkflowExecutionFinished { result, error } => {
                        record.status = InstanceStatus::Finished;
                        record.result = result.clone();
                        record.error = error.clone();
                    }
                    EventAttributes::WorkflowExecutionTerminated { reason } => {
                        record.status = InstanceStatus::Terminated;
                        record.error = Some(WorkflowError::new(format!("terminated: {reason}")));
                    }
                    _ => {}
                }

                record.history.push(event);
            }

            record
                .pending
                .retain(|p| match (p.event_type(), p.schedule_event_id) {
                    (EventType::TimerFired, Some(id)) => !canceled_timers.contains(&id),
                    _ => true,
                });

            for event in timer_events {
                if event
                    .schedule_event_id
                    .is_some_and(|id| canceled_timers.contains(&id))
                {
                    continue;
                }
                record.push_pending(event);
            }

            record.lease = None;

            for event in activity_events {
                state.activities.push(ActivityRecord {
                    id: Uuid::now_v7(),
                    instance: task.instance.clone(),
                    schedule_event: event,
                    lease: None,
                });
            }

            for message in messages {
                Self::deliver_message(&mut state, message);
            }
        }

        self.workflow_signal.notify_waiters();
        self.activity_signal.notify_waiters();
        Ok(())
    }

    async fn get_activity_task(
        &self,
        timeout: Duration,
    ) -> Result<Option<ActivityTask>, BackendError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if let Some(task) = self.try_claim_activity_task() {
                return Ok(Some(task));
            }
            if timeout.is_zero() || tokio::time::Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::select! {
                _ = self.activity_signal.notified() => {}
                _ = tokio::time::sleep(POLL_GRANULARITY) => {}
                _ = tokio::time::sleep_until(deadline) => return Ok(None),
            }
        }
    }

    async fn extend_activity_task_lease(&self, task: &ActivityTask) -> Result<(), BackendError> {
        let now = self.clock.now();
        let mut state = self.state.lock();
        let record = state
            .activities
            .iter_mut()
            .find(|a| a.id == task.id)
            .ok_or_else(|| BackendError::LeaseLost(task.instance.instance_id.clone()))?;

        match &mut record.lease {
            Some(lease) if lease.token == task.lease_token && !lease.is_expired(now) => {
                lease.expires_at = now
                    + chrono::Duration::from_std(self.lease_duration)
                        .unwrap_or(chrono::Duration::MAX);
                Ok(())
            }
            _ => Err(BackendError::LeaseLost(task.instance.instance_id.clone())),
        }
    }

    async fn complete_activity_task(
        &self,
        task: &ActivityTask,
        result_event: Event,
    ) -> Result<(), BackendError> {
        let now = self.clock.now();
        {
            let mut state = self.state.lock();

            let Some(index) = state.activities.iter().position(|a| a.id == task.id) else {
                // Already completed by another delivery; reconciliation is
                // idempotent by event ID.
                debug!(task_id = %task.id, "activity task already completed");
                return Ok(());
            };

            match &state.activities[index].lease {
                Some(lease) if lease.token == task.lease_token && !lease.is_expired(now) => {}
                _ => return Err(BackendError::LeaseLost(task.instance.instance_id.clone())),
            }
            state.activities.remove(index);

            match state.instances.get_mut(&task.instance.instance_id) {
                Some(record) if record.status.is_terminal() => {
                    debug!(
                        instance_id = %task.instance.instance_id,
                        "dropping activity result for terminal instance"
                    );
                }
                Some(record) => record.push_pending(result_event),
                None => {
                    warn!(
                        instance_id = %task.instance.instance_id,
                        "dropping activity result for unknown instance"
                    );
                }
            }
        }

        self.workflow_signal.notify_waiters();
        Ok(())
    }
}
