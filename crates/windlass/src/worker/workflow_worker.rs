//! Workflow worker loops and command translation
//!
//! Two cooperating loops: the poll loop leases tasks from the backend and
//! feeds a bounded queue; the dispatch loop drains it, runs the executor,
//! translates the emitted commands into events and messages, and commits
//! them atomically. A per-task heartbeat renews the lease while the task is
//! in flight; lease loss drops the result without committing anything.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::backend::{Backend, BackendError, InstanceMessage, WorkflowTask};
use crate::command::{Command, CommandAttributes};
use crate::executor::{ExecutorError, WorkflowExecutor};
use crate::history::{Event, EventAttributes};
use crate::instance::WorkflowInstance;
use crate::payload::Payload;
use crate::worker::WorkerOptions;

/// Events and messages produced by translating one slice's commands.
#[derive(Debug, Default)]
pub(crate) struct CommandTranslation {
    /// Schedule events to append to the instance history
    pub executed_events: Vec<Event>,

    /// `ActivityScheduled` events to enqueue as activity tasks
    pub activity_events: Vec<Event>,

    /// `TimerFired` events to enqueue behind their visibility barrier
    pub timer_events: Vec<Event>,

    /// Messages routed to other instances
    pub messages: Vec<InstanceMessage>,
}

/// Translate pending commands into durable events and messages.
///
/// Performed by the worker, not the executor: translation stamps wall-clock
/// timestamps and mints event IDs, neither of which belongs inside the
/// deterministic execution.
pub(crate) fn translate_commands(
    instance: &WorkflowInstance,
    commands: &[Command],
    now: DateTime<Utc>,
) -> CommandTranslation {
    let mut translation = CommandTranslation::default();

    for command in commands {
        match &command.attributes {
            CommandAttributes::ScheduleActivity {
                name,
                version,
                input,
                attempt,
                start_to_close_timeout,
            } => {
                let event = Event::new(
                    now,
                    EventAttributes::ActivityScheduled {
                        name: name.clone(),
                        version: version.clone(),
                        input: input.clone(),
                        attempt: *attempt,
                        start_to_close_timeout: *start_to_close_timeout,
                    },
                )
                .with_schedule_event_id(command.id);
                translation.activity_events.push(event.clone());
                translation.executed_events.push(event);
            }

            CommandAttributes::ScheduleTimer { fire_at } => {
                translation.executed_events.push(
                    Event::new(now, EventAttributes::TimerScheduled { fire_at: *fire_at })
                        .with_schedule_event_id(command.id),
                );
                // The fired event is created up front and parked behind its
                // visibility barrier; its timestamp is the fire time so the
                // logical clock lands exactly on it.
                translation.timer_events.push(
                    Event::new(*fire_at, EventAttributes::TimerFired { fire_at: *fire_at })
                        .with_schedule_event_id(command.id)
                        .with_visible_at(*fire_at),
                );
            }

            CommandAttributes::CancelTimer {
                timer_schedule_event_id,
            } => {
                translation.executed_events.push(
                    Event::new(now, EventAttributes::TimerCanceled {})
                        .with_schedule_event_id(*timer_schedule_event_id),
                );
            }

            CommandAttributes::ScheduleSubWorkflow {
                instance_id,
                name,
                version,
                input,
            } => {
                translation.executed_events.push(
                    Event::new(
                        now,
                        EventAttributes::SubWorkflowScheduled {
                            instance_id: instance_id.clone(),
                            name: name.clone(),
                            version: version.clone(),
                            input: input.clone(),
                        },
                    )
                    .with_schedule_event_id(command.id),
                );

                let child = WorkflowInstance::sub_workflow(instance_id, instance, command.id);
                translation.messages.push(InstanceMessage::CreateInstance {
                    instance: child,
                    event: Event::new(
                        now,
                        EventAttributes::WorkflowExecutionStarted {
                            name: name.clone(),
                            version: version.clone(),
                            input: input.clone(),
                        },
                    ),
                });
            }

            CommandAttributes::CancelSubWorkflow { instance_id } => {
                translation.executed_events.push(
                    Event::new(now, EventAttributes::SubWorkflowCancellationRequested {})
                        .with_schedule_event_id(command.id),
                );
                // The child-bound copy carries no schedule_event_id: that is
                // how the child tells an inbound cancellation apart from its
                // own recorded emissions.
                translation.messages.push(InstanceMessage::DeliverEvent {
                    target_instance_id: instance_id.clone(),
                    event: Event::new(now, EventAttributes::SubWorkflowCancellationRequested {}),
                });
            }

            CommandAttributes::SideEffect { value } => {
                translation.executed_events.push(
                    Event::new(
                        now,
                        EventAttributes::SideEffectResult {
                            value: value.clone(),
                        },
                    )
                    .with_schedule_event_id(command.id),
                );
            }

            CommandAttributes::CompleteWorkflow { result, error } => {
                translation.executed_events.push(
                    Event::new(
                        now,
                        EventAttributes::WorkflowExecutionFinished {
                            result: result.clone(),
                            error: error.clone(),
                        },
                    )
                    .with_schedule_event_id(command.id),
                );

                if let Some(parent) = &instance.parent {
                    let attributes = match error {
                        Some(error) => EventAttributes::SubWorkflowFailed {
                            error: error.clone(),
                        },
                        None => EventAttributes::SubWorkflowCompleted {
                            result: result.clone().unwrap_or_else(|| Payload::new(Vec::new())),
                        },
                    };
                    translation.messages.push(InstanceMessage::DeliverEvent {
                        target_instance_id: parent.instance_id.clone(),
                        event: Event::new(now, attributes)
                            .with_schedule_event_id(parent.schedule_event_id),
                    });
                }
            }
        }
    }

    translation
}

/// Spawn the poll and dispatch loops; returns their join handles.
pub(crate) fn start(
    backend: Arc<dyn Backend>,
    executor: Arc<WorkflowExecutor>,
    options: WorkerOptions,
    shutdown_rx: watch::Receiver<bool>,
) -> Vec<JoinHandle<()>> {
    let (task_tx, task_rx) = mpsc::channel::<WorkflowTask>(options.max_concurrent_workflow_tasks);

    let poll_handle = tokio::spawn(poll_loop(
        Arc::clone(&backend),
        options.clone(),
        task_tx,
        shutdown_rx.clone(),
    ));
    let dispatch_handle = tokio::spawn(dispatch_loop(
        backend,
        executor,
        options,
        task_rx,
        shutdown_rx,
    ));

    vec![poll_handle, dispatch_handle]
}

async fn poll_loop(
    backend: Arc<dyn Backend>,
    options: WorkerOptions,
    task_tx: mpsc::Sender<WorkflowTask>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        tokio::select! {
            _ = shutdown_rx.changed() => break,
            polled = backend.get_workflow_task(options.workflow_poll_interval) => match polled {
                Ok(Some(task)) => {
                    // Bounded send: a full queue is the backpressure.
                    if task_tx.send(task).await.is_err() {
                        break;
                    }
                }
                Ok(None) => {}
                Err(err) => {
                    // Transient; back off with jitter so restarted workers
                    // do not stampede the backend.
                    warn!("workflow poll failed: {err}");
                    let jitter =
                        rand::thread_rng().gen_range(0..=options.workflow_poll_interval.as_millis() as u64);
                    tokio::time::sleep(
                        options.workflow_poll_interval + Duration::from_millis(jitter),
                    )
                    .await;
                }
            }
        }
    }

    debug!("workflow poll loop exited");
}

async fn dispatch_loop(
    backend: Arc<dyn Backend>,
    executor: Arc<WorkflowExecutor>,
    options: WorkerOptions,
    mut task_rx: mpsc::Receiver<WorkflowTask>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let slots = Arc::new(Semaphore::new(options.max_concurrent_workflow_tasks));

    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => break,
            task = task_rx.recv() => {
                let Some(task) = task else { break };
                let permit = match Arc::clone(&slots).acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => break,
                };

                let backend = Arc::clone(&backend);
                let executor = Arc::clone(&executor);
                let heartbeat_interval = options.heartbeat_interval;
                tokio::spawn(async move {
                    process_workflow_task(backend, executor, heartbeat_interval, task).await;
                    drop(permit);
                });
            }
        }
    }

    debug!("workflow dispatch loop exited");
}

async fn process_workflow_task(
    backend: Arc<dyn Backend>,
    executor: Arc<WorkflowExecutor>,
    heartbeat_interval: Duration,
    task: WorkflowTask,
) {
    let (lease_lost_tx, lease_lost_rx) = watch::channel(false);
    let heartbeat = spawn_lease_heartbeat(
        Arc::clone(&backend),
        task.clone(),
        heartbeat_interval,
        lease_lost_tx,
    );

    let execution = executor.execute_task(&task);

    match execution {
        Ok(execution) => {
            if *lease_lost_rx.borrow() {
                warn!(
                    instance = %task.instance.instance_id,
                    "lease lost during execution; dropping uncommitted result"
                );
            } else {
                let translation =
                    translate_commands(&task.instance, &execution.commands, backend.clock().now());
                let mut executed_events = execution.executed_events;
                executed_events.extend(translation.executed_events);

                match backend
                    .complete_workflow_task(
                        &task,
                        executed_events,
                        translation.activity_events,
                        translation.timer_events,
                        translation.messages,
                    )
                    .await
                {
                    Ok(()) => debug!(
                        instance = %task.instance.instance_id,
                        completed = execution.completed,
                        "workflow task committed"
                    ),
                    Err(BackendError::LeaseLost(_)) => warn!(
                        instance = %task.instance.instance_id,
                        "lease lost at commit; task will be redelivered"
                    ),
                    Err(err) => error!(
                        instance = %task.instance.instance_id,
                        "failed to complete workflow task: {err}"
                    ),
                }
            }
        }
        // Fatal for this task only: nothing is committed, the instance stays
        // runnable, and redelivery lets an upgraded worker retry.
        Err(err @ ExecutorError::NonDeterminism(_)) => {
            error!(instance = %task.instance.instance_id, "{err}");
        }
        Err(err) => {
            error!(instance = %task.instance.instance_id, "workflow task failed: {err}");
        }
    }

    heartbeat.abort();
}

fn spawn_lease_heartbeat(
    backend: Arc<dyn Backend>,
    task: WorkflowTask,
    interval: Duration,
    lease_lost_tx: watch::Sender<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await; // immediate first tick; the lease is fresh
        loop {
            ticker.tick().await;
            if let Err(err) = backend.extend_workflow_task_lease(&task).await {
                warn!(
                    instance = %task.instance.instance_id,
                    "workflow lease renewal failed: {err}"
                );
                let _ = lease_lost_tx.send(true);
                break;
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::history::EventType;
    use crate::payload::{encode, JsonConverter};
    use crate::workflow::WorkflowError;

    fn payload_of<T: serde::Serialize>(value: &T) -> Payload {
        encode(&JsonConverter, value).unwrap()
    }

    #[test]
    fn test_schedule_activity_translates_to_event_and_task() {
        let instance = WorkflowInstance::new("wf-1");
        let commands = vec![Command::new(
            1,
            CommandAttributes::ScheduleActivity {
                name: "activity1".to_string(),
                version: None,
                input: payload_of(&()),
                attempt: 1,
                start_to_close_timeout: None,
            },
        )];

        let translation = translate_commands(&instance, &commands, Utc::now());

        assert_eq!(translation.executed_events.len(), 1);
        assert_eq!(translation.activity_events.len(), 1);
        assert_eq!(
            translation.executed_events[0].event_type(),
            EventType::ActivityScheduled
        );
        assert_eq!(translation.executed_events[0].schedule_event_id, Some(1));
    }

    #[test]
    fn test_schedule_timer_parks_fired_event_behind_barrier() {
        let instance = WorkflowInstance::new("wf-1");
        let now = Utc::now();
        let fire_at = now + chrono::Duration::seconds(30);
        let commands = vec![Command::new(
            2,
            CommandAttributes::ScheduleTimer { fire_at },
        )];

        let translation = translate_commands(&instance, &commands, now);

        assert_eq!(translation.executed_events.len(), 1);
        assert_eq!(
            translation.executed_events[0].event_type(),
            EventType::TimerScheduled
        );

        assert_eq!(translation.timer_events.len(), 1);
        let fired = &translation.timer_events[0];
        assert_eq!(fired.event_type(), EventType::TimerFired);
        assert_eq!(fired.visible_at, Some(fire_at));
        assert_eq!(fired.timestamp, fire_at);
        assert_eq!(fired.schedule_event_id, Some(2));
    }

    #[test]
    fn test_cancel_timer_correlates_to_the_timer() {
        let instance = WorkflowInstance::new("wf-1");
        let commands = vec![Command::new(
            3,
            CommandAttributes::CancelTimer {
                timer_schedule_event_id: 2,
            },
        )];

        let translation = translate_commands(&instance, &commands, Utc::now());

        assert_eq!(translation.executed_events[0].schedule_event_id, Some(2));
        assert_eq!(
            translation.executed_events[0].event_type(),
            EventType::TimerCanceled
        );
    }

    #[test]
    fn test_sub_workflow_creates_child_with_parent_linkage() {
        let instance = WorkflowInstance::new("parent");
        let commands = vec![Command::new(
            4,
            CommandAttributes::ScheduleSubWorkflow {
                instance_id: "subworkflow-0".to_string(),
                name: "child-wf".to_string(),
                version: None,
                input: payload_of(&[1, 2]),
            },
        )];

        let translation = translate_commands(&instance, &commands, Utc::now());

        assert_eq!(
            translation.executed_events[0].event_type(),
            EventType::SubWorkflowScheduled
        );
        match &translation.messages[0] {
            InstanceMessage::CreateInstance { instance: child, event } => {
                assert_eq!(child.instance_id, "subworkflow-0");
                let parent = child.parent.as_ref().unwrap();
                assert_eq!(parent.instance_id, "parent");
                assert_eq!(parent.schedule_event_id, 4);
                assert_eq!(event.event_type(), EventType::WorkflowExecutionStarted);
            }
            other => panic!("expected create message, got {other:?}"),
        }
    }

    #[test]
    fn test_complete_workflow_notifies_parent() {
        let parent = WorkflowInstance::new("parent");
        let child = WorkflowInstance::sub_workflow("child", &parent, 7);
        let commands = vec![Command::new(
            3,
            CommandAttributes::CompleteWorkflow {
                result: Some(payload_of(&5)),
                error: None,
            },
        )];

        let translation = translate_commands(&child, &commands, Utc::now());

        assert_eq!(
            translation.executed_events[0].event_type(),
            EventType::WorkflowExecutionFinished
        );
        match &translation.messages[0] {
            InstanceMessage::DeliverEvent {
                target_instance_id,
                event,
            } => {
                assert_eq!(target_instance_id, "parent");
                assert_eq!(event.event_type(), EventType::SubWorkflowCompleted);
                assert_eq!(event.schedule_event_id, Some(7));
            }
            other => panic!("expected parent notification, got {other:?}"),
        }
    }

    #[test]
    fn test_failed_sub_workflow_notifies_parent_with_error() {
        let parent = WorkflowInstance::new("parent");
        let child = WorkflowInstance::sub_workflow("child", &parent, 7);
        let commands = vec![Command::new(
            3,
            CommandAttributes::CompleteWorkflow {
                result: None,
                error: Some(WorkflowError::new("boom")),
            },
        )];

        let translation = translate_commands(&child, &commands, Utc::now());

        match &translation.messages[0] {
            InstanceMessage::DeliverEvent { event, .. } => {
                assert_eq!(event.event_type(), EventType::SubWorkflowFailed);
            }
            other => panic!("expected parent notification, got {other:?}"),
        }
    }

    #[test]
    fn test_top_level_completion_produces_no_messages() {
        let instance = WorkflowInstance::new("wf-1");
        let commands = vec![Command::new(
            1,
            CommandAttributes::CompleteWorkflow {
                result: Some(payload_of(&0)),
                error: None,
            },
        )];

        let translation = translate_commands(&instance, &commands, Utc::now());

        assert!(translation.messages.is_empty());
        assert!(translation.activity_events.is_empty());
        assert!(translation.timer_events.is_empty());
    }

    #[test]
    fn test_cancel_sub_workflow_child_copy_has_no_correlation() {
        let instance = WorkflowInstance::new("parent");
        let commands = vec![Command::new(
            5,
            CommandAttributes::CancelSubWorkflow {
                instance_id: "child".to_string(),
            },
        )];

        let translation = translate_commands(&instance, &commands, Utc::now());

        assert_eq!(translation.executed_events[0].schedule_event_id, Some(5));
        match &translation.messages[0] {
            InstanceMessage::DeliverEvent { event, .. } => {
                assert_eq!(event.schedule_event_id, None);
                assert_eq!(
                    event.event_type(),
                    EventType::SubWorkflowCancellationRequested
                );
            }
            other => panic!("expected cancellation message, got {other:?}"),
        }
    }
}
