//! Activity worker loops
//!
//! Mirrors the workflow worker: a poll loop leases activity tasks, a
//! dispatch loop runs them through the [`ActivityExecutor`] under bounded
//! concurrency. Leases are renewed on an interval and immediately on every
//! explicit heartbeat from the activity.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::activity::ActivityExecutor;
use crate::backend::{ActivityTask, Backend, BackendError};
use crate::worker::WorkerOptions;

/// Spawn the poll and dispatch loops; returns their join handles.
pub(crate) fn start(
    backend: Arc<dyn Backend>,
    executor: Arc<ActivityExecutor>,
    options: WorkerOptions,
    shutdown_rx: watch::Receiver<bool>,
) -> Vec<JoinHandle<()>> {
    let (task_tx, task_rx) = mpsc::channel::<ActivityTask>(options.max_concurrent_activity_tasks);

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
    task_tx: mpsc::Sender<ActivityTask>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        if *shutdown_rx.borrow() {
            break;
        }

        tokio::select! {
            _ = shutdown_rx.changed() => break,
            polled = backend.get_activity_task(options.activity_poll_interval) => match polled {
                Ok(Some(task)) => {
                    if task_tx.send(task).await.is_err() {
                        break;
                    }
                }
                Ok(None) => {}
                Err(err) => {
                    warn!("activity poll failed: {err}");
                    let jitter = rand::thread_rng()
                        .gen_range(0..=options.activity_poll_interval.as_millis() as u64);
                    tokio::time::sleep(
                        options.activity_poll_interval + Duration::from_millis(jitter),
                    )
                    .await;
                }
            }
        }
    }

    debug!("activity poll loop exited");
}

async fn dispatch_loop(
    backend: Arc<dyn Backend>,
    executor: Arc<ActivityExecutor>,
    options: WorkerOptions,
    mut task_rx: mpsc::Receiver<ActivityTask>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let slots = Arc::new(Semaphore::new(options.max_concurrent_activity_tasks));

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
                    process_activity_task(backend, executor, heartbeat_interval, task).await;
                    drop(permit);
                });
            }
        }
    }

    debug!("activity dispatch loop exited");
}

async fn process_activity_task(
    backend: Arc<dyn Backend>,
    executor: Arc<ActivityExecutor>,
    heartbeat_interval: Duration,
    task: ActivityTask,
) {
    let (heartbeat_tx, mut heartbeat_rx) = mpsc::channel::<()>(8);
    let (lease_lost_tx, lease_lost_rx) = watch::channel(false);

    let lease_backend = Arc::clone(&backend);
    let lease_task = task.clone();
    let lease_keeper = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(heartbeat_interval);
        ticker.tick().await; // the lease is fresh
        loop {
            let renew = tokio::select! {
                _ = ticker.tick() => true,
                received = heartbeat_rx.recv() => received.is_some(),
            };
            if !renew {
                break;
            }
            if let Err(err) = lease_backend.extend_activity_task_lease(&lease_task).await {
                warn!(
                    task_id = %lease_task.id,
                    "activity lease renewal failed: {err}"
                );
                let _ = lease_lost_tx.send(true);
                break;
            }
        }
    });

    let result_event = executor.execute(&task, Some(heartbeat_tx)).await;

    if *lease_lost_rx.borrow() {
        // The task will be redelivered; this result is dropped on the floor.
        warn!(task_id = %task.id, "lease lost during activity; dropping result");
    } else {
        match backend.complete_activity_task(&task, result_event).await {
            Ok(()) => debug!(task_id = %task.id, "activity task committed"),
            Err(BackendError::LeaseLost(_)) => {
                warn!(task_id = %task.id, "lease lost at commit; task will be redelivered");
            }
            Err(err) => error!(task_id = %task.id, "failed to complete activity task: {err}"),
        }
    }

    lease_keeper.abort();
}
