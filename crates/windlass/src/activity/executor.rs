//! Activity execution
//!
//! Turns a leased activity task into its result event: looks up the
//! registered function, runs it under the configured timeout, and converts
//! the outcome into `ActivityCompleted`/`ActivityFailed`.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, instrument};

use super::{ActivityContext, ActivityError};
use crate::backend::ActivityTask;
use crate::clock::Clock;
use crate::history::{Event, EventAttributes};
use crate::payload::Converter;
use crate::registry::Registry;

/// Executes registered activity functions.
pub struct ActivityExecutor {
    registry: Arc<Registry>,
    converter: Arc<dyn Converter>,
    clock: Arc<dyn Clock>,
}

impl ActivityExecutor {
    /// Create a new activity executor
    pub fn new(
        registry: Arc<Registry>,
        converter: Arc<dyn Converter>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            registry,
            converter,
            clock,
        }
    }

    /// Execute one activity task and build its result event.
    ///
    /// Never fails: every outcome (including unknown activities and
    /// timeouts) becomes a durable result event correlated to the
    /// scheduling command.
    #[instrument(skip_all, fields(instance = %task.instance.instance_id, task_id = %task.id))]
    pub async fn execute(
        &self,
        task: &ActivityTask,
        heartbeat_tx: Option<mpsc::Sender<()>>,
    ) -> Event {
        let schedule_event_id = task.schedule_event.schedule_event_id.unwrap_or_default();

        let result = match &task.schedule_event.attributes {
            EventAttributes::ActivityScheduled {
                name,
                version,
                input,
                attempt,
                start_to_close_timeout,
            } => {
                let mut ctx =
                    ActivityContext::new(task.id, task.instance.clone(), name.clone(), *attempt);
                if let Some(tx) = heartbeat_tx {
                    ctx = ctx.with_heartbeat(tx);
                }

                match self.registry.activity(name, version.as_deref()) {
                    Ok(invoker) => {
                        debug!(activity = %name, attempt, "executing activity");
                        let future = invoker(ctx, Arc::clone(&self.converter), input.clone());
                        match start_to_close_timeout {
                            Some(limit) => match tokio::time::timeout(*limit, future).await {
                                Ok(result) => result,
                                Err(_) => Err(ActivityError::retryable(format!(
                                    "activity timed out after {limit:?}"
                                ))
                                .with_type("timeout")),
                            },
                            None => future.await,
                        }
                    }
                    Err(err) => Err(ActivityError::non_retryable(err.to_string())
                        .with_type("activity_not_registered")),
                }
            }
            other => Err(ActivityError::non_retryable(format!(
                "activity task carries {} instead of activity_scheduled",
                other.event_type()
            ))),
        };

        let attributes = match result {
            Ok(payload) => EventAttributes::ActivityCompleted { result: payload },
            Err(error) => EventAttributes::ActivityFailed { error },
        };

        Event::new(self.clock.now(), attributes).with_schedule_event_id(schedule_event_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::WallClock;
    use crate::history::EventType;
    use crate::instance::WorkflowInstance;
    use crate::payload::{decode, encode, JsonConverter};
    use chrono::Utc;
    use std::time::Duration;
    use uuid::Uuid;

    fn executor(registry: Registry) -> ActivityExecutor {
        ActivityExecutor::new(
            Arc::new(registry),
            Arc::new(JsonConverter),
            Arc::new(WallClock),
        )
    }

    fn activity_task(name: &str, input: i64, timeout: Option<Duration>) -> ActivityTask {
        ActivityTask {
            id: Uuid::now_v7(),
            instance: WorkflowInstance::new("wf-1"),
            schedule_event: Event::new(
                Utc::now(),
                EventAttributes::ActivityScheduled {
                    name: name.to_string(),
                    version: None,
                    input: encode(&JsonConverter, &input).unwrap(),
                    attempt: 1,
                    start_to_close_timeout: timeout,
                },
            )
            .with_schedule_event_id(4),
            lease_token: Uuid::now_v7(),
        }
    }

    #[tokio::test]
    async fn test_successful_activity_produces_completed_event() {
        let mut registry = Registry::new();
        registry.add_activity("double", |_ctx: ActivityContext, n: i64| async move {
            Ok::<_, ActivityError>(n * 2)
        });

        let event = executor(registry)
            .execute(&activity_task("double", 21, None), None)
            .await;

        assert_eq!(event.event_type(), EventType::ActivityCompleted);
        assert_eq!(event.schedule_event_id, Some(4));
        match &event.attributes {
            EventAttributes::ActivityCompleted { result } => {
                let value: i64 = decode(&JsonConverter, result).unwrap();
                assert_eq!(value, 42);
            }
            other => panic!("expected completion, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_failed_activity_produces_failed_event() {
        let mut registry = Registry::new();
        registry.add_activity("boom", |_ctx: ActivityContext, _n: i64| async move {
            Err::<i64, _>(ActivityError::retryable("kaboom"))
        });

        let event = executor(registry)
            .execute(&activity_task("boom", 1, None), None)
            .await;

        match &event.attributes {
            EventAttributes::ActivityFailed { error } => {
                assert_eq!(error.message, "kaboom");
                assert!(error.retryable);
            }
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unregistered_activity_fails_permanently() {
        let event = executor(Registry::new())
            .execute(&activity_task("missing", 1, None), None)
            .await;

        match &event.attributes {
            EventAttributes::ActivityFailed { error } => {
                assert!(!error.retryable);
                assert_eq!(error.error_type.as_deref(), Some("activity_not_registered"));
            }
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_to_close_timeout_fails_the_attempt() {
        let mut registry = Registry::new();
        registry.add_activity("slow", |_ctx: ActivityContext, _n: i64| async move {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok::<_, ActivityError>(0i64)
        });

        let event = executor(registry)
            .execute(
                &activity_task("slow", 1, Some(Duration::from_millis(50))),
                None,
            )
            .await;

        match &event.attributes {
            EventAttributes::ActivityFailed { error } => {
                assert!(error.retryable);
                assert_eq!(error.error_type.as_deref(), Some("timeout"));
            }
            other => panic!("expected timeout failure, got {other:?}"),
        }
    }
}
