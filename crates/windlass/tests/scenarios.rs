//! End-to-end scenarios driven through the test harness and, for the worker
//! path, through a real worker over the in-memory backend.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use windlass::activity::ActivityError;
use windlass::client::{Client, WorkflowInstanceOptions};
use windlass::history::EventType;
use windlass::prelude::*;
use windlass::testing::{TestError, WorkflowTest, TEST_INSTANCE_ID};

fn event_types(history: &[Event]) -> Vec<EventType> {
    history.iter().map(|e| e.event_type()).collect()
}

fn count_type(history: &[Event], event_type: EventType) -> usize {
    history
        .iter()
        .filter(|e| e.event_type() == event_type)
        .count()
}

#[tokio::test]
async fn hello_world_completes_in_one_task() {
    let mut test = WorkflowTest::new();
    test.register_workflow("hello", |_ctx: WorkflowContext, _input: ()| async move {
        Ok(0i32)
    });

    let result: i32 = test.execute_workflow("hello", &()).await.unwrap();
    assert_eq!(result, 0);

    let history = test.history(TEST_INSTANCE_ID).await.unwrap();
    assert_eq!(
        event_types(&history),
        vec![
            EventType::WorkflowExecutionStarted,
            EventType::WorkflowExecutionFinished,
        ]
    );

    // Sequence IDs are dense and start at 1.
    let sequences: Vec<i64> = history.iter().map(|e| e.sequence_id).collect();
    assert_eq!(sequences, vec![1, 2]);
}

#[tokio::test]
async fn single_activity_success() {
    let mut test = WorkflowTest::new();
    test.register_workflow("single", |ctx: WorkflowContext, _input: ()| async move {
        let value: i32 = ctx.schedule_activity("activity1", &()).await?;
        Ok(value)
    });
    test.mock_activity("activity1", |_input: ()| Ok(23i32));

    let result: i32 = test.execute_workflow("single", &()).await.unwrap();
    assert_eq!(result, 23);

    let history = test.history(TEST_INSTANCE_ID).await.unwrap();
    let scheduled = history
        .iter()
        .find(|e| e.event_type() == EventType::ActivityScheduled)
        .expect("activity must be scheduled");
    let completed = history
        .iter()
        .find(|e| e.event_type() == EventType::ActivityCompleted)
        .expect("activity must complete");

    assert_eq!(completed.schedule_event_id, scheduled.schedule_event_id);
    assert!(scheduled.sequence_id < completed.sequence_id);
}

#[tokio::test]
async fn activity_failure_with_retry() {
    let mut test = WorkflowTest::new();
    test.register_workflow("retrying", |ctx: WorkflowContext, _input: ()| async move {
        let options = ActivityOptions::default()
            .with_retry(RetryPolicy::exponential().with_max_attempts(2));
        let value: i32 = ctx
            .schedule_activity_with_options(options, "activity1", &())
            .await?;
        Ok(value)
    });

    let mut calls = 0;
    test.mock_activity("activity1", move |_input: ()| {
        calls += 1;
        if calls == 1 {
            Err(ActivityError::retryable("transient failure"))
        } else {
            Ok(42i32)
        }
    });

    let result: i32 = test.execute_workflow("retrying", &()).await.unwrap();
    assert_eq!(result, 42);

    let history = test.history(TEST_INSTANCE_ID).await.unwrap();
    assert_eq!(count_type(&history, EventType::ActivityScheduled), 2);
    assert_eq!(count_type(&history, EventType::ActivityFailed), 1);
    assert_eq!(count_type(&history, EventType::ActivityCompleted), 1);

    // The attempts are separated by a backoff timer.
    assert_eq!(count_type(&history, EventType::TimerScheduled), 1);
    assert_eq!(count_type(&history, EventType::TimerFired), 1);

    // Every result event correlates to exactly one earlier schedule event.
    for event in &history {
        let correlated = matches!(
            event.event_type(),
            EventType::ActivityCompleted | EventType::ActivityFailed | EventType::TimerFired
        );
        if correlated {
            let schedule_id = event.schedule_event_id.expect("result must correlate");
            let earlier: Vec<_> = history
                .iter()
                .filter(|s| {
                    s.sequence_id < event.sequence_id
                        && s.schedule_event_id == Some(schedule_id)
                        && matches!(
                            s.event_type(),
                            EventType::ActivityScheduled | EventType::TimerScheduled
                        )
                })
                .collect();
            assert_eq!(earlier.len(), 1, "{:?} must have one schedule event", event);
        }
    }
}

#[tokio::test]
async fn two_sequential_timers_advance_the_logical_clock() {
    let mut test = WorkflowTest::new();
    test.register_workflow("timers", |ctx: WorkflowContext, _input: ()| async move {
        let t1 = ctx.now();
        ctx.schedule_timer(Duration::from_secs(30)).await?;
        let t2 = ctx.now();
        ctx.schedule_timer(Duration::from_secs(30)).await?;
        Ok((t1, t2))
    });

    let t0 = test.start_time();
    let (t1, t2): (DateTime<Utc>, DateTime<Utc>) =
        test.execute_workflow("timers", &()).await.unwrap();

    assert_eq!(t1, t0);
    assert_eq!(t2, t0 + chrono::Duration::seconds(30));
    assert_eq!(test.now(), t0 + chrono::Duration::seconds(60));
}

#[tokio::test]
async fn canceled_timer_never_fires_and_clock_stays_put() {
    let mut test = WorkflowTest::new();
    test.register_workflow("canceler", |ctx: WorkflowContext, _input: ()| async move {
        let timer = ctx.schedule_timer(Duration::from_secs(30));
        ctx.cancel_timer(&timer);
        Ok(ctx.now())
    });

    let t0 = test.start_time();
    let result: DateTime<Utc> = test.execute_workflow("canceler", &()).await.unwrap();

    assert_eq!(result, t0);
    assert_eq!(test.now(), t0, "mock clock must not advance");

    let history = test.history(TEST_INSTANCE_ID).await.unwrap();
    assert_eq!(count_type(&history, EventType::TimerScheduled), 1);
    assert_eq!(count_type(&history, EventType::TimerCanceled), 1);
    assert_eq!(count_type(&history, EventType::TimerFired), 0);
}

#[tokio::test]
async fn signal_received_after_five_seconds() {
    let mut test = WorkflowTest::new();
    test.register_workflow("waiter", |ctx: WorkflowContext, _input: ()| async move {
        let greetings = ctx.signal_channel::<String>("greeting");
        greetings.receive().await
    });
    test.signal_after(Duration::from_secs(5), "greeting", &"s42")
        .unwrap();

    let t0 = test.start_time();
    let result: String = test.execute_workflow("waiter", &()).await.unwrap();

    assert_eq!(result, "s42");
    assert_eq!(test.now(), t0 + chrono::Duration::seconds(5));
}

#[tokio::test]
async fn parent_exits_without_waiting_for_sub_workflows() {
    let mut test = WorkflowTest::new();
    test.register_workflow("parent", |ctx: WorkflowContext, _input: ()| async move {
        for i in 0..2 {
            let _pending: WorkflowFuture<i64> = ctx.schedule_sub_workflow(
                &format!("subworkflow-{i}"),
                "summer",
                &vec![i as i64, 10],
            );
        }
        Ok(())
    });
    test.register_workflow("summer", |_ctx: WorkflowContext, input: Vec<i64>| async move {
        Ok(input.iter().sum::<i64>())
    });

    test.execute_workflow::<_, ()>("parent", &()).await.unwrap();

    let history = test.history(TEST_INSTANCE_ID).await.unwrap();
    assert_eq!(count_type(&history, EventType::SubWorkflowScheduled), 2);
    // The parent never observed its children.
    assert_eq!(count_type(&history, EventType::SubWorkflowCompleted), 0);

    // Both children were created with parent linkage and ran to completion
    // on their own, after the parent already finished.
    let backend = test.backend();
    for i in 0..2i64 {
        let state = backend
            .get_workflow_instance_state(&format!("subworkflow-{i}"))
            .await
            .unwrap();
        assert!(state.instance.is_sub_workflow());
        assert!(state.status.is_terminal());

        let payload = state.result.expect("child should record its sum");
        let sum: i64 = windlass::payload::decode(&JsonConverter, &payload).unwrap();
        assert_eq!(sum, i + 10);
    }
}

#[tokio::test]
async fn parent_awaits_sub_workflow_result() {
    let mut test = WorkflowTest::new();
    test.register_workflow("parent", |ctx: WorkflowContext, _input: ()| async move {
        let sum: i64 = ctx
            .schedule_sub_workflow("child-1", "summer", &vec![20i64, 3])
            .await?;
        Ok(sum)
    });
    test.register_workflow("summer", |_ctx: WorkflowContext, input: Vec<i64>| async move {
        Ok(input.iter().sum::<i64>())
    });

    let result: i64 = test.execute_workflow("parent", &()).await.unwrap();
    assert_eq!(result, 23);

    let history = test.history(TEST_INSTANCE_ID).await.unwrap();
    let scheduled = history
        .iter()
        .find(|e| e.event_type() == EventType::SubWorkflowScheduled)
        .unwrap();
    let completed = history
        .iter()
        .find(|e| e.event_type() == EventType::SubWorkflowCompleted)
        .unwrap();
    assert_eq!(completed.schedule_event_id, scheduled.schedule_event_id);
}

#[tokio::test]
async fn select_prefers_whatever_is_ready_first() {
    let mut test = WorkflowTest::new();
    test.register_workflow("racer", |ctx: WorkflowContext, _input: ()| async move {
        let timer = ctx.schedule_timer(Duration::from_secs(30));
        let approvals = ctx.signal_channel::<String>("approval");

        let outcome = select()
            .future(timer, |_| "timed-out".to_string())
            .signal(&approvals, |signal| {
                signal.unwrap_or_else(|_| "bad-signal".to_string())
            })
            .await;
        Ok(outcome)
    });
    test.signal_after(Duration::from_secs(5), "approval", &"granted")
        .unwrap();

    let t0 = test.start_time();
    let result: String = test.execute_workflow("racer", &()).await.unwrap();

    assert_eq!(result, "granted");
    assert_eq!(test.now(), t0 + chrono::Duration::seconds(5));
}

#[tokio::test]
async fn canceling_a_sub_workflow_rejects_its_pending_futures() {
    let mut test = WorkflowTest::new();
    test.register_workflow("parent", |ctx: WorkflowContext, _input: ()| async move {
        let child: WorkflowFuture<()> = ctx.schedule_sub_workflow("child-1", "napper", &());
        ctx.cancel_sub_workflow(&child);

        match child.await {
            Err(error) if error.is_canceled() => Ok("child-canceled".to_string()),
            Err(error) => Ok(format!("child-failed: {error}")),
            Ok(()) => Ok("child-finished".to_string()),
        }
    });
    test.register_workflow("napper", |ctx: WorkflowContext, _input: ()| async move {
        ctx.schedule_timer(Duration::from_secs(3600)).await?;
        Ok(())
    });

    let t0 = test.start_time();
    let result: String = test.execute_workflow("parent", &()).await.unwrap();

    assert_eq!(result, "child-canceled");
    assert_eq!(test.now(), t0, "the child's timer must never fire");

    let history = test.history(TEST_INSTANCE_ID).await.unwrap();
    assert_eq!(
        count_type(&history, EventType::SubWorkflowCancellationRequested),
        1
    );
    assert_eq!(count_type(&history, EventType::SubWorkflowFailed), 1);
}

#[tokio::test]
async fn cancellation_surfaces_as_rejected_futures() {
    let mut test = WorkflowTest::new();
    test.register_workflow("sleeper", |ctx: WorkflowContext, _input: ()| async move {
        ctx.schedule_timer(Duration::from_secs(3600)).await?;
        Ok(())
    });
    test.cancel_after(Duration::from_secs(5));

    let result: Result<(), _> = test.execute_workflow("sleeper", &()).await;
    match result {
        Err(TestError::WorkflowFailed(error)) => assert!(error.is_canceled()),
        other => panic!("expected canceled workflow, got {other:?}"),
    }
}

#[tokio::test]
async fn side_effect_runs_once_across_replays() {
    let mut test = WorkflowTest::new();
    test.register_workflow("sider", |ctx: WorkflowContext, _input: ()| async move {
        // The side effect runs before the activity forces a second task, so
        // replay must return the recorded value instead of re-running it.
        let drawn: i32 = ctx.side_effect(|| 17).await?;
        let doubled: i32 = ctx.schedule_activity("double", &drawn).await?;
        Ok(doubled)
    });
    test.mock_activity("double", |n: i32| Ok(n * 2));

    let result: i32 = test.execute_workflow("sider", &()).await.unwrap();
    assert_eq!(result, 34);

    let history = test.history(TEST_INSTANCE_ID).await.unwrap();
    assert_eq!(count_type(&history, EventType::SideEffectResult), 1);
}

#[test_log::test(tokio::test)]
async fn worker_executes_workflow_end_to_end() {
    let mut registry = Registry::new();
    registry.add_workflow("pipeline", |ctx: WorkflowContext, input: i64| async move {
        let doubled: i64 = ctx.schedule_activity("double", &input).await?;
        let tripled: i64 = ctx.schedule_activity("triple", &doubled).await?;
        Ok(tripled)
    });
    registry.add_activity("double", |_ctx: ActivityContext, n: i64| async move {
        Ok::<_, ActivityError>(n * 2)
    });
    registry.add_activity("triple", |_ctx: ActivityContext, n: i64| async move {
        Ok::<_, ActivityError>(n * 3)
    });

    let backend = Arc::new(InMemoryBackend::new());
    let options = WorkerOptions::default()
        .with_workflow_poll_interval(Duration::from_millis(50))
        .with_activity_poll_interval(Duration::from_millis(50));
    let worker = Worker::new(backend.clone(), Arc::new(registry), options);
    worker.start().await.unwrap();

    let client = Client::new(backend.clone());
    client
        .create_workflow_instance(WorkflowInstanceOptions::new("pipeline-1", "pipeline"), &7)
        .await
        .unwrap();

    let result: i64 = client
        .get_workflow_result("pipeline-1", Duration::from_secs(10))
        .await
        .unwrap();
    assert_eq!(result, 42);

    let history = backend.get_workflow_history("pipeline-1").await.unwrap();
    assert_eq!(count_type(&history, EventType::ActivityScheduled), 2);
    assert_eq!(count_type(&history, EventType::ActivityCompleted), 2);

    // Histories are append-only with dense, strictly increasing sequences.
    for (index, event) in history.iter().enumerate() {
        assert_eq!(event.sequence_id, index as i64 + 1);
    }

    worker.shutdown().await;
}

#[tokio::test]
async fn worker_surfaces_workflow_failures_to_the_client() {
    let mut registry = Registry::new();
    registry.add_workflow("doomed", |ctx: WorkflowContext, _input: ()| async move {
        let _: i64 = ctx.schedule_activity("explode", &()).await?;
        Ok(0i64)
    });
    registry.add_activity("explode", |_ctx: ActivityContext, _input: ()| async move {
        Err::<i64, _>(ActivityError::non_retryable("boom"))
    });

    let backend = Arc::new(InMemoryBackend::new());
    let options = WorkerOptions::default()
        .with_workflow_poll_interval(Duration::from_millis(50))
        .with_activity_poll_interval(Duration::from_millis(50));
    let worker = Worker::new(backend.clone(), Arc::new(registry), options);
    worker.start().await.unwrap();

    let client = Client::new(backend.clone());
    client
        .create_workflow_instance(WorkflowInstanceOptions::new("doomed-1", "doomed"), &())
        .await
        .unwrap();

    let result: Result<i64, _> = client
        .get_workflow_result("doomed-1", Duration::from_secs(10))
        .await;
    match result {
        Err(ClientError::WorkflowFailed(error)) => assert_eq!(error.message, "boom"),
        other => panic!("expected workflow failure, got {other:?}"),
    }

    worker.shutdown().await;
}

#[tokio::test]
async fn signaling_a_finished_workflow_fails() {
    let mut test = WorkflowTest::new();
    test.register_workflow("quick", |_ctx: WorkflowContext, _input: ()| async move {
        Ok(())
    });
    test.execute_workflow::<_, ()>("quick", &()).await.unwrap();

    let backend: Arc<dyn Backend> = test.backend();
    let client = Client::new(backend);
    let result = client.signal_workflow(TEST_INSTANCE_ID, "late", &()).await;
    assert!(matches!(
        result,
        Err(ClientError::Backend(BackendError::InstanceTerminal(_)))
    ));
}
