// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! E2E tests driving workflows through a worker and the client.

mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use common::*;
use serde_json::{Value, json};
use tideway_core::activity::from_fn;
use chrono::Utc;
use tideway_core::{
    ActivityFailure, ActivityOptions, CoreError, Engine, EngineOptions, HistoryEvent, RetryPolicy,
    RetryStrategy, RunStatus, StartWorkflowOptions, Worker, Workflow, WorkflowContext,
    WorkflowError, WorkflowRegistry, WorkflowRunner,
};
use tokio::sync::Notify;

/// Greets, sleeps briefly, and greets again.
struct Greeting;

#[async_trait]
impl Workflow for Greeting {
    fn workflow_type(&self) -> &str {
        "greeting"
    }

    async fn run(&self, ctx: WorkflowContext, input: Value) -> Result<Value, WorkflowError> {
        let name: String = serde_json::from_value(input)?;
        let options = ActivityOptions::new(Duration::from_secs(5));
        let first: String = ctx.call_activity("greet", &name, options.clone()).await?;
        ctx.sleep(Duration::from_millis(20)).await;
        let second: String = ctx.call_activity("greet", &first, options).await?;
        Ok(json!(second))
    }
}

/// Calls `flaky` once and propagates its failure.
struct Flaky;

#[async_trait]
impl Workflow for Flaky {
    fn workflow_type(&self) -> &str {
        "flaky"
    }

    async fn run(&self, ctx: WorkflowContext, _input: Value) -> Result<Value, WorkflowError> {
        let options = ActivityOptions::new(Duration::from_secs(5)).with_retry(RetryPolicy::new(
            2,
            1,
            RetryStrategy::ExponentialBackoff,
        ));
        ctx.execute_activity("flaky", Value::Null, options)
            .await
            .map_err(|failure| WorkflowError::application(failure.message))
    }
}

/// Publishes `progress` before and after a gated activity.
struct Gated;

#[async_trait]
impl Workflow for Gated {
    fn workflow_type(&self) -> &str {
        "gated"
    }

    fn queries(&self) -> &[&'static str] {
        &["progress"]
    }

    async fn run(&self, ctx: WorkflowContext, _input: Value) -> Result<Value, WorkflowError> {
        ctx.set_query_state("progress", &json!({"step": "waiting"}))?;
        ctx.execute_activity("gate", Value::Null, ActivityOptions::new(Duration::from_secs(5)))
            .await
            .map_err(|failure| WorkflowError::application(failure.message))?;
        ctx.set_query_state("progress", &json!({"step": "done"}))?;
        Ok(json!("opened"))
    }
}

/// Sleeps for an hour.
struct Sleeper;

#[async_trait]
impl Workflow for Sleeper {
    fn workflow_type(&self) -> &str {
        "sleeper"
    }

    async fn run(&self, ctx: WorkflowContext, _input: Value) -> Result<Value, WorkflowError> {
        ctx.sleep(Duration::from_secs(3600)).await;
        Ok(Value::Null)
    }
}

fn greet_worker(engine: Arc<Engine>) -> Worker {
    Worker::new(engine, fast_options())
        .register_workflow(Arc::new(Greeting))
        .register_activity(Arc::new(from_fn("greet", |_ctx, input| async move {
            let name: String = serde_json::from_value(input)
                .map_err(|e| ActivityFailure::application(e.to_string()))?;
            Ok(json!(format!("hello {name}")))
        })))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_workflow_completes_with_activities_and_timer() {
    let engine = memory_engine();
    let worker = RunningWorker::spawn(greet_worker(engine.clone()));
    let client = client(engine.clone(), vec![Arc::new(Greeting)]);

    let handle = client
        .start_workflow(
            "greeting",
            StartWorkflowOptions::new("greet-1", TASK_QUEUE),
            json!("ada"),
        )
        .await
        .unwrap();
    assert!(handle.created());

    let result = tokio::time::timeout(WAIT, handle.result()).await.unwrap().unwrap();
    assert_eq!(result, json!("hello hello ada"));

    let run = handle.describe().await.unwrap();
    assert_eq!(run.status, RunStatus::Completed);
    assert!(run.close_time.is_some());

    let history = engine.store().read(handle.run_id(), 0).await.unwrap();
    let types: Vec<&str> = history.iter().map(|r| r.event.event_type()).collect();
    assert_eq!(
        types,
        vec![
            "WorkflowStarted",
            "ActivityScheduled",
            "ActivityCompleted",
            "TimerStarted",
            "TimerFired",
            "ActivityScheduled",
            "ActivityCompleted",
            "WorkflowCompleted",
        ]
    );
    let sequences: Vec<u64> = history.iter().map(|r| r.sequence).collect();
    assert_eq!(sequences, (1..=8).collect::<Vec<u64>>());

    worker.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_exhausted_retries_record_one_failure() {
    let engine = memory_engine();
    let attempts = Arc::new(AtomicU32::new(0));
    let counter = attempts.clone();
    let worker = RunningWorker::spawn(
        Worker::new(engine.clone(), fast_options())
            .register_workflow(Arc::new(Flaky))
            .register_activity(Arc::new(from_fn("flaky", move |_ctx, _input| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err::<Value, _>(ActivityFailure::network("connection refused"))
                }
            }))),
    );
    let client = client(engine.clone(), vec![Arc::new(Flaky)]);

    let handle = client
        .start_workflow("flaky", StartWorkflowOptions::new("flaky-1", TASK_QUEUE), Value::Null)
        .await
        .unwrap();

    let err = tokio::time::timeout(WAIT, handle.result()).await.unwrap().unwrap_err();
    assert!(
        matches!(&err, CoreError::WorkflowFailed { message, .. } if message.contains("connection refused")),
        "unexpected error: {err}"
    );
    assert_eq!(attempts.load(Ordering::SeqCst), 3);

    let history = engine.store().read(handle.run_id(), 0).await.unwrap();
    assert_eq!(count(&history, "ActivityFailed"), 1);
    assert_eq!(count(&history, "ActivityCompleted"), 0);
    let failed = history
        .iter()
        .find_map(|r| match &r.event {
            HistoryEvent::ActivityFailed { attempts, .. } => Some(*attempts),
            _ => None,
        })
        .unwrap();
    assert_eq!(failed, 3);

    worker.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_abandoned_final_attempt_fails_without_running_again() {
    // Schedule the activity without any worker.
    let first = memory_engine();
    let store = first.store().clone();
    let run_id = first
        .start_workflow("flaky", "flaky-lost", TASK_QUEUE, Value::Null)
        .await
        .unwrap()
        .run
        .run_id;
    let mut registry = WorkflowRegistry::new();
    registry.register(Arc::new(Flaky));
    let runner = WorkflowRunner::new(store.clone(), Arc::new(registry));
    first.handle_decision(&runner, &run_id).await.unwrap();

    // A worker process started the third and last attempt, then vanished.
    let expired = Utc::now() - chrono::Duration::seconds(1);
    store.release_activity(&run_id, 2, "vanished", 3, expired).await.unwrap();
    assert_eq!(store.claim_activity(&run_id, 2, "vanished", expired).await.unwrap(), Some(3));

    let second = memory_engine_over(store.clone());
    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();
    let worker = RunningWorker::spawn(
        Worker::new(second.clone(), fast_options())
            .register_workflow(Arc::new(Flaky))
            .register_activity(Arc::new(from_fn("flaky", move |_ctx, _input| {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(Value::Null)
                }
            }))),
    );
    let handle = client(second.clone(), vec![Arc::new(Flaky)])
        .get_workflow_handle("flaky-lost")
        .await
        .unwrap();

    let err = tokio::time::timeout(WAIT, handle.result()).await.unwrap().unwrap_err();
    assert!(
        matches!(&err, CoreError::WorkflowFailed { message, .. } if message.contains("abandoned")),
        "unexpected error: {err}"
    );
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    let history = store.read(&run_id, 0).await.unwrap();
    assert_eq!(count(&history, "ActivityFailed"), 1);
    assert!(history.iter().any(|r| matches!(
        r.event,
        HistoryEvent::ActivityFailed { attempts: 3, .. }
    )));

    worker.stop().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_query_observes_running_workflow() {
    let engine = memory_engine();
    let gate = Arc::new(Notify::new());
    let opened = gate.clone();
    let worker = RunningWorker::spawn(
        Worker::new(engine.clone(), fast_options())
            .register_workflow(Arc::new(Gated))
            .register_activity(Arc::new(from_fn("gate", move |_ctx, _input| {
                let opened = opened.clone();
                async move {
                    opened.notified().await;
                    Ok(Value::Null)
                }
            }))),
    );
    let client = client(engine.clone(), vec![Arc::new(Gated)]);

    let handle = client
        .start_workflow("gated", StartWorkflowOptions::new("gated-1", TASK_QUEUE), Value::Null)
        .await
        .unwrap();
    wait_for_history(engine.store(), handle.run_id(), |h| {
        count(h, "ActivityScheduled") == 1
    })
    .await;

    assert_eq!(handle.query("progress").await.unwrap(), json!({"step": "waiting"}));
    assert!(matches!(
        handle.query("balance").await,
        Err(CoreError::QueryNotSupported { .. })
    ));

    gate.notify_one();
    let result = tokio::time::timeout(WAIT, handle.result()).await.unwrap().unwrap();
    assert_eq!(result, json!("opened"));
    assert_eq!(handle.query("progress").await.unwrap(), json!({"step": "done"}));

    worker.stop().await;
}

#[tokio::test]
async fn test_start_attaches_to_running_run() {
    let engine = memory_engine();
    let client = client(engine.clone(), vec![Arc::new(Sleeper)]);

    let first = client
        .start_workflow("sleeper", StartWorkflowOptions::new("nap", TASK_QUEUE), Value::Null)
        .await
        .unwrap();
    let second = client
        .start_workflow("sleeper", StartWorkflowOptions::new("nap", TASK_QUEUE), Value::Null)
        .await
        .unwrap();
    assert!(first.created());
    assert!(!second.created());
    assert_eq!(first.run_id(), second.run_id());

    let found = client.get_workflow_handle("nap").await.unwrap();
    assert_eq!(found.run_id(), first.run_id());

    assert!(matches!(
        client.get_workflow_handle("missing").await,
        Err(CoreError::WorkflowNotFound { .. })
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cancel_stops_sleeping_workflow() {
    let engine = memory_engine();
    let worker = RunningWorker::spawn(
        Worker::new(engine.clone(), fast_options()).register_workflow(Arc::new(Sleeper)),
    );
    let client = client(engine.clone(), vec![Arc::new(Sleeper)]);

    let handle = client
        .start_workflow("sleeper", StartWorkflowOptions::new("nap", TASK_QUEUE), Value::Null)
        .await
        .unwrap();
    wait_for_history(engine.store(), handle.run_id(), has_timer).await;

    handle.cancel(Some("operator".to_string())).await.unwrap();
    let err = tokio::time::timeout(WAIT, handle.result()).await.unwrap().unwrap_err();
    match err {
        CoreError::WorkflowCancelled { reason, .. } => {
            assert_eq!(reason.as_deref(), Some("operator"))
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(handle.describe().await.unwrap().status, RunStatus::Cancelled);

    assert!(matches!(
        handle.cancel(None).await,
        Err(CoreError::RunClosed { .. })
    ));

    let restarted = client
        .start_workflow("sleeper", StartWorkflowOptions::new("nap", TASK_QUEUE), Value::Null)
        .await
        .unwrap();
    assert!(restarted.created());
    assert_ne!(restarted.run_id(), handle.run_id());

    worker.stop().await;
}

/// Calls `b` where the first version called `a`.
struct Changed;

#[async_trait]
impl Workflow for Changed {
    fn workflow_type(&self) -> &str {
        "evolving"
    }

    async fn run(&self, ctx: WorkflowContext, _input: Value) -> Result<Value, WorkflowError> {
        ctx.execute_activity("b", Value::Null, ActivityOptions::default())
            .await
            .map_err(|failure| WorkflowError::application(failure.message))
    }
}

struct Original;

#[async_trait]
impl Workflow for Original {
    fn workflow_type(&self) -> &str {
        "evolving"
    }

    async fn run(&self, ctx: WorkflowContext, _input: Value) -> Result<Value, WorkflowError> {
        ctx.execute_activity("a", Value::Null, ActivityOptions::default())
            .await
            .map_err(|failure| WorkflowError::application(failure.message))
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_changed_workflow_code_is_reported_as_nondeterminism() {
    let first = memory_engine();
    let store = first.store().clone();
    let worker = RunningWorker::spawn(
        Worker::new(first.clone(), fast_options()).register_workflow(Arc::new(Original)),
    );
    let handle = client(first.clone(), vec![Arc::new(Original)])
        .start_workflow("evolving", StartWorkflowOptions::new("ev-1", TASK_QUEUE), Value::Null)
        .await
        .unwrap();
    wait_for_history(&store, handle.run_id(), |h| count(h, "ActivityScheduled") == 1).await;
    worker.stop().await;

    // A new process over the same history, running the edited program.
    let second = Arc::new(Engine::new(store.clone(), EngineOptions::default()));
    let worker = RunningWorker::spawn(
        Worker::new(second.clone(), fast_options())
            .register_workflow(Arc::new(Changed))
            .register_activity(Arc::new(from_fn("b", |_ctx, _input| async move {
                Ok::<_, ActivityFailure>(Value::Null)
            }))),
    );
    let handle = client(second.clone(), vec![Arc::new(Changed)])
        .get_workflow_handle("ev-1")
        .await
        .unwrap();

    let err = tokio::time::timeout(WAIT, handle.result()).await.unwrap().unwrap_err();
    assert!(matches!(err, CoreError::NonDeterminismDetected { .. }), "unexpected error: {err}");

    let run = handle.describe().await.unwrap();
    assert_eq!(run.status, RunStatus::Running);
    assert!(run.corruption.is_some());
    let history = store.read(handle.run_id(), 0).await.unwrap();
    assert_eq!(history.len(), 2);

    worker.stop().await;
}
