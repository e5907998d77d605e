// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for tideway-core E2E tests.
//!
//! Provides workers with short poll intervals and helpers that wait on a
//! run's history.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use tideway_core::{
    Client, Engine, EngineOptions, HistoryEvent, HistoryRecord, HistoryStore, InMemoryHistory,
    Worker, WorkerOptions, Workflow, WorkflowRegistry,
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

pub const TASK_QUEUE: &str = "e2e-queue";

/// Upper bound for anything a test waits on.
pub const WAIT: Duration = Duration::from_secs(10);

/// Engine over a fresh in-memory store.
pub fn memory_engine() -> Arc<Engine> {
    memory_engine_over(Arc::new(InMemoryHistory::new()))
}

/// Another engine over an existing store, as a second process would see it.
pub fn memory_engine_over(store: Arc<dyn HistoryStore>) -> Arc<Engine> {
    Arc::new(Engine::new(
        store,
        EngineOptions {
            visibility_timeout: Duration::from_secs(5),
        },
    ))
}

/// Worker options tuned for tests.
pub fn fast_options() -> WorkerOptions {
    WorkerOptions {
        poll_timeout: Duration::from_millis(50),
        sweep_interval: Duration::from_millis(100),
        ..WorkerOptions::new(TASK_QUEUE)
    }
}

/// Client that knows `workflows`, polling results every 10 ms.
pub fn client(engine: Arc<Engine>, workflows: Vec<Arc<dyn Workflow>>) -> Client {
    let mut registry = WorkflowRegistry::new();
    for workflow in workflows {
        registry.register(workflow);
    }
    Client::new(engine, Arc::new(registry)).with_result_poll_interval(Duration::from_millis(10))
}

/// A worker running on a background task.
pub struct RunningWorker {
    shutdown: CancellationToken,
    handle: JoinHandle<tideway_core::Result<()>>,
}

impl RunningWorker {
    pub fn spawn(worker: Worker) -> Self {
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(worker.run(shutdown.clone()));
        Self { shutdown, handle }
    }

    /// Cancel and wait for in-flight tasks to finish.
    pub async fn stop(self) {
        self.shutdown.cancel();
        self.handle
            .await
            .expect("worker task panicked")
            .expect("worker failed");
    }
}

/// Poll the history of `run_id` until `done` accepts it.
pub async fn wait_for_history(
    store: &Arc<dyn HistoryStore>,
    run_id: &str,
    done: impl Fn(&[HistoryRecord]) -> bool,
) -> Vec<HistoryRecord> {
    tokio::time::timeout(WAIT, async {
        loop {
            let history = store.read(run_id, 0).await.expect("read history");
            if done(&history) {
                return history;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("timed out waiting for history")
}

/// Number of events of the given type.
pub fn count(history: &[HistoryRecord], event_type: &str) -> usize {
    history
        .iter()
        .filter(|record| record.event.event_type() == event_type)
        .count()
}

/// Whether a timer has been started.
pub fn has_timer(history: &[HistoryRecord]) -> bool {
    history
        .iter()
        .any(|record| matches!(record.event, HistoryEvent::TimerStarted { .. }))
}
