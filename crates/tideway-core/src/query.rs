// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Read-only queries against a run's current state.
//!
//! A query never appends to history and never schedules work. It is
//! answered from the values the program published with
//! [`WorkflowContext::set_query_state`](crate::WorkflowContext::set_query_state)
//! during the most recent replay. The cached snapshot is used only while the
//! history has not moved past it; otherwise a fresh read-only replay runs.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::RwLock;
use tracing::{debug, instrument};

use crate::error::{CoreError, Result};
use crate::history::HistoryStore;
use crate::runner::WorkflowRunner;

#[derive(Debug, Clone)]
struct Snapshot {
    history_len: u64,
    values: HashMap<String, Value>,
}

/// Query values captured per run, tagged with the history length they
/// were computed from.
#[derive(Debug, Default)]
pub struct QuerySnapshots {
    runs: RwLock<HashMap<String, Snapshot>>,
}

impl QuerySnapshots {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the values from a replay that ended at `history_len`.
    ///
    /// Older snapshots never overwrite newer ones.
    pub async fn record(&self, run_id: &str, history_len: u64, values: HashMap<String, Value>) {
        let mut runs = self.runs.write().await;
        match runs.get(run_id) {
            Some(existing) if existing.history_len > history_len => {}
            _ => {
                runs.insert(
                    run_id.to_string(),
                    Snapshot {
                        history_len,
                        values,
                    },
                );
            }
        }
    }

    /// Cached value and the history length it reflects.
    pub async fn get(&self, run_id: &str, name: &str) -> Option<(u64, Value)> {
        let runs = self.runs.read().await;
        runs.get(run_id).map(|snapshot| {
            (
                snapshot.history_len,
                snapshot.values.get(name).cloned().unwrap_or(Value::Null),
            )
        })
    }

    /// Drop the snapshot of a run.
    pub async fn forget(&self, run_id: &str) {
        self.runs.write().await.remove(run_id);
    }
}

/// Answers queries for runs of registered workflow types.
#[derive(Clone)]
pub struct QueryService {
    store: Arc<dyn HistoryStore>,
    runner: WorkflowRunner,
    snapshots: Arc<QuerySnapshots>,
}

impl QueryService {
    /// Create a query service.
    pub fn new(
        store: Arc<dyn HistoryStore>,
        runner: WorkflowRunner,
        snapshots: Arc<QuerySnapshots>,
    ) -> Self {
        Self {
            store,
            runner,
            snapshots,
        }
    }

    /// Evaluate query `name` against run `run_id`.
    ///
    /// Errors: `RunNotFound` for an unknown run, `QueryNotSupported` when the
    /// workflow type does not declare the query. A declared query the program
    /// has not published yet returns `null`.
    #[instrument(skip(self))]
    pub async fn query(&self, run_id: &str, name: &str) -> Result<Value> {
        let run = self
            .store
            .get_run(run_id)
            .await?
            .ok_or_else(|| CoreError::RunNotFound {
                run_id: run_id.to_string(),
            })?;

        let workflow = self.runner.registry().get(&run.workflow_type).ok_or_else(|| {
            CoreError::WorkflowTypeNotRegistered {
                workflow_type: run.workflow_type.clone(),
            }
        })?;
        if !workflow.queries().iter().any(|query| *query == name) {
            return Err(CoreError::QueryNotSupported {
                workflow_type: run.workflow_type,
                query_name: name.to_string(),
            });
        }

        if let Some((history_len, value)) = self.snapshots.get(run_id, name).await
            && self.store.read(run_id, history_len).await?.is_empty()
        {
            debug!(history_len, "Query answered from snapshot");
            return Ok(value);
        }

        let history = self.store.read(run_id, 0).await?;
        let replay = self.runner.replay(&run, &history)?;
        let value = replay.queries.get(name).cloned().unwrap_or(Value::Null);
        debug!(history_len = replay.history_len, "Query answered by replay");
        self.snapshots
            .record(run_id, replay.history_len, replay.queries)
            .await;
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activity::ActivityOptions;
    use crate::history::{HistoryEvent, InMemoryHistory, NewRun};
    use crate::workflow::{Workflow, WorkflowContext, WorkflowError, WorkflowRegistry};
    use async_trait::async_trait;
    use serde_json::json;

    struct Counter;

    #[async_trait]
    impl Workflow for Counter {
        fn workflow_type(&self) -> &str {
            "counter"
        }

        fn queries(&self) -> &[&'static str] {
            &["count", "never_set"]
        }

        async fn run(&self, ctx: WorkflowContext, _input: Value) -> std::result::Result<Value, WorkflowError> {
            for n in 0..3u64 {
                ctx.set_query_state("count", &n)?;
                ctx.execute_activity("tick", json!(n), ActivityOptions::default())
                    .await
                    .map_err(|f| WorkflowError::application(f.message))?;
            }
            ctx.set_query_state("count", &3u64)?;
            Ok(json!(3))
        }
    }

    async fn setup() -> (Arc<InMemoryHistory>, QueryService, Arc<QuerySnapshots>, String) {
        let store = Arc::new(InMemoryHistory::new());
        let mut registry = WorkflowRegistry::new();
        registry.register(Arc::new(Counter));
        let runner = WorkflowRunner::new(store.clone(), Arc::new(registry));
        let snapshots = Arc::new(QuerySnapshots::new());
        let service = QueryService::new(store.clone(), runner, snapshots.clone());

        let run = store
            .start_run(NewRun {
                workflow_id: "counter-1".to_string(),
                run_id: "run-1".to_string(),
                workflow_type: "counter".to_string(),
                task_queue: "q".to_string(),
                input: Value::Null,
            })
            .await
            .unwrap()
            .run;
        (store, service, snapshots, run.run_id)
    }

    fn tick(n: u64) -> HistoryEvent {
        HistoryEvent::ActivityScheduled {
            activity_type: "tick".to_string(),
            input: json!(n),
            options: ActivityOptions::default(),
        }
    }

    #[tokio::test]
    async fn test_query_replays_when_no_snapshot() {
        let (store, service, _snapshots, run_id) = setup().await;
        store.append(&run_id, tick(0)).await.unwrap();
        store
            .append(
                &run_id,
                HistoryEvent::ActivityCompleted {
                    scheduled_event_id: 2,
                    result: Value::Null,
                },
            )
            .await
            .unwrap();
        store.append(&run_id, tick(1)).await.unwrap();

        assert_eq!(service.query(&run_id, "count").await.unwrap(), json!(1));
        assert_eq!(service.query(&run_id, "never_set").await.unwrap(), Value::Null);

        // Queries are read-only.
        assert_eq!(store.read(&run_id, 0).await.unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_fresh_snapshot_is_used_stale_one_is_not() {
        let (store, service, snapshots, run_id) = setup().await;
        snapshots
            .record(&run_id, 1, HashMap::from([("count".to_string(), json!(42))]))
            .await;
        assert_eq!(service.query(&run_id, "count").await.unwrap(), json!(42));

        store.append(&run_id, tick(0)).await.unwrap();
        assert_eq!(service.query(&run_id, "count").await.unwrap(), json!(0));
    }

    #[tokio::test]
    async fn test_query_errors() {
        let (_store, service, _snapshots, run_id) = setup().await;

        let err = service.query("missing", "count").await.unwrap_err();
        assert_eq!(err.error_code(), "RUN_NOT_FOUND");

        let err = service.query(&run_id, "balance").await.unwrap_err();
        assert_eq!(
            err,
            CoreError::QueryNotSupported {
                workflow_type: "counter".to_string(),
                query_name: "balance".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_snapshots_do_not_go_backwards() {
        let snapshots = QuerySnapshots::new();
        snapshots
            .record("r", 5, HashMap::from([("s".to_string(), json!("new"))]))
            .await;
        snapshots
            .record("r", 3, HashMap::from([("s".to_string(), json!("old"))]))
            .await;
        assert_eq!(snapshots.get("r", "s").await, Some((5, json!("new"))));

        snapshots.forget("r").await;
        assert!(snapshots.get("r", "s").await.is_none());
    }
}
