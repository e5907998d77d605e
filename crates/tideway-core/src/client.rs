// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Client façade: start runs, wait for results, query and cancel.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, instrument};

use crate::engine::Engine;
use crate::error::{CoreError, Result};
use crate::history::{RunStatus, WorkflowRun};
use crate::query::QueryService;
use crate::runner::WorkflowRunner;
use crate::workflow::WorkflowRegistry;

const DEFAULT_RESULT_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Where and under which ID a run is started.
#[derive(Debug, Clone)]
pub struct StartWorkflowOptions {
    /// Caller-chosen workflow ID. At most one RUNNING run exists per ID.
    pub workflow_id: String,
    /// Queue the run's tasks are dispatched on.
    pub task_queue: String,
}

impl StartWorkflowOptions {
    /// Options for `workflow_id` on `task_queue`.
    pub fn new(workflow_id: impl Into<String>, task_queue: impl Into<String>) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            task_queue: task_queue.into(),
        }
    }
}

/// Entry point for applications driving workflows.
#[derive(Clone)]
pub struct Client {
    engine: Arc<Engine>,
    queries: QueryService,
    result_poll_interval: Duration,
}

impl Client {
    /// Create a client. `registry` supplies the workflow definitions used to
    /// answer queries.
    pub fn new(engine: Arc<Engine>, registry: Arc<WorkflowRegistry>) -> Self {
        let runner = WorkflowRunner::new(engine.store().clone(), registry);
        let queries = QueryService::new(engine.store().clone(), runner, engine.snapshots().clone());
        Self {
            engine,
            queries,
            result_poll_interval: DEFAULT_RESULT_POLL_INTERVAL,
        }
    }

    /// Change how often [`WorkflowHandle::result`] checks the store.
    pub fn with_result_poll_interval(mut self, interval: Duration) -> Self {
        self.result_poll_interval = interval;
        self
    }

    /// Start a run, or attach to the RUNNING run that already owns the
    /// workflow ID.
    pub async fn start_workflow(
        &self,
        workflow_type: &str,
        options: StartWorkflowOptions,
        input: Value,
    ) -> Result<WorkflowHandle> {
        let outcome = self
            .engine
            .start_workflow(workflow_type, &options.workflow_id, &options.task_queue, input)
            .await?;
        Ok(WorkflowHandle {
            client: self.clone(),
            workflow_id: outcome.run.workflow_id,
            run_id: outcome.run.run_id,
            created: outcome.created,
        })
    }

    /// Handle to the RUNNING run for `workflow_id`, else its latest run.
    pub async fn get_workflow_handle(&self, workflow_id: &str) -> Result<WorkflowHandle> {
        let run = self
            .engine
            .store()
            .find_run(workflow_id)
            .await?
            .ok_or_else(|| CoreError::WorkflowNotFound {
                workflow_id: workflow_id.to_string(),
            })?;
        Ok(WorkflowHandle {
            client: self.clone(),
            workflow_id: run.workflow_id,
            run_id: run.run_id,
            created: false,
        })
    }
}

/// A handle to one run.
#[derive(Clone)]
pub struct WorkflowHandle {
    client: Client,
    workflow_id: String,
    run_id: String,
    created: bool,
}

impl std::fmt::Debug for WorkflowHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowHandle")
            .field("workflow_id", &self.workflow_id)
            .field("run_id", &self.run_id)
            .field("created", &self.created)
            .finish()
    }
}

impl WorkflowHandle {
    /// The workflow ID.
    pub fn workflow_id(&self) -> &str {
        &self.workflow_id
    }

    /// The run ID.
    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    /// False when the start attached to an existing run.
    pub fn created(&self) -> bool {
        self.created
    }

    /// Current state of the run.
    pub async fn describe(&self) -> Result<WorkflowRun> {
        self.client
            .engine
            .store()
            .get_run(&self.run_id)
            .await?
            .ok_or_else(|| CoreError::RunNotFound {
                run_id: self.run_id.clone(),
            })
    }

    /// Wait for the run to close and return its result.
    ///
    /// Errors: `WorkflowFailed`, `WorkflowCancelled`, or
    /// `NonDeterminismDetected` when the run was flagged as corrupted.
    #[instrument(skip(self), fields(workflow_id = %self.workflow_id, run_id = %self.run_id))]
    pub async fn result(&self) -> Result<Value> {
        loop {
            let run = self.describe().await?;
            if let Some(details) = run.corruption {
                return Err(CoreError::NonDeterminismDetected {
                    run_id: run.run_id,
                    details,
                });
            }
            match run.status {
                RunStatus::Running => {
                    tokio::time::sleep(self.client.result_poll_interval).await;
                }
                RunStatus::Completed => {
                    debug!("Run completed");
                    return Ok(run.result.unwrap_or(Value::Null));
                }
                RunStatus::Failed => {
                    return Err(CoreError::WorkflowFailed {
                        workflow_id: run.workflow_id,
                        run_id: run.run_id,
                        message: run.error.unwrap_or_default(),
                    });
                }
                RunStatus::Cancelled => {
                    return Err(CoreError::WorkflowCancelled {
                        workflow_id: run.workflow_id,
                        run_id: run.run_id,
                        reason: run.error,
                    });
                }
            }
        }
    }

    /// Evaluate a registered query against the run.
    pub async fn query(&self, name: &str) -> Result<Value> {
        self.client.queries.query(&self.run_id, name).await
    }

    /// Ask the run to stop. Fails with `RunClosed` if it already finished.
    pub async fn cancel(&self, reason: Option<String>) -> Result<()> {
        self.client.engine.request_cancel(&self.run_id, reason).await
    }
}
