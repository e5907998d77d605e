// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Worker bootstrap: binds registrations to a task queue and drives leased
//! tasks through a bounded pool of slots.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::activity::{Activity, ActivityExecutor, ActivityFailure, ActivityResult, ActivityTask};
use crate::config::Config;
use crate::dispatcher::{Lease, Task, WorkerBinding, millis};
use crate::engine::Engine;
use crate::error::Result;
use crate::runner::WorkflowRunner;
use crate::workflow::{Workflow, WorkflowRegistry};

/// Worker tuning.
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    /// Queue to poll.
    pub task_queue: String,
    /// Tasks handled concurrently.
    pub slots: usize,
    /// How long one poll waits for a task.
    pub poll_timeout: Duration,
    /// Interval between recovery sweeps.
    pub sweep_interval: Duration,
    /// Closed runs older than this are purged during sweeps.
    pub retention: Option<chrono::Duration>,
}

impl WorkerOptions {
    /// Defaults for `task_queue`.
    pub fn new(task_queue: impl Into<String>) -> Self {
        Self {
            task_queue: task_queue.into(),
            slots: 4,
            poll_timeout: Duration::from_secs(5),
            sweep_interval: Duration::from_secs(2),
            retention: None,
        }
    }
}

impl From<&Config> for WorkerOptions {
    fn from(config: &Config) -> Self {
        Self {
            task_queue: config.task_queue.clone(),
            slots: config.worker_slots,
            poll_timeout: config.poll_timeout,
            sweep_interval: config.sweep_interval,
            retention: config.retention,
        }
    }
}

/// A worker process attached to one task queue.
pub struct Worker {
    engine: Arc<Engine>,
    options: WorkerOptions,
    workflows: WorkflowRegistry,
    activities: ActivityExecutor,
}

impl Worker {
    /// Create a worker with no registrations.
    pub fn new(engine: Arc<Engine>, options: WorkerOptions) -> Self {
        Self {
            engine,
            options,
            workflows: WorkflowRegistry::new(),
            activities: ActivityExecutor::new(),
        }
    }

    /// Handle decision and timer tasks for this workflow type.
    pub fn register_workflow(mut self, workflow: Arc<dyn Workflow>) -> Self {
        self.workflows.register(workflow);
        self
    }

    /// Handle activity tasks for this activity type.
    pub fn register_activity(mut self, activity: Arc<dyn Activity>) -> Self {
        self.activities.register(activity);
        self
    }

    /// The task types this worker accepts.
    pub fn binding(&self) -> WorkerBinding {
        let binding = self
            .workflows
            .workflow_types()
            .fold(WorkerBinding::new(self.options.task_queue.clone()), |b, t| {
                b.with_workflow(t)
            });
        self.activities
            .activity_types()
            .fold(binding, |b, t| b.with_activity(t))
    }

    /// Poll and handle tasks until `shutdown` is cancelled, then wait for
    /// in-flight tasks.
    ///
    /// Starts with a recovery sweep so runs left over from a previous
    /// process continue.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let binding = self.binding();
        let options = self.options;
        let engine = self.engine;
        let handler = Arc::new(TaskHandler {
            runner: WorkflowRunner::new(engine.store().clone(), Arc::new(self.workflows)),
            activities: self.activities,
            engine: engine.clone(),
        });

        info!(
            task_queue = %options.task_queue,
            slots = options.slots,
            "Worker started"
        );
        engine.recover(&options.task_queue).await?;

        let slots = Arc::new(Semaphore::new(options.slots.max(1)));
        let mut in_flight = JoinSet::new();
        let mut sweep = tokio::time::interval(options.sweep_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
        sweep.tick().await;

        loop {
            while let Some(joined) = in_flight.try_join_next() {
                if let Err(e) = joined {
                    error!(error = %e, "Task handler aborted");
                }
            }

            let permit = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                permit = slots.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = sweep.tick() => {
                    sweep_once(&engine, &options).await;
                }
                lease = engine.dispatcher().poll(&binding, options.poll_timeout) => {
                    if let Some(lease) = lease {
                        let handler = handler.clone();
                        in_flight.spawn(async move {
                            handler.handle(lease).await;
                            drop(permit);
                        });
                    }
                }
            }
        }

        info!(in_flight = in_flight.len(), "Worker shutting down");
        while let Some(joined) = in_flight.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Task handler aborted");
            }
        }
        info!("Worker stopped");
        Ok(())
    }
}

async fn sweep_once(engine: &Engine, options: &WorkerOptions) {
    if let Err(e) = engine.recover(&options.task_queue).await {
        error!(error = %e, "Recovery sweep failed");
    }
    if let Some(retention) = options.retention
        && let Err(e) = engine.purge_expired(retention).await
    {
        error!(error = %e, "Retention purge failed");
    }
}

struct TaskHandler {
    engine: Arc<Engine>,
    runner: WorkflowRunner,
    activities: ActivityExecutor,
}

impl TaskHandler {
    /// Handle one lease. On error the lease is left to expire and the task
    /// is redelivered.
    async fn handle(&self, lease: Lease) {
        let kind = lease.task.kind();
        let run_id = lease.task.run().run_id.clone();

        let outcome = match lease.task.clone() {
            Task::Decision { run } => self.engine.handle_decision(&self.runner, &run.run_id).await,
            Task::Timer { run, timer_id } => self.engine.fire_timer(&run, timer_id).await,
            Task::Activity(task) => return self.handle_activity(lease, task).await,
        };

        match outcome {
            Ok(()) => {
                self.engine.dispatcher().ack(&lease).await;
            }
            Err(e) => {
                warn!(%run_id, kind, error = %e, "Task failed, awaiting redelivery");
            }
        }
    }

    async fn handle_activity(&self, lease: Lease, task: ActivityTask) {
        match self.run_activity(&lease, &task).await {
            Ok(true) => {}
            Ok(false) => {
                self.engine.dispatcher().ack(&lease).await;
            }
            Err(e) => {
                warn!(
                    run_id = %task.run.run_id,
                    scheduled_event_id = task.scheduled_event_id,
                    error = %e,
                    "Activity outcome not recorded, awaiting redelivery"
                );
            }
        }
    }

    /// Execute one attempt. Returns true when the lease was handed back for
    /// a retry.
    async fn run_activity(&self, lease: &Lease, task: &ActivityTask) -> Result<bool> {
        if !self.engine.is_open(&task.run.run_id).await? {
            debug!(run_id = %task.run.run_id, "Run closed, dropping activity");
            return Ok(false);
        }

        let Some(task) = self.engine.claim_activity(task).await? else {
            debug!(
                run_id = %task.run.run_id,
                scheduled_event_id = task.scheduled_event_id,
                "Activity claimed by another engine, dropping delivery"
            );
            return Ok(false);
        };
        let retry = &task.options.retry;
        if task.attempt > retry.max_attempts() {
            // The final attempt was abandoned by a worker that went away.
            let failure = ActivityFailure::application(format!(
                "activity '{}' was abandoned during its final attempt",
                task.activity_type
            ));
            let last = ActivityTask {
                attempt: retry.max_attempts(),
                ..task.clone()
            };
            self.engine.fail_activity(&last, failure).await?;
            return Ok(false);
        }

        match self.activities.execute(&task).await {
            ActivityResult::Success(value) => {
                self.engine.complete_activity(&task, value).await?;
                Ok(false)
            }
            ActivityResult::Failure(failure) => {
                if retry.should_retry(task.attempt) {
                    let delay = retry.delay_for_attempt(task.attempt);
                    info!(
                        run_id = %task.run.run_id,
                        scheduled_event_id = task.scheduled_event_id,
                        activity_type = %task.activity_type,
                        attempt = task.attempt,
                        delay_ms = millis(delay),
                        error = %failure,
                        "Activity attempt failed, retrying"
                    );
                    if !self.engine.retry_activity(lease, &task, delay).await? {
                        debug!(
                            run_id = %task.run.run_id,
                            scheduled_event_id = task.scheduled_event_id,
                            "Activity was redelivered meanwhile, retry left to the newer lease"
                        );
                    }
                    Ok(true)
                } else {
                    self.engine.fail_activity(&task, failure).await?;
                    Ok(false)
                }
            }
        }
    }
}
