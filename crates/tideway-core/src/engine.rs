// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The engine applies decisions and task outcomes to the history log and
//! keeps the dispatcher fed.
//!
//! All durable state lives in the [`HistoryStore`]. The dispatcher's queues
//! are derived state: [`Engine::recover`] rebuilds them from history after a
//! restart and picks up runs that another process started or changed.
//!
//! Delivery is at least once, so every outcome may arrive twice. The store
//! rejects the duplicate (`DuplicateResolution`, `HistoryConflict`,
//! `RunClosed`) and the engine treats that as already done.
//!
//! Activities are the exception: they have side effects, so a worker claims
//! each one in the store before running it. The claim names this engine as
//! owner and carries the attempt counter, which keeps processes that share a
//! store from running one activity concurrently and keeps the retry budget
//! across restarts.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::activity::{ActivityFailure, ActivityTask};
use crate::config::Config;
use crate::dispatcher::{Dispatcher, Lease, MAX_DELAY, Task, millis};
use crate::error::{CoreError, Result};
use crate::history::{
    HistoryEvent, HistoryRecord, HistoryStore, NewRun, RunRef, SqliteHistory, StartOutcome,
    WorkflowRun,
};
use crate::query::QuerySnapshots;
use crate::runner::{Replay, WorkflowRunner};
use crate::workflow::{Command, Decision};

/// Engine tuning.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// How long a delivered task may stay unacknowledged.
    pub visibility_timeout: Duration,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            visibility_timeout: Duration::from_secs(30),
        }
    }
}

impl From<&Config> for EngineOptions {
    fn from(config: &Config) -> Self {
        Self {
            visibility_timeout: config.visibility_timeout,
        }
    }
}

/// Tasks re-derived by one recovery sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Decision tasks enqueued.
    pub decisions: usize,
    /// Outstanding activities re-enqueued.
    pub activities: usize,
    /// Pending timers re-armed.
    pub timers: usize,
}

/// `now + delay` on the wall clock, clamped to [`MAX_DELAY`].
pub(crate) fn utc_after(now: DateTime<Utc>, delay: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(delay.min(MAX_DELAY))
        .ok()
        .and_then(|delta| now.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Drives workflow runs: history writes plus task dispatch.
pub struct Engine {
    /// Identifies this engine in activity claims.
    owner: String,
    store: Arc<dyn HistoryStore>,
    dispatcher: Arc<Dispatcher>,
    snapshots: Arc<QuerySnapshots>,
    /// Last history sequence this process has seen per open run.
    observed: Mutex<HashMap<String, u64>>,
}

impl Engine {
    /// Create an engine over an existing store.
    pub fn new(store: Arc<dyn HistoryStore>, options: EngineOptions) -> Self {
        Self {
            owner: Uuid::new_v4().to_string(),
            store,
            dispatcher: Arc::new(Dispatcher::new(options.visibility_timeout)),
            snapshots: Arc::new(QuerySnapshots::new()),
            observed: Mutex::new(HashMap::new()),
        }
    }

    /// Open the SQLite history named by the configuration.
    pub async fn connect(config: &Config) -> Result<Self> {
        let store = SqliteHistory::connect(&config.database_url).await?;
        Ok(Self::new(Arc::new(store), EngineOptions::from(config)))
    }

    /// Owner name this engine uses for activity claims.
    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// The history store.
    pub fn store(&self) -> &Arc<dyn HistoryStore> {
        &self.store
    }

    /// The task dispatcher.
    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    /// Query snapshots captured by this engine's replays.
    pub fn snapshots(&self) -> &Arc<QuerySnapshots> {
        &self.snapshots
    }

    /// Release the store.
    pub async fn close(&self) {
        self.store.close().await;
    }

    async fn observe(&self, run_id: &str, sequence: u64) {
        let mut observed = self.observed.lock().await;
        let seen = observed.entry(run_id.to_string()).or_default();
        if sequence > *seen {
            *seen = sequence;
        }
    }

    async fn forget(&self, run_id: &str) {
        self.observed.lock().await.remove(run_id);
    }

    async fn enqueue_decision(&self, run: &RunRef) {
        self.dispatcher
            .enqueue(&run.task_queue, Task::Decision { run: run.clone() })
            .await;
    }

    /// Start a run, or return the RUNNING run that already owns `workflow_id`.
    #[instrument(skip(self, input))]
    pub async fn start_workflow(
        &self,
        workflow_type: &str,
        workflow_id: &str,
        task_queue: &str,
        input: Value,
    ) -> Result<StartOutcome> {
        for (field, value) in [
            ("workflow_type", workflow_type),
            ("workflow_id", workflow_id),
            ("task_queue", task_queue),
        ] {
            if value.trim().is_empty() {
                return Err(CoreError::ValidationError {
                    field: field.to_string(),
                    message: "must not be empty".to_string(),
                });
            }
        }

        let outcome = self
            .store
            .start_run(NewRun {
                workflow_id: workflow_id.to_string(),
                run_id: Uuid::new_v4().to_string(),
                workflow_type: workflow_type.to_string(),
                task_queue: task_queue.to_string(),
                input,
            })
            .await?;

        if outcome.created {
            info!(run_id = %outcome.run.run_id, "Workflow started");
            self.observe(&outcome.run.run_id, 1).await;
            self.enqueue_decision(&outcome.run.run_ref()).await;
        } else {
            info!(run_id = %outcome.run.run_id, "Workflow already running, attaching");
        }

        Ok(outcome)
    }

    /// Replay a run and apply the resulting decision.
    ///
    /// Closed and corrupted runs are skipped. A replay that diverges from
    /// history marks the run corrupted instead of failing the task, since
    /// redelivery would diverge again.
    #[instrument(skip(self, runner))]
    pub async fn handle_decision(&self, runner: &WorkflowRunner, run_id: &str) -> Result<()> {
        let Some(run) = self.store.get_run(run_id).await? else {
            warn!("Decision for unknown run dropped");
            return Ok(());
        };
        if run.status.is_terminal() {
            debug!(status = %run.status, "Run already closed");
            self.forget(run_id).await;
            return Ok(());
        }
        if run.corruption.is_some() {
            debug!("Run is marked corrupted, skipping decision");
            return Ok(());
        }

        let history = self.store.read(run_id, 0).await?;
        match runner.replay(&run, &history) {
            Ok(replay) => self.apply_decision(&run, replay).await,
            Err(CoreError::NonDeterminismDetected { details, .. }) => {
                self.mark_corrupted(run_id, &details).await
            }
            Err(err) => Err(err),
        }
    }

    /// Apply a replay's decision to the history and enqueue follow-up tasks.
    pub async fn apply_decision(&self, run: &WorkflowRun, replay: Replay) -> Result<()> {
        self.snapshots
            .record(&run.run_id, replay.history_len, replay.queries)
            .await;
        self.observe(&run.run_id, replay.history_len).await;

        let commands = match replay.decision {
            Decision::Suspend => {
                debug!(run_id = %run.run_id, "Workflow suspended");
                return Ok(());
            }
            Decision::Commands(commands) => commands,
        };

        let closes = commands.last().is_some_and(Command::is_terminal);
        let now = Utc::now();
        let events: Vec<HistoryEvent> = commands
            .iter()
            .map(|command| match command {
                Command::ScheduleActivity {
                    activity_type,
                    input,
                    options,
                } => HistoryEvent::ActivityScheduled {
                    activity_type: activity_type.clone(),
                    input: input.clone(),
                    options: options.clone(),
                },
                Command::StartTimer { duration } => HistoryEvent::TimerStarted {
                    duration_ms: millis(*duration),
                    fire_at: utc_after(now, *duration),
                },
                Command::CompleteWorkflow { result } => HistoryEvent::WorkflowCompleted {
                    result: result.clone(),
                },
                Command::FailWorkflow { error } => HistoryEvent::WorkflowFailed {
                    error: error.clone(),
                },
                Command::CancelWorkflow { reason } => HistoryEvent::WorkflowCancelled {
                    reason: reason.clone(),
                },
            })
            .collect();

        let sequences = match self
            .store
            .append_batch(&run.run_id, Some(replay.history_len), events)
            .await
        {
            Ok(sequences) => sequences,
            Err(CoreError::HistoryConflict { expected, actual, .. }) => {
                // New events arrived since the replay; their decision task is queued.
                debug!(run_id = %run.run_id, expected, actual, "Stale decision discarded");
                return Ok(());
            }
            Err(CoreError::RunClosed { .. }) => {
                self.forget(&run.run_id).await;
                return Ok(());
            }
            Err(err) => return Err(err),
        };

        let run_ref = run.run_ref();
        for (command, sequence) in commands.into_iter().zip(sequences.iter().copied()) {
            match command {
                Command::ScheduleActivity {
                    activity_type,
                    input,
                    options,
                } => {
                    info!(
                        run_id = %run.run_id,
                        scheduled_event_id = sequence,
                        activity_type = %activity_type,
                        "Activity scheduled"
                    );
                    let task = ActivityTask {
                        run: run_ref.clone(),
                        scheduled_event_id: sequence,
                        activity_type,
                        input,
                        attempt: 1,
                        options,
                    };
                    self.dispatcher
                        .enqueue(&run.task_queue, Task::Activity(task))
                        .await;
                }
                Command::StartTimer { duration } => {
                    debug!(run_id = %run.run_id, timer_id = sequence, ?duration, "Timer started");
                    self.dispatcher
                        .enqueue_after(
                            &run.task_queue,
                            Task::Timer {
                                run: run_ref.clone(),
                                timer_id: sequence,
                            },
                            duration,
                        )
                        .await;
                }
                Command::CompleteWorkflow { .. } => {
                    info!(run_id = %run.run_id, workflow_id = %run.workflow_id, "Workflow completed");
                }
                Command::FailWorkflow { error } => {
                    warn!(run_id = %run.run_id, workflow_id = %run.workflow_id, %error, "Workflow failed");
                }
                Command::CancelWorkflow { .. } => {
                    info!(run_id = %run.run_id, workflow_id = %run.workflow_id, "Workflow cancelled");
                }
            }
        }

        if closes {
            self.forget(&run.run_id).await;
            self.snapshots.forget(&run.run_id).await;
        } else if let Some(last) = sequences.last() {
            self.observe(&run.run_id, *last).await;
        }
        Ok(())
    }

    async fn record_outcome(&self, run: &RunRef, event: HistoryEvent) -> Result<()> {
        let event_type = event.event_type();
        match self.store.append(&run.run_id, event).await {
            Ok(sequence) => {
                self.observe(&run.run_id, sequence).await;
                self.enqueue_decision(run).await;
                Ok(())
            }
            Err(CoreError::DuplicateResolution {
                scheduled_event_id, ..
            }) => {
                debug!(run_id = %run.run_id, scheduled_event_id, event_type, "Duplicate outcome ignored");
                Ok(())
            }
            Err(CoreError::RunClosed { .. }) => {
                debug!(run_id = %run.run_id, event_type, "Outcome for closed run ignored");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    /// Claim `task` for this engine before running it.
    ///
    /// Returns the task at the attempt the store says is due, or `None` when
    /// another engine holds a live claim. The claim lasts for the attempt's
    /// start-to-close timeout plus the visibility timeout.
    #[instrument(skip(self, task), fields(run_id = %task.run.run_id, scheduled_event_id = task.scheduled_event_id))]
    pub async fn claim_activity(&self, task: &ActivityTask) -> Result<Option<ActivityTask>> {
        let hold = task
            .options
            .start_to_close_timeout()
            .saturating_add(self.dispatcher.visibility_timeout());
        let claimed = self
            .store
            .claim_activity(
                &task.run.run_id,
                task.scheduled_event_id,
                &self.owner,
                utc_after(Utc::now(), hold),
            )
            .await?;
        Ok(claimed.map(|attempt| {
            if attempt != task.attempt {
                debug!(queued = task.attempt, attempt, "Attempt taken from the stored claim");
            }
            ActivityTask {
                attempt,
                ..task.clone()
            }
        }))
    }

    /// Schedule the next attempt of `task` after `delay`.
    ///
    /// The claim is kept through the backoff so other engines leave the
    /// activity alone. It is updated before the retry becomes visible, so the
    /// retry's claim sees the new attempt. Returns false when the lease was
    /// superseded by a redelivery, in which case nothing is queued.
    pub async fn retry_activity(
        &self,
        lease: &Lease,
        task: &ActivityTask,
        delay: Duration,
    ) -> Result<bool> {
        let next = task.next_attempt();
        let hold = delay.saturating_add(self.dispatcher.visibility_timeout());
        self.store
            .release_activity(
                &task.run.run_id,
                task.scheduled_event_id,
                &self.owner,
                next.attempt,
                utc_after(Utc::now(), hold),
            )
            .await?;
        Ok(self
            .dispatcher
            .requeue(lease.clone(), Task::Activity(next), delay)
            .await)
    }

    /// Record a successful activity attempt.
    #[instrument(skip(self, task, result), fields(run_id = %task.run.run_id, scheduled_event_id = task.scheduled_event_id))]
    pub async fn complete_activity(&self, task: &ActivityTask, result: Value) -> Result<()> {
        debug!(attempt = task.attempt, "Activity completed");
        self.record_outcome(
            &task.run,
            HistoryEvent::ActivityCompleted {
                scheduled_event_id: task.scheduled_event_id,
                result,
            },
        )
        .await
    }

    /// Record the final failure of an activity whose retries are exhausted.
    #[instrument(skip(self, task, failure), fields(run_id = %task.run.run_id, scheduled_event_id = task.scheduled_event_id))]
    pub async fn fail_activity(&self, task: &ActivityTask, failure: ActivityFailure) -> Result<()> {
        warn!(
            attempts = task.attempt,
            activity_type = %task.activity_type,
            error = %failure,
            "Activity failed permanently"
        );
        self.record_outcome(
            &task.run,
            HistoryEvent::ActivityFailed {
                scheduled_event_id: task.scheduled_event_id,
                failure,
                attempts: task.attempt,
            },
        )
        .await
    }

    /// Record that a durable timer elapsed.
    pub async fn fire_timer(&self, run: &RunRef, timer_id: u64) -> Result<()> {
        debug!(run_id = %run.run_id, timer_id, "Timer fired");
        self.record_outcome(
            run,
            HistoryEvent::TimerFired {
                started_event_id: timer_id,
            },
        )
        .await
    }

    /// Ask a running workflow to stop.
    ///
    /// The program observes the request at its next decision and the run
    /// closes as CANCELLED.
    #[instrument(skip(self))]
    pub async fn request_cancel(&self, run_id: &str, reason: Option<String>) -> Result<()> {
        let run = self
            .store
            .get_run(run_id)
            .await?
            .ok_or_else(|| CoreError::RunNotFound {
                run_id: run_id.to_string(),
            })?;
        let sequence = self
            .store
            .append(run_id, HistoryEvent::WorkflowCancelRequested { reason })
            .await?;
        info!(workflow_id = %run.workflow_id, "Cancellation requested");
        self.observe(run_id, sequence).await;
        self.enqueue_decision(&run.run_ref()).await;
        Ok(())
    }

    /// Whether the run exists and is still RUNNING.
    pub async fn is_open(&self, run_id: &str) -> Result<bool> {
        Ok(self
            .store
            .get_run(run_id)
            .await?
            .is_some_and(|run| !run.status.is_terminal()))
    }

    /// Re-derive outstanding tasks for open runs on `task_queue`.
    ///
    /// Runs this process has not seen get a decision task and their pending
    /// timers. Runs whose history grew outside this process get a decision
    /// task. On every sweep, unresolved activities that no other engine has a
    /// live claim on are queued again, so work abandoned by a crashed process
    /// is taken over. Corrupted runs are left alone.
    #[instrument(skip(self))]
    pub async fn recover(&self, task_queue: &str) -> Result<RecoveryReport> {
        let mut report = RecoveryReport::default();
        let open = self.store.list_open_runs(Some(task_queue)).await?;

        for run in open {
            if run.corruption.is_some() {
                continue;
            }
            let history = self.store.read(&run.run_id, 0).await?;
            let Some(tail) = history.last().map(|record| record.sequence) else {
                continue;
            };
            let seen = self.observed.lock().await.get(&run.run_id).copied();
            match seen {
                Some(seen) if tail > seen => {
                    debug!(run_id = %run.run_id, seen, tail, "History moved");
                    self.enqueue_decision(&run.run_ref()).await;
                    report.decisions += 1;
                }
                Some(_) => {}
                None => {
                    report.timers += self.recover_timers(&run, &history).await;
                    self.enqueue_decision(&run.run_ref()).await;
                    report.decisions += 1;
                }
            }
            self.observe(&run.run_id, tail).await;
            report.activities += self.recover_activities(&run, &history).await?;
        }

        if report != RecoveryReport::default() {
            info!(
                decisions = report.decisions,
                activities = report.activities,
                timers = report.timers,
                "Recovered outstanding tasks"
            );
        }
        Ok(report)
    }

    /// Queue unresolved activities nobody else is working on.
    ///
    /// Skipped: activities another engine holds a live claim on, and
    /// unclaimed ones scheduled less than a visibility timeout ago, which
    /// the scheduling engine's workers are about to pick up.
    async fn recover_activities(
        &self,
        run: &WorkflowRun,
        history: &[HistoryRecord],
    ) -> Result<usize> {
        let resolved: HashSet<u64> = history.iter().filter_map(|r| r.event.resolves()).collect();
        let now = Utc::now();
        let fresh_after =
            chrono::Duration::from_std(self.dispatcher.visibility_timeout().min(MAX_DELAY))
                .ok()
                .and_then(|window| now.checked_sub_signed(window))
                .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let mut recovered = 0;

        for record in history {
            let HistoryEvent::ActivityScheduled {
                activity_type,
                input,
                options,
            } = &record.event
            else {
                continue;
            };
            if resolved.contains(&record.sequence) {
                continue;
            }

            let attempt = match self
                .store
                .activity_lease(&run.run_id, record.sequence)
                .await?
            {
                Some(lease) if lease.owner != self.owner && lease.is_live(now) => continue,
                Some(lease) => lease.attempt,
                None if record.recorded_at > fresh_after => continue,
                None => 1,
            };

            let task = ActivityTask {
                run: run.run_ref(),
                scheduled_event_id: record.sequence,
                activity_type: activity_type.clone(),
                input: input.clone(),
                attempt,
                options: options.clone(),
            };
            if self
                .dispatcher
                .enqueue(&run.task_queue, Task::Activity(task))
                .await
            {
                debug!(run_id = %run.run_id, scheduled_event_id = record.sequence, attempt, "Activity taken over");
                recovered += 1;
            }
        }
        Ok(recovered)
    }

    async fn recover_timers(&self, run: &WorkflowRun, history: &[HistoryRecord]) -> usize {
        let resolved: HashSet<u64> = history.iter().filter_map(|r| r.event.resolves()).collect();
        let now = Utc::now();
        let mut recovered = 0;

        for record in history {
            let HistoryEvent::TimerStarted { fire_at, .. } = &record.event else {
                continue;
            };
            if resolved.contains(&record.sequence) {
                continue;
            }
            let remaining = (*fire_at - now).to_std().unwrap_or(Duration::ZERO);
            let task = Task::Timer {
                run: run.run_ref(),
                timer_id: record.sequence,
            };
            if self
                .dispatcher
                .enqueue_after(&run.task_queue, task, remaining)
                .await
            {
                recovered += 1;
            }
        }
        recovered
    }

    /// Delete closed runs older than `retention`.
    pub async fn purge_expired(&self, retention: chrono::Duration) -> Result<u64> {
        let cutoff = Utc::now() - retention;
        let purged = self.store.purge_closed_before(cutoff).await?;
        if purged > 0 {
            info!(purged, %cutoff, "Purged closed runs");
        }
        Ok(purged)
    }

    /// Flag a run whose replay diverged from its history.
    pub async fn mark_corrupted(&self, run_id: &str, details: &str) -> Result<()> {
        error!(run_id, details, "Non-determinism detected, run needs operator attention");
        self.store.mark_corrupted(run_id, details).await?;
        self.forget(run_id).await;
        Ok(())
    }

    /// The corruption details of a run, if it was flagged.
    pub async fn corruption(&self, run_id: &str) -> Result<Option<String>> {
        Ok(self
            .store
            .get_run(run_id)
            .await?
            .and_then(|run| run.corruption))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activity::ActivityOptions;
    use crate::dispatcher::{Lease, WorkerBinding};
    use crate::history::{InMemoryHistory, RunStatus};
    use crate::workflow::{Workflow, WorkflowContext, WorkflowError, WorkflowRegistry};
    use async_trait::async_trait;
    use serde_json::json;

    struct Transfer;

    #[async_trait]
    impl Workflow for Transfer {
        fn workflow_type(&self) -> &str {
            "transfer"
        }

        async fn run(&self, ctx: WorkflowContext, input: Value) -> std::result::Result<Value, WorkflowError> {
            let withdrawn = ctx
                .execute_activity("withdraw", input.clone(), ActivityOptions::default())
                .await
                .map_err(|f| WorkflowError::application(f.message))?;
            ctx.sleep(Duration::from_secs(1)).await;
            ctx.execute_activity("deposit", input, ActivityOptions::default())
                .await
                .map_err(|f| WorkflowError::application(f.message))?;
            Ok(json!({"withdrawn": withdrawn}))
        }
    }

    fn engine() -> (Arc<InMemoryHistory>, Engine, WorkflowRunner) {
        let store = Arc::new(InMemoryHistory::new());
        let mut registry = WorkflowRegistry::new();
        registry.register(Arc::new(Transfer));
        let runner = WorkflowRunner::new(store.clone(), Arc::new(registry));
        let engine = Engine::new(store.clone(), EngineOptions::default());
        (store, engine, runner)
    }

    fn binding() -> WorkerBinding {
        WorkerBinding::new("q")
            .with_workflow("transfer")
            .with_activity("withdraw")
            .with_activity("deposit")
    }

    async fn next(engine: &Engine) -> Lease {
        engine
            .dispatcher()
            .poll(&binding(), Duration::ZERO)
            .await
            .expect("a task is queued")
    }

    async fn decide(engine: &Engine, runner: &WorkflowRunner) {
        let lease = next(engine).await;
        let Task::Decision { run } = &lease.task else {
            panic!("expected a decision task, got {:?}", lease.task);
        };
        engine.handle_decision(runner, &run.run_id).await.unwrap();
        assert!(engine.dispatcher().ack(&lease).await);
    }

    async fn take_activity(engine: &Engine) -> (Lease, ActivityTask) {
        let lease = next(engine).await;
        let Task::Activity(task) = lease.task.clone() else {
            panic!("expected an activity task, got {:?}", lease.task);
        };
        (lease, task)
    }

    #[tokio::test]
    async fn test_start_validates_and_is_idempotent() {
        let (_store, engine, _runner) = engine();

        let err = engine
            .start_workflow("transfer", " ", "q", Value::Null)
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), "VALIDATION_ERROR");

        let first = engine
            .start_workflow("transfer", "wf-1", "q", json!(100))
            .await
            .unwrap();
        let second = engine
            .start_workflow("transfer", "wf-1", "q", json!(100))
            .await
            .unwrap();
        assert!(first.created);
        assert!(!second.created);
        assert_eq!(first.run.run_id, second.run.run_id);
        assert_eq!(engine.dispatcher().pending_len("q").await, 1);
    }

    #[tokio::test]
    async fn test_decision_schedules_activity_and_duplicates_are_ignored() {
        let (store, engine, runner) = engine();
        let run_id = engine
            .start_workflow("transfer", "wf-1", "q", json!(100))
            .await
            .unwrap()
            .run
            .run_id;

        decide(&engine, &runner).await;
        let (lease, task) = take_activity(&engine).await;
        assert_eq!(task.activity_type, "withdraw");
        assert_eq!(task.scheduled_event_id, 2);
        assert_eq!(task.attempt, 1);

        engine.complete_activity(&task, json!(900)).await.unwrap();
        engine.complete_activity(&task, json!(900)).await.unwrap();
        engine.dispatcher().ack(&lease).await;

        let history = store.read(&run_id, 0).await.unwrap();
        assert_eq!(history.len(), 3);
        assert_eq!(engine.dispatcher().pending_len("q").await, 1);

        // Next decision starts the timer.
        decide(&engine, &runner).await;
        let history = store.read(&run_id, 0).await.unwrap();
        assert!(matches!(
            history[3].event,
            HistoryEvent::TimerStarted { duration_ms: 1000, .. }
        ));
        assert_eq!(engine.dispatcher().pending_len("q").await, 1);
    }

    #[tokio::test]
    async fn test_stale_decision_is_discarded() {
        let (store, engine, runner) = engine();
        let run = engine
            .start_workflow("transfer", "wf-1", "q", json!(100))
            .await
            .unwrap()
            .run;

        let history = store.read(&run.run_id, 0).await.unwrap();
        let replay = runner.replay(&run, &history).unwrap();
        store
            .append(&run.run_id, HistoryEvent::WorkflowCancelRequested { reason: None })
            .await
            .unwrap();

        engine.apply_decision(&run, replay).await.unwrap();
        assert_eq!(store.read(&run.run_id, 0).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_cancel_closes_run() {
        let (store, engine, runner) = engine();
        let run_id = engine
            .start_workflow("transfer", "wf-1", "q", json!(100))
            .await
            .unwrap()
            .run
            .run_id;
        decide(&engine, &runner).await;
        let (_lease, withdraw) = take_activity(&engine).await;

        engine
            .request_cancel(&run_id, Some("customer request".to_string()))
            .await
            .unwrap();
        decide(&engine, &runner).await;

        let run = store.get_run(&run_id).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Cancelled);
        assert_eq!(run.error.as_deref(), Some("customer request"));
        assert!(!engine.is_open(&run_id).await.unwrap());

        let err = engine.request_cancel(&run_id, None).await.unwrap_err();
        assert_eq!(err.error_code(), "RUN_CLOSED");

        // The outstanding withdraw lands after the close and is dropped.
        engine.complete_activity(&withdraw, json!(900)).await.unwrap();
        assert_eq!(engine.dispatcher().pending_len("q").await, 0);
    }

    #[tokio::test]
    async fn test_recover_rebuilds_outstanding_tasks() {
        let (store, engine, runner) = engine();
        let run_id = engine
            .start_workflow("transfer", "wf-1", "q", json!(100))
            .await
            .unwrap()
            .run
            .run_id;
        decide(&engine, &runner).await;
        let (lease, withdraw) = take_activity(&engine).await;
        engine.complete_activity(&withdraw, json!(900)).await.unwrap();
        engine.dispatcher().ack(&lease).await;
        decide(&engine, &runner).await;

        // A second process over the same store.
        let restarted = Engine::new(store.clone(), EngineOptions::default());
        let report = restarted.recover("q").await.unwrap();
        assert_eq!(
            report,
            RecoveryReport {
                decisions: 1,
                activities: 0,
                timers: 1
            }
        );
        assert_eq!(restarted.recover("q").await.unwrap(), RecoveryReport::default());

        // History written elsewhere is noticed on the next sweep.
        engine.request_cancel(&run_id, None).await.unwrap();
        let lease = next(&restarted).await;
        restarted.dispatcher().ack(&lease).await;
        let report = restarted.recover("q").await.unwrap();
        assert_eq!(report.decisions, 1);

        assert_eq!(restarted.recover("other").await.unwrap(), RecoveryReport::default());
    }

    #[tokio::test]
    async fn test_activity_held_by_one_engine_is_not_delivered_by_another() {
        let (store, engine, runner) = engine();
        engine
            .start_workflow("transfer", "wf-1", "q", json!(100))
            .await
            .unwrap();
        decide(&engine, &runner).await;
        let (lease, withdraw) = take_activity(&engine).await;

        // Just scheduled: left to the engine that scheduled it.
        let other = Engine::new(store.clone(), EngineOptions::default());
        let report = other.recover("q").await.unwrap();
        assert_eq!(report.decisions, 1);
        assert_eq!(report.activities, 0);
        let decision = next(&other).await;
        assert!(matches!(decision.task, Task::Decision { .. }));
        other.dispatcher().ack(&decision).await;
        assert!(
            other
                .dispatcher()
                .poll(&binding(), Duration::ZERO)
                .await
                .is_none()
        );

        // Claimed: stays with the claimant past the grace window.
        let claimed = engine.claim_activity(&withdraw).await.unwrap().expect("claimed");
        assert_eq!(claimed.attempt, 1);
        let eager = Engine::new(
            store.clone(),
            EngineOptions {
                visibility_timeout: Duration::ZERO,
            },
        );
        assert_eq!(eager.recover("q").await.unwrap().activities, 0);
        assert!(eager.claim_activity(&withdraw).await.unwrap().is_none());

        engine.complete_activity(&claimed, json!(900)).await.unwrap();
        assert!(engine.dispatcher().ack(&lease).await);
    }

    #[tokio::test]
    async fn test_retry_keeps_claim_through_backoff() {
        let (store, engine, runner) = engine();
        let run_id = engine
            .start_workflow("transfer", "wf-1", "q", json!(100))
            .await
            .unwrap()
            .run
            .run_id;
        decide(&engine, &runner).await;
        let (lease, withdraw) = take_activity(&engine).await;
        let claimed = engine.claim_activity(&withdraw).await.unwrap().unwrap();

        assert!(
            engine
                .retry_activity(&lease, &claimed, Duration::from_secs(60))
                .await
                .unwrap()
        );
        let stored = store.activity_lease(&run_id, 2).await.unwrap().unwrap();
        assert_eq!(stored.owner, engine.owner());
        assert_eq!(stored.attempt, 2);
        assert!(!stored.running);
        assert!(stored.expires_at > Utc::now() + chrono::Duration::seconds(60));
        assert_eq!(engine.dispatcher().pending_len("q").await, 1);

        let eager = Engine::new(
            store.clone(),
            EngineOptions {
                visibility_timeout: Duration::ZERO,
            },
        );
        assert_eq!(eager.recover("q").await.unwrap().activities, 0);
    }

    #[tokio::test]
    async fn test_abandoned_retry_resumes_at_stored_attempt() {
        let (store, engine, runner) = engine();
        let run_id = engine
            .start_workflow("transfer", "wf-1", "q", json!(100))
            .await
            .unwrap()
            .run
            .run_id;
        decide(&engine, &runner).await;
        let (_lease, withdraw) = take_activity(&engine).await;

        // A process that was backing off before attempt 3 went away.
        store
            .release_activity(
                &run_id,
                withdraw.scheduled_event_id,
                "gone",
                3,
                Utc::now() - chrono::Duration::seconds(1),
            )
            .await
            .unwrap();

        let restarted = Engine::new(store.clone(), EngineOptions::default());
        assert_eq!(restarted.recover("q").await.unwrap().activities, 1);
        let decision = next(&restarted).await;
        restarted.dispatcher().ack(&decision).await;
        let (_lease, task) = take_activity(&restarted).await;
        assert_eq!(task.attempt, 3);

        let claimed = restarted.claim_activity(&task).await.unwrap().unwrap();
        assert_eq!(claimed.attempt, 3);
        assert!(engine.claim_activity(&withdraw).await.unwrap().is_none());
    }

    struct Forever;

    #[async_trait]
    impl Workflow for Forever {
        fn workflow_type(&self) -> &str {
            "forever"
        }

        async fn run(&self, ctx: WorkflowContext, _input: Value) -> std::result::Result<Value, WorkflowError> {
            ctx.sleep(Duration::MAX).await;
            Ok(Value::Null)
        }
    }

    #[tokio::test]
    async fn test_huge_sleep_is_clamped() {
        let store = Arc::new(InMemoryHistory::new());
        let mut registry = WorkflowRegistry::new();
        registry.register(Arc::new(Forever));
        let runner = WorkflowRunner::new(store.clone(), Arc::new(registry));
        let engine = Engine::new(store.clone(), EngineOptions::default());
        let run_id = engine
            .start_workflow("forever", "wf-1", "q", Value::Null)
            .await
            .unwrap()
            .run
            .run_id;

        engine.handle_decision(&runner, &run_id).await.unwrap();
        let history = store.read(&run_id, 0).await.unwrap();
        match &history[1].event {
            HistoryEvent::TimerStarted {
                duration_ms,
                fire_at,
            } => {
                assert_eq!(*duration_ms, u64::MAX);
                assert!(*fire_at > Utc::now() + chrono::Duration::days(50 * 365));
            }
            other => panic!("expected a timer, got {:?}", other),
        }
        // The start decision plus the far-off timer.
        assert_eq!(engine.dispatcher().pending_len("q").await, 2);

        engine.handle_decision(&runner, &run_id).await.unwrap();
        assert_eq!(store.read(&run_id, 0).await.unwrap().len(), 2);

        let restarted = Engine::new(store.clone(), EngineOptions::default());
        assert_eq!(restarted.recover("q").await.unwrap().timers, 1);
    }

    #[test]
    fn test_utc_after_saturates() {
        let now = Utc::now();
        assert_eq!(utc_after(now, Duration::from_secs(5)), now + chrono::Duration::seconds(5));
        let far = utc_after(now, Duration::MAX);
        assert_eq!(far, utc_after(now, MAX_DELAY));
        assert!(far > now);
    }

    #[tokio::test]
    async fn test_divergent_history_marks_run_corrupted() {
        let (store, engine, runner) = engine();
        let run_id = engine
            .start_workflow("transfer", "wf-1", "q", json!(100))
            .await
            .unwrap()
            .run
            .run_id;
        store
            .append(
                &run_id,
                HistoryEvent::ActivityScheduled {
                    activity_type: "refund".to_string(),
                    input: Value::Null,
                    options: ActivityOptions::default(),
                },
            )
            .await
            .unwrap();

        decide(&engine, &runner).await;
        let corruption = engine.corruption(&run_id).await.unwrap();
        assert!(corruption.is_some());
        assert!(engine.is_open(&run_id).await.unwrap());

        // Corrupted runs are neither replayed nor recovered.
        let restarted = Engine::new(store.clone(), EngineOptions::default());
        assert_eq!(restarted.recover("q").await.unwrap(), RecoveryReport::default());
        restarted.handle_decision(&runner, &run_id).await.unwrap();
        assert_eq!(store.read(&run_id, 0).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_purge_expired_keeps_open_runs() {
        let (store, engine, _runner) = engine();
        let open = engine
            .start_workflow("transfer", "wf-open", "q", json!(1))
            .await
            .unwrap()
            .run
            .run_id;
        let closed = engine
            .start_workflow("transfer", "wf-closed", "q", json!(1))
            .await
            .unwrap()
            .run
            .run_id;
        store
            .append(&closed, HistoryEvent::WorkflowFailed { error: "boom".to_string() })
            .await
            .unwrap();

        assert_eq!(engine.purge_expired(chrono::Duration::days(1)).await.unwrap(), 0);
        assert_eq!(engine.purge_expired(chrono::Duration::zero()).await.unwrap(), 1);
        assert!(store.get_run(&closed).await.unwrap().is_none());
        assert!(store.get_run(&open).await.unwrap().is_some());
    }
}
