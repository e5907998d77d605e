// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! History log: the append-only, per-run event record and its backends.
//!
//! A run's history is the only source of truth for its progress. Sequence
//! numbers start at 1 with `WorkflowStarted` and have no gaps. Completion
//! events point back at the event they resolve, and each scheduled event can
//! be resolved at most once.
//!
//! Two backends implement [`HistoryStore`]:
//! - [`SqliteHistory`]: durable, shared between processes through the file
//! - [`InMemoryHistory`]: for tests and single-process embedding

mod memory;
mod sqlite;

pub use memory::InMemoryHistory;
pub use sqlite::SqliteHistory;

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::activity::{ActivityFailure, ActivityOptions};
use crate::error::{CoreError, Result};

/// One entry of a run's history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum HistoryEvent {
    /// Always sequence 1.
    WorkflowStarted {
        /// Registered workflow type.
        workflow_type: String,
        /// Queue the run's tasks are dispatched on.
        task_queue: String,
        /// Workflow input.
        input: Value,
    },
    /// The program asked for an activity.
    ActivityScheduled {
        /// Registered activity type.
        activity_type: String,
        /// Activity input.
        input: Value,
        /// Timeout and retry policy for every attempt.
        options: ActivityOptions,
    },
    /// An attempt succeeded.
    ActivityCompleted {
        /// Sequence of the `ActivityScheduled` event.
        scheduled_event_id: u64,
        /// Activity output.
        result: Value,
    },
    /// The last allowed attempt failed.
    ActivityFailed {
        /// Sequence of the `ActivityScheduled` event.
        scheduled_event_id: u64,
        /// Failure of the final attempt.
        failure: ActivityFailure,
        /// Number of attempts made.
        attempts: u32,
    },
    /// The program started a durable sleep.
    TimerStarted {
        /// Requested sleep.
        duration_ms: u64,
        /// Wall-clock instant the timer is due.
        fire_at: DateTime<Utc>,
    },
    /// A durable sleep elapsed.
    TimerFired {
        /// Sequence of the `TimerStarted` event.
        started_event_id: u64,
    },
    /// A client asked the run to stop.
    WorkflowCancelRequested {
        /// Optional reason from the client.
        reason: Option<String>,
    },
    /// Terminal: the program returned a value.
    WorkflowCompleted {
        /// Workflow result.
        result: Value,
    },
    /// Terminal: the program failed.
    WorkflowFailed {
        /// Error message surfaced to clients.
        error: String,
    },
    /// Terminal: the run was cancelled.
    WorkflowCancelled {
        /// Reason carried over from the cancel request.
        reason: Option<String>,
    },
}

impl HistoryEvent {
    /// The event's type tag, as stored.
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::WorkflowStarted { .. } => "WorkflowStarted",
            Self::ActivityScheduled { .. } => "ActivityScheduled",
            Self::ActivityCompleted { .. } => "ActivityCompleted",
            Self::ActivityFailed { .. } => "ActivityFailed",
            Self::TimerStarted { .. } => "TimerStarted",
            Self::TimerFired { .. } => "TimerFired",
            Self::WorkflowCancelRequested { .. } => "WorkflowCancelRequested",
            Self::WorkflowCompleted { .. } => "WorkflowCompleted",
            Self::WorkflowFailed { .. } => "WorkflowFailed",
            Self::WorkflowCancelled { .. } => "WorkflowCancelled",
        }
    }

    /// Sequence number of the scheduling event this event resolves.
    pub fn resolves(&self) -> Option<u64> {
        match self {
            Self::ActivityCompleted {
                scheduled_event_id,
                ..
            }
            | Self::ActivityFailed {
                scheduled_event_id,
                ..
            } => Some(*scheduled_event_id),
            Self::TimerFired { started_event_id } => Some(*started_event_id),
            _ => None,
        }
    }

    /// Status the run moves to when this event is appended, if terminal.
    pub fn terminal_status(&self) -> Option<RunStatus> {
        match self {
            Self::WorkflowCompleted { .. } => Some(RunStatus::Completed),
            Self::WorkflowFailed { .. } => Some(RunStatus::Failed),
            Self::WorkflowCancelled { .. } => Some(RunStatus::Cancelled),
            _ => None,
        }
    }

    /// Whether this event schedules work that a later event resolves.
    pub fn is_scheduling(&self) -> bool {
        matches!(
            self,
            Self::ActivityScheduled { .. } | Self::TimerStarted { .. }
        )
    }
}

/// A persisted history event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryRecord {
    /// Owning run.
    pub run_id: String,
    /// Position in the run's history, starting at 1.
    pub sequence: u64,
    /// The event.
    pub event: HistoryEvent,
    /// When the store accepted the event.
    pub recorded_at: DateTime<Utc>,
}

/// Lifecycle status of a run. Only `Running` is non-terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    /// Still making progress.
    Running,
    /// Finished with a result.
    Completed,
    /// Finished with an error.
    Failed,
    /// Stopped by a cancel request.
    Cancelled,
}

impl RunStatus {
    /// Stored representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
            Self::Cancelled => "CANCELLED",
        }
    }

    /// Whether the run can no longer change.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Running)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "RUNNING" => Ok(Self::Running),
            "COMPLETED" => Ok(Self::Completed),
            "FAILED" => Ok(Self::Failed),
            "CANCELLED" => Ok(Self::Cancelled),
            other => Err(CoreError::Serialization {
                details: format!("unknown run status '{}'", other),
            }),
        }
    }
}

/// Identifies a run and the workflow type that drives it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunRef {
    /// Caller-chosen workflow ID.
    pub workflow_id: String,
    /// Engine-generated run ID.
    pub run_id: String,
    /// Registered workflow type.
    pub workflow_type: String,
    /// Queue the run's tasks are dispatched on.
    pub task_queue: String,
}

/// A workflow run as tracked by the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowRun {
    /// Caller-chosen workflow ID.
    pub workflow_id: String,
    /// Engine-generated run ID.
    pub run_id: String,
    /// Registered workflow type.
    pub workflow_type: String,
    /// Queue the run's tasks are dispatched on.
    pub task_queue: String,
    /// Current status.
    pub status: RunStatus,
    /// When the run was started.
    pub start_time: DateTime<Utc>,
    /// When the run reached a terminal status.
    pub close_time: Option<DateTime<Utc>>,
    /// Workflow input.
    pub input: Value,
    /// Result of a completed run.
    pub result: Option<Value>,
    /// Error message of a failed or cancelled run.
    pub error: Option<String>,
    /// Set when replay diverged from history; the run needs an operator.
    pub corruption: Option<String>,
}

impl WorkflowRun {
    /// Reference used by tasks.
    pub fn run_ref(&self) -> RunRef {
        RunRef {
            workflow_id: self.workflow_id.clone(),
            run_id: self.run_id.clone(),
            workflow_type: self.workflow_type.clone(),
            task_queue: self.task_queue.clone(),
        }
    }
}

/// Parameters for creating a run.
#[derive(Debug, Clone)]
pub struct NewRun {
    /// Caller-chosen workflow ID.
    pub workflow_id: String,
    /// Run ID to assign if a new run is created.
    pub run_id: String,
    /// Registered workflow type.
    pub workflow_type: String,
    /// Queue the run's tasks are dispatched on.
    pub task_queue: String,
    /// Workflow input.
    pub input: Value,
}

impl NewRun {
    pub(crate) fn started_event(&self) -> HistoryEvent {
        HistoryEvent::WorkflowStarted {
            workflow_type: self.workflow_type.clone(),
            task_queue: self.task_queue.clone(),
            input: self.input.clone(),
        }
    }
}

/// Result of [`HistoryStore::start_run`].
#[derive(Debug, Clone)]
pub struct StartOutcome {
    /// The created run, or the RUNNING run that already owned the workflow ID.
    pub run: WorkflowRun,
    /// False when an existing run was returned.
    pub created: bool,
}

/// Durable claim on one scheduled activity.
///
/// The claim is what keeps two worker processes sharing a store from running
/// the same activity at once, and it carries the attempt counter across
/// restarts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityLease {
    /// Engine instance holding the claim.
    pub owner: String,
    /// Attempt being run, or the next one to run while backing off.
    pub attempt: u32,
    /// Whether an attempt is executing (as opposed to waiting for a retry).
    pub running: bool,
    /// The claim is void after this instant.
    pub expires_at: DateTime<Utc>,
}

impl ActivityLease {
    /// Whether the claim still holds at `now`.
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }

    /// Attempt number a new claim by `owner` at `now` gets, or `None` when
    /// another owner's claim is still live.
    ///
    /// An expired running claim lost its attempt, so the next owner starts
    /// the following one.
    pub(crate) fn next_claim(&self, owner: &str, now: DateTime<Utc>) -> Option<u32> {
        if self.owner == owner {
            return Some(self.attempt);
        }
        if self.is_live(now) {
            return None;
        }
        Some(if self.running {
            self.attempt.saturating_add(1)
        } else {
            self.attempt
        })
    }
}

/// Durable, append-only storage for workflow runs and their histories.
#[async_trait]
pub trait HistoryStore: Send + Sync {
    /// Create a run and append `WorkflowStarted` as sequence 1.
    ///
    /// If a RUNNING run already exists for the workflow ID it is returned
    /// unchanged with `created = false`.
    async fn start_run(&self, new_run: NewRun) -> Result<StartOutcome>;

    /// Fetch a run by run ID.
    async fn get_run(&self, run_id: &str) -> Result<Option<WorkflowRun>>;

    /// Fetch the RUNNING run for a workflow ID, else its most recent run.
    async fn find_run(&self, workflow_id: &str) -> Result<Option<WorkflowRun>>;

    /// All RUNNING runs, optionally restricted to one task queue.
    async fn list_open_runs(&self, task_queue: Option<&str>) -> Result<Vec<WorkflowRun>>;

    /// Append one event; returns its sequence number.
    async fn append(&self, run_id: &str, event: HistoryEvent) -> Result<u64> {
        let sequences = self.append_batch(run_id, None, vec![event]).await?;
        sequences
            .into_iter()
            .next()
            .ok_or_else(|| CoreError::storage("append", "no sequence assigned"))
    }

    /// Atomically append events.
    ///
    /// With `expected_tail` set, fails with `HistoryConflict` unless the
    /// current last sequence equals it. A terminal event closes the run in
    /// the same write.
    async fn append_batch(
        &self,
        run_id: &str,
        expected_tail: Option<u64>,
        events: Vec<HistoryEvent>,
    ) -> Result<Vec<u64>>;

    /// Events with a sequence greater than `after_sequence`, in order.
    async fn read(&self, run_id: &str, after_sequence: u64) -> Result<Vec<HistoryRecord>>;

    /// Claim the activity scheduled at `scheduled_event_id` for `owner` until
    /// `expires_at`.
    ///
    /// Returns the attempt to run, or `None` when another owner holds a live
    /// claim. The first claim runs attempt 1.
    async fn claim_activity(
        &self,
        run_id: &str,
        scheduled_event_id: u64,
        owner: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<Option<u32>>;

    /// Record that `owner` will run `next_attempt` after a backoff and keep
    /// the claim until `expires_at`.
    async fn release_activity(
        &self,
        run_id: &str,
        scheduled_event_id: u64,
        owner: &str,
        next_attempt: u32,
        expires_at: DateTime<Utc>,
    ) -> Result<()>;

    /// The current claim on a scheduled activity, if any.
    async fn activity_lease(
        &self,
        run_id: &str,
        scheduled_event_id: u64,
    ) -> Result<Option<ActivityLease>>;

    /// Flag a run whose replay diverged from its history.
    async fn mark_corrupted(&self, run_id: &str, details: &str) -> Result<()>;

    /// Delete closed runs (with their histories and activity claims) closed
    /// before `cutoff`.
    async fn purge_closed_before(&self, cutoff: DateTime<Utc>) -> Result<u64>;

    /// Check that the store is reachable.
    async fn health_check(&self) -> Result<()>;

    /// Release connections.
    async fn close(&self);
}

/// Terminal outcome applied to the run row when a batch closes it.
#[derive(Debug, Clone)]
pub(crate) struct RunClose {
    pub status: RunStatus,
    pub result: Option<Value>,
    pub error: Option<String>,
}

/// Validate a batch against the current run state.
///
/// `is_resolved` reports whether a scheduling event already has a resolution.
/// Returns the closing outcome if the batch ends the run.
pub(crate) fn check_batch(
    run: &WorkflowRun,
    tail: u64,
    expected_tail: Option<u64>,
    events: &[HistoryEvent],
    is_resolved: impl Fn(u64) -> bool,
) -> Result<Option<RunClose>> {
    if run.status.is_terminal() {
        return Err(CoreError::RunClosed {
            run_id: run.run_id.clone(),
            status: run.status.to_string(),
        });
    }

    if let Some(expected) = expected_tail
        && expected != tail
    {
        return Err(CoreError::HistoryConflict {
            run_id: run.run_id.clone(),
            expected,
            actual: tail,
        });
    }

    let mut closing = None;
    let mut resolved_in_batch = Vec::new();
    for event in events {
        if closing.is_some() {
            return Err(CoreError::ValidationError {
                field: "events".to_string(),
                message: "no event may follow a terminal event".to_string(),
            });
        }

        if matches!(event, HistoryEvent::WorkflowStarted { .. }) {
            return Err(CoreError::ValidationError {
                field: "events".to_string(),
                message: "WorkflowStarted is only written when a run starts".to_string(),
            });
        }

        if let Some(target) = event.resolves() {
            if target == 0 || target > tail {
                return Err(CoreError::ValidationError {
                    field: "events".to_string(),
                    message: format!("{} refers to unknown event {}", event.event_type(), target),
                });
            }
            if is_resolved(target) || resolved_in_batch.contains(&target) {
                return Err(CoreError::DuplicateResolution {
                    run_id: run.run_id.clone(),
                    scheduled_event_id: target,
                });
            }
            resolved_in_batch.push(target);
        }

        closing = match event {
            HistoryEvent::WorkflowCompleted { result } => Some(RunClose {
                status: RunStatus::Completed,
                result: Some(result.clone()),
                error: None,
            }),
            HistoryEvent::WorkflowFailed { error } => Some(RunClose {
                status: RunStatus::Failed,
                result: None,
                error: Some(error.clone()),
            }),
            HistoryEvent::WorkflowCancelled { reason } => Some(RunClose {
                status: RunStatus::Cancelled,
                result: None,
                error: reason.clone(),
            }),
            _ => None,
        };
    }

    Ok(closing)
}
