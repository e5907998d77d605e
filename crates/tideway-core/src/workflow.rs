// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Workflow programs and the deterministic context they run against.
//!
//! A workflow is ordinary async Rust that talks to the outside world only
//! through [`WorkflowContext`]. Every call to
//! [`execute_activity`](WorkflowContext::execute_activity) or
//! [`sleep`](WorkflowContext::sleep) claims the next ordinal; during replay
//! the ordinal is matched against the recorded history, so a program must
//! issue the same calls in the same order every time it runs.
//!
//! Rules for workflow code:
//! - no wall-clock reads (use [`WorkflowContext::now`])
//! - no randomness, no direct I/O, no spawned tasks
//! - side effects belong in activities

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::activity::{ActivityFailure, ActivityOptions};
use crate::history::RunRef;

/// Error returned by a workflow program. Becomes `WorkflowFailed`.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum WorkflowError {
    /// An activity exhausted its retries and the program did not handle it.
    #[error("activity '{activity_type}' failed: {failure}")]
    Activity {
        /// Activity type that failed.
        activity_type: String,
        /// Failure of its last attempt.
        failure: ActivityFailure,
    },

    /// Input, output or activity payload did not match the expected shape.
    #[error("invalid payload: {0}")]
    Payload(String),

    /// Program-defined failure.
    #[error("{0}")]
    Application(String),
}

impl WorkflowError {
    /// Program-defined failure with the given message.
    pub fn application(message: impl Into<String>) -> Self {
        Self::Application(message.into())
    }
}

impl From<serde_json::Error> for WorkflowError {
    fn from(err: serde_json::Error) -> Self {
        Self::Payload(err.to_string())
    }
}

/// A registered workflow type.
#[async_trait]
pub trait Workflow: Send + Sync {
    /// Name used to start this workflow.
    fn workflow_type(&self) -> &str;

    /// Names of the queries this workflow answers.
    fn queries(&self) -> &[&'static str] {
        &[]
    }

    /// The workflow program.
    async fn run(&self, ctx: WorkflowContext, input: Value) -> Result<Value, WorkflowError>;
}

/// An instruction produced by replay, applied to the history by the engine.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Append `ActivityScheduled` and dispatch the first attempt.
    ScheduleActivity {
        /// Registered activity type.
        activity_type: String,
        /// Activity input.
        input: Value,
        /// Timeout and retry policy.
        options: ActivityOptions,
    },
    /// Append `TimerStarted` and arm the timer.
    StartTimer {
        /// Sleep length.
        duration: Duration,
    },
    /// Append `WorkflowCompleted`.
    CompleteWorkflow {
        /// Workflow result.
        result: Value,
    },
    /// Append `WorkflowFailed`.
    FailWorkflow {
        /// Error message.
        error: String,
    },
    /// Append `WorkflowCancelled`.
    CancelWorkflow {
        /// Reason from the cancel request.
        reason: Option<String>,
    },
}

impl Command {
    /// Whether applying this command closes the run.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::CompleteWorkflow { .. } | Self::FailWorkflow { .. } | Self::CancelWorkflow { .. }
        )
    }
}

/// What a replay decided.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// New commands to apply, in order.
    Commands(Vec<Command>),
    /// The program is waiting on outstanding activities or timers.
    Suspend,
}

/// Registry of workflow implementations by type.
#[derive(Clone, Default)]
pub struct WorkflowRegistry {
    workflows: HashMap<String, Arc<dyn Workflow>>,
}

impl WorkflowRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a workflow under its type name, replacing any previous one.
    pub fn register(&mut self, workflow: Arc<dyn Workflow>) {
        self.workflows
            .insert(workflow.workflow_type().to_string(), workflow);
    }

    /// Look up a workflow.
    pub fn get(&self, workflow_type: &str) -> Option<Arc<dyn Workflow>> {
        self.workflows.get(workflow_type).cloned()
    }

    /// Whether a workflow type is registered.
    pub fn supports(&self, workflow_type: &str) -> bool {
        self.workflows.contains_key(workflow_type)
    }

    /// Registered workflow types.
    pub fn workflow_types(&self) -> impl Iterator<Item = &str> {
        self.workflows.keys().map(String::as_str)
    }
}

#[derive(Debug, Clone)]
pub(crate) enum Recorded {
    Activity { activity_type: String },
    Timer { fire_at: DateTime<Utc> },
}

#[derive(Debug, Clone)]
pub(crate) enum Resolution {
    Completed(Value),
    Failed(ActivityFailure),
    Fired,
}

#[derive(Debug, Clone)]
pub(crate) struct RecordedStep {
    pub sequence: u64,
    pub kind: Recorded,
    pub resolution: Option<Resolution>,
}

/// Mutable state shared between the context and the futures it hands out.
#[derive(Debug)]
pub(crate) struct ReplayState {
    pub steps: Vec<RecordedStep>,
    pub next_ordinal: usize,
    pub commands: Vec<Command>,
    pub queries: HashMap<String, Value>,
    pub now: DateTime<Utc>,
    pub mismatch: Option<String>,
}

impl ReplayState {
    pub(crate) fn new(steps: Vec<RecordedStep>, now: DateTime<Utc>) -> Self {
        Self {
            steps,
            next_ordinal: 0,
            commands: Vec::new(),
            queries: HashMap::new(),
            now,
            mismatch: None,
        }
    }

    fn claim(&mut self, expected: &Recorded, command: Command) -> usize {
        let ordinal = self.next_ordinal;
        self.next_ordinal += 1;

        match self.steps.get(ordinal) {
            None => self.commands.push(command),
            Some(step) => {
                let matches = match (&step.kind, expected) {
                    (
                        Recorded::Activity { activity_type },
                        Recorded::Activity {
                            activity_type: wanted,
                        },
                    ) => activity_type == wanted,
                    (Recorded::Timer { .. }, Recorded::Timer { .. }) => true,
                    _ => false,
                };
                if !matches && self.mismatch.is_none() {
                    self.mismatch = Some(format!(
                        "call #{} is {} but event {} recorded {}",
                        ordinal + 1,
                        describe(expected),
                        step.sequence,
                        describe(&step.kind)
                    ));
                }
            }
        }

        ordinal
    }
}

fn describe(step: &Recorded) -> String {
    match step {
        Recorded::Activity { activity_type } => format!("activity '{}'", activity_type),
        Recorded::Timer { .. } => "a timer".to_string(),
    }
}

/// Deterministic API available to workflow programs.
///
/// Cheap to clone; all clones share the same replay state.
#[derive(Clone)]
pub struct WorkflowContext {
    run: RunRef,
    state: Arc<Mutex<ReplayState>>,
}

impl WorkflowContext {
    pub(crate) fn new(run: RunRef, state: Arc<Mutex<ReplayState>>) -> Self {
        Self { run, state }
    }

    fn lock(&self) -> MutexGuard<'_, ReplayState> {
        lock_state(&self.state)
    }

    /// Workflow ID of this run.
    pub fn workflow_id(&self) -> &str {
        &self.run.workflow_id
    }

    /// Run ID of this run.
    pub fn run_id(&self) -> &str {
        &self.run.run_id
    }

    /// Logical time: the run's start time, advanced by every fired timer.
    pub fn now(&self) -> DateTime<Utc> {
        self.lock().now
    }

    /// True while the program is re-walking steps it already took in an
    /// earlier decision. Use it to avoid duplicate log lines.
    pub fn is_replaying(&self) -> bool {
        let state = self.lock();
        state.next_ordinal < state.steps.len()
    }

    /// Publish a value that clients can read with a query of this name.
    pub fn set_query_state<T: Serialize>(&self, name: &str, value: &T) -> Result<(), WorkflowError> {
        let value = serde_json::to_value(value)?;
        self.lock().queries.insert(name.to_string(), value);
        Ok(())
    }

    /// Schedule an activity and wait for its final outcome (after retries).
    pub fn execute_activity(
        &self,
        activity_type: &str,
        input: Value,
        options: ActivityOptions,
    ) -> ActivityHandle {
        let ordinal = self.lock().claim(
            &Recorded::Activity {
                activity_type: activity_type.to_string(),
            },
            Command::ScheduleActivity {
                activity_type: activity_type.to_string(),
                input,
                options,
            },
        );
        ActivityHandle {
            state: self.state.clone(),
            ordinal,
        }
    }

    /// Typed wrapper over [`execute_activity`](Self::execute_activity).
    pub async fn call_activity<I, O>(
        &self,
        activity_type: &str,
        input: &I,
        options: ActivityOptions,
    ) -> Result<O, WorkflowError>
    where
        I: Serialize + ?Sized,
        O: DeserializeOwned,
    {
        let input = serde_json::to_value(input)?;
        let output = self
            .execute_activity(activity_type, input, options)
            .await
            .map_err(|failure| WorkflowError::Activity {
                activity_type: activity_type.to_string(),
                failure,
            })?;
        Ok(serde_json::from_value(output)?)
    }

    /// Durable sleep. Survives worker restarts.
    pub fn sleep(&self, duration: Duration) -> TimerHandle {
        let ordinal = self.lock().claim(
            &Recorded::Timer {
                fire_at: DateTime::<Utc>::MIN_UTC,
            },
            Command::StartTimer { duration },
        );
        TimerHandle {
            state: self.state.clone(),
            ordinal,
        }
    }
}

pub(crate) fn lock_state(state: &Mutex<ReplayState>) -> MutexGuard<'_, ReplayState> {
    state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Future returned by [`WorkflowContext::execute_activity`].
pub struct ActivityHandle {
    state: Arc<Mutex<ReplayState>>,
    ordinal: usize,
}

impl Future for ActivityHandle {
    type Output = Result<Value, ActivityFailure>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Self::Output> {
        let state = lock_state(&self.state);
        if state.mismatch.is_some() {
            return Poll::Pending;
        }
        match state.steps.get(self.ordinal).and_then(|s| s.resolution.as_ref()) {
            Some(Resolution::Completed(value)) => Poll::Ready(Ok(value.clone())),
            Some(Resolution::Failed(failure)) => Poll::Ready(Err(failure.clone())),
            _ => Poll::Pending,
        }
    }
}

/// Future returned by [`WorkflowContext::sleep`].
pub struct TimerHandle {
    state: Arc<Mutex<ReplayState>>,
    ordinal: usize,
}

impl Future for TimerHandle {
    type Output = ();

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<()> {
        let mut state = lock_state(&self.state);
        if state.mismatch.is_some() {
            return Poll::Pending;
        }
        let fired_at = match state.steps.get(self.ordinal) {
            Some(RecordedStep {
                kind: Recorded::Timer { fire_at },
                resolution: Some(Resolution::Fired),
                ..
            }) => *fire_at,
            _ => return Poll::Pending,
        };
        if fired_at > state.now {
            state.now = fired_at;
        }
        Poll::Ready(())
    }
}
