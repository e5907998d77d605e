// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Activities and the executor that runs one attempt of them.
//!
//! The executor never retries. It runs a single attempt under the
//! start-to-close deadline and turns every outcome (including panics and
//! unknown activity types) into an [`ActivityResult`]. Retries are decided by
//! the worker from the [`RetryPolicy`] recorded with the scheduled activity.
//!
//! Activities are executed at least once. A worker that crashes after the
//! side effect but before reporting completion will see the task again.
//! [`ActivityContext::idempotency_key`] is stable across attempts for callers
//! that need to deduplicate downstream.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::dispatcher::millis;
use crate::history::RunRef;
use crate::retry::RetryPolicy;

/// Default start-to-close timeout (10 seconds).
pub const DEFAULT_START_TO_CLOSE_TIMEOUT_MS: u64 = 10_000;

/// Category of an activity failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The attempt exceeded its start-to-close timeout.
    Timeout,
    /// The activity reported an error (or panicked).
    ApplicationError,
    /// A remote call could not be completed.
    NetworkError,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Timeout => "timeout",
            Self::ApplicationError => "application error",
            Self::NetworkError => "network error",
        };
        f.write_str(name)
    }
}

/// Failure of one activity attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct ActivityFailure {
    /// Failure category.
    pub kind: FailureKind,
    /// Human-readable details.
    pub message: String,
}

impl ActivityFailure {
    /// Create a failure of the given kind.
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// The attempt ran out of time.
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Timeout, message)
    }

    /// The activity's own logic failed.
    pub fn application(message: impl Into<String>) -> Self {
        Self::new(FailureKind::ApplicationError, message)
    }

    /// A remote dependency could not be reached.
    pub fn network(message: impl Into<String>) -> Self {
        Self::new(FailureKind::NetworkError, message)
    }
}

impl From<serde_json::Error> for ActivityFailure {
    fn from(err: serde_json::Error) -> Self {
        Self::application(format!("invalid payload: {}", err))
    }
}

/// Per-activity execution options, recorded in `ActivityScheduled`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityOptions {
    /// Hard deadline for a single attempt.
    pub start_to_close_timeout_ms: u64,
    /// Engine-side retry policy.
    #[serde(default)]
    pub retry: RetryPolicy,
}

impl ActivityOptions {
    /// Options with the given per-attempt timeout and no retries.
    pub fn new(start_to_close_timeout: Duration) -> Self {
        Self {
            start_to_close_timeout_ms: millis(start_to_close_timeout),
            retry: RetryPolicy::default(),
        }
    }

    /// Use the given retry policy.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// The per-attempt timeout.
    pub fn start_to_close_timeout(&self) -> Duration {
        Duration::from_millis(self.start_to_close_timeout_ms)
    }
}

impl Default for ActivityOptions {
    fn default() -> Self {
        Self {
            start_to_close_timeout_ms: DEFAULT_START_TO_CLOSE_TIMEOUT_MS,
            retry: RetryPolicy::default(),
        }
    }
}

/// One attempt of a scheduled activity, as dispatched to workers.
///
/// Identity is `(run_id, scheduled_event_id)`; `attempt` starts at 1.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityTask {
    /// Owning run.
    pub run: RunRef,
    /// Sequence of the `ActivityScheduled` event.
    pub scheduled_event_id: u64,
    /// Registered activity type.
    pub activity_type: String,
    /// Activity input.
    pub input: Value,
    /// Attempt number, starting at 1.
    pub attempt: u32,
    /// Timeout and retry policy.
    pub options: ActivityOptions,
}

impl ActivityTask {
    /// The same task, one attempt later.
    pub fn next_attempt(&self) -> Self {
        Self {
            attempt: self.attempt.saturating_add(1),
            ..self.clone()
        }
    }
}

/// Outcome of one attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum ActivityResult {
    /// The activity returned a value.
    Success(Value),
    /// The attempt failed.
    Failure(ActivityFailure),
}

/// Information about the attempt being executed.
#[derive(Debug, Clone)]
pub struct ActivityContext {
    run: RunRef,
    scheduled_event_id: u64,
    attempt: u32,
}

impl ActivityContext {
    /// Context for the given task.
    pub fn new(task: &ActivityTask) -> Self {
        Self {
            run: task.run.clone(),
            scheduled_event_id: task.scheduled_event_id,
            attempt: task.attempt,
        }
    }

    /// Workflow ID of the owning run.
    pub fn workflow_id(&self) -> &str {
        &self.run.workflow_id
    }

    /// Run ID of the owning run.
    pub fn run_id(&self) -> &str {
        &self.run.run_id
    }

    /// Sequence of the `ActivityScheduled` event.
    pub fn scheduled_event_id(&self) -> u64 {
        self.scheduled_event_id
    }

    /// Attempt number, starting at 1.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Key that is identical for every attempt of this activity.
    pub fn idempotency_key(&self) -> String {
        format!("{}-{}", self.run.run_id, self.scheduled_event_id)
    }
}

/// A unit of side-effecting work.
#[async_trait]
pub trait Activity: Send + Sync {
    /// Name used to schedule this activity.
    fn activity_type(&self) -> &str;

    /// Run one attempt.
    async fn execute(&self, ctx: ActivityContext, input: Value) -> Result<Value, ActivityFailure>;
}

/// Activity backed by a closure. See [`from_fn`].
pub struct FnActivity<F> {
    activity_type: String,
    func: F,
}

/// Build an activity from an async closure.
///
/// ```ignore
/// let print = activity::from_fn("print_number", |_ctx, input| async move {
///     println!("{}", input);
///     Ok(Value::Null)
/// });
/// ```
pub fn from_fn<F, Fut>(activity_type: impl Into<String>, func: F) -> FnActivity<F>
where
    F: Fn(ActivityContext, Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, ActivityFailure>> + Send + 'static,
{
    FnActivity {
        activity_type: activity_type.into(),
        func,
    }
}

#[async_trait]
impl<F, Fut> Activity for FnActivity<F>
where
    F: Fn(ActivityContext, Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, ActivityFailure>> + Send + 'static,
{
    fn activity_type(&self) -> &str {
        &self.activity_type
    }

    async fn execute(&self, ctx: ActivityContext, input: Value) -> Result<Value, ActivityFailure> {
        (self.func)(ctx, input).await
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Runs single attempts of registered activities.
#[derive(Clone, Default)]
pub struct ActivityExecutor {
    activities: HashMap<String, Arc<dyn Activity>>,
}

impl ActivityExecutor {
    /// Create an executor with no activities.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an activity under its type name, replacing any previous one.
    pub fn register(&mut self, activity: Arc<dyn Activity>) {
        self.activities
            .insert(activity.activity_type().to_string(), activity);
    }

    /// Registered activity types.
    pub fn activity_types(&self) -> impl Iterator<Item = &str> {
        self.activities.keys().map(String::as_str)
    }

    /// Whether an activity type is registered.
    pub fn supports(&self, activity_type: &str) -> bool {
        self.activities.contains_key(activity_type)
    }

    /// Execute one attempt of `task` under its start-to-close timeout.
    pub async fn execute(&self, task: &ActivityTask) -> ActivityResult {
        let Some(activity) = self.activities.get(&task.activity_type) else {
            return ActivityResult::Failure(ActivityFailure::application(format!(
                "activity type '{}' is not registered",
                task.activity_type
            )));
        };

        let timeout = task.options.start_to_close_timeout();
        debug!(
            run_id = %task.run.run_id,
            scheduled_event_id = task.scheduled_event_id,
            activity_type = %task.activity_type,
            attempt = task.attempt,
            timeout_ms = millis(timeout),
            "Executing activity"
        );

        let attempt = AssertUnwindSafe(activity.execute(ActivityContext::new(task), task.input.clone()))
            .catch_unwind();

        let result = match tokio::time::timeout(timeout, attempt).await {
            Err(_) => ActivityResult::Failure(ActivityFailure::timeout(format!(
                "activity '{}' did not finish within {}ms",
                task.activity_type,
                timeout.as_millis()
            ))),
            Ok(Err(panic)) => ActivityResult::Failure(ActivityFailure::application(format!(
                "activity '{}' panicked: {}",
                task.activity_type,
                panic_message(panic.as_ref())
            ))),
            Ok(Ok(Ok(value))) => ActivityResult::Success(value),
            Ok(Ok(Err(failure))) => ActivityResult::Failure(failure),
        };

        if let ActivityResult::Failure(failure) = &result {
            warn!(
                run_id = %task.run.run_id,
                scheduled_event_id = task.scheduled_event_id,
                activity_type = %task.activity_type,
                attempt = task.attempt,
                error = %failure,
                "Activity attempt failed"
            );
        }

        result
    }
}
