// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-memory task queues with leases and visibility timeouts.
//!
//! Delivery guarantees:
//! - a task is held by at most one lease at a time
//! - a lease not acknowledged within the visibility timeout expires and puts
//!   exactly one copy of its task back into the pending pool
//! - decision tasks are deduplicated per run, and a pending decision is not
//!   delivered while another decision lease for the same run is outstanding
//! - activity and timer tasks are deduplicated by identity, so re-deriving
//!   them from history never produces a second copy
//!
//! Nothing here is durable. After a restart the engine's recovery sweep
//! rebuilds the queues from the history log.
//!
//! Delays longer than [`MAX_DELAY`] are clamped to it.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::{Mutex, Notify};
use tokio::time::{Instant, sleep_until};
use tracing::{debug, warn};

use crate::activity::ActivityTask;
use crate::history::RunRef;

/// Longest delay or timeout the dispatcher schedules (about 100 years).
pub const MAX_DELAY: Duration = Duration::from_secs(100 * 365 * 24 * 60 * 60);

/// `now + delay`, clamped to [`MAX_DELAY`].
fn instant_after(now: Instant, delay: Duration) -> Instant {
    now.checked_add(delay.min(MAX_DELAY)).unwrap_or(now)
}

/// Whole milliseconds, saturating.
pub(crate) fn millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// A unit of work for a worker.
#[derive(Debug, Clone, PartialEq)]
pub enum Task {
    /// Replay the run and apply the resulting commands.
    Decision {
        /// The run to decide.
        run: RunRef,
    },
    /// Execute one attempt of an activity.
    Activity(ActivityTask),
    /// A durable timer is due.
    Timer {
        /// Owning run.
        run: RunRef,
        /// Sequence of the `TimerStarted` event.
        timer_id: u64,
    },
}

/// Identity used for deduplication.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TaskKey {
    /// Decision for a run.
    Decision(String),
    /// Activity `(run_id, scheduled_event_id)`.
    Activity(String, u64),
    /// Timer `(run_id, timer_id)`.
    Timer(String, u64),
}

impl Task {
    /// The run this task belongs to.
    pub fn run(&self) -> &RunRef {
        match self {
            Self::Decision { run } | Self::Timer { run, .. } => run,
            Self::Activity(task) => &task.run,
        }
    }

    /// Deduplication identity.
    pub fn key(&self) -> TaskKey {
        match self {
            Self::Decision { run } => TaskKey::Decision(run.run_id.clone()),
            Self::Activity(task) => {
                TaskKey::Activity(task.run.run_id.clone(), task.scheduled_event_id)
            }
            Self::Timer { run, timer_id } => TaskKey::Timer(run.run_id.clone(), *timer_id),
        }
    }

    /// Short label for logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Decision { .. } => "decision",
            Self::Activity(_) => "activity",
            Self::Timer { .. } => "timer",
        }
    }
}

/// What a worker can handle on one task queue.
#[derive(Debug, Clone, Default)]
pub struct WorkerBinding {
    /// Queue name.
    pub task_queue: String,
    /// Workflow types whose decision and timer tasks this worker takes.
    pub workflow_types: HashSet<String>,
    /// Activity types this worker executes.
    pub activity_types: HashSet<String>,
}

impl WorkerBinding {
    /// A binding with no capabilities.
    pub fn new(task_queue: impl Into<String>) -> Self {
        Self {
            task_queue: task_queue.into(),
            ..Default::default()
        }
    }

    /// Add a workflow type.
    pub fn with_workflow(mut self, workflow_type: impl Into<String>) -> Self {
        self.workflow_types.insert(workflow_type.into());
        self
    }

    /// Add an activity type.
    pub fn with_activity(mut self, activity_type: impl Into<String>) -> Self {
        self.activity_types.insert(activity_type.into());
        self
    }

    /// Whether this binding can handle `task`.
    pub fn accepts(&self, task: &Task) -> bool {
        match task {
            Task::Decision { run } | Task::Timer { run, .. } => {
                self.workflow_types.contains(&run.workflow_type)
            }
            Task::Activity(task) => self.activity_types.contains(&task.activity_type),
        }
    }
}

/// A delivered task. Must be acknowledged or requeued before `deadline`.
#[derive(Debug, Clone)]
pub struct Lease {
    id: u64,
    task_queue: String,
    /// The leased task.
    pub task: Task,
    deadline: Instant,
}

impl Lease {
    /// Lease identifier, unique within the dispatcher.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Queue the task was taken from.
    pub fn task_queue(&self) -> &str {
        &self.task_queue
    }

    /// When the lease expires.
    pub fn deadline(&self) -> Instant {
        self.deadline
    }
}

struct Pending {
    task: Task,
    visible_at: Instant,
    order: u64,
}

struct Leased {
    task: Task,
    deadline: Instant,
}

#[derive(Default)]
struct QueueState {
    pending: Vec<Pending>,
    leases: HashMap<u64, Leased>,
    notify: Arc<Notify>,
}

impl QueueState {
    fn pending_index(&self, key: &TaskKey) -> Option<usize> {
        self.pending.iter().position(|p| &p.task.key() == key)
    }

    fn is_leased(&self, key: &TaskKey) -> bool {
        self.leases.values().any(|l| &l.task.key() == key)
    }

    fn push(&mut self, task: Task, visible_at: Instant, order: u64) {
        self.pending.push(Pending {
            task,
            visible_at,
            order,
        });
    }

    /// Return expired leases to the pending pool.
    fn reclaim_expired(&mut self, now: Instant, order: &AtomicU64) {
        let expired: Vec<u64> = self
            .leases
            .iter()
            .filter(|(_, lease)| lease.deadline <= now)
            .map(|(id, _)| *id)
            .collect();

        for id in expired {
            let Some(lease) = self.leases.remove(&id) else {
                continue;
            };
            let key = lease.task.key();
            warn!(
                lease_id = id,
                kind = lease.task.kind(),
                run_id = %lease.task.run().run_id,
                "Lease expired, redelivering task"
            );
            if self.pending_index(&key).is_none() {
                self.push(lease.task, now, order.fetch_add(1, Ordering::Relaxed));
            }
        }
    }

    fn take_deliverable(&mut self, binding: &WorkerBinding, now: Instant) -> Option<Task> {
        let busy_runs: HashSet<String> = self
            .leases
            .values()
            .filter_map(|lease| match &lease.task {
                Task::Decision { run } => Some(run.run_id.clone()),
                _ => None,
            })
            .collect();

        let index = self
            .pending
            .iter()
            .enumerate()
            .filter(|(_, p)| p.visible_at <= now && binding.accepts(&p.task))
            .filter(|(_, p)| match &p.task {
                Task::Decision { run } => !busy_runs.contains(&run.run_id),
                _ => true,
            })
            .min_by_key(|(_, p)| (p.visible_at, p.order))
            .map(|(index, _)| index)?;

        Some(self.pending.swap_remove(index).task)
    }

    /// Earliest future instant at which something may become deliverable.
    fn next_wake(&self, binding: &WorkerBinding, now: Instant) -> Option<Instant> {
        let pending = self
            .pending
            .iter()
            .filter(|p| p.visible_at > now && binding.accepts(&p.task))
            .map(|p| p.visible_at);
        let leases = self.leases.values().map(|l| l.deadline);
        pending.chain(leases).min()
    }
}

/// Task queues shared by the engine and its workers.
pub struct Dispatcher {
    queues: Mutex<HashMap<String, QueueState>>,
    visibility_timeout: Duration,
    next_lease: AtomicU64,
    next_order: AtomicU64,
}

impl Dispatcher {
    /// Create a dispatcher whose leases expire after `visibility_timeout`.
    pub fn new(visibility_timeout: Duration) -> Self {
        Self {
            queues: Mutex::new(HashMap::new()),
            visibility_timeout,
            next_lease: AtomicU64::new(1),
            next_order: AtomicU64::new(0),
        }
    }

    /// The visibility timeout applied to every lease.
    pub fn visibility_timeout(&self) -> Duration {
        self.visibility_timeout
    }

    /// Make `task` available immediately.
    ///
    /// Returns false when an identical task is already queued (or, for
    /// activities and timers, already leased).
    pub async fn enqueue(&self, task_queue: &str, task: Task) -> bool {
        self.enqueue_after(task_queue, task, Duration::ZERO).await
    }

    /// Make `task` available after `delay`.
    pub async fn enqueue_after(&self, task_queue: &str, task: Task, delay: Duration) -> bool {
        let mut queues = self.queues.lock().await;
        let state = queues.entry(task_queue.to_string()).or_default();

        let key = task.key();
        if state.pending_index(&key).is_some() {
            return false;
        }
        if !matches!(task, Task::Decision { .. }) && state.is_leased(&key) {
            return false;
        }

        debug!(
            task_queue,
            kind = task.kind(),
            run_id = %task.run().run_id,
            delay_ms = millis(delay),
            "Task enqueued"
        );
        let order = self.next_order.fetch_add(1, Ordering::Relaxed);
        state.push(task, instant_after(Instant::now(), delay), order);
        state.notify.notify_waiters();
        true
    }

    /// Wait up to `timeout` for a task that `binding` can handle.
    pub async fn poll(&self, binding: &WorkerBinding, timeout: Duration) -> Option<Lease> {
        let give_up_at = instant_after(Instant::now(), timeout);

        loop {
            let notify = {
                let mut queues = self.queues.lock().await;
                queues
                    .entry(binding.task_queue.clone())
                    .or_default()
                    .notify
                    .clone()
            };
            let notified = notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let next_wake = {
                let mut queues = self.queues.lock().await;
                let state = queues.entry(binding.task_queue.clone()).or_default();
                let now = Instant::now();
                state.reclaim_expired(now, &self.next_order);

                if let Some(task) = state.take_deliverable(binding, now) {
                    let id = self.next_lease.fetch_add(1, Ordering::Relaxed);
                    let deadline = instant_after(now, self.visibility_timeout);
                    state.leases.insert(
                        id,
                        Leased {
                            task: task.clone(),
                            deadline,
                        },
                    );
                    return Some(Lease {
                        id,
                        task_queue: binding.task_queue.clone(),
                        task,
                        deadline,
                    });
                }

                state.next_wake(binding, now)
            };

            if Instant::now() >= give_up_at {
                return None;
            }
            let wake_at = next_wake.map_or(give_up_at, |at| at.min(give_up_at));

            tokio::select! {
                _ = &mut notified => {}
                _ = sleep_until(wake_at) => {}
            }
        }
    }

    /// Complete a lease. Returns false if it had already expired.
    pub async fn ack(&self, lease: &Lease) -> bool {
        let mut queues = self.queues.lock().await;
        let Some(state) = queues.get_mut(&lease.task_queue) else {
            return false;
        };
        let removed = state.leases.remove(&lease.id).is_some();
        if removed {
            // A decision may have been queued behind this lease.
            state.notify.notify_waiters();
        }
        removed
    }

    /// Release a lease and queue `task` in its place after `delay`.
    ///
    /// Used for activity retries. If the lease already expired, the
    /// redelivered copy is replaced so only one copy stays queued. If the
    /// redelivered copy is already leased again, the retry is dropped and
    /// false is returned: the newer lease owns the task.
    pub async fn requeue(&self, lease: Lease, task: Task, delay: Duration) -> bool {
        let mut queues = self.queues.lock().await;
        let state = queues.entry(lease.task_queue.clone()).or_default();
        state.leases.remove(&lease.id);

        let key = task.key();
        if state.is_leased(&key) {
            debug!(
                lease_id = lease.id,
                kind = task.kind(),
                run_id = %task.run().run_id,
                "Task leased again since this lease expired, retry dropped"
            );
            state.notify.notify_waiters();
            return false;
        }
        if let Some(index) = state.pending_index(&key) {
            state.pending.swap_remove(index);
        }

        let order = self.next_order.fetch_add(1, Ordering::Relaxed);
        state.push(task, instant_after(Instant::now(), delay), order);
        state.notify.notify_waiters();
        true
    }

    /// Number of queued (not leased) tasks on a queue.
    pub async fn pending_len(&self, task_queue: &str) -> usize {
        let queues = self.queues.lock().await;
        queues.get(task_queue).map_or(0, |s| s.pending.len())
    }

    /// Number of outstanding leases on a queue.
    pub async fn leased_len(&self, task_queue: &str) -> usize {
        let queues = self.queues.lock().await;
        queues.get(task_queue).map_or(0, |s| s.leases.len())
    }
}
