// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Deterministic replay of a workflow program over its history.
//!
//! Replay rebuilds the program's state from scratch every time. The program
//! is polled exactly once with a no-op waker: recorded results resolve
//! immediately, so the program runs until it reaches a step whose outcome is
//! not in the history yet. Calls past the end of the recorded steps become
//! new [`Command`]s.

use std::collections::HashMap;
use std::future::Future;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use futures::task::noop_waker_ref;
use serde_json::Value;
use tracing::{debug, instrument};

use crate::activity::panic_message;
use crate::error::{CoreError, Result};
use crate::history::{HistoryEvent, HistoryRecord, HistoryStore, WorkflowRun};
use crate::workflow::{
    Command, Decision, Recorded, RecordedStep, ReplayState, Resolution, Workflow,
    WorkflowContext, WorkflowRegistry, lock_state,
};

/// Outcome of one replay.
#[derive(Debug, Clone, PartialEq)]
pub struct Replay {
    /// What the engine should do next.
    pub decision: Decision,
    /// Query values published by the program up to the replay frontier.
    pub queries: HashMap<String, Value>,
    /// Sequence of the last history event replayed.
    pub history_len: u64,
}

/// Replay `history` through `workflow`.
///
/// Pure: the same history always produces the same replay. Fails with
/// `NonDeterminismDetected` when the program's calls do not line up with the
/// recorded `ActivityScheduled` / `TimerStarted` events.
pub fn replay(
    workflow: &dyn Workflow,
    run: &WorkflowRun,
    history: &[HistoryRecord],
) -> Result<Replay> {
    let corrupted = |details: String| CoreError::NonDeterminismDetected {
        run_id: run.run_id.clone(),
        details,
    };

    let Some(first) = history.first() else {
        return Err(corrupted("history is empty".to_string()));
    };
    let HistoryEvent::WorkflowStarted { input, .. } = &first.event else {
        return Err(corrupted(format!(
            "history starts with {} instead of WorkflowStarted",
            first.event.event_type()
        )));
    };

    let mut steps: Vec<RecordedStep> = Vec::new();
    let mut by_sequence: HashMap<u64, usize> = HashMap::new();
    let mut cancel_requested: Option<Option<String>> = None;

    for record in &history[1..] {
        match &record.event {
            HistoryEvent::ActivityScheduled { activity_type, .. } => {
                by_sequence.insert(record.sequence, steps.len());
                steps.push(RecordedStep {
                    sequence: record.sequence,
                    kind: Recorded::Activity {
                        activity_type: activity_type.clone(),
                    },
                    resolution: None,
                });
            }
            HistoryEvent::TimerStarted { fire_at, .. } => {
                by_sequence.insert(record.sequence, steps.len());
                steps.push(RecordedStep {
                    sequence: record.sequence,
                    kind: Recorded::Timer { fire_at: *fire_at },
                    resolution: None,
                });
            }
            HistoryEvent::ActivityCompleted {
                scheduled_event_id,
                result,
            } => {
                resolve(
                    &mut steps,
                    &by_sequence,
                    *scheduled_event_id,
                    Resolution::Completed(result.clone()),
                )
                .map_err(corrupted)?;
            }
            HistoryEvent::ActivityFailed {
                scheduled_event_id,
                failure,
                ..
            } => {
                resolve(
                    &mut steps,
                    &by_sequence,
                    *scheduled_event_id,
                    Resolution::Failed(failure.clone()),
                )
                .map_err(corrupted)?;
            }
            HistoryEvent::TimerFired { started_event_id } => {
                resolve(&mut steps, &by_sequence, *started_event_id, Resolution::Fired)
                    .map_err(corrupted)?;
            }
            HistoryEvent::WorkflowCancelRequested { reason } => {
                if cancel_requested.is_none() {
                    cancel_requested = Some(reason.clone());
                }
            }
            HistoryEvent::WorkflowStarted { .. } => {
                return Err(corrupted(format!(
                    "second WorkflowStarted at event {}",
                    record.sequence
                )));
            }
            HistoryEvent::WorkflowCompleted { .. }
            | HistoryEvent::WorkflowFailed { .. }
            | HistoryEvent::WorkflowCancelled { .. } => {}
        }
    }

    let recorded_steps = steps.len();
    let state = Arc::new(Mutex::new(ReplayState::new(steps, first.recorded_at)));
    let ctx = WorkflowContext::new(run.run_ref(), state.clone());

    let mut program = workflow.run(ctx, input.clone());
    let mut cx = Context::from_waker(noop_waker_ref());
    let polled = catch_unwind(AssertUnwindSafe(|| program.as_mut().poll(&mut cx)));
    drop(program);

    let mut state = lock_state(&state);
    let queries = std::mem::take(&mut state.queries);
    let history_len = history.last().map(|r| r.sequence).unwrap_or_default();

    if let Some(reason) = cancel_requested {
        return Ok(Replay {
            decision: Decision::Commands(vec![Command::CancelWorkflow { reason }]),
            queries,
            history_len,
        });
    }

    if let Some(details) = state.mismatch.take() {
        return Err(corrupted(details));
    }

    let finished = |command: Command, state: &ReplayState| {
        if state.next_ordinal < recorded_steps {
            Err(corrupted(format!(
                "workflow finished after {} of {} recorded steps",
                state.next_ordinal, recorded_steps
            )))
        } else {
            Ok(Decision::Commands(vec![command]))
        }
    };

    let decision = match polled {
        Ok(Poll::Ready(Ok(result))) => finished(Command::CompleteWorkflow { result }, &*state)?,
        Ok(Poll::Ready(Err(err))) => finished(
            Command::FailWorkflow {
                error: err.to_string(),
            },
            &*state,
        )?,
        Err(panic) => Decision::Commands(vec![Command::FailWorkflow {
            error: format!("workflow panicked: {}", panic_message(panic.as_ref())),
        }]),
        Ok(Poll::Pending) if state.commands.is_empty() => Decision::Suspend,
        Ok(Poll::Pending) => Decision::Commands(std::mem::take(&mut state.commands)),
    };

    Ok(Replay {
        decision,
        queries,
        history_len,
    })
}

fn resolve(
    steps: &mut [RecordedStep],
    by_sequence: &HashMap<u64, usize>,
    target: u64,
    resolution: Resolution,
) -> std::result::Result<(), String> {
    let index = by_sequence
        .get(&target)
        .copied()
        .ok_or_else(|| format!("resolution refers to unknown event {}", target))?;
    let step = &mut steps[index];
    let compatible = matches!(
        (&step.kind, &resolution),
        (Recorded::Activity { .. }, Resolution::Completed(_))
            | (Recorded::Activity { .. }, Resolution::Failed(_))
            | (Recorded::Timer { .. }, Resolution::Fired)
    );
    if !compatible {
        return Err(format!("event {} resolved by the wrong kind of event", target));
    }
    step.resolution = Some(resolution);
    Ok(())
}

/// Replays runs from the history store.
#[derive(Clone)]
pub struct WorkflowRunner {
    store: Arc<dyn HistoryStore>,
    registry: Arc<WorkflowRegistry>,
}

impl WorkflowRunner {
    /// Create a runner over a store and a set of workflow implementations.
    pub fn new(store: Arc<dyn HistoryStore>, registry: Arc<WorkflowRegistry>) -> Self {
        Self { store, registry }
    }

    /// The workflows this runner can replay.
    pub fn registry(&self) -> &WorkflowRegistry {
        &self.registry
    }

    /// Replay a run over the given history.
    pub fn replay(&self, run: &WorkflowRun, history: &[HistoryRecord]) -> Result<Replay> {
        let workflow = self.registry.get(&run.workflow_type).ok_or_else(|| {
            CoreError::WorkflowTypeNotRegistered {
                workflow_type: run.workflow_type.clone(),
            }
        })?;
        replay(workflow.as_ref(), run, history)
    }

    /// Read the full history of a run and replay it.
    #[instrument(skip(self))]
    pub async fn decide(&self, run_id: &str) -> Result<(WorkflowRun, Replay)> {
        let run = self
            .store
            .get_run(run_id)
            .await?
            .ok_or_else(|| CoreError::RunNotFound {
                run_id: run_id.to_string(),
            })?;
        let history = self.store.read(run_id, 0).await?;
        let replay = self.replay(&run, &history)?;
        debug!(
            workflow_id = %run.workflow_id,
            history_len = replay.history_len,
            decision = ?replay.decision,
            "Replayed workflow"
        );
        Ok((run, replay))
    }
}
