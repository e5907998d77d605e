// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-memory history store.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use super::{
    ActivityLease, HistoryEvent, HistoryRecord, HistoryStore, NewRun, RunStatus, StartOutcome,
    WorkflowRun, check_batch,
};
use crate::error::{CoreError, Result};

#[derive(Default)]
struct RunEntry {
    run: Option<WorkflowRun>,
    events: Vec<HistoryRecord>,
    resolved: HashSet<u64>,
    leases: HashMap<u64, ActivityLease>,
}

/// History store kept in process memory. Nothing survives a restart.
#[derive(Default)]
pub struct InMemoryHistory {
    runs: RwLock<HashMap<String, RunEntry>>,
}

impl InMemoryHistory {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

fn not_found(run_id: &str) -> CoreError {
    CoreError::RunNotFound {
        run_id: run_id.to_string(),
    }
}

#[async_trait]
impl HistoryStore for InMemoryHistory {
    async fn start_run(&self, new_run: NewRun) -> Result<StartOutcome> {
        let mut runs = self.runs.write().await;

        let existing = runs
            .values()
            .filter_map(|entry| entry.run.as_ref())
            .find(|run| run.workflow_id == new_run.workflow_id && !run.status.is_terminal());
        if let Some(run) = existing {
            return Ok(StartOutcome {
                run: run.clone(),
                created: false,
            });
        }

        let now = Utc::now();
        let run = WorkflowRun {
            workflow_id: new_run.workflow_id.clone(),
            run_id: new_run.run_id.clone(),
            workflow_type: new_run.workflow_type.clone(),
            task_queue: new_run.task_queue.clone(),
            status: RunStatus::Running,
            start_time: now,
            close_time: None,
            input: new_run.input.clone(),
            result: None,
            error: None,
            corruption: None,
        };
        let started = HistoryRecord {
            run_id: run.run_id.clone(),
            sequence: 1,
            event: new_run.started_event(),
            recorded_at: now,
        };

        runs.insert(
            run.run_id.clone(),
            RunEntry {
                run: Some(run.clone()),
                events: vec![started],
                resolved: HashSet::new(),
                leases: HashMap::new(),
            },
        );

        Ok(StartOutcome { run, created: true })
    }

    async fn get_run(&self, run_id: &str) -> Result<Option<WorkflowRun>> {
        let runs = self.runs.read().await;
        Ok(runs.get(run_id).and_then(|entry| entry.run.clone()))
    }

    async fn find_run(&self, workflow_id: &str) -> Result<Option<WorkflowRun>> {
        let runs = self.runs.read().await;
        let mut candidates: Vec<&WorkflowRun> = runs
            .values()
            .filter_map(|entry| entry.run.as_ref())
            .filter(|run| run.workflow_id == workflow_id)
            .collect();
        candidates.sort_by_key(|run| (!run.status.is_terminal(), run.start_time));
        Ok(candidates.last().map(|run| (*run).clone()))
    }

    async fn list_open_runs(&self, task_queue: Option<&str>) -> Result<Vec<WorkflowRun>> {
        let runs = self.runs.read().await;
        let mut open: Vec<WorkflowRun> = runs
            .values()
            .filter_map(|entry| entry.run.as_ref())
            .filter(|run| !run.status.is_terminal())
            .filter(|run| task_queue.is_none_or(|queue| run.task_queue == queue))
            .cloned()
            .collect();
        open.sort_by_key(|run| run.start_time);
        Ok(open)
    }

    async fn append_batch(
        &self,
        run_id: &str,
        expected_tail: Option<u64>,
        events: Vec<HistoryEvent>,
    ) -> Result<Vec<u64>> {
        let mut runs = self.runs.write().await;
        let entry = runs.get_mut(run_id).ok_or_else(|| not_found(run_id))?;
        let run = entry.run.as_mut().ok_or_else(|| not_found(run_id))?;

        let tail = entry.events.len() as u64;
        let closing = check_batch(run, tail, expected_tail, &events, |seq| {
            entry.resolved.contains(&seq)
        })?;

        let now = Utc::now();
        let mut sequences = Vec::with_capacity(events.len());
        for (offset, event) in events.into_iter().enumerate() {
            let sequence = tail + offset as u64 + 1;
            if let Some(target) = event.resolves() {
                entry.resolved.insert(target);
            }
            entry.events.push(HistoryRecord {
                run_id: run_id.to_string(),
                sequence,
                event,
                recorded_at: now,
            });
            sequences.push(sequence);
        }

        if let Some(closing) = closing {
            run.status = closing.status;
            run.result = closing.result;
            run.error = closing.error;
            run.close_time = Some(now);
        }

        Ok(sequences)
    }

    async fn read(&self, run_id: &str, after_sequence: u64) -> Result<Vec<HistoryRecord>> {
        let runs = self.runs.read().await;
        let entry = runs.get(run_id).ok_or_else(|| not_found(run_id))?;
        Ok(entry
            .events
            .iter()
            .filter(|record| record.sequence > after_sequence)
            .cloned()
            .collect())
    }

    async fn claim_activity(
        &self,
        run_id: &str,
        scheduled_event_id: u64,
        owner: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<Option<u32>> {
        let mut runs = self.runs.write().await;
        let entry = runs.get_mut(run_id).ok_or_else(|| not_found(run_id))?;

        let attempt = match entry.leases.get(&scheduled_event_id) {
            Some(lease) => match lease.next_claim(owner, Utc::now()) {
                Some(attempt) => attempt,
                None => return Ok(None),
            },
            None => 1,
        };
        entry.leases.insert(
            scheduled_event_id,
            ActivityLease {
                owner: owner.to_string(),
                attempt,
                running: true,
                expires_at,
            },
        );
        Ok(Some(attempt))
    }

    async fn release_activity(
        &self,
        run_id: &str,
        scheduled_event_id: u64,
        owner: &str,
        next_attempt: u32,
        expires_at: DateTime<Utc>,
    ) -> Result<()> {
        let mut runs = self.runs.write().await;
        let entry = runs.get_mut(run_id).ok_or_else(|| not_found(run_id))?;
        entry.leases.insert(
            scheduled_event_id,
            ActivityLease {
                owner: owner.to_string(),
                attempt: next_attempt,
                running: false,
                expires_at,
            },
        );
        Ok(())
    }

    async fn activity_lease(
        &self,
        run_id: &str,
        scheduled_event_id: u64,
    ) -> Result<Option<ActivityLease>> {
        let runs = self.runs.read().await;
        let entry = runs.get(run_id).ok_or_else(|| not_found(run_id))?;
        Ok(entry.leases.get(&scheduled_event_id).cloned())
    }

    async fn mark_corrupted(&self, run_id: &str, details: &str) -> Result<()> {
        let mut runs = self.runs.write().await;
        let run = runs
            .get_mut(run_id)
            .and_then(|entry| entry.run.as_mut())
            .ok_or_else(|| not_found(run_id))?;
        run.corruption = Some(details.to_string());
        Ok(())
    }

    async fn purge_closed_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let mut runs = self.runs.write().await;
        let before = runs.len();
        runs.retain(|_, entry| match &entry.run {
            Some(run) => !matches!(run.close_time, Some(closed) if closed < cutoff),
            None => true,
        });
        Ok((before - runs.len()) as u64)
    }

    async fn health_check(&self) -> Result<()> {
        Ok(())
    }

    async fn close(&self) {}
}
