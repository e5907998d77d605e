// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SQLite-backed history store.
//!
//! The database runs in WAL mode with `synchronous=FULL`, so an append that
//! returned `Ok` survives a process or machine crash. Writes from this process
//! are serialized through one async mutex; other processes sharing the file
//! are serialized by SQLite itself.

use std::collections::HashSet;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous,
};
use tokio::sync::Mutex;
use tracing::{debug, info, instrument};

use super::{
    ActivityLease, HistoryEvent, HistoryRecord, HistoryStore, NewRun, RunStatus, StartOutcome,
    WorkflowRun, check_batch,
};
use crate::error::{CoreError, Result};
use crate::migrations;

const RUN_COLUMNS: &str = "run_id, workflow_id, workflow_type, task_queue, status, input, \
     result, error, corruption, start_time, close_time";

#[derive(sqlx::FromRow)]
struct RunRow {
    run_id: String,
    workflow_id: String,
    workflow_type: String,
    task_queue: String,
    status: String,
    input: String,
    result: Option<String>,
    error: Option<String>,
    corruption: Option<String>,
    start_time: DateTime<Utc>,
    close_time: Option<DateTime<Utc>>,
}

impl TryFrom<RunRow> for WorkflowRun {
    type Error = CoreError;

    fn try_from(row: RunRow) -> Result<Self> {
        Ok(WorkflowRun {
            status: RunStatus::from_str(&row.status)?,
            input: serde_json::from_str(&row.input)?,
            result: row
                .result
                .as_deref()
                .map(|raw| serde_json::from_str(raw))
                .transpose()?,
            workflow_id: row.workflow_id,
            run_id: row.run_id,
            workflow_type: row.workflow_type,
            task_queue: row.task_queue,
            start_time: row.start_time,
            close_time: row.close_time,
            error: row.error,
            corruption: row.corruption,
        })
    }
}

#[derive(sqlx::FromRow)]
struct EventRow {
    run_id: String,
    sequence: i64,
    payload: String,
    recorded_at: DateTime<Utc>,
}

impl TryFrom<EventRow> for HistoryRecord {
    type Error = CoreError;

    fn try_from(row: EventRow) -> Result<Self> {
        Ok(HistoryRecord {
            run_id: row.run_id,
            sequence: row.sequence as u64,
            event: serde_json::from_str(&row.payload)?,
            recorded_at: row.recorded_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct LeaseRow {
    owner: String,
    attempt: i64,
    running: bool,
    expires_at_ms: i64,
}

impl TryFrom<LeaseRow> for ActivityLease {
    type Error = CoreError;

    fn try_from(row: LeaseRow) -> Result<Self> {
        Ok(ActivityLease {
            owner: row.owner,
            attempt: u32::try_from(row.attempt).map_err(|e| CoreError::Serialization {
                details: format!("invalid attempt {}: {}", row.attempt, e),
            })?,
            running: row.running,
            expires_at: DateTime::from_timestamp_millis(row.expires_at_ms).ok_or_else(|| {
                CoreError::Serialization {
                    details: format!("invalid lease expiry {}", row.expires_at_ms),
                }
            })?,
        })
    }
}

fn unique_violation(err: &sqlx::Error) -> Option<String> {
    match err {
        sqlx::Error::Database(db) if db.is_unique_violation() => Some(db.message().to_string()),
        _ => None,
    }
}

/// SQLite-backed history store.
pub struct SqliteHistory {
    pool: SqlitePool,
    write_lock: Mutex<()>,
}

impl SqliteHistory {
    /// Wrap an existing pool. Migrations must already have been applied.
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            write_lock: Mutex::new(()),
        }
    }

    /// Connect to `url`, creating the database if needed, and run migrations.
    ///
    /// In-memory URLs get a single connection so every query sees the same
    /// database.
    pub async fn connect(url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(url)
            .map_err(|e| CoreError::storage("connect", e))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Full)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));

        let max_connections = if url.contains(":memory:") { 1 } else { 5 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await
            .map_err(|e| CoreError::storage("connect", e))?;

        migrations::run_sqlite(&pool).await?;
        info!(url = %url, "History store ready");

        Ok(Self::new(pool))
    }

    /// Open the database file at `path`, creating parent directories.
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                CoreError::storage(
                    "create_dir",
                    format!("Failed to create directory {:?}: {}", parent, e),
                )
            })?;
        }

        Self::connect(&format!("sqlite:{}", path.to_string_lossy())).await
    }

    async fn ensure_run(&self, run_id: &str) -> Result<()> {
        let exists: Option<i64> = sqlx::query_scalar("SELECT 1 FROM workflow_runs WHERE run_id = ?1")
            .bind(run_id)
            .fetch_optional(&self.pool)
            .await?;
        match exists {
            Some(_) => Ok(()),
            None => Err(CoreError::RunNotFound {
                run_id: run_id.to_string(),
            }),
        }
    }

    async fn fetch_running(&self, workflow_id: &str) -> Result<Option<WorkflowRun>> {
        let sql = format!(
            "SELECT {} FROM workflow_runs WHERE workflow_id = ?1 AND status = 'RUNNING'",
            RUN_COLUMNS
        );
        sqlx::query_as::<_, RunRow>(&sql)
            .bind(workflow_id)
            .fetch_optional(&self.pool)
            .await?
            .map(WorkflowRun::try_from)
            .transpose()
    }
}

#[async_trait]
impl HistoryStore for SqliteHistory {
    #[instrument(skip(self, new_run), fields(workflow_id = %new_run.workflow_id))]
    async fn start_run(&self, new_run: NewRun) -> Result<StartOutcome> {
        let _guard = self.write_lock.lock().await;

        if let Some(run) = self.fetch_running(&new_run.workflow_id).await? {
            debug!(run_id = %run.run_id, "Workflow already running");
            return Ok(StartOutcome {
                run,
                created: false,
            });
        }

        let now = Utc::now();
        let input = serde_json::to_string(&new_run.input)?;
        let started = serde_json::to_string(&new_run.started_event())?;

        let mut tx = self.pool.begin().await?;
        let inserted = sqlx::query(
            r#"
            INSERT INTO workflow_runs
                (run_id, workflow_id, workflow_type, task_queue, status, input, start_time)
            VALUES (?1, ?2, ?3, ?4, 'RUNNING', ?5, ?6)
            "#,
        )
        .bind(&new_run.run_id)
        .bind(&new_run.workflow_id)
        .bind(&new_run.workflow_type)
        .bind(&new_run.task_queue)
        .bind(&input)
        .bind(now)
        .execute(&mut *tx)
        .await;

        if let Err(err) = inserted {
            if unique_violation(&err).is_some() {
                // Another process started this workflow between our check and insert.
                drop(tx);
                let run = self.fetch_running(&new_run.workflow_id).await?.ok_or_else(|| {
                    CoreError::storage("start_run", "running run vanished after conflict")
                })?;
                return Ok(StartOutcome {
                    run,
                    created: false,
                });
            }
            return Err(err.into());
        }

        sqlx::query(
            r#"
            INSERT INTO history_events (run_id, sequence, event_type, resolves, payload, recorded_at)
            VALUES (?1, 1, 'WorkflowStarted', NULL, ?2, ?3)
            "#,
        )
        .bind(&new_run.run_id)
        .bind(&started)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(StartOutcome {
            run: WorkflowRun {
                workflow_id: new_run.workflow_id,
                run_id: new_run.run_id,
                workflow_type: new_run.workflow_type,
                task_queue: new_run.task_queue,
                status: RunStatus::Running,
                start_time: now,
                close_time: None,
                input: new_run.input,
                result: None,
                error: None,
                corruption: None,
            },
            created: true,
        })
    }

    async fn get_run(&self, run_id: &str) -> Result<Option<WorkflowRun>> {
        let sql = format!("SELECT {} FROM workflow_runs WHERE run_id = ?1", RUN_COLUMNS);
        sqlx::query_as::<_, RunRow>(&sql)
            .bind(run_id)
            .fetch_optional(&self.pool)
            .await?
            .map(WorkflowRun::try_from)
            .transpose()
    }

    async fn find_run(&self, workflow_id: &str) -> Result<Option<WorkflowRun>> {
        let sql = format!(
            r#"
            SELECT {} FROM workflow_runs
            WHERE workflow_id = ?1
            ORDER BY CASE status WHEN 'RUNNING' THEN 0 ELSE 1 END, start_time DESC
            LIMIT 1
            "#,
            RUN_COLUMNS
        );
        sqlx::query_as::<_, RunRow>(&sql)
            .bind(workflow_id)
            .fetch_optional(&self.pool)
            .await?
            .map(WorkflowRun::try_from)
            .transpose()
    }

    async fn list_open_runs(&self, task_queue: Option<&str>) -> Result<Vec<WorkflowRun>> {
        let sql = format!(
            r#"
            SELECT {} FROM workflow_runs
            WHERE status = 'RUNNING' AND (?1 IS NULL OR task_queue = ?1)
            ORDER BY start_time
            "#,
            RUN_COLUMNS
        );
        sqlx::query_as::<_, RunRow>(&sql)
            .bind(task_queue)
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(WorkflowRun::try_from)
            .collect()
    }

    #[instrument(skip(self, events), fields(count = events.len()))]
    async fn append_batch(
        &self,
        run_id: &str,
        expected_tail: Option<u64>,
        events: Vec<HistoryEvent>,
    ) -> Result<Vec<u64>> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;

        let sql = format!("SELECT {} FROM workflow_runs WHERE run_id = ?1", RUN_COLUMNS);
        let run: WorkflowRun = sqlx::query_as::<_, RunRow>(&sql)
            .bind(run_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| CoreError::RunNotFound {
                run_id: run_id.to_string(),
            })?
            .try_into()?;

        let tail: i64 = sqlx::query_scalar(
            "SELECT COALESCE(MAX(sequence), 0) FROM history_events WHERE run_id = ?1",
        )
        .bind(run_id)
        .fetch_one(&mut *tx)
        .await?;
        let tail = tail as u64;

        let resolved: HashSet<u64> = sqlx::query_scalar::<_, i64>(
            "SELECT resolves FROM history_events WHERE run_id = ?1 AND resolves IS NOT NULL",
        )
        .bind(run_id)
        .fetch_all(&mut *tx)
        .await?
        .into_iter()
        .map(|seq| seq as u64)
        .collect();

        let closing = check_batch(&run, tail, expected_tail, &events, |seq| {
            resolved.contains(&seq)
        })?;

        let now = Utc::now();
        let mut sequences = Vec::with_capacity(events.len());
        for (offset, event) in events.iter().enumerate() {
            let sequence = tail + offset as u64 + 1;
            let inserted = sqlx::query(
                r#"
                INSERT INTO history_events (run_id, sequence, event_type, resolves, payload, recorded_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                "#,
            )
            .bind(run_id)
            .bind(sequence as i64)
            .bind(event.event_type())
            .bind(event.resolves().map(|seq| seq as i64))
            .bind(serde_json::to_string(event)?)
            .bind(now)
            .execute(&mut *tx)
            .await;

            if let Err(err) = inserted {
                return Err(match unique_violation(&err) {
                    Some(message) if message.contains("resolves") => {
                        CoreError::DuplicateResolution {
                            run_id: run_id.to_string(),
                            scheduled_event_id: event.resolves().unwrap_or_default(),
                        }
                    }
                    Some(_) => CoreError::HistoryConflict {
                        run_id: run_id.to_string(),
                        expected: tail,
                        actual: tail + 1,
                    },
                    None => err.into(),
                });
            }
            sequences.push(sequence);
        }

        if let Some(closing) = closing {
            let result = closing
                .result
                .as_ref()
                .map(|value| serde_json::to_string(value))
                .transpose()?;
            sqlx::query(
                r#"
                UPDATE workflow_runs
                SET status = ?1, result = ?2, error = ?3, close_time = ?4
                WHERE run_id = ?5
                "#,
            )
            .bind(closing.status.as_str())
            .bind(result)
            .bind(closing.error)
            .bind(now)
            .bind(run_id)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(sequences)
    }

    async fn read(&self, run_id: &str, after_sequence: u64) -> Result<Vec<HistoryRecord>> {
        self.ensure_run(run_id).await?;

        sqlx::query_as::<_, EventRow>(
            r#"
            SELECT run_id, sequence, payload, recorded_at
            FROM history_events
            WHERE run_id = ?1 AND sequence > ?2
            ORDER BY sequence
            "#,
        )
        .bind(run_id)
        .bind(after_sequence as i64)
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(HistoryRecord::try_from)
        .collect()
    }

    /// One conditional upsert, so processes racing for the same activity
    /// are serialized by SQLite and exactly one of them gets a row back.
    #[instrument(skip(self, expires_at))]
    async fn claim_activity(
        &self,
        run_id: &str,
        scheduled_event_id: u64,
        owner: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<Option<u32>> {
        self.ensure_run(run_id).await?;
        let _guard = self.write_lock.lock().await;

        let attempt: Option<i64> = sqlx::query_scalar(
            r#"
            INSERT INTO activity_leases
                (run_id, scheduled_event_id, owner, attempt, running, expires_at_ms)
            VALUES (?1, ?2, ?3, 1, 1, ?4)
            ON CONFLICT (run_id, scheduled_event_id) DO UPDATE SET
                attempt = CASE
                    WHEN activity_leases.owner != excluded.owner AND activity_leases.running = 1
                    THEN activity_leases.attempt + 1
                    ELSE activity_leases.attempt
                END,
                owner = excluded.owner,
                running = 1,
                expires_at_ms = excluded.expires_at_ms
            WHERE activity_leases.owner = excluded.owner
               OR activity_leases.expires_at_ms <= ?5
            RETURNING attempt
            "#,
        )
        .bind(run_id)
        .bind(scheduled_event_id as i64)
        .bind(owner)
        .bind(expires_at.timestamp_millis())
        .bind(Utc::now().timestamp_millis())
        .fetch_optional(&self.pool)
        .await?;

        match attempt {
            Some(attempt) => {
                let attempt = u32::try_from(attempt).map_err(|e| CoreError::Serialization {
                    details: format!("invalid attempt {}: {}", attempt, e),
                })?;
                Ok(Some(attempt))
            }
            None => {
                debug!("Activity claimed by another owner");
                Ok(None)
            }
        }
    }

    async fn release_activity(
        &self,
        run_id: &str,
        scheduled_event_id: u64,
        owner: &str,
        next_attempt: u32,
        expires_at: DateTime<Utc>,
    ) -> Result<()> {
        self.ensure_run(run_id).await?;
        let _guard = self.write_lock.lock().await;
        sqlx::query(
            r#"
            INSERT INTO activity_leases
                (run_id, scheduled_event_id, owner, attempt, running, expires_at_ms)
            VALUES (?1, ?2, ?3, ?4, 0, ?5)
            ON CONFLICT (run_id, scheduled_event_id) DO UPDATE SET
                owner = excluded.owner,
                attempt = excluded.attempt,
                running = 0,
                expires_at_ms = excluded.expires_at_ms
            "#,
        )
        .bind(run_id)
        .bind(scheduled_event_id as i64)
        .bind(owner)
        .bind(i64::from(next_attempt))
        .bind(expires_at.timestamp_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn activity_lease(
        &self,
        run_id: &str,
        scheduled_event_id: u64,
    ) -> Result<Option<ActivityLease>> {
        sqlx::query_as::<_, LeaseRow>(
            r#"
            SELECT owner, attempt, running, expires_at_ms
            FROM activity_leases
            WHERE run_id = ?1 AND scheduled_event_id = ?2
            "#,
        )
        .bind(run_id)
        .bind(scheduled_event_id as i64)
        .fetch_optional(&self.pool)
        .await?
        .map(ActivityLease::try_from)
        .transpose()
    }

    async fn mark_corrupted(&self, run_id: &str, details: &str) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let updated = sqlx::query("UPDATE workflow_runs SET corruption = ?1 WHERE run_id = ?2")
            .bind(details)
            .bind(run_id)
            .execute(&self.pool)
            .await?;
        if updated.rows_affected() == 0 {
            return Err(CoreError::RunNotFound {
                run_id: run_id.to_string(),
            });
        }
        Ok(())
    }

    async fn purge_closed_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let _guard = self.write_lock.lock().await;
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            DELETE FROM activity_leases WHERE run_id IN (
                SELECT run_id FROM workflow_runs
                WHERE status != 'RUNNING' AND close_time IS NOT NULL AND close_time < ?1
            )
            "#,
        )
        .bind(cutoff)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            DELETE FROM history_events WHERE run_id IN (
                SELECT run_id FROM workflow_runs
                WHERE status != 'RUNNING' AND close_time IS NOT NULL AND close_time < ?1
            )
            "#,
        )
        .bind(cutoff)
        .execute(&mut *tx)
        .await?;

        let deleted = sqlx::query(
            r#"
            DELETE FROM workflow_runs
            WHERE status != 'RUNNING' AND close_time IS NOT NULL AND close_time < ?1
            "#,
        )
        .bind(cutoff)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(deleted.rows_affected())
    }

    async fn health_check(&self) -> Result<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| CoreError::storage("health_check", e))?;
        Ok(())
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}
