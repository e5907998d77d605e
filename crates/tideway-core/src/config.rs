// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration loading from environment variables.

use std::time::Duration;

/// Tideway engine and worker configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// SQLite connection URL for the history log
    pub database_url: String,
    /// Task queue a worker attaches to
    pub task_queue: String,
    /// Number of tasks a worker executes concurrently
    pub worker_slots: usize,
    /// How long a worker poll waits for a task
    pub poll_timeout: Duration,
    /// How long a delivered task may stay unacknowledged before redelivery
    pub visibility_timeout: Duration,
    /// How often a worker re-derives outstanding tasks from the history log
    pub sweep_interval: Duration,
    /// How often clients check for a run result
    pub result_poll_interval: Duration,
    /// How long closed runs are kept (None keeps them forever)
    pub retention: Option<chrono::Duration>,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Required:
    /// - `TIDEWAY_DATABASE_URL`: SQLite connection string
    ///
    /// Optional (with defaults):
    /// - `TIDEWAY_TASK_QUEUE`: task queue name (default: `default`)
    /// - `TIDEWAY_WORKER_SLOTS`: concurrent tasks per worker (default: 4)
    /// - `TIDEWAY_POLL_TIMEOUT_MS`: worker poll timeout (default: 5000)
    /// - `TIDEWAY_VISIBILITY_TIMEOUT_MS`: task visibility timeout (default: 30000)
    /// - `TIDEWAY_SWEEP_INTERVAL_MS`: recovery sweep interval (default: 2000)
    /// - `TIDEWAY_RESULT_POLL_INTERVAL_MS`: client result polling (default: 200)
    /// - `TIDEWAY_RETENTION_DAYS`: closed run retention (default: unset)
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = std::env::var("TIDEWAY_DATABASE_URL")
            .map_err(|_| ConfigError::Missing("TIDEWAY_DATABASE_URL"))?;

        let task_queue =
            std::env::var("TIDEWAY_TASK_QUEUE").unwrap_or_else(|_| "default".to_string());
        if task_queue.trim().is_empty() {
            return Err(ConfigError::Invalid("TIDEWAY_TASK_QUEUE", "must not be empty"));
        }

        let worker_slots: usize = std::env::var("TIDEWAY_WORKER_SLOTS")
            .unwrap_or_else(|_| "4".to_string())
            .parse()
            .ok()
            .filter(|slots| *slots > 0)
            .ok_or(ConfigError::Invalid(
                "TIDEWAY_WORKER_SLOTS",
                "must be a positive integer",
            ))?;

        let retention = match std::env::var("TIDEWAY_RETENTION_DAYS") {
            Ok(days) => {
                let days: i64 = days
                    .parse()
                    .ok()
                    .filter(|d| *d > 0)
                    .ok_or(ConfigError::Invalid(
                        "TIDEWAY_RETENTION_DAYS",
                        "must be a positive integer",
                    ))?;
                Some(chrono::Duration::days(days))
            }
            Err(_) => None,
        };

        Ok(Self {
            database_url,
            task_queue,
            worker_slots,
            poll_timeout: millis_var("TIDEWAY_POLL_TIMEOUT_MS", 5_000)?,
            visibility_timeout: millis_var("TIDEWAY_VISIBILITY_TIMEOUT_MS", 30_000)?,
            sweep_interval: millis_var("TIDEWAY_SWEEP_INTERVAL_MS", 2_000)?,
            result_poll_interval: millis_var("TIDEWAY_RESULT_POLL_INTERVAL_MS", 200)?,
            retention,
        })
    }

    /// Configuration with defaults for the given database URL.
    pub fn with_database_url(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
            task_queue: "default".to_string(),
            worker_slots: 4,
            poll_timeout: Duration::from_millis(5_000),
            visibility_timeout: Duration::from_millis(30_000),
            sweep_interval: Duration::from_millis(2_000),
            result_poll_interval: Duration::from_millis(200),
            retention: None,
        }
    }
}

fn millis_var(key: &'static str, default: u64) -> Result<Duration, ConfigError> {
    let value: u64 = match std::env::var(key) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| ConfigError::Invalid(key, "must be a duration in milliseconds"))?,
        Err(_) => default,
    };
    if value == 0 {
        return Err(ConfigError::Invalid(key, "must be greater than zero"));
    }
    Ok(Duration::from_millis(value))
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),

    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}
