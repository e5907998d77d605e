// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tideway Core - Durable Workflow Execution
//!
//! This crate runs workflow programs durably. Every step a program takes is
//! recorded in an append-only history; after a crash the program is replayed
//! against that history and continues where it stopped.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐  start / result / query / cancel
//! │    Client    │──────────────────────────────────────────┐
//! └──────────────┘                                          │
//!                                                           ▼
//! ┌──────────────┐  poll / ack   ┌──────────────┐   ┌───────────────┐
//! │    Worker    │◄─────────────►│  Dispatcher  │◄──│    Engine     │
//! │ Runner       │               │ (task queues)│   │ decisions and │
//! │ Executor     │─────────────────────────────────►│ outcomes      │
//! └──────────────┘   outcomes                       └───────┬───────┘
//!                                                           │ append / read
//!                                                           ▼
//!                                                   ┌───────────────┐
//!                                                   │  History Log  │
//!                                                   │   (SQLite)    │
//!                                                   └───────────────┘
//! ```
//!
//! A run moves through three kinds of tasks:
//!
//! | Task | Handled by | Result |
//! |------|------------|--------|
//! | Decision | [`WorkflowRunner`] | Replay the program, append the commands it issued |
//! | Activity | [`ActivityExecutor`] | Run one attempt, append `ActivityCompleted` / `ActivityFailed` or retry |
//! | Timer | [`Engine::fire_timer`] | Append `TimerFired` |
//!
//! # Determinism
//!
//! Workflow code must reach the outside world only through
//! [`WorkflowContext`]. Activities, sleeps and the clock are recorded, so a
//! replay sees exactly the values the first execution saw. A program that
//! issues different calls on replay is flagged as corrupted and stops making
//! progress until an operator intervenes.
//!
//! # Run Status
//!
//! | Status | Description |
//! |--------|-------------|
//! | `RUNNING` | Making progress; the only non-terminal status |
//! | `COMPLETED` | The program returned a value |
//! | `FAILED` | The program returned an error or panicked |
//! | `CANCELLED` | A cancel request was honoured |
//!
//! # Configuration
//!
//! | Variable | Required | Default | Description |
//! |----------|----------|---------|-------------|
//! | `TIDEWAY_DATABASE_URL` | Yes | - | SQLite connection string |
//! | `TIDEWAY_TASK_QUEUE` | No | `default` | Queue a worker polls |
//! | `TIDEWAY_WORKER_SLOTS` | No | `4` | Concurrent tasks per worker |
//! | `TIDEWAY_VISIBILITY_TIMEOUT_MS` | No | `30000` | Unacknowledged task redelivery |
//! | `TIDEWAY_RETENTION_DAYS` | No | - | Purge closed runs after this many days |
//!
//! See [`Config::from_env`] for the full list.

#![deny(missing_docs)]

pub mod activity;
pub mod client;
pub mod config;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod history;
pub mod migrations;
pub mod query;
pub mod retry;
pub mod runner;
pub mod worker;
pub mod workflow;

pub use activity::{
    Activity, ActivityContext, ActivityExecutor, ActivityFailure, ActivityOptions, ActivityResult,
    ActivityTask, FailureKind,
};
pub use client::{Client, StartWorkflowOptions, WorkflowHandle};
pub use config::{Config, ConfigError};
pub use dispatcher::{Dispatcher, Lease, Task, WorkerBinding};
pub use engine::{Engine, EngineOptions, RecoveryReport};
pub use error::{CoreError, Result};
pub use history::{
    ActivityLease, HistoryEvent, HistoryRecord, HistoryStore, InMemoryHistory, RunRef, RunStatus,
    SqliteHistory, WorkflowRun,
};
pub use query::QueryService;
pub use retry::{RetryPolicy, RetryStrategy};
pub use runner::{Replay, WorkflowRunner};
pub use worker::{Worker, WorkerOptions};
pub use workflow::{Command, Decision, Workflow, WorkflowContext, WorkflowError, WorkflowRegistry};
