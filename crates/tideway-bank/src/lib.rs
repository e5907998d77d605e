// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! # tideway-bank
//!
//! Money-transfer and print-numbers workflows running on tideway-core, and
//! the `tideway-bank` CLI that drives them.
//!
//! | Command | Description |
//! |---------|-------------|
//! | `worker` | Serve both task queues until Ctrl-C |
//! | `transfer` | Start (or attach to) a money transfer and print its result |
//! | `print-numbers` | Start (or attach to) the print-numbers workflow |
//! | `query` | Read a transfer's `get_state` query |
//! | `cancel` | Request cancellation of a running workflow |
//! | `move-money` | Transfer without the engine, retrying each HTTP call |

#![deny(missing_docs)]

pub mod accounts;
pub mod activities;
pub mod cli;
pub mod naive;
pub mod workflows;

use std::sync::Arc;

use tideway_core::{Engine, Worker, WorkerOptions, WorkflowRegistry};

use crate::accounts::AccountsApi;
use crate::activities::{PrintNumber, bank_activities};
use crate::workflows::{MoneyTransferWorkflow, PrintNumbersWorkflow};

/// Queue serving money transfers.
pub const TRANSFER_TASK_QUEUE: &str = "money-transfer-task-queue";

/// Queue serving the print-numbers workflow.
pub const PRINT_NUMBERS_TASK_QUEUE: &str = "print-numbers-task-queue";

/// Workflow definitions, used by clients to answer queries.
pub fn registry() -> WorkflowRegistry {
    let mut registry = WorkflowRegistry::new();
    registry.register(Arc::new(MoneyTransferWorkflow::new()));
    registry.register(Arc::new(PrintNumbersWorkflow::new()));
    registry
}

/// Worker for the money-transfer queue.
pub fn transfer_worker(
    engine: Arc<Engine>,
    mut options: WorkerOptions,
    api: Arc<dyn AccountsApi>,
) -> Worker {
    options.task_queue = TRANSFER_TASK_QUEUE.to_string();
    bank_activities(api).into_iter().fold(
        Worker::new(engine, options).register_workflow(Arc::new(MoneyTransferWorkflow::new())),
        Worker::register_activity,
    )
}

/// Worker for the print-numbers queue.
pub fn print_numbers_worker(engine: Arc<Engine>, mut options: WorkerOptions) -> Worker {
    options.task_queue = PRINT_NUMBERS_TASK_QUEUE.to_string();
    Worker::new(engine, options)
        .register_workflow(Arc::new(PrintNumbersWorkflow::new()))
        .register_activity(Arc::new(PrintNumber))
}
