// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Activities backed by the balance service, plus `print_number`.
//!
//! Withdraw and deposit are not idempotent. A redelivered attempt after a
//! worker crash moves the money twice.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tideway_core::{Activity, ActivityContext, ActivityFailure};
use tracing::info;

use crate::accounts::AccountsApi;

/// Activity type names.
pub const CHECK_BALANCE: &str = "check_balance";
/// Withdraw activity.
pub const WITHDRAW: &str = "withdraw";
/// Deposit activity.
pub const DEPOSIT: &str = "deposit";
/// Print activity used by the print-numbers workflow.
pub const PRINT_NUMBER: &str = "print_number";

/// Input of `check_balance`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckBalanceInput {
    /// Account to read.
    pub account_id: String,
}

/// Output of `check_balance`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BalanceResult {
    /// Account that was read.
    pub account_id: String,
    /// Its balance.
    pub balance: f64,
}

/// Input of `withdraw` and `deposit`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionInput {
    /// Account to change.
    pub account_id: String,
    /// Amount to move.
    pub amount: f64,
}

/// Output of `withdraw` and `deposit`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionResult {
    /// Account that changed.
    pub account_id: String,
    /// Balance before.
    pub previous_balance: f64,
    /// Balance after.
    pub new_balance: f64,
    /// Amount moved.
    pub amount: f64,
}

/// Reads an account balance.
pub struct CheckBalance {
    api: Arc<dyn AccountsApi>,
}

#[async_trait]
impl Activity for CheckBalance {
    fn activity_type(&self) -> &str {
        CHECK_BALANCE
    }

    async fn execute(&self, ctx: ActivityContext, input: Value) -> Result<Value, ActivityFailure> {
        let input: CheckBalanceInput = serde_json::from_value(input)?;
        let balance = self.api.balance(&input.account_id).await?;
        info!(
            workflow_id = ctx.workflow_id(),
            account_id = %input.account_id,
            balance,
            "Balance checked"
        );
        Ok(serde_json::to_value(BalanceResult {
            account_id: input.account_id,
            balance,
        })?)
    }
}

#[derive(Clone, Copy)]
enum Direction {
    Withdraw,
    Deposit,
}

/// Moves money out of or into one account.
pub struct Transfer {
    api: Arc<dyn AccountsApi>,
    direction: Direction,
}

#[async_trait]
impl Activity for Transfer {
    fn activity_type(&self) -> &str {
        match self.direction {
            Direction::Withdraw => WITHDRAW,
            Direction::Deposit => DEPOSIT,
        }
    }

    async fn execute(&self, ctx: ActivityContext, input: Value) -> Result<Value, ActivityFailure> {
        let input: TransactionInput = serde_json::from_value(input)?;
        let tx = match self.direction {
            Direction::Withdraw => self.api.withdraw(&input.account_id, input.amount).await?,
            Direction::Deposit => self.api.deposit(&input.account_id, input.amount).await?,
        };
        info!(
            workflow_id = ctx.workflow_id(),
            activity = self.activity_type(),
            attempt = ctx.attempt(),
            account_id = %input.account_id,
            previous_balance = tx.previous_balance,
            new_balance = tx.new_balance,
            "Transaction applied"
        );
        Ok(serde_json::to_value(TransactionResult {
            account_id: input.account_id,
            previous_balance: tx.previous_balance,
            new_balance: tx.new_balance,
            amount: input.amount,
        })?)
    }
}

/// Prints a number to stdout.
pub struct PrintNumber;

#[async_trait]
impl Activity for PrintNumber {
    fn activity_type(&self) -> &str {
        PRINT_NUMBER
    }

    async fn execute(&self, _ctx: ActivityContext, input: Value) -> Result<Value, ActivityFailure> {
        let number: u32 = serde_json::from_value(input)?;
        println!("{number}");
        Ok(Value::Null)
    }
}

/// `check_balance`, `withdraw` and `deposit` over one balance service.
pub fn bank_activities(api: Arc<dyn AccountsApi>) -> Vec<Arc<dyn Activity>> {
    vec![
        Arc::new(CheckBalance { api: api.clone() }),
        Arc::new(Transfer {
            api: api.clone(),
            direction: Direction::Withdraw,
        }),
        Arc::new(Transfer {
            api,
            direction: Direction::Deposit,
        }),
    ]
}
