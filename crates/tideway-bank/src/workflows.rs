// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The money-transfer and print-numbers workflows.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tideway_core::{
    ActivityOptions, RetryPolicy, RetryStrategy, Workflow, WorkflowContext, WorkflowError,
};
use tracing::info;

use crate::activities::{
    BalanceResult, CHECK_BALANCE, CheckBalanceInput, DEPOSIT, PRINT_NUMBER, TransactionInput,
    TransactionResult, WITHDRAW,
};

/// Workflow type of [`MoneyTransferWorkflow`].
pub const MONEY_TRANSFER: &str = "money_transfer";
/// Workflow type of [`PrintNumbersWorkflow`].
pub const PRINT_NUMBERS: &str = "print_numbers";
/// Query exposing [`TransferState`].
pub const GET_STATE: &str = "get_state";

/// Input of a transfer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferInput {
    /// Account the money leaves.
    pub from_account: String,
    /// Account the money goes to.
    pub to_account: String,
    /// Amount to move.
    pub amount: f64,
}

/// Result of a completed transfer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferResult {
    /// Always true for a returned result; failures fail the run.
    pub success: bool,
    /// Source account.
    pub from_account: String,
    /// Destination account.
    pub to_account: String,
    /// Amount moved.
    pub amount: f64,
    /// Source balance before the transfer.
    pub from_start: f64,
    /// Destination balance before the transfer.
    pub to_start: f64,
    /// Source balance after the transfer.
    pub from_final: f64,
    /// Destination balance after the transfer.
    pub to_final: f64,
}

/// Progress published through the `get_state` query.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TransferState {
    /// The transfer being executed.
    pub input: Option<TransferInput>,
    /// RUNNING, COMPLETED or FAILED.
    pub status: String,
    /// Step the workflow is waiting on.
    pub current_step: String,
    /// Source balance before the transfer.
    pub from_start: Option<f64>,
    /// Destination balance before the transfer.
    pub to_start: Option<f64>,
    /// Source balance after the transfer.
    pub from_final: Option<f64>,
    /// Destination balance after the transfer.
    pub to_final: Option<f64>,
    /// Failure message, if the transfer failed.
    pub error: Option<String>,
}

/// Checks both balances, withdraws, deposits, and reads the final balances.
///
/// There is no compensation: if the deposit exhausts its retries after the
/// withdrawal succeeded, the run fails with the money withdrawn.
pub struct MoneyTransferWorkflow {
    options: ActivityOptions,
}

impl MoneyTransferWorkflow {
    /// 10 s per attempt, three retries starting at one second.
    pub fn new() -> Self {
        Self {
            options: ActivityOptions::new(Duration::from_secs(10)).with_retry(RetryPolicy::new(
                3,
                1000,
                RetryStrategy::ExponentialBackoff,
            )),
        }
    }

    /// Use different options for every activity call.
    pub fn with_activity_options(options: ActivityOptions) -> Self {
        Self { options }
    }

    async fn balance(&self, ctx: &WorkflowContext, account_id: &str) -> Result<f64, WorkflowError> {
        let result: BalanceResult = ctx
            .call_activity(
                CHECK_BALANCE,
                &CheckBalanceInput {
                    account_id: account_id.to_string(),
                },
                self.options.clone(),
            )
            .await?;
        Ok(result.balance)
    }

    async fn transact(
        &self,
        ctx: &WorkflowContext,
        activity_type: &str,
        account_id: &str,
        amount: f64,
    ) -> Result<TransactionResult, WorkflowError> {
        ctx.call_activity(
            activity_type,
            &TransactionInput {
                account_id: account_id.to_string(),
                amount,
            },
            self.options.clone(),
        )
        .await
    }

    async fn transfer(
        &self,
        ctx: &WorkflowContext,
        input: &TransferInput,
        state: &mut TransferState,
    ) -> Result<TransferResult, WorkflowError> {
        let step = |state: &mut TransferState, name: &str| -> Result<(), WorkflowError> {
            state.current_step = name.to_string();
            ctx.set_query_state(GET_STATE, &*state)
        };

        if input.amount.is_nan() || input.amount <= 0.0 {
            return Err(WorkflowError::application("amount must be positive"));
        }

        step(state, "check_balance")?;
        let from_start = self.balance(ctx, &input.from_account).await?;
        let to_start = self.balance(ctx, &input.to_account).await?;
        state.from_start = Some(from_start);
        state.to_start = Some(to_start);

        step(state, "withdraw")?;
        let withdrawn = self
            .transact(ctx, WITHDRAW, &input.from_account, input.amount)
            .await?;
        if !ctx.is_replaying() {
            info!(
                account_id = %input.from_account,
                new_balance = withdrawn.new_balance,
                "Withdrawal recorded"
            );
        }

        step(state, "deposit")?;
        let deposited = self
            .transact(ctx, DEPOSIT, &input.to_account, input.amount)
            .await?;
        if !ctx.is_replaying() {
            info!(
                account_id = %input.to_account,
                new_balance = deposited.new_balance,
                "Deposit recorded"
            );
        }

        step(state, "final_balance")?;
        let from_final = self.balance(ctx, &input.from_account).await?;
        let to_final = self.balance(ctx, &input.to_account).await?;
        state.from_final = Some(from_final);
        state.to_final = Some(to_final);

        Ok(TransferResult {
            success: true,
            from_account: input.from_account.clone(),
            to_account: input.to_account.clone(),
            amount: input.amount,
            from_start,
            to_start,
            from_final,
            to_final,
        })
    }
}

impl Default for MoneyTransferWorkflow {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Workflow for MoneyTransferWorkflow {
    fn workflow_type(&self) -> &str {
        MONEY_TRANSFER
    }

    fn queries(&self) -> &[&'static str] {
        &[GET_STATE]
    }

    async fn run(&self, ctx: WorkflowContext, input: Value) -> Result<Value, WorkflowError> {
        let input: TransferInput = serde_json::from_value(input)?;
        let mut state = TransferState {
            input: Some(input.clone()),
            status: "RUNNING".to_string(),
            current_step: "start".to_string(),
            ..Default::default()
        };
        ctx.set_query_state(GET_STATE, &state)?;

        if !ctx.is_replaying() {
            info!(
                workflow_id = ctx.workflow_id(),
                from = %input.from_account,
                to = %input.to_account,
                amount = input.amount,
                "Starting money transfer"
            );
        }

        let outcome = self.transfer(&ctx, &input, &mut state).await;
        match &outcome {
            Ok(_) => {
                state.status = "COMPLETED".to_string();
                state.current_step = "done".to_string();
            }
            Err(e) => {
                state.status = "FAILED".to_string();
                state.error = Some(e.to_string());
            }
        }
        ctx.set_query_state(GET_STATE, &state)?;

        Ok(serde_json::to_value(outcome?)?)
    }
}

/// Prints 1 through 10, sleeping durably between numbers.
pub struct PrintNumbersWorkflow {
    interval: Duration,
}

impl PrintNumbersWorkflow {
    /// Three seconds between numbers.
    pub fn new() -> Self {
        Self::with_interval(Duration::from_secs(3))
    }

    /// Custom sleep between numbers.
    pub fn with_interval(interval: Duration) -> Self {
        Self { interval }
    }
}

impl Default for PrintNumbersWorkflow {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Workflow for PrintNumbersWorkflow {
    fn workflow_type(&self) -> &str {
        PRINT_NUMBERS
    }

    async fn run(&self, ctx: WorkflowContext, _input: Value) -> Result<Value, WorkflowError> {
        for counter in 1..=10u32 {
            ctx.call_activity::<_, Value>(
                PRINT_NUMBER,
                &counter,
                ActivityOptions::new(Duration::from_secs(10)),
            )
            .await?;
            if counter < 10 {
                ctx.sleep(self.interval).await;
            }
        }
        Ok(json!("Workflow completed"))
    }
}
