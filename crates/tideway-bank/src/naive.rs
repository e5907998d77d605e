// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Transfer without a workflow engine: direct calls wrapped in retries.
//!
//! Nothing is recorded. A crash or a deposit that keeps failing after the
//! withdrawal leaves the accounts inconsistent, which
//! [`NaiveTransferError::PartialFailure`] reports.

use std::future::Future;
use std::time::Duration;

use tideway_core::{RetryPolicy, RetryStrategy};
use tracing::{info, warn};

use crate::accounts::{AccountsApi, AccountsError, Transaction};

/// Per-request timeout used by the naive transfer.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Three retries starting at one second.
pub fn default_policy() -> RetryPolicy {
    RetryPolicy::new(3, 1000, RetryStrategy::ExponentialBackoff)
}

/// Outcome of a naive transfer.
#[derive(Debug, Clone, PartialEq)]
pub struct NaiveTransfer {
    /// Source balance before.
    pub from_start: f64,
    /// Destination balance before.
    pub to_start: f64,
    /// The withdrawal.
    pub withdrawn: Transaction,
    /// The deposit.
    pub deposited: Transaction,
    /// Source balance after, if it could be read.
    pub from_final: Option<f64>,
    /// Destination balance after, if it could be read.
    pub to_final: Option<f64>,
}

/// Why a naive transfer stopped.
#[derive(Debug, thiserror::Error)]
pub enum NaiveTransferError {
    /// A balance could not be read; nothing moved.
    #[error("checking balance of {account_id} failed: {source}")]
    Balance {
        /// Account being read.
        account_id: String,
        /// Last error.
        source: AccountsError,
    },

    /// The withdrawal failed; nothing moved.
    #[error("withdrawing from {account_id} failed: {source}")]
    Withdraw {
        /// Source account.
        account_id: String,
        /// Last error.
        source: AccountsError,
    },

    /// The money left the source account but never arrived.
    #[error("money was withdrawn from {from_account} but not deposited to {to_account}: {source}")]
    PartialFailure {
        /// Source account, already debited.
        from_account: String,
        /// Destination account, not credited.
        to_account: String,
        /// Last deposit error.
        source: AccountsError,
    },
}

/// Run `op` until it succeeds or `policy` runs out of attempts.
pub async fn with_retries<T, F, Fut>(
    policy: &RetryPolicy,
    description: &str,
    mut op: F,
) -> Result<T, AccountsError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, AccountsError>>,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if policy.should_retry(attempt) => {
                let delay = policy.delay_for_attempt(attempt);
                warn!(
                    attempt,
                    max_retries = policy.max_retries,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    error = %e,
                    "Retrying {}",
                    description
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => {
                warn!(attempts = attempt, error = %e, "All retry attempts exhausted for {}", description);
                return Err(e);
            }
        }
    }
}

/// Move `amount` from one account to another with plain HTTP calls.
pub async fn move_money(
    api: &dyn AccountsApi,
    policy: &RetryPolicy,
    from_account: &str,
    to_account: &str,
    amount: f64,
) -> Result<NaiveTransfer, NaiveTransferError> {
    info!(from_account, to_account, amount, "Starting naive money transfer");

    let balance_of = |account_id: &str| {
        let account_id = account_id.to_string();
        async move {
            with_retries(policy, &format!("checking {account_id} balance"), || {
                api.balance(&account_id)
            })
            .await
            .map_err(|source| NaiveTransferError::Balance {
                account_id: account_id.clone(),
                source,
            })
        }
    };

    let from_start = balance_of(from_account).await?;
    let to_start = balance_of(to_account).await?;

    let withdrawn = with_retries(policy, &format!("withdrawing from {from_account}"), || {
        api.withdraw(from_account, amount)
    })
    .await
    .map_err(|source| NaiveTransferError::Withdraw {
        account_id: from_account.to_string(),
        source,
    })?;

    let deposited = match with_retries(policy, &format!("depositing to {to_account}"), || {
        api.deposit(to_account, amount)
    })
    .await
    {
        Ok(tx) => tx,
        Err(source) => {
            warn!(
                from_account,
                to_account,
                amount,
                "Money was withdrawn but not deposited; this is a partial failure"
            );
            return Err(NaiveTransferError::PartialFailure {
                from_account: from_account.to_string(),
                to_account: to_account.to_string(),
                source,
            });
        }
    };

    let from_final = balance_of(from_account).await.ok();
    let to_final = balance_of(to_account).await.ok();
    info!(?from_final, ?to_final, "Naive transfer complete");

    Ok(NaiveTransfer {
        from_start,
        to_start,
        withdrawn,
        deposited,
        from_final,
        to_final,
    })
}
