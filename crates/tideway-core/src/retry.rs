// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Retry policy applied by the engine around activity execution.
//!
//! The policy is recorded inside each `ActivityScheduled` event, so retries
//! after a worker restart use exactly the policy the workflow asked for.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// How the delay between attempts grows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryStrategy {
    /// Exponential backoff: delay * 2^(attempt-1)
    ///
    /// First retry: delay * 1
    /// Second retry: delay * 2
    /// Third retry: delay * 4
    /// ...
    #[default]
    ExponentialBackoff,
}

/// Retry behavior for one activity.
///
/// There is no jitter. `max_delay_ms` is unset by default, so delays grow
/// without bound until the retry budget is exhausted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of retry attempts (0 = no retries, just one attempt).
    pub max_retries: u32,
    /// Base delay between retries in milliseconds.
    pub delay_ms: u64,
    /// Retry strategy for calculating delays.
    #[serde(default)]
    pub strategy: RetryStrategy,
    /// Upper bound for a single delay.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_delay_ms: Option<u64>,
}

impl RetryPolicy {
    /// Create a new retry policy without a delay cap.
    pub fn new(max_retries: u32, delay_ms: u64, strategy: RetryStrategy) -> Self {
        Self {
            max_retries,
            delay_ms,
            strategy,
            max_delay_ms: None,
        }
    }

    /// A policy that never retries.
    pub fn none() -> Self {
        Self::new(0, 0, RetryStrategy::ExponentialBackoff)
    }

    /// Cap every delay at `max_delay_ms`.
    pub fn with_max_delay_ms(mut self, max_delay_ms: u64) -> Self {
        self.max_delay_ms = Some(max_delay_ms);
        self
    }

    /// Total attempts allowed, including the first one.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Whether another attempt is allowed after `attempt` (1-indexed) failed.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts()
    }

    /// Calculate delay for a given attempt (1-indexed).
    ///
    /// Returns the duration to wait before the given retry attempt.
    /// Attempt 1 is the first retry (after the initial failure).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let multiplier = match self.strategy {
            RetryStrategy::ExponentialBackoff => 2u64.saturating_pow(attempt.saturating_sub(1)),
        };
        let delay = self.delay_ms.saturating_mul(multiplier);
        let delay = match self.max_delay_ms {
            Some(cap) => delay.min(cap),
            None => delay,
        };
        Duration::from_millis(delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 0,
            delay_ms: 1000,
            strategy: RetryStrategy::default(),
            max_delay_ms: None,
        }
    }
}
