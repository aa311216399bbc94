// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Connection retry with exponential backoff.
//!
//! Used when opening store connections. The primary must come up at bootstrap
//! or the process has no usable store, so it gets a bounded number of attempts
//! and then surfaces the last error. The mirror goes through the same policy
//! but its final failure only downgrades to the soft-mirror alias.
//!
//! # Example
//!
//! ```
//! use failover_mirror::RetryPolicy;
//! use std::time::Duration;
//!
//! let policy = RetryPolicy::bootstrap(3);
//! assert_eq!(policy.max_attempts, 3);
//! assert_eq!(policy.delay_before(2), Duration::from_millis(200));
//! ```

use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{info, warn};

/// Backoff policy for connection attempts.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first one (minimum 1)
    pub max_attempts: usize,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::bootstrap(3)
    }
}

impl RetryPolicy {
    /// Bootstrap connects: fast backoff, fail after `max_attempts`.
    #[must_use]
    pub fn bootstrap(max_attempts: usize) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(2),
            factor: 2.0,
        }
    }

    /// Single attempt, no waiting.
    #[must_use]
    pub fn once() -> Self {
        Self {
            max_attempts: 1,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            factor: 1.0,
        }
    }

    /// Delay to wait before attempt number `attempt` (1-based; attempt 1 is immediate).
    #[must_use]
    pub fn delay_before(&self, attempt: usize) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let mut delay = self.initial_delay;
        for _ in 2..attempt {
            delay = delay.mul_f64(self.factor).min(self.max_delay);
        }
        delay.min(self.max_delay)
    }
}

/// Run `operation` until it succeeds or the policy runs out of attempts.
pub async fn retry<F, Fut, T, E>(
    operation_name: &str,
    policy: &RetryPolicy,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        match operation().await {
            Ok(val) => {
                if attempt > 1 {
                    info!(operation = operation_name, attempt, "Succeeded after retry");
                }
                return Ok(val);
            }
            Err(err) if attempt >= max_attempts => {
                warn!(operation = operation_name, attempt, error = %err, "Giving up");
                return Err(err);
            }
            Err(err) => {
                attempt += 1;
                let delay = policy.delay_before(attempt);
                warn!(
                    operation = operation_name,
                    attempt = attempt - 1,
                    max_attempts,
                    error = %err,
                    ?delay,
                    "Attempt failed, retrying"
                );
                sleep(delay).await;
            }
        }
    }
}
