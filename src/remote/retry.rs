//! Bounded retry with exponential backoff for remote operations.
//!
//! Only transient failures are retried (see [`FailureReason::is_retriable`]).
//! The delay before retry `n` (zero-based) is
//! `min(backoff_ms * backoff_factor^n, max_backoff_ms)`:
//!
//! ```rust
//! # use ratesync::remote::RetryPolicy;
//! let policy = RetryPolicy {
//!     max_attempts: 3,
//!     backoff_ms: 1000,      // Start with 1 second
//!     backoff_factor: 2,     // Double each time (1s, 2s, 4s)
//!     max_backoff_ms: 10000, // Cap at 10 seconds
//! };
//! assert_eq!(policy.delay_for(1).as_millis(), 2000);
//! ```

use std::future::Future;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::config::ReconcilerConfig;
use crate::error::FailureReason;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts including the first. Zero behaves as one.
    pub max_attempts: u32,
    pub backoff_ms: u64,
    pub backoff_factor: u64,
    pub max_backoff_ms: u64,
}

impl From<&ReconcilerConfig> for RetryPolicy {
    fn from(config: &ReconcilerConfig) -> Self {
        RetryPolicy {
            max_attempts: config.max_attempts,
            backoff_ms: config.backoff_ms,
            backoff_factor: config.backoff_factor,
            max_backoff_ms: config.max_backoff_ms,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        (&ReconcilerConfig::default()).into()
    }
}

/// Reported before sleeping ahead of a retry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryNotice {
    /// The attempt that just failed (1-based)
    pub failed_attempt: u32,
    pub delay: Duration,
    pub reason: FailureReason,
}

impl RetryPolicy {
    /// Delay before the zero-based `retry_attempt`.
    pub fn delay_for(&self, retry_attempt: u32) -> Duration {
        let exponential = self
            .backoff_ms
            .saturating_mul(self.backoff_factor.saturating_pow(retry_attempt));
        Duration::from_millis(exponential.min(self.max_backoff_ms))
    }

    /// Run `op` until it succeeds, fails permanently, or attempts run out.
    ///
    /// `op` receives the 1-based attempt number. `on_retry` is called once per
    /// scheduled retry, before the backoff sleep.
    pub async fn run<T, F, Fut, N>(&self, mut op: F, mut on_retry: N) -> Result<T, FailureReason>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, FailureReason>>,
        N: FnMut(&RetryNotice),
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match op(attempt).await {
                Ok(value) => return Ok(value),
                Err(reason) if reason.is_retriable() && attempt < max_attempts => {
                    let notice = RetryNotice {
                        failed_attempt: attempt,
                        delay: self.delay_for(attempt - 1),
                        reason,
                    };
                    tracing::debug!(
                        attempt,
                        max_attempts,
                        delay_ms = notice.delay.as_millis() as u64,
                        reason = %notice.reason.to_error_message(),
                        "Retrying remote operation"
                    );
                    on_retry(&notice);
                    tokio::time::sleep(notice.delay).await;
                    attempt += 1;
                }
                Err(reason) => {
                    if reason.is_retriable() {
                        tracing::warn!(attempt, "Retries exhausted");
                    }
                    return Err(reason);
                }
            }
        }
    }
}
