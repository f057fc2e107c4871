//! Retry policies for transient failures.
//!
//! Two things on the rig fail transiently: a controller that answers a request
//! with a busy error, and the external camera recorder. Both are retried
//! according to a [`RetryPolicy`] instead of looping forever.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;

use crate::limits::MAX_BUSY_RETRIES;

/// Defines a policy for retrying an operation.
///
/// Specifies how many times to retry a failed operation and how long to wait
/// between attempts. The delay doubles after every attempt up to
/// `max_backoff_ms`.
///
/// # Example
///
/// ```rust
/// use scancam_core::error_recovery::RetryPolicy;
/// use std::time::Duration;
///
/// let policy = RetryPolicy {
///     max_attempts: 4,
///     initial_backoff_ms: 50,
///     max_backoff_ms: 300,
/// };
/// assert_eq!(policy.delay_for(1), Duration::from_millis(50));
/// assert_eq!(policy.delay_for(3), Duration::from_millis(200));
/// assert_eq!(policy.delay_for(4), Duration::from_millis(300));
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// The maximum number of retry attempts.
    ///
    /// Does not include the initial try. Set to 0 to disable retries.
    pub max_attempts: u32,

    /// Delay before the first retry, in milliseconds.
    pub initial_backoff_ms: u64,

    /// Upper bound for the delay between retries, in milliseconds.
    pub max_backoff_ms: u64,
}

impl Default for RetryPolicy {
    /// Default policy attempts 5 retries starting at 50ms, capped at 1s.
    fn default() -> Self {
        Self {
            max_attempts: MAX_BUSY_RETRIES,
            initial_backoff_ms: 50,
            max_backoff_ms: 1000,
        }
    }
}

impl RetryPolicy {
    /// Policy with a fixed number of attempts and no delay between them.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_backoff_ms: 0,
            max_backoff_ms: 0,
        }
    }

    /// Delay to wait before retry number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(20);
        let millis = self
            .initial_backoff_ms
            .saturating_mul(1u64 << shift)
            .min(self.max_backoff_ms);
        Duration::from_millis(millis)
    }

    /// Whether another retry is allowed after `attempts_made` retries.
    pub fn allows(&self, attempts_made: u32) -> bool {
        attempts_made < self.max_attempts
    }
}

/// Runs `operation` until it succeeds or the policy is exhausted.
///
/// The operation receives the 1-based attempt number. Between failures the
/// policy's backoff delay is awaited. The last error is returned when every
/// attempt fails.
pub async fn retry_with_backoff<T, E, F, Fut>(policy: &RetryPolicy, mut operation: F) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 1;
    loop {
        match operation(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) if policy.allows(attempt - 1) => {
                tracing::warn!(attempt, error = %e, "Attempt failed, retrying");
                sleep(policy.delay_for(attempt)).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
