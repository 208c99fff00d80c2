use crate::error::{Error, Result};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::debug;

/// Process-wide count of retry attempts (attempts beyond the first).
/// Observability only; nothing reads it for control flow.
static RETRY_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Total retries attempted by this process
pub fn retries_attempted() -> u64 {
    RETRY_COUNTER.load(Ordering::Relaxed)
}

/// Configuration for retry behavior with exponential backoff.
///
/// `max_attempts` counts total attempts including the first, so a policy
/// of 3 makes at most two retries.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the initial one
    pub max_attempts: u32,

    /// Delay before the first retry, in milliseconds
    pub base_delay_ms: u64,

    /// Cap on any single backoff delay, in milliseconds
    pub max_delay_ms: u64,
}

impl RetryPolicy {
    /// Creates a new retry policy with the specified parameters.
    pub fn new(max_attempts: u32, base_delay_ms: u64, max_delay_ms: u64) -> Self {
        Self {
            max_attempts,
            base_delay_ms,
            max_delay_ms,
        }
    }

    /// Returns a policy that makes a single attempt.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            base_delay_ms: 0,
            max_delay_ms: 0,
        }
    }

    /// Calculates the backoff before attempt `attempt` (0-indexed).
    ///
    /// Attempt 0 has no delay; attempt `i` waits `base * 2^(i-1)`,
    /// capped at `max_delay_ms`.
    pub fn backoff_duration(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let exp = (attempt - 1).min(32);
        let delay_ms = self
            .base_delay_ms
            .saturating_mul(1u64 << exp)
            .min(self.max_delay_ms);
        Duration::from_millis(delay_ms)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 500,
            max_delay_ms: 30_000,
        }
    }
}

/// Retries an async operation according to the specified policy.
///
/// Only retries if the error is retryable (as determined by
/// `Error::is_retryable()`); precondition failures like `Offline` or
/// `AuthMissing` surface immediately. The final attempt's error is
/// returned to the caller.
pub async fn retry_with_policy<F, Fut, T>(policy: &RetryPolicy, mut operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let attempts = policy.max_attempts.max(1);
    let mut last_error = None;

    for attempt in 0..attempts {
        if attempt > 0 {
            RETRY_COUNTER.fetch_add(1, Ordering::Relaxed);
            let backoff = policy.backoff_duration(attempt);
            debug!(attempt, backoff_ms = backoff.as_millis() as u64, "retrying");
            tokio::time::sleep(backoff).await;
        }

        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) => {
                if !e.is_retryable() {
                    return Err(e);
                }
                last_error = Some(e);
            }
        }
    }

    Err(last_error.unwrap_or_else(|| Error::Internal("retry exhausted without error".to_string())))
}
