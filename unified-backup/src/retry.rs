//! Bounded exponential-backoff retry.

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use tracing::{error, warn};

/// Governs retries for one logical operation.
///
/// `max_retries` counts additional attempts after the first try, so an
/// operation runs at most `max_retries + 1` times. The wait before retry `n`
/// (1-indexed) is `base_delay * 2^(n-1)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
        }
    }

    /// Single attempt, no waiting.
    pub fn none() -> Self {
        Self::new(0, Duration::ZERO)
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Delay before the given 1-indexed retry. Saturates at `Duration::MAX`.
    pub fn delay_for(&self, retry: u32) -> Duration {
        2u32.checked_pow(retry.saturating_sub(1))
            .and_then(|factor| self.base_delay.checked_mul(factor))
            .unwrap_or(Duration::MAX)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_secs(5))
    }
}

/// Run `operation` until it succeeds, fails with a non-transient error, or
/// runs out of retries. The last error is returned unchanged.
pub async fn execute<T, E, Op, Fut, C>(
    policy: &RetryPolicy,
    mut operation: Op,
    is_transient: C,
) -> Result<T, E>
where
    Op: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    C: Fn(&E) -> bool,
    E: Display,
{
    let mut retries = 0u32;

    loop {
        let err = match operation().await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        if !is_transient(&err) {
            if retries > 0 {
                error!(retries, "command failed with a permanent error after retrying");
            }
            return Err(err);
        }

        if retries >= policy.max_retries {
            if retries > 0 {
                error!(retries, "command failed after exhausting retries");
            }
            return Err(err);
        }

        retries += 1;
        let delay = policy.delay_for(retries);
        warn!(
            retry = retries,
            max_retries = policy.max_retries,
            delay_secs = delay.as_secs_f64(),
            error = %err,
            "transient error detected, retrying"
        );
        tokio::time::sleep(delay).await;
    }
}
