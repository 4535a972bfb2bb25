//! Bounded retry with exponential backoff and jitter.
//!
//! Store failures during hydration and commits, and event publishes after a
//! durable write, all retry locally up to a budget before surfacing.

use std::future::Future;
use std::time::Duration;

use rand::Rng as _;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Retry budget and backoff shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts, including the first one. `0` behaves like `1`.
    pub max_attempts: u32,
    /// Delay before the second attempt.
    pub base_delay: Duration,
    /// Upper bound for any single delay (before jitter).
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// A policy that never retries.
    pub const NONE: Self = Self {
        max_attempts: 1,
        base_delay: Duration::ZERO,
        max_delay: Duration::ZERO,
    };

    /// Build a policy from millisecond values, as found in configuration.
    pub const fn from_millis(max_attempts: u32, base_delay_ms: u64, max_delay_ms: u64) -> Self {
        Self {
            max_attempts,
            base_delay: Duration::from_millis(base_delay_ms),
            max_delay: Duration::from_millis(max_delay_ms),
        }
    }

    /// Backoff before attempt `attempt + 1`, where `attempt` starts at 1.
    ///
    /// `base * 2^(attempt-1)` capped at `max_delay`, plus up to 50% jitter.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base_ms = u64::try_from(self.base_delay.as_millis()).unwrap_or(u64::MAX);
        let max_ms = u64::try_from(self.max_delay.as_millis()).unwrap_or(u64::MAX);
        let exponent = attempt.saturating_sub(1).min(32);
        let backoff = base_ms.saturating_mul(1_u64 << exponent).min(max_ms);
        let jitter = if backoff >= 2 {
            rand::rng().random_range(0..=backoff / 2)
        } else {
            0
        };
        Duration::from_millis(backoff.saturating_add(jitter))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_millis(5, 100, 5_000)
    }
}

/// Run `op` until it succeeds, fails permanently, or the budget runs out.
///
/// Only errors for which `is_transient` returns `true` are retried. The last
/// error is returned unchanged.
///
/// # Errors
///
/// Returns the error of the final attempt.
pub async fn retry<T, E, F, Fut>(
    policy: &RetryPolicy,
    operation: &str,
    is_transient: impl Fn(&E) -> bool,
    mut op: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: core::fmt::Display,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt: u32 = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt < max_attempts && is_transient(&e) => {
                let delay = policy.delay_for(attempt);
                warn!(
                    operation,
                    attempt,
                    max_attempts,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    error = %e,
                    "transient failure, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt = attempt.saturating_add(1);
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    #[test]
    fn delay_grows_and_caps() {
        let policy = RetryPolicy::from_millis(10, 100, 400);
        let first = policy.delay_for(1);
        assert!(first >= Duration::from_millis(100) && first <= Duration::from_millis(150));
        let late = policy.delay_for(9);
        assert!(late >= Duration::from_millis(400) && late <= Duration::from_millis(600));
    }

    #[tokio::test(start_paused = true)]
    async fn retries_transient_until_success() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: Result<u32, String> = retry(
            &RetryPolicy::from_millis(5, 10, 100),
            "test",
            |_| true,
            move || async move {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                if n < 2 { Err("flaky".to_owned()) } else { Ok(n) }
            },
        )
        .await;
        assert_eq!(result, Ok(2));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn permanent_errors_are_not_retried() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: Result<(), String> = retry(
            &RetryPolicy::default(),
            "test",
            |_| false,
            move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err("constraint".to_owned())
            },
        )
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn budget_is_respected() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: Result<(), String> = retry(
            &RetryPolicy::from_millis(3, 1, 1),
            "test",
            |_| true,
            move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err("down".to_owned())
            },
        )
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
