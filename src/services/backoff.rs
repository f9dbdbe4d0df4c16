//! Exponential backoff shared by the update queue and the retry store.

use std::{fmt::Display, future::Future, time::Duration};

use rand::Rng;
use tokio::time::sleep;
use tracing::debug;

use crate::{config::BackoffConfig, dao::storage::StorageError, error::SyncError};

/// Failure that may succeed when tried again.
pub trait Retryable {
    /// Whether another attempt is worthwhile.
    fn is_retryable(&self) -> bool;

    /// Whether the backend explicitly asked for slower traffic.
    fn is_throttled(&self) -> bool {
        false
    }
}

impl Retryable for StorageError {
    fn is_retryable(&self) -> bool {
        true
    }

    fn is_throttled(&self) -> bool {
        self.is_rate_limited()
    }
}

impl Retryable for SyncError {
    fn is_retryable(&self) -> bool {
        SyncError::is_retryable(self)
    }

    fn is_throttled(&self) -> bool {
        matches!(self, SyncError::RateLimited(_))
    }
}

/// Attempt budget and delay curve.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    /// Delay after the first failure; doubles each attempt.
    pub initial_delay: Duration,
    /// Cap on the doubled delay.
    pub max_delay: Duration,
    /// Pick each delay uniformly between half and the full value.
    pub jitter: bool,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        BackoffConfig::default().into()
    }
}

impl From<BackoffConfig> for BackoffPolicy {
    fn from(config: BackoffConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial_delay: config.initial_delay,
            max_delay: config.max_delay.max(config.initial_delay),
            jitter: config.jitter,
        }
    }
}

impl BackoffPolicy {
    /// Policy that never waits; handy for tests.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            jitter: false,
        }
    }

    /// Delay after the `attempt`-th failure (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let base = self
            .initial_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay);

        if !self.jitter || base.is_zero() {
            return base;
        }

        let millis = u64::try_from(base.as_millis()).unwrap_or(u64::MAX);
        let jittered = rand::rng().random_range(millis / 2..=millis);
        Duration::from_millis(jittered)
    }

    /// Run `operation` until it succeeds, fails with a non-retryable error, or the budget runs out.
    pub async fn retry<T, E, F, Fut>(&self, operation: &'static str, mut attempt_fn: F) -> Result<T, E>
    where
        E: Retryable + Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match attempt_fn().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() && attempt < self.max_attempts => {
                    let mut delay = self.delay_for(attempt);
                    if err.is_throttled() {
                        delay = delay.saturating_mul(2).min(self.max_delay.saturating_mul(2));
                    }
                    debug!(
                        operation,
                        attempt,
                        wait_ms = delay.as_millis(),
                        error = %err,
                        "retrying after failure"
                    );
                    sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    fn policy(jitter: bool) -> BackoffPolicy {
        BackoffPolicy {
            max_attempts: 4,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
            jitter,
        }
    }

    #[test]
    fn delays_grow_then_cap() {
        let policy = policy(false);
        assert_eq!(policy.delay_for(1), Duration::from_millis(100));
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.delay_for(3), Duration::from_millis(350));
        assert_eq!(policy.delay_for(40), Duration::from_millis(350));
    }

    #[test]
    fn jitter_stays_within_half_and_full() {
        let policy = policy(true);
        for _ in 0..100 {
            let delay = policy.delay_for(2);
            assert!(delay >= Duration::from_millis(100));
            assert!(delay <= Duration::from_millis(200));
        }
    }

    #[tokio::test]
    async fn retry_stops_after_budget() {
        let calls = AtomicU32::new(0);
        let result: Result<(), SyncError> = BackoffPolicy::immediate(3)
            .retry("test", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(SyncError::from(StorageError::rate_limited("busy"))) }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_retryable_errors_return_at_once() {
        let calls = AtomicU32::new(0);
        let result: Result<(), SyncError> = BackoffPolicy::immediate(5)
            .retry("test", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(SyncError::InvalidInput("nope".into())) }
            })
            .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retry_returns_first_success() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, StorageError> = BackoffPolicy::immediate(5)
            .retry("test", || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(StorageError::rate_limited("busy"))
                    } else {
                        Ok(n)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 2);
    }
}
