//! Bounded exponential backoff for transient backend failures.

use crate::backends::{metadata_store::MetadataError, object_store::ObjectStoreError};
use std::{fmt::Display, future::Future, time::Duration};
use tracing::warn;

/// Errors that know whether the failed call is worth repeating.
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

impl Retryable for MetadataError {
    fn is_retryable(&self) -> bool {
        MetadataError::is_retryable(self)
    }
}

impl Retryable for ObjectStoreError {
    fn is_retryable(&self) -> bool {
        ObjectStoreError::is_retryable(self)
    }
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total tries including the first one.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Backoff cap.
    pub max_delay: Duration,
    pub backoff_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            initial_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(2),
            backoff_factor: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Retries with no delay between attempts.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            backoff_factor: 1.0,
        }
    }

    /// Delay after failed attempt `attempt` (1-based), with ±25% jitter.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if self.initial_delay.is_zero() {
            return Duration::ZERO;
        }
        let exp = attempt.saturating_sub(1).min(63) as i32;
        let secs = self.initial_delay.as_secs_f64() * self.backoff_factor.powi(exp);
        let capped = secs.min(self.max_delay.as_secs_f64());
        let jitter = capped * 0.25;
        let offset = (std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .subsec_nanos() as f64
            / u32::MAX as f64)
            * 2.0
            - 1.0;
        Duration::from_secs_f64((capped + jitter * offset).max(0.0))
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or the
    /// attempt budget runs out. The last error is returned as is.
    pub async fn run<T, E, F, Fut>(&self, what: &str, mut op: F) -> Result<T, E>
    where
        E: Retryable + Display,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let mut attempt = 1;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() && attempt < self.max_attempts => {
                    let delay = self.delay_for_attempt(attempt);
                    warn!(
                        op = what,
                        attempt,
                        error = %err,
                        delay_ms = delay.as_millis() as u64,
                        "transient backend failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn delay_grows_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 10,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(400),
            backoff_factor: 2.0,
        };
        let first = policy.delay_for_attempt(1).as_secs_f64();
        assert!((0.075..=0.125).contains(&first), "{first}");
        let capped = policy.delay_for_attempt(8).as_secs_f64();
        assert!((0.3..=0.5).contains(&capped), "{capped}");
        assert_eq!(RetryPolicy::immediate(3).delay_for_attempt(5), Duration::ZERO);
    }

    #[tokio::test]
    async fn retries_transient_errors_until_success() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: Result<u32, MetadataError> = RetryPolicy::immediate(3)
            .run("probe", move || async move {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                if n < 3 {
                    Err(MetadataError::Unavailable("flaky".into()))
                } else {
                    Ok(n)
                }
            })
            .await;
        assert_eq!(result.unwrap(), 3);
    }

    #[tokio::test]
    async fn gives_up_after_budget() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: Result<(), ObjectStoreError> = RetryPolicy::immediate(2)
            .run("probe", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(ObjectStoreError::Unavailable("down".into()))
            })
            .await;
        assert!(result.is_err());
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn permanent_errors_are_not_retried() {
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: Result<(), ObjectStoreError> = RetryPolicy::immediate(5)
            .run("probe", move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(ObjectStoreError::NotFound("k".into()))
            })
            .await;
        assert!(matches!(result, Err(ObjectStoreError::NotFound(_))));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
