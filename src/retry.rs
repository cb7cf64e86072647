//! Retry driver for coordination and stream traffic
//!
//! Coordination traffic never gives up on retriable errors: the default
//! [`RetryConfig`] has no attempt cap, only a bounded delay ceiling. An
//! error the caller's predicate declares non-retriable terminates the loop
//! immediately and is returned unchanged, so callers keep their typed errors
//! (a conditional-write loss must surface as exactly
//! [`KvError::PreconditionFailed`](crate::error::KvError::PreconditionFailed),
//! not as a retry wrapper).
//!
//! Delays use full jitter: each wait is drawn uniformly from zero up to an
//! exponentially growing ceiling. Every consumer in the group retries
//! against the same document, so spreading the whole interval matters more
//! than keeping individual waits near the nominal curve.

use std::time::Duration;

use rand::Rng;
use tracing::{debug, trace, warn};

/// Configuration for retry behavior
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts (None for unbounded)
    pub max_attempts: Option<u32>,
    /// Delay ceiling after the first failure; doubles per attempt
    pub base_delay: Duration,
    /// Hard ceiling on any single delay
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: None,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryConfig {
    /// Jittered delay before attempt `attempt + 1`, given `attempt` failures
    /// so far. Uniform in `[0, min(max_delay, base_delay * 2^(attempt-1))]`.
    fn delay_for(&self, attempt: u32) -> Duration {
        let cap = self.max_delay.as_millis() as u64;
        let base = self.base_delay.as_millis() as u64;
        let exponent = attempt.saturating_sub(1).min(16);
        let ceiling = base
            .saturating_mul(1u64 << exponent)
            .min(cap)
            .max(1);
        Duration::from_millis(rand::thread_rng().gen_range(0..=ceiling))
    }
}

/// Drives one operation to completion under a [`RetryConfig`]
pub struct RetryHandle {
    config: RetryConfig,
    attempts: u32,
}

impl RetryHandle {
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            attempts: 0,
        }
    }

    /// Retry an operation until it succeeds, fails with an error the
    /// predicate rejects, or exhausts the attempt cap. The last error is
    /// returned unchanged in both failure cases.
    pub async fn retry<F, Fut, T, E, P>(&mut self, mut operation: F, retriable: P) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
        E: std::fmt::Display,
        P: Fn(&E) -> bool,
    {
        loop {
            self.attempts += 1;
            trace!(attempt = self.attempts, "Executing operation");

            match operation().await {
                Ok(value) => {
                    debug!(attempts = self.attempts, "Operation succeeded");
                    return Ok(value);
                }
                Err(e) if !retriable(&e) => {
                    trace!(
                        attempt = self.attempts,
                        error = %e,
                        "Non-retriable error, giving up"
                    );
                    return Err(e);
                }
                Err(e) => {
                    if let Some(max) = self.config.max_attempts {
                        if self.attempts >= max {
                            warn!(
                                attempts = self.attempts,
                                error = %e,
                                "Maximum retry attempts exceeded"
                            );
                            return Err(e);
                        }
                    }

                    let delay = self.config.delay_for(self.attempts);
                    warn!(
                        attempt = self.attempts,
                        delay_ms = ?delay.as_millis(),
                        error = %e,
                        "Operation failed, retrying after delay"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Get the current attempt count
    pub fn attempts(&self) -> u32 {
        self.attempts
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast_config(max_attempts: Option<u32>) -> RetryConfig {
        RetryConfig {
            max_attempts,
            base_delay: Duration::from_millis(2),
            max_delay: Duration::from_millis(20),
        }
    }

    #[test]
    fn test_delay_stays_under_ceiling() {
        let config = RetryConfig {
            max_attempts: None,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
        };

        for attempt in 1..40 {
            for _ in 0..50 {
                assert!(config.delay_for(attempt) <= config.max_delay);
            }
        }

        // Huge attempt counts must not overflow the exponent
        assert!(config.delay_for(u32::MAX) <= config.max_delay);
    }

    #[test]
    fn test_delay_is_jittered() {
        let config = RetryConfig {
            max_attempts: None,
            base_delay: Duration::from_millis(512),
            max_delay: Duration::from_secs(30),
        };

        // With a full-width draw, repeated samples at the same attempt
        // cannot all collapse to one value
        let samples: std::collections::HashSet<Duration> =
            (0..100).map(|_| config.delay_for(4)).collect();
        assert!(samples.len() > 1);
    }

    #[tokio::test]
    async fn test_succeeds_after_transient_failures() {
        let mut retry = RetryHandle::new(fast_config(None));

        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = calls.clone();

        let result = retry
            .retry(
                || {
                    let calls = calls_clone.clone();
                    async move {
                        if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                            Err("not yet")
                        } else {
                            Ok("success")
                        }
                    }
                },
                |_| true,
            )
            .await;

        assert_eq!(result, Ok("success"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert_eq!(retry.attempts(), 3);
    }

    #[tokio::test]
    async fn test_attempt_cap_returns_last_error() {
        let mut retry = RetryHandle::new(fast_config(Some(2)));

        let result: Result<(), _> = retry.retry(|| async { Err("always fails") }, |_| true).await;

        assert_eq!(result, Err("always fails"));
        assert_eq!(retry.attempts(), 2);
    }

    #[tokio::test]
    async fn test_non_retriable_terminates_immediately() {
        let mut retry = RetryHandle::new(fast_config(None));

        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = calls.clone();

        let result: Result<(), &str> = retry
            .retry(
                || {
                    let calls = calls_clone.clone();
                    async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Err("precondition failed")
                    }
                },
                |e: &&str| !e.contains("precondition"),
            )
            .await;

        assert_eq!(result, Err("precondition failed"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
