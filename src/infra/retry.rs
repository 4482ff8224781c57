//! Retry utilities with exponential backoff and jitter
//!
//! Backoff grows by `multiplier` from `initial_delay` and is capped at
//! `max_delay`, jitter included. The recorder only borrows the delay
//! schedule because it must release its subject lock between attempts;
//! other callers use [`Retry`] directly.

use std::future::Future;
use std::time::Duration;

use rand::Rng;

/// Configuration for retry behavior
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Total attempts including the first one
    pub max_attempts: u32,
    /// Delay before the second attempt
    pub initial_delay: Duration,
    /// Upper bound on any delay
    pub max_delay: Duration,
    /// Growth factor per attempt
    pub multiplier: f64,
    /// Jitter factor (0.0-1.0), applied as +/- a fraction of the delay
    pub jitter: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::audit_log()
    }
}

impl RetryConfig {
    /// Audit log submissions: base 500ms, cap 8s, 5 attempts
    pub fn audit_log() -> Self {
        Self {
            max_attempts: 5,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
            multiplier: 2.0,
            jitter: 0.2,
        }
    }

    /// Registry reads
    pub fn registry() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(2),
            multiplier: 2.0,
            jitter: 0.2,
        }
    }

    /// Token service calls
    pub fn token_service() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(2),
            multiplier: 2.0,
            jitter: 0.2,
        }
    }

    /// Millisecond delays, for tests and in-memory collaborators
    pub fn fast() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            multiplier: 2.0,
            jitter: 0.0,
        }
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Delay after the given failed attempt (0-indexed)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(63) as i32;
        let base = self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent);
        let cap = self.max_delay.as_secs_f64();
        let capped = base.min(cap);

        let delay = if self.jitter > 0.0 && capped > 0.0 {
            let range = capped * self.jitter;
            let offset = rand::thread_rng().gen_range(-range..=range);
            (capped + offset).clamp(0.0, cap)
        } else {
            capped
        };

        Duration::from_secs_f64(delay)
    }
}

/// Result of a retried operation
#[derive(Debug)]
pub struct RetryResult<T, E> {
    pub result: Result<T, E>,
    /// Attempts made (1 = succeeded first try)
    pub attempts: u32,
    pub total_duration: Duration,
}

impl<T, E> RetryResult<T, E> {
    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }

    pub fn into_result(self) -> Result<T, E> {
        self.result
    }
}

/// Runs operations under a [`RetryConfig`]
pub struct Retry {
    config: RetryConfig,
}

impl Retry {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Retry every error.
    pub async fn run<F, Fut, T, E>(&self, context: &str, operation: F) -> RetryResult<T, E>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        self.run_with_predicate(context, operation, |_| true).await
    }

    /// Retry while `should_retry` accepts the error.
    pub async fn run_with_predicate<F, Fut, T, E, P>(
        &self,
        context: &str,
        operation: F,
        should_retry: P,
    ) -> RetryResult<T, E>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
        P: Fn(&E) -> bool,
    {
        let start = std::time::Instant::now();
        let mut attempts = 0;

        loop {
            attempts += 1;

            match operation().await {
                Ok(value) => {
                    if attempts > 1 {
                        tracing::info!(
                            context = context,
                            attempts = attempts,
                            duration_ms = start.elapsed().as_millis() as u64,
                            "Operation succeeded after retries"
                        );
                    }
                    return RetryResult {
                        result: Ok(value),
                        attempts,
                        total_duration: start.elapsed(),
                    };
                }
                Err(e) => {
                    if attempts >= self.config.max_attempts || !should_retry(&e) {
                        if attempts > 1 {
                            tracing::warn!(
                                context = context,
                                attempts = attempts,
                                error = %e,
                                "Operation failed after retries"
                            );
                        }
                        return RetryResult {
                            result: Err(e),
                            attempts,
                            total_duration: start.elapsed(),
                        };
                    }

                    let delay = self.config.delay_for_attempt(attempts - 1);
                    tracing::debug!(
                        context = context,
                        attempt = attempts,
                        max_attempts = self.config.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Operation failed, will retry"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_audit_log_schedule() {
        let config = RetryConfig::audit_log().with_jitter(0.0);
        assert_eq!(config.max_attempts, 5);
        assert_eq!(config.delay_for_attempt(0), Duration::from_millis(500));
        assert_eq!(config.delay_for_attempt(1), Duration::from_secs(1));
        assert_eq!(config.delay_for_attempt(2), Duration::from_secs(2));
        assert_eq!(config.delay_for_attempt(3), Duration::from_secs(4));
        assert_eq!(config.delay_for_attempt(4), Duration::from_secs(8));
        assert_eq!(config.delay_for_attempt(10), Duration::from_secs(8));
    }

    #[test]
    fn test_jitter_never_exceeds_cap() {
        let config = RetryConfig::audit_log().with_jitter(1.0);
        for attempt in 0..20 {
            assert!(config.delay_for_attempt(attempt) <= Duration::from_secs(8));
        }
    }

    #[tokio::test]
    async fn test_retry_succeeds_after_failures() {
        let count = Arc::new(AtomicU32::new(0));
        let retry = Retry::new(RetryConfig::fast().with_max_attempts(5));

        let counter = count.clone();
        let result = retry
            .run("test", || {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err("not yet")
                    } else {
                        Ok(42)
                    }
                }
            })
            .await;

        assert!(result.is_success());
        assert_eq!(result.attempts, 3);
        assert_eq!(result.into_result().unwrap(), 42);
    }

    #[tokio::test]
    async fn test_retry_exhausts_attempts() {
        let retry = Retry::new(RetryConfig::fast().with_max_attempts(3));
        let result = retry
            .run("test", || async { Err::<i32, _>("always fails") })
            .await;

        assert!(!result.is_success());
        assert_eq!(result.attempts, 3);
    }

    #[tokio::test]
    async fn test_predicate_stops_on_fatal() {
        let count = Arc::new(AtomicU32::new(0));
        let retry = Retry::new(RetryConfig::fast().with_max_attempts(5));

        let counter = count.clone();
        let result: RetryResult<(), &str> = retry
            .run_with_predicate(
                "test",
                || {
                    let counter = counter.clone();
                    async move {
                        if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                            Err("transient")
                        } else {
                            Err("fatal")
                        }
                    }
                },
                |e| *e == "transient",
            )
            .await;

        assert_eq!(result.attempts, 2);
        assert_eq!(result.into_result().unwrap_err(), "fatal");
    }
}
