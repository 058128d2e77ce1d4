//! Bounded re-run of transactions that lost an optimistic-concurrency race.
//!
//! Transactional backends wrap each read-modify-write in a transaction whose
//! commit fails when a concurrent writer touched the same keys. The runner
//! re-executes the whole transaction body from scratch with jittered
//! exponential backoff. Contract outcomes (`NotFound`, `AlreadyExists`) are
//! never re-run.

use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

use raidstore_common::{Error, Result};

/// Configuration for conflict retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of re-runs after the first attempt.
    pub max_retries: u32,
    /// Delay before the first re-run.
    pub initial_delay: Duration,
    /// Cap for exponential growth.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Whether to add jitter to delays.
    pub jitter: bool,
}

impl RetryConfig {
    /// Create a configuration tuned for transaction conflicts.
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            initial_delay: Duration::from_millis(2),
            max_delay: Duration::from_millis(500),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }

    /// Set initial delay.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Set maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Enable or disable jitter.
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Calculate delay for a given attempt number.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base_delay = self.initial_delay.as_micros() as f64
            * self.backoff_multiplier.powi(attempt as i32);

        let capped_delay = base_delay.min(self.max_delay.as_micros() as f64);

        let final_delay = if self.jitter {
            // Jitter factor in [0.5, 1.5)
            let jitter_factor = 0.5 + rand::random::<f64>();
            capped_delay * jitter_factor
        } else {
            capped_delay
        };

        Duration::from_micros(final_delay as u64)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(64)
    }
}

/// Re-runs transaction bodies that fail with a commit conflict.
#[derive(Debug, Clone, Default)]
pub struct ConflictRetry {
    config: RetryConfig,
}

impl ConflictRetry {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Run `operation` until it succeeds, fails with a non-conflict error, or
    /// the retry budget is spent.
    ///
    /// # Errors
    /// - Any non-conflict error from `operation`, unchanged
    /// - `Storage` once the retry budget is exhausted
    pub async fn run<F, Fut, T>(&self, operation: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;

        loop {
            match operation().await {
                Ok(result) => {
                    if attempt > 0 {
                        debug!(retries = attempt, "Transaction committed after conflicts");
                    }
                    return Ok(result);
                }
                Err(err) if err.is_conflict() => {
                    attempt += 1;
                    if attempt > self.config.max_retries {
                        warn!(attempts = attempt, error = %err, "Transaction retry budget exhausted");
                        return Err(Error::Storage(format!(
                            "transaction did not commit after {} attempts: {}",
                            attempt, err
                        )));
                    }

                    let delay = self.config.delay_for_attempt(attempt - 1);
                    debug!(attempt, ?delay, "Transaction conflict, re-running");
                    sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Get the retry configuration.
    pub fn config(&self) -> &RetryConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn fast(max_retries: u32) -> ConflictRetry {
        ConflictRetry::new(
            RetryConfig::new(max_retries)
                .with_initial_delay(Duration::from_micros(10))
                .with_jitter(false),
        )
    }

    #[test]
    fn test_delay_calculation() {
        let config = RetryConfig::new(3)
            .with_initial_delay(Duration::from_millis(1))
            .with_jitter(false);

        assert_eq!(config.delay_for_attempt(0), Duration::from_millis(1));
        assert_eq!(config.delay_for_attempt(1), Duration::from_millis(2));
        assert_eq!(config.delay_for_attempt(2), Duration::from_millis(4));
    }

    #[test]
    fn test_max_delay_cap() {
        let config = RetryConfig::new(10)
            .with_initial_delay(Duration::from_millis(10))
            .with_max_delay(Duration::from_millis(100))
            .with_jitter(false);

        assert_eq!(config.delay_for_attempt(8), Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_reruns_conflicts() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();

        let result: Result<i32> = fast(5)
            .run(move || {
                let count = counter.clone();
                async move {
                    if count.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(Error::Conflict("read set changed".to_string()))
                    } else {
                        Ok(42)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_contract_errors_not_rerun() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();

        let result: Result<i32> = fast(5)
            .run(move || {
                let count = counter.clone();
                async move {
                    count.fetch_add(1, Ordering::SeqCst);
                    Err(Error::NotFound("10.25.1.1/1".to_string()))
                }
            })
            .await;

        assert!(matches!(result, Err(Error::NotFound(_))));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_exhaustion_is_unclassified() {
        let attempts = Arc::new(AtomicU32::new(0));
        let counter = attempts.clone();

        let result: Result<i32> = fast(2)
            .run(move || {
                let count = counter.clone();
                async move {
                    count.fetch_add(1, Ordering::SeqCst);
                    Err(Error::Conflict("always".to_string()))
                }
            })
            .await;

        assert!(matches!(result, Err(Error::Storage(_))));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }
}
