//! Bounded retry with exponential backoff.
//!
//! Every failure is retried until the cap is reached; the last failure is
//! surfaced as-is. The backoff wait is cancellable, and no new attempt starts
//! once the enclosing call is cancelled.

use crate::cancel::CancellationToken;
use crate::config::{duration_secs, NetworkConfig};
use crate::error::{FerryError, Result};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, warn};

/// Configuration for retry behavior.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "snake_case")]
pub struct RetryConfig {
    /// Retries after the initial attempt (`max_retries + 1` attempts total).
    pub max_retries: u32,
    /// Delay unit; the wait after failure `n` is `base_delay * 2^n`.
    #[serde(with = "duration_secs")]
    pub base_delay: Duration,
    /// Maximum delay cap.
    #[serde(with = "duration_secs")]
    pub max_delay: Duration,
    /// Whether to add random jitter to delays.
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: NetworkConfig::MAX_RETRIES,
            base_delay: NetworkConfig::RETRY_BASE_DELAY,
            max_delay: NetworkConfig::RETRY_MAX_DELAY,
            jitter: false,
        }
    }
}

impl RetryConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Delay before the retry that follows failure number `attempt` (1-indexed).
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        let multiplier = 2f64.powi(attempt.min(i32::MAX as u32) as i32);
        let delay_secs = self.base_delay.as_secs_f64() * multiplier;
        let capped_secs = delay_secs.min(self.max_delay.as_secs_f64());

        let final_secs = if self.jitter {
            // Factor in [0.5, 1.5) keeps the mean delay unchanged.
            let mut rng = rand::rng();
            let jitter_factor = rng.random_range(0.5..1.5);
            (capped_secs * jitter_factor).min(self.max_delay.as_secs_f64())
        } else {
            capped_secs
        };

        Duration::from_secs_f64(final_secs)
    }
}

/// Statistics about a retried operation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RetryStats {
    /// Number of attempts made.
    pub attempts: u32,
    /// Total backoff delay accumulated.
    pub total_delay: Duration,
    pub success: bool,
    pub last_error: Option<String>,
}

/// Runs async operations under a [`RetryConfig`].
#[derive(Debug, Clone, Default)]
pub struct RetryExecutor {
    config: RetryConfig,
    last_stats: Arc<Mutex<RetryStats>>,
}

impl RetryExecutor {
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            last_stats: Arc::default(),
        }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Statistics of the most recently finished `execute` call.
    pub fn last_stats(&self) -> RetryStats {
        self.last_stats
            .lock()
            .map(|s| s.clone())
            .unwrap_or_default()
    }

    /// Run `operation` until it succeeds, the retry budget is spent, or
    /// `cancel` fires.
    pub async fn execute<F, Fut, T>(&self, cancel: &CancellationToken, operation: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let (result, stats) = self.execute_with_stats(cancel, operation).await;
        if let Ok(mut last) = self.last_stats.lock() {
            *last = stats;
        }
        result
    }

    /// Like [`execute`](Self::execute), also returning the attempt statistics.
    pub async fn execute_with_stats<F, Fut, T>(
        &self,
        cancel: &CancellationToken,
        mut operation: F,
    ) -> (Result<T>, RetryStats)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut stats = RetryStats::default();
        let mut attempt: u32 = 0;

        loop {
            if cancel.is_cancelled() {
                return (Err(FerryError::Cancelled), stats);
            }

            stats.attempts += 1;
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => return (Err(FerryError::Cancelled), stats),
                outcome = operation() => outcome,
            };

            let err = match outcome {
                Ok(value) => {
                    stats.success = true;
                    if attempt > 0 {
                        debug!("Operation succeeded after {} attempts", stats.attempts);
                    }
                    return (Ok(value), stats);
                }
                Err(FerryError::Cancelled) => return (Err(FerryError::Cancelled), stats),
                Err(e) => e,
            };

            stats.last_error = Some(err.to_string());
            attempt += 1;

            if attempt > self.config.max_retries {
                warn!(
                    "All {} attempts exhausted. Last error: {}",
                    stats.attempts, err
                );
                return (Err(err), stats);
            }

            let delay = self.config.calculate_delay(attempt);
            stats.total_delay += delay;
            warn!(
                "Attempt {}/{} failed: {}. Retrying in {:?}",
                stats.attempts,
                self.config.max_retries + 1,
                err,
                delay
            );

            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    debug!("Retry backoff cancelled");
                    return (Err(FerryError::Cancelled), stats);
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn fast_config(max_retries: u32) -> RetryConfig {
        RetryConfig::new()
            .with_max_retries(max_retries)
            .with_base_delay(Duration::from_millis(10))
            .with_jitter(false)
    }

    #[test]
    fn test_delay_calculation_no_jitter() {
        let config = RetryConfig::new()
            .with_base_delay(Duration::from_millis(500))
            .with_jitter(false);

        assert_eq!(config.calculate_delay(1), Duration::from_secs(1));
        assert_eq!(config.calculate_delay(2), Duration::from_secs(2));
        assert_eq!(config.calculate_delay(3), Duration::from_secs(4));
    }

    #[test]
    fn test_delay_capped_at_max() {
        let config = RetryConfig::new()
            .with_base_delay(Duration::from_secs(10))
            .with_max_delay(Duration::from_secs(30))
            .with_jitter(false);

        assert_eq!(config.calculate_delay(3), Duration::from_secs(30));
    }

    #[test]
    fn test_delay_with_jitter_stays_in_band() {
        let config = RetryConfig::new()
            .with_base_delay(Duration::from_secs(1))
            .with_jitter(true);

        for _ in 0..20 {
            let delay = config.calculate_delay(1);
            assert!(
                delay >= Duration::from_secs(1) && delay <= Duration::from_secs(3),
                "Delay {:?} should be between 1s and 3s",
                delay
            );
        }
    }

    #[tokio::test]
    async fn test_succeeds_first_try() {
        let executor = RetryExecutor::new(fast_config(3));
        let (result, stats) = executor
            .execute_with_stats(&CancellationToken::new(), || async { Ok(42) })
            .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(stats.attempts, 1);
        assert!(stats.success);
    }

    #[tokio::test(start_paused = true)]
    async fn test_succeeds_after_failures_without_extra_attempts() {
        let executor = RetryExecutor::new(fast_config(3));
        let counter = Arc::new(AtomicU32::new(0));

        let result = executor
            .execute(&CancellationToken::new(), || {
                let counter = counter.clone();
                async move {
                    if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(FerryError::network("temporary failure"))
                    } else {
                        Ok(42)
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(counter.load(Ordering::SeqCst), 3);
        assert_eq!(executor.last_stats().attempts, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_always_failing_is_attempted_max_retries_plus_one() {
        let executor = RetryExecutor::new(fast_config(3));
        let counter = Arc::new(AtomicU32::new(0));

        let (result, stats) = executor
            .execute_with_stats(&CancellationToken::new(), || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    Err::<(), _>(FerryError::network("always fails"))
                }
            })
            .await;

        assert!(matches!(result, Err(FerryError::Network { .. })));
        assert_eq!(counter.load(Ordering::SeqCst), 4);
        assert_eq!(stats.attempts, 4);
        assert!(!stats.success);
        assert_eq!(
            stats.last_error.as_deref(),
            Some("Network error: always fails")
        );
        // 20ms + 40ms + 80ms
        assert_eq!(stats.total_delay, Duration::from_millis(140));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_backoff_stops_retrying() {
        let executor = RetryExecutor::new(
            RetryConfig::new()
                .with_max_retries(5)
                .with_base_delay(Duration::from_secs(10)),
        );
        let cancel = CancellationToken::new();
        let counter = Arc::new(AtomicU32::new(0));

        let task = {
            let cancel = cancel.clone();
            let counter = counter.clone();
            let executor = executor.clone();
            tokio::spawn(async move {
                executor
                    .execute(&cancel, || {
                        let counter = counter.clone();
                        async move {
                            counter.fetch_add(1, Ordering::SeqCst);
                            Err::<(), _>(FerryError::network("down"))
                        }
                    })
                    .await
            })
        };

        tokio::time::sleep(Duration::from_secs(1)).await;
        cancel.cancel();

        let result = task.await.unwrap();
        assert!(matches!(result, Err(FerryError::Cancelled)));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_already_cancelled_makes_no_attempt() {
        let executor = RetryExecutor::new(fast_config(3));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let counter = AtomicU32::new(0);
        let result = executor
            .execute(&cancel, || {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }
            })
            .await;

        assert!(matches!(result, Err(FerryError::Cancelled)));
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_config_deserializes_seconds() {
        let config: RetryConfig =
            serde_json::from_str(r#"{ "max_retries": 1, "base_delay": 0.25 }"#).unwrap();
        assert_eq!(config.max_retries, 1);
        assert_eq!(config.base_delay, Duration::from_millis(250));
        assert_eq!(config.max_delay, NetworkConfig::RETRY_MAX_DELAY);
    }
}
