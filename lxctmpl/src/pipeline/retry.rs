//! Bounded retry with configurable backoff.
//!
//! Used by steps that poll the platform for a value that may be briefly
//! unavailable, such as the next free instance identity.

use crate::cancellation::CancellationToken;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Backoff strategy for retry delays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// delay = base * 2^attempt
    Exponential,
    /// delay = base * (attempt + 1)
    Linear,
    /// delay = base
    #[default]
    Constant,
}

/// Jitter applied on top of the backoff delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JitterStrategy {
    /// No jitter
    #[default]
    None,
    /// Random from 0 to delay
    Full,
    /// Half fixed, half random
    Equal,
}

/// Configuration for retry behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total calls, including the first one.
    pub max_attempts: usize,
    /// Base delay between calls in milliseconds.
    pub base_delay_ms: u64,
    /// Maximum delay cap in milliseconds.
    pub max_delay_ms: u64,
    /// Backoff strategy.
    pub backoff_strategy: BackoffStrategy,
    /// Jitter strategy.
    pub jitter_strategy: JitterStrategy,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay_ms: 0,
            max_delay_ms: 30_000,
            backoff_strategy: BackoffStrategy::Constant,
            jitter_strategy: JitterStrategy::None,
        }
    }
}

impl RetryConfig {
    /// Creates a new retry config.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the total number of calls.
    #[must_use]
    pub fn with_max_attempts(mut self, attempts: usize) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Sets the base delay.
    #[must_use]
    pub fn with_base_delay_ms(mut self, delay: u64) -> Self {
        self.base_delay_ms = delay;
        self
    }

    /// Sets the maximum delay.
    #[must_use]
    pub fn with_max_delay_ms(mut self, delay: u64) -> Self {
        self.max_delay_ms = delay;
        self
    }

    /// Sets the backoff strategy.
    #[must_use]
    pub fn with_backoff(mut self, strategy: BackoffStrategy) -> Self {
        self.backoff_strategy = strategy;
        self
    }

    /// Sets the jitter strategy.
    #[must_use]
    pub fn with_jitter(mut self, strategy: JitterStrategy) -> Self {
        self.jitter_strategy = strategy;
        self
    }

    /// Delay after the failed call number `attempt` (0-indexed).
    #[must_use]
    pub fn delay_for(&self, attempt: usize) -> Duration {
        let base = self.base_delay_ms;
        let max = self.max_delay_ms;

        let delay = match self.backoff_strategy {
            BackoffStrategy::Exponential => {
                let exp = u32::try_from(attempt).unwrap_or(u32::MAX);
                base.saturating_mul(2u64.saturating_pow(exp)).min(max)
            }
            BackoffStrategy::Linear => {
                let factor = u64::try_from(attempt + 1).unwrap_or(u64::MAX);
                base.saturating_mul(factor).min(max)
            }
            BackoffStrategy::Constant => base.min(max),
        };

        let jittered = match self.jitter_strategy {
            JitterStrategy::None => delay,
            JitterStrategy::Full if delay > 0 => rand::thread_rng().gen_range(0..=delay),
            JitterStrategy::Equal if delay / 2 > 0 => {
                let half = delay / 2;
                half + rand::thread_rng().gen_range(0..=half)
            }
            JitterStrategy::Full | JitterStrategy::Equal => delay,
        };

        Duration::from_millis(jittered)
    }
}

/// Runs `operation` until it succeeds or `max_attempts` calls have failed.
///
/// Makes exactly `max_attempts` calls in the worst case (at least one) and
/// returns the last error. Cancellation during a backoff delay ends the loop
/// early with the last error.
pub async fn with_retry<T, E, F, Fut>(
    config: &RetryConfig,
    key: &str,
    cancel: &CancellationToken,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let attempts = config.max_attempts.max(1);
    let mut attempt = 0;

    loop {
        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) => {
                attempt += 1;
                if attempt >= attempts {
                    tracing::warn!(key, attempt, error = %e, "Giving up after final attempt");
                    return Err(e);
                }
                let delay = config.delay_for(attempt - 1);
                tracing::warn!(
                    key,
                    attempt,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    error = %e,
                    "Retrying after error"
                );
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => {
                        tracing::info!(key, attempt, "Retry abandoned on cancellation");
                        return Err(e);
                    }
                    () = tokio::time::sleep(delay) => {}
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_retry_config_default() {
        let config = RetryConfig::default();
        assert_eq!(config.max_attempts, 5);
        assert_eq!(config.base_delay_ms, 0);
        assert_eq!(config.backoff_strategy, BackoffStrategy::Constant);
    }

    #[test]
    fn test_delay_exponential() {
        let config = RetryConfig::new()
            .with_base_delay_ms(100)
            .with_backoff(BackoffStrategy::Exponential);

        assert_eq!(config.delay_for(0), Duration::from_millis(100));
        assert_eq!(config.delay_for(1), Duration::from_millis(200));
        assert_eq!(config.delay_for(2), Duration::from_millis(400));
    }

    #[test]
    fn test_delay_linear_capped() {
        let config = RetryConfig::new()
            .with_base_delay_ms(1000)
            .with_max_delay_ms(2500)
            .with_backoff(BackoffStrategy::Linear);

        assert_eq!(config.delay_for(0), Duration::from_millis(1000));
        assert_eq!(config.delay_for(1), Duration::from_millis(2000));
        assert_eq!(config.delay_for(5), Duration::from_millis(2500));
    }

    #[test]
    fn test_delay_full_jitter_bounded() {
        let config = RetryConfig::new()
            .with_base_delay_ms(100)
            .with_jitter(JitterStrategy::Full);

        for _ in 0..50 {
            assert!(config.delay_for(0) <= Duration::from_millis(100));
        }
    }

    #[tokio::test]
    async fn test_with_retry_makes_exactly_max_attempts_calls() {
        let calls = AtomicUsize::new(0);
        let config = RetryConfig::new().with_max_attempts(5);

        let result: Result<(), String> = with_retry(&config, "vmid", &CancellationToken::new(), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err("busy".to_string()) }
        })
        .await;

        assert_eq!(result, Err("busy".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn test_with_retry_stops_on_success() {
        let calls = AtomicUsize::new(0);
        let config = RetryConfig::new().with_max_attempts(5);

        let result: Result<u32, String> = with_retry(&config, "vmid", &CancellationToken::new(), || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n < 2 {
                    Err("busy".to_string())
                } else {
                    Ok(117)
                }
            }
        })
        .await;

        assert_eq!(result, Ok(117));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_with_retry_zero_attempts_still_calls_once() {
        let calls = AtomicUsize::new(0);
        let config = RetryConfig::new().with_max_attempts(0);

        let _: Result<(), String> = with_retry(&config, "k", &CancellationToken::new(), || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err("x".to_string()) }
        })
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_with_retry_stops_when_cancelled_during_backoff() {
        let calls = AtomicUsize::new(0);
        let cancel = CancellationToken::new();
        let config = RetryConfig::new()
            .with_max_attempts(5)
            .with_base_delay_ms(60_000);

        let result: Result<(), String> = with_retry(&config, "vmid", &cancel, || {
            calls.fetch_add(1, Ordering::SeqCst);
            cancel.cancel("operator interrupt");
            async { Err("busy".to_string()) }
        })
        .await;

        assert_eq!(result, Err("busy".to_string()));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
