//! Exponential backoff and retry strategies
//!
//! [`RetryExecutor`] drives retries for probe requests and provisioning.
//! [`BackoffModel`] is the reference the property suite checks the
//! service's documented retry schedule against.

use crate::cancel::{sleep_cancellable, CancellationToken};
use crate::error::{HarnessError, Result};
use rand::Rng;
use std::time::Duration;

/// Backoff strategy for retry operations
#[derive(Debug, Clone)]
pub enum BackoffStrategy {
    /// Fixed delay between retries
    Fixed(Duration),
    /// Linear increase in delay (base * (retry + 1))
    Linear { base: Duration, max: Duration },
    /// Exponential increase in delay (base * multiplier^retry)
    Exponential {
        base: Duration,
        max: Duration,
        multiplier: f64,
    },
}

impl BackoffStrategy {
    /// Delay before retry number `retry` (0-based)
    pub fn delay(&self, retry: u32) -> Duration {
        match self {
            BackoffStrategy::Fixed(delay) => *delay,

            BackoffStrategy::Linear { base, max } => {
                let delay = base.saturating_mul(retry.saturating_add(1));
                std::cmp::min(delay, *max)
            }

            BackoffStrategy::Exponential {
                base,
                max,
                multiplier,
            } => {
                let factor = multiplier.powi(retry.min(i32::MAX as u32) as i32);
                let delay_ms = base.as_millis() as f64 * factor;
                if !delay_ms.is_finite() || delay_ms >= max.as_millis() as f64 {
                    *max
                } else {
                    Duration::from_millis(delay_ms as u64)
                }
            }
        }
    }
}

/// Configuration for retry operations
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total attempts, first one included
    pub max_attempts: u32,
    pub backoff_strategy: BackoffStrategy,
    /// Maximum total time for all retries
    pub max_total_duration: Option<Duration>,
    /// Whether to add jitter to backoff delays
    pub jitter: bool,
    /// Jitter factor (0.0 to 1.0)
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_strategy: BackoffStrategy::Exponential {
                base: Duration::from_millis(100),
                max: Duration::from_secs(30),
                multiplier: 2.0,
            },
            max_total_duration: Some(Duration::from_secs(60)),
            jitter: false,
            jitter_factor: 0.3,
        }
    }
}

/// Retry executor with backoff
#[derive(Debug, Clone)]
pub struct RetryExecutor {
    config: RetryConfig,
}

impl RetryExecutor {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    /// Run `operation` until `should_retry` rejects its outcome or attempts
    /// run out. The last outcome is returned as is, so a caller sees the
    /// final response rather than a synthetic error. Cancellation is checked
    /// between attempts.
    pub async fn execute<F, Fut, T, P>(
        &self,
        cancel: &CancellationToken,
        mut operation: F,
        should_retry: P,
    ) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
        P: Fn(&Result<T>) -> bool,
    {
        let start_time = tokio::time::Instant::now();
        let attempts = self.config.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            cancel.check()?;
            let outcome = operation(attempt).await;

            if matches!(outcome, Err(HarnessError::Cancelled)) || !should_retry(&outcome) {
                return outcome;
            }

            attempt += 1;
            if attempt >= attempts {
                log::debug!("Retries exhausted after {} attempts", attempt);
                return outcome;
            }

            let delay = self.delay_for(attempt - 1);
            if let Some(max_duration) = self.config.max_total_duration {
                if start_time.elapsed() + delay > max_duration {
                    log::debug!("Retry budget {:?} exhausted", max_duration);
                    return outcome;
                }
            }

            log::debug!("Retry attempt {} after {:?} delay", attempt, delay);
            sleep_cancellable(cancel, delay).await?;
        }
    }

    /// Delay before retry `retry`, jittered if configured
    pub fn delay_for(&self, retry: u32) -> Duration {
        let delay = self.config.backoff_strategy.delay(retry);
        if self.config.jitter {
            self.add_jitter(delay)
        } else {
            delay
        }
    }

    fn add_jitter(&self, delay: Duration) -> Duration {
        let mut rng = rand::thread_rng();
        let jitter_range = (delay.as_millis() as f64 * self.config.jitter_factor) as u64;
        let jitter = rng.gen_range(0..=jitter_range);
        if rng.gen_bool(0.5) {
            delay.saturating_add(Duration::from_millis(jitter))
        } else {
            delay.saturating_sub(Duration::from_millis(jitter))
        }
    }
}

/// Builder for RetryConfig
#[derive(Debug, Default)]
pub struct RetryConfigBuilder {
    config: RetryConfig,
}

impl RetryConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.config.max_attempts = attempts;
        self
    }

    pub fn exponential_backoff(mut self, base: Duration, max: Duration) -> Self {
        self.config.backoff_strategy = BackoffStrategy::Exponential {
            base,
            max,
            multiplier: 2.0,
        };
        self
    }

    pub fn linear_backoff(mut self, base: Duration, max: Duration) -> Self {
        self.config.backoff_strategy = BackoffStrategy::Linear { base, max };
        self
    }

    pub fn fixed_backoff(mut self, delay: Duration) -> Self {
        self.config.backoff_strategy = BackoffStrategy::Fixed(delay);
        self
    }

    pub fn with_jitter(mut self, factor: f64) -> Self {
        self.config.jitter = true;
        self.config.jitter_factor = factor.clamp(0.0, 1.0);
        self
    }

    pub fn max_duration(mut self, duration: Duration) -> Self {
        self.config.max_total_duration = Some(duration);
        self
    }

    pub fn no_max_duration(mut self) -> Self {
        self.config.max_total_duration = None;
        self
    }

    pub fn build(self) -> RetryConfig {
        self.config
    }
}

/// The service's documented retry schedule: retry `n` waits `2^n` seconds
/// and the loop stops once `n` reaches the retry limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffModel {
    pub max_retries: u32,
}

impl Default for BackoffModel {
    fn default() -> Self {
        Self { max_retries: 3 }
    }
}

impl BackoffModel {
    /// `2^n` seconds, saturating
    pub fn delay(&self, retry: u32) -> Duration {
        Duration::from_secs(1u64.checked_shl(retry).unwrap_or(u64::MAX))
    }

    pub fn should_retry(&self, retry: u32) -> bool {
        retry < self.max_retries
    }

    /// Sum of delays over a full retry loop
    pub fn total_delay(&self) -> Duration {
        (0..self.max_retries)
            .map(|n| self.delay(n))
            .fold(Duration::ZERO, Duration::saturating_add)
    }

    /// Retries actually performed by the loop
    pub fn schedule(&self) -> Vec<Duration> {
        let mut delays = Vec::new();
        let mut retry = 0;
        while self.should_retry(retry) {
            delays.push(self.delay(retry));
            retry += 1;
        }
        delays
    }

    /// Accept a retry counter reported by the service; negative is a bug
    pub fn validate_count(count: i64) -> Result<u32> {
        u32::try_from(count).map_err(|_| {
            HarnessError::ProtocolViolation(format!("Retry counter out of range: {}", count))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    fn retry_errors(outcome: &Result<&'static str>) -> bool {
        outcome.is_err()
    }

    #[tokio::test(start_paused = true)]
    async fn test_exponential_backoff() {
        let attempts = Arc::new(AtomicU32::new(0));

        let config = RetryConfigBuilder::new()
            .max_attempts(3)
            .exponential_backoff(Duration::from_millis(10), Duration::from_secs(1))
            .build();

        let executor = RetryExecutor::new(config);

        let result = executor
            .execute(
                &CancellationToken::new(),
                |_| {
                    let attempts = attempts.clone();
                    async move {
                        let attempt = attempts.fetch_add(1, Ordering::SeqCst);
                        if attempt < 2 {
                            Err(HarnessError::Transport("Temporary error".into()))
                        } else {
                            Ok("Success")
                        }
                    }
                },
                retry_errors,
            )
            .await;

        assert_eq!(result.unwrap(), "Success");
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_last_outcome_returned_when_exhausted() {
        let config = RetryConfigBuilder::new()
            .max_attempts(2)
            .fixed_backoff(Duration::from_millis(1))
            .build();

        let executor = RetryExecutor::new(config);

        let result: Result<&'static str> = executor
            .execute(
                &CancellationToken::new(),
                |n| async move { Err(HarnessError::Transport(format!("attempt {}", n))) },
                retry_errors,
            )
            .await;

        match result {
            Err(HarnessError::Transport(msg)) => assert_eq!(msg, "attempt 1"),
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_non_retryable_stops_immediately() {
        let attempts = Arc::new(AtomicU32::new(0));
        let executor = RetryExecutor::new(RetryConfig::default());

        let result: Result<()> = executor
            .execute(
                &CancellationToken::new(),
                |_| {
                    let attempts = attempts.clone();
                    async move {
                        attempts.fetch_add(1, Ordering::SeqCst);
                        Err(HarnessError::ProtocolViolation("Fatal error".into()))
                    }
                },
                |r| matches!(r, Err(HarnessError::Transport(_))),
            )
            .await;

        assert_eq!(attempts.load(Ordering::SeqCst), 1);
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_cancelled_between_attempts() {
        let token = CancellationToken::new();
        let executor = RetryExecutor::new(
            RetryConfigBuilder::new()
                .max_attempts(5)
                .fixed_backoff(Duration::from_secs(30))
                .build(),
        );

        let result: Result<()> = executor
            .execute(
                &token,
                |_| {
                    token.cancel();
                    async { Err(HarnessError::Transport("down".into())) }
                },
                |_| true,
            )
            .await;

        assert!(matches!(result, Err(HarnessError::Cancelled)));
    }

    #[test]
    fn test_backoff_model_schedule() {
        let model = BackoffModel::default();
        assert_eq!(
            model.schedule(),
            vec![Duration::from_secs(1), Duration::from_secs(2), Duration::from_secs(4)]
        );
        assert_eq!(model.total_delay(), Duration::from_secs(7));
        assert!(!model.should_retry(3));
        assert!(BackoffModel::validate_count(-1).is_err());
        assert_eq!(BackoffModel::validate_count(2).unwrap(), 2);
    }

    #[test]
    fn test_exponential_strategy_caps_at_max() {
        let strategy = BackoffStrategy::Exponential {
            base: Duration::from_millis(100),
            max: Duration::from_secs(1),
            multiplier: 2.0,
        };
        assert_eq!(strategy.delay(0), Duration::from_millis(100));
        assert_eq!(strategy.delay(3), Duration::from_millis(800));
        assert_eq!(strategy.delay(4), Duration::from_secs(1));
        assert_eq!(strategy.delay(200), Duration::from_secs(1));
    }
}
