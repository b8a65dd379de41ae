//! Retry policy for transient query failures.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::error::DriverError;

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total attempts per statement, including the first. Never below 1.
    pub max_attempts: u32,
    /// Delay before the first retry.
    pub initial_delay: Duration,
    /// Maximum delay between retries.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Whether to add jitter to delays.
    pub jitter: bool,
    /// Strategy computing the delay before each retry.
    pub backoff: Arc<dyn Backoff>,
    /// Predicate to determine if an error is retryable.
    pub retry_on: RetryPredicate,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 2.0,
            jitter: true,
            backoff: Arc::new(ExponentialBackoff),
            retry_on: RetryPredicate::Default,
        }
    }
}

impl RetryConfig {
    /// Create a new retry config.
    pub fn new() -> Self {
        Self::default()
    }

    /// A config that makes exactly one attempt.
    pub fn no_retry() -> Self {
        Self::new().max_attempts(1)
    }

    /// Set the total number of attempts.
    pub fn max_attempts(mut self, n: u32) -> Self {
        self.max_attempts = n.max(1);
        self
    }

    /// Set initial delay.
    pub fn initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Set maximum delay.
    pub fn max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Set backoff multiplier.
    pub fn backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Enable or disable jitter.
    pub fn jitter(mut self, enabled: bool) -> Self {
        self.jitter = enabled;
        self
    }

    /// Set the backoff strategy.
    pub fn backoff(mut self, backoff: impl Backoff + 'static) -> Self {
        self.backoff = Arc::new(backoff);
        self
    }

    /// Set retry predicate.
    pub fn retry_on(mut self, predicate: RetryPredicate) -> Self {
        self.retry_on = predicate;
        self
    }

    /// Delay before retry number `retry` (0 for the first retry).
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        self.backoff.delay(retry, self)
    }

    /// Whether a failure on `attempt` (1-based) should be retried.
    pub fn should_retry(&self, error: &DriverError, attempt: u32) -> bool {
        attempt < self.max_attempts && self.retry_on.should_retry(error)
    }
}

/// Computes the delay before a retry.
pub trait Backoff: Send + Sync + fmt::Debug {
    /// Delay before retry number `retry` (0 for the first retry).
    fn delay(&self, retry: u32, config: &RetryConfig) -> Duration;
}

/// Exponential backoff from `initial_delay`, capped at `max_delay`, with up
/// to 25% jitter when enabled.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExponentialBackoff;

impl Backoff for ExponentialBackoff {
    fn delay(&self, retry: u32, config: &RetryConfig) -> Duration {
        let base_delay = config.initial_delay.as_millis() as f64
            * config.backoff_multiplier.powi(retry as i32);

        let delay_ms = base_delay.min(config.max_delay.as_millis() as f64);

        let final_delay = if config.jitter {
            delay_ms + delay_ms * 0.25 * rand_jitter()
        } else {
            delay_ms
        };

        Duration::from_millis(final_delay as u64)
    }
}

/// The same delay before every retry.
#[derive(Debug, Clone, Copy)]
pub struct ConstantBackoff(pub Duration);

impl Backoff for ConstantBackoff {
    fn delay(&self, _retry: u32, _config: &RetryConfig) -> Duration {
        self.0
    }
}

/// Predicate for determining if an error should trigger a retry.
#[derive(Clone, Default)]
pub enum RetryPredicate {
    /// Retry transient failures.
    #[default]
    Default,
    /// Never retry.
    Never,
    /// Caller-supplied classifier.
    Custom(Arc<dyn Fn(&DriverError) -> bool + Send + Sync>),
}

impl RetryPredicate {
    /// Wrap a classifier function.
    pub fn custom(f: impl Fn(&DriverError) -> bool + Send + Sync + 'static) -> Self {
        Self::Custom(Arc::new(f))
    }

    /// Check if an error should be retried.
    pub fn should_retry(&self, error: &DriverError) -> bool {
        match self {
            Self::Default => error.is_transient(),
            Self::Never => false,
            Self::Custom(f) => f(error),
        }
    }
}

impl fmt::Debug for RetryPredicate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Default => f.write_str("Default"),
            Self::Never => f.write_str("Never"),
            Self::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

fn rand_jitter() -> f64 {
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hasher};

    let hasher = RandomState::new().build_hasher();
    let hash = hasher.finish();
    (hash % 1000) as f64 / 1000.0
}
