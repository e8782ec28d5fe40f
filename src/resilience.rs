//! Retry backoff for the ingestion stream.
//!
//! Transport failures are never surfaced to callers. The ingestion task
//! keeps retrying with exponential backoff while the collection serves its
//! last known state, flagged as stale.
//!
//! # Example
//!
//! ```rust
//! use sync_collection::resilience::RetryConfig;
//! use std::time::Duration;
//!
//! let retry = RetryConfig::testing();
//! assert_eq!(retry.delay_for_attempt(1), Duration::from_millis(10));
//! assert_eq!(retry.delay_for_attempt(2), Duration::from_millis(20));
//! ```

use std::time::Duration;

/// Configuration for reconnect behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of consecutive failed attempts before giving up.
    /// `usize::MAX` retries forever.
    pub max_attempts: usize,

    /// Delay before the first retry.
    pub initial_delay: Duration,

    /// Ceiling for the exponential backoff.
    pub max_delay: Duration,

    /// Backoff multiplier (2.0 doubles the delay each retry).
    pub backoff_factor: f64,
}

impl Default for RetryConfig {
    /// Retry forever, 100ms doubling up to 30s.
    fn default() -> Self {
        Self {
            max_attempts: usize::MAX,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_factor: 2.0,
        }
    }
}

impl RetryConfig {
    /// Give up after `max_attempts` consecutive failures.
    ///
    /// ```text
    /// Attempt  Delay (default 100ms x2, 30s cap)
    /// -------  -----
    /// 1        100ms
    /// 2        200ms
    /// 3        400ms
    /// ...
    /// 9        25.6s
    /// 10+      30s (cap)
    /// ```
    pub fn bounded(max_attempts: usize) -> Self {
        Self {
            max_attempts,
            ..Self::default()
        }
    }

    /// Fast retries for tests.
    pub fn testing() -> Self {
        Self {
            max_attempts: usize::MAX,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(100),
            backoff_factor: 2.0,
        }
    }

    /// Delay before reconnect attempt `attempt` (1-indexed).
    ///
    /// Saturates at `max_delay` instead of overflowing for large attempts.
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        let Some(retry) = attempt.checked_sub(1) else {
            return self.initial_delay;
        };
        let exponent = i32::try_from(retry).unwrap_or(i32::MAX);
        let secs = self.initial_delay.as_secs_f64() * self.backoff_factor.powi(exponent);
        if secs.is_finite() && secs < self.max_delay.as_secs_f64() {
            Duration::from_secs_f64(secs)
        } else {
            self.max_delay
        }
    }

    /// Check if another attempt is allowed after `attempts` consecutive failures.
    pub fn should_retry(&self, attempts: usize) -> bool {
        attempts < self.max_attempts
    }
}
