//! Reconnection Backoff
//!
//! Exponential backoff with jitter for upstream reconnection.
//!
//! The delay for attempt `n` is
//! `base * multiplier^min(n, exponent_cap) * (1 ± jitter_factor)`, clamped
//! to `max_delay`. Unlike a stateful iterator, the policy is a pure
//! function of the attempt number; the attempt count itself lives in the
//! connection state machine.

use std::time::Duration;

use rand::Rng;

/// Configuration for reconnection behavior.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffConfig {
    /// Base delay that the exponential factor scales.
    pub base_delay: Duration,
    /// Maximum delay between reconnection attempts.
    pub max_delay: Duration,
    /// Multiplier for exponential backoff (e.g., 2.0 doubles delay each attempt).
    pub multiplier: f64,
    /// Largest exponent applied; later attempts reuse this delay.
    pub exponent_cap: u32,
    /// Jitter factor as a fraction (e.g., 0.1 = ±10% randomization).
    pub jitter_factor: f64,
    /// Maximum number of reconnection attempts (0 = unlimited).
    pub max_attempts: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            exponent_cap: 6,
            jitter_factor: 0.1,
            max_attempts: 0, // Unlimited
        }
    }
}

/// Computes reconnection delays.
///
/// # Example
///
/// ```rust
/// use market_fanout::domain::connection::{BackoffConfig, BackoffPolicy};
/// use std::time::Duration;
///
/// let policy = BackoffPolicy::new(BackoffConfig {
///     base_delay: Duration::from_millis(100),
///     jitter_factor: 0.0,
///     ..BackoffConfig::default()
/// });
///
/// assert_eq!(policy.delay(1), Duration::from_millis(200));
/// assert_eq!(policy.delay(2), Duration::from_millis(400));
/// ```
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    config: BackoffConfig,
}

impl BackoffPolicy {
    /// Create a new policy.
    #[must_use]
    pub const fn new(config: BackoffConfig) -> Self {
        Self { config }
    }

    /// The policy configuration.
    #[must_use]
    pub const fn config(&self) -> &BackoffConfig {
        &self.config
    }

    /// Whether another attempt numbered `attempt` is allowed.
    #[must_use]
    pub const fn allows(&self, attempt: u32) -> bool {
        self.config.max_attempts == 0 || attempt <= self.config.max_attempts
    }

    /// Delay before attempt `attempt`, with jitter applied.
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        self.apply_jitter(self.nominal_delay(attempt))
    }

    /// Delay before attempt `attempt`, without jitter.
    ///
    /// Non-decreasing in `attempt` for any multiplier `>= 1`.
    #[must_use]
    pub fn nominal_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(self.config.exponent_cap);
        #[allow(clippy::cast_possible_wrap)]
        let factor = self.config.multiplier.max(1.0).powi(exponent as i32);

        #[allow(clippy::cast_precision_loss)]
        let scaled = (self.config.base_delay.as_millis() as f64 * factor).round();
        #[allow(clippy::cast_precision_loss)]
        let max_millis = self.config.max_delay.as_millis() as f64;

        let millis = if scaled.is_finite() && scaled > 0.0 {
            scaled.min(max_millis)
        } else {
            max_millis
        };

        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let millis_u64 = millis as u64;
        Duration::from_millis(millis_u64)
    }

    /// Apply jitter to a duration, keeping the result within `max_delay`.
    ///
    /// A non-finite or non-positive factor disables jitter; factors above
    /// 1.0 are treated as 1.0.
    fn apply_jitter(&self, duration: Duration) -> Duration {
        let factor = self.config.jitter_factor;
        if !factor.is_finite() || factor <= 0.0 {
            return duration;
        }

        #[allow(clippy::cast_precision_loss)]
        let base_millis = duration.as_millis() as f64;
        let jitter_range = base_millis * factor.min(1.0);
        let mut rng = rand::rng();
        let jitter: f64 = rng.random_range(-jitter_range..=jitter_range);
        #[allow(clippy::cast_precision_loss)]
        let max_millis = self.config.max_delay.as_millis() as f64;
        let adjusted_millis = (base_millis + jitter).clamp(1.0, max_millis.max(1.0));

        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let adjusted_u64 = adjusted_millis as u64;
        Duration::from_millis(adjusted_u64)
    }
}
