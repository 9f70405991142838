//! Clock Port (Driven Port)

use std::time::Instant;

/// Monotonic time source.
#[cfg_attr(test, mockall::automock)]
pub trait Clock: Send + Sync {
    /// Current instant, used for backoff deadlines.
    fn now(&self) -> Instant;

    /// Monotonic nanoseconds since the clock's origin, used as the
    /// arrival timestamp of every update.
    fn timestamp_nanos(&self) -> i64;
}

/// Clock backed by Tokio's time source.
///
/// Follows Tokio's paused clock when the runtime is started with time
/// paused, so tests can drive it with `tokio::time::advance`.
#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    origin: tokio::time::Instant,
}

impl SystemClock {
    /// Create a clock whose origin is the current instant.
    #[must_use]
    pub fn new() -> Self {
        Self {
            origin: tokio::time::Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        tokio::time::Instant::now().into_std()
    }

    fn timestamp_nanos(&self) -> i64 {
        let elapsed = self.origin.elapsed().as_nanos();
        i64::try_from(elapsed).unwrap_or(i64::MAX)
    }
}
