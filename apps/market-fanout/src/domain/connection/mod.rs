//! Connection Lifecycle State Machine
//!
//! A pure, clock-injected model of the upstream connection lifecycle.
//! Every input takes the current `Instant` as a parameter, so the
//! transitions (including backoff deadlines and the attempt budget) can
//! be tested without real timers.
//!
//! # State Machine
//!
//! ```text
//! Disconnected ──connect──► Connecting ──success──► Streaming
//!                               │                       │
//!                            failure          error / heartbeat timeout
//!                               ▼                       ▼
//!                        Backoff(n, t) ◄────────── Backoff(1, t)
//!                               │
//!                        timer fires at t ──► Connecting (attempt n)
//!                        budget exhausted ──► Closed (fatal)
//!
//! any state ──stop──► Closed (terminal)
//! ```

mod backoff;

use std::fmt;
use std::time::{Duration, Instant};

pub use backoff::{BackoffConfig, BackoffPolicy};

use super::error::FatalConnectivityError;

// =============================================================================
// State
// =============================================================================

/// Upstream connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Not yet connected.
    Disconnected,
    /// A connection attempt is in flight.
    Connecting,
    /// Connected and receiving records.
    Streaming,
    /// Waiting before the next reconnection attempt.
    Backoff {
        /// Attempt number that will run when the timer fires.
        attempt: u32,
        /// When the next attempt is due.
        next_retry_at: Instant,
    },
    /// Terminal state.
    Closed,
}

impl ConnectionState {
    /// Short, stable label for metrics and logs.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Streaming => "streaming",
            Self::Backoff { .. } => "backoff",
            Self::Closed => "closed",
        }
    }

    /// Check if this is the terminal state.
    #[must_use]
    pub const fn is_closed(&self) -> bool {
        matches!(self, Self::Closed)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Backoff { attempt, .. } => write!(f, "backoff(attempt={attempt})"),
            other => f.write_str(other.as_str()),
        }
    }
}

/// A state change, returned by every successful input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    /// State before the input.
    pub from: ConnectionState,
    /// State after the input.
    pub to: ConnectionState,
}

/// Outcome of reporting a failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Waiting for the retry timer.
    Retry {
        /// The resulting transition into `Backoff`.
        transition: Transition,
        /// Delay until the retry is due.
        delay: Duration,
    },
    /// The attempt budget is exhausted; the machine is now `Closed`.
    Fatal {
        /// The resulting transition into `Closed`.
        transition: Transition,
        /// Error to surface to the caller.
        error: FatalConnectivityError,
    },
}

/// An input was applied in a state that does not accept it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid input '{input}' in state {state}")]
pub struct TransitionError {
    /// The rejected input.
    pub input: &'static str,
    /// State at the time of the input.
    pub state: ConnectionState,
}

// =============================================================================
// State Machine
// =============================================================================

/// The connection state machine.
///
/// # Example
///
/// ```rust
/// use market_fanout::domain::connection::{
///     BackoffConfig, ConnectionState, ConnectionStateMachine,
/// };
/// use std::time::Instant;
///
/// let mut machine = ConnectionStateMachine::new(BackoffConfig::default());
/// let now = Instant::now();
///
/// machine.connect().unwrap();
/// machine.on_connected().unwrap();
/// assert_eq!(machine.state(), ConnectionState::Streaming);
///
/// machine.on_failure(now, "reset by peer").unwrap();
/// assert!(matches!(machine.state(), ConnectionState::Backoff { attempt: 1, .. }));
/// ```
#[derive(Debug)]
pub struct ConnectionStateMachine {
    state: ConnectionState,
    policy: BackoffPolicy,
    /// Attempt number of the connection currently being made (0 = fresh).
    attempt: u32,
}

impl ConnectionStateMachine {
    /// Create a machine in `Disconnected`.
    #[must_use]
    pub const fn new(config: BackoffConfig) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            policy: BackoffPolicy::new(config),
            attempt: 0,
        }
    }

    /// Current state.
    #[must_use]
    pub const fn state(&self) -> ConnectionState {
        self.state
    }

    /// The backoff policy in use.
    #[must_use]
    pub const fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }

    /// `Disconnected -> Connecting`.
    ///
    /// # Errors
    ///
    /// Returns an error in any other state.
    pub fn connect(&mut self) -> Result<Transition, TransitionError> {
        match self.state {
            ConnectionState::Disconnected => {
                self.attempt = 0;
                Ok(self.move_to(ConnectionState::Connecting))
            }
            state => Err(TransitionError {
                input: "connect",
                state,
            }),
        }
    }

    /// `Connecting -> Streaming`. Resets the attempt budget.
    ///
    /// # Errors
    ///
    /// Returns an error unless the machine is `Connecting`.
    pub fn on_connected(&mut self) -> Result<Transition, TransitionError> {
        match self.state {
            ConnectionState::Connecting => {
                self.attempt = 0;
                Ok(self.move_to(ConnectionState::Streaming))
            }
            state => Err(TransitionError {
                input: "connected",
                state,
            }),
        }
    }

    /// Report a connect failure, transport error or heartbeat timeout.
    ///
    /// From `Streaming` the retry count restarts at 1; from `Connecting` it
    /// advances by one. When the next attempt would exceed the budget the
    /// machine closes and returns [`FailureOutcome::Fatal`].
    ///
    /// # Errors
    ///
    /// Returns an error unless the machine is `Connecting` or `Streaming`.
    pub fn on_failure(
        &mut self,
        now: Instant,
        reason: &str,
    ) -> Result<FailureOutcome, TransitionError> {
        let next_attempt = match self.state {
            ConnectionState::Streaming => 1,
            ConnectionState::Connecting => self.attempt.saturating_add(1),
            state => {
                return Err(TransitionError {
                    input: "failure",
                    state,
                });
            }
        };

        if !self.policy.allows(next_attempt) {
            let attempts = self.attempt;
            let transition = self.move_to(ConnectionState::Closed);
            return Ok(FailureOutcome::Fatal {
                transition,
                error: FatalConnectivityError {
                    attempts,
                    last_error: reason.to_string(),
                },
            });
        }

        let delay = self.policy.delay(next_attempt);
        self.attempt = next_attempt;
        let transition = self.move_to(ConnectionState::Backoff {
            attempt: next_attempt,
            next_retry_at: now + delay,
        });

        Ok(FailureOutcome::Retry { transition, delay })
    }

    /// `Backoff(n, t) -> Connecting` once `now >= t`.
    ///
    /// Returns `Ok(None)` if the timer has not fired yet.
    ///
    /// # Errors
    ///
    /// Returns an error unless the machine is in `Backoff`.
    pub fn on_retry_due(&mut self, now: Instant) -> Result<Option<Transition>, TransitionError> {
        match self.state {
            ConnectionState::Backoff { next_retry_at, .. } if now >= next_retry_at => {
                Ok(Some(self.move_to(ConnectionState::Connecting)))
            }
            ConnectionState::Backoff { .. } => Ok(None),
            state => Err(TransitionError {
                input: "retry",
                state,
            }),
        }
    }

    /// Any state `-> Closed`. Returns `None` if already closed.
    pub fn stop(&mut self) -> Option<Transition> {
        if self.state.is_closed() {
            return None;
        }
        Some(self.move_to(ConnectionState::Closed))
    }

    /// Attempt number of the current or pending connection (0 = fresh).
    #[must_use]
    pub const fn attempt(&self) -> u32 {
        self.attempt
    }

    fn move_to(&mut self, to: ConnectionState) -> Transition {
        let from = std::mem::replace(&mut self.state, to);
        Transition { from, to }
    }
}

// =============================================================================
// Tests
// =============================================================================
