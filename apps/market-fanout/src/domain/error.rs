//! Error Taxonomy
//!
//! Error types shared across the pipeline. Only
//! [`FatalConnectivityError`] ever leaves the core; the others are handled
//! where they occur and surface as counters and observability events.

use std::time::Duration;

use super::subscription::SubscriptionId;

/// Connection-level failure. Recoverable through the supervisor's backoff.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// Establishing the connection failed.
    #[error("connection failed: {0}")]
    ConnectFailed(String),
    /// An established connection failed while streaming.
    #[error("stream failed: {0}")]
    StreamFailed(String),
    /// The upstream closed the stream.
    #[error("end of stream")]
    EndOfStream,
    /// No record arrived within the heartbeat window.
    #[error("heartbeat timeout after {0:?}")]
    HeartbeatTimeout(Duration),
}

/// A single malformed record. Recoverable by dropping that record.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ValidationError {
    /// The symbol was empty or whitespace.
    #[error("empty symbol")]
    EmptySymbol,
    /// The price was NaN or infinite.
    #[error("price is not finite: {0}")]
    NonFinitePrice(f64),
    /// The price was below zero.
    #[error("price is negative: {0}")]
    NegativePrice(f64),
    /// The price could not be represented as a decimal.
    #[error("price not representable as decimal: {0}")]
    UnrepresentablePrice(f64),
    /// The sequence number cannot be represented as `u64`.
    #[error("sequence number is negative: {0}")]
    NegativeSequence(i64),
}

impl ValidationError {
    /// Short, stable label for metrics and logs.
    #[must_use]
    pub const fn reason(&self) -> &'static str {
        match self {
            Self::EmptySymbol => "empty_symbol",
            Self::NonFinitePrice(_) => "non_finite_price",
            Self::NegativePrice(_) => "negative_price",
            Self::UnrepresentablePrice(_) => "unrepresentable_price",
            Self::NegativeSequence(_) => "negative_sequence",
        }
    }
}

/// A `Block` subscriber stayed full for the whole offer timeout.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("subscription {subscription} queue full for {timeout:?}, dropped {symbol}#{sequence}")]
pub struct CapacityError {
    /// Affected subscription.
    pub subscription: SubscriptionId,
    /// Offer timeout that elapsed.
    pub timeout: Duration,
    /// Symbol of the dropped update.
    pub symbol: String,
    /// Sequence of the dropped update.
    pub sequence: u64,
}

/// Reconnection attempts were exhausted. No further automatic recovery.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("connectivity lost after {attempts} reconnection attempts: {last_error}")]
pub struct FatalConnectivityError {
    /// Number of failed attempts.
    pub attempts: u32,
    /// The error that exhausted the budget.
    pub last_error: String,
}
