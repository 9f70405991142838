//! Observability Port (Driven Port)
//!
//! Structured events emitted by the pipeline. The core never logs metrics
//! itself; adapters decide how each event is rendered (log line, counter,
//! or both).

use std::sync::Arc;

use crate::domain::connection::Transition;
use crate::domain::error::{CapacityError, FatalConnectivityError, ValidationError};
use crate::domain::subscription::{BackpressurePolicy, SubscriptionId};

/// A pipeline event.
#[derive(Debug, Clone, PartialEq)]
pub enum FeedEvent {
    /// The connection state machine changed state.
    ConnectionTransition(Transition),
    /// A raw record failed validation and was dropped.
    RecordRejected {
        /// Symbol as received (possibly empty).
        symbol: String,
        /// Validation failure.
        error: ValidationError,
    },
    /// A duplicate or stale update was filtered.
    DuplicateDropped {
        /// Symbol.
        symbol: Arc<str>,
        /// Rejected sequence.
        sequence: u64,
    },
    /// A non-blocking policy dropped an update for one subscriber.
    QueueOverflow {
        /// Affected subscription.
        subscription: SubscriptionId,
        /// Policy that applied.
        policy: BackpressurePolicy,
        /// Symbol of the dropped update.
        symbol: Arc<str>,
        /// Sequence of the dropped update.
        sequence: u64,
    },
    /// A `Block` subscriber stayed full for its whole timeout.
    Backpressure(CapacityError),
    /// A subscriber callback returned an error or panicked.
    CallbackFailed {
        /// Affected subscription.
        subscription: SubscriptionId,
        /// Symbol of the update being delivered.
        symbol: Arc<str>,
        /// Sequence of the update being delivered.
        sequence: u64,
        /// Error or panic message.
        error: String,
    },
    /// Reconnection attempts were exhausted.
    FatalConnectivity(FatalConnectivityError),
}

impl FeedEvent {
    /// Short, stable label for metrics and logs.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::ConnectionTransition(_) => "connection_transition",
            Self::RecordRejected { .. } => "record_rejected",
            Self::DuplicateDropped { .. } => "duplicate_dropped",
            Self::QueueOverflow { .. } => "queue_overflow",
            Self::Backpressure(_) => "backpressure",
            Self::CallbackFailed { .. } => "callback_failed",
            Self::FatalConnectivity(_) => "fatal_connectivity",
        }
    }
}

/// Receiver of pipeline events.
///
/// Called inline on the pipeline's tasks, so implementations must not
/// block.
#[cfg_attr(test, mockall::automock)]
pub trait ObservabilitySink: Send + Sync {
    /// Record an event.
    fn record(&self, event: &FeedEvent);
}

/// Sink that discards every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopSink;

impl ObservabilitySink for NoopSink {
    fn record(&self, _event: &FeedEvent) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_are_distinct() {
        let events = [
            FeedEvent::RecordRejected {
                symbol: String::new(),
                error: ValidationError::EmptySymbol,
            },
            FeedEvent::DuplicateDropped {
                symbol: Arc::from("X"),
                sequence: 1,
            },
            FeedEvent::FatalConnectivity(FatalConnectivityError {
                attempts: 1,
                last_error: "refused".to_string(),
            }),
        ];
        let kinds: std::collections::HashSet<_> = events.iter().map(FeedEvent::kind).collect();
        assert_eq!(kinds.len(), events.len());
    }

    #[test]
    fn mock_sink_sees_events() {
        let mut sink = MockObservabilitySink::new();
        sink.expect_record()
            .withf(|event| event.kind() == "duplicate_dropped")
            .times(1)
            .return_const(());

        sink.record(&FeedEvent::DuplicateDropped {
            symbol: Arc::from("X"),
            sequence: 4,
        });
    }
}
