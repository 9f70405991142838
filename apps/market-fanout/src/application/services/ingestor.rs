//! Record Ingestor
//!
//! Turns raw transport records into validated [`MarketUpdate`]s, filters
//! duplicates through the [`SequenceTracker`], and hands accepted updates
//! to the [`FanoutDispatcher`].
//!
//! ```text
//! RawRecord ──normalize──► MarketUpdate ──SequenceTracker──► FanoutDispatcher
//!               │                               │
//!            invalid                       duplicate/stale
//!               ▼                               ▼
//!        counted + event                 counted + event
//! ```
//!
//! The ingestor is owned by the connection supervisor task, so the
//! tracker needs no locking. Counters are shared atomics so the processor
//! can read them from any thread.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use rust_decimal::Decimal;
use rust_decimal::prelude::FromPrimitive;
use tracing::{debug, trace};

use super::dispatcher::{DispatchReport, FanoutDispatcher};
use crate::application::ports::{Clock, FeedEvent, ObservabilitySink};
use crate::domain::error::ValidationError;
use crate::domain::sequence::SequenceTracker;
use crate::domain::streaming::{MarketUpdate, RawRecord, RawSequence};

/// Result of ingesting one record.
#[derive(Debug, Clone, PartialEq)]
pub enum IngestOutcome {
    /// Accepted and dispatched.
    Delivered(DispatchReport),
    /// Already seen or older than the last accepted sequence.
    Duplicate,
    /// Failed validation and was dropped.
    Invalid(ValidationError),
}

/// Validate a raw record and stamp it with `arrival_timestamp`.
///
/// # Errors
///
/// Returns a [`ValidationError`] for an empty symbol, a non-finite or
/// negative price, a price that does not fit a decimal, or a negative
/// sequence number.
pub fn normalize(raw: &RawRecord, arrival_timestamp: i64) -> Result<MarketUpdate, ValidationError> {
    let symbol = raw.symbol.trim();
    if symbol.is_empty() {
        return Err(ValidationError::EmptySymbol);
    }
    if !raw.price.is_finite() {
        return Err(ValidationError::NonFinitePrice(raw.price));
    }
    if raw.price < 0.0 {
        return Err(ValidationError::NegativePrice(raw.price));
    }
    let price =
        Decimal::from_f64(raw.price).ok_or(ValidationError::UnrepresentablePrice(raw.price))?;
    let sequence = match raw.sequence {
        RawSequence::Unsigned(sequence) => sequence,
        RawSequence::Signed(sequence) => u64::try_from(sequence)
            .map_err(|_| ValidationError::NegativeSequence(sequence))?,
    };

    Ok(MarketUpdate::new(
        symbol,
        price,
        sequence,
        raw.source_timestamp,
        arrival_timestamp,
    ))
}

/// Shared ingest counters.
#[derive(Debug, Default)]
pub struct IngestCounters {
    received: AtomicU64,
    invalid: AtomicU64,
    duplicates: AtomicU64,
    accepted: AtomicU64,
}

impl IngestCounters {
    /// Snapshot the counters.
    #[must_use]
    pub fn snapshot(&self) -> IngestStats {
        IngestStats {
            received: self.received.load(Ordering::Relaxed),
            invalid: self.invalid.load(Ordering::Relaxed),
            duplicates: self.duplicates.load(Ordering::Relaxed),
            accepted: self.accepted.load(Ordering::Relaxed),
        }
    }
}

/// Ingest counter snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestStats {
    /// Records pulled from the transport.
    pub received: u64,
    /// Records dropped by validation.
    pub invalid: u64,
    /// Updates dropped as duplicates or stale.
    pub duplicates: u64,
    /// Updates accepted and dispatched.
    pub accepted: u64,
}

/// Validates, deduplicates and forwards records.
pub struct Ingestor {
    tracker: SequenceTracker,
    dispatcher: FanoutDispatcher,
    clock: Arc<dyn Clock>,
    sink: Arc<dyn ObservabilitySink>,
    counters: Arc<IngestCounters>,
}

impl Ingestor {
    /// Create an ingestor.
    #[must_use]
    pub fn new(
        tracker: SequenceTracker,
        dispatcher: FanoutDispatcher,
        clock: Arc<dyn Clock>,
        sink: Arc<dyn ObservabilitySink>,
    ) -> Self {
        Self {
            tracker,
            dispatcher,
            clock,
            sink,
            counters: Arc::new(IngestCounters::default()),
        }
    }

    /// Share an existing counter set instead of a fresh one.
    #[must_use]
    pub fn with_counters(mut self, counters: Arc<IngestCounters>) -> Self {
        self.counters = counters;
        self
    }

    /// Shared counters.
    #[must_use]
    pub const fn counters(&self) -> &Arc<IngestCounters> {
        &self.counters
    }

    /// The dedup state.
    #[must_use]
    pub const fn tracker(&self) -> &SequenceTracker {
        &self.tracker
    }

    /// Process one raw record.
    pub async fn ingest(&mut self, raw: RawRecord) -> IngestOutcome {
        self.counters.received.fetch_add(1, Ordering::Relaxed);

        let update = match normalize(&raw, self.clock.timestamp_nanos()) {
            Ok(update) => update,
            Err(error) => {
                self.counters.invalid.fetch_add(1, Ordering::Relaxed);
                debug!(symbol = %raw.symbol, reason = error.reason(), "Dropping invalid record");
                self.sink.record(&FeedEvent::RecordRejected {
                    symbol: raw.symbol,
                    error: error.clone(),
                });
                return IngestOutcome::Invalid(error);
            }
        };

        if !self.tracker.accept_update(&update) {
            self.counters.duplicates.fetch_add(1, Ordering::Relaxed);
            trace!(
                symbol = update.symbol(),
                sequence = update.sequence(),
                "Dropping duplicate update"
            );
            self.sink.record(&FeedEvent::DuplicateDropped {
                symbol: Arc::clone(update.symbol_arc()),
                sequence: update.sequence(),
            });
            return IngestOutcome::Duplicate;
        }

        self.counters.accepted.fetch_add(1, Ordering::Relaxed);
        IngestOutcome::Delivered(self.dispatcher.dispatch(&update).await)
    }
}

impl std::fmt::Debug for Ingestor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ingestor")
            .field("tracker", &self.tracker)
            .field("counters", &self.counters.snapshot())
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Tests
// =============================================================================
