//! Market Data Streaming Types
//!
//! Core domain types for the update pipeline. `RawRecord` is what a
//! transport adapter hands over; `MarketUpdate` is the canonical,
//! validated form that flows through deduplication and fan-out.

use std::fmt;
use std::sync::Arc;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

// =============================================================================
// Raw Record
// =============================================================================

/// A loosely typed record as received from the upstream transport.
///
/// Fields are kept in their wire-friendly shapes (`f64`, either-signed
/// sequence) so that validation happens in exactly one place, the ingestor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawRecord {
    /// Instrument symbol.
    #[serde(alias = "S")]
    pub symbol: String,
    /// Last price.
    #[serde(alias = "p")]
    pub price: f64,
    /// Upstream sequence number.
    #[serde(alias = "seq", alias = "i")]
    pub sequence: RawSequence,
    /// Upstream event time in nanoseconds since the Unix epoch.
    #[serde(
        alias = "t",
        alias = "timestamp",
        default,
        deserialize_with = "crate::domain::streaming::timestamp::deserialize"
    )]
    pub source_timestamp: i64,
}

impl RawRecord {
    /// Create a raw record.
    #[must_use]
    pub fn new(symbol: impl Into<String>, price: f64, sequence: i64, source_timestamp: i64) -> Self {
        Self {
            symbol: symbol.into(),
            price,
            sequence: RawSequence::from(sequence),
            source_timestamp,
        }
    }
}

/// A sequence number as it appears on the wire.
///
/// Covers the whole `u64` range plus negative values, which the ingestor
/// rejects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawSequence {
    /// Zero or positive.
    Unsigned(u64),
    /// Negative.
    Signed(i64),
}

impl From<i64> for RawSequence {
    fn from(value: i64) -> Self {
        u64::try_from(value).map_or(Self::Signed(value), Self::Unsigned)
    }
}

impl From<u64> for RawSequence {
    fn from(value: u64) -> Self {
        Self::Unsigned(value)
    }
}

// =============================================================================
// Market Update
// =============================================================================

/// A validated, timestamped price update.
///
/// Immutable once constructed. Cloning is cheap: the symbol is reference
/// counted and every other field is `Copy`, so each subscriber queue can hold
/// its own logical copy without sharing mutable state.
#[derive(Clone, PartialEq, Eq)]
pub struct MarketUpdate {
    symbol: Arc<str>,
    price: Decimal,
    sequence: u64,
    source_timestamp: i64,
    arrival_timestamp: i64,
}

impl MarketUpdate {
    /// Create a new update.
    #[must_use]
    pub fn new(
        symbol: impl Into<Arc<str>>,
        price: Decimal,
        sequence: u64,
        source_timestamp: i64,
        arrival_timestamp: i64,
    ) -> Self {
        Self {
            symbol: symbol.into(),
            price,
            sequence,
            source_timestamp,
            arrival_timestamp,
        }
    }

    /// Instrument symbol.
    #[must_use]
    pub fn symbol(&self) -> &str {
        &self.symbol
    }

    /// Shared handle to the symbol.
    #[must_use]
    pub fn symbol_arc(&self) -> &Arc<str> {
        &self.symbol
    }

    /// Price.
    #[must_use]
    pub const fn price(&self) -> Decimal {
        self.price
    }

    /// Upstream sequence number.
    #[must_use]
    pub const fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Upstream event time (nanoseconds since the Unix epoch).
    #[must_use]
    pub const fn source_timestamp(&self) -> i64 {
        self.source_timestamp
    }

    /// Local monotonic arrival time (nanoseconds since the clock origin).
    #[must_use]
    pub const fn arrival_timestamp(&self) -> i64 {
        self.arrival_timestamp
    }
}

impl fmt::Debug for MarketUpdate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MarketUpdate")
            .field("symbol", &&*self.symbol)
            .field("price", &self.price)
            .field("sequence", &self.sequence)
            .field("source_timestamp", &self.source_timestamp)
            .field("arrival_timestamp", &self.arrival_timestamp)
            .finish()
    }
}

// =============================================================================
// Timestamp Decoding
// =============================================================================

/// Accepts either integer nanoseconds or an RFC 3339 string.
pub(crate) mod timestamp {
    use chrono::DateTime;
    use serde::{Deserialize, Deserializer, de};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum WireTimestamp {
        Nanos(i64),
        Text(String),
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<i64, D::Error>
    where
        D: Deserializer<'de>,
    {
        match WireTimestamp::deserialize(deserializer)? {
            WireTimestamp::Nanos(nanos) => Ok(nanos),
            WireTimestamp::Text(text) => {
                let parsed = DateTime::parse_from_rfc3339(&text).map_err(de::Error::custom)?;
                parsed
                    .timestamp_nanos_opt()
                    .ok_or_else(|| de::Error::custom("timestamp out of range"))
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
