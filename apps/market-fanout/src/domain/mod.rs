//! Domain Layer - Core pipeline types and business logic.
//!
//! Pure Rust with no I/O: every type here can be driven synchronously in
//! tests. Time enters only as explicit `Instant` parameters.

/// Error taxonomy shared across the pipeline.
pub mod error;

/// Market data types (raw records, validated updates).
pub mod streaming;

/// Per-symbol duplicate and staleness filtering.
pub mod sequence;

/// Upstream connection state machine and backoff.
pub mod connection;

/// Subscription tracking, bounded queues and backpressure policies.
pub mod subscription;
