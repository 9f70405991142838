#![cfg_attr(
    test,
    allow(
        clippy::unwrap_used,
        clippy::expect_used,
        clippy::float_cmp,
        clippy::significant_drop_tightening,
        clippy::too_many_lines,
        clippy::match_same_arms,
        clippy::needless_pass_by_value,
        clippy::needless_collect,
        clippy::option_if_let_else,
        clippy::default_trait_access,
        clippy::items_after_statements,
        clippy::or_fun_call
    )
)]

//! Market Fanout - Market Data Ingestion and Multicast Engine
//!
//! Maintains a single supervised connection to an upstream price feed,
//! validates and deduplicates sequenced updates per symbol, and fans them
//! out to many independent subscribers, each with its own bounded queue
//! and backpressure policy.
//!
//! # Layers (inside → outside)
//!
//! - **Domain**: Core pipeline types with no I/O
//!   - `streaming`: Raw records and validated updates
//!   - `sequence`: Per-symbol duplicate filtering
//!   - `connection`: Connection state machine and backoff
//!   - `subscription`: Bounded queues and backpressure policies
//!
//! - **Application**: Use cases and port definitions
//!   - `ports`: Transport, clock, observability and subscriber interfaces
//!   - `services`: Ingest, dispatch, delivery, supervision, processor
//!
//! - **Infrastructure**: Adapters and external integrations
//!   - `websocket`: WebSocket feed transport (JSON and `MessagePack`)
//!   - `config`: Environment configuration
//!   - `metrics`: Prometheus exporter and metrics sink
//!   - `telemetry`: Tracing setup and log sink
//!
//! # Data Flow
//!
//! ```text
//!                 ┌────────────┐   ┌────────────┐   ┌──────────┐
//! Upstream WS ───►│ Supervisor │──►│  Ingestor  │──►│Dispatcher│
//!                 │ (backoff)  │   │(validate,  │   └────┬─────┘
//!                 └────────────┘   │  dedup)    │        │ offer per policy
//!                                  └────────────┘   ┌────┴─────┬──────────┐
//!                                                   ▼          ▼          ▼
//!                                                Queue 1    Queue 2    Queue N
//!                                                   │          │          │
//!                                                Worker 1   Worker 2   Worker N
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::pedantic)]

// =============================================================================
// Module Declarations
// =============================================================================

/// Domain layer - Core pipeline types with no external dependencies.
pub mod domain;

/// Application layer - Use cases and port definitions.
pub mod application;

/// Infrastructure layer - Adapters and external integrations.
pub mod infrastructure;

// =============================================================================
// Re-exports
// =============================================================================

// Domain types
pub use domain::connection::{BackoffConfig, ConnectionState};
pub use domain::error::{CapacityError, FatalConnectivityError, TransportError, ValidationError};
pub use domain::streaming::{MarketUpdate, RawRecord, RawSequence};
pub use domain::subscription::{
    BackpressurePolicy, SubscriptionId, SubscriptionOptions, SubscriptionStats,
};

// Ports
pub use application::ports::{
    Clock, Connection, FeedEvent, NoopSink, ObservabilitySink, Subscriber, SystemClock, Transport,
};

// Processor
pub use application::services::{
    MarketDataProcessor, ProcessorConfig, ProcessorError, ProcessorStats, ShutdownPolicy,
    SubscriptionHandle,
};

// Infrastructure config
pub use infrastructure::config::{ConfigError, FanoutConfig, FeedCodec};

// WebSocket transport
pub use infrastructure::websocket::WebSocketTransport;

// Metrics
pub use infrastructure::metrics::{MetricsSink, init_metrics};

// Telemetry
pub use infrastructure::telemetry::{
    FanoutSink, TelemetryConfig, TelemetryGuard, TracingSink, init as init_telemetry,
};
