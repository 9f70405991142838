//! Application Services
//!
//! Services that orchestrate domain logic and coordinate between ports.
//!
//! - `ingestor`: validation, timestamping and deduplication of raw records
//! - `dispatcher`: fan-out of accepted updates to subscription queues
//! - `delivery`: per-subscription drain loop invoking subscriber callbacks
//! - `supervisor`: upstream connection lifecycle and reconnection
//! - `processor`: the composed engine and its public API

pub mod delivery;
pub mod dispatcher;
pub mod ingestor;
pub mod processor;
pub mod supervisor;

pub use delivery::{DeliveryOutcome, DeliveryWorker};
pub use dispatcher::{DispatchReport, FanoutDispatcher};
pub use ingestor::{IngestCounters, IngestOutcome, IngestStats, Ingestor, normalize};
pub use processor::{
    MarketDataProcessor, ProcessorConfig, ProcessorError, ProcessorStats, ShutdownPolicy,
    SubscriptionHandle,
};
pub use supervisor::ConnectionSupervisor;
