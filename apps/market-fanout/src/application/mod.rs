//! Application Layer - Use cases and port definitions.
//!
//! This layer contains the pipeline services and the port interfaces
//! that define how the core interacts with transports, clocks,
//! observability backends and subscribers.

/// Port interfaces for external collaborators.
pub mod ports;

/// Pipeline services (ingest, dispatch, delivery, supervision).
pub mod services;
