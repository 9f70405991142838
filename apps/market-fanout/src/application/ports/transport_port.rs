//! Transport Port (Driven Port)
//!
//! Interface for the upstream feed. A [`Transport`] produces connections;
//! a [`Connection`] yields raw records until it fails or ends.

use async_trait::async_trait;

use crate::domain::error::TransportError;
use crate::domain::streaming::RawRecord;

/// Factory for upstream connections.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open a new connection.
    async fn connect(&self) -> Result<Box<dyn Connection>, TransportError>;
}

/// An established upstream connection.
#[async_trait]
pub trait Connection: Send {
    /// Pull the next record.
    ///
    /// Returns `Ok(None)` when the upstream ends the stream cleanly.
    async fn next_record(&mut self) -> Result<Option<RawRecord>, TransportError>;

    /// Close the connection. Errors while closing are not reported.
    async fn close(&mut self) {}
}
