//! Port Interfaces
//!
//! Interfaces (ports) for the collaborators of the pipeline, following the
//! Hexagonal Architecture pattern. Infrastructure adapters implement the
//! driven ports; embedding code implements [`Subscriber`].
//!
//! ## Driven Ports (Outbound)
//!
//! - [`Transport`] / [`Connection`]: the upstream record source
//! - [`Clock`]: monotonic time for arrival stamps and backoff deadlines
//! - [`ObservabilitySink`]: structured pipeline events
//!
//! ## Driver Ports (Inbound)
//!
//! - [`Subscriber`]: receives delivered updates

mod clock_port;
mod observability_port;
mod subscriber_port;
mod transport_port;

pub use clock_port::{Clock, SystemClock};
#[cfg(test)]
pub use clock_port::MockClock;
#[cfg(test)]
pub use observability_port::MockObservabilitySink;
pub use observability_port::{FeedEvent, NoopSink, ObservabilitySink};
pub use subscriber_port::Subscriber;
pub use transport_port::{Connection, Transport};
