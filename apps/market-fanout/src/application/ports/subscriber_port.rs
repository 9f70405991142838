//! Subscriber Port (Driver Port)
//!
//! The capability a consumer registers with the processor. Closures of the
//! shape `Fn(&MarketUpdate) -> anyhow::Result<()>` implement it directly.

use crate::domain::streaming::MarketUpdate;

/// Consumer of delivered updates.
///
/// Invoked on the subscription's own drain task, one update at a time.
/// Returning an error (or panicking) is counted and reported; the drain
/// loop then continues with the next queued update.
///
/// The callback runs synchronously on a Tokio worker thread. It must not
/// block: a callback that sleeps or waits on I/O occupies that worker for
/// the duration, and on a current-thread runtime it stalls ingestion and
/// every other subscriber. Hand blocking work off, for example through a
/// channel to a `spawn_blocking` task.
pub trait Subscriber: Send + Sync + 'static {
    /// Whether this subscriber wants `update`. Rejected updates are skipped
    /// without invoking [`on_update`](Self::on_update).
    fn accepts(&self, _update: &MarketUpdate) -> bool {
        true
    }

    /// Handle one update.
    ///
    /// # Errors
    ///
    /// Any error is isolated to this subscriber.
    fn on_update(&self, update: &MarketUpdate) -> anyhow::Result<()>;
}

impl<F> Subscriber for F
where
    F: Fn(&MarketUpdate) -> anyhow::Result<()> + Send + Sync + 'static,
{
    fn on_update(&self, update: &MarketUpdate) -> anyhow::Result<()> {
        self(update)
    }
}
