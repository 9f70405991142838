//! Fan-out Dispatcher
//!
//! Offers each accepted update to every active subscription.
//!
//! Dispatch runs in two phases. The first phase offers the update to every
//! subscription without waiting, so `DropOldest`/`DropNewest` subscribers
//! (and `Block` subscribers with room) are served before anything can
//! stall. The second phase waits, concurrently and each under its own
//! timeout, only for `Block` subscribers whose queues were full.

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use tracing::{debug, warn};

use crate::application::ports::{FeedEvent, ObservabilitySink};
use crate::domain::error::CapacityError;
use crate::domain::streaming::MarketUpdate;
use crate::domain::subscription::{
    BackpressurePolicy, OfferOutcome, PushError, Subscription, SubscriptionRegistry,
};

/// Per-update dispatch summary.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    /// Subscriptions the update was enqueued to (including after a wait).
    pub enqueued: usize,
    /// Older updates evicted under `DropOldest`.
    pub evicted: usize,
    /// Subscriptions that discarded the update under `DropNewest`.
    pub dropped_newest: usize,
    /// `Block` subscriptions that waited for room.
    pub blocked: usize,
    /// `Block` subscriptions that timed out and dropped the update.
    pub backpressure_drops: usize,
    /// Subscriptions whose symbol filter skipped the update.
    pub filtered: usize,
}

/// Distributes updates to the subscription registry.
#[derive(Clone)]
pub struct FanoutDispatcher {
    registry: Arc<SubscriptionRegistry>,
    sink: Arc<dyn ObservabilitySink>,
}

impl FanoutDispatcher {
    /// Create a dispatcher over `registry`.
    #[must_use]
    pub fn new(registry: Arc<SubscriptionRegistry>, sink: Arc<dyn ObservabilitySink>) -> Self {
        Self { registry, sink }
    }

    /// The registry this dispatcher serves.
    #[must_use]
    pub const fn registry(&self) -> &Arc<SubscriptionRegistry> {
        &self.registry
    }

    /// Offer `update` to every active subscription.
    pub async fn dispatch(&self, update: &MarketUpdate) -> DispatchReport {
        let mut report = DispatchReport::default();
        let mut waiting: Vec<(Arc<Subscription>, MarketUpdate, Duration)> = Vec::new();

        self.registry.for_each(|subscription| {
            match subscription.offer(update.clone()) {
                OfferOutcome::Enqueued => report.enqueued += 1,
                OfferOutcome::EvictedOldest(evicted) => {
                    report.enqueued += 1;
                    report.evicted += 1;
                    self.overflow(subscription, &evicted);
                }
                OfferOutcome::DroppedNewest => {
                    report.dropped_newest += 1;
                    self.overflow(subscription, update);
                }
                OfferOutcome::WouldBlock(pending) => {
                    if let BackpressurePolicy::Block { timeout } = subscription.policy() {
                        waiting.push((Arc::clone(subscription), pending, timeout));
                    }
                }
                OfferOutcome::Filtered => report.filtered += 1,
                OfferOutcome::Closed => {}
            }
        });

        if waiting.is_empty() {
            return report;
        }

        report.blocked = waiting.len();
        let waits = waiting
            .into_iter()
            .map(|(subscription, pending, timeout)| async move {
                let result = subscription.offer_blocking(pending, timeout).await;
                (subscription, timeout, result)
            });

        for (subscription, timeout, result) in join_all(waits).await {
            match result {
                Ok(()) => report.enqueued += 1,
                Err(PushError::Full(dropped)) => {
                    report.backpressure_drops += 1;
                    let error = CapacityError {
                        subscription: subscription.id(),
                        timeout,
                        symbol: dropped.symbol().to_string(),
                        sequence: dropped.sequence(),
                    };
                    warn!(
                        subscription = subscription.id(),
                        symbol = dropped.symbol(),
                        sequence = dropped.sequence(),
                        timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                        "Subscriber queue stayed full, update dropped"
                    );
                    self.sink.record(&FeedEvent::Backpressure(error));
                }
                Err(PushError::Closed(_)) => {
                    debug!(
                        subscription = subscription.id(),
                        "Subscription closed while waiting for room"
                    );
                }
            }
        }

        report
    }

    fn overflow(&self, subscription: &Subscription, dropped: &MarketUpdate) {
        debug!(
            subscription = subscription.id(),
            policy = subscription.policy().as_str(),
            symbol = dropped.symbol(),
            sequence = dropped.sequence(),
            "Subscriber queue overflow"
        );
        self.sink.record(&FeedEvent::QueueOverflow {
            subscription: subscription.id(),
            policy: subscription.policy(),
            symbol: Arc::clone(dropped.symbol_arc()),
            sequence: dropped.sequence(),
        });
    }
}

impl std::fmt::Debug for FanoutDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FanoutDispatcher")
            .field("subscriptions", &self.registry.len())
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Tests
// =============================================================================
