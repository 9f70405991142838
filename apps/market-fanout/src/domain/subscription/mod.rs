//! Subscription Management Types
//!
//! Domain types for tracking subscribers of the update stream.
//!
//! # Design
//!
//! Each [`Subscription`] owns a bounded [`DeliveryQueue`] and a
//! [`BackpressurePolicy`] describing what happens when that queue is full.
//! Policies are per subscription, so one consumer dropping the oldest
//! updates never changes how another consumer is served.
//!
//! The [`SubscriptionRegistry`] hands out monotonically increasing ids and
//! lets the dispatcher iterate a snapshot of current subscriptions under a
//! short read lock. Unsubscribing closes the queue before the entry is
//! removed, so a dispatch that already holds the snapshot cannot enqueue
//! into a removed subscription.

mod queue;

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};

pub use queue::{DeliveryQueue, PushError};

use super::streaming::MarketUpdate;

// =============================================================================
// Types
// =============================================================================

/// Unique identifier for a subscription.
pub type SubscriptionId = u64;

/// Default per-subscription queue capacity.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// What to do when a subscription's queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackpressurePolicy {
    /// Evict the oldest queued update, then enqueue the new one.
    DropOldest,
    /// Discard the incoming update for this subscriber.
    DropNewest,
    /// Wait up to `timeout` for room, then discard the incoming update.
    Block {
        /// Per-offer wait bound.
        timeout: Duration,
    },
}

impl BackpressurePolicy {
    /// Short, stable label for metrics and logs.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::DropOldest => "drop_oldest",
            Self::DropNewest => "drop_newest",
            Self::Block { .. } => "block",
        }
    }
}

impl fmt::Display for BackpressurePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Options for a new subscription.
#[derive(Debug, Clone)]
pub struct SubscriptionOptions {
    /// Backpressure policy.
    pub policy: BackpressurePolicy,
    /// Queue capacity.
    pub capacity: usize,
    /// Restrict delivery to these symbols (`None` = all symbols).
    pub symbols: Option<HashSet<String>>,
}

impl SubscriptionOptions {
    /// Options with the given policy and the default capacity.
    #[must_use]
    pub const fn new(policy: BackpressurePolicy) -> Self {
        Self {
            policy,
            capacity: DEFAULT_QUEUE_CAPACITY,
            symbols: None,
        }
    }

    /// Set the queue capacity.
    #[must_use]
    pub const fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }

    /// Only deliver updates for the given symbols.
    #[must_use]
    pub fn with_symbols<I, S>(mut self, symbols: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.symbols = Some(symbols.into_iter().map(Into::into).collect());
        self
    }
}

/// Result of a non-blocking offer.
#[derive(Debug)]
pub enum OfferOutcome {
    /// The update was queued.
    Enqueued,
    /// The update was queued after evicting the oldest element.
    EvictedOldest(MarketUpdate),
    /// The queue was full and the update was discarded.
    DroppedNewest,
    /// `Block` policy with a full queue; the caller must wait.
    WouldBlock(MarketUpdate),
    /// The subscription does not take this symbol.
    Filtered,
    /// The subscription is closed.
    Closed,
}

// =============================================================================
// Subscription
// =============================================================================

#[derive(Debug, Default)]
struct SubscriptionCounters {
    enqueued: AtomicU64,
    delivered: AtomicU64,
    dropped_oldest: AtomicU64,
    dropped_newest: AtomicU64,
    backpressure_drops: AtomicU64,
    callback_failures: AtomicU64,
}

/// A single subscriber's queue, policy and delivery bookkeeping.
#[derive(Debug)]
pub struct Subscription {
    id: SubscriptionId,
    policy: BackpressurePolicy,
    symbols: Option<HashSet<String>>,
    queue: DeliveryQueue,
    counters: SubscriptionCounters,
    last_delivered: Mutex<HashMap<Arc<str>, u64>>,
}

impl Subscription {
    fn new(id: SubscriptionId, options: SubscriptionOptions) -> Self {
        Self {
            id,
            policy: options.policy,
            symbols: options.symbols,
            queue: DeliveryQueue::new(options.capacity),
            counters: SubscriptionCounters::default(),
            last_delivered: Mutex::new(HashMap::new()),
        }
    }

    /// Subscription id.
    #[must_use]
    pub const fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Backpressure policy.
    #[must_use]
    pub const fn policy(&self) -> BackpressurePolicy {
        self.policy
    }

    /// Whether this subscription takes updates for `symbol`.
    #[must_use]
    pub fn wants(&self, symbol: &str) -> bool {
        self.symbols.as_ref().is_none_or(|s| s.contains(symbol))
    }

    /// Whether the subscription still accepts updates.
    #[must_use]
    pub fn is_active(&self) -> bool {
        !self.queue.is_closed()
    }

    /// Offer an update without waiting, applying the policy.
    pub fn offer(&self, update: MarketUpdate) -> OfferOutcome {
        if !self.wants(update.symbol()) {
            return OfferOutcome::Filtered;
        }

        match self.policy {
            BackpressurePolicy::DropOldest => match self.queue.push_evicting(update) {
                Ok(None) => {
                    self.counters.enqueued.fetch_add(1, Ordering::Relaxed);
                    OfferOutcome::Enqueued
                }
                Ok(Some(evicted)) => {
                    self.counters.enqueued.fetch_add(1, Ordering::Relaxed);
                    self.counters.dropped_oldest.fetch_add(1, Ordering::Relaxed);
                    OfferOutcome::EvictedOldest(evicted)
                }
                Err(_) => OfferOutcome::Closed,
            },
            BackpressurePolicy::DropNewest => match self.queue.try_push(update) {
                Ok(()) => {
                    self.counters.enqueued.fetch_add(1, Ordering::Relaxed);
                    OfferOutcome::Enqueued
                }
                Err(PushError::Full(_)) => {
                    self.counters.dropped_newest.fetch_add(1, Ordering::Relaxed);
                    OfferOutcome::DroppedNewest
                }
                Err(PushError::Closed(_)) => OfferOutcome::Closed,
            },
            BackpressurePolicy::Block { .. } => match self.queue.try_push(update) {
                Ok(()) => {
                    self.counters.enqueued.fetch_add(1, Ordering::Relaxed);
                    OfferOutcome::Enqueued
                }
                Err(PushError::Full(update)) => OfferOutcome::WouldBlock(update),
                Err(PushError::Closed(_)) => OfferOutcome::Closed,
            },
        }
    }

    /// Wait up to `timeout` for room and enqueue.
    ///
    /// # Errors
    ///
    /// Returns the [`PushError`] if the wait timed out (counted as a
    /// backpressure drop) or the subscription closed meanwhile.
    pub async fn offer_blocking(
        &self,
        update: MarketUpdate,
        timeout: Duration,
    ) -> Result<(), PushError> {
        match self.queue.push_timeout(update, timeout).await {
            Ok(()) => {
                self.counters.enqueued.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(err @ PushError::Full(_)) => {
                self.counters
                    .backpressure_drops
                    .fetch_add(1, Ordering::Relaxed);
                Err(err)
            }
            Err(err) => Err(err),
        }
    }

    /// Next queued update, waiting if necessary. `None` once closed and empty.
    pub async fn next_update(&self) -> Option<MarketUpdate> {
        self.queue.pop().await
    }

    /// Next queued update without waiting.
    pub fn try_next_update(&self) -> Option<MarketUpdate> {
        self.queue.try_pop()
    }

    /// Record a successful delivery to the callback.
    pub fn record_delivered(&self, update: &MarketUpdate) {
        self.counters.delivered.fetch_add(1, Ordering::Relaxed);
        self.last_delivered
            .lock()
            .insert(Arc::clone(update.symbol_arc()), update.sequence());
    }

    /// Record a callback error or panic.
    pub fn record_callback_failure(&self) {
        self.counters
            .callback_failures
            .fetch_add(1, Ordering::Relaxed);
    }

    /// Last sequence handed to the callback for `symbol`.
    #[must_use]
    pub fn last_delivered(&self, symbol: &str) -> Option<u64> {
        self.last_delivered.lock().get(symbol).copied()
    }

    /// Stop accepting updates. Already queued updates can still be drained.
    pub fn close(&self) {
        self.queue.close();
    }

    /// Discard queued updates, returning how many were dropped.
    pub fn discard_queued(&self) -> usize {
        self.queue.clear()
    }

    /// Number of queued updates.
    #[must_use]
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Queue capacity.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.queue.capacity()
    }

    /// Copy of the queued updates, oldest first.
    #[must_use]
    pub fn queued_updates(&self) -> Vec<MarketUpdate> {
        self.queue.snapshot()
    }

    /// Counter snapshot.
    #[must_use]
    pub fn stats(&self) -> SubscriptionStats {
        SubscriptionStats {
            id: self.id,
            policy: self.policy,
            capacity: self.queue.capacity(),
            queued: self.queue.len(),
            enqueued: self.counters.enqueued.load(Ordering::Relaxed),
            delivered: self.counters.delivered.load(Ordering::Relaxed),
            dropped_oldest: self.counters.dropped_oldest.load(Ordering::Relaxed),
            dropped_newest: self.counters.dropped_newest.load(Ordering::Relaxed),
            backpressure_drops: self.counters.backpressure_drops.load(Ordering::Relaxed),
            callback_failures: self.counters.callback_failures.load(Ordering::Relaxed),
            last_delivered: self
                .last_delivered
                .lock()
                .iter()
                .map(|(symbol, seq)| (symbol.to_string(), *seq))
                .collect(),
        }
    }
}

// =============================================================================
// Subscription Registry
// =============================================================================

/// Holds the set of active subscriptions.
///
/// # Example
///
/// ```rust
/// use market_fanout::domain::subscription::{
///     BackpressurePolicy, SubscriptionOptions, SubscriptionRegistry,
/// };
///
/// let registry = SubscriptionRegistry::new();
/// let sub = registry.subscribe(SubscriptionOptions::new(BackpressurePolicy::DropOldest));
/// assert_eq!(registry.len(), 1);
///
/// let removed = registry.unsubscribe(sub.id()).unwrap();
/// assert!(!removed.is_active());
/// assert!(registry.is_empty());
/// ```
#[derive(Debug, Default)]
pub struct SubscriptionRegistry {
    subscriptions: RwLock<HashMap<SubscriptionId, Arc<Subscription>>>,
    next_id: AtomicU64,
}

impl SubscriptionRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new subscription.
    pub fn subscribe(&self, options: SubscriptionOptions) -> Arc<Subscription> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let subscription = Arc::new(Subscription::new(id, options));
        self.subscriptions
            .write()
            .insert(id, Arc::clone(&subscription));
        subscription
    }

    /// Remove a subscription and close its queue.
    ///
    /// Removal and close happen under one write lock, so exactly one caller
    /// gets the subscription back and nobody can look it up half-removed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> Option<Arc<Subscription>> {
        let mut subscriptions = self.subscriptions.write();
        let subscription = subscriptions.remove(&id)?;
        subscription.close();
        Some(subscription)
    }

    /// Look up a subscription.
    #[must_use]
    pub fn get(&self, id: SubscriptionId) -> Option<Arc<Subscription>> {
        self.subscriptions.read().get(&id).cloned()
    }

    /// Snapshot of the current subscriptions.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Arc<Subscription>> {
        self.subscriptions.read().values().cloned().collect()
    }

    /// Visit every active subscription.
    ///
    /// Iterates a snapshot; subscriptions added meanwhile are not visited,
    /// subscriptions removed meanwhile are skipped.
    pub fn for_each<F>(&self, mut f: F)
    where
        F: FnMut(&Arc<Subscription>),
    {
        for subscription in self.snapshot() {
            if subscription.is_active() {
                f(&subscription);
            }
        }
    }

    /// Close and remove every subscription.
    pub fn close_all(&self) -> Vec<Arc<Subscription>> {
        let drained: Vec<_> = self.subscriptions.write().drain().map(|(_, s)| s).collect();
        for subscription in &drained {
            subscription.close();
        }
        drained
    }

    /// Number of subscriptions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.subscriptions.read().len()
    }

    /// Whether there are no subscriptions.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.subscriptions.read().is_empty()
    }

    /// Aggregate statistics.
    #[must_use]
    pub fn stats(&self) -> RegistryStats {
        let subscriptions = self.subscriptions.read();
        RegistryStats {
            subscription_count: subscriptions.len(),
            queued_total: subscriptions.values().map(|s| s.queued()).sum(),
        }
    }
}

// =============================================================================
// Statistics
// =============================================================================

/// Counters for one subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionStats {
    /// Subscription id.
    pub id: SubscriptionId,
    /// Backpressure policy.
    pub policy: BackpressurePolicy,
    /// Queue capacity.
    pub capacity: usize,
    /// Currently queued.
    pub queued: usize,
    /// Total updates accepted into the queue.
    pub enqueued: u64,
    /// Total updates handed to the callback successfully.
    pub delivered: u64,
    /// Updates evicted under `DropOldest`.
    pub dropped_oldest: u64,
    /// Updates discarded under `DropNewest`.
    pub dropped_newest: u64,
    /// Updates discarded after a `Block` timeout.
    pub backpressure_drops: u64,
    /// Callback errors and panics.
    pub callback_failures: u64,
    /// Last delivered sequence per symbol.
    pub last_delivered: HashMap<String, u64>,
}

/// Registry-wide statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistryStats {
    /// Number of subscriptions.
    pub subscription_count: usize,
    /// Total queued updates across subscriptions.
    pub queued_total: usize,
}

// =============================================================================
// Tests
// =============================================================================
