//! Subscription Delivery Worker
//!
//! One worker task per subscription drains its queue and invokes the
//! subscriber callback, so a slow callback only ever delays its own queue.
//!
//! Callback errors and panics are caught, counted on the subscription and
//! reported to the observability sink; the loop then moves on to the next
//! queued update.

use std::any::Any;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::application::ports::{FeedEvent, ObservabilitySink, Subscriber};
use crate::domain::streaming::MarketUpdate;
use crate::domain::subscription::Subscription;

/// Outcome of handing one update to the callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// The callback returned `Ok`.
    Delivered,
    /// The subscriber's `accepts` check declined the update.
    Skipped,
    /// The callback returned an error or panicked.
    Failed(String),
}

/// Drains one subscription's queue into its subscriber.
pub struct DeliveryWorker {
    subscription: Arc<Subscription>,
    subscriber: Arc<dyn Subscriber>,
    sink: Arc<dyn ObservabilitySink>,
    cancel: CancellationToken,
}

impl DeliveryWorker {
    /// Create a worker.
    #[must_use]
    pub fn new(
        subscription: Arc<Subscription>,
        subscriber: Arc<dyn Subscriber>,
        sink: Arc<dyn ObservabilitySink>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            subscription,
            subscriber,
            sink,
            cancel,
        }
    }

    /// Run until the queue is closed and drained, or the token is cancelled.
    ///
    /// Cancellation takes effect between callbacks; an update already
    /// handed to the callback is delivered to completion.
    pub async fn run(self) {
        let id = self.subscription.id();
        debug!(subscription = id, "Delivery worker started");

        loop {
            let next = tokio::select! {
                biased;
                () = self.cancel.cancelled() => None,
                next = self.subscription.next_update() => next,
            };

            let Some(update) = next else {
                break;
            };

            self.deliver(&update);
        }

        debug!(subscription = id, "Delivery worker stopped");
    }

    /// Hand one update to the callback, isolating failures.
    pub fn deliver(&self, update: &MarketUpdate) -> DeliveryOutcome {
        let subscriber = &self.subscriber;
        let result = catch_unwind(AssertUnwindSafe(|| {
            if subscriber.accepts(update) {
                subscriber.on_update(update).map(|()| true)
            } else {
                Ok(false)
            }
        }));

        let error = match result {
            Ok(Ok(true)) => {
                self.subscription.record_delivered(update);
                return DeliveryOutcome::Delivered;
            }
            Ok(Ok(false)) => return DeliveryOutcome::Skipped,
            Ok(Err(err)) => format!("{err:#}"),
            Err(panic) => format!("callback panicked: {}", panic_message(panic.as_ref())),
        };

        self.subscription.record_callback_failure();
        warn!(
            subscription = self.subscription.id(),
            symbol = update.symbol(),
            sequence = update.sequence(),
            error = %error,
            "Subscriber callback failed"
        );
        self.sink.record(&FeedEvent::CallbackFailed {
            subscription: self.subscription.id(),
            symbol: Arc::clone(update.symbol_arc()),
            sequence: update.sequence(),
            error: error.clone(),
        });
        DeliveryOutcome::Failed(error)
    }
}

impl std::fmt::Debug for DeliveryWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeliveryWorker")
            .field("subscription", &self.subscription.id())
            .field("cancelled", &self.cancel.is_cancelled())
            .finish_non_exhaustive()
    }
}

pub(super) fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.as_str()
    } else {
        "unknown panic payload"
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU64, Ordering};

    use parking_lot::Mutex;
    use rust_decimal::Decimal;

    use super::*;
    use crate::application::ports::{MockObservabilitySink, NoopSink};
    use crate::domain::subscription::{
        BackpressurePolicy, SubscriptionOptions, SubscriptionRegistry,
    };

    fn update(seq: u64) -> MarketUpdate {
        MarketUpdate::new("X", Decimal::ONE, seq, 0, 0)
    }

    fn subscription() -> (Arc<SubscriptionRegistry>, Arc<Subscription>) {
        let registry = Arc::new(SubscriptionRegistry::new());
        let sub = registry.subscribe(SubscriptionOptions::new(BackpressurePolicy::DropOldest));
        (registry, sub)
    }

    fn recorder() -> (Arc<Mutex<Vec<u64>>>, Arc<dyn Subscriber>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let subscriber = move |update: &MarketUpdate| -> anyhow::Result<()> {
            sink.lock().push(update.sequence());
            Ok(())
        };
        (seen, Arc::new(subscriber))
    }

    #[tokio::test]
    async fn drains_queue_in_order_until_closed() {
        let (_registry, sub) = subscription();
        let (seen, subscriber) = recorder();
        for seq in 1..=3 {
            sub.offer(update(seq));
        }
        sub.close();

        DeliveryWorker::new(
            Arc::clone(&sub),
            subscriber,
            Arc::new(NoopSink),
            CancellationToken::new(),
        )
        .run()
        .await;

        assert_eq!(*seen.lock(), vec![1, 2, 3]);
        assert_eq!(sub.stats().delivered, 3);
        assert_eq!(sub.last_delivered("X"), Some(3));
    }

    #[tokio::test(flavor = "current_thread")]
    async fn blocking_work_handed_off_keeps_worker_free() {
        let (_registry, sub) = subscription();
        let (tx, rx) = std::sync::mpsc::channel::<u64>();
        let tx = Mutex::new(tx);
        let subscriber = move |update: &MarketUpdate| -> anyhow::Result<()> {
            tx.lock().send(update.sequence())?;
            Ok(())
        };
        let consumer = tokio::task::spawn_blocking(move || {
            let mut seen = Vec::new();
            while let Ok(seq) = rx.recv() {
                std::thread::sleep(std::time::Duration::from_millis(5));
                seen.push(seq);
            }
            seen
        });

        for seq in 1..=4 {
            sub.offer(update(seq));
        }
        sub.close();
        DeliveryWorker::new(
            Arc::clone(&sub),
            Arc::new(subscriber),
            Arc::new(NoopSink),
            CancellationToken::new(),
        )
        .run()
        .await;

        // The worker finished without waiting for the slow consumer.
        assert_eq!(sub.stats().delivered, 4);
        assert_eq!(consumer.await.unwrap(), vec![1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn failing_callback_does_not_stop_loop() {
        let (_registry, sub) = subscription();
        let calls = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&calls);
        let subscriber = move |update: &MarketUpdate| -> anyhow::Result<()> {
            counter.fetch_add(1, Ordering::Relaxed);
            match update.sequence() {
                1 => anyhow::bail!("rejected"),
                2 => panic!("callback exploded"),
                _ => Ok(()),
            }
        };
        let mut sink = MockObservabilitySink::new();
        sink.expect_record()
            .withf(|event| matches!(event, FeedEvent::CallbackFailed { .. }))
            .times(2)
            .return_const(());

        for seq in 1..=3 {
            sub.offer(update(seq));
        }
        sub.close();
        DeliveryWorker::new(
            Arc::clone(&sub),
            Arc::new(subscriber),
            Arc::new(sink),
            CancellationToken::new(),
        )
        .run()
        .await;

        let stats = sub.stats();
        assert_eq!(calls.load(Ordering::Relaxed), 3);
        assert_eq!(stats.callback_failures, 2);
        assert_eq!(stats.delivered, 1);
    }

    #[test]
    fn panic_message_is_captured() {
        let (_registry, sub) = subscription();
        let subscriber = |_: &MarketUpdate| -> anyhow::Result<()> { panic!("bad tick") };
        let worker = DeliveryWorker::new(
            sub,
            Arc::new(subscriber),
            Arc::new(NoopSink),
            CancellationToken::new(),
        );

        let outcome = worker.deliver(&update(1));

        assert_eq!(
            outcome,
            DeliveryOutcome::Failed("callback panicked: bad tick".to_string())
        );
    }

    #[tokio::test]
    async fn cancellation_stops_waiting_worker() {
        let (_registry, sub) = subscription();
        let (_seen, subscriber) = recorder();
        let cancel = CancellationToken::new();
        let worker = DeliveryWorker::new(sub, subscriber, Arc::new(NoopSink), cancel.clone());

        let handle = tokio::spawn(worker.run());
        cancel.cancel();

        tokio::time::timeout(std::time::Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }

    #[test]
    fn declined_updates_are_skipped() {
        struct OddOnly;
        impl Subscriber for OddOnly {
            fn accepts(&self, update: &MarketUpdate) -> bool {
                update.sequence() % 2 == 1
            }
            fn on_update(&self, _update: &MarketUpdate) -> anyhow::Result<()> {
                Ok(())
            }
        }

        let (_registry, sub) = subscription();
        let worker = DeliveryWorker::new(
            Arc::clone(&sub),
            Arc::new(OddOnly),
            Arc::new(NoopSink),
            CancellationToken::new(),
        );

        assert_eq!(worker.deliver(&update(2)), DeliveryOutcome::Skipped);
        assert_eq!(worker.deliver(&update(3)), DeliveryOutcome::Delivered);
        assert_eq!(sub.stats().delivered, 1);
    }
}
