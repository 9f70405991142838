//! Pipeline Integration Tests
//!
//! Drives the processor end to end over an in-memory transport: validation,
//! deduplication, fan-out, callback isolation and replay after reconnect.

#![allow(clippy::unwrap_used, clippy::expect_used)]

mod common;

use std::sync::Arc;

use market_fanout::domain::subscription::SubscriptionOptions;
use market_fanout::{
    BackpressurePolicy, ConnectionState, FeedEvent, MarketDataProcessor, MarketUpdate,
};

use common::{ChannelTransport, RecordingSink, collector, eventually, fast_config, sequences};

fn processor(transport: Arc<ChannelTransport>, sink: Arc<RecordingSink>) -> MarketDataProcessor {
    MarketDataProcessor::new(fast_config(), transport).with_sink(sink)
}

#[tokio::test]
async fn test_duplicates_and_stale_updates_are_dropped() {
    let transport = ChannelTransport::new();
    let feed = transport.session();
    let sink = RecordingSink::new();
    let processor = processor(Arc::clone(&transport), Arc::clone(&sink));

    let (first, first_cb) = collector();
    let (second, second_cb) = collector();
    processor
        .subscribe(BackpressurePolicy::DropOldest, first_cb)
        .unwrap();
    processor
        .subscribe(BackpressurePolicy::DropNewest, second_cb)
        .unwrap();
    processor.start().unwrap();

    feed.send_all("AAPL", &[1, 2, 2, 3, 5, 4]);

    assert!(eventually(|| first.lock().len() == 4 && second.lock().len() == 4).await);
    assert_eq!(sequences(&first), vec![1, 2, 3, 5]);
    assert_eq!(sequences(&second), vec![1, 2, 3, 5]);

    let stats = processor.stats().unwrap();
    assert_eq!(stats.ingest.received, 6);
    assert_eq!(stats.ingest.accepted, 4);
    assert_eq!(stats.ingest.duplicates, 2);
    assert_eq!(stats.connection_state, ConnectionState::Streaming);
    assert_eq!(sink.count("duplicate_dropped"), 2);

    processor.stop().await.unwrap();
}

#[tokio::test]
async fn test_invalid_records_are_rejected_without_stopping_stream() {
    let transport = ChannelTransport::new();
    let feed = transport.session();
    let sink = RecordingSink::new();
    let processor = processor(Arc::clone(&transport), Arc::clone(&sink));

    let (seen, callback) = collector();
    processor
        .subscribe(BackpressurePolicy::DropOldest, callback)
        .unwrap();
    processor.start().unwrap();

    feed.send("", 10.0, 1);
    feed.send("MSFT", -1.0, 1);
    feed.send("MSFT", f64::NAN, 1);
    feed.send("MSFT", 410.5, -3);
    feed.send("MSFT", 410.5, 1);

    assert!(eventually(|| seen.lock().len() == 1).await);
    assert_eq!(seen.lock()[0], ("MSFT".to_string(), 1));
    assert_eq!(processor.stats().unwrap().ingest.invalid, 4);

    let reasons: Vec<&'static str> = sink
        .events()
        .iter()
        .filter_map(|e| match e {
            FeedEvent::RecordRejected { error, .. } => Some(error.reason()),
            _ => None,
        })
        .collect();
    assert_eq!(
        reasons,
        vec![
            "empty_symbol",
            "negative_price",
            "non_finite_price",
            "negative_sequence"
        ]
    );

    processor.stop().await.unwrap();
}

#[tokio::test]
async fn test_replay_after_reconnect_is_delivered_once() {
    let transport = ChannelTransport::new();
    let first_session = transport.session();
    let second_session = transport.session();
    let sink = RecordingSink::new();
    let processor = processor(Arc::clone(&transport), Arc::clone(&sink));

    let (seen, callback) = collector();
    processor
        .subscribe(BackpressurePolicy::DropOldest, callback)
        .unwrap();
    processor.start().unwrap();

    first_session.send_all("SPY", &[1, 2, 3]);
    first_session.fail("connection reset");
    second_session.send_all("SPY", &[1, 2, 3, 4, 5]);

    assert!(eventually(|| seen.lock().len() == 5).await);
    assert_eq!(sequences(&seen), vec![1, 2, 3, 4, 5]);
    assert_eq!(transport.connects(), 2);
    assert!(eventually(|| processor.connection_state() == Ok(ConnectionState::Streaming)).await);

    let went_through_backoff = sink.events().iter().any(|e| {
        matches!(
            e,
            FeedEvent::ConnectionTransition(t)
                if matches!(t.to, ConnectionState::Backoff { attempt: 1, .. })
        )
    });
    assert!(went_through_backoff);

    processor.stop().await.unwrap();
}

#[tokio::test]
async fn test_failing_subscriber_does_not_affect_others() {
    let transport = ChannelTransport::new();
    let feed = transport.session();
    let sink = RecordingSink::new();
    let processor = processor(Arc::clone(&transport), Arc::clone(&sink));

    let failing = processor
        .subscribe(
            BackpressurePolicy::DropOldest,
            |update: &MarketUpdate| -> anyhow::Result<()> {
                if update.sequence() % 2 == 0 {
                    panic!("subscriber bug");
                }
                anyhow::bail!("downstream unavailable")
            },
        )
        .unwrap();
    let (seen, callback) = collector();
    processor
        .subscribe(BackpressurePolicy::DropOldest, callback)
        .unwrap();
    processor.start().unwrap();

    feed.send_all("QQQ", &[1, 2, 3, 4]);

    assert!(eventually(|| seen.lock().len() == 4).await);
    assert!(
        eventually(|| processor
            .subscription_stats(failing)
            .is_ok_and(|s| s.callback_failures == 4))
        .await
    );
    assert_eq!(sink.count("callback_failed"), 4);

    processor.stop().await.unwrap();
}

#[tokio::test]
async fn test_symbol_filter_limits_delivery() {
    let transport = ChannelTransport::new();
    let feed = transport.session();
    let processor = processor(Arc::clone(&transport), RecordingSink::new());

    let (filtered, filtered_cb) = collector();
    let (everything, everything_cb) = collector();
    processor
        .subscribe_with(
            SubscriptionOptions::new(BackpressurePolicy::DropOldest).with_symbols(["MSFT"]),
            filtered_cb,
        )
        .unwrap();
    processor
        .subscribe(BackpressurePolicy::DropOldest, everything_cb)
        .unwrap();
    processor.start().unwrap();

    feed.send("AAPL", 187.0, 1);
    feed.send("MSFT", 410.0, 1);
    feed.send("AAPL", 187.5, 2);

    assert!(eventually(|| everything.lock().len() == 3 && !filtered.lock().is_empty()).await);
    assert_eq!(*filtered.lock(), vec![("MSFT".to_string(), 1)]);
    assert_eq!(processor.stats().unwrap().ingest.accepted, 3);

    processor.stop().await.unwrap();
}

#[tokio::test]
async fn test_per_symbol_order_is_preserved_under_interleaving() {
    let transport = ChannelTransport::new();
    let feed = transport.session();
    let processor = processor(Arc::clone(&transport), RecordingSink::new());

    let (seen, callback) = collector();
    processor
        .subscribe(BackpressurePolicy::DropOldest, callback)
        .unwrap();
    processor.start().unwrap();

    for seq in 1..=50 {
        feed.send("AAA", 1.0, seq);
        feed.send("BBB", 2.0, seq);
    }

    assert!(eventually(|| seen.lock().len() == 100).await);
    for symbol in ["AAA", "BBB"] {
        let per_symbol: Vec<u64> = seen
            .lock()
            .iter()
            .filter(|(s, _)| s == symbol)
            .map(|(_, seq)| *seq)
            .collect();
        assert_eq!(per_symbol, (1..=50).collect::<Vec<u64>>());
    }

    processor.stop().await.unwrap();
}
