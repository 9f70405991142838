//! Shared fixtures for integration tests.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use market_fanout::{
    BackoffConfig, Connection, FeedEvent, MarketUpdate, ObservabilitySink, ProcessorConfig,
    RawRecord, Transport, TransportError,
};

/// One item pushed down an in-memory session.
pub type Frame = Result<RawRecord, TransportError>;

/// Transport whose sessions are fed by the test through channels.
///
/// Each `connect` consumes the next prepared session; when none is left
/// the connect is refused.
#[derive(Default)]
pub struct ChannelTransport {
    sessions: Mutex<VecDeque<mpsc::UnboundedReceiver<Frame>>>,
    connects: AtomicUsize,
}

impl ChannelTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Prepare the next session and return its feed handle.
    pub fn session(&self) -> Feed {
        let (tx, rx) = mpsc::unbounded_channel();
        self.sessions.lock().push_back(rx);
        Feed(tx)
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for ChannelTransport {
    async fn connect(&self) -> Result<Box<dyn Connection>, TransportError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        let rx = self
            .sessions
            .lock()
            .pop_front()
            .ok_or_else(|| TransportError::ConnectFailed("connection refused".to_string()))?;
        Ok(Box::new(ChannelConnection(rx)))
    }
}

struct ChannelConnection(mpsc::UnboundedReceiver<Frame>);

#[async_trait]
impl Connection for ChannelConnection {
    async fn next_record(&mut self) -> Result<Option<RawRecord>, TransportError> {
        match self.0.recv().await {
            Some(Ok(record)) => Ok(Some(record)),
            Some(Err(e)) => Err(e),
            None => Ok(None),
        }
    }
}

/// Sender side of an in-memory session. Dropping it ends the stream.
pub struct Feed(mpsc::UnboundedSender<Frame>);

impl Feed {
    pub fn send(&self, symbol: &str, price: f64, sequence: i64) {
        let _ = self.0.send(Ok(RawRecord::new(symbol, price, sequence, 0)));
    }

    pub fn send_all(&self, symbol: &str, sequences: &[i64]) {
        for &sequence in sequences {
            self.send(symbol, 100.0, sequence);
        }
    }

    pub fn fail(&self, reason: &str) {
        let _ = self
            .0
            .send(Err(TransportError::StreamFailed(reason.to_string())));
    }
}

/// Sink that keeps every event.
#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<FeedEvent>>,
}

impl RecordingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<FeedEvent> {
        self.events.lock().clone()
    }

    pub fn count(&self, kind: &str) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|e| e.kind() == kind)
            .count()
    }
}

impl ObservabilitySink for RecordingSink {
    fn record(&self, event: &FeedEvent) {
        self.events.lock().push(event.clone());
    }
}

/// Shared list of `(symbol, sequence)` pairs seen by a subscriber.
pub type Seen = Arc<Mutex<Vec<(String, u64)>>>;

/// Subscriber callback that records what it receives.
pub fn collector() -> (
    Seen,
    impl Fn(&MarketUpdate) -> anyhow::Result<()> + Send + Sync + 'static,
) {
    let seen: Seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let callback = move |update: &MarketUpdate| -> anyhow::Result<()> {
        sink.lock()
            .push((update.symbol().to_string(), update.sequence()));
        Ok(())
    };
    (seen, callback)
}

pub fn sequences(seen: &Seen) -> Vec<u64> {
    seen.lock().iter().map(|(_, seq)| *seq).collect()
}

/// Processor settings with fast, deterministic reconnects.
pub fn fast_config() -> ProcessorConfig {
    ProcessorConfig {
        backoff: BackoffConfig {
            base_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(20),
            multiplier: 2.0,
            exponent_cap: 2,
            jitter_factor: 0.0,
            max_attempts: 0,
        },
        heartbeat_timeout: Duration::ZERO,
        ..ProcessorConfig::default()
    }
}

/// Poll `condition` until it holds or two seconds pass.
pub async fn eventually<F: Fn() -> bool>(condition: F) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    condition()
}
