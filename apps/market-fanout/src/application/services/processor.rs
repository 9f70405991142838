//! Market Data Processor
//!
//! The root component: composes the supervisor, ingestor, dispatcher and
//! subscription registry, and is the only type embedding code needs.
//!
//! # Lifecycle
//!
//! ```text
//! new() ──► Idle ──start()──► Running ──stop()──► Closed (terminal)
//!            │                                       ▲
//!            └──────────────────stop()───────────────┘
//! ```
//!
//! `start()` is idempotent while not closed. `stop()` cancels the transport
//! pull and any pending backoff timer, then finishes subscriptions
//! according to the configured [`ShutdownPolicy`]. After `stop()`, every
//! call (including a second `stop()`) returns [`ProcessorError::Closed`].
//! State receivers taken earlier still observe the final `Closed`.
//!
//! If the supervisor ends on its own, either because reconnection attempts
//! ran out or because its task panicked, the run has failed: `wait()`
//! resolves with the failure, and `start()` and `subscribe()` return it
//! until `stop()` closes the processor. Stats and unsubscribe keep working.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::delivery::{DeliveryWorker, panic_message};
use super::dispatcher::FanoutDispatcher;
use super::ingestor::{IngestCounters, IngestStats, Ingestor};
use super::supervisor::ConnectionSupervisor;
use crate::application::ports::{
    Clock, FeedEvent, NoopSink, ObservabilitySink, Subscriber, SystemClock, Transport,
};
use crate::domain::connection::{BackoffConfig, ConnectionState, ConnectionStateMachine, Transition};
use crate::domain::error::FatalConnectivityError;
use crate::domain::sequence::{DEFAULT_WINDOW_CAPACITY, SequenceTracker};
use crate::domain::subscription::{
    BackpressurePolicy, DEFAULT_QUEUE_CAPACITY, RegistryStats, SubscriptionId,
    SubscriptionOptions, SubscriptionRegistry, SubscriptionStats,
};

// =============================================================================
// Configuration
// =============================================================================

/// What `stop()` does with updates already queued for subscribers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ShutdownPolicy {
    /// Deliver queued updates, bounded by the drain grace period.
    #[default]
    Drain,
    /// Discard queued updates immediately.
    Halt,
}

impl ShutdownPolicy {
    /// Short, stable label for logs.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Drain => "drain",
            Self::Halt => "halt",
        }
    }
}

/// Processor settings.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessorConfig {
    /// Reconnection backoff.
    pub backoff: BackoffConfig,
    /// Silence while streaming that counts as a failure (zero disables).
    pub heartbeat_timeout: Duration,
    /// Per-symbol dedup window.
    pub dedup_window: usize,
    /// Queue capacity used by [`MarketDataProcessor::subscribe`].
    pub queue_capacity: usize,
    /// Shutdown behavior.
    pub shutdown_policy: ShutdownPolicy,
    /// Upper bound on draining subscriber queues during `stop()`.
    pub drain_grace: Duration,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            backoff: BackoffConfig::default(),
            heartbeat_timeout: Duration::from_secs(30),
            dedup_window: DEFAULT_WINDOW_CAPACITY,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            shutdown_policy: ShutdownPolicy::Drain,
            drain_grace: Duration::from_secs(5),
        }
    }
}

// =============================================================================
// Errors and Handles
// =============================================================================

/// Errors returned by the processor API.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProcessorError {
    /// The processor has been stopped.
    #[error("processor closed")]
    Closed,
    /// No subscription with this handle.
    #[error("unknown subscription {0}")]
    UnknownSubscription(SubscriptionId),
    /// Upstream connectivity was lost for good.
    #[error(transparent)]
    Fatal(#[from] FatalConnectivityError),
    /// Called outside a Tokio runtime.
    #[error("no Tokio runtime available")]
    NoRuntime,
    /// The supervisor task panicked.
    #[error("connection supervisor aborted: {0}")]
    Aborted(String),
}

/// Opaque handle returned by `subscribe`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle(SubscriptionId);

impl SubscriptionHandle {
    /// Underlying subscription id.
    #[must_use]
    pub const fn id(&self) -> SubscriptionId {
        self.0
    }
}

/// Processor-wide statistics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessorStats {
    /// Current connection state.
    pub connection_state: ConnectionState,
    /// Ingest counters.
    pub ingest: IngestStats,
    /// Registry counters.
    pub subscriptions: RegistryStats,
}

// =============================================================================
// Internal State
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Running,
    Closed,
}

#[derive(Debug, Clone)]
enum RunOutcome {
    Pending,
    Stopped,
    Fatal(FatalConnectivityError),
    Aborted(String),
}

impl RunOutcome {
    fn failure(&self) -> Option<ProcessorError> {
        match self {
            Self::Fatal(error) => Some(ProcessorError::Fatal(error.clone())),
            Self::Aborted(reason) => Some(ProcessorError::Aborted(reason.clone())),
            Self::Pending | Self::Stopped => None,
        }
    }
}

struct Worker {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

struct Lifecycle {
    phase: Phase,
    supervisor: Option<JoinHandle<()>>,
    workers: HashMap<SubscriptionId, Worker>,
}

// =============================================================================
// Processor
// =============================================================================

/// Real-time ingestion and fan-out engine.
pub struct MarketDataProcessor {
    config: ProcessorConfig,
    transport: Arc<dyn Transport>,
    clock: Arc<dyn Clock>,
    sink: Arc<dyn ObservabilitySink>,
    registry: Arc<SubscriptionRegistry>,
    ingest_counters: Arc<IngestCounters>,
    state_tx: watch::Sender<ConnectionState>,
    outcome_tx: watch::Sender<RunOutcome>,
    cancel: CancellationToken,
    lifecycle: Mutex<Lifecycle>,
}

impl MarketDataProcessor {
    /// Create a processor over `transport`. Nothing runs until [`start`](Self::start).
    #[must_use]
    pub fn new(config: ProcessorConfig, transport: Arc<dyn Transport>) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        let (outcome_tx, _) = watch::channel(RunOutcome::Pending);
        Self {
            config,
            transport,
            clock: Arc::new(SystemClock::new()),
            sink: Arc::new(NoopSink),
            registry: Arc::new(SubscriptionRegistry::new()),
            ingest_counters: Arc::new(IngestCounters::default()),
            state_tx,
            outcome_tx,
            cancel: CancellationToken::new(),
            lifecycle: Mutex::new(Lifecycle {
                phase: Phase::Idle,
                supervisor: None,
                workers: HashMap::new(),
            }),
        }
    }

    /// Use a custom clock.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Report pipeline events to `sink`.
    #[must_use]
    pub fn with_sink(mut self, sink: Arc<dyn ObservabilitySink>) -> Self {
        self.sink = sink;
        self
    }

    /// Processor settings.
    #[must_use]
    pub const fn config(&self) -> &ProcessorConfig {
        &self.config
    }

    /// Start the connection supervisor. No-op if already running.
    ///
    /// # Errors
    ///
    /// [`ProcessorError::Closed`] after `stop()`,
    /// [`ProcessorError::Fatal`] or [`ProcessorError::Aborted`] once the
    /// supervisor has failed, or [`ProcessorError::NoRuntime`] outside a
    /// Tokio runtime.
    pub fn start(&self) -> Result<(), ProcessorError> {
        let runtime = Handle::try_current().map_err(|_| ProcessorError::NoRuntime)?;
        let mut lifecycle = self.lifecycle.lock();
        match lifecycle.phase {
            Phase::Closed => return Err(ProcessorError::Closed),
            Phase::Running => return self.failure().map_or(Ok(()), Err),
            Phase::Idle => {}
        }

        let dispatcher = FanoutDispatcher::new(Arc::clone(&self.registry), Arc::clone(&self.sink));
        let ingestor = Ingestor::new(
            SequenceTracker::new(self.config.dedup_window),
            dispatcher,
            Arc::clone(&self.clock),
            Arc::clone(&self.sink),
        )
        .with_counters(Arc::clone(&self.ingest_counters));
        let supervisor = ConnectionSupervisor::new(
            ConnectionStateMachine::new(self.config.backoff.clone()),
            Arc::clone(&self.transport),
            ingestor,
            Arc::clone(&self.clock),
            Arc::clone(&self.sink),
            self.state_tx.clone(),
            self.config.heartbeat_timeout,
            self.cancel.clone(),
        );

        let run = runtime.spawn(supervisor.run());
        let outcome_tx = self.outcome_tx.clone();
        let state_tx = self.state_tx.clone();
        let sink = Arc::clone(&self.sink);
        lifecycle.supervisor = Some(runtime.spawn(async move {
            let outcome = match run.await {
                Ok(Ok(())) => return,
                Ok(Err(error)) => RunOutcome::Fatal(error),
                Err(e) if e.is_panic() => {
                    let reason = panic_message(e.into_panic().as_ref()).to_string();
                    error!(reason = %reason, "Connection supervisor panicked");
                    RunOutcome::Aborted(reason)
                }
                Err(e) => RunOutcome::Aborted(e.to_string()),
            };
            publish_closed(&state_tx, sink.as_ref());
            outcome_tx.send_replace(outcome);
        }));
        lifecycle.phase = Phase::Running;

        info!(
            heartbeat_ms = u64::try_from(self.config.heartbeat_timeout.as_millis()).unwrap_or(u64::MAX),
            dedup_window = self.config.dedup_window,
            max_attempts = self.config.backoff.max_attempts,
            "Market data processor started"
        );
        Ok(())
    }

    /// Stop the processor. Terminal.
    ///
    /// # Errors
    ///
    /// [`ProcessorError::Closed`] if already stopped.
    pub async fn stop(&self) -> Result<(), ProcessorError> {
        let (supervisor, workers) = {
            let mut lifecycle = self.lifecycle.lock();
            if lifecycle.phase == Phase::Closed {
                return Err(ProcessorError::Closed);
            }
            lifecycle.phase = Phase::Closed;
            (
                lifecycle.supervisor.take(),
                std::mem::take(&mut lifecycle.workers),
            )
        };

        let policy = self.config.shutdown_policy;
        info!(policy = policy.as_str(), subscriptions = workers.len(), "Stopping market data processor");

        self.cancel.cancel();
        if let Some(handle) = supervisor
            && let Err(e) = handle.await
        {
            warn!(error = %e, "Supervisor task ended abnormally");
        }
        publish_closed(&self.state_tx, self.sink.as_ref());

        match policy {
            ShutdownPolicy::Drain => self.drain(workers).await,
            ShutdownPolicy::Halt => self.halt(workers).await,
        }

        self.outcome_tx.send_if_modified(|outcome| {
            if matches!(outcome, RunOutcome::Pending) {
                *outcome = RunOutcome::Stopped;
                true
            } else {
                false
            }
        });

        info!("Market data processor stopped");
        Ok(())
    }

    /// Close every queue and let workers deliver what is already queued.
    async fn drain(&self, workers: HashMap<SubscriptionId, Worker>) {
        self.registry.close_all();

        let (stragglers, handles): (Vec<_>, Vec<_>) = workers
            .into_values()
            .map(|w| ((w.cancel, w.handle.abort_handle()), w.handle))
            .unzip();

        if tokio::time::timeout(self.config.drain_grace, join_all(handles))
            .await
            .is_err()
        {
            warn!(
                grace_ms = u64::try_from(self.config.drain_grace.as_millis()).unwrap_or(u64::MAX),
                "Drain grace period elapsed, aborting remaining deliveries"
            );
            for (cancel, abort) in stragglers {
                cancel.cancel();
                abort.abort();
            }
        }
    }

    /// Stop workers and discard queued updates.
    async fn halt(&self, workers: HashMap<SubscriptionId, Worker>) {
        let handles: Vec<_> = workers
            .into_values()
            .map(|w| {
                w.cancel.cancel();
                w.handle
            })
            .collect();

        let discarded: usize = self
            .registry
            .close_all()
            .iter()
            .map(|s| s.discard_queued())
            .sum();
        if discarded > 0 {
            info!(discarded, "Discarded queued updates on halt");
        }

        join_all(handles).await;
    }

    /// Subscribe with `policy` and the default queue capacity.
    ///
    /// # Errors
    ///
    /// See [`subscribe_with`](Self::subscribe_with).
    pub fn subscribe<S: Subscriber>(
        &self,
        policy: BackpressurePolicy,
        callback: S,
    ) -> Result<SubscriptionHandle, ProcessorError> {
        let options = SubscriptionOptions::new(policy).with_capacity(self.config.queue_capacity);
        self.subscribe_with(options, callback)
    }

    /// Subscribe with explicit options. The callback runs on its own task.
    ///
    /// # Errors
    ///
    /// [`ProcessorError::Closed`] after `stop()`, the supervisor's failure
    /// once it has failed, or [`ProcessorError::NoRuntime`] outside a Tokio
    /// runtime.
    pub fn subscribe_with<S: Subscriber>(
        &self,
        options: SubscriptionOptions,
        callback: S,
    ) -> Result<SubscriptionHandle, ProcessorError> {
        let runtime = Handle::try_current().map_err(|_| ProcessorError::NoRuntime)?;
        let mut lifecycle = self.lifecycle.lock();
        if lifecycle.phase == Phase::Closed {
            return Err(ProcessorError::Closed);
        }
        if let Some(failure) = self.failure() {
            return Err(failure);
        }

        let policy = options.policy;
        let subscription = self.registry.subscribe(options);
        let id = subscription.id();
        let cancel = CancellationToken::new();
        let worker = DeliveryWorker::new(
            subscription,
            Arc::new(callback),
            Arc::clone(&self.sink),
            cancel.clone(),
        );
        let handle = runtime.spawn(worker.run());
        lifecycle.workers.insert(id, Worker { cancel, handle });

        info!(subscription = id, policy = policy.as_str(), "Subscriber added");
        Ok(SubscriptionHandle(id))
    }

    /// Remove a subscription. Queued, undelivered updates are discarded.
    ///
    /// # Errors
    ///
    /// [`ProcessorError::Closed`] after `stop()`, or
    /// [`ProcessorError::UnknownSubscription`] for a stale handle.
    pub fn unsubscribe(&self, handle: SubscriptionHandle) -> Result<(), ProcessorError> {
        let worker = {
            let mut lifecycle = self.lifecycle.lock();
            if lifecycle.phase == Phase::Closed {
                return Err(ProcessorError::Closed);
            }
            let subscription = self
                .registry
                .unsubscribe(handle.id())
                .ok_or(ProcessorError::UnknownSubscription(handle.id()))?;
            subscription.discard_queued();
            lifecycle.workers.remove(&handle.id())
        };

        if let Some(worker) = worker {
            worker.cancel.cancel();
        }
        info!(subscription = handle.id(), "Subscriber removed");
        Ok(())
    }

    /// Wait until the processor stops or the supervisor fails.
    ///
    /// # Errors
    ///
    /// [`ProcessorError::Fatal`] when reconnection attempts are exhausted,
    /// [`ProcessorError::Aborted`] if the supervisor task panicked,
    /// [`ProcessorError::Closed`] if called after `stop()`.
    pub async fn wait(&self) -> Result<(), ProcessorError> {
        if self.lifecycle.lock().phase == Phase::Closed {
            return Err(ProcessorError::Closed);
        }

        let mut outcome_rx = self.outcome_tx.subscribe();
        let outcome = outcome_rx
            .wait_for(|o| !matches!(o, RunOutcome::Pending))
            .await
            .map_err(|_| ProcessorError::Closed)?
            .clone();

        outcome.failure().map_or(Ok(()), Err)
    }

    /// Current connection state.
    ///
    /// # Errors
    ///
    /// [`ProcessorError::Closed`] after `stop()`.
    pub fn connection_state(&self) -> Result<ConnectionState, ProcessorError> {
        self.ensure_open()?;
        Ok(*self.state_tx.borrow())
    }

    /// Receiver that observes every connection state change.
    ///
    /// A receiver obtained before `stop()` observes the final `Closed`.
    ///
    /// # Errors
    ///
    /// [`ProcessorError::Closed`] after `stop()`.
    pub fn state_changes(&self) -> Result<watch::Receiver<ConnectionState>, ProcessorError> {
        self.ensure_open()?;
        Ok(self.state_tx.subscribe())
    }

    /// Processor-wide statistics.
    ///
    /// # Errors
    ///
    /// [`ProcessorError::Closed`] after `stop()`.
    pub fn stats(&self) -> Result<ProcessorStats, ProcessorError> {
        self.ensure_open()?;
        Ok(ProcessorStats {
            connection_state: *self.state_tx.borrow(),
            ingest: self.ingest_counters.snapshot(),
            subscriptions: self.registry.stats(),
        })
    }

    /// Statistics for one subscription.
    ///
    /// # Errors
    ///
    /// [`ProcessorError::Closed`] after `stop()`, or
    /// [`ProcessorError::UnknownSubscription`] for a stale handle.
    pub fn subscription_stats(
        &self,
        handle: SubscriptionHandle,
    ) -> Result<SubscriptionStats, ProcessorError> {
        self.ensure_open()?;
        self.registry
            .get(handle.id())
            .map(|s| s.stats())
            .ok_or(ProcessorError::UnknownSubscription(handle.id()))
    }

    fn failure(&self) -> Option<ProcessorError> {
        self.outcome_tx.borrow().failure()
    }

    fn ensure_open(&self) -> Result<(), ProcessorError> {
        if self.lifecycle.lock().phase == Phase::Closed {
            return Err(ProcessorError::Closed);
        }
        Ok(())
    }
}

/// Move the published state to `Closed`, reporting the transition once.
fn publish_closed(state_tx: &watch::Sender<ConnectionState>, sink: &dyn ObservabilitySink) {
    let mut from = None;
    state_tx.send_if_modified(|state| {
        if state.is_closed() {
            return false;
        }
        from = Some(std::mem::replace(state, ConnectionState::Closed));
        true
    });
    if let Some(from) = from {
        sink.record(&FeedEvent::ConnectionTransition(Transition {
            from,
            to: ConnectionState::Closed,
        }));
    }
}

impl Drop for MarketDataProcessor {
    fn drop(&mut self) {
        self.cancel.cancel();
        for worker in self.lifecycle.get_mut().workers.values() {
            worker.cancel.cancel();
        }
    }
}

impl fmt::Debug for MarketDataProcessor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MarketDataProcessor")
            .field("config", &self.config)
            .field("state", &*self.state_tx.borrow())
            .field("subscriptions", &self.registry.len())
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use async_trait::async_trait;
    use rust_decimal::Decimal;

    use super::*;
    use crate::application::ports::Connection;
    use crate::domain::error::TransportError;
    use crate::domain::streaming::{MarketUpdate, RawRecord};

    /// Serves a fixed list of records, then stays silent.
    struct FixedTransport {
        records: Mutex<Option<Vec<RawRecord>>>,
    }

    struct FixedConnection {
        records: VecDeque<RawRecord>,
    }

    #[async_trait]
    impl Connection for FixedConnection {
        async fn next_record(&mut self) -> Result<Option<RawRecord>, TransportError> {
            match self.records.pop_front() {
                Some(record) => Ok(Some(record)),
                None => std::future::pending().await,
            }
        }
    }

    #[async_trait]
    impl Transport for FixedTransport {
        async fn connect(&self) -> Result<Box<dyn Connection>, TransportError> {
            let records = self.records.lock().take().unwrap_or_default();
            Ok(Box::new(FixedConnection {
                records: records.into(),
            }))
        }
    }

    fn transport(sequences: &[i64]) -> Arc<dyn Transport> {
        let records = sequences
            .iter()
            .map(|seq| RawRecord::new("X", 10.0, *seq, 0))
            .collect();
        Arc::new(FixedTransport {
            records: Mutex::new(Some(records)),
        })
    }

    fn config() -> ProcessorConfig {
        ProcessorConfig {
            heartbeat_timeout: Duration::ZERO,
            ..ProcessorConfig::default()
        }
    }

    fn collector() -> (Arc<Mutex<Vec<u64>>>, impl Subscriber) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let callback = move |update: &MarketUpdate| -> anyhow::Result<()> {
            sink.lock().push(update.sequence());
            Ok(())
        };
        (seen, callback)
    }

    #[tokio::test]
    async fn start_is_idempotent() {
        let processor = MarketDataProcessor::new(config(), transport(&[]));
        processor.start().unwrap();
        processor.start().unwrap();
        processor.stop().await.unwrap();
    }

    #[tokio::test]
    async fn every_call_after_stop_is_closed() {
        let processor = MarketDataProcessor::new(config(), transport(&[]));
        let (_seen, callback) = collector();
        let handle = processor
            .subscribe(BackpressurePolicy::DropOldest, callback)
            .unwrap();
        processor.start().unwrap();
        processor.stop().await.unwrap();

        let (_seen, again) = collector();
        assert_eq!(processor.start(), Err(ProcessorError::Closed));
        assert_eq!(processor.stop().await, Err(ProcessorError::Closed));
        assert_eq!(
            processor.subscribe(BackpressurePolicy::DropNewest, again).err(),
            Some(ProcessorError::Closed)
        );
        assert_eq!(processor.unsubscribe(handle), Err(ProcessorError::Closed));
        assert_eq!(processor.subscription_stats(handle).err(), Some(ProcessorError::Closed));
        assert_eq!(processor.wait().await, Err(ProcessorError::Closed));
        assert_eq!(processor.connection_state(), Err(ProcessorError::Closed));
        assert_eq!(processor.stats().err(), Some(ProcessorError::Closed));
        assert!(processor.state_changes().is_err());
    }

    #[tokio::test]
    async fn stop_without_start_closes() {
        let processor = MarketDataProcessor::new(config(), transport(&[]));
        let states = processor.state_changes().unwrap();
        processor.stop().await.unwrap();
        assert_eq!(*states.borrow(), ConnectionState::Closed);
    }

    #[test]
    fn subscribe_outside_runtime_fails() {
        let processor = MarketDataProcessor::new(config(), transport(&[]));
        let (_seen, callback) = collector();
        assert_eq!(
            processor
                .subscribe(BackpressurePolicy::DropOldest, callback)
                .err(),
            Some(ProcessorError::NoRuntime)
        );
        assert_eq!(processor.start(), Err(ProcessorError::NoRuntime));
    }

    #[tokio::test]
    async fn unsubscribe_unknown_handle() {
        let processor = MarketDataProcessor::new(config(), transport(&[]));
        assert_eq!(
            processor.unsubscribe(SubscriptionHandle(99)),
            Err(ProcessorError::UnknownSubscription(99))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn delivers_deduplicated_stream() {
        let processor = MarketDataProcessor::new(config(), transport(&[1, 2, 2, 3, 5, 4]));
        let (seen, callback) = collector();
        let handle = processor
            .subscribe(BackpressurePolicy::DropOldest, callback)
            .unwrap();

        processor.start().unwrap();
        let mut states = processor.state_changes().unwrap();
        states
            .wait_for(|s| *s == ConnectionState::Streaming)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(*seen.lock(), vec![1, 2, 3, 5]);
        let stats = processor.subscription_stats(handle).unwrap();
        assert_eq!(stats.delivered, 4);
        assert_eq!(stats.last_delivered.get("X"), Some(&5));
        assert_eq!(processor.stats().unwrap().ingest.duplicates, 2);

        processor.stop().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn halt_discards_queued_updates() {
        let config = ProcessorConfig {
            shutdown_policy: ShutdownPolicy::Halt,
            ..config()
        };
        let processor = MarketDataProcessor::new(config, transport(&[]));
        let (seen, callback) = collector();
        let handle = processor
            .subscribe(BackpressurePolicy::DropOldest, callback)
            .unwrap();
        let subscription = processor.registry.get(handle.id()).unwrap();
        subscription.offer(MarketUpdate::new("X", Decimal::ONE, 1, 0, 0));

        // The worker has not been polled yet, so the update is still queued.
        processor.stop().await.unwrap();

        assert!(seen.lock().is_empty());
        assert_eq!(subscription.queued(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn drain_delivers_already_queued_updates() {
        let processor = MarketDataProcessor::new(config(), transport(&[]));
        let (seen, callback) = collector();
        let handle = processor
            .subscribe(BackpressurePolicy::DropOldest, callback)
            .unwrap();
        let subscription = processor.registry.get(handle.id()).unwrap();
        for seq in 1..=3 {
            subscription.offer(MarketUpdate::new("X", Decimal::ONE, seq, 0, 0));
        }

        processor.stop().await.unwrap();

        assert_eq!(*seen.lock(), vec![1, 2, 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn fatal_error_surfaces_through_wait() {
        struct Refusing;

        #[async_trait]
        impl Transport for Refusing {
            async fn connect(&self) -> Result<Box<dyn Connection>, TransportError> {
                Err(TransportError::ConnectFailed("refused".to_string()))
            }
        }

        let config = ProcessorConfig {
            backoff: BackoffConfig {
                base_delay: Duration::from_millis(10),
                max_attempts: 2,
                jitter_factor: 0.0,
                ..BackoffConfig::default()
            },
            ..config()
        };
        let processor = MarketDataProcessor::new(config, Arc::new(Refusing));
        processor.start().unwrap();

        let err = processor.wait().await.unwrap_err();

        assert!(matches!(err, ProcessorError::Fatal(ref e) if e.attempts == 2));
        assert_eq!(processor.connection_state(), Ok(ConnectionState::Closed));
        assert_eq!(processor.start(), Err(err.clone()));
        let (_seen, callback) = collector();
        assert_eq!(
            processor.subscribe(BackpressurePolicy::DropOldest, callback).err(),
            Some(err.clone())
        );
        assert_eq!(processor.wait().await, Err(err));
        processor.stop().await.unwrap();
        assert_eq!(processor.start(), Err(ProcessorError::Closed));
    }

    #[tokio::test]
    async fn supervisor_panic_resolves_wait() {
        struct Exploding;

        #[async_trait]
        impl Transport for Exploding {
            async fn connect(&self) -> Result<Box<dyn Connection>, TransportError> {
                panic!("transport exploded")
            }
        }

        let processor = MarketDataProcessor::new(config(), Arc::new(Exploding));
        let states = processor.state_changes().unwrap();
        processor.start().unwrap();

        let err = tokio::time::timeout(Duration::from_secs(2), processor.wait())
            .await
            .expect("wait resolves after a supervisor panic")
            .unwrap_err();

        assert!(matches!(err, ProcessorError::Aborted(ref reason) if reason.contains("transport exploded")));
        assert_eq!(*states.borrow(), ConnectionState::Closed);
        assert_eq!(processor.start(), Err(err.clone()));
        let (_seen, callback) = collector();
        assert_eq!(
            processor.subscribe(BackpressurePolicy::DropNewest, callback).err(),
            Some(err)
        );
        processor.stop().await.unwrap();
    }

    #[tokio::test]
    async fn unusable_jitter_does_not_stall_supervisor() {
        struct Refusing;

        #[async_trait]
        impl Transport for Refusing {
            async fn connect(&self) -> Result<Box<dyn Connection>, TransportError> {
                Err(TransportError::ConnectFailed("refused".to_string()))
            }
        }

        let config = ProcessorConfig {
            backoff: BackoffConfig {
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(5),
                jitter_factor: f64::NAN,
                max_attempts: 1,
                ..BackoffConfig::default()
            },
            ..config()
        };
        let processor = MarketDataProcessor::new(config, Arc::new(Refusing));
        processor.start().unwrap();

        let result = tokio::time::timeout(Duration::from_secs(2), processor.wait())
            .await
            .expect("wait resolves");

        assert!(matches!(result, Err(ProcessorError::Fatal(_))));
        processor.stop().await.unwrap();
    }

    #[tokio::test]
    async fn unsubscribe_stops_delivery() {
        let processor = MarketDataProcessor::new(config(), transport(&[]));
        let (seen, callback) = collector();
        let handle = processor
            .subscribe(BackpressurePolicy::DropOldest, callback)
            .unwrap();
        let subscription = processor.registry.get(handle.id()).unwrap();

        processor.unsubscribe(handle).unwrap();
        subscription.offer(MarketUpdate::new("X", Decimal::ONE, 1, 0, 0));
        tokio::task::yield_now().await;

        assert!(seen.lock().is_empty());
        assert_eq!(
            processor.subscription_stats(handle).err(),
            Some(ProcessorError::UnknownSubscription(handle.id()))
        );
    }
}
