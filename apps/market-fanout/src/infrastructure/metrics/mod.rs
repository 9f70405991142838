//! Prometheus Metrics Module
//!
//! Exposes engine metrics via Prometheus format for monitoring.
//!
//! # Metrics Categories
//!
//! - **Ingest**: Records received, rejected, deduplicated and accepted
//! - **Fan-out**: Per-policy queue overflows, backpressure timeouts and callback failures
//! - **Connection**: Upstream connection state and reconnect attempts
//! - **Subscriptions**: Active subscription and queued update counts
//!
//! # Integration
//!
//! Metrics are served at `/metrics` on the configured metrics port.

use std::net::SocketAddr;

use metrics::{counter, describe_counter, describe_gauge, gauge};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder};

use crate::application::ports::{FeedEvent, ObservabilitySink};
use crate::application::services::ProcessorStats;
use crate::domain::connection::ConnectionState;

// =============================================================================
// Exporter
// =============================================================================

/// Install the Prometheus recorder and its HTTP listener.
///
/// A port of 0 leaves metrics disabled; the recording macros are then
/// no-ops.
///
/// # Errors
///
/// Returns an error if the listener cannot be bound or a recorder is
/// already installed.
pub fn init_metrics(port: u16) -> Result<(), BuildError> {
    if port == 0 {
        return Ok(());
    }

    PrometheusBuilder::new()
        .with_http_listener(SocketAddr::from(([0, 0, 0, 0], port)))
        .install()?;

    register_metrics();
    Ok(())
}

// =============================================================================
// Metric Registration
// =============================================================================

fn register_metrics() {
    // Ingest counters
    describe_counter!(
        "market_fanout_records_rejected_total",
        "Raw records dropped by validation"
    );
    describe_counter!(
        "market_fanout_duplicates_total",
        "Updates dropped as duplicate or stale"
    );
    describe_gauge!(
        "market_fanout_records_received",
        "Records pulled from the upstream feed since start"
    );
    describe_gauge!(
        "market_fanout_records_accepted",
        "Records accepted and dispatched since start"
    );

    // Fan-out counters
    describe_counter!(
        "market_fanout_queue_overflow_total",
        "Updates dropped for one subscriber by its backpressure policy"
    );
    describe_counter!(
        "market_fanout_backpressure_timeouts_total",
        "Blocking offers that timed out"
    );
    describe_counter!(
        "market_fanout_callback_failures_total",
        "Subscriber callbacks that returned an error or panicked"
    );

    // Connection
    describe_gauge!(
        "market_fanout_connection_state",
        "1 for the current connection state, 0 for the others"
    );
    describe_counter!(
        "market_fanout_reconnects_total",
        "Reconnection attempts scheduled"
    );
    describe_counter!(
        "market_fanout_fatal_connectivity_total",
        "Times the reconnection budget was exhausted"
    );

    // Subscriptions
    describe_gauge!(
        "market_fanout_subscriptions",
        "Number of registered subscriptions"
    );
    describe_gauge!(
        "market_fanout_queued_updates",
        "Updates queued across all subscriptions"
    );
}

// =============================================================================
// Metric Recording Functions
// =============================================================================

const STATE_LABELS: [&str; 5] = ["disconnected", "connecting", "streaming", "backoff", "closed"];

/// Mark `state` as the current connection state.
pub fn set_connection_state(state: &ConnectionState) {
    let current = state.as_str();
    for label in STATE_LABELS {
        gauge!("market_fanout_connection_state", "state" => label).set(if label == current {
            1.0
        } else {
            0.0
        });
    }
}

/// Publish a stats snapshot as gauges.
#[allow(clippy::cast_precision_loss)]
pub fn record_stats(stats: &ProcessorStats) {
    set_connection_state(&stats.connection_state);
    gauge!("market_fanout_records_received").set(stats.ingest.received as f64);
    gauge!("market_fanout_records_accepted").set(stats.ingest.accepted as f64);
    gauge!("market_fanout_subscriptions").set(stats.subscriptions.subscription_count as f64);
    gauge!("market_fanout_queued_updates").set(stats.subscriptions.queued_total as f64);
}

/// Sink that turns pipeline events into Prometheus series.
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsSink;

impl ObservabilitySink for MetricsSink {
    fn record(&self, event: &FeedEvent) {
        match event {
            FeedEvent::ConnectionTransition(transition) => {
                set_connection_state(&transition.to);
                if matches!(transition.to, ConnectionState::Backoff { .. }) {
                    counter!("market_fanout_reconnects_total").increment(1);
                }
            }
            FeedEvent::RecordRejected { error, .. } => {
                counter!(
                    "market_fanout_records_rejected_total",
                    "reason" => error.reason()
                )
                .increment(1);
            }
            FeedEvent::DuplicateDropped { .. } => {
                counter!("market_fanout_duplicates_total").increment(1);
            }
            FeedEvent::QueueOverflow { policy, .. } => {
                counter!(
                    "market_fanout_queue_overflow_total",
                    "policy" => policy.as_str()
                )
                .increment(1);
            }
            FeedEvent::Backpressure(_) => {
                counter!("market_fanout_backpressure_timeouts_total").increment(1);
            }
            FeedEvent::CallbackFailed { .. } => {
                counter!("market_fanout_callback_failures_total").increment(1);
            }
            FeedEvent::FatalConnectivity(_) => {
                counter!("market_fanout_fatal_connectivity_total").increment(1);
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
