//! Market Fanout Binary
//!
//! Connects to the configured feed and fans updates out to the built-in
//! subscribers until a shutdown signal arrives or the feed is lost for good.
//!
//! # Usage
//!
//! ```bash
//! cargo run --bin market-fanout
//! ```
//!
//! # Environment Variables
//!
//! ## Required
//! - `MARKET_FANOUT_FEED_URL`: Upstream WebSocket URL
//!
//! ## Optional
//! - `MARKET_FANOUT_FEED_CODEC`: auto | json | msgpack (default: auto)
//! - `MARKET_FANOUT_SUBSCRIBE_MESSAGE`: Text frame sent after connecting
//! - `MARKET_FANOUT_FEED_TOKEN`: Bearer token for the handshake
//! - `MARKET_FANOUT_HEARTBEAT_TIMEOUT_SECS`: Idle timeout (default: 30, 0 disables)
//! - `MARKET_FANOUT_MAX_RECONNECT_ATTEMPTS`: Reconnect budget (default: 0 = unlimited)
//! - `MARKET_FANOUT_QUEUE_CAPACITY`: Per-subscriber queue size (default: 1024)
//! - `MARKET_FANOUT_SHUTDOWN_POLICY`: drain | halt (default: drain)
//! - `MARKET_FANOUT_METRICS_PORT`: Prometheus metrics port (default: 9090, 0 disables)
//! - `OTEL_ENABLED`: Enable OpenTelemetry (default: true)
//! - `OTEL_EXPORTER_OTLP_ENDPOINT`: OTLP endpoint (default: <http://localhost:4318>)
//! - `RUST_LOG`: Log level (default: info)

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use market_fanout::infrastructure::metrics::record_stats;
use market_fanout::infrastructure::telemetry;
use market_fanout::{
    BackpressurePolicy, FanoutConfig, FanoutSink, MarketDataProcessor, MarketUpdate, MetricsSink,
    ProcessorError, TracingSink, WebSocketTransport, init_metrics,
};
use tokio::signal;
use tokio_util::sync::CancellationToken;

/// Interval for publishing stats gauges.
const STATS_INTERVAL: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if rustls::crypto::ring::default_provider()
        .install_default()
        .is_err()
    {
        anyhow::bail!("failed to install rustls crypto provider");
    }

    load_dotenv();

    // Initialize telemetry (OpenTelemetry + tracing)
    let _telemetry_guard = telemetry::init();

    tracing::info!("Starting market fanout");

    let config = FanoutConfig::from_env()?;
    log_config(&config);

    init_metrics(config.server.metrics_port).context("failed to start metrics exporter")?;

    let sink = FanoutSink::new()
        .with(Arc::new(TracingSink))
        .with(Arc::new(MetricsSink));
    let processor = Arc::new(
        MarketDataProcessor::new(
            config.processor_config(),
            Arc::new(WebSocketTransport::new(&config.feed)),
        )
        .with_sink(Arc::new(sink)),
    );

    processor.subscribe(BackpressurePolicy::DropOldest, log_update)?;
    processor.start()?;

    let shutdown_token = CancellationToken::new();
    let stats_task = tokio::spawn(publish_stats(
        Arc::clone(&processor),
        shutdown_token.clone(),
    ));

    tracing::info!("Market fanout ready");

    let outcome = tokio::select! {
        () = await_shutdown() => Ok(()),
        result = processor.wait() => result,
    };

    shutdown_token.cancel();
    let _ = stats_task.await;

    if let Ok(stats) = processor.stats() {
        record_stats(&stats);
    }
    match processor.stop().await {
        Ok(()) | Err(ProcessorError::Closed) => {}
        Err(e) => tracing::warn!(error = %e, "Error during shutdown"),
    }

    match outcome {
        Ok(()) => {
            tracing::info!("Market fanout stopped");
            Ok(())
        }
        Err(e) => {
            tracing::error!(error = %e, "Market fanout stopped after fatal error");
            Err(e.into())
        }
    }
}

/// Built-in subscriber that logs each update.
#[allow(clippy::unnecessary_wraps)]
fn log_update(update: &MarketUpdate) -> anyhow::Result<()> {
    tracing::debug!(
        symbol = update.symbol(),
        price = %update.price(),
        sequence = update.sequence(),
        "Update"
    );
    Ok(())
}

/// Publish stats gauges until cancelled.
async fn publish_stats(processor: Arc<MarketDataProcessor>, cancel: CancellationToken) {
    let mut interval = tokio::time::interval(STATS_INTERVAL);
    loop {
        tokio::select! {
            () = cancel.cancelled() => return,
            _ = interval.tick() => {
                if let Ok(stats) = processor.stats() {
                    record_stats(&stats);
                }
            }
        }
    }
}

/// Log the parsed configuration.
fn log_config(config: &FanoutConfig) {
    tracing::info!(
        codec = config.feed.codec.as_str(),
        heartbeat_secs = config.connection.heartbeat_timeout.as_secs(),
        max_reconnect_attempts = config.connection.max_reconnect_attempts,
        queue_capacity = config.delivery.queue_capacity,
        shutdown_policy = config.delivery.shutdown_policy.as_str(),
        metrics_port = config.server.metrics_port,
        "Configuration loaded"
    );
    tracing::debug!(url = %config.feed.url, "Feed endpoint");
}

/// Load .env file from current directory or any ancestor directory.
fn load_dotenv() {
    if dotenvy::dotenv().is_ok() {
        return;
    }

    if let Ok(cwd) = std::env::current_dir() {
        let mut dir = cwd.as_path();
        while let Some(parent) = dir.parent() {
            let env_path = parent.join(".env");
            if env_path.exists() {
                let _ = dotenvy::from_path(&env_path);
                return;
            }
            dir = parent;
        }
    }
}

/// Wait for shutdown signal (SIGTERM or SIGINT).
#[allow(clippy::expect_used)]
async fn await_shutdown() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("signal handler installation is critical for graceful shutdown");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("SIGTERM handler installation is critical for graceful shutdown")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating shutdown");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, initiating shutdown");
        }
    }
}
