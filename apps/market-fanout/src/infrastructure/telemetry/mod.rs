//! OpenTelemetry Tracing Integration
//!
//! Configures structured logging and, optionally, OpenTelemetry with an
//! OTLP exporter for distributed tracing.
//!
//! # Environment Variables
//!
//! - `OTEL_ENABLED`: Set to "false" to disable tracing (default: true)
//! - `OTEL_EXPORTER_OTLP_ENDPOINT`: OTLP endpoint (default: http://localhost:4318)
//! - `OTEL_SERVICE_NAME`: Service name for traces (default: market-fanout)
//!
//! # Usage
//!
//! ```ignore
//! use market_fanout::infrastructure::telemetry;
//!
//! // Initialize at startup (returns guard that must be kept alive)
//! let _guard = telemetry::init();
//! ```

use std::sync::Arc;

use opentelemetry::trace::TracerProvider as _;
use opentelemetry_otlp::WithExportConfig;
use opentelemetry_sdk::trace::SdkTracerProvider;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use crate::application::ports::{FeedEvent, ObservabilitySink};

/// Service name for OpenTelemetry traces.
const DEFAULT_SERVICE_NAME: &str = "market-fanout";

/// Default OTLP endpoint.
const DEFAULT_OTLP_ENDPOINT: &str = "http://localhost:4318";

/// Guard that shuts down OpenTelemetry when dropped.
pub struct TelemetryGuard {
    tracer_provider: Option<SdkTracerProvider>,
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        if let Some(provider) = self.tracer_provider.take()
            && let Err(e) = provider.shutdown()
        {
            eprintln!("Failed to shutdown OpenTelemetry tracer provider: {e}");
        }
    }
}

/// Telemetry configuration.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    /// Whether OpenTelemetry is enabled.
    pub enabled: bool,
    /// OTLP exporter endpoint.
    pub otlp_endpoint: String,
    /// Service name for traces.
    pub service_name: String,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            otlp_endpoint: DEFAULT_OTLP_ENDPOINT.to_string(),
            service_name: DEFAULT_SERVICE_NAME.to_string(),
        }
    }
}

impl TelemetryConfig {
    /// Create configuration from environment variables.
    #[must_use]
    pub fn from_env() -> Self {
        let enabled = std::env::var("OTEL_ENABLED")
            .map(|v| v.to_lowercase() != "false")
            .unwrap_or(true);

        let otlp_endpoint = std::env::var("OTEL_EXPORTER_OTLP_ENDPOINT")
            .unwrap_or_else(|_| DEFAULT_OTLP_ENDPOINT.to_string());

        let service_name =
            std::env::var("OTEL_SERVICE_NAME").unwrap_or_else(|_| DEFAULT_SERVICE_NAME.to_string());

        Self {
            enabled,
            otlp_endpoint,
            service_name,
        }
    }
}

/// Initialize telemetry with default configuration from environment.
///
/// Returns a guard that must be kept alive for the duration of the program.
#[must_use]
pub fn init() -> TelemetryGuard {
    init_with_config(TelemetryConfig::from_env())
}

/// Initialize telemetry with custom configuration.
///
/// Falls back to log-only output if the OTLP exporter cannot be built.
#[must_use]
#[allow(clippy::expect_used)]
pub fn init_with_config(config: TelemetryConfig) -> TelemetryGuard {
    let env_filter = EnvFilter::from_default_env()
        .add_directive(
            "market_fanout=info"
                .parse()
                .expect("static directive 'market_fanout=info' is valid"),
        )
        .add_directive(
            "tungstenite=warn"
                .parse()
                .expect("static directive 'tungstenite=warn' is valid"),
        );

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);

    let otlp_exporter = if config.enabled {
        match opentelemetry_otlp::SpanExporter::builder()
            .with_tonic()
            .with_endpoint(&config.otlp_endpoint)
            .build()
        {
            Ok(exporter) => Some(exporter),
            Err(e) => {
                eprintln!("Failed to create OTLP exporter, tracing disabled: {e}");
                None
            }
        }
    } else {
        None
    };

    let Some(otlp_exporter) = otlp_exporter else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(fmt_layer)
            .init();

        return TelemetryGuard {
            tracer_provider: None,
        };
    };

    let tracer_provider = SdkTracerProvider::builder()
        .with_batch_exporter(otlp_exporter)
        .with_resource(
            opentelemetry_sdk::Resource::builder()
                .with_service_name(config.service_name.clone())
                .build(),
        )
        .build();

    let tracer = tracer_provider.tracer(config.service_name);
    let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .with(otel_layer)
        .init();

    TelemetryGuard {
        tracer_provider: Some(tracer_provider),
    }
}

// =============================================================================
// Event Sinks
// =============================================================================

/// Sink that renders pipeline events as structured log lines.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl ObservabilitySink for TracingSink {
    fn record(&self, event: &FeedEvent) {
        match event {
            FeedEvent::ConnectionTransition(transition) => {
                info!(
                    from = %transition.from,
                    to = %transition.to,
                    "Connection state changed"
                );
            }
            FeedEvent::RecordRejected { symbol, error } => {
                warn!(symbol = %symbol, reason = error.reason(), error = %error, "Record rejected");
            }
            FeedEvent::DuplicateDropped { symbol, sequence } => {
                debug!(symbol = %symbol, sequence, "Duplicate update dropped");
            }
            FeedEvent::QueueOverflow {
                subscription,
                policy,
                symbol,
                sequence,
            } => {
                debug!(
                    subscription,
                    policy = policy.as_str(),
                    symbol = %symbol,
                    sequence,
                    "Subscriber queue overflow"
                );
            }
            FeedEvent::Backpressure(err) => {
                warn!(
                    subscription = err.subscription,
                    symbol = %err.symbol,
                    sequence = err.sequence,
                    timeout_ms = u64::try_from(err.timeout.as_millis()).unwrap_or(u64::MAX),
                    "Backpressure timeout"
                );
            }
            FeedEvent::CallbackFailed {
                subscription,
                symbol,
                sequence,
                error,
            } => {
                warn!(subscription, symbol = %symbol, sequence, error = %error, "Callback failed");
            }
            FeedEvent::FatalConnectivity(err) => {
                error!(attempts = err.attempts, last_error = %err.last_error, "Feed unreachable");
            }
        }
    }
}

/// Forwards every event to each inner sink in order.
#[derive(Clone, Default)]
pub struct FanoutSink {
    sinks: Vec<Arc<dyn ObservabilitySink>>,
}

impl FanoutSink {
    /// Create an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an inner sink.
    #[must_use]
    pub fn with(mut self, sink: Arc<dyn ObservabilitySink>) -> Self {
        self.sinks.push(sink);
        self
    }

    /// Number of inner sinks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    /// Whether there are no inner sinks.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

impl ObservabilitySink for FanoutSink {
    fn record(&self, event: &FeedEvent) {
        for sink in &self.sinks {
            sink.record(event);
        }
    }
}

impl std::fmt::Debug for FanoutSink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FanoutSink")
            .field("sinks", &self.sinks.len())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::ports::MockObservabilitySink;

    #[test]
    fn default_config() {
        let config = TelemetryConfig::default();
        assert!(config.enabled);
        assert_eq!(config.otlp_endpoint, DEFAULT_OTLP_ENDPOINT);
        assert_eq!(config.service_name, "market-fanout");
    }

    #[test]
    fn fanout_sink_forwards_to_all() {
        let mut first = MockObservabilitySink::new();
        first.expect_record().times(1).return_const(());
        let mut second = MockObservabilitySink::new();
        second.expect_record().times(1).return_const(());

        let sink = FanoutSink::new()
            .with(Arc::new(first))
            .with(Arc::new(second))
            .with(Arc::new(TracingSink));
        assert_eq!(sink.len(), 3);

        sink.record(&FeedEvent::DuplicateDropped {
            symbol: Arc::from("X"),
            sequence: 9,
        });
    }

    #[test]
    fn empty_fanout_sink() {
        let sink = FanoutSink::new();
        assert!(sink.is_empty());
        sink.record(&FeedEvent::DuplicateDropped {
            symbol: Arc::from("X"),
            sequence: 1,
        });
    }
}
