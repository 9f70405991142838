//! Fan-out Configuration Settings
//!
//! Configuration types for the engine, loaded from environment variables.
//! Unset or unparsable optional values fall back to defaults; only the
//! feed URL is required.

use std::ops::RangeInclusive;
use std::time::Duration;

use crate::application::services::{ProcessorConfig, ShutdownPolicy};
use crate::domain::connection::BackoffConfig;
use crate::domain::subscription::BackpressurePolicy;

/// Frame encoding expected from the upstream feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FeedCodec {
    /// Decode text frames as JSON and binary frames as MessagePack.
    #[default]
    Auto,
    /// Only accept JSON (text or binary frames).
    Json,
    /// Only accept MessagePack binary frames.
    MessagePack,
}

impl FeedCodec {
    /// Parse codec from string.
    #[must_use]
    pub fn from_str_case_insensitive(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "json" => Self::Json,
            "msgpack" | "messagepack" => Self::MessagePack,
            _ => Self::Auto,
        }
    }

    /// Get the codec name.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Json => "json",
            Self::MessagePack => "msgpack",
        }
    }
}

/// Parse a shutdown policy, defaulting to `Drain`.
#[must_use]
pub fn parse_shutdown_policy(s: &str) -> ShutdownPolicy {
    match s.to_lowercase().as_str() {
        "halt" => ShutdownPolicy::Halt,
        _ => ShutdownPolicy::Drain,
    }
}

/// Bearer token for the upstream feed.
#[derive(Clone)]
pub struct FeedToken(String);

impl FeedToken {
    /// Wrap a token.
    #[must_use]
    pub const fn new(token: String) -> Self {
        Self(token)
    }

    /// Get the token.
    #[must_use]
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for FeedToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("FeedToken([REDACTED])")
    }
}

/// Upstream feed settings.
#[derive(Debug, Clone)]
pub struct FeedSettings {
    /// WebSocket URL of the feed.
    pub url: String,
    /// Frame encoding.
    pub codec: FeedCodec,
    /// Text message sent right after connecting (e.g. a subscribe request).
    pub subscribe_message: Option<String>,
    /// Optional bearer token sent with the handshake.
    pub token: Option<FeedToken>,
}

/// Connection supervision settings.
#[derive(Debug, Clone)]
pub struct ConnectionSettings {
    /// Silence while streaming that counts as a failure (0 = disabled).
    pub heartbeat_timeout: Duration,
    /// Base reconnection delay.
    pub reconnect_delay_initial: Duration,
    /// Maximum reconnection delay.
    pub reconnect_delay_max: Duration,
    /// Reconnection delay multiplier for exponential backoff.
    pub reconnect_delay_multiplier: f64,
    /// Largest backoff exponent.
    pub reconnect_exponent_cap: u32,
    /// Jitter as a fraction of the delay.
    pub reconnect_jitter: f64,
    /// Maximum reconnection attempts before giving up (0 = unlimited).
    pub max_reconnect_attempts: u32,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        let backoff = BackoffConfig::default();
        Self {
            heartbeat_timeout: Duration::from_secs(30),
            reconnect_delay_initial: backoff.base_delay,
            reconnect_delay_max: backoff.max_delay,
            reconnect_delay_multiplier: backoff.multiplier,
            reconnect_exponent_cap: backoff.exponent_cap,
            reconnect_jitter: backoff.jitter_factor,
            max_reconnect_attempts: backoff.max_attempts,
        }
    }
}

/// Dedup, queueing and shutdown settings.
#[derive(Debug, Clone)]
pub struct DeliverySettings {
    /// Per-symbol dedup window.
    pub dedup_window: usize,
    /// Default per-subscription queue capacity.
    pub queue_capacity: usize,
    /// Default offer timeout for `Block` subscribers.
    pub block_timeout: Duration,
    /// Shutdown behavior.
    pub shutdown_policy: ShutdownPolicy,
    /// Upper bound on draining queues at shutdown.
    pub drain_grace: Duration,
}

impl Default for DeliverySettings {
    fn default() -> Self {
        let processor = ProcessorConfig::default();
        Self {
            dedup_window: processor.dedup_window,
            queue_capacity: processor.queue_capacity,
            block_timeout: Duration::from_millis(50),
            shutdown_policy: processor.shutdown_policy,
            drain_grace: processor.drain_grace,
        }
    }
}

/// Server port settings.
#[derive(Debug, Clone)]
pub struct ServerSettings {
    /// Prometheus metrics port (0 = disabled).
    pub metrics_port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self { metrics_port: 9090 }
    }
}

/// Complete engine configuration.
#[derive(Debug, Clone)]
pub struct FanoutConfig {
    /// Upstream feed.
    pub feed: FeedSettings,
    /// Connection supervision.
    pub connection: ConnectionSettings,
    /// Dedup and delivery.
    pub delivery: DeliverySettings,
    /// Server ports.
    pub server: ServerSettings,
}

impl FanoutConfig {
    /// Create configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if `MARKET_FANOUT_FEED_URL` is missing or empty, or
    /// if a backoff factor is out of range.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Create configuration from an arbitrary key lookup.
    ///
    /// # Errors
    ///
    /// Returns an error if `MARKET_FANOUT_FEED_URL` is missing or empty, or
    /// if a backoff factor parses to a non-finite or out-of-range number.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env(lookup);

        let url = env
            .get("MARKET_FANOUT_FEED_URL")
            .ok_or_else(|| ConfigError::MissingEnvVar("MARKET_FANOUT_FEED_URL".to_string()))?;
        if url.trim().is_empty() {
            return Err(ConfigError::EmptyValue("MARKET_FANOUT_FEED_URL".to_string()));
        }

        let feed = FeedSettings {
            url,
            codec: env
                .get("MARKET_FANOUT_FEED_CODEC")
                .map(|s| FeedCodec::from_str_case_insensitive(&s))
                .unwrap_or_default(),
            subscribe_message: env
                .get("MARKET_FANOUT_SUBSCRIBE_MESSAGE")
                .filter(|s| !s.trim().is_empty()),
            token: env
                .get("MARKET_FANOUT_FEED_TOKEN")
                .filter(|s| !s.is_empty())
                .map(FeedToken::new),
        };

        let defaults = ConnectionSettings::default();
        let connection = ConnectionSettings {
            heartbeat_timeout: env.duration_secs(
                "MARKET_FANOUT_HEARTBEAT_TIMEOUT_SECS",
                defaults.heartbeat_timeout,
            ),
            reconnect_delay_initial: env.duration_millis(
                "MARKET_FANOUT_RECONNECT_DELAY_INITIAL_MS",
                defaults.reconnect_delay_initial,
            ),
            reconnect_delay_max: env.duration_secs(
                "MARKET_FANOUT_RECONNECT_DELAY_MAX_SECS",
                defaults.reconnect_delay_max,
            ),
            reconnect_delay_multiplier: env.bounded_f64(
                "MARKET_FANOUT_RECONNECT_DELAY_MULTIPLIER",
                defaults.reconnect_delay_multiplier,
                1.0..=f64::MAX,
            )?,
            reconnect_exponent_cap: env.parse(
                "MARKET_FANOUT_RECONNECT_EXPONENT_CAP",
                defaults.reconnect_exponent_cap,
            ),
            reconnect_jitter: env.bounded_f64(
                "MARKET_FANOUT_RECONNECT_JITTER",
                defaults.reconnect_jitter,
                0.0..=1.0,
            )?,
            max_reconnect_attempts: env.parse(
                "MARKET_FANOUT_MAX_RECONNECT_ATTEMPTS",
                defaults.max_reconnect_attempts,
            ),
        };

        let defaults = DeliverySettings::default();
        let delivery = DeliverySettings {
            dedup_window: env.parse("MARKET_FANOUT_DEDUP_WINDOW", defaults.dedup_window),
            queue_capacity: env.parse("MARKET_FANOUT_QUEUE_CAPACITY", defaults.queue_capacity),
            block_timeout: env
                .duration_millis("MARKET_FANOUT_BLOCK_TIMEOUT_MS", defaults.block_timeout),
            shutdown_policy: env
                .get("MARKET_FANOUT_SHUTDOWN_POLICY")
                .map_or(defaults.shutdown_policy, |s| parse_shutdown_policy(&s)),
            drain_grace: env.duration_millis("MARKET_FANOUT_DRAIN_GRACE_MS", defaults.drain_grace),
        };

        let server = ServerSettings {
            metrics_port: env.parse(
                "MARKET_FANOUT_METRICS_PORT",
                ServerSettings::default().metrics_port,
            ),
        };

        Ok(Self {
            feed,
            connection,
            delivery,
            server,
        })
    }

    /// Backoff policy settings.
    #[must_use]
    pub fn backoff(&self) -> BackoffConfig {
        BackoffConfig {
            base_delay: self.connection.reconnect_delay_initial,
            max_delay: self.connection.reconnect_delay_max,
            multiplier: self.connection.reconnect_delay_multiplier,
            exponent_cap: self.connection.reconnect_exponent_cap,
            jitter_factor: self.connection.reconnect_jitter,
            max_attempts: self.connection.max_reconnect_attempts,
        }
    }

    /// Settings for the processor core.
    #[must_use]
    pub fn processor_config(&self) -> ProcessorConfig {
        ProcessorConfig {
            backoff: self.backoff(),
            heartbeat_timeout: self.connection.heartbeat_timeout,
            dedup_window: self.delivery.dedup_window,
            queue_capacity: self.delivery.queue_capacity,
            shutdown_policy: self.delivery.shutdown_policy,
            drain_grace: self.delivery.drain_grace,
        }
    }

    /// Policy for subscribers that ask for blocking delivery.
    #[must_use]
    pub const fn block_policy(&self) -> BackpressurePolicy {
        BackpressurePolicy::Block {
            timeout: self.delivery.block_timeout,
        }
    }
}

impl From<&FanoutConfig> for ProcessorConfig {
    fn from(config: &FanoutConfig) -> Self {
        config.processor_config()
    }
}

/// Configuration error.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),
    /// Environment variable has empty value.
    #[error("environment variable {0} cannot be empty")]
    EmptyValue(String),
    /// Environment variable parsed but is outside its accepted range.
    #[error("environment variable {key}={value} is out of range ({expected})")]
    OutOfRange {
        /// Variable name.
        key: String,
        /// Raw value.
        value: String,
        /// Accepted range.
        expected: String,
    },
}

/// Typed accessors over a key lookup.
struct Env<F>(F);

impl<F> Env<F>
where
    F: Fn(&str) -> Option<String>,
{
    fn get(&self, key: &str) -> Option<String> {
        (self.0)(key)
    }

    fn parse<T: std::str::FromStr>(&self, key: &str, default: T) -> T {
        self.get(key)
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(default)
    }

    /// Parse a float that must be finite and inside `range`. Text that is
    /// not a number falls back to `default` like every other setting.
    fn bounded_f64(
        &self,
        key: &str,
        default: f64,
        range: RangeInclusive<f64>,
    ) -> Result<f64, ConfigError> {
        let Some(raw) = self.get(key) else {
            return Ok(default);
        };
        let Ok(value) = raw.trim().parse::<f64>() else {
            return Ok(default);
        };
        if value.is_finite() && range.contains(&value) {
            Ok(value)
        } else {
            Err(ConfigError::OutOfRange {
                key: key.to_string(),
                value: raw,
                expected: format!("finite, {} to {}", range.start(), range.end()),
            })
        }
    }

    fn duration_secs(&self, key: &str, default: Duration) -> Duration {
        self.get(key)
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map_or(default, Duration::from_secs)
    }

    fn duration_millis(&self, key: &str, default: Duration) -> Duration {
        self.get(key)
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map_or(default, Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use test_case::test_case;

    use super::*;

    fn config_from(pairs: &[(&str, &str)]) -> Result<FanoutConfig, ConfigError> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        FanoutConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn feed_url_is_required() {
        let err = config_from(&[]).unwrap_err();
        assert!(matches!(err, ConfigError::MissingEnvVar(ref k) if k == "MARKET_FANOUT_FEED_URL"));

        let err = config_from(&[("MARKET_FANOUT_FEED_URL", "  ")]).unwrap_err();
        assert!(matches!(err, ConfigError::EmptyValue(_)));
    }

    #[test]
    fn defaults_apply() {
        let config = config_from(&[("MARKET_FANOUT_FEED_URL", "wss://feed.example/ws")]).unwrap();

        assert_eq!(config.feed.codec, FeedCodec::Auto);
        assert!(config.feed.subscribe_message.is_none());
        assert_eq!(config.connection.heartbeat_timeout, Duration::from_secs(30));
        assert_eq!(config.delivery.queue_capacity, 1024);
        assert_eq!(config.delivery.shutdown_policy, ShutdownPolicy::Drain);
        assert_eq!(config.server.metrics_port, 9090);
        assert_eq!(config.processor_config(), ProcessorConfig::default());
    }

    #[test]
    fn overrides_parse() {
        let config = config_from(&[
            ("MARKET_FANOUT_FEED_URL", "wss://feed.example/ws"),
            ("MARKET_FANOUT_FEED_CODEC", "MsgPack"),
            ("MARKET_FANOUT_SUBSCRIBE_MESSAGE", r#"{"action":"subscribe"}"#),
            ("MARKET_FANOUT_HEARTBEAT_TIMEOUT_SECS", "0"),
            ("MARKET_FANOUT_RECONNECT_DELAY_INITIAL_MS", "250"),
            ("MARKET_FANOUT_MAX_RECONNECT_ATTEMPTS", "7"),
            ("MARKET_FANOUT_QUEUE_CAPACITY", "16"),
            ("MARKET_FANOUT_BLOCK_TIMEOUT_MS", "75"),
            ("MARKET_FANOUT_SHUTDOWN_POLICY", "HALT"),
        ])
        .unwrap();

        assert_eq!(config.feed.codec, FeedCodec::MessagePack);
        assert_eq!(
            config.feed.subscribe_message.as_deref(),
            Some(r#"{"action":"subscribe"}"#)
        );
        let processor = config.processor_config();
        assert_eq!(processor.heartbeat_timeout, Duration::ZERO);
        assert_eq!(processor.backoff.base_delay, Duration::from_millis(250));
        assert_eq!(processor.backoff.max_attempts, 7);
        assert_eq!(processor.queue_capacity, 16);
        assert_eq!(processor.shutdown_policy, ShutdownPolicy::Halt);
        assert_eq!(
            config.block_policy(),
            BackpressurePolicy::Block {
                timeout: Duration::from_millis(75)
            }
        );
    }

    #[test]
    fn unparsable_values_fall_back() {
        let config = config_from(&[
            ("MARKET_FANOUT_FEED_URL", "wss://feed.example/ws"),
            ("MARKET_FANOUT_QUEUE_CAPACITY", "lots"),
            ("MARKET_FANOUT_RECONNECT_JITTER", "n/a"),
        ])
        .unwrap();

        assert_eq!(config.delivery.queue_capacity, 1024);
        assert!((config.connection.reconnect_jitter - 0.1).abs() < f64::EPSILON);
    }

    #[test_case("MARKET_FANOUT_RECONNECT_JITTER", "NaN" ; "nan jitter")]
    #[test_case("MARKET_FANOUT_RECONNECT_JITTER", "inf" ; "infinite jitter")]
    #[test_case("MARKET_FANOUT_RECONNECT_JITTER", "-0.2" ; "negative jitter")]
    #[test_case("MARKET_FANOUT_RECONNECT_JITTER", "1.5" ; "jitter above one")]
    #[test_case("MARKET_FANOUT_RECONNECT_DELAY_MULTIPLIER", "NaN" ; "nan multiplier")]
    #[test_case("MARKET_FANOUT_RECONNECT_DELAY_MULTIPLIER", "-inf" ; "infinite multiplier")]
    #[test_case("MARKET_FANOUT_RECONNECT_DELAY_MULTIPLIER", "0.5" ; "shrinking multiplier")]
    fn out_of_range_backoff_factor_rejected(key: &str, value: &str) {
        let err = config_from(&[("MARKET_FANOUT_FEED_URL", "wss://feed.example/ws"), (key, value)])
            .unwrap_err();
        assert!(matches!(err, ConfigError::OutOfRange { key: ref k, .. } if k == key));
    }

    #[test]
    fn in_range_backoff_factors_accepted() {
        let config = config_from(&[
            ("MARKET_FANOUT_FEED_URL", "wss://feed.example/ws"),
            ("MARKET_FANOUT_RECONNECT_JITTER", "0"),
            ("MARKET_FANOUT_RECONNECT_DELAY_MULTIPLIER", "1.5"),
        ])
        .unwrap();
        let backoff = config.backoff();
        assert!(backoff.jitter_factor.abs() < f64::EPSILON);
        assert!((backoff.multiplier - 1.5).abs() < f64::EPSILON);
    }

    #[test]
    fn codec_parsing() {
        assert_eq!(FeedCodec::from_str_case_insensitive("json"), FeedCodec::Json);
        assert_eq!(FeedCodec::from_str_case_insensitive("JSON"), FeedCodec::Json);
        assert_eq!(
            FeedCodec::from_str_case_insensitive("messagepack"),
            FeedCodec::MessagePack
        );
        assert_eq!(FeedCodec::from_str_case_insensitive("other"), FeedCodec::Auto);
    }

    #[test]
    fn token_redacted_debug() {
        let config = config_from(&[
            ("MARKET_FANOUT_FEED_URL", "wss://feed.example/ws"),
            ("MARKET_FANOUT_FEED_TOKEN", "secret456"),
        ])
        .unwrap();
        let debug = format!("{config:?}");
        assert!(!debug.contains("secret456"));
        assert!(debug.contains("[REDACTED]"));
        assert_eq!(config.feed.token.map(|t| t.expose().to_string()).as_deref(), Some("secret456"));
    }
}
