//! Configuration Module
//!
//! Configuration loading for the fan-out engine.

mod settings;

pub use settings::{
    ConfigError, ConnectionSettings, DeliverySettings, FanoutConfig, FeedCodec, FeedSettings,
    FeedToken, ServerSettings, parse_shutdown_policy,
};
