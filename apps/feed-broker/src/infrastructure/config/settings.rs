//! Broker Configuration Settings
//!
//! Configuration types for the feed broker, loaded from environment variables.

use std::time::Duration;

use crate::application::services::{
    BrokerOptions, DEFAULT_COALESCE_WINDOW, DEFAULT_RECONNECT_DELAY, LivenessConfig,
};
use crate::infrastructure::broadcast::DEFAULT_SUBSCRIBER_BUFFER;

/// Server port settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerSettings {
    /// Subscriber WebSocket gateway port.
    pub gateway_port: u16,
    /// Health check and metrics HTTP port.
    pub health_port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            gateway_port: 8080,
            health_port: 8082,
        }
    }
}

/// Complete broker configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerConfig {
    /// Upstream WebSocket URL.
    pub upstream_url: String,
    /// Constant reconnect backoff.
    pub reconnect_delay: Duration,
    /// Coalescing window.
    pub coalesce_window: Duration,
    /// Liveness probing.
    pub liveness: LivenessConfig,
    /// Per-subscriber outbound queue depth.
    pub subscriber_buffer: usize,
    /// Server port settings.
    pub server: ServerSettings,
}

impl BrokerConfig {
    /// Create configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if `FEED_BROKER_UPSTREAM_URL` is missing, empty or
    /// not a WebSocket URL, or if a duration or buffer size is zero.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Create configuration from an arbitrary variable lookup.
    ///
    /// Values that are present but do not parse fall back to their defaults.
    ///
    /// # Errors
    ///
    /// Same as [`BrokerConfig::from_env`].
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let upstream_url = lookup("FEED_BROKER_UPSTREAM_URL")
            .ok_or_else(|| ConfigError::MissingEnvVar("FEED_BROKER_UPSTREAM_URL".to_string()))?;

        if upstream_url.trim().is_empty() {
            return Err(ConfigError::EmptyValue(
                "FEED_BROKER_UPSTREAM_URL".to_string(),
            ));
        }

        if !(upstream_url.starts_with("ws://") || upstream_url.starts_with("wss://")) {
            return Err(ConfigError::InvalidValue {
                key: "FEED_BROKER_UPSTREAM_URL".to_string(),
                reason: "expected a ws:// or wss:// URL".to_string(),
            });
        }

        let liveness_defaults = LivenessConfig::default();
        let server_defaults = ServerSettings::default();

        let config = Self {
            upstream_url,
            reconnect_delay: parse_duration_millis(
                &lookup,
                "FEED_BROKER_RECONNECT_DELAY_MS",
                DEFAULT_RECONNECT_DELAY,
            ),
            coalesce_window: parse_duration_micros(
                &lookup,
                "FEED_BROKER_COALESCE_WINDOW_US",
                DEFAULT_COALESCE_WINDOW,
            ),
            liveness: LivenessConfig {
                interval: parse_duration_secs(
                    &lookup,
                    "FEED_BROKER_LIVENESS_INTERVAL_SECS",
                    liveness_defaults.interval,
                ),
                timeout: parse_duration_secs(
                    &lookup,
                    "FEED_BROKER_LIVENESS_TIMEOUT_SECS",
                    liveness_defaults.timeout,
                ),
            },
            subscriber_buffer: parse_or(
                &lookup,
                "FEED_BROKER_SUBSCRIBER_BUFFER",
                DEFAULT_SUBSCRIBER_BUFFER,
            ),
            server: ServerSettings {
                gateway_port: parse_or(
                    &lookup,
                    "FEED_BROKER_GATEWAY_PORT",
                    server_defaults.gateway_port,
                ),
                health_port: parse_or(
                    &lookup,
                    "FEED_BROKER_HEALTH_PORT",
                    server_defaults.health_port,
                ),
            },
        };

        config.validate()?;
        Ok(config)
    }

    /// Broker timing options derived from this configuration.
    #[must_use]
    pub const fn broker_options(&self) -> BrokerOptions {
        BrokerOptions {
            coalesce_window: self.coalesce_window,
            reconnect_delay: self.reconnect_delay,
            liveness: self.liveness,
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let zero = |key: &str| ConfigError::InvalidValue {
            key: key.to_string(),
            reason: "must be greater than zero".to_string(),
        };

        if self.reconnect_delay.is_zero() {
            return Err(zero("FEED_BROKER_RECONNECT_DELAY_MS"));
        }
        if self.coalesce_window.is_zero() {
            return Err(zero("FEED_BROKER_COALESCE_WINDOW_US"));
        }
        if self.liveness.interval.is_zero() {
            return Err(zero("FEED_BROKER_LIVENESS_INTERVAL_SECS"));
        }
        if self.liveness.timeout.is_zero() {
            return Err(zero("FEED_BROKER_LIVENESS_TIMEOUT_SECS"));
        }
        if self.subscriber_buffer == 0 {
            return Err(zero("FEED_BROKER_SUBSCRIBER_BUFFER"));
        }
        Ok(())
    }
}

/// Configuration error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// Required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),
    /// Environment variable has empty value.
    #[error("environment variable {0} cannot be empty")]
    EmptyValue(String),
    /// Environment variable has an unusable value.
    #[error("environment variable {key} is invalid: {reason}")]
    InvalidValue {
        /// Variable name.
        key: String,
        /// What is wrong with it.
        reason: String,
    },
}

fn parse_or<F, T>(lookup: &F, key: &str, default: T) -> T
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    lookup(key)
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn parse_duration_secs<F>(lookup: &F, key: &str, default: Duration) -> Duration
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map_or(default, Duration::from_secs)
}

fn parse_duration_millis<F>(lookup: &F, key: &str, default: Duration) -> Duration
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map_or(default, Duration::from_millis)
}

fn parse_duration_micros<F>(lookup: &F, key: &str, default: Duration) -> Duration
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map_or(default, Duration::from_micros)
}
