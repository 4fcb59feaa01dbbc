//! Bus configuration with validation.
//!
//! Values can be set in code with the `with_*` builders or read from the
//! environment via [`BusConfig::from_env`].

use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;
use thiserror::Error;

use crate::channel::ChannelMode;

/// Default per-handler timeout on the publish path.
pub const DEFAULT_HANDLER_TIMEOUT_MS: u64 = 5_000;

/// Default timeout for a single intent handler invocation.
pub const DEFAULT_INTENT_TIMEOUT_MS: u64 = 30_000;

/// Default time a correlated request waits for its response.
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 30_000;

/// Default maximum depth of the plugin hierarchy.
pub const DEFAULT_MAX_PLUGIN_DEPTH: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("Invalid timeout: {0}")]
    InvalidTimeout(String),

    #[error("Invalid limit: {0}")]
    InvalidLimit(String),

    #[error("Invalid value for {key}: {value}")]
    InvalidValue { key: String, value: String },
}

/// Configuration for a [`crate::VoidCore`] instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Route by category over five virtual channels instead of one.
    pub multi_channel: bool,
    pub handler_timeout_ms: u64,
    pub intent_timeout_ms: u64,
    pub request_timeout_ms: u64,
    pub max_plugin_depth: usize,
    /// Per-owner resource ceiling. `None` admits every allocation.
    pub resource_quota: Option<u64>,
    /// Emit per-message debug logs.
    pub debug: bool,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            multi_channel: false,
            handler_timeout_ms: DEFAULT_HANDLER_TIMEOUT_MS,
            intent_timeout_ms: DEFAULT_INTENT_TIMEOUT_MS,
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            max_plugin_depth: DEFAULT_MAX_PLUGIN_DEPTH,
            resource_quota: None,
            debug: false,
        }
    }
}

impl BusConfig {
    /// Read configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `VOID_MULTI_CHANNEL`: Enable multi-channel routing (default: false)
    /// - `VOID_HANDLER_TIMEOUT_MS`: Per-handler timeout (default: 5000)
    /// - `VOID_INTENT_TIMEOUT_MS`: Intent handler timeout (default: 30000)
    /// - `VOID_REQUEST_TIMEOUT_MS`: Correlated request timeout (default: 30000)
    /// - `VOID_MAX_PLUGIN_DEPTH`: Plugin hierarchy depth limit (default: 10)
    /// - `VOID_RESOURCE_QUOTA`: Per-owner resource ceiling (default: unlimited)
    /// - `VOID_DEBUG`: Per-message debug logging (default: false)
    ///
    /// Unset variables keep their defaults; malformed ones are an error.
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();
        let config = Self {
            multi_channel: env_flag("VOID_MULTI_CHANNEL")?.unwrap_or(defaults.multi_channel),
            handler_timeout_ms: env_parse("VOID_HANDLER_TIMEOUT_MS")?
                .unwrap_or(defaults.handler_timeout_ms),
            intent_timeout_ms: env_parse("VOID_INTENT_TIMEOUT_MS")?
                .unwrap_or(defaults.intent_timeout_ms),
            request_timeout_ms: env_parse("VOID_REQUEST_TIMEOUT_MS")?
                .unwrap_or(defaults.request_timeout_ms),
            max_plugin_depth: env_parse("VOID_MAX_PLUGIN_DEPTH")?
                .unwrap_or(defaults.max_plugin_depth),
            resource_quota: env_parse("VOID_RESOURCE_QUOTA")?,
            debug: env_flag("VOID_DEBUG")?.unwrap_or(defaults.debug),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.handler_timeout_ms == 0 {
            return Err(ConfigError::InvalidTimeout(
                "handler_timeout_ms cannot be 0".into(),
            ));
        }
        if self.intent_timeout_ms == 0 {
            return Err(ConfigError::InvalidTimeout(
                "intent_timeout_ms cannot be 0".into(),
            ));
        }
        if self.request_timeout_ms == 0 {
            return Err(ConfigError::InvalidTimeout(
                "request_timeout_ms cannot be 0".into(),
            ));
        }
        if self.max_plugin_depth == 0 {
            return Err(ConfigError::InvalidLimit(
                "max_plugin_depth cannot be 0".into(),
            ));
        }
        if self.resource_quota == Some(0) {
            return Err(ConfigError::InvalidLimit(
                "resource_quota cannot be 0".into(),
            ));
        }
        Ok(())
    }

    pub fn channel_mode(&self) -> ChannelMode {
        ChannelMode::from_multi_channel(self.multi_channel)
    }

    pub fn handler_timeout(&self) -> Duration {
        Duration::from_millis(self.handler_timeout_ms)
    }

    pub fn intent_timeout(&self) -> Duration {
        Duration::from_millis(self.intent_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn with_multi_channel(mut self, enabled: bool) -> Self {
        self.multi_channel = enabled;
        self
    }

    pub fn with_handler_timeout(mut self, timeout: Duration) -> Self {
        self.handler_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_intent_timeout(mut self, timeout: Duration) -> Self {
        self.intent_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_max_plugin_depth(mut self, depth: usize) -> Self {
        self.max_plugin_depth = depth;
        self
    }

    pub fn with_resource_quota(mut self, quota: u64) -> Self {
        self.resource_quota = Some(quota);
        self
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Result<Option<T>, ConfigError> {
    match env::var(key) {
        Ok(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue {
                key: key.to_string(),
                value,
            }),
        Err(_) => Ok(None),
    }
}

fn env_flag(key: &str) -> Result<Option<bool>, ConfigError> {
    match env::var(key) {
        Ok(value) => match value.trim().to_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(Some(true)),
            "0" | "false" | "no" | "off" => Ok(Some(false)),
            _ => Err(ConfigError::InvalidValue {
                key: key.to_string(),
                value,
            }),
        },
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = BusConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.channel_mode(), ChannelMode::SingleChannel);
        assert_eq!(config.max_plugin_depth, 10);
        assert_eq!(config.handler_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn test_zero_timeouts_rejected() {
        let config = BusConfig::default().with_handler_timeout(Duration::ZERO);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidTimeout(_))
        ));

        let config = BusConfig::default().with_request_timeout(Duration::ZERO);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_limits_rejected() {
        assert!(BusConfig::default()
            .with_max_plugin_depth(0)
            .validate()
            .is_err());
        assert!(BusConfig::default()
            .with_resource_quota(0)
            .validate()
            .is_err());
    }

    #[test]
    fn test_builder_methods() {
        let config = BusConfig::default()
            .with_multi_channel(true)
            .with_intent_timeout(Duration::from_millis(250))
            .with_resource_quota(100)
            .with_debug(true);

        assert_eq!(config.channel_mode(), ChannelMode::MultiChannel);
        assert_eq!(config.intent_timeout_ms, 250);
        assert_eq!(config.resource_quota, Some(100));
        assert!(config.debug);
    }

    #[test]
    fn test_deserialize_partial() {
        let config: BusConfig =
            serde_json::from_str(r#"{"multi_channel": true, "max_plugin_depth": 4}"#).unwrap();
        assert!(config.multi_channel);
        assert_eq!(config.max_plugin_depth, 4);
        assert_eq!(config.request_timeout_ms, DEFAULT_REQUEST_TIMEOUT_MS);
    }
}
