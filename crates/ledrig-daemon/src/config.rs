//! Configuration management.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::relay::RelaySettings;

/// Main configuration structure.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    /// Relay front end
    #[serde(default)]
    pub relay: RelayConfig,

    /// Locally attached rig
    #[serde(default)]
    pub serial: SerialConfig,

    /// Serial reconnect backoff
    #[serde(default)]
    pub backoff: BackoffConfig,
}

/// Relay server configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Listen address (e.g., "0.0.0.0:8787")
    #[serde(default = "default_listen")]
    pub listen: String,

    /// How long an HTTP command waits for the device ack, in milliseconds
    #[serde(default = "default_ack_timeout")]
    pub ack_timeout_ms: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            ack_timeout_ms: default_ack_timeout(),
        }
    }
}

/// Serial port configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerialConfig {
    /// Serial port path
    #[serde(default = "default_port")]
    pub port: String,

    #[serde(default = "default_baud")]
    pub baud: u32,

    /// Read/write timeout in milliseconds
    #[serde(default = "default_timeout")]
    pub timeout_ms: u64,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            baud: default_baud(),
            timeout_ms: default_timeout(),
        }
    }
}

/// Reconnect backoff configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffConfig {
    #[serde(default = "default_backoff_base")]
    pub base_ms: u64,

    #[serde(default = "default_backoff_cap")]
    pub cap_ms: u64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_ms: default_backoff_base(),
            cap_ms: default_backoff_cap(),
        }
    }
}

// Default value functions
fn default_listen() -> String {
    "0.0.0.0:8787".to_string()
}

fn default_ack_timeout() -> u64 {
    500
}

fn default_port() -> String {
    "/dev/ttyUSB0".to_string()
}

fn default_baud() -> u32 {
    ledrig_hw::transport::DEFAULT_BAUD_RATE
}

fn default_timeout() -> u64 {
    1000
}

fn default_backoff_base() -> u64 {
    500
}

fn default_backoff_cap() -> u64 {
    10_000
}

impl Config {
    /// Loads configuration from a TOML file. A missing file yields defaults.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path).context("Failed to read configuration file")?;
        let config: Config = toml::from_str(&content).context("Failed to parse configuration")?;
        Ok(config)
    }

    /// Relay tuning derived from the configuration.
    pub fn relay_settings(&self) -> RelaySettings {
        RelaySettings {
            ack_timeout: Duration::from_millis(self.relay.ack_timeout_ms),
            backoff_base: Duration::from_millis(self.backoff.base_ms),
            backoff_cap: Duration::from_millis(self.backoff.cap_ms),
        }
    }

    /// Serial timeout as a duration.
    pub fn serial_timeout(&self) -> Duration {
        Duration::from_millis(self.serial.timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_file_uses_defaults() {
        let config: Config = toml::from_str(
            r#"
            [serial]
            port = "/dev/ttyACM0"
            baud = 115200
            "#,
        )
        .unwrap();
        assert_eq!(config.serial.port, "/dev/ttyACM0");
        assert_eq!(config.serial.baud, 115200);
        assert_eq!(config.serial.timeout_ms, 1000);
        assert_eq!(config.relay, RelayConfig::default());
        assert_eq!(config.relay.listen, "0.0.0.0:8787");
    }

    #[test]
    fn test_relay_settings() {
        let config: Config = toml::from_str(
            r#"
            [relay]
            ack_timeout_ms = 250

            [backoff]
            base_ms = 100
            cap_ms = 1000
            "#,
        )
        .unwrap();
        let settings = config.relay_settings();
        assert_eq!(settings.ack_timeout, Duration::from_millis(250));
        assert_eq!(settings.backoff_base, Duration::from_millis(100));
        assert_eq!(settings.backoff_cap, Duration::from_secs(1));
    }

    #[test]
    fn test_missing_file_is_default() {
        let config = Config::load("/nonexistent/ledrigd.toml").unwrap();
        assert_eq!(config, Config::default());
    }
}
