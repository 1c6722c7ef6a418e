//! Declarative transport selection.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use super::serial::DEFAULT_BAUD_RATE;
use super::{HttpTransport, SerialTransport, Transport, WebSocketTransport};
use crate::{Error, Result};

fn default_baud() -> u32 {
    DEFAULT_BAUD_RATE
}

fn default_timeout_ms() -> u64 {
    1000
}

/// Transport settings, tagged by `kind`.
///
/// ```toml
/// kind = "serial"
/// port = "/dev/ttyUSB0"
/// baud = 115200
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TransportConfig {
    Serial {
        port: String,
        #[serde(default = "default_baud")]
        baud: u32,
        #[serde(default = "default_timeout_ms")]
        timeout_ms: u64,
    },
    Http {
        url: String,
        #[serde(default = "default_timeout_ms")]
        timeout_ms: u64,
    },
    #[serde(rename = "websocket")]
    WebSocket {
        url: String,
        #[serde(default = "default_timeout_ms")]
        timeout_ms: u64,
    },
}

impl TransportConfig {
    /// Serial settings with default baud rate and timeout.
    pub fn serial(port: &str) -> Self {
        TransportConfig::Serial {
            port: port.to_string(),
            baud: DEFAULT_BAUD_RATE,
            timeout_ms: default_timeout_ms(),
        }
    }

    /// Builds the configured transport. The link is not opened.
    pub fn build(&self) -> Result<Arc<dyn Transport>> {
        let transport: Arc<dyn Transport> = match self {
            TransportConfig::Serial {
                port,
                baud,
                timeout_ms,
            } => {
                if port.is_empty() {
                    return Err(Error::Config("serial port path is empty".into()));
                }
                if *baud == 0 {
                    return Err(Error::Config("baud rate must be positive".into()));
                }
                Arc::new(SerialTransport::new(
                    port,
                    *baud,
                    Duration::from_millis(*timeout_ms),
                ))
            }
            TransportConfig::Http { url, timeout_ms } => {
                if !(url.starts_with("http://") || url.starts_with("https://")) {
                    return Err(Error::Config(format!("not an http(s) URL: {}", url)));
                }
                Arc::new(HttpTransport::new(url, Duration::from_millis(*timeout_ms))?)
            }
            TransportConfig::WebSocket { url, timeout_ms } => {
                if !(url.starts_with("ws://") || url.starts_with("wss://")) {
                    return Err(Error::Config(format!("not a ws(s) URL: {}", url)));
                }
                Arc::new(WebSocketTransport::new(
                    url,
                    Duration::from_millis(*timeout_ms),
                ))
            }
        };
        Ok(transport)
    }
}
