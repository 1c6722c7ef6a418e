//! Stateless HTTP client for a relay's `POST /command` endpoint.

use async_trait::async_trait;
use reqwest::StatusCode;
use std::time::Duration;
use tracing::{debug, info};

use super::{LinkHealth, LinkStatus, Received, Transport, TransportKind};
use crate::protocol::{DeviceEvent, Frame, FrameMessage};
use crate::{Error, Result};

/// HTTP relay transport.
pub struct HttpTransport {
    base_url: String,
    timeout: Duration,
    client: reqwest::Client,
    health: LinkHealth,
}

impl HttpTransport {
    /// Creates a transport for the relay at `base_url` (e.g. `http://rig.local:8787`).
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .tcp_keepalive(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            timeout,
            client,
            health: LinkHealth::default(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn post_frame(&self, frame: &Frame) -> Result<DeviceEvent> {
        let response = self
            .client
            .post(self.url("/command"))
            .json(&FrameMessage::from(frame))
            .send()
            .await?;

        let status = response.status();
        match status {
            StatusCode::OK => Ok(response.json::<DeviceEvent>().await?),
            StatusCode::SERVICE_UNAVAILABLE => Err(Error::DeviceUnavailable),
            StatusCode::BAD_REQUEST => {
                let kind = match response.json::<DeviceEvent>().await {
                    Ok(DeviceEvent::Error { error }) => error,
                    _ => "bad_request".to_string(),
                };
                Err(Error::Rejected(kind))
            }
            other => Err(Error::HttpStatus {
                status: other.as_u16(),
                body: response.text().await.unwrap_or_default(),
            }),
        }
    }
}

#[async_trait]
impl Transport for HttpTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Http
    }

    fn endpoint(&self) -> String {
        self.base_url.clone()
    }

    fn status(&self) -> LinkStatus {
        self.health.status()
    }

    fn streams_events(&self) -> bool {
        false
    }

    /// Probes `GET /health` so that an unreachable relay fails at connect time.
    async fn open(&self) -> Result<()> {
        let response = self.client.get(self.url("/health")).send().await?;
        if !response.status().is_success() {
            return Err(Error::HttpStatus {
                status: response.status().as_u16(),
                body: response.text().await.unwrap_or_default(),
            });
        }
        self.health.set(LinkStatus::Open);
        info!("HTTP relay {} reachable", self.base_url);
        Ok(())
    }

    async fn send(&self, frame: &Frame) -> Result<Option<DeviceEvent>> {
        self.health.check()?;
        debug!("POST {} seq={}", self.url("/command"), frame.seq);
        match self.post_frame(frame).await {
            Ok(event) => {
                self.health.success();
                Ok(Some(event))
            }
            // The relay answered; the link itself is fine.
            Err(e @ Error::Rejected(_)) => Err(e),
            Err(e) => {
                self.health.failure(&self.base_url, &e);
                Err(e)
            }
        }
    }

    async fn recv(&self) -> Result<Received> {
        self.health.check()?;
        tokio::time::sleep(self.timeout).await;
        Ok(Received::Timeout)
    }

    async fn close(&self) -> Result<()> {
        self.health.set(LinkStatus::Closed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_is_normalised() {
        let transport = HttpTransport::new("http://127.0.0.1:8787/", Duration::from_secs(1)).unwrap();
        assert_eq!(transport.endpoint(), "http://127.0.0.1:8787");
        assert_eq!(transport.url("/command"), "http://127.0.0.1:8787/command");
        assert!(!transport.streams_events());
    }

    #[tokio::test]
    async fn test_open_unreachable_relay_fails() {
        // Port 9 (discard) is not expected to run an HTTP server.
        let transport = HttpTransport::new("http://127.0.0.1:9", Duration::from_millis(500)).unwrap();
        assert!(transport.open().await.is_err());
        assert_eq!(transport.status(), LinkStatus::Closed);
    }
}
