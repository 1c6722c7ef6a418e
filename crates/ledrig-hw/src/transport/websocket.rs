//! Persistent WebSocket client for a relay's `/ws` endpoint.

use async_trait::async_trait;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use super::{LinkHealth, LinkStatus, Received, Transport, TransportKind};
use crate::protocol::{decode, DeviceEvent, Frame, FrameMessage};
use crate::{Error, Result};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// WebSocket relay transport.
pub struct WebSocketTransport {
    url: String,
    timeout: Duration,
    sink: Mutex<Option<SplitSink<WsStream, Message>>>,
    stream: Mutex<Option<SplitStream<WsStream>>>,
    health: LinkHealth,
}

impl WebSocketTransport {
    /// Creates a transport for the relay socket at `url` (e.g. `ws://rig.local:8787/ws`).
    pub fn new(url: &str, timeout: Duration) -> Self {
        Self {
            url: url.to_string(),
            timeout,
            sink: Mutex::new(None),
            stream: Mutex::new(None),
            health: LinkHealth::default(),
        }
    }

    async fn next_inbound(&self) -> Result<Received> {
        let mut guard = self.stream.lock().await;
        let stream = guard.as_mut().ok_or(Error::NotOpen)?;
        let deadline = tokio::time::Instant::now() + self.timeout;
        loop {
            let message = match tokio::time::timeout_at(deadline, stream.next()).await {
                Err(_) => return Ok(Received::Timeout),
                Ok(None) => return Err(Error::Closed),
                Ok(Some(message)) => message?,
            };
            match message {
                Message::Text(text) => match serde_json::from_str::<DeviceEvent>(&text) {
                    Ok(event) => return Ok(Received::Event(event)),
                    Err(e) => warn!("Dropping undecodable event from {}: {}", self.url, e),
                },
                Message::Binary(bytes) => match decode(&bytes) {
                    Ok(frame) => return Ok(Received::Frame(frame)),
                    Err(e) => warn!("Dropping undecodable binary frame from {}: {}", self.url, e),
                },
                Message::Close(_) => return Err(Error::Closed),
                Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => {}
            }
        }
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::WebSocket
    }

    fn endpoint(&self) -> String {
        self.url.clone()
    }

    fn status(&self) -> LinkStatus {
        self.health.status()
    }

    async fn open(&self) -> Result<()> {
        let (socket, _response) =
            tokio::time::timeout(self.timeout, connect_async(self.url.as_str())).await??;
        let (sink, stream) = socket.split();
        *self.sink.lock().await = Some(sink);
        *self.stream.lock().await = Some(stream);
        self.health.set(LinkStatus::Open);
        info!("WebSocket relay {} connected", self.url);
        Ok(())
    }

    async fn send(&self, frame: &Frame) -> Result<Option<DeviceEvent>> {
        self.health.check()?;
        let text = serde_json::to_string(&FrameMessage::from(frame))?;
        let mut guard = self.sink.lock().await;
        let sink = guard.as_mut().ok_or(Error::NotOpen)?;
        debug!("WebSocket send seq={}", frame.seq);
        let result = tokio::time::timeout(self.timeout, sink.send(Message::Text(text)))
            .await
            .map_err(Error::from)
            .and_then(|r| r.map_err(Error::from));
        self.health.track(&self.url, result)?;
        Ok(None)
    }

    async fn recv(&self) -> Result<Received> {
        self.health.check()?;
        let result = self.next_inbound().await;
        self.health.track(&self.url, result)
    }

    async fn close(&self) -> Result<()> {
        if let Some(mut sink) = self.sink.lock().await.take() {
            if let Err(e) = sink.close().await {
                debug!("WebSocket close handshake failed: {}", e);
            }
            info!("WebSocket relay {} closed", self.url);
        }
        self.stream.lock().await.take();
        self.health.set(LinkStatus::Closed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Command;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_send_before_open() {
        let transport = WebSocketTransport::new("ws://127.0.0.1:9/ws", Duration::from_millis(200));
        let frame = Frame::from_command(1, &Command::Ping);
        assert!(matches!(transport.send(&frame).await, Err(Error::NotOpen)));
        assert!(matches!(transport.recv().await, Err(Error::NotOpen)));
    }

    #[tokio::test]
    async fn test_open_unreachable_fails() {
        let transport = WebSocketTransport::new("ws://127.0.0.1:9/ws", Duration::from_millis(500));
        assert!(transport.open().await.is_err());
        assert_eq!(transport.status(), LinkStatus::Closed);
        // Closing a never-opened transport is a no-op.
        transport.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_inbound_text_binary_and_close() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut socket = tokio_tungstenite::accept_async(stream).await.unwrap();
            for _ in 0..3 {
                socket.send(Message::Text("{not json".to_string())).await.unwrap();
            }
            socket
                .send(Message::Text(r#"{"ack":true,"seq":4}"#.to_string()))
                .await
                .unwrap();
            socket.send(Message::Binary(vec![0xFF; 4])).await.unwrap();
            socket.send(Message::Binary(Frame::ack(6).to_bytes())).await.unwrap();
            socket.close(None).await.unwrap();
        });

        let transport = WebSocketTransport::new(&format!("ws://{}/ws", addr), Duration::from_secs(2));
        transport.open().await.unwrap();

        // Undecodable messages are skipped without counting against the link.
        assert_eq!(
            transport.recv().await.unwrap(),
            Received::Event(DeviceEvent::ack(4))
        );
        assert_eq!(transport.status(), LinkStatus::Open);
        assert_eq!(
            transport.recv().await.unwrap(),
            Received::Frame(Frame::ack(6))
        );
        assert!(matches!(transport.recv().await, Err(Error::Closed)));

        server.await.unwrap();
        transport.close().await.unwrap();
    }
}
