//! Relay server.
//!
//! Bridges remote HTTP and WebSocket clients to one locally attached serial
//! rig. All writes go through the [`gate::Gate`], so at most one frame is in
//! flight on the serial line. Device events are fanned out to every WebSocket
//! client; HTTP clients only see the ack of their own write.

mod backoff;
mod gate;

pub use backoff::Backoff;

use axum::{
    body::Bytes,
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures::{SinkExt, StreamExt};
use ledrig_hw::transport::Transport;
use ledrig_hw::{decode, CodecError, DeviceEvent, Frame, FrameMessage};
use serde::Serialize;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tower_http::cors::CorsLayer;
use tracing::{debug, info, warn};

use gate::{ForwardRequest, Gate, RoutedEvent};

/// Capacity of the device event fan-out channel.
const EVENT_CAPACITY: usize = 256;

/// Relay tuning.
#[derive(Debug, Clone)]
pub struct RelaySettings {
    /// How long `POST /command` waits for the device ack.
    pub ack_timeout: Duration,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
}

/// Errors reported to relay clients as `{"error":"<kind>"}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayError {
    DeviceUnavailable,
    Codec(CodecError),
    OutOfOrder,
    BadRequest(String),
}

impl RelayError {
    pub fn kind(&self) -> &'static str {
        match self {
            RelayError::DeviceUnavailable => "device_unavailable",
            RelayError::Codec(e) => e.kind(),
            RelayError::OutOfOrder => "out_of_order",
            RelayError::BadRequest(_) => "bad_request",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            RelayError::DeviceUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::BAD_REQUEST,
        }
    }

    fn event(&self) -> DeviceEvent {
        DeviceEvent::error(self.kind())
    }
}

impl std::fmt::Display for RelayError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RelayError::Codec(e) => write!(f, "{}", e),
            RelayError::BadRequest(detail) => write!(f, "bad request: {}", detail),
            other => f.write_str(other.kind()),
        }
    }
}

impl From<CodecError> for RelayError {
    fn from(e: CodecError) -> Self {
        RelayError::Codec(e)
    }
}

impl IntoResponse for RelayError {
    fn into_response(self) -> Response {
        (self.status(), Json(self.event())).into_response()
    }
}

/// Shared state handed to every request handler.
#[derive(Clone)]
pub struct RelayState {
    requests: mpsc::Sender<ForwardRequest>,
    available: tokio::sync::watch::Receiver<bool>,
    events: broadcast::Sender<RoutedEvent>,
    clients: Arc<AtomicUsize>,
    next_client: Arc<AtomicU64>,
    ack_timeout: Duration,
}

impl RelayState {
    /// Queues a frame on the gate and waits for it to be written. Returns the
    /// link sequence number the frame went out under.
    async fn forward(&self, frame: Frame) -> Result<u32, RelayError> {
        let (reply, rx) = oneshot::channel();
        self.requests
            .send(ForwardRequest { frame, reply })
            .await
            .map_err(|_| RelayError::DeviceUnavailable)?;
        match rx.await {
            Ok(Ok(link_seq)) => Ok(link_seq),
            _ => Err(RelayError::DeviceUnavailable),
        }
    }

    fn device_available(&self) -> bool {
        *self.available.borrow()
    }
}

/// A running relay: the serial gate plus the state for the HTTP front.
pub struct Relay {
    state: RelayState,
    gate: Gate,
}

impl Relay {
    /// Starts the serial gate for `transport`.
    pub fn spawn(transport: Arc<dyn Transport>, settings: RelaySettings) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let backoff = Backoff::new(settings.backoff_base, settings.backoff_cap);
        let gate = Gate::spawn(transport, events.clone(), backoff);
        let state = RelayState {
            requests: gate.requests.clone(),
            available: gate.available.clone(),
            events,
            clients: Arc::new(AtomicUsize::new(0)),
            next_client: Arc::new(AtomicU64::new(1)),
            ack_timeout: settings.ack_timeout,
        };
        Self { state, gate }
    }

    /// Router with `POST /command`, `GET /ws` and `GET /health`.
    pub fn router(&self) -> Router {
        create_router(self.state.clone())
    }

    /// Stops the gate and its serial reader, waiting for both to exit.
    pub async fn shutdown(self) {
        self.gate.shutdown().await;
    }
}

/// Creates the relay router.
pub fn create_router(state: RelayState) -> Router {
    Router::new()
        .route("/command", post(command))
        .route("/ws", get(ws_upgrade))
        .route("/health", get(health))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Parses a relay JSON message into a validated command frame.
fn parse_message(body: &[u8]) -> Result<Frame, RelayError> {
    let message: FrameMessage =
        serde_json::from_slice(body).map_err(|e| RelayError::BadRequest(e.to_string()))?;
    let frame = message.into_frame()?;
    validate(&frame)?;
    Ok(frame)
}

/// Only well-formed host commands may reach the device.
fn validate(frame: &Frame) -> Result<(), RelayError> {
    frame.command()?;
    Ok(())
}

/// POST /command - forward one frame and wait for its ack
async fn command(State(state): State<RelayState>, body: Bytes) -> Response {
    let frame = match parse_message(&body) {
        Ok(frame) => frame,
        Err(e) => {
            debug!("Rejecting HTTP command: {}", e);
            return e.into_response();
        }
    };
    let seq = frame.seq;

    // Subscribe before writing so the ack cannot slip past.
    let mut events = state.events.subscribe();
    let link_seq = match state.forward(frame).await {
        Ok(link_seq) => link_seq,
        Err(e) => return e.into_response(),
    };

    let ack = tokio::time::timeout(state.ack_timeout, async {
        loop {
            match events.recv().await {
                Ok(routed) if routed.link_seq == Some(link_seq) => return Some(routed.event),
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    })
    .await
    .ok()
    .flatten();

    let event = ack.unwrap_or_else(|| {
        debug!("No ack for seq={} within {:?}", seq, state.ack_timeout);
        DeviceEvent::Ack { ack: false, seq }
    });
    (StatusCode::OK, Json(event)).into_response()
}

#[derive(Serialize)]
struct HealthResponse {
    device: &'static str,
    clients: usize,
}

/// GET /health - device availability and connected WebSocket clients
async fn health(State(state): State<RelayState>) -> impl IntoResponse {
    Json(HealthResponse {
        device: if state.device_available() {
            "available"
        } else {
            "unavailable"
        },
        clients: state.clients.load(Ordering::Acquire),
    })
}

/// GET /ws - relay session over WebSocket
async fn ws_upgrade(ws: WebSocketUpgrade, State(state): State<RelayState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Per-client bookkeeping for a WebSocket relay session.
struct RelaySession {
    id: u64,
    last_seq: Option<u32>,
}

impl RelaySession {
    /// Rejects frames whose sequence number goes backwards.
    fn admit(&mut self, frame: &Frame) -> Result<(), RelayError> {
        if self.last_seq.is_some_and(|last| frame.seq < last) {
            return Err(RelayError::OutOfOrder);
        }
        self.last_seq = Some(frame.seq);
        Ok(())
    }
}

async fn handle_socket(socket: WebSocket, state: RelayState) {
    let mut session = RelaySession {
        id: state.next_client.fetch_add(1, Ordering::AcqRel),
        last_seq: None,
    };
    let clients = state.clients.fetch_add(1, Ordering::AcqRel) + 1;
    info!("Relay client {} connected ({} total)", session.id, clients);

    let (mut sink, mut stream) = socket.split();
    let (reply_tx, mut reply_rx) = mpsc::channel::<DeviceEvent>(32);
    let mut events = state.events.subscribe();
    let client_id = session.id;

    // Writer: this client's error replies plus every device event.
    let writer = tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                reply = reply_rx.recv() => match reply {
                    Some(event) => event,
                    None => break,
                },
                event = events.recv() => match event {
                    Ok(routed) => routed.event,
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!("Relay client {} lagged, dropped {} events", client_id, missed);
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            };
            let text = match serde_json::to_string(&event) {
                Ok(text) => text,
                Err(e) => {
                    warn!("Cannot encode event: {}", e);
                    continue;
                }
            };
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    while let Some(message) = stream.next().await {
        let frame = match message {
            Ok(Message::Text(text)) => parse_message(text.as_bytes()),
            Ok(Message::Binary(bytes)) => decode(&bytes)
                .map_err(RelayError::from)
                .and_then(|frame| validate(&frame).map(|()| frame)),
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                debug!("Relay client {} socket error: {}", session.id, e);
                break;
            }
        };

        let result = match frame {
            Ok(frame) => match session.admit(&frame) {
                Ok(()) => state.forward(frame).await.map(|_| ()),
                Err(e) => Err(e),
            },
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            debug!("Relay client {} request failed: {}", session.id, e);
            if reply_tx.send(e.event()).await.is_err() {
                break;
            }
        }
    }

    drop(reply_tx);
    writer.abort();
    let _ = writer.await;
    let clients = state.clients.fetch_sub(1, Ordering::AcqRel) - 1;
    info!("Relay client {} disconnected ({} remaining)", session.id, clients);
}
