//! Device controller.
//!
//! The controller owns exactly one active transport, assigns sequence numbers,
//! retries failed writes within a fixed budget and publishes connection state
//! changes and device events on a broadcast channel.

use ledrig_hw::transport::{LinkStatus, Received, Transport};
use ledrig_hw::{Command, DeviceEvent, Frame, TransportConfig};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::{Stream, StreamExt};
use tracing::{debug, info, warn};

use crate::animation::AnimationEvent;

/// Write attempts per command: the original write plus two reopen-and-resend retries.
pub const SEND_ATTEMPTS: u32 = 3;

/// Pause before each automatic reopen.
pub const RETRY_DELAY: Duration = Duration::from_millis(200);

/// Capacity of the event channel. Slow subscribers lose the oldest events.
pub const EVENT_CAPACITY: usize = 64;

/// Entries kept in the sent-command log.
pub const SENT_LOG_CAPACITY: usize = 256;

/// Connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Failed,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Opening the transport failed; the controller stays disconnected.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("connect failed: {reason}")]
pub struct ConnectError {
    pub reason: String,
}

/// Errors returned by [`DeviceController::send`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SendError {
    #[error("not connected")]
    NotConnected,

    /// The write failed and the retry budget ran out.
    #[error("transport failure: {0}")]
    TransportFailure(String),

    /// A relay answered but refused the command.
    #[error("rejected by relay: {0}")]
    Rejected(String),
}

/// Something a subscriber can observe.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum Event {
    State(ConnectionState),
    Device(DeviceEvent),
    Animation(AnimationEvent),
}

/// A successfully written command.
#[derive(Debug, Clone, PartialEq)]
pub struct SentCommand {
    pub seq: u32,
    pub command: Command,
    pub at: Instant,
}

/// Subscription to controller events.
pub struct EventStream {
    rx: broadcast::Receiver<Event>,
}

impl EventStream {
    /// Waits for the next event. Returns `None` once the controller is gone.
    pub async fn recv(&mut self) -> Option<Event> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(RecvError::Lagged(missed)) => {
                    debug!("Event subscriber lagged, dropped {} oldest events", missed);
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }

    /// Like [`recv`](Self::recv) but gives up after `timeout`.
    pub async fn recv_timeout(&mut self, timeout: Duration) -> Option<Event> {
        tokio::time::timeout(timeout, self.recv()).await.ok().flatten()
    }

    /// Adapts the subscription into a `Stream`, skipping lag notices.
    pub fn into_stream(self) -> impl Stream<Item = Event> {
        BroadcastStream::new(self.rx).filter_map(|item| item.ok())
    }
}

struct Link {
    transport: Arc<dyn Transport>,
    reader: Option<JoinHandle<()>>,
}

impl Link {
    fn start_reader(&mut self, inner: &Arc<Inner>) {
        if self.transport.streams_events() {
            let transport = self.transport.clone();
            let inner = Arc::downgrade(inner);
            self.reader = Some(tokio::spawn(read_loop(transport, inner)));
        }
    }

    async fn stop_reader(&mut self) {
        if let Some(handle) = self.reader.take() {
            handle.abort();
            let _ = handle.await;
        }
    }

    /// Waits out the retry delay, then closes and reopens the transport.
    async fn reopen(&mut self, inner: &Arc<Inner>) -> ledrig_hw::Result<()> {
        tokio::time::sleep(RETRY_DELAY).await;
        self.stop_reader().await;
        let _ = self.transport.close().await;
        self.transport.open().await?;
        self.start_reader(inner);
        Ok(())
    }

    async fn shutdown(mut self) {
        self.stop_reader().await;
        if let Err(e) = self.transport.close().await {
            debug!("Closing {} failed: {}", self.transport.endpoint(), e);
        }
    }
}

struct Inner {
    state: Mutex<ConnectionState>,
    link: tokio::sync::Mutex<Option<Link>>,
    next_seq: AtomicU32,
    events: broadcast::Sender<Event>,
    sent: Mutex<VecDeque<SentCommand>>,
}

impl Inner {
    fn state(&self) -> ConnectionState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, state: ConnectionState) {
        let changed = {
            let mut current = self.state.lock().unwrap_or_else(|e| e.into_inner());
            let changed = *current != state;
            *current = state;
            changed
        };
        if changed {
            info!("Connection state: {}", state);
            let _ = self.events.send(Event::State(state));
        }
    }

    /// Moves to `to` only when currently in `from`.
    fn transition(&self, from: ConnectionState, to: ConnectionState) -> bool {
        {
            let mut current = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if *current != from {
                return false;
            }
            *current = to;
        }
        info!("Connection state: {}", to);
        let _ = self.events.send(Event::State(to));
        true
    }

    fn record(&self, seq: u32, command: Command) {
        let mut sent = self.sent.lock().unwrap_or_else(|e| e.into_inner());
        if sent.len() == SENT_LOG_CAPACITY {
            sent.pop_front();
        }
        sent.push_back(SentCommand {
            seq,
            command,
            at: Instant::now(),
        });
    }
}

/// Handle to the device controller. Clones share the same connection.
#[derive(Clone)]
pub struct DeviceController {
    inner: Arc<Inner>,
}

impl Default for DeviceController {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceController {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(ConnectionState::Disconnected),
                link: tokio::sync::Mutex::new(None),
                next_seq: AtomicU32::new(1),
                events,
                sent: Mutex::new(VecDeque::with_capacity(SENT_LOG_CAPACITY)),
            }),
        }
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        self.inner.state()
    }

    /// Builds and opens the configured transport.
    pub async fn connect(&self, config: &TransportConfig) -> Result<(), ConnectError> {
        let transport = config.build().map_err(|e| ConnectError {
            reason: e.to_string(),
        })?;
        self.connect_transport(transport).await
    }

    /// Opens an already-built transport, replacing any current one.
    pub async fn connect_transport(&self, transport: Arc<dyn Transport>) -> Result<(), ConnectError> {
        let mut link = self.inner.link.lock().await;
        if let Some(previous) = link.take() {
            previous.shutdown().await;
        }

        self.inner.set_state(ConnectionState::Connecting);
        match transport.open().await {
            Ok(()) => {
                info!("Connected via {} to {}", transport.kind(), transport.endpoint());
                let mut new_link = Link {
                    transport,
                    reader: None,
                };
                new_link.start_reader(&self.inner);
                *link = Some(new_link);
                self.inner.set_state(ConnectionState::Connected);
                Ok(())
            }
            Err(e) => {
                warn!("Failed to open {}: {}", transport.endpoint(), e);
                self.inner.set_state(ConnectionState::Disconnected);
                Err(ConnectError {
                    reason: e.to_string(),
                })
            }
        }
    }

    /// Closes the transport. Safe to call repeatedly.
    pub async fn disconnect(&self) {
        let previous = self.inner.link.lock().await.take();
        if let Some(link) = previous {
            link.shutdown().await;
        }
        self.inner.set_state(ConnectionState::Disconnected);
    }

    /// Sends a command and returns the sequence number it was written with.
    ///
    /// A failed write moves the state to `Reconnecting` and is retried with
    /// the same sequence number after reopening the transport. Once
    /// [`SEND_ATTEMPTS`] writes have failed the state settles in `Failed`.
    pub async fn send(&self, command: Command) -> Result<u32, SendError> {
        let mut guard = self.inner.link.lock().await;
        if self.inner.state() != ConnectionState::Connected {
            return Err(SendError::NotConnected);
        }
        let link = guard.as_mut().ok_or(SendError::NotConnected)?;

        let seq = self.inner.next_seq.fetch_add(1, Ordering::AcqRel);
        let frame = Frame::from_command(seq, &command);
        let mut attempt = 0;

        loop {
            attempt += 1;
            let reopened = if attempt == 1 {
                Ok(())
            } else {
                link.reopen(&self.inner).await
            };
            let error = match reopened {
                Err(e) => e,
                Ok(()) => match link.transport.send(&frame).await {
                    Ok(event) => {
                        if attempt > 1 {
                            info!("Recovered after {} attempts (seq={})", attempt, seq);
                            self.inner.set_state(ConnectionState::Connected);
                        }
                        self.inner.record(seq, command);
                        if let Some(event) = event {
                            let _ = self.inner.events.send(Event::Device(event));
                        }
                        return Ok(seq);
                    }
                    Err(ledrig_hw::Error::Rejected(kind)) => {
                        // The relay answered, so the link itself is healthy.
                        self.inner.set_state(ConnectionState::Connected);
                        return Err(SendError::Rejected(kind));
                    }
                    Err(e) => e,
                },
            };

            warn!(
                "Write of seq={} failed (attempt {}/{}): {}",
                seq, attempt, SEND_ATTEMPTS, error
            );
            if attempt >= SEND_ATTEMPTS {
                link.stop_reader().await;
                let _ = link.transport.close().await;
                self.inner.set_state(ConnectionState::Failed);
                return Err(SendError::TransportFailure(error.to_string()));
            }
            self.inner.set_state(ConnectionState::Reconnecting);
        }
    }

    /// Subscribes to state changes, device events and animation events.
    pub fn subscribe(&self) -> EventStream {
        EventStream {
            rx: self.inner.events.subscribe(),
        }
    }

    /// Publishes an event to all subscribers without blocking.
    pub fn publish(&self, event: Event) {
        let _ = self.inner.events.send(event);
    }

    /// Recently sent commands, oldest first.
    pub fn sent_log(&self) -> Vec<SentCommand> {
        self.inner
            .sent
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect()
    }
}

/// Reads inbound traffic until the transport stops being usable.
async fn read_loop(transport: Arc<dyn Transport>, inner: Weak<Inner>) {
    let mut last_seq: Option<u32> = None;
    loop {
        let result = transport.recv().await;
        let Some(inner) = inner.upgrade() else {
            return;
        };
        match result {
            Ok(Received::Timeout) => {}
            Ok(Received::Event(event)) => {
                let _ = inner.events.send(Event::Device(event));
            }
            Ok(Received::Frame(frame)) => {
                if last_seq.is_some_and(|last| frame.seq < last) {
                    debug!("Dropping out-of-order frame seq={}", frame.seq);
                    continue;
                }
                last_seq = Some(frame.seq);
                match DeviceEvent::from_frame(&frame) {
                    Ok(event) => {
                        let _ = inner.events.send(Event::Device(event));
                    }
                    Err(e) => warn!("Ignoring frame seq={}: {}", frame.seq, e),
                }
            }
            Err(e) => match transport.status() {
                LinkStatus::Failed => {
                    warn!("Reader on {} stopped: {}", transport.endpoint(), e);
                    inner.transition(ConnectionState::Connected, ConnectionState::Failed);
                    return;
                }
                LinkStatus::Closed => return,
                LinkStatus::Open => debug!("Transient read error: {}", e),
            },
        }
    }
}
