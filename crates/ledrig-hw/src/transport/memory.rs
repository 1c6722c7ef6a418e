//! In-process transport for tests and dry runs.
//!
//! Records every written frame, can be scripted to fail, and optionally
//! answers each command with an acknowledgement like the rig firmware does.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tracing::debug;

use super::{LinkHealth, LinkStatus, Received, Transport, TransportKind};
use crate::protocol::{decode, DeviceEvent, Frame};
use crate::{Error, Result};

/// Memory-backed transport.
pub struct MemoryTransport {
    name: String,
    timeout: Duration,
    streams: bool,
    auto_ack: AtomicBool,
    written: Mutex<Vec<Vec<u8>>>,
    write_delay: Mutex<Duration>,
    fail_sends: AtomicU32,
    fail_opens: AtomicU32,
    fail_recvs: AtomicU32,
    send_attempts: AtomicU32,
    opens: AtomicU32,
    in_flight: AtomicBool,
    overlapped: AtomicBool,
    inbound_tx: mpsc::UnboundedSender<Received>,
    inbound_rx: AsyncMutex<mpsc::UnboundedReceiver<Received>>,
    health: LinkHealth,
}

impl MemoryTransport {
    pub fn new(name: &str) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        Self {
            name: name.to_string(),
            timeout: Duration::from_millis(50),
            streams: true,
            auto_ack: AtomicBool::new(false),
            written: Mutex::new(Vec::new()),
            write_delay: Mutex::new(Duration::ZERO),
            fail_sends: AtomicU32::new(0),
            fail_opens: AtomicU32::new(0),
            fail_recvs: AtomicU32::new(0),
            send_attempts: AtomicU32::new(0),
            opens: AtomicU32::new(0),
            in_flight: AtomicBool::new(false),
            overlapped: AtomicBool::new(false),
            inbound_tx,
            inbound_rx: AsyncMutex::new(inbound_rx),
            health: LinkHealth::default(),
        }
    }

    /// Behaves like HTTP: no receive stream, acks returned from `send`.
    pub fn request_response(mut self) -> Self {
        self.streams = false;
        self
    }

    /// Sets the receive timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Answers every successful write with an ack for its sequence number.
    pub fn with_auto_ack(self) -> Self {
        self.auto_ack.store(true, Ordering::Release);
        self
    }

    /// Makes the next `n` writes fail.
    pub fn fail_next_sends(&self, n: u32) {
        self.fail_sends.store(n, Ordering::Release);
    }

    /// Makes the next `n` opens fail.
    pub fn fail_next_opens(&self, n: u32) {
        self.fail_opens.store(n, Ordering::Release);
    }

    /// Holds each write for `delay`, to widen race windows in tests.
    /// Makes the next `n` reads fail.
    pub fn fail_next_recvs(&self, n: u32) {
        self.fail_recvs.store(n, Ordering::Release);
    }

    pub fn set_write_delay(&self, delay: Duration) {
        *self.write_delay.lock().unwrap_or_else(|e| e.into_inner()) = delay;
    }

    /// Queues an inbound item for `recv`.
    pub fn push_inbound(&self, item: Received) {
        let _ = self.inbound_tx.send(item);
    }

    /// Successfully written frames, in write order.
    pub fn written(&self) -> Vec<Frame> {
        self.written_bytes()
            .iter()
            .filter_map(|bytes| decode(bytes).ok())
            .collect()
    }

    /// Raw bytes of each successful write.
    pub fn written_bytes(&self) -> Vec<Vec<u8>> {
        self.written.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Number of writes attempted while the link was open.
    pub fn send_attempts(&self) -> u32 {
        self.send_attempts.load(Ordering::Acquire)
    }

    /// Number of successful opens.
    pub fn opens(&self) -> u32 {
        self.opens.load(Ordering::Acquire)
    }

    /// True if two writes were ever in progress at the same time.
    pub fn saw_overlapping_writes(&self) -> bool {
        self.overlapped.load(Ordering::Acquire)
    }

    fn take_scripted_failure(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Memory
    }

    fn endpoint(&self) -> String {
        format!("memory:{}", self.name)
    }

    fn status(&self) -> LinkStatus {
        self.health.status()
    }

    fn streams_events(&self) -> bool {
        self.streams
    }

    async fn open(&self) -> Result<()> {
        if Self::take_scripted_failure(&self.fail_opens) {
            return Err(Error::DeviceNotFound(self.endpoint()));
        }
        self.opens.fetch_add(1, Ordering::AcqRel);
        self.health.set(LinkStatus::Open);
        Ok(())
    }

    async fn send(&self, frame: &Frame) -> Result<Option<DeviceEvent>> {
        self.health.check()?;
        self.send_attempts.fetch_add(1, Ordering::AcqRel);

        if self.in_flight.swap(true, Ordering::AcqRel) {
            self.overlapped.store(true, Ordering::Release);
        }
        let delay = *self.write_delay.lock().unwrap_or_else(|e| e.into_inner());
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        let failed = Self::take_scripted_failure(&self.fail_sends);
        if !failed {
            self.written
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push(frame.to_bytes());
        }
        self.in_flight.store(false, Ordering::Release);

        if failed {
            let error = Error::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "scripted write failure",
            ));
            self.health.failure(&self.name, &error);
            return Err(error);
        }
        self.health.success();
        debug!("{} accepted frame seq={}", self.endpoint(), frame.seq);

        let ack = self.auto_ack.load(Ordering::Acquire) && frame.opcode.is_command();
        if !ack {
            return Ok(None);
        }
        if self.streams {
            self.push_inbound(Received::Frame(Frame::ack(frame.seq)));
            Ok(None)
        } else {
            Ok(Some(DeviceEvent::ack(frame.seq)))
        }
    }

    async fn recv(&self) -> Result<Received> {
        self.health.check()?;
        if Self::take_scripted_failure(&self.fail_recvs) {
            let error = Error::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionReset,
                "scripted read failure",
            ));
            self.health.failure(&self.name, &error);
            return Err(error);
        }
        let mut inbound = self.inbound_rx.lock().await;
        match tokio::time::timeout(self.timeout, inbound.recv()).await {
            Err(_) => Ok(Received::Timeout),
            Ok(Some(item)) => Ok(item),
            Ok(None) => Err(Error::Closed),
        }
    }

    async fn close(&self) -> Result<()> {
        self.health.set(LinkStatus::Closed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Command;

    #[tokio::test]
    async fn test_records_writes() {
        let transport = MemoryTransport::new("rig");
        transport.open().await.unwrap();
        let frame = Frame::from_command(1, &Command::Clear);
        transport.send(&frame).await.unwrap();
        assert_eq!(transport.written(), vec![frame]);
        assert_eq!(transport.send_attempts(), 1);
    }

    #[tokio::test]
    async fn test_scripted_failures_exhaust_budget() {
        let transport = MemoryTransport::new("rig");
        transport.open().await.unwrap();
        transport.fail_next_sends(3);
        let frame = Frame::from_command(1, &Command::Ping);
        for _ in 0..3 {
            assert!(transport.send(&frame).await.is_err());
        }
        assert_eq!(transport.status(), LinkStatus::Failed);
        assert!(matches!(transport.send(&frame).await, Err(Error::LinkFailed)));
        assert_eq!(transport.send_attempts(), 3);
        assert!(transport.written().is_empty());
    }

    #[tokio::test]
    async fn test_scripted_read_failures() {
        let transport = MemoryTransport::new("rig");
        transport.open().await.unwrap();
        transport.fail_next_recvs(3);
        for _ in 0..3 {
            assert!(matches!(transport.recv().await, Err(Error::Io(_))));
        }
        assert_eq!(transport.status(), LinkStatus::Failed);
        transport.open().await.unwrap();
        assert_eq!(transport.recv().await.unwrap(), Received::Timeout);
    }

    #[tokio::test]
    async fn test_auto_ack_streams_ack() {
        let transport = MemoryTransport::new("rig").with_auto_ack();
        transport.open().await.unwrap();
        transport
            .send(&Frame::from_command(9, &Command::Ping))
            .await
            .unwrap();
        assert_eq!(
            transport.recv().await.unwrap(),
            Received::Frame(Frame::ack(9))
        );
        assert_eq!(transport.recv().await.unwrap(), Received::Timeout);
    }

    #[tokio::test]
    async fn test_request_response_acks_inline() {
        let transport = MemoryTransport::new("rig").request_response().with_auto_ack();
        transport.open().await.unwrap();
        let event = transport
            .send(&Frame::from_command(4, &Command::Clear))
            .await
            .unwrap();
        assert_eq!(event, Some(DeviceEvent::ack(4)));
    }
}
