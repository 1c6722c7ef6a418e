//! Transports that carry frames to a rig.
//!
//! Three interchangeable variants implement [`Transport`]: a directly attached
//! serial port, a stateless HTTP relay client and a persistent WebSocket relay
//! client. [`MemoryTransport`] is an in-process stand-in used by tests.
//!
//! Every variant counts consecutive `send`/`recv` failures and reports
//! [`LinkStatus::Failed`] after [`FAILURE_BUDGET`] of them. Retrying is the
//! caller's business.

mod config;
mod http;
pub mod memory;
mod serial;
mod websocket;

pub use config::TransportConfig;
pub use http::HttpTransport;
pub use memory::MemoryTransport;
pub use serial::{SerialTransport, DEFAULT_BAUD_RATE};
pub use websocket::WebSocketTransport;

use async_trait::async_trait;
use std::sync::atomic::{AtomicU32, AtomicU8, Ordering};
use tracing::warn;

use crate::protocol::{DeviceEvent, Frame};
use crate::{Error, Result};

/// Consecutive I/O failures after which a transport reports `Failed`.
pub const FAILURE_BUDGET: u32 = 3;

/// Transport variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Serial,
    Http,
    WebSocket,
    Memory,
}

impl std::fmt::Display for TransportKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportKind::Serial => write!(f, "serial"),
            TransportKind::Http => write!(f, "http"),
            TransportKind::WebSocket => write!(f, "websocket"),
            TransportKind::Memory => write!(f, "memory"),
        }
    }
}

/// Link status as seen by the transport itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LinkStatus {
    Closed = 0,
    Open = 1,
    Failed = 2,
}

/// Result of a `recv` call.
#[derive(Debug, Clone, PartialEq)]
pub enum Received {
    /// A wire frame from the device.
    Frame(Frame),
    /// An event already decoded by a relay.
    Event(DeviceEvent),
    /// Nothing arrived within the receive timeout.
    Timeout,
}

/// Channel to a rig, either direct or through a relay.
///
/// Methods take `&self` so that one reader task can sit in `recv` while
/// writers call `send`; implementations lock their read and write halves
/// separately.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Returns the transport variant.
    fn kind(&self) -> TransportKind;

    /// Human-readable endpoint (port path or URL).
    fn endpoint(&self) -> String;

    /// Returns the current link status.
    fn status(&self) -> LinkStatus;

    /// Whether `recv` yields device traffic. HTTP has no persistent receive.
    fn streams_events(&self) -> bool {
        true
    }

    /// Opens (or reopens) the link. Resets the failure count.
    async fn open(&self) -> Result<()>;

    /// Writes one frame. HTTP returns the event parsed from its response.
    async fn send(&self, frame: &Frame) -> Result<Option<DeviceEvent>>;

    /// Waits up to the receive timeout for the next inbound item.
    async fn recv(&self) -> Result<Received>;

    /// Closes the link. Closing a closed transport is a no-op.
    async fn close(&self) -> Result<()>;
}

/// Consecutive failure counter shared by the transport implementations.
#[derive(Debug, Default)]
pub(crate) struct LinkHealth {
    status: AtomicU8,
    failures: AtomicU32,
}

impl LinkHealth {
    pub(crate) fn status(&self) -> LinkStatus {
        match self.status.load(Ordering::Acquire) {
            1 => LinkStatus::Open,
            2 => LinkStatus::Failed,
            _ => LinkStatus::Closed,
        }
    }

    pub(crate) fn set(&self, status: LinkStatus) {
        self.status.store(status as u8, Ordering::Release);
        if status != LinkStatus::Failed {
            self.failures.store(0, Ordering::Release);
        }
    }

    /// Fails fast when the link is not usable.
    pub(crate) fn check(&self) -> Result<()> {
        match self.status() {
            LinkStatus::Open => Ok(()),
            LinkStatus::Closed => Err(Error::NotOpen),
            LinkStatus::Failed => Err(Error::LinkFailed),
        }
    }

    pub(crate) fn success(&self) {
        self.failures.store(0, Ordering::Release);
    }

    /// Records a failure; returns true when the budget is exhausted.
    pub(crate) fn failure(&self, endpoint: &str, error: &Error) -> bool {
        let count = self.failures.fetch_add(1, Ordering::AcqRel) + 1;
        if count >= FAILURE_BUDGET {
            if self.status() != LinkStatus::Failed {
                warn!(
                    "Link to {} failed after {} consecutive errors (last: {})",
                    endpoint, count, error
                );
            }
            self.status.store(LinkStatus::Failed as u8, Ordering::Release);
            true
        } else {
            warn!("I/O error on {} ({}/{}): {}", endpoint, count, FAILURE_BUDGET, error);
            false
        }
    }

    /// Passes `result` through, updating the counters.
    pub(crate) fn track<T>(&self, endpoint: &str, result: Result<T>) -> Result<T> {
        match &result {
            Ok(_) => self.success(),
            Err(e) => {
                self.failure(endpoint, e);
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_health_fails_after_budget() {
        let health = LinkHealth::default();
        health.set(LinkStatus::Open);
        assert!(!health.failure("test", &Error::Timeout));
        assert!(!health.failure("test", &Error::Timeout));
        assert!(health.failure("test", &Error::Timeout));
        assert_eq!(health.status(), LinkStatus::Failed);
        assert!(matches!(health.check(), Err(Error::LinkFailed)));
    }

    #[test]
    fn test_health_success_resets_count() {
        let health = LinkHealth::default();
        health.set(LinkStatus::Open);
        health.failure("test", &Error::Timeout);
        health.failure("test", &Error::Timeout);
        health.success();
        assert!(!health.failure("test", &Error::Timeout));
        assert_eq!(health.status(), LinkStatus::Open);
    }

    #[test]
    fn test_health_reopen_clears_failure() {
        let health = LinkHealth::default();
        assert!(matches!(health.check(), Err(Error::NotOpen)));
        health.set(LinkStatus::Open);
        for _ in 0..FAILURE_BUDGET {
            health.failure("test", &Error::Timeout);
        }
        health.set(LinkStatus::Open);
        assert!(health.check().is_ok());
    }
}
