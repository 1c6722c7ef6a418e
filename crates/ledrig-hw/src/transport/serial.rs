//! Directly attached rig over a serial port.

use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::Mutex;
use tokio_serial::{DataBits, Parity, SerialPortBuilderExt, SerialStream, StopBits};
use tracing::{debug, info};

use super::{LinkHealth, LinkStatus, Received, Transport, TransportKind};
use crate::protocol::{DeviceEvent, Frame, FrameDecoder};
use crate::{Error, Result};

/// Default baud rate of the rig firmware.
pub const DEFAULT_BAUD_RATE: u32 = 9600;

struct SerialReader {
    half: ReadHalf<SerialStream>,
    decoder: FrameDecoder,
}

/// Serial port transport.
pub struct SerialTransport {
    port_path: String,
    baud_rate: u32,
    timeout: Duration,
    reader: Mutex<Option<SerialReader>>,
    writer: Mutex<Option<WriteHalf<SerialStream>>>,
    health: LinkHealth,
}

impl SerialTransport {
    /// Creates a serial transport; the port is opened by [`Transport::open`].
    pub fn new(port_path: &str, baud_rate: u32, timeout: Duration) -> Self {
        Self {
            port_path: port_path.to_string(),
            baud_rate,
            timeout,
            reader: Mutex::new(None),
            writer: Mutex::new(None),
            health: LinkHealth::default(),
        }
    }

    fn open_port(&self) -> Result<SerialStream> {
        tokio_serial::new(&self.port_path, self.baud_rate)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .open_native_async()
            .map_err(|e| {
                // Check if the error is due to device not existing
                if let tokio_serial::ErrorKind::Io(kind) = &e.kind {
                    if *kind == std::io::ErrorKind::NotFound
                        || *kind == std::io::ErrorKind::PermissionDenied
                    {
                        if !std::path::Path::new(&self.port_path).exists() {
                            return Error::DeviceNotFound(self.port_path.clone());
                        }
                    }
                }
                if e.kind == tokio_serial::ErrorKind::NoDevice {
                    return Error::DeviceNotFound(self.port_path.clone());
                }
                Error::Serial(e)
            })
    }
}

/// Writes one encoded frame and flushes it to the OS queue.
pub(crate) async fn write_frame<W>(writer: &mut W, frame: &Frame, timeout: Duration) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let bytes = frame.to_bytes();
    debug!("Writing frame seq={} ({} bytes)", frame.seq, bytes.len());
    tokio::time::timeout(timeout, async {
        // Write all bytes at once, then flush
        writer.write_all(&bytes).await?;
        writer.flush().await
    })
    .await??;
    Ok(())
}

/// Reads until a full frame is decoded or `timeout` passes.
pub(crate) async fn read_frame<R>(
    reader: &mut R,
    decoder: &mut FrameDecoder,
    timeout: Duration,
) -> Result<Received>
where
    R: AsyncRead + Unpin,
{
    let deadline = tokio::time::Instant::now() + timeout;
    let mut buf = [0u8; 256];
    loop {
        if let Some(frame) = decoder.next_frame() {
            return Ok(Received::Frame(frame));
        }
        match tokio::time::timeout_at(deadline, reader.read(&mut buf)).await {
            Err(_) => return Ok(Received::Timeout),
            Ok(Ok(0)) => return Err(Error::Closed),
            Ok(Ok(n)) => decoder.extend(&buf[..n]),
            Ok(Err(e)) => return Err(e.into()),
        }
    }
}

#[async_trait]
impl Transport for SerialTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Serial
    }

    fn endpoint(&self) -> String {
        self.port_path.clone()
    }

    fn status(&self) -> LinkStatus {
        self.health.status()
    }

    async fn open(&self) -> Result<()> {
        let port = self.open_port()?;
        let (read_half, write_half) = tokio::io::split(port);
        *self.reader.lock().await = Some(SerialReader {
            half: read_half,
            decoder: FrameDecoder::new(),
        });
        *self.writer.lock().await = Some(write_half);
        self.health.set(LinkStatus::Open);
        info!("Serial port {} opened at {} baud", self.port_path, self.baud_rate);
        Ok(())
    }

    async fn send(&self, frame: &Frame) -> Result<Option<DeviceEvent>> {
        self.health.check()?;
        let mut guard = self.writer.lock().await;
        let writer = guard.as_mut().ok_or(Error::NotOpen)?;
        let result = write_frame(writer, frame, self.timeout).await;
        self.health.track(&self.port_path, result)?;
        Ok(None)
    }

    async fn recv(&self) -> Result<Received> {
        self.health.check()?;
        let mut guard = self.reader.lock().await;
        let reader = guard.as_mut().ok_or(Error::NotOpen)?;
        let result = read_frame(&mut reader.half, &mut reader.decoder, self.timeout).await;
        self.health.track(&self.port_path, result)
    }

    async fn close(&self) -> Result<()> {
        let had_port = self.writer.lock().await.take().is_some();
        self.reader.lock().await.take();
        self.health.set(LinkStatus::Closed);
        if had_port {
            info!("Serial port {} closed", self.port_path);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{decode, Color, Command};

    #[tokio::test]
    async fn test_write_frame_writes_encoded_bytes() {
        let (mut host, mut device) = tokio::io::duplex(64);
        let frame = Frame::from_command(7, &Command::Fill { color: Color::RED });
        write_frame(&mut host, &frame, Duration::from_secs(1))
            .await
            .unwrap();

        let mut buf = vec![0u8; frame.to_bytes().len()];
        device.read_exact(&mut buf).await.unwrap();
        assert_eq!(decode(&buf).unwrap(), frame);
    }

    #[tokio::test]
    async fn test_read_frame_across_chunks() {
        let (mut host, mut device) = tokio::io::duplex(64);
        let bytes = Frame::ack(3).to_bytes();
        let (head, tail) = bytes.split_at(4);
        device.write_all(head).await.unwrap();

        let mut decoder = FrameDecoder::new();
        let pending = read_frame(&mut host, &mut decoder, Duration::from_millis(20))
            .await
            .unwrap();
        assert_eq!(pending, Received::Timeout);

        device.write_all(tail).await.unwrap();
        let received = read_frame(&mut host, &mut decoder, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(received, Received::Frame(Frame::ack(3)));
    }

    #[tokio::test]
    async fn test_read_frame_reports_eof() {
        let (mut host, device) = tokio::io::duplex(64);
        drop(device);
        let mut decoder = FrameDecoder::new();
        let result = read_frame(&mut host, &mut decoder, Duration::from_secs(1)).await;
        assert!(matches!(result, Err(Error::Closed)));
    }

    #[tokio::test]
    async fn test_open_missing_port() {
        let transport = SerialTransport::new(
            "/dev/ledrig-does-not-exist",
            DEFAULT_BAUD_RATE,
            Duration::from_millis(100),
        );
        assert!(transport.open().await.is_err());
        assert_eq!(transport.status(), LinkStatus::Closed);
        let frame = Frame::from_command(1, &Command::Ping);
        assert!(matches!(transport.send(&frame).await, Err(Error::NotOpen)));
    }
}
