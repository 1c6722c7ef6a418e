//! Wire frame encoding and decoding.
//!
//! Frame layout (little-endian):
//! - seq: u32
//! - opcode: u8
//! - len: u16
//! - payload: `len` bytes
//! - checksum: u16, sum of all preceding bytes mod 65536

use tracing::{debug, warn};

use super::command::{Command, Opcode};
use super::CodecError;

/// Bytes before the payload.
pub const HEADER_SIZE: usize = 7;

/// Trailing checksum size.
pub const CHECKSUM_SIZE: usize = 2;

/// Largest payload accepted on decode.
pub const MAX_PAYLOAD: usize = 512;

/// Streaming decoder buffer limit.
pub const BUFFER_MAX_SIZE: usize = 4096;

/// A single wire frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub seq: u32,
    pub opcode: Opcode,
    pub payload: Vec<u8>,
}

impl Frame {
    /// Builds the frame carrying `command` with sequence number `seq`.
    pub fn from_command(seq: u32, command: &Command) -> Self {
        Self {
            seq,
            opcode: command.opcode(),
            payload: command.payload(),
        }
    }

    /// Builds a device acknowledgement for `seq`.
    pub fn ack(seq: u32) -> Self {
        Self {
            seq,
            opcode: Opcode::Ack,
            payload: Vec::new(),
        }
    }

    /// Decodes the carried command.
    pub fn command(&self) -> Result<Command, CodecError> {
        Command::from_parts(self.opcode, &self.payload)
    }

    /// Serializes the frame to wire bytes.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(HEADER_SIZE + self.payload.len() + CHECKSUM_SIZE);
        bytes.extend_from_slice(&self.seq.to_le_bytes());
        bytes.push(self.opcode as u8);
        bytes.extend_from_slice(&(self.payload.len() as u16).to_le_bytes());
        bytes.extend_from_slice(&self.payload);
        let sum = checksum(&bytes);
        bytes.extend_from_slice(&sum.to_le_bytes());
        bytes
    }
}

/// 16-bit wrapping sum of `bytes`.
pub fn checksum(bytes: &[u8]) -> u16 {
    bytes
        .iter()
        .fold(0u16, |acc, &x| acc.wrapping_add(u16::from(x)))
}

/// Encodes `command` with sequence number `seq` to wire bytes.
pub fn encode(seq: u32, command: &Command) -> Vec<u8> {
    Frame::from_command(seq, command).to_bytes()
}

/// Decodes the frame at the start of `bytes`.
///
/// Trailing bytes after the first frame are ignored.
pub fn decode(bytes: &[u8]) -> Result<Frame, CodecError> {
    decode_prefix(bytes).map(|(frame, _)| frame)
}

/// Total wire length of the frame starting at `bytes`, if the header is present.
fn declared_len(bytes: &[u8]) -> Option<usize> {
    if bytes.len() < HEADER_SIZE {
        return None;
    }
    let len = u16::from_le_bytes([bytes[5], bytes[6]]) as usize;
    Some(HEADER_SIZE + len + CHECKSUM_SIZE)
}

/// Decodes the first frame and returns it with the number of bytes consumed.
fn decode_prefix(bytes: &[u8]) -> Result<(Frame, usize), CodecError> {
    let total = declared_len(bytes).ok_or(CodecError::Truncated)?;
    let payload_len = total - HEADER_SIZE - CHECKSUM_SIZE;
    if payload_len > MAX_PAYLOAD {
        return Err(CodecError::InvalidPayload(format!(
            "declared payload of {} bytes exceeds {}",
            payload_len, MAX_PAYLOAD
        )));
    }
    if bytes.len() < total {
        return Err(CodecError::Truncated);
    }

    let body_end = total - CHECKSUM_SIZE;
    let expected = u16::from_le_bytes([bytes[body_end], bytes[body_end + 1]]);
    if checksum(&bytes[..body_end]) != expected {
        return Err(CodecError::ChecksumMismatch);
    }

    let opcode = Opcode::from_byte(bytes[4])?;
    let seq = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    let frame = Frame {
        seq,
        opcode,
        payload: bytes[HEADER_SIZE..body_end].to_vec(),
    };
    Ok((frame, total))
}

/// Incremental decoder for a byte stream.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends received bytes.
    pub fn extend(&mut self, bytes: &[u8]) {
        self.buffer.extend_from_slice(bytes);
        if self.buffer.len() > BUFFER_MAX_SIZE {
            warn!(
                "Frame buffer overflow ({} bytes), clearing buffer",
                self.buffer.len()
            );
            self.buffer.clear();
        }
    }

    /// Number of buffered bytes not yet consumed.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Returns the next complete frame, or `None` if more bytes are needed.
    ///
    /// Corrupt frames and frames with unknown opcodes are logged and skipped.
    pub fn next_frame(&mut self) -> Option<Frame> {
        loop {
            match decode_prefix(&self.buffer) {
                Ok((frame, used)) => {
                    self.buffer.drain(..used);
                    return Some(frame);
                }
                Err(CodecError::Truncated) => return None,
                Err(CodecError::UnknownOpcode(op)) => {
                    let used = declared_len(&self.buffer).unwrap_or(1);
                    warn!("Skipping frame with unknown opcode {:#04X}", op);
                    self.buffer.drain(..used);
                }
                Err(e) => {
                    debug!("Resynchronising frame stream: {}", e);
                    self.buffer.drain(..1);
                }
            }
        }
    }
}
