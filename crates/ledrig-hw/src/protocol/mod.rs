//! LED command protocol.
//!
//! Encodes the command set into checksummed wire frames for the serial link.
//! The same frames travel over HTTP and WebSocket in their JSON form.

mod command;
mod frame;
mod message;

pub use command::{Color, Command, Opcode};
pub use frame::{
    checksum, decode, encode, Frame, FrameDecoder, BUFFER_MAX_SIZE, CHECKSUM_SIZE, HEADER_SIZE,
    MAX_PAYLOAD,
};
pub use message::{DeviceEvent, FrameMessage};

use thiserror::Error;

/// Errors raised while decoding frames or their JSON form.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// Checksum did not match the frame contents.
    #[error("checksum mismatch")]
    ChecksumMismatch,

    /// Fewer bytes than the declared length; wait for more input.
    #[error("truncated frame")]
    Truncated,

    /// Opcode byte matches no known opcode.
    #[error("unknown opcode {0:#04X}")]
    UnknownOpcode(u8),

    /// Payload does not match the layout its opcode requires.
    #[error("invalid payload: {0}")]
    InvalidPayload(String),
}

impl CodecError {
    /// Short machine-readable kind used in relay error responses.
    pub fn kind(&self) -> &'static str {
        match self {
            CodecError::ChecksumMismatch => "checksum_mismatch",
            CodecError::Truncated => "truncated",
            CodecError::UnknownOpcode(_) => "unknown_opcode",
            CodecError::InvalidPayload(_) => "invalid_payload",
        }
    }
}
