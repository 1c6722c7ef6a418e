//! LED Rig Link Library
//!
//! Wire protocol and transports for addressable LED rigs driven over a
//! serial line, either directly or through an HTTP/WebSocket relay.

pub mod error;
pub mod protocol;
pub mod transport;

pub use error::{Error, Result};
pub use protocol::{
    checksum, decode, encode, CodecError, Color, Command, DeviceEvent, Frame, FrameDecoder,
    FrameMessage, Opcode,
};
pub use transport::{
    HttpTransport, LinkStatus, MemoryTransport, Received, SerialTransport, Transport,
    TransportConfig, TransportKind, WebSocketTransport,
};
