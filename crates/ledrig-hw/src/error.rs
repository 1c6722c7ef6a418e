//! Error types for the LED rig link library.

use thiserror::Error;

use crate::protocol::CodecError;

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur when talking to a rig.
#[derive(Error, Debug)]
pub enum Error {
    /// Serial device not found or could not be opened.
    #[error("LED device not found at {0}")]
    DeviceNotFound(String),

    /// Serial port communication error.
    #[error("Serial port error: {0}")]
    Serial(#[from] tokio_serial::Error),

    /// Serial or socket I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP request error.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// HTTP response with an unexpected status.
    #[error("HTTP status {status}: {body}")]
    HttpStatus { status: u16, body: String },

    /// WebSocket protocol error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] Box<tokio_tungstenite::tungstenite::Error>),

    /// JSON encoding or decoding error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Frame decoding error.
    #[error("Codec error: {0}")]
    Codec(#[from] CodecError),

    /// I/O attempted on a transport that is not open.
    #[error("Transport is not open")]
    NotOpen,

    /// The transport exhausted its failure budget and must be reopened.
    #[error("Transport link failed")]
    LinkFailed,

    /// The remote peer closed the connection.
    #[error("Connection closed by peer")]
    Closed,

    /// The relay has no usable device.
    #[error("Device unavailable")]
    DeviceUnavailable,

    /// The relay rejected the request.
    #[error("Request rejected: {0}")]
    Rejected(String),

    /// An I/O operation did not complete in time.
    #[error("Operation timed out")]
    Timeout,

    /// Invalid transport configuration.
    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl From<tokio_tungstenite::tungstenite::Error> for Error {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        Error::WebSocket(Box::new(e))
    }
}

impl From<tokio::time::error::Elapsed> for Error {
    fn from(_: tokio::time::error::Elapsed) -> Self {
        Error::Timeout
    }
}
