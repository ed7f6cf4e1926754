//! Protocol error types.

use thiserror::Error;

/// Crate-specific result type.
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Errors that can occur while talking to the Imagine endpoint.
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// Connection-related errors (WebSocket handshake, transport)
    #[error("Connection error: {0}")]
    Connection(String),

    /// Protocol parsing/encoding errors
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Base64 payload could not be decoded
    #[error("Decode error: {0}")]
    Decode(#[from] base64::DecodeError),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP errors from side calls
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl ProtocolError {
    /// Create a connection error.
    pub fn connection(msg: impl Into<String>) -> Self {
        Self::Connection(msg.into())
    }

    /// Create a protocol error.
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::Protocol(msg.into())
    }

    /// Create a generic error.
    pub fn other(msg: impl Into<String>) -> Self {
        Self::Other(msg.into())
    }
}
