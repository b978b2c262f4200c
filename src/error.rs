//! Error types for pagewire.

use thiserror::Error;

/// Main error type for all pagewire operations.
#[derive(Debug, Error)]
pub enum PagewireError {
    /// I/O error during socket or file operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// WebSocket transport error.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Invalid base64 payload in a file save request.
    #[error("Base64 error: {0}")]
    Base64(#[from] base64::DecodeError),

    /// Envelope carried a `cmd` this side does not know.
    #[error("Unknown command: {0}")]
    UnknownCommand(String),

    /// Protocol error (missing fields, wrong types, bad connection path).
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// No host function registered under the given name.
    #[error("No function found with name \"{0}\"")]
    HandlerNotFound(String),

    /// Connection closed before the operation could complete.
    #[error("Connection closed")]
    ConnectionClosed,

    /// Waiting for a return value took longer than allowed.
    #[error("Timed out waiting for return value")]
    Timeout,

    /// Outbound queue is full.
    #[error("Outbound queue full")]
    Backpressure,
}

/// Result type alias using PagewireError.
pub type Result<T> = std::result::Result<T, PagewireError>;
