//! Error types for the exec-link gateway.

use thiserror::Error;

/// Convenience result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, ExecLinkError>;

/// Errors surfaced by the gateway and its transport layer.
#[derive(Debug, Clone, Error)]
pub enum ExecLinkError {
    /// WebSocket transport failure (connect, send, or protocol error).
    #[error("WebSocket error: {0}")]
    WebSocketError(String),

    /// A wire frame could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// An operation did not complete within its configured timeout.
    #[error("Timeout: {0}")]
    TimeoutError(String),

    /// Invalid gateway configuration (bad URL, missing transport, ...).
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    /// The gateway has been closed explicitly; no further operations
    /// (including reconnection) will be attempted.
    #[error("Connection closed: {0}")]
    ConnectionClosed(String),

    /// Unexpected internal state. Indicates a bug rather than an
    /// environmental failure.
    #[error("Internal error: {0}")]
    InternalError(String),
}
