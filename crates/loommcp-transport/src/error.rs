//! Transport error types.

use thiserror::Error;

/// A specialized `Result` type for transport operations.
pub type TransportResult<T> = std::result::Result<T, TransportError>;

/// Errors raised by the framing and lifecycle layers.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum TransportError {
    /// Failed to establish a connection or bind a listener.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// An established connection was lost.
    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    /// Failed to send a message.
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// Failed to receive a message.
    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    /// The peer violated the framing rules; the connection is closed.
    #[error("Framing violation: {0}")]
    FramingViolation(String),

    /// A frame larger than the configured limit was announced or sent.
    #[error("Message size ({size} bytes) exceeds maximum allowed ({max} bytes)")]
    MessageTooLarge {
        /// Announced or actual payload size.
        size: usize,
        /// Configured limit.
        max: usize,
    },

    /// The operation did not complete within the specified timeout.
    #[error("Operation timed out")]
    Timeout,

    /// The transport was asked to stop while the operation was in flight.
    #[error("Transport stopped")]
    Stopped,

    /// The transport is not connected or already closed.
    #[error("Transport closed")]
    Closed,

    /// The transport was configured with invalid parameters.
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    /// An HTTP or WebSocket peer broke protocol.
    #[error("Protocol error: {0}")]
    ProtocolError(String),

    /// An underlying I/O error occurred.
    #[error("IO error: {0}")]
    Io(String),
}

impl From<std::io::Error> for TransportError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<TransportError> for loommcp_core::McpError {
    fn from(err: TransportError) -> Self {
        use loommcp_core::ErrorKind;
        let kind = match &err {
            TransportError::Timeout => ErrorKind::Timeout,
            TransportError::Closed | TransportError::ConnectionLost(_) => {
                ErrorKind::ConnectionClosed
            }
            TransportError::MessageTooLarge { .. } => ErrorKind::PayloadTooLarge,
            _ => ErrorKind::TransportError,
        };
        loommcp_core::McpError::new(kind, err.to_string())
    }
}
