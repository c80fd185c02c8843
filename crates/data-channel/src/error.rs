//! Error types for the data channel.

use syndro_parallel::TransportError;

/// Errors produced by the TCP data channel.
#[derive(Debug, thiserror::Error)]
pub enum DataChannelError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid JSON payload: {0}")]
    Json(#[from] serde_json::Error),

    #[error("authentication failed: {0}")]
    AuthFailed(String),

    #[error("connection timed out")]
    Timeout,

    #[error("cancelled")]
    Cancelled,

    #[error("protocol error: {0}")]
    Protocol(String),
}

impl From<DataChannelError> for TransportError {
    fn from(err: DataChannelError) -> Self {
        match err {
            // A dropped stream is reopened on the next attempt, so EOF is
            // a network failure here rather than a closed transport.
            DataChannelError::Io(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                TransportError::Network("connection closed by peer".into())
            }
            DataChannelError::Io(e) => e.into(),
            DataChannelError::Timeout => TransportError::Timeout(crate::TCP_CONNECT_TIMEOUT),
            DataChannelError::Cancelled => TransportError::Closed,
            DataChannelError::Json(e) => TransportError::Protocol(e.to_string()),
            DataChannelError::AuthFailed(msg) | DataChannelError::Protocol(msg) => {
                TransportError::Protocol(msg)
            }
        }
    }
}
