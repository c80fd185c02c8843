//! Sender, receiver and transport error types.

use std::time::Duration;

use syndro_protocol::{ErrorKind, ErrorPayload};
use syndro_transfer::{CipherError, HashError, TransferError};

/// Failure of a single request on a [`PeerTransport`](crate::PeerTransport).
///
/// Only [`Network`](Self::Network) and [`Timeout`](Self::Timeout) are
/// transient; everything else is reported as is.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("network error: {0}")]
    Network(String),

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("connection closed")]
    Closed,

    #[error("protocol error: {0}")]
    Protocol(String),
}

impl TransportError {
    /// Whether the request may succeed if sent again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Network(_) | Self::Timeout(_))
    }
}

impl From<std::io::Error> for TransportError {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::TimedOut => Self::Timeout(Duration::ZERO),
            std::io::ErrorKind::UnexpectedEof => Self::Closed,
            _ => Self::Network(e.to_string()),
        }
    }
}

/// Errors produced by [`ParallelSender`](crate::ParallelSender).
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("transfer error: {0}")]
    Transfer(#[from] TransferError),

    #[error("encryption failed: {0}")]
    Cipher(#[from] CipherError),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("initiate failed: {0}")]
    Initiate(TransportError),

    #[error("receiver refused transfer: {0}")]
    Refused(ErrorPayload),

    #[error("transfer rejected by receiver")]
    Rejected,

    #[error("approval request expired")]
    ApprovalExpired,

    #[error("no approval decision within {0:?}")]
    ApprovalTimeout(Duration),

    #[error("chunk {index} failed after {attempts} attempt(s): {source}")]
    ChunkFailed {
        index: u32,
        attempts: u32,
        #[source]
        source: TransportError,
    },

    #[error("receiver rejected chunk {index}: {error}")]
    ChunkRejected { index: u32, error: ErrorPayload },

    #[error("hashing failed: {0}")]
    Hash(HashError),

    #[error("integrity check failed: sent {expected}, receiver computed {actual}")]
    Integrity { expected: String, actual: String },

    #[error("receiver still missing {} chunk(s) after resend", .0.len())]
    MissingChunks(Vec<u32>),

    #[error("duplicate transfer id: {0}")]
    DuplicateTransfer(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("transfer cancelled")]
    Cancelled,

    #[error("sender disposed")]
    Disposed,
}

impl From<HashError> for SendError {
    fn from(e: HashError) -> Self {
        match e {
            HashError::Cancelled => Self::Cancelled,
            other => Self::Hash(other),
        }
    }
}

/// Errors produced by [`ParallelReceiver`](crate::ParallelReceiver).
///
/// Every variant maps to an [`ErrorKind`] so handlers can answer the peer with
/// a structured [`ErrorPayload`] instead of dropping the request.
#[derive(Debug, thiserror::Error)]
pub enum ReceiveError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("unknown transfer: {0}")]
    UnknownTransfer(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("transfer {0} has not been approved")]
    NotApproved(String),

    #[error("transfer {0} was rejected")]
    Rejected(String),

    #[error("no key for sender {0}")]
    MissingKey(String),

    #[error("chunk {index} could not be decrypted: {source}")]
    Decryption {
        index: u32,
        #[source]
        source: CipherError,
    },

    #[error("{} chunk(s) missing", .0.len())]
    MissingChunks(Vec<u32>),

    #[error("hash mismatch: expected {expected}, computed {actual}")]
    HashMismatch { expected: String, actual: String },

    #[error("invalid state: {0}")]
    State(String),

    #[error("transfer error: {0}")]
    Transfer(#[from] TransferError),

    #[error("hashing failed: {0}")]
    Hash(#[from] HashError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("receiver disposed")]
    Disposed,
}

impl ReceiveError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidRequest(_) | Self::MissingKey(_) => ErrorKind::InvalidRequest,
            Self::UnknownTransfer(_) => ErrorKind::UnknownTransfer,
            Self::Conflict(_) => ErrorKind::Conflict,
            Self::NotApproved(_) => ErrorKind::NotApproved,
            Self::Rejected(_) => ErrorKind::Rejected,
            Self::Decryption {
                source: CipherError::Format { .. },
                ..
            } => ErrorKind::Format,
            Self::Decryption { .. } => ErrorKind::Decryption,
            Self::MissingChunks(_) => ErrorKind::MissingChunks,
            Self::HashMismatch { .. } => ErrorKind::HashMismatch,
            Self::State(_) => ErrorKind::State,
            Self::Transfer(e) => match e {
                TransferError::Io(_) => ErrorKind::Io,
                TransferError::InvalidPath(_) => ErrorKind::InvalidPath,
                TransferError::InvalidConfig(_)
                | TransferError::ChunkOutOfRange { .. }
                | TransferError::ChunkSizeMismatch { .. } => ErrorKind::InvalidRequest,
                TransferError::Incomplete { .. } => ErrorKind::MissingChunks,
                TransferError::AlreadyFinalized | TransferError::Aborted => ErrorKind::State,
                TransferError::TempFileExists(_) => ErrorKind::Conflict,
            },
            Self::Hash(HashError::Io(_)) | Self::Io(_) => ErrorKind::Io,
            Self::Hash(_) => ErrorKind::Internal,
            Self::Disposed => ErrorKind::Disposed,
        }
    }

    /// Builds the wire payload, carrying missing indices and digests where
    /// the variant has them.
    pub fn to_payload(&self, transfer_id: &str) -> ErrorPayload {
        let mut payload = ErrorPayload::new(self.kind(), self.to_string()).with_transfer(transfer_id);
        match self {
            Self::MissingChunks(missing)
            | Self::Transfer(TransferError::Incomplete { missing }) => {
                payload.missing_chunks = missing.clone();
            }
            Self::HashMismatch { expected, actual } => {
                payload.expected_hash = Some(expected.clone());
                payload.actual_hash = Some(actual.clone());
            }
            _ => {}
        }
        payload
    }
}
