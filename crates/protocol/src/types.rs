use std::fmt;

use serde::{Deserialize, Serialize};

/// A remote peer as handed to the transfer core by discovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceDescriptor {
    pub id: String,
    pub name: String,
    pub address: String,
    pub port: u16,
}

impl DeviceDescriptor {
    /// Returns `address:port`, bracketing IPv6 literals.
    pub fn socket_addr(&self) -> String {
        if self.address.contains(':') && !self.address.starts_with('[') {
            format!("[{}]:{}", self.address, self.port)
        } else {
            format!("{}:{}", self.address, self.port)
        }
    }
}

/// Outcome of an initiate request that was not rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InitiateStatus {
    Accepted,
    PendingApproval,
}

/// State of a pending approval request on the receiver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Rejected,
    Expired,
}

impl ApprovalStatus {
    /// Returns `true` once the request can no longer change.
    pub fn is_final(self) -> bool {
        !matches!(self, Self::Pending)
    }
}

/// Machine-readable error category carried in every failure payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InvalidRequest,
    InvalidPath,
    UnknownTransfer,
    Conflict,
    NotApproved,
    Rejected,
    Decryption,
    Format,
    MissingChunks,
    HashMismatch,
    Disposed,
    State,
    Io,
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::InvalidRequest => "invalid_request",
            Self::InvalidPath => "invalid_path",
            Self::UnknownTransfer => "unknown_transfer",
            Self::Conflict => "conflict",
            Self::NotApproved => "not_approved",
            Self::Rejected => "rejected",
            Self::Decryption => "decryption",
            Self::Format => "format",
            Self::MissingChunks => "missing_chunks",
            Self::HashMismatch => "hash_mismatch",
            Self::Disposed => "disposed",
            Self::State => "state",
            Self::Io => "io",
            Self::Internal => "internal",
        };
        f.write_str(s)
    }
}

/// Structured failure returned across the transport boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorPayload {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transfer_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub missing_chunks: Vec<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actual_hash: Option<String>,
}

impl ErrorPayload {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            transfer_id: None,
            missing_chunks: Vec::new(),
            expected_hash: None,
            actual_hash: None,
        }
    }

    pub fn with_transfer(mut self, transfer_id: impl Into<String>) -> Self {
        self.transfer_id = Some(transfer_id.into());
        self
    }
}

impl fmt::Display for ErrorPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}
