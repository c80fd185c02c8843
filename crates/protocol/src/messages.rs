use serde::{Deserialize, Serialize};

use crate::types::{ApprovalStatus, ErrorPayload, InitiateStatus};

// ---------------------------------------------------------------------------
// Request payloads
// ---------------------------------------------------------------------------

/// Announces a transfer to the receiver.
///
/// `file_hash` is [`PENDING_HASH`](crate::PENDING_HASH) when the sender has not
/// finished hashing yet; the real digest follows in [`CompleteRequest`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitiateRequest {
    pub transfer_id: String,
    pub file_name: String,
    pub file_size: u64,
    pub file_hash: String,
    pub total_chunks: u32,
    pub chunk_size: u32,
    pub sender_id: String,
    pub sender_name: String,
    #[serde(default)]
    pub encrypted: bool,
}

/// Polls the state of a pending approval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalStatusRequest {
    pub request_id: String,
}

/// Metadata accompanying one chunk payload.
///
/// The payload itself travels as raw bytes next to this header; when
/// `encrypted` is set it is an encrypted chunk frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkHeader {
    pub transfer_id: String,
    pub chunk_index: u32,
    pub original_size: u32,
    pub sender_id: String,
    #[serde(default)]
    pub encrypted: bool,
}

/// Signals that every chunk has been sent and carries the final digest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompleteRequest {
    pub transfer_id: String,
    pub file_hash: String,
}

// ---------------------------------------------------------------------------
// Response payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitiateResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<InitiateStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorPayload>,
}

impl InitiateResponse {
    pub fn accepted() -> Self {
        Self {
            success: true,
            status: Some(InitiateStatus::Accepted),
            request_id: None,
            error: None,
        }
    }

    pub fn pending(request_id: impl Into<String>) -> Self {
        Self {
            success: true,
            status: Some(InitiateStatus::PendingApproval),
            request_id: Some(request_id.into()),
            error: None,
        }
    }

    pub fn failed(error: ErrorPayload) -> Self {
        Self {
            success: false,
            status: None,
            request_id: None,
            error: Some(error),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalStatusResponse {
    pub status: ApprovalStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkAck {
    pub success: bool,
    pub chunk_index: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorPayload>,
}

impl ChunkAck {
    pub fn ok(chunk_index: u32) -> Self {
        Self {
            success: true,
            chunk_index,
            error: None,
        }
    }

    pub fn failed(chunk_index: u32, error: ErrorPayload) -> Self {
        Self {
            success: false,
            chunk_index,
            error: Some(error),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompleteResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorPayload>,
}

impl CompleteResponse {
    pub fn saved(path: impl Into<String>, size: u64) -> Self {
        Self {
            success: true,
            path: Some(path.into()),
            size: Some(size),
            error: None,
        }
    }

    pub fn failed(error: ErrorPayload) -> Self {
        Self {
            success: false,
            path: None,
            size: None,
            error: Some(error),
        }
    }
}
