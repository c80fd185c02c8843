//! Payload types for Syndro transfer operations.
//!
//! Each logical operation (initiate, approval status, chunk upload,
//! completion) has an explicit request and response struct. The concrete
//! transport (TCP data channel, in-process loopback) only moves these
//! values around.

pub mod messages;
pub mod types;

pub use messages::{
    ApprovalStatusRequest, ApprovalStatusResponse, ChunkAck, ChunkHeader, CompleteRequest,
    CompleteResponse, InitiateRequest, InitiateResponse,
};
pub use types::{ApprovalStatus, DeviceDescriptor, ErrorKind, ErrorPayload, InitiateStatus};

/// Hash placeholder sent during initiation, before the sender has finished
/// hashing the source file.
pub const PENDING_HASH: &str = "pending";

/// Length of a lowercase hex SHA-256 digest.
pub const HASH_HEX_LEN: usize = 64;

/// Returns `true` if `value` looks like a lowercase or uppercase hex SHA-256 digest.
pub fn is_hex_digest(value: &str) -> bool {
    value.len() == HASH_HEX_LEN && value.bytes().all(|b| b.is_ascii_hexdigit())
}
