//! Chunked file transfer building blocks.
//!
//! Everything in this crate is transport-agnostic: chunk planning, per-chunk
//! authenticated encryption, streaming SHA-256, and the out-of-order chunk
//! writer used by the receiver.

mod chunked;
mod cipher;
mod hasher;
mod plan;
mod progress;
mod types;
mod validation;

pub use chunked::{ChunkWriter, read_chunk};
pub use cipher::{
    ChunkCipher, CipherError, FRAME_OVERHEAD, NONCE_LEN, SecretKey, TAG_LEN, decrypt_chunk,
    encrypt_chunk,
};
pub use hasher::{
    HashError, HashOptions, ProgressFn, StreamingHasher, checksum_bytes, hash_file,
    hash_file_blocking,
};
pub use plan::{assign_lanes, chunk_count, chunk_len, lane_of, plan};
pub use progress::SpeedCalculator;
pub use types::{ChunkInfo, ParallelConfig};
pub use validation::{
    resolve_collision, resolve_destination, sanitize_file_name, temp_path_for,
    validate_upload_path,
};

/// Default chunk size: 2 MiB.
pub const DEFAULT_CHUNK_SIZE: u32 = 2 * 1024 * 1024;

/// Upper bound on a single chunk's plaintext size (16 MiB).
///
/// Both the cipher and the receiver reject anything larger, so a peer cannot
/// make us allocate arbitrarily large buffers.
pub const MAX_CHUNK_SIZE: u32 = 16 * 1024 * 1024;

/// Smallest chunk size a sender may configure (1 KiB).
pub const MIN_CHUNK_SIZE: u32 = 1024;

/// Most chunks a single transfer may be split into.
pub const MAX_CHUNK_COUNT: u32 = 1 << 22;

/// Default number of parallel lanes.
pub const DEFAULT_CONNECTIONS: u32 = 4;

/// Files smaller than this are sent over a single lane (10 MiB).
pub const DEFAULT_MIN_PARALLEL_SIZE: u64 = 10 * 1024 * 1024;

/// Errors produced by the transfer crate.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("{} already exists", .0.display())]
    TempFileExists(std::path::PathBuf),

    #[error("chunk {index} out of range (total {total})")]
    ChunkOutOfRange { index: u32, total: u32 },

    #[error("chunk {index} has {actual} bytes, expected {expected}")]
    ChunkSizeMismatch {
        index: u32,
        expected: u32,
        actual: usize,
    },

    #[error("transfer incomplete: {} chunk(s) missing", missing.len())]
    Incomplete { missing: Vec<u32> },

    #[error("writer already finalized")]
    AlreadyFinalized,

    #[error("writer aborted")]
    Aborted,
}
