use serde::{Deserialize, Serialize};

use crate::{
    DEFAULT_CHUNK_SIZE, DEFAULT_CONNECTIONS, DEFAULT_MIN_PARALLEL_SIZE, MAX_CHUNK_SIZE,
    MIN_CHUNK_SIZE, TransferError,
};

/// One contiguous byte range of the source file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkInfo {
    /// Position of this chunk in the plan.
    pub index: u32,
    /// Byte offset within the file.
    pub start: u64,
    /// Size of this chunk in bytes.
    pub size: u32,
}

impl ChunkInfo {
    /// Exclusive end offset.
    pub fn end(&self) -> u64 {
        self.start + self.size as u64
    }
}

/// Governs whether a file is sent over several lanes and how it is chunked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParallelConfig {
    /// Number of concurrent lanes (>= 1).
    pub connections: u32,
    /// Chunk size in bytes (> 0).
    pub chunk_size: u32,
    /// Minimum file size for parallel mode.
    pub min_file_size: u64,
    /// Master switch for parallel mode.
    pub enabled: bool,
}

impl Default for ParallelConfig {
    fn default() -> Self {
        Self {
            connections: DEFAULT_CONNECTIONS,
            chunk_size: DEFAULT_CHUNK_SIZE,
            min_file_size: DEFAULT_MIN_PARALLEL_SIZE,
            enabled: true,
        }
    }
}

impl ParallelConfig {
    /// Rejects configurations that cannot produce a valid plan.
    pub fn validate(&self) -> Result<(), TransferError> {
        if self.connections == 0 {
            return Err(TransferError::InvalidConfig(
                "connections must be at least 1".into(),
            ));
        }
        if self.chunk_size < MIN_CHUNK_SIZE {
            return Err(TransferError::InvalidConfig(format!(
                "chunk size {} is below minimum {MIN_CHUNK_SIZE}",
                self.chunk_size
            )));
        }
        if self.chunk_size > MAX_CHUNK_SIZE {
            return Err(TransferError::InvalidConfig(format!(
                "chunk size {} exceeds maximum {MAX_CHUNK_SIZE}",
                self.chunk_size
            )));
        }
        Ok(())
    }

    /// Returns `true` if a file of `file_size` bytes should use several lanes.
    pub fn qualifies(&self, file_size: u64) -> bool {
        self.enabled && file_size >= self.min_file_size
    }

    /// Number of lanes to use for a file of `file_size` bytes.
    ///
    /// Non-qualifying files still go through the chunked protocol, just over
    /// a single lane.
    pub fn lanes_for(&self, file_size: u64) -> u32 {
        if self.qualifies(file_size) {
            self.connections.max(1)
        } else {
            1
        }
    }
}
