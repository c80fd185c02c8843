//! Chunk boundary computation and lane assignment.
//!
//! Zero-byte files produce an empty plan: no chunks, nothing to upload, and
//! a receiver-side writer that is complete from the start.

use crate::types::ChunkInfo;
use crate::{MAX_CHUNK_COUNT, TransferError};

/// Number of chunks needed for `file_size` bytes (`ceil(file_size / chunk_size)`).
///
/// Fails for a zero chunk size or when the count exceeds [`MAX_CHUNK_COUNT`].
pub fn chunk_count(file_size: u64, chunk_size: u32) -> Result<u32, TransferError> {
    if chunk_size == 0 {
        return Err(TransferError::InvalidConfig(
            "chunk size must be greater than zero".into(),
        ));
    }
    let count = file_size.div_ceil(chunk_size as u64);
    u32::try_from(count)
        .ok()
        .filter(|count| *count <= MAX_CHUNK_COUNT)
        .ok_or_else(|| {
            TransferError::InvalidConfig(format!(
                "{file_size} bytes at {chunk_size} bytes per chunk needs {count} chunks, \
                 more than {MAX_CHUNK_COUNT}"
            ))
        })
}

/// Byte length of chunk `index` in a file of `file_size` bytes.
///
/// Returns `None` if `index` is past the last chunk.
pub fn chunk_len(file_size: u64, chunk_size: u32, index: u32) -> Option<u32> {
    let start = index as u64 * chunk_size as u64;
    if chunk_size == 0 || start >= file_size {
        return None;
    }
    Some((file_size - start).min(chunk_size as u64) as u32)
}

/// Splits `file_size` bytes into ordered, non-overlapping chunks.
pub fn plan(file_size: u64, chunk_size: u32) -> Result<Vec<ChunkInfo>, TransferError> {
    let count = chunk_count(file_size, chunk_size)?;
    let mut chunks = Vec::with_capacity(count as usize);
    for index in 0..count {
        let start = index as u64 * chunk_size as u64;
        let size = (file_size - start).min(chunk_size as u64) as u32;
        chunks.push(ChunkInfo { index, start, size });
    }
    Ok(chunks)
}

/// Lane that uploads chunk `index` (`index mod connections`).
pub fn lane_of(index: u32, connections: u32) -> u32 {
    index % connections.max(1)
}

/// Distributes chunks round-robin over `connections` lanes.
///
/// Each lane keeps its chunks in ascending index order. Lanes with no work
/// (more lanes than chunks) come back empty.
pub fn assign_lanes(chunks: &[ChunkInfo], connections: u32) -> Vec<Vec<ChunkInfo>> {
    let lanes = connections.max(1) as usize;
    let mut out = vec![Vec::with_capacity(chunks.len() / lanes + 1); lanes];
    for chunk in chunks {
        out[lane_of(chunk.index, connections) as usize].push(*chunk);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sizes_sum_to_file_size() {
        for &(size, chunk) in &[
            (0u64, 1u32),
            (1, 1),
            (1, 4),
            (10, 4),
            (12, 4),
            (1_000_003, 4096),
            (10 * 1024 * 1024, 2 * 1024 * 1024),
        ] {
            let chunks = plan(size, chunk).unwrap();
            let total: u64 = chunks.iter().map(|c| c.size as u64).sum();
            assert_eq!(total, size, "size={size} chunk={chunk}");

            // All but the last chunk are full-sized, and ranges are contiguous.
            let mut expected_start = 0;
            for (i, c) in chunks.iter().enumerate() {
                assert_eq!(c.index as usize, i);
                assert_eq!(c.start, expected_start);
                if i + 1 < chunks.len() {
                    assert_eq!(c.size, chunk);
                }
                assert!(c.size > 0);
                expected_start = c.end();
            }
        }
    }

    #[test]
    fn ten_megabytes_in_two_megabyte_chunks() {
        let chunks = plan(10 * 1024 * 1024, 2 * 1024 * 1024).unwrap();
        assert_eq!(chunks.len(), 5);
        assert_eq!(chunks[4].start, 8 * 1024 * 1024);
    }

    #[test]
    fn last_chunk_is_remainder() {
        let chunks = plan(10, 4).unwrap();
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[2].size, 2);
        assert_eq!(chunk_len(10, 4, 2), Some(2));
        assert_eq!(chunk_len(10, 4, 3), None);
    }

    #[test]
    fn zero_byte_file_has_no_chunks() {
        assert!(plan(0, 1024).unwrap().is_empty());
        assert_eq!(chunk_count(0, 1024).unwrap(), 0);
        assert_eq!(chunk_len(0, 1024, 0), None);
    }

    #[test]
    fn zero_chunk_size_is_config_error() {
        assert!(matches!(
            plan(100, 0),
            Err(TransferError::InvalidConfig(_))
        ));
        assert!(chunk_count(100, 0).is_err());
    }

    #[test]
    fn chunk_index_overflow_is_config_error() {
        assert!(chunk_count(u64::MAX, 1).is_err());
    }

    #[test]
    fn tiny_chunks_over_huge_file_rejected_before_allocating() {
        let four_gib = 4 * 1024 * 1024 * 1024;
        assert!(matches!(
            plan(four_gib, 1),
            Err(TransferError::InvalidConfig(_))
        ));
        assert_eq!(
            chunk_count(MAX_CHUNK_COUNT as u64, 1).unwrap(),
            MAX_CHUNK_COUNT
        );
        assert!(chunk_count(MAX_CHUNK_COUNT as u64 + 1, 1).is_err());
    }

    #[test]
    fn round_robin_lanes() {
        let chunks = plan(5 * 10, 10).unwrap();
        let lanes = assign_lanes(&chunks, 2);
        assert_eq!(lanes.len(), 2);
        let idx: Vec<Vec<u32>> = lanes
            .iter()
            .map(|l| l.iter().map(|c| c.index).collect())
            .collect();
        assert_eq!(idx[0], vec![0, 2, 4]);
        assert_eq!(idx[1], vec![1, 3]);
    }

    #[test]
    fn more_lanes_than_chunks() {
        let chunks = plan(20, 10).unwrap();
        let lanes = assign_lanes(&chunks, 4);
        assert_eq!(lanes.len(), 4);
        assert_eq!(lanes[0].len(), 1);
        assert_eq!(lanes[1].len(), 1);
        assert!(lanes[2].is_empty());
        assert!(lanes[3].is_empty());
    }

    #[test]
    fn lane_of_is_modulo() {
        assert_eq!(lane_of(7, 3), 1);
        assert_eq!(lane_of(7, 0), 0);
    }
}
