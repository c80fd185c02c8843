use std::collections::BTreeSet;
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::{debug, warn};

use crate::TransferError;
use crate::plan::{chunk_count, chunk_len};
use crate::types::ChunkInfo;
use crate::validation::temp_path_for;

// ---------------------------------------------------------------------------
// Chunk reading
// ---------------------------------------------------------------------------

/// Reads the byte range described by `chunk` from an open file.
///
/// Lanes keep one handle open for their whole run and call this per chunk;
/// the handle is closed when the lane drops it.
pub async fn read_chunk(
    file: &mut tokio::fs::File,
    chunk: &ChunkInfo,
) -> Result<Vec<u8>, TransferError> {
    file.seek(SeekFrom::Start(chunk.start)).await?;
    let mut buf = vec![0u8; chunk.size as usize];
    file.read_exact(&mut buf).await?;
    Ok(buf)
}

// ---------------------------------------------------------------------------
// ChunkWriter
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriterStatus {
    Open,
    Finalizing,
    Finalized,
    Aborted,
}

#[derive(Debug)]
struct WriterState {
    received: BTreeSet<u32>,
    bytes_written: u64,
    status: WriterStatus,
}

/// Assembles chunks that arrive in any order into one destination file.
///
/// Chunks are written at `index * chunk_size` into `<final>.tmp`. Writes to
/// different indices run concurrently, each on its own file handle; only the
/// bookkeeping is serialized.
#[derive(Debug)]
pub struct ChunkWriter {
    final_path: PathBuf,
    temp_path: PathBuf,
    total_size: u64,
    chunk_size: u32,
    total_chunks: u32,
    state: Mutex<WriterState>,
}

impl ChunkWriter {
    /// Creates the temp file and pre-sizes it to `total_size`.
    ///
    /// An existing file at the temp path is left alone and reported as
    /// [`TransferError::TempFileExists`].
    pub async fn open(
        final_path: &Path,
        total_size: u64,
        chunk_size: u32,
    ) -> Result<Self, TransferError> {
        let total_chunks = chunk_count(total_size, chunk_size)?;
        let temp_path = temp_path_for(final_path);

        if let Some(parent) = final_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = match tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&temp_path)
            .await
        {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                return Err(TransferError::TempFileExists(temp_path));
            }
            Err(e) => return Err(e.into()),
        };
        file.set_len(total_size).await?;
        drop(file);

        debug!(
            path = %temp_path.display(),
            total_size,
            total_chunks,
            "chunk writer opened"
        );

        Ok(Self {
            final_path: final_path.to_path_buf(),
            temp_path,
            total_size,
            chunk_size,
            total_chunks,
            state: Mutex::new(WriterState {
                received: BTreeSet::new(),
                bytes_written: 0,
                status: WriterStatus::Open,
            }),
        })
    }

    /// Writes chunk `index` at its offset.
    ///
    /// Returns `true` the first time an index is written. Rewriting an index
    /// overwrites the bytes but does not count again.
    pub async fn write_chunk(&self, index: u32, data: Vec<u8>) -> Result<bool, TransferError> {
        let expected = chunk_len(self.total_size, self.chunk_size, index).ok_or(
            TransferError::ChunkOutOfRange {
                index,
                total: self.total_chunks,
            },
        )?;
        if data.len() != expected as usize {
            return Err(TransferError::ChunkSizeMismatch {
                index,
                expected,
                actual: data.len(),
            });
        }
        self.ensure_open()?;

        let offset = index as u64 * self.chunk_size as u64;
        let temp_path = self.temp_path.clone();
        tokio::task::spawn_blocking(move || -> std::io::Result<()> {
            // No `create`: if the writer was aborted and the temp file removed,
            // the write fails instead of resurrecting it.
            let mut file = std::fs::OpenOptions::new().write(true).open(&temp_path)?;
            file.seek(SeekFrom::Start(offset))?;
            file.write_all(&data)?;
            Ok(())
        })
        .await
        .map_err(|e| std::io::Error::other(format!("write task failed: {e}")))??;

        let mut state = self.lock();
        match state.status {
            WriterStatus::Aborted => return Err(TransferError::Aborted),
            WriterStatus::Finalizing | WriterStatus::Finalized => {
                return Err(TransferError::AlreadyFinalized);
            }
            WriterStatus::Open => {}
        }
        let first = state.received.insert(index);
        if first {
            state.bytes_written += expected as u64;
        }
        Ok(first)
    }

    /// `true` once every chunk index has been written.
    pub fn is_complete(&self) -> bool {
        self.lock().received.len() as u32 == self.total_chunks
    }

    /// Indices not yet written, ascending.
    pub fn missing_chunks(&self) -> Vec<u32> {
        let state = self.lock();
        (0..self.total_chunks)
            .filter(|i| !state.received.contains(i))
            .collect()
    }

    /// Number of distinct chunks written.
    pub fn received_count(&self) -> u32 {
        self.lock().received.len() as u32
    }

    /// Bytes written, counting each index once.
    pub fn bytes_written(&self) -> u64 {
        self.lock().bytes_written
    }

    /// Moves the temp file to the destination given at open time.
    pub async fn finalize(&self) -> Result<PathBuf, TransferError> {
        let dest = self.final_path.clone();
        self.finalize_to(&dest).await
    }

    /// Moves the completed temp file to `dest`, replacing any existing file.
    pub async fn finalize_to(&self, dest: &Path) -> Result<PathBuf, TransferError> {
        {
            let mut state = self.lock();
            match state.status {
                WriterStatus::Aborted => return Err(TransferError::Aborted),
                WriterStatus::Finalizing | WriterStatus::Finalized => {
                    return Err(TransferError::AlreadyFinalized);
                }
                WriterStatus::Open => {}
            }
            let missing: Vec<u32> = (0..self.total_chunks)
                .filter(|i| !state.received.contains(i))
                .collect();
            if !missing.is_empty() {
                return Err(TransferError::Incomplete { missing });
            }
            state.status = WriterStatus::Finalizing;
        }

        let temp_path = self.temp_path.clone();
        let dest_path = dest.to_path_buf();
        let result = tokio::task::spawn_blocking(move || -> std::io::Result<()> {
            match std::fs::remove_file(&dest_path) {
                Ok(()) => debug!(path = %dest_path.display(), "replaced existing file"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
            std::fs::rename(&temp_path, &dest_path)
        })
        .await
        .map_err(|e| std::io::Error::other(format!("finalize task failed: {e}")))
        .and_then(|r| r);

        let mut state = self.lock();
        match result {
            Ok(()) => {
                state.status = WriterStatus::Finalized;
                debug!(path = %dest.display(), "chunk writer finalized");
                Ok(dest.to_path_buf())
            }
            Err(e) => {
                // Back to open so a later abort still removes the temp file.
                state.status = WriterStatus::Open;
                Err(e.into())
            }
        }
    }

    /// Discards the partial output.
    ///
    /// Idempotent; a finalized writer is left untouched.
    pub async fn abort(&self) {
        {
            let mut state = self.lock();
            if state.status == WriterStatus::Finalized {
                return;
            }
            state.status = WriterStatus::Aborted;
        }
        match tokio::fs::remove_file(&self.temp_path).await {
            Ok(()) => debug!(path = %self.temp_path.display(), "temp file removed"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(
                path = %self.temp_path.display(),
                error = %e,
                "failed to remove temp file"
            ),
        }
    }

    pub fn is_finalized(&self) -> bool {
        self.lock().status == WriterStatus::Finalized
    }

    pub fn final_path(&self) -> &Path {
        &self.final_path
    }

    pub fn temp_path(&self) -> &Path {
        &self.temp_path
    }

    pub fn total_chunks(&self) -> u32 {
        self.total_chunks
    }

    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    pub fn chunk_size(&self) -> u32 {
        self.chunk_size
    }

    fn ensure_open(&self) -> Result<(), TransferError> {
        match self.lock().status {
            WriterStatus::Open => Ok(()),
            WriterStatus::Aborted => Err(TransferError::Aborted),
            WriterStatus::Finalizing | WriterStatus::Finalized => {
                Err(TransferError::AlreadyFinalized)
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, WriterState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
