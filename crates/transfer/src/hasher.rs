use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Read buffer size for whole-file hashing (1 MiB).
const HASH_BLOCK_SIZE: usize = 1024 * 1024;

/// Progress callback: `(bytes_processed, total_bytes)`.
pub type ProgressFn = Box<dyn FnMut(u64, u64) + Send>;

/// Errors from streaming hash computation.
#[derive(Debug, thiserror::Error)]
pub enum HashError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("hashing cancelled")]
    Cancelled,

    #[error("hashing timed out after {0:?}")]
    TimedOut(Duration),
}

/// Controls for a hashing run.
#[derive(Default)]
pub struct HashOptions {
    /// Cooperative cancellation, checked before each block.
    pub cancel: Option<CancellationToken>,
    /// Wall-clock bound on the whole run.
    pub timeout: Option<Duration>,
    /// Invoked after each block.
    pub progress: Option<ProgressFn>,
}

impl HashOptions {
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = Some(cancel);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_progress(mut self, progress: ProgressFn) -> Self {
        self.progress = Some(progress);
        self
    }
}

/// Incremental SHA-256 over an unbounded byte stream.
///
/// Memory use is the digest state only; callers feed blocks as they read them.
pub struct StreamingHasher {
    sha: Sha256,
    processed: u64,
    total: u64,
    started: Instant,
    timeout: Option<Duration>,
    cancel: Option<CancellationToken>,
    progress: Option<ProgressFn>,
}

impl StreamingHasher {
    /// Starts a hashing run over `total_bytes` bytes (used for progress only).
    pub fn start(total_bytes: u64, options: HashOptions) -> Self {
        Self {
            sha: Sha256::new(),
            processed: 0,
            total: total_bytes,
            started: Instant::now(),
            timeout: options.timeout,
            cancel: options.cancel,
            progress: options.progress,
        }
    }

    /// Consumes one block.
    ///
    /// Fails without consuming `bytes` if the run was cancelled or its
    /// deadline has passed.
    pub fn feed(&mut self, bytes: &[u8]) -> Result<(), HashError> {
        self.check()?;
        self.sha.update(bytes);
        self.processed += bytes.len() as u64;
        if let Some(progress) = self.progress.as_mut() {
            progress(self.processed, self.total);
        }
        Ok(())
    }

    /// Returns the lowercase hex digest.
    pub fn finish(self) -> Result<String, HashError> {
        self.check()?;
        Ok(hex::encode(self.sha.finalize()))
    }

    /// Bytes consumed so far.
    pub fn processed(&self) -> u64 {
        self.processed
    }

    fn check(&self) -> Result<(), HashError> {
        if self.cancel.as_ref().is_some_and(|c| c.is_cancelled()) {
            return Err(HashError::Cancelled);
        }
        if let Some(timeout) = self.timeout
            && self.started.elapsed() >= timeout
        {
            return Err(HashError::TimedOut(timeout));
        }
        Ok(())
    }
}

/// Computes SHA-256 of `data` and returns the hex-encoded digest.
pub fn checksum_bytes(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Hashes a whole file on the calling thread.
pub fn hash_file_blocking(path: &Path, options: HashOptions) -> Result<String, HashError> {
    let mut file = std::fs::File::open(path)?;
    let total = file.metadata()?.len();
    let mut hasher = StreamingHasher::start(total, options);
    let mut buf = vec![0u8; HASH_BLOCK_SIZE];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.feed(&buf[..n])?;
    }
    let digest = hasher.finish()?;
    debug!(path = %path.display(), bytes = total, "file hashed");
    Ok(digest)
}

/// Hashes a whole file on the blocking pool.
///
/// Opens its own handle, so it can run while other tasks read or write the
/// same file.
pub async fn hash_file(path: PathBuf, options: HashOptions) -> Result<String, HashError> {
    tokio::task::spawn_blocking(move || hash_file_blocking(&path, options))
        .await
        .map_err(|e| HashError::Io(std::io::Error::other(format!("hash task failed: {e}"))))?
}
