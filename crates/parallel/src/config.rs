//! Sender and receiver tuning.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use syndro_transfer::{MAX_CHUNK_SIZE, ParallelConfig, TransferError};

use crate::error::TransportError;

/// Per-chunk retry with linear backoff.
///
/// Attempt `n` (1-based) that fails with a retryable error waits
/// `n * base` before the next try, where `base` depends on the failure class.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub network_backoff: Duration,
    pub timeout_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            network_backoff: Duration::from_millis(500),
            timeout_backoff: Duration::from_millis(1000),
        }
    }
}

impl RetryPolicy {
    /// Delay after failed attempt `attempt`.
    pub fn backoff(&self, attempt: u32, error: &TransportError) -> Duration {
        let base = match error {
            TransportError::Timeout(_) => self.timeout_backoff,
            _ => self.network_backoff,
        };
        base.saturating_mul(attempt.max(1))
    }
}

/// Deadlines for each exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Timeouts {
    pub initiate: Duration,
    pub chunk_upload: Duration,
    pub notify: Duration,
    /// Total time the sender waits for a manual approval.
    pub approval: Duration,
    pub approval_poll: Duration,
    /// Bound on whole-file hashing, on either side.
    pub hash: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            initiate: Duration::from_secs(30),
            chunk_upload: Duration::from_secs(60),
            notify: Duration::from_secs(10),
            approval: Duration::from_secs(300),
            approval_poll: Duration::from_millis(500),
            hash: Duration::from_secs(600),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SenderConfig {
    pub sender_id: String,
    pub sender_name: String,
    pub parallel: ParallelConfig,
    pub retry: RetryPolicy,
    pub timeouts: Timeouts,
}

impl SenderConfig {
    pub fn new(sender_id: impl Into<String>, sender_name: impl Into<String>) -> Self {
        Self {
            sender_id: sender_id.into(),
            sender_name: sender_name.into(),
            parallel: ParallelConfig::default(),
            retry: RetryPolicy::default(),
            timeouts: Timeouts::default(),
        }
    }

    pub fn validate(&self) -> Result<(), TransferError> {
        if self.sender_id.is_empty() {
            return Err(TransferError::InvalidConfig("sender id is empty".into()));
        }
        if self.retry.max_attempts == 0 {
            return Err(TransferError::InvalidConfig(
                "retry.max_attempts must be at least 1".into(),
            ));
        }
        self.parallel.validate()
    }
}

/// Whether incoming transfers start immediately or wait for a decision.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalMode {
    #[default]
    AutoAccept,
    Manual,
}

/// What to do when the destination already exists at save time.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollisionPolicy {
    /// Save as `"name (n).ext"`.
    #[default]
    Rename,
    Overwrite,
}

#[derive(Debug, Clone)]
pub struct ReceiverConfig {
    pub download_dir: PathBuf,
    /// Largest accepted plaintext chunk.
    pub max_chunk_size: u32,
    pub approval: ApprovalMode,
    /// Pending requests older than this expire.
    pub approval_timeout: Duration,
    pub collision: CollisionPolicy,
    pub hash_timeout: Duration,
}

impl ReceiverConfig {
    pub fn new(download_dir: impl Into<PathBuf>) -> Self {
        Self {
            download_dir: download_dir.into(),
            max_chunk_size: MAX_CHUNK_SIZE,
            approval: ApprovalMode::default(),
            approval_timeout: Duration::from_secs(300),
            collision: CollisionPolicy::default(),
            hash_timeout: Duration::from_secs(600),
        }
    }
}
