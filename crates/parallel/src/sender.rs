//! Sending side of a parallel transfer.
//!
//! A send runs in phases:
//! 1. Start hashing the source file in the background
//! 2. Initiate with a `"pending"` hash, then wait for approval if asked to
//! 3. Upload every chunk over N lanes, lane `i` taking `index % N == i`
//! 4. Await the digest and notify the receiver
//!
//! Chunk uploads retry transient failures with linear backoff. The first lane
//! that gives up cancels its siblings and fails the send.

use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use futures_util::future::join_all;
use syndro_protocol::{
    ApprovalStatus, ChunkHeader, CompleteRequest, ErrorKind, ErrorPayload, InitiateRequest,
    InitiateStatus, PENDING_HASH,
};
use syndro_transfer::{
    ChunkCipher, ChunkInfo, HashOptions, SecretKey, SpeedCalculator, assign_lanes, hash_file,
    plan, read_chunk,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::SenderConfig;
use crate::error::{SendError, TransportError};
use crate::events::{Direction, EventBus, TransferEvent, TransferProgress};
use crate::pool::ConnectionPool;
use crate::registry::{RegistryError, SessionRegistry};
use crate::transport::PeerTransport;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendPhase {
    Preparing,
    Initiating,
    AwaitingApproval,
    Uploading,
    AwaitingHash,
    Notifying,
    Completed,
    Failed,
    Cancelled,
}

/// A file to send.
#[derive(Debug, Clone)]
pub struct SendRequest {
    pub transfer_id: String,
    pub path: PathBuf,
    /// Name announced to the receiver; defaults to the path's file name.
    pub file_name: Option<String>,
    /// Encrypts every chunk when set.
    pub key: Option<SecretKey>,
}

impl SendRequest {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            transfer_id: Uuid::new_v4().to_string(),
            path: path.into(),
            file_name: None,
            key: None,
        }
    }

    pub fn with_transfer_id(mut self, transfer_id: impl Into<String>) -> Self {
        self.transfer_id = transfer_id.into();
        self
    }

    pub fn with_file_name(mut self, file_name: impl Into<String>) -> Self {
        self.file_name = Some(file_name.into());
        self
    }

    pub fn with_key(mut self, key: SecretKey) -> Self {
        self.key = Some(key);
        self
    }
}

/// Result of a finished send.
#[derive(Debug, Clone, PartialEq)]
pub struct SendOutcome {
    pub transfer_id: String,
    pub file_hash: String,
    pub file_size: u64,
    pub total_chunks: u32,
    pub connections: u32,
    /// Upload attempts per chunk index, including resends.
    pub chunk_attempts: BTreeMap<u32, u32>,
    /// `false` when the completion notice went unanswered.
    pub receiver_confirmed: bool,
    /// Where the receiver saved the file, if it said.
    pub saved_path: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SendSnapshot {
    pub transfer_id: String,
    pub file_name: String,
    pub phase: SendPhase,
    pub file_size: u64,
    pub total_chunks: u32,
    pub connections: u32,
    pub chunks_sent: u32,
    pub bytes_sent: u64,
    pub cancelled: bool,
    pub bytes_per_second: f64,
}

/// Progress shared by every lane of one transfer.
struct ParallelTransferState {
    phase: SendPhase,
    sent_chunks: HashSet<u32>,
    bytes_sent: u64,
    attempts: BTreeMap<u32, u32>,
    cancelled: bool,
}

struct SendSession {
    transfer_id: String,
    file_name: String,
    path: PathBuf,
    file_size: u64,
    chunk_size: u32,
    total_chunks: u32,
    connections: u32,
    key: Option<SecretKey>,
    cancel: CancellationToken,
    speed: SpeedCalculator,
    state: Mutex<ParallelTransferState>,
}

impl SendSession {
    fn lock(&self) -> MutexGuard<'_, ParallelTransferState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_phase(&self, phase: SendPhase) {
        self.lock().phase = phase;
    }

    fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    fn cancel(&self) {
        self.lock().cancelled = true;
        self.cancel.cancel();
    }

    /// Records a delivered chunk. Bytes count once per index.
    fn record_sent(&self, chunk: &ChunkInfo, attempts: u32) -> TransferProgress {
        let first = {
            let mut state = self.lock();
            *state.attempts.entry(chunk.index).or_default() += attempts;
            let first = state.sent_chunks.insert(chunk.index);
            if first {
                state.bytes_sent += chunk.size as u64;
            }
            first
        };
        if first {
            self.speed.record(chunk.size as u64);
        }
        self.progress()
    }

    fn progress(&self) -> TransferProgress {
        let (bytes_done, chunks_done) = {
            let state = self.lock();
            (state.bytes_sent, state.sent_chunks.len() as u32)
        };
        TransferProgress {
            transfer_id: self.transfer_id.clone(),
            direction: Direction::Send,
            bytes_done,
            total_bytes: self.file_size,
            chunks_done,
            total_chunks: self.total_chunks,
            bytes_per_second: self.speed.bytes_per_second(),
        }
    }

    fn snapshot(&self) -> SendSnapshot {
        let state = self.lock();
        SendSnapshot {
            transfer_id: self.transfer_id.clone(),
            file_name: self.file_name.clone(),
            phase: state.phase,
            file_size: self.file_size,
            total_chunks: self.total_chunks,
            connections: self.connections,
            chunks_sent: state.sent_chunks.len() as u32,
            bytes_sent: state.bytes_sent,
            cancelled: state.cancelled,
            bytes_per_second: self.speed.bytes_per_second(),
        }
    }
}

/// Uploads files to one peer over a pool of connections.
pub struct ParallelSender {
    config: SenderConfig,
    pool: ConnectionPool<dyn PeerTransport>,
    sessions: SessionRegistry<SendSession>,
    events: EventBus,
    /// Parent of every session token; cancelled on dispose.
    cancel: CancellationToken,
}

impl ParallelSender {
    /// Creates a sender over `clients`. Lane `i` uses `clients[i % len]`.
    pub fn new(
        config: SenderConfig,
        clients: Vec<Arc<dyn PeerTransport>>,
    ) -> Result<Self, SendError> {
        config.validate()?;
        if clients.is_empty() {
            return Err(SendError::InvalidRequest(
                "at least one connection is required".into(),
            ));
        }
        Ok(Self {
            config,
            pool: ConnectionPool::new(clients),
            sessions: SessionRegistry::new(),
            events: EventBus::default(),
            cancel: CancellationToken::new(),
        })
    }

    pub fn config(&self) -> &SenderConfig {
        &self.config
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn is_disposed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Sends one file and waits for the outcome.
    pub async fn send(&self, request: SendRequest) -> Result<SendOutcome, SendError> {
        if self.is_disposed() {
            return Err(SendError::Disposed);
        }

        let metadata = tokio::fs::metadata(&request.path).await?;
        if !metadata.is_file() {
            return Err(SendError::InvalidRequest(format!(
                "{} is not a regular file",
                request.path.display()
            )));
        }
        let file_name = request
            .file_name
            .clone()
            .or_else(|| {
                request
                    .path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
            })
            .ok_or_else(|| SendError::InvalidRequest("file has no name".into()))?;

        let parallel = &self.config.parallel;
        let file_size = metadata.len();
        let chunks = plan(file_size, parallel.chunk_size)?;
        let session = Arc::new(SendSession {
            transfer_id: request.transfer_id.clone(),
            file_name,
            path: request.path.clone(),
            file_size,
            chunk_size: parallel.chunk_size,
            total_chunks: chunks.len() as u32,
            connections: parallel.lanes_for(file_size),
            key: request.key,
            cancel: self.cancel.child_token(),
            speed: SpeedCalculator::default(),
            state: Mutex::new(ParallelTransferState {
                phase: SendPhase::Preparing,
                sent_chunks: HashSet::new(),
                bytes_sent: 0,
                attempts: BTreeMap::new(),
                cancelled: false,
            }),
        });

        self.sessions
            .insert(session.transfer_id.clone(), Arc::clone(&session))
            .map_err(|e| match e {
                RegistryError::Duplicate(id) => SendError::DuplicateTransfer(id),
                RegistryError::Closed => SendError::Disposed,
            })?;

        info!(
            transfer_id = %session.transfer_id,
            file = %session.path.display(),
            size = file_size,
            chunks = session.total_chunks,
            lanes = session.connections,
            encrypted = session.key.is_some(),
            "starting send"
        );
        self.events.emit(TransferEvent::Initiated {
            transfer_id: session.transfer_id.clone(),
            direction: Direction::Send,
            file_name: session.file_name.clone(),
            file_size,
            total_chunks: session.total_chunks,
            connections: session.connections,
        });

        let started = Instant::now();
        let result = self.run(&session, &chunks).await;
        self.sessions.remove(&session.transfer_id);

        match &result {
            Ok(outcome) => {
                session.set_phase(SendPhase::Completed);
                info!(
                    transfer_id = %session.transfer_id,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    confirmed = outcome.receiver_confirmed,
                    "send completed"
                );
                self.events.emit(TransferEvent::Completed {
                    transfer_id: session.transfer_id.clone(),
                    direction: Direction::Send,
                    path: outcome.saved_path.as_ref().map(PathBuf::from),
                    file_hash: outcome.file_hash.clone(),
                });
            }
            Err(SendError::Cancelled) => {
                session.set_phase(SendPhase::Cancelled);
                info!(transfer_id = %session.transfer_id, "send cancelled");
                self.events.emit(TransferEvent::Cancelled {
                    transfer_id: session.transfer_id.clone(),
                    direction: Direction::Send,
                });
            }
            Err(e) => {
                session.set_phase(SendPhase::Failed);
                error!(transfer_id = %session.transfer_id, error = %e, "send failed");
                self.events.emit(TransferEvent::Failed {
                    transfer_id: session.transfer_id.clone(),
                    direction: Direction::Send,
                    error: e.to_string(),
                });
            }
        }
        result
    }

    /// Requests cancellation. Lanes stop before their next chunk; uploads
    /// already in flight finish or fail on their own.
    pub fn cancel(&self, transfer_id: &str) -> bool {
        let Some(session) = self.sessions.get(transfer_id) else {
            return false;
        };
        session.cancel();
        info!(transfer_id, "cancellation requested");
        true
    }

    pub fn session(&self, transfer_id: &str) -> Option<SendSnapshot> {
        self.sessions.get(transfer_id).map(|s| s.snapshot())
    }

    pub fn active_transfers(&self) -> Vec<SendSnapshot> {
        self.sessions
            .ids()
            .iter()
            .filter_map(|id| self.session(id))
            .collect()
    }

    /// Cancels every transfer and releases the connection pool.
    ///
    /// Idempotent; later sends fail with [`SendError::Disposed`].
    pub fn dispose(&self) {
        if self.cancel.is_cancelled() {
            return;
        }
        self.cancel.cancel();
        let sessions = self.sessions.close();
        for session in &sessions {
            session.lock().cancelled = true;
        }
        let closed = self.pool.close();
        info!(
            cancelled = sessions.len(),
            connections = closed,
            "sender disposed"
        );
    }

    // -----------------------------------------------------------------------
    // Phases
    // -----------------------------------------------------------------------

    async fn run(
        &self,
        session: &SendSession,
        chunks: &[ChunkInfo],
    ) -> Result<SendOutcome, SendError> {
        // Hashing overlaps the handshake and upload; the guard stops it on
        // every early return.
        let hash_cancel = session.cancel.child_token();
        let _stop_hashing = hash_cancel.clone().drop_guard();
        let hash_task = tokio::spawn(hash_file(
            session.path.clone(),
            HashOptions::default()
                .with_cancel(hash_cancel)
                .with_timeout(self.config.timeouts.hash),
        ));

        let client = self.client(0)?;
        self.initiate(session, client.as_ref()).await?;

        session.set_phase(SendPhase::Uploading);
        self.upload(session, chunks, session.connections).await?;

        session.set_phase(SendPhase::AwaitingHash);
        let file_hash = hash_task
            .await
            .map_err(|e| std::io::Error::other(format!("hash task failed: {e}")))??;
        debug!(transfer_id = %session.transfer_id, hash = %file_hash, "source hashed");
        if session.is_cancelled() {
            return Err(SendError::Cancelled);
        }

        let (receiver_confirmed, saved_path) = self
            .notify_complete(session, client.as_ref(), chunks, &file_hash)
            .await?;

        let chunk_attempts = session.lock().attempts.clone();
        Ok(SendOutcome {
            transfer_id: session.transfer_id.clone(),
            file_hash,
            file_size: session.file_size,
            total_chunks: session.total_chunks,
            connections: session.connections,
            chunk_attempts,
            receiver_confirmed,
            saved_path,
        })
    }

    async fn initiate(
        &self,
        session: &SendSession,
        client: &dyn PeerTransport,
    ) -> Result<(), SendError> {
        session.set_phase(SendPhase::Initiating);
        let request = InitiateRequest {
            transfer_id: session.transfer_id.clone(),
            file_name: session.file_name.clone(),
            file_size: session.file_size,
            file_hash: PENDING_HASH.into(),
            total_chunks: session.total_chunks,
            chunk_size: session.chunk_size,
            sender_id: self.config.sender_id.clone(),
            sender_name: self.config.sender_name.clone(),
            encrypted: session.key.is_some(),
        };

        let timeout = self.config.timeouts.initiate;
        let response = tokio::time::timeout(timeout, client.initiate(&request))
            .await
            .map_err(|_| SendError::Initiate(TransportError::Timeout(timeout)))?
            .map_err(SendError::Initiate)?;
        if session.is_cancelled() {
            return Err(SendError::Cancelled);
        }
        if !response.success {
            return Err(SendError::Refused(response.error.unwrap_or_else(|| {
                ErrorPayload::new(ErrorKind::Internal, "initiate refused without a reason")
            })));
        }

        match response.status {
            Some(InitiateStatus::PendingApproval) => {
                let request_id = response.request_id.ok_or_else(|| {
                    SendError::Protocol("pending approval without a request id".into())
                })?;
                self.await_approval(session, client, &request_id).await
            }
            Some(InitiateStatus::Accepted) | None => Ok(()),
        }
    }

    async fn await_approval(
        &self,
        session: &SendSession,
        client: &dyn PeerTransport,
        request_id: &str,
    ) -> Result<(), SendError> {
        session.set_phase(SendPhase::AwaitingApproval);
        info!(transfer_id = %session.transfer_id, request_id, "waiting for approval");
        self.events.emit(TransferEvent::AwaitingApproval {
            transfer_id: session.transfer_id.clone(),
            request_id: request_id.to_string(),
        });

        let timeouts = &self.config.timeouts;
        let deadline = tokio::time::Instant::now() + timeouts.approval;
        loop {
            if session.is_cancelled() {
                return Err(SendError::Cancelled);
            }
            match tokio::time::timeout(timeouts.initiate, client.approval_status(request_id)).await
            {
                Ok(Ok(response)) => match response.status {
                    ApprovalStatus::Approved => {
                        info!(transfer_id = %session.transfer_id, "transfer approved");
                        return Ok(());
                    }
                    ApprovalStatus::Rejected => return Err(SendError::Rejected),
                    ApprovalStatus::Expired => return Err(SendError::ApprovalExpired),
                    ApprovalStatus::Pending => {}
                },
                Ok(Err(e)) => debug!(request_id, error = %e, "approval poll failed"),
                Err(_) => debug!(request_id, "approval poll timed out"),
            }

            if tokio::time::Instant::now() >= deadline {
                return Err(SendError::ApprovalTimeout(timeouts.approval));
            }
            tokio::select! {
                _ = session.cancel.cancelled() => return Err(SendError::Cancelled),
                _ = tokio::time::sleep(timeouts.approval_poll) => {}
            }
        }
    }

    /// Runs `lanes` lanes over `chunks` and waits for all of them.
    async fn upload(
        &self,
        session: &SendSession,
        chunks: &[ChunkInfo],
        lanes: u32,
    ) -> Result<(), SendError> {
        let cipher = session.key.as_ref().map(ChunkCipher::new);
        let abort = session.cancel.child_token();
        let assignment = assign_lanes(chunks, lanes);

        let results = join_all(
            assignment
                .iter()
                .enumerate()
                .filter(|(_, lane_chunks)| !lane_chunks.is_empty())
                .map(|(lane, lane_chunks)| {
                    self.run_lane(session, lane, lane_chunks, cipher.as_ref(), &abort)
                }),
        )
        .await;

        if session.is_cancelled() {
            return Err(SendError::Cancelled);
        }
        let mut aborted = false;
        for result in results {
            match result {
                Ok(()) => {}
                Err(SendError::Cancelled) => aborted = true,
                Err(e) => return Err(e),
            }
        }
        if aborted {
            return Err(SendError::Cancelled);
        }
        Ok(())
    }

    async fn run_lane(
        &self,
        session: &SendSession,
        lane: usize,
        chunks: &[ChunkInfo],
        cipher: Option<&ChunkCipher>,
        abort: &CancellationToken,
    ) -> Result<(), SendError> {
        let result = self.drive_lane(session, lane, chunks, cipher, abort).await;
        if let Err(e) = &result
            && !matches!(e, SendError::Cancelled)
        {
            warn!(transfer_id = %session.transfer_id, lane, error = %e, "lane failed");
            abort.cancel();
        }
        result
    }

    async fn drive_lane(
        &self,
        session: &SendSession,
        lane: usize,
        chunks: &[ChunkInfo],
        cipher: Option<&ChunkCipher>,
        abort: &CancellationToken,
    ) -> Result<(), SendError> {
        let client = self.client(lane)?;
        let mut file = tokio::fs::File::open(&session.path).await?;
        debug!(
            transfer_id = %session.transfer_id,
            lane,
            chunks = chunks.len(),
            "lane started"
        );

        for chunk in chunks {
            if abort.is_cancelled() {
                return Err(SendError::Cancelled);
            }
            let plaintext = read_chunk(&mut file, chunk).await?;
            let body = match cipher {
                Some(cipher) => cipher.encrypt(&plaintext)?,
                None => plaintext,
            };
            let header = ChunkHeader {
                transfer_id: session.transfer_id.clone(),
                chunk_index: chunk.index,
                original_size: chunk.size,
                sender_id: self.config.sender_id.clone(),
                encrypted: cipher.is_some(),
            };

            let attempts = self
                .upload_chunk(session, client.as_ref(), &header, &body, abort)
                .await?;
            let progress = session.record_sent(chunk, attempts);
            self.events.emit(TransferEvent::Progress(progress));
        }

        debug!(transfer_id = %session.transfer_id, lane, "lane finished");
        Ok(())
    }

    /// Uploads one chunk, retrying transient failures. Returns the attempts
    /// it took.
    async fn upload_chunk(
        &self,
        session: &SendSession,
        client: &dyn PeerTransport,
        header: &ChunkHeader,
        body: &[u8],
        abort: &CancellationToken,
    ) -> Result<u32, SendError> {
        let retry = &self.config.retry;
        let timeout = self.config.timeouts.chunk_upload;
        let index = header.chunk_index;

        let mut attempt = 0;
        loop {
            attempt += 1;
            let error = match tokio::time::timeout(timeout, client.upload_chunk(header, body)).await
            {
                Ok(Ok(ack)) if ack.chunk_index != index => TransportError::Protocol(format!(
                    "ack for chunk {} answered upload of chunk {index}",
                    ack.chunk_index
                )),
                Ok(Ok(ack)) if ack.success => return Ok(attempt),
                Ok(Ok(ack)) => {
                    return Err(SendError::ChunkRejected {
                        index,
                        error: ack.error.unwrap_or_else(|| {
                            ErrorPayload::new(ErrorKind::Internal, "chunk refused without a reason")
                        }),
                    });
                }
                Ok(Err(e)) => e,
                Err(_) => TransportError::Timeout(timeout),
            };

            if !error.is_retryable() || attempt >= retry.max_attempts {
                return Err(SendError::ChunkFailed {
                    index,
                    attempts: attempt,
                    source: error,
                });
            }

            let delay = retry.backoff(attempt, &error);
            warn!(
                transfer_id = %session.transfer_id,
                chunk = index,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "chunk upload failed, retrying"
            );
            self.events.emit(TransferEvent::ChunkRetry {
                transfer_id: session.transfer_id.clone(),
                chunk_index: index,
                attempt,
                error: error.to_string(),
            });
            tokio::select! {
                _ = abort.cancelled() => return Err(SendError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// Sends the final digest.
    ///
    /// An unanswered notice leaves the send successful but unconfirmed.
    /// Missing chunks are resent once over a single lane.
    async fn notify_complete(
        &self,
        session: &SendSession,
        client: &dyn PeerTransport,
        chunks: &[ChunkInfo],
        file_hash: &str,
    ) -> Result<(bool, Option<String>), SendError> {
        let request = CompleteRequest {
            transfer_id: session.transfer_id.clone(),
            file_hash: file_hash.to_string(),
        };
        let timeout = self.config.timeouts.notify;
        let mut resent = false;

        loop {
            session.set_phase(SendPhase::Notifying);
            let response = match tokio::time::timeout(timeout, client.notify_complete(&request))
                .await
            {
                Ok(Ok(response)) => response,
                Ok(Err(e)) => {
                    warn!(transfer_id = %session.transfer_id, error = %e, "completion notice failed");
                    return Ok((false, None));
                }
                Err(_) => {
                    warn!(
                        transfer_id = %session.transfer_id,
                        timeout_ms = timeout.as_millis() as u64,
                        "completion notice timed out"
                    );
                    return Ok((false, None));
                }
            };
            if response.success {
                return Ok((true, response.path));
            }

            let error = response.error.unwrap_or_else(|| {
                ErrorPayload::new(ErrorKind::Internal, "completion refused without a reason")
            });
            match error.kind {
                ErrorKind::HashMismatch => {
                    return Err(SendError::Integrity {
                        expected: error
                            .expected_hash
                            .unwrap_or_else(|| file_hash.to_string()),
                        actual: error.actual_hash.unwrap_or_default(),
                    });
                }
                ErrorKind::MissingChunks if !resent => {
                    resent = true;
                    let missing: Vec<ChunkInfo> = chunks
                        .iter()
                        .filter(|c| error.missing_chunks.contains(&c.index))
                        .copied()
                        .collect();
                    warn!(
                        transfer_id = %session.transfer_id,
                        missing = missing.len(),
                        "receiver reports missing chunks, resending"
                    );
                    session.set_phase(SendPhase::Uploading);
                    self.upload(session, &missing, 1).await?;
                }
                ErrorKind::MissingChunks => {
                    return Err(SendError::MissingChunks(error.missing_chunks));
                }
                _ => return Err(SendError::Refused(error)),
            }
        }
    }

    fn client(&self, connection_id: usize) -> Result<Arc<dyn PeerTransport>, SendError> {
        self.pool.client(connection_id).ok_or(SendError::Disposed)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use super::*;
    use syndro_protocol::{
        ApprovalStatusResponse, ChunkAck, CompleteResponse, InitiateResponse,
    };
    use syndro_transfer::{ParallelConfig, checksum_bytes};
    use tempfile::TempDir;

    use crate::transport::TransportFuture;

    /// Accepts everything and records what it saw.
    #[derive(Default)]
    struct RecordingPeer {
        chunks: Mutex<Vec<u32>>,
        hashes: Mutex<Vec<String>>,
        fail_first: AtomicU32,
        refuse_chunks: bool,
        /// Answers every chunk with the ack of its successor.
        shifted_acks: bool,
        /// Holds every initiate in `Pending` approval.
        never_approve: bool,
    }

    impl PeerTransport for RecordingPeer {
        fn initiate<'a>(
            &'a self,
            request: &'a InitiateRequest,
        ) -> TransportFuture<'a, InitiateResponse> {
            assert_eq!(request.file_hash, PENDING_HASH);
            Box::pin(async move {
                if self.never_approve {
                    return Ok(InitiateResponse::pending("req-1"));
                }
                Ok(InitiateResponse::accepted())
            })
        }

        fn approval_status<'a>(
            &'a self,
            _request_id: &'a str,
        ) -> TransportFuture<'a, ApprovalStatusResponse> {
            Box::pin(async move {
                let status = if self.never_approve {
                    ApprovalStatus::Pending
                } else {
                    ApprovalStatus::Approved
                };
                Ok(ApprovalStatusResponse { status })
            })
        }

        fn upload_chunk<'a>(
            &'a self,
            header: &'a ChunkHeader,
            _body: &'a [u8],
        ) -> TransportFuture<'a, ChunkAck> {
            Box::pin(async move {
                if self
                    .fail_first
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                    .is_ok()
                {
                    return Err(TransportError::Network("connection reset".into()));
                }
                if self.refuse_chunks {
                    return Ok(ChunkAck::failed(
                        header.chunk_index,
                        ErrorPayload::new(ErrorKind::NotApproved, "not approved"),
                    ));
                }
                if self.shifted_acks {
                    return Ok(ChunkAck::ok(header.chunk_index + 1));
                }
                self.chunks.lock().unwrap().push(header.chunk_index);
                Ok(ChunkAck::ok(header.chunk_index))
            })
        }

        fn notify_complete<'a>(
            &'a self,
            request: &'a CompleteRequest,
        ) -> TransportFuture<'a, CompleteResponse> {
            Box::pin(async move {
                self.hashes.lock().unwrap().push(request.file_hash.clone());
                Ok(CompleteResponse::saved("/dl/file.bin", 0))
            })
        }
    }

    fn config(connections: u32, chunk_size: u32) -> SenderConfig {
        let mut config = SenderConfig::new("dev-1", "Laptop");
        config.parallel = ParallelConfig {
            connections,
            chunk_size,
            min_file_size: 0,
            enabled: true,
        };
        config.retry.network_backoff = Duration::from_millis(1);
        config.retry.timeout_backoff = Duration::from_millis(1);
        config
    }

    fn write_file(dir: &TempDir, len: usize) -> (PathBuf, Vec<u8>) {
        let data: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
        let path = dir.path().join("file.bin");
        std::fs::write(&path, &data).unwrap();
        (path, data)
    }

    #[tokio::test]
    async fn every_chunk_sent_once_across_lanes() {
        let dir = TempDir::new().unwrap();
        let (path, data) = write_file(&dir, 10_000);
        let peer = Arc::new(RecordingPeer::default());
        let sender = ParallelSender::new(
            config(3, 1024),
            vec![peer.clone() as Arc<dyn PeerTransport>],
        )
        .unwrap();

        let outcome = sender.send(SendRequest::new(&path)).await.unwrap();

        let mut seen = peer.chunks.lock().unwrap().clone();
        seen.sort_unstable();
        assert_eq!(seen, (0..10).collect::<Vec<_>>());
        assert_eq!(outcome.total_chunks, 10);
        assert_eq!(outcome.connections, 3);
        assert_eq!(outcome.file_hash, checksum_bytes(&data));
        assert!(outcome.receiver_confirmed);
        assert_eq!(*peer.hashes.lock().unwrap(), vec![checksum_bytes(&data)]);
        assert!(outcome.chunk_attempts.values().all(|&a| a == 1));
        assert!(sender.active_transfers().is_empty());
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let dir = TempDir::new().unwrap();
        let (path, _) = write_file(&dir, 100);
        let peer = Arc::new(RecordingPeer {
            fail_first: AtomicU32::new(2),
            ..Default::default()
        });
        let sender =
            ParallelSender::new(config(1, 1024), vec![peer.clone() as Arc<dyn PeerTransport>])
                .unwrap();
        let mut events = sender.events().subscribe();

        let outcome = sender.send(SendRequest::new(&path)).await.unwrap();
        assert_eq!(outcome.chunk_attempts.get(&0), Some(&3));

        let mut retries = 0;
        while let Ok(event) = events.try_recv() {
            if matches!(event, TransferEvent::ChunkRetry { .. }) {
                retries += 1;
            }
        }
        assert_eq!(retries, 2);
    }

    #[tokio::test]
    async fn retries_are_bounded() {
        let dir = TempDir::new().unwrap();
        let (path, _) = write_file(&dir, 100);
        let peer = Arc::new(RecordingPeer {
            fail_first: AtomicU32::new(10),
            ..Default::default()
        });
        let sender =
            ParallelSender::new(config(1, 1024), vec![peer as Arc<dyn PeerTransport>]).unwrap();

        let err = sender.send(SendRequest::new(&path)).await.unwrap_err();
        assert!(matches!(
            err,
            SendError::ChunkFailed {
                index: 0,
                attempts: 3,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn remote_refusal_is_not_retried() {
        let dir = TempDir::new().unwrap();
        let (path, _) = write_file(&dir, 100);
        let peer = Arc::new(RecordingPeer {
            refuse_chunks: true,
            ..Default::default()
        });
        let sender =
            ParallelSender::new(config(1, 1024), vec![peer as Arc<dyn PeerTransport>]).unwrap();
        let mut events = sender.events().subscribe();

        let err = sender.send(SendRequest::new(&path)).await.unwrap_err();
        assert!(matches!(err, SendError::ChunkRejected { index: 0, .. }));

        let mut saw_failed = false;
        while let Ok(event) = events.try_recv() {
            assert!(!matches!(event, TransferEvent::ChunkRetry { .. }));
            saw_failed |= matches!(event, TransferEvent::Failed { .. });
        }
        assert!(saw_failed);
    }

    #[tokio::test]
    async fn ack_for_another_chunk_fails_the_send() {
        let dir = TempDir::new().unwrap();
        let (path, _) = write_file(&dir, 2048);
        let peer = Arc::new(RecordingPeer {
            shifted_acks: true,
            ..Default::default()
        });
        let sender =
            ParallelSender::new(config(1, 1024), vec![peer.clone() as Arc<dyn PeerTransport>])
                .unwrap();

        let err = sender.send(SendRequest::new(&path)).await.unwrap_err();
        match err {
            SendError::ChunkFailed {
                index: 0,
                attempts: 1,
                source: TransportError::Protocol(_),
            } => {}
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(peer.hashes.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn approval_wait_times_out() {
        let dir = TempDir::new().unwrap();
        let (path, _) = write_file(&dir, 100);
        let peer = Arc::new(RecordingPeer {
            never_approve: true,
            ..Default::default()
        });
        let mut cfg = config(1, 1024);
        cfg.timeouts.approval = Duration::from_secs(30);
        cfg.timeouts.approval_poll = Duration::from_secs(1);
        let sender =
            ParallelSender::new(cfg, vec![peer.clone() as Arc<dyn PeerTransport>]).unwrap();

        let err = sender.send(SendRequest::new(&path)).await.unwrap_err();
        match err {
            SendError::ApprovalTimeout(waited) => assert_eq!(waited, Duration::from_secs(30)),
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(peer.chunks.lock().unwrap().is_empty());
        assert!(sender.active_transfers().is_empty());
    }

    #[tokio::test]
    async fn small_files_use_one_lane() {
        let dir = TempDir::new().unwrap();
        let (path, _) = write_file(&dir, 4096);
        let peer = Arc::new(RecordingPeer::default());
        let mut cfg = config(4, 1024);
        cfg.parallel.min_file_size = 1024 * 1024;
        let sender = ParallelSender::new(cfg, vec![peer as Arc<dyn PeerTransport>]).unwrap();

        let outcome = sender.send(SendRequest::new(&path)).await.unwrap();
        assert_eq!(outcome.connections, 1);
        assert_eq!(outcome.total_chunks, 4);
    }

    #[tokio::test]
    async fn rejects_bad_input() {
        let dir = TempDir::new().unwrap();
        assert!(matches!(
            ParallelSender::new(config(1, 1024), Vec::new()),
            Err(SendError::InvalidRequest(_))
        ));

        let sender = ParallelSender::new(
            config(1, 1024),
            vec![Arc::new(RecordingPeer::default()) as Arc<dyn PeerTransport>],
        )
        .unwrap();
        assert!(matches!(
            sender.send(SendRequest::new(dir.path())).await,
            Err(SendError::InvalidRequest(_))
        ));
        assert!(matches!(
            sender.send(SendRequest::new(dir.path().join("missing"))).await,
            Err(SendError::Io(_))
        ));
    }

    #[tokio::test]
    async fn disposed_sender_refuses_work() {
        let dir = TempDir::new().unwrap();
        let (path, _) = write_file(&dir, 10);
        let sender = ParallelSender::new(
            config(1, 1024),
            vec![Arc::new(RecordingPeer::default()) as Arc<dyn PeerTransport>],
        )
        .unwrap();

        sender.dispose();
        sender.dispose();
        assert!(sender.is_disposed());
        assert!(!sender.cancel("anything"));
        assert!(matches!(
            sender.send(SendRequest::new(&path)).await,
            Err(SendError::Disposed)
        ));
    }
}
