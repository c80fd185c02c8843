//! Receiving side of a parallel transfer.
//!
//! Each accepted transfer gets a [`ChunkWriter`] over `<dest>.tmp`. Chunks
//! arrive on any connection in any order, are decrypted when the transfer is
//! encrypted and written at their offset. On completion the temp file is
//! moved into place and its SHA-256 compared with the sender's digest; a
//! mismatch deletes the file.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use syndro_protocol::{
    ApprovalStatus, ApprovalStatusResponse, ChunkAck, ChunkHeader, CompleteRequest,
    CompleteResponse, InitiateRequest, InitiateResponse, PENDING_HASH, is_hex_digest,
};
use syndro_transfer::{
    ChunkCipher, ChunkWriter, HashOptions, SecretKey, SpeedCalculator, chunk_count, hash_file,
    resolve_collision, resolve_destination,
};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{ApprovalMode, CollisionPolicy, ReceiverConfig};
use crate::error::ReceiveError;
use crate::events::{Direction, EventBus, TransferEvent, TransferProgress};
use crate::keys::KeyProvider;
use crate::registry::{RegistryError, SessionRegistry};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceivePhase {
    PendingApproval,
    Receiving,
    Verifying,
    Saved,
    /// Assembled file did not match the announced digest.
    Corrupted,
    Failed,
    Aborted,
}

/// Point-in-time view of an incoming transfer.
#[derive(Debug, Clone, PartialEq)]
pub struct ReceiveSnapshot {
    pub transfer_id: String,
    pub file_name: String,
    pub sender_id: String,
    pub sender_name: String,
    pub phase: ReceivePhase,
    pub file_size: u64,
    pub total_chunks: u32,
    pub chunks_received: u32,
    pub bytes_received: u64,
    pub encrypted: bool,
    pub bytes_per_second: f64,
}

struct ReceiveSession {
    transfer_id: String,
    file_name: String,
    sender_id: String,
    sender_name: String,
    /// Digest from the initiate request; usually still `"pending"`.
    announced_hash: String,
    key: Option<SecretKey>,
    writer: ChunkWriter,
    speed: SpeedCalculator,
    phase: Mutex<ReceivePhase>,
}

impl ReceiveSession {
    fn phase(&self) -> ReceivePhase {
        *self.lock_phase()
    }

    fn set_phase(&self, phase: ReceivePhase) {
        *self.lock_phase() = phase;
    }

    fn lock_phase(&self) -> MutexGuard<'_, ReceivePhase> {
        self.phase.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn snapshot(&self) -> ReceiveSnapshot {
        ReceiveSnapshot {
            transfer_id: self.transfer_id.clone(),
            file_name: self.file_name.clone(),
            sender_id: self.sender_id.clone(),
            sender_name: self.sender_name.clone(),
            phase: self.phase(),
            file_size: self.writer.total_size(),
            total_chunks: self.writer.total_chunks(),
            chunks_received: self.writer.received_count(),
            bytes_received: self.writer.bytes_written(),
            encrypted: self.key.is_some(),
            bytes_per_second: self.speed.bytes_per_second(),
        }
    }

    fn progress(&self) -> TransferProgress {
        TransferProgress {
            transfer_id: self.transfer_id.clone(),
            direction: Direction::Receive,
            bytes_done: self.writer.bytes_written(),
            total_bytes: self.writer.total_size(),
            chunks_done: self.writer.received_count(),
            total_chunks: self.writer.total_chunks(),
            bytes_per_second: self.speed.bytes_per_second(),
        }
    }
}

struct Approval {
    transfer_id: String,
    status: ApprovalStatus,
    /// When `status` last changed.
    since: Instant,
}

impl Approval {
    fn settle(&mut self, status: ApprovalStatus) {
        self.status = status;
        self.since = Instant::now();
    }

    /// Rejections and expiries outlive their session so the sender's next
    /// poll can still read them.
    fn is_refusal(&self) -> bool {
        matches!(self.status, ApprovalStatus::Rejected | ApprovalStatus::Expired)
    }
}

/// Accepts incoming transfers and assembles them under the download directory.
///
/// The `handle_*` methods never fail: errors are answered with a structured
/// payload so the sender can tell a rejected chunk from a lost one.
pub struct ParallelReceiver {
    config: ReceiverConfig,
    keys: Arc<dyn KeyProvider>,
    sessions: SessionRegistry<ReceiveSession>,
    approvals: Mutex<HashMap<String, Approval>>,
    /// Destinations owned by live sessions.
    reserved: Mutex<HashSet<PathBuf>>,
    events: EventBus,
    cancel: CancellationToken,
    disposed: AtomicBool,
}

impl ParallelReceiver {
    pub fn new(config: ReceiverConfig, keys: Arc<dyn KeyProvider>) -> Self {
        Self {
            config,
            keys,
            sessions: SessionRegistry::new(),
            approvals: Mutex::new(HashMap::new()),
            reserved: Mutex::new(HashSet::new()),
            events: EventBus::default(),
            cancel: CancellationToken::new(),
            disposed: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &ReceiverConfig {
        &self.config
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    // -----------------------------------------------------------------------
    // Request handlers
    // -----------------------------------------------------------------------

    /// Registers a new incoming transfer.
    pub async fn handle_initiate(&self, request: &InitiateRequest) -> InitiateResponse {
        match self.initiate(request).await {
            Ok(None) => InitiateResponse::accepted(),
            Ok(Some(request_id)) => InitiateResponse::pending(request_id),
            Err(e) => {
                warn!(transfer_id = %request.transfer_id, error = %e, "initiate refused");
                InitiateResponse::failed(e.to_payload(&request.transfer_id))
            }
        }
    }

    /// Decrypts and stores one chunk.
    pub async fn handle_chunk(&self, header: &ChunkHeader, body: &[u8]) -> ChunkAck {
        match self.receive_chunk(header, body).await {
            Ok(()) => ChunkAck::ok(header.chunk_index),
            Err(e) => {
                warn!(
                    transfer_id = %header.transfer_id,
                    chunk = header.chunk_index,
                    error = %e,
                    "chunk refused"
                );
                ChunkAck::failed(header.chunk_index, e.to_payload(&header.transfer_id))
            }
        }
    }

    /// Finalizes and verifies a transfer.
    ///
    /// Missing chunks are reported without closing the session so the
    /// sender can resend them. Any other failure discards the transfer.
    pub async fn handle_complete(&self, request: &CompleteRequest) -> CompleteResponse {
        match self.complete(request).await {
            Ok((path, size)) => CompleteResponse::saved(path.display().to_string(), size),
            Err(e) => {
                warn!(transfer_id = %request.transfer_id, error = %e, "completion failed");
                CompleteResponse::failed(e.to_payload(&request.transfer_id))
            }
        }
    }

    /// Current decision for a manual approval request.
    ///
    /// Unknown request ids read as expired.
    pub async fn approval_status(&self, request_id: &str) -> ApprovalStatusResponse {
        self.sweep_approvals().await;
        let status = self
            .lock_approvals()
            .get(request_id)
            .map_or(ApprovalStatus::Expired, |a| a.status);
        ApprovalStatusResponse { status }
    }

    // -----------------------------------------------------------------------
    // Local control
    // -----------------------------------------------------------------------

    /// Accepts a pending request; chunks are taken from now on.
    pub async fn approve(&self, request_id: &str) -> Result<(), ReceiveError> {
        self.ensure_open()?;
        self.sweep_approvals().await;

        let mut approvals = self.lock_approvals();
        let approval = approvals
            .get_mut(request_id)
            .ok_or_else(|| ReceiveError::UnknownTransfer(request_id.to_string()))?;
        match approval.status {
            ApprovalStatus::Pending => {}
            ApprovalStatus::Approved => return Ok(()),
            ApprovalStatus::Rejected => {
                return Err(ReceiveError::Rejected(approval.transfer_id.clone()));
            }
            ApprovalStatus::Expired => {
                return Err(ReceiveError::State(format!(
                    "approval request {request_id} expired"
                )));
            }
        }
        // Open the session before the sender can observe the approval.
        if let Some(session) = self.sessions.get(&approval.transfer_id) {
            session.set_phase(ReceivePhase::Receiving);
        }
        approval.settle(ApprovalStatus::Approved);
        info!(transfer_id = %approval.transfer_id, request_id, "transfer approved");
        Ok(())
    }

    /// Declines a pending request and discards its session.
    pub async fn reject(&self, request_id: &str) -> Result<(), ReceiveError> {
        self.ensure_open()?;
        let transfer_id = {
            let mut approvals = self.lock_approvals();
            let approval = approvals
                .get_mut(request_id)
                .ok_or_else(|| ReceiveError::UnknownTransfer(request_id.to_string()))?;
            match approval.status {
                ApprovalStatus::Pending => approval.settle(ApprovalStatus::Rejected),
                ApprovalStatus::Rejected => return Ok(()),
                other => {
                    return Err(ReceiveError::State(format!(
                        "approval request {request_id} is already {other:?}"
                    )));
                }
            }
            approval.transfer_id.clone()
        };

        info!(%transfer_id, request_id, "transfer rejected");
        if self.discard(&transfer_id, ReceivePhase::Aborted).await {
            self.events.emit(TransferEvent::Cancelled {
                transfer_id,
                direction: Direction::Receive,
            });
        }
        Ok(())
    }

    /// Drops a transfer and its partial file. Returns `false` if unknown.
    pub async fn abort(&self, transfer_id: &str) -> bool {
        let found = self.discard(transfer_id, ReceivePhase::Aborted).await;
        if found {
            info!(transfer_id, "transfer aborted");
            self.events.emit(TransferEvent::Cancelled {
                transfer_id: transfer_id.to_string(),
                direction: Direction::Receive,
            });
        }
        found
    }

    pub fn session(&self, transfer_id: &str) -> Option<ReceiveSnapshot> {
        self.sessions.get(transfer_id).map(|s| s.snapshot())
    }

    pub fn active_transfers(&self) -> Vec<ReceiveSnapshot> {
        self.sessions
            .ids()
            .iter()
            .filter_map(|id| self.session(id))
            .collect()
    }

    /// Aborts every live transfer and refuses new work.
    ///
    /// Idempotent; never fails.
    pub async fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cancel.cancel();

        let sessions = self.sessions.close();
        let count = sessions.len();
        for session in sessions {
            session.set_phase(ReceivePhase::Aborted);
            session.writer.abort().await;
        }
        self.lock_approvals().clear();
        self.lock_reserved().clear();
        info!(aborted = count, "receiver disposed");
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    async fn initiate(&self, request: &InitiateRequest) -> Result<Option<String>, ReceiveError> {
        self.ensure_open()?;
        self.sweep_approvals().await;
        validate_initiate(request, self.config.max_chunk_size)?;

        let key = if request.encrypted {
            let key = self
                .keys
                .key_for(&request.sender_id)
                .ok_or_else(|| ReceiveError::MissingKey(request.sender_id.clone()))?;
            Some(key)
        } else {
            None
        };

        let dest = resolve_destination(&self.config.download_dir, &request.file_name)?;
        if self.sessions.get(&request.transfer_id).is_some() {
            return Err(ReceiveError::Conflict(format!(
                "transfer {} is already active",
                request.transfer_id
            )));
        }
        if !self.lock_reserved().insert(dest.clone()) {
            return Err(ReceiveError::Conflict(format!(
                "{} is already being received",
                dest.display()
            )));
        }

        let writer = match ChunkWriter::open(&dest, request.file_size, request.chunk_size).await {
            Ok(writer) => writer,
            Err(e) => {
                self.release(&dest);
                return Err(e.into());
            }
        };

        let manual = self.config.approval == ApprovalMode::Manual;
        let session = Arc::new(ReceiveSession {
            transfer_id: request.transfer_id.clone(),
            file_name: request.file_name.clone(),
            sender_id: request.sender_id.clone(),
            sender_name: request.sender_name.clone(),
            announced_hash: request.file_hash.clone(),
            key,
            writer,
            speed: SpeedCalculator::default(),
            phase: Mutex::new(if manual {
                ReceivePhase::PendingApproval
            } else {
                ReceivePhase::Receiving
            }),
        });

        if let Err(e) = self
            .sessions
            .insert(request.transfer_id.clone(), Arc::clone(&session))
        {
            session.writer.abort().await;
            self.release(&dest);
            return Err(match e {
                RegistryError::Duplicate(id) => {
                    ReceiveError::Conflict(format!("transfer {id} is already active"))
                }
                RegistryError::Closed => ReceiveError::Disposed,
            });
        }

        info!(
            transfer_id = %request.transfer_id,
            file = %dest.display(),
            size = request.file_size,
            chunks = request.total_chunks,
            sender = %request.sender_name,
            encrypted = request.encrypted,
            "incoming transfer registered"
        );
        self.events.emit(TransferEvent::Initiated {
            transfer_id: request.transfer_id.clone(),
            direction: Direction::Receive,
            file_name: request.file_name.clone(),
            file_size: request.file_size,
            total_chunks: request.total_chunks,
            connections: 0,
        });

        if !manual {
            return Ok(None);
        }
        let request_id = Uuid::new_v4().to_string();
        self.lock_approvals().insert(
            request_id.clone(),
            Approval {
                transfer_id: request.transfer_id.clone(),
                status: ApprovalStatus::Pending,
                since: Instant::now(),
            },
        );
        self.events.emit(TransferEvent::AwaitingApproval {
            transfer_id: request.transfer_id.clone(),
            request_id: request_id.clone(),
        });
        Ok(Some(request_id))
    }

    async fn receive_chunk(&self, header: &ChunkHeader, body: &[u8]) -> Result<(), ReceiveError> {
        self.ensure_open()?;
        self.sweep_approvals().await;
        let session = self
            .sessions
            .get(&header.transfer_id)
            .ok_or_else(|| ReceiveError::UnknownTransfer(header.transfer_id.clone()))?;

        match session.phase() {
            ReceivePhase::Receiving => {}
            ReceivePhase::PendingApproval => {
                return Err(ReceiveError::NotApproved(header.transfer_id.clone()));
            }
            other => {
                return Err(ReceiveError::State(format!(
                    "transfer is {other:?}, not accepting chunks"
                )));
            }
        }
        if header.encrypted != session.key.is_some() {
            return Err(ReceiveError::InvalidRequest(
                "chunk encryption flag does not match the transfer".into(),
            ));
        }

        let max = self.config.max_chunk_size as usize;
        let plaintext = match &session.key {
            Some(key) => ChunkCipher::with_max_plaintext(key, max)
                .decrypt(body)
                .map_err(|source| ReceiveError::Decryption {
                    index: header.chunk_index,
                    source,
                })?,
            None if body.len() > max => {
                return Err(ReceiveError::InvalidRequest(format!(
                    "chunk of {} bytes exceeds the {max} byte limit",
                    body.len()
                )));
            }
            None => body.to_vec(),
        };
        if plaintext.len() != header.original_size as usize {
            warn!(
                chunk = header.chunk_index,
                declared = header.original_size,
                actual = plaintext.len(),
                "declared chunk size differs from payload"
            );
        }

        let len = plaintext.len() as u64;
        let first = session
            .writer
            .write_chunk(header.chunk_index, plaintext)
            .await?;
        if first {
            session.speed.record(len);
            self.events.emit(TransferEvent::Progress(session.progress()));
        } else {
            debug!(
                transfer_id = %header.transfer_id,
                chunk = header.chunk_index,
                "duplicate chunk rewritten"
            );
        }
        Ok(())
    }

    async fn complete(&self, request: &CompleteRequest) -> Result<(PathBuf, u64), ReceiveError> {
        self.ensure_open()?;
        let session = self
            .sessions
            .get(&request.transfer_id)
            .ok_or_else(|| ReceiveError::UnknownTransfer(request.transfer_id.clone()))?;

        let expected = [request.file_hash.as_str(), session.announced_hash.as_str()]
            .into_iter()
            .find(|h| is_hex_digest(h))
            .map(str::to_ascii_lowercase)
            .ok_or_else(|| ReceiveError::InvalidRequest("no file hash to verify against".into()))?;

        {
            let mut phase = session.lock_phase();
            match *phase {
                ReceivePhase::Receiving => {}
                ReceivePhase::PendingApproval => {
                    return Err(ReceiveError::NotApproved(request.transfer_id.clone()));
                }
                other => {
                    return Err(ReceiveError::State(format!("transfer is already {other:?}")));
                }
            }
            let missing = session.writer.missing_chunks();
            if !missing.is_empty() {
                return Err(ReceiveError::MissingChunks(missing));
            }
            *phase = ReceivePhase::Verifying;
        }

        match self.verify_and_save(&session, &expected).await {
            Ok(path) => {
                self.sessions.remove(&session.transfer_id);
                self.release(session.writer.final_path());
                self.forget_approval(&session.transfer_id);
                session.set_phase(ReceivePhase::Saved);
                let size = session.writer.total_size();
                info!(
                    transfer_id = %session.transfer_id,
                    path = %path.display(),
                    size,
                    "transfer saved"
                );
                self.events.emit(TransferEvent::Completed {
                    transfer_id: session.transfer_id.clone(),
                    direction: Direction::Receive,
                    path: Some(path.clone()),
                    file_hash: expected,
                });
                Ok((path, size))
            }
            Err(e) => {
                let phase = match e {
                    ReceiveError::HashMismatch { .. } => ReceivePhase::Corrupted,
                    _ => ReceivePhase::Failed,
                };
                self.discard(&session.transfer_id, phase).await;
                self.events.emit(TransferEvent::Failed {
                    transfer_id: session.transfer_id.clone(),
                    direction: Direction::Receive,
                    error: e.to_string(),
                });
                Err(e)
            }
        }
    }

    /// Moves the file into place and checks its digest. Any failure after the
    /// move deletes the saved file.
    async fn verify_and_save(
        &self,
        session: &ReceiveSession,
        expected: &str,
    ) -> Result<PathBuf, ReceiveError> {
        let dest = match self.config.collision {
            CollisionPolicy::Overwrite => session.writer.final_path().to_path_buf(),
            CollisionPolicy::Rename => resolve_collision(session.writer.final_path())?,
        };
        let path = session.writer.finalize_to(&dest).await?;

        let options = HashOptions::default()
            .with_timeout(self.config.hash_timeout)
            .with_cancel(self.cancel.child_token());
        let actual = match hash_file(path.clone(), options).await {
            Ok(digest) => digest,
            Err(e) => {
                remove_quietly(&path).await;
                return Err(e.into());
            }
        };
        if actual != expected {
            remove_quietly(&path).await;
            return Err(ReceiveError::HashMismatch {
                expected: expected.to_string(),
                actual,
            });
        }
        Ok(path)
    }

    /// Removes a session and its partial output. Returns `false` if unknown.
    async fn discard(&self, transfer_id: &str, phase: ReceivePhase) -> bool {
        let Some(session) = self.sessions.remove(transfer_id) else {
            return false;
        };
        session.set_phase(phase);
        session.writer.abort().await;
        self.release(session.writer.final_path());
        self.forget_approval(transfer_id);
        true
    }

    /// Drops the approval entry of a finished or discarded transfer, keeping
    /// refusals for [`Self::sweep_approvals`] to age out.
    fn forget_approval(&self, transfer_id: &str) {
        self.lock_approvals()
            .retain(|_, a| a.transfer_id != transfer_id || a.is_refusal());
    }

    /// Expires pending approvals older than the approval timeout, discarding
    /// their sessions, and drops refusals settled longer than that ago.
    async fn sweep_approvals(&self) {
        let timeout = self.config.approval_timeout;
        let expired: Vec<String> = {
            let mut approvals = self.lock_approvals();
            approvals.retain(|_, a| !a.is_refusal() || a.since.elapsed() < timeout);
            approvals
                .values_mut()
                .filter(|a| a.status == ApprovalStatus::Pending)
                .filter(|a| a.since.elapsed() >= timeout)
                .map(|a| {
                    a.settle(ApprovalStatus::Expired);
                    a.transfer_id.clone()
                })
                .collect()
        };
        for transfer_id in expired {
            info!(%transfer_id, "approval request expired");
            if self.discard(&transfer_id, ReceivePhase::Aborted).await {
                self.events.emit(TransferEvent::Cancelled {
                    transfer_id,
                    direction: Direction::Receive,
                });
            }
        }
    }

    fn ensure_open(&self) -> Result<(), ReceiveError> {
        if self.is_disposed() {
            return Err(ReceiveError::Disposed);
        }
        Ok(())
    }

    fn release(&self, path: &Path) {
        self.lock_reserved().remove(path);
    }

    fn lock_approvals(&self) -> MutexGuard<'_, HashMap<String, Approval>> {
        self.approvals.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_reserved(&self) -> MutexGuard<'_, HashSet<PathBuf>> {
        self.reserved.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn validate_initiate(request: &InitiateRequest, max_chunk_size: u32) -> Result<(), ReceiveError> {
    let invalid = |msg: String| Err(ReceiveError::InvalidRequest(msg));

    if request.transfer_id.trim().is_empty() {
        return invalid("transfer id is empty".into());
    }
    if request.sender_id.trim().is_empty() {
        return invalid("sender id is empty".into());
    }
    if request.chunk_size == 0 || request.chunk_size > max_chunk_size {
        return invalid(format!(
            "chunk size {} outside 1..={max_chunk_size}",
            request.chunk_size
        ));
    }
    let expected = chunk_count(request.file_size, request.chunk_size)?;
    if request.total_chunks != expected {
        return invalid(format!(
            "{} chunks announced, {} bytes at {} per chunk needs {expected}",
            request.total_chunks, request.file_size, request.chunk_size
        ));
    }
    if request.file_hash != PENDING_HASH && !is_hex_digest(&request.file_hash) {
        return invalid(format!("malformed file hash {:?}", request.file_hash));
    }
    Ok(())
}

async fn remove_quietly(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => debug!(path = %path.display(), "removed unverified file"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "failed to remove file"),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::keys::StaticKeys;
    use syndro_protocol::ErrorKind;
    use syndro_transfer::{DEFAULT_CHUNK_SIZE, checksum_bytes, encrypt_chunk};
    use tempfile::TempDir;

    fn receiver(dir: &TempDir) -> ParallelReceiver {
        ParallelReceiver::new(
            ReceiverConfig::new(dir.path()),
            Arc::new(StaticKeys::new()),
        )
    }

    fn initiate_request(id: &str, name: &str, size: u64, chunk_size: u32) -> InitiateRequest {
        InitiateRequest {
            transfer_id: id.into(),
            file_name: name.into(),
            file_size: size,
            file_hash: PENDING_HASH.into(),
            total_chunks: chunk_count(size, chunk_size).unwrap(),
            chunk_size,
            sender_id: "peer-a".into(),
            sender_name: "Peer A".into(),
            encrypted: false,
        }
    }

    fn header(id: &str, index: u32, len: usize) -> ChunkHeader {
        ChunkHeader {
            transfer_id: id.into(),
            chunk_index: index,
            original_size: len as u32,
            sender_id: "peer-a".into(),
            encrypted: false,
        }
    }

    fn complete(id: &str, data: &[u8]) -> CompleteRequest {
        CompleteRequest {
            transfer_id: id.into(),
            file_hash: checksum_bytes(data),
        }
    }

    #[tokio::test]
    async fn out_of_order_chunks_assemble() {
        let dir = TempDir::new().unwrap();
        let rx = receiver(&dir);
        let data: Vec<u8> = (0..10u8).collect();

        assert!(rx.handle_initiate(&initiate_request("t1", "f.bin", 10, 4)).await.success);
        for index in [2u32, 0, 1] {
            let start = index as usize * 4;
            let end = (start + 4).min(data.len());
            let ack = rx
                .handle_chunk(&header("t1", index, end - start), &data[start..end])
                .await;
            assert!(ack.success, "{ack:?}");
        }

        let snapshot = rx.session("t1").unwrap();
        assert_eq!(snapshot.chunks_received, 3);
        assert_eq!(snapshot.bytes_received, 10);

        let response = rx.handle_complete(&complete("t1", &data)).await;
        assert!(response.success, "{response:?}");
        assert_eq!(response.size, Some(10));
        assert_eq!(std::fs::read(dir.path().join("f.bin")).unwrap(), data);
        assert!(rx.session("t1").is_none());
    }

    #[tokio::test]
    async fn initiate_validation() {
        let dir = TempDir::new().unwrap();
        let rx = receiver(&dir);

        let mut bad_count = initiate_request("t1", "f.bin", 10, 4);
        bad_count.total_chunks = 2;
        let response = rx.handle_initiate(&bad_count).await;
        assert_eq!(response.error.unwrap().kind, ErrorKind::InvalidRequest);

        let mut too_big = initiate_request("t1", "f.bin", 10, 4);
        too_big.chunk_size = rx.config().max_chunk_size + 1;
        assert!(!rx.handle_initiate(&too_big).await.success);

        let traversal = initiate_request("t1", "../escape.bin", 10, 4);
        let response = rx.handle_initiate(&traversal).await;
        assert_eq!(response.error.unwrap().kind, ErrorKind::InvalidPath);

        let mut encrypted = initiate_request("t1", "f.bin", 10, 4);
        encrypted.encrypted = true;
        assert!(!rx.handle_initiate(&encrypted).await.success);

        assert!(rx.active_transfers().is_empty());
    }

    #[tokio::test]
    async fn duplicate_destination_conflicts() {
        let dir = TempDir::new().unwrap();
        let rx = receiver(&dir);
        assert!(rx.handle_initiate(&initiate_request("t1", "same.bin", 4, 4)).await.success);

        let response = rx
            .handle_initiate(&initiate_request("t2", "same.bin", 4, 4))
            .await;
        assert_eq!(response.error.unwrap().kind, ErrorKind::Conflict);

        let response = rx
            .handle_initiate(&initiate_request("t1", "other.bin", 4, 4))
            .await;
        assert_eq!(response.error.unwrap().kind, ErrorKind::Conflict);

        assert!(rx.abort("t1").await);
        assert!(rx.handle_initiate(&initiate_request("t2", "same.bin", 4, 4)).await.success);
    }

    #[tokio::test]
    async fn unknown_transfer_chunk_refused() {
        let dir = TempDir::new().unwrap();
        let rx = receiver(&dir);
        let ack = rx.handle_chunk(&header("nope", 0, 3), b"abc").await;
        assert!(!ack.success);
        assert_eq!(ack.error.unwrap().kind, ErrorKind::UnknownTransfer);
    }

    #[tokio::test]
    async fn missing_chunks_keep_session_open() {
        let dir = TempDir::new().unwrap();
        let rx = receiver(&dir);
        let data = b"abcdefgh";
        assert!(rx.handle_initiate(&initiate_request("t1", "f.bin", 8, 4)).await.success);
        rx.handle_chunk(&header("t1", 0, 4), &data[..4]).await;

        let response = rx.handle_complete(&complete("t1", data)).await;
        let error = response.error.unwrap();
        assert_eq!(error.kind, ErrorKind::MissingChunks);
        assert_eq!(error.missing_chunks, vec![1]);
        assert_eq!(rx.session("t1").unwrap().phase, ReceivePhase::Receiving);

        rx.handle_chunk(&header("t1", 1, 4), &data[4..]).await;
        assert!(rx.handle_complete(&complete("t1", data)).await.success);
    }

    #[tokio::test]
    async fn hash_mismatch_deletes_output() {
        let dir = TempDir::new().unwrap();
        let rx = receiver(&dir);
        assert!(rx.handle_initiate(&initiate_request("t1", "f.bin", 4, 4)).await.success);
        rx.handle_chunk(&header("t1", 0, 4), b"abcd").await;

        let response = rx.handle_complete(&complete("t1", b"wxyz")).await;
        let error = response.error.unwrap();
        assert_eq!(error.kind, ErrorKind::HashMismatch);
        assert_eq!(error.actual_hash, Some(checksum_bytes(b"abcd")));
        assert!(!dir.path().join("f.bin").exists());
        assert!(!dir.path().join("f.bin.tmp").exists());
        assert!(rx.session("t1").is_none());
    }

    #[tokio::test]
    async fn encrypted_chunks_decrypt() {
        let dir = TempDir::new().unwrap();
        let key = SecretKey::from_bytes([9; 32]);
        let keys = StaticKeys::new();
        keys.insert("peer-a", key.clone());
        let rx = ParallelReceiver::new(ReceiverConfig::new(dir.path()), Arc::new(keys));

        let mut request = initiate_request("t1", "secret.txt", 5, 8);
        request.encrypted = true;
        assert!(rx.handle_initiate(&request).await.success);

        let mut chunk = header("t1", 0, 5);
        chunk.encrypted = true;
        let mut frame = encrypt_chunk(b"hello", &key).unwrap();
        let last = frame.len() - 1;
        frame[last] ^= 1;
        let ack = rx.handle_chunk(&chunk, &frame).await;
        assert_eq!(ack.error.unwrap().kind, ErrorKind::Decryption);

        let ack = rx.handle_chunk(&chunk, &frame[..10]).await;
        assert_eq!(ack.error.unwrap().kind, ErrorKind::Format);

        let frame = encrypt_chunk(b"hello", &key).unwrap();
        assert!(rx.handle_chunk(&chunk, &frame).await.success);
        assert!(rx.handle_complete(&complete("t1", b"hello")).await.success);
        assert_eq!(std::fs::read(dir.path().join("secret.txt")).unwrap(), b"hello");
    }

    #[tokio::test]
    async fn collision_renames_on_save() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("f.txt"), b"old").unwrap();
        let rx = receiver(&dir);

        assert!(rx.handle_initiate(&initiate_request("t1", "f.txt", 3, 4)).await.success);
        rx.handle_chunk(&header("t1", 0, 3), b"new").await;
        let response = rx.handle_complete(&complete("t1", b"new")).await;

        let saved = PathBuf::from(response.path.unwrap());
        assert_eq!(saved, dir.path().join("f (1).txt"));
        assert_eq!(std::fs::read(dir.path().join("f.txt")).unwrap(), b"old");
        assert_eq!(std::fs::read(saved).unwrap(), b"new");
    }

    #[tokio::test]
    async fn manual_approval_flow() {
        let dir = TempDir::new().unwrap();
        let mut config = ReceiverConfig::new(dir.path());
        config.approval = ApprovalMode::Manual;
        let rx = ParallelReceiver::new(config, Arc::new(StaticKeys::new()));

        let response = rx.handle_initiate(&initiate_request("t1", "f.bin", 4, 4)).await;
        let request_id = response.request_id.unwrap();
        assert_eq!(
            rx.approval_status(&request_id).await.status,
            ApprovalStatus::Pending
        );

        let ack = rx.handle_chunk(&header("t1", 0, 4), b"abcd").await;
        assert_eq!(ack.error.unwrap().kind, ErrorKind::NotApproved);

        rx.approve(&request_id).await.unwrap();
        assert_eq!(
            rx.approval_status(&request_id).await.status,
            ApprovalStatus::Approved
        );
        assert!(rx.handle_chunk(&header("t1", 0, 4), b"abcd").await.success);
        assert_eq!(
            rx.approval_status("unknown").await.status,
            ApprovalStatus::Expired
        );
    }

    #[tokio::test]
    async fn rejection_discards_session() {
        let dir = TempDir::new().unwrap();
        let mut config = ReceiverConfig::new(dir.path());
        config.approval = ApprovalMode::Manual;
        let rx = ParallelReceiver::new(config, Arc::new(StaticKeys::new()));

        let response = rx.handle_initiate(&initiate_request("t1", "f.bin", 4, 4)).await;
        let request_id = response.request_id.unwrap();
        rx.reject(&request_id).await.unwrap();

        assert_eq!(
            rx.approval_status(&request_id).await.status,
            ApprovalStatus::Rejected
        );
        assert!(rx.session("t1").is_none());
        assert!(!dir.path().join("f.bin.tmp").exists());
        assert!(rx.approve(&request_id).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn pending_requests_expire() {
        let dir = TempDir::new().unwrap();
        let mut config = ReceiverConfig::new(dir.path());
        config.approval = ApprovalMode::Manual;
        config.approval_timeout = Duration::from_secs(5);
        let rx = ParallelReceiver::new(config, Arc::new(StaticKeys::new()));

        let response = rx.handle_initiate(&initiate_request("t1", "f.bin", 4, 4)).await;
        let request_id = response.request_id.unwrap();

        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(
            rx.approval_status(&request_id).await.status,
            ApprovalStatus::Expired
        );
        assert!(rx.session("t1").is_none());
    }

    #[tokio::test]
    async fn approval_entries_leave_with_their_sessions() {
        let dir = TempDir::new().unwrap();
        let mut config = ReceiverConfig::new(dir.path());
        config.approval = ApprovalMode::Manual;
        let rx = ParallelReceiver::new(config, Arc::new(StaticKeys::new()));

        for round in 0..20 {
            let id = format!("t{round}");
            let response = rx.handle_initiate(&initiate_request(&id, "f.bin", 4, 4)).await;
            rx.approve(&response.request_id.unwrap()).await.unwrap();
            assert!(rx.handle_chunk(&header(&id, 0, 4), b"abcd").await.success);
            assert!(rx.handle_complete(&complete(&id, b"abcd")).await.success);
            std::fs::remove_file(dir.path().join("f.bin")).unwrap();
        }
        assert!(rx.active_transfers().is_empty());
        assert!(rx.lock_approvals().is_empty());

        let response = rx.handle_initiate(&initiate_request("pending", "g.bin", 4, 4)).await;
        let request_id = response.request_id.unwrap();
        assert!(rx.abort("pending").await);
        assert!(rx.lock_approvals().is_empty());
        assert_eq!(
            rx.approval_status(&request_id).await.status,
            ApprovalStatus::Expired
        );
    }

    #[tokio::test(start_paused = true)]
    async fn stale_requests_expire_under_chunk_traffic() {
        let dir = TempDir::new().unwrap();
        let mut config = ReceiverConfig::new(dir.path());
        config.approval = ApprovalMode::Manual;
        config.approval_timeout = Duration::from_secs(5);
        let rx = ParallelReceiver::new(config, Arc::new(StaticKeys::new()));

        let response = rx.handle_initiate(&initiate_request("t1", "f.bin", 4, 4)).await;
        let request_id = response.request_id.unwrap();
        assert!(dir.path().join("f.bin.tmp").exists());

        tokio::time::advance(Duration::from_secs(6)).await;
        let ack = rx.handle_chunk(&header("other", 0, 4), b"abcd").await;
        assert_eq!(ack.error.unwrap().kind, ErrorKind::UnknownTransfer);
        assert!(rx.session("t1").is_none());
        assert!(!dir.path().join("f.bin.tmp").exists());
        assert_eq!(rx.lock_approvals().len(), 1);

        // The expiry stays readable for one more timeout, then ages out.
        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(
            rx.approval_status(&request_id).await.status,
            ApprovalStatus::Expired
        );
        assert!(rx.lock_approvals().is_empty());
    }

    #[tokio::test]
    async fn hash_timeout_removes_every_output() {
        let dir = TempDir::new().unwrap();
        let mut config = ReceiverConfig::new(dir.path());
        config.hash_timeout = Duration::ZERO;
        let rx = ParallelReceiver::new(config, Arc::new(StaticKeys::new()));
        let mut events = rx.events().subscribe();

        assert!(rx.handle_initiate(&initiate_request("t1", "f.bin", 4, 4)).await.success);
        assert!(rx.handle_chunk(&header("t1", 0, 4), b"abcd").await.success);

        let response = rx.handle_complete(&complete("t1", b"abcd")).await;
        assert!(!response.success);
        assert_eq!(response.error.unwrap().kind, ErrorKind::Internal);
        assert!(!dir.path().join("f.bin").exists());
        assert!(!dir.path().join("f.bin.tmp").exists());
        assert!(rx.session("t1").is_none());

        let mut failed = false;
        while let Ok(event) = events.try_recv() {
            failed |= matches!(event, TransferEvent::Failed { .. });
        }
        assert!(failed);

        // The destination is free again.
        assert!(rx.handle_initiate(&initiate_request("t2", "f.bin", 4, 4)).await.success);
    }

    #[tokio::test]
    async fn zero_byte_file_saves() {
        let dir = TempDir::new().unwrap();
        let rx = receiver(&dir);
        let request = initiate_request("t1", "empty.txt", 0, DEFAULT_CHUNK_SIZE);
        assert_eq!(request.total_chunks, 0);
        assert!(rx.handle_initiate(&request).await.success);

        let response = rx.handle_complete(&complete("t1", b"")).await;
        assert!(response.success, "{response:?}");
        assert_eq!(response.size, Some(0));
        assert_eq!(std::fs::metadata(dir.path().join("empty.txt")).unwrap().len(), 0);
    }

    #[tokio::test]
    async fn dispose_aborts_everything() {
        let dir = TempDir::new().unwrap();
        let rx = receiver(&dir);
        assert!(rx.handle_initiate(&initiate_request("t1", "a.bin", 8, 4)).await.success);
        assert!(rx.handle_initiate(&initiate_request("t2", "b.bin", 8, 4)).await.success);
        rx.handle_chunk(&header("t1", 0, 4), b"abcd").await;

        rx.dispose().await;
        rx.dispose().await;

        assert!(rx.is_disposed());
        assert!(rx.active_transfers().is_empty());
        assert!(!dir.path().join("a.bin.tmp").exists());
        assert!(!dir.path().join("b.bin.tmp").exists());

        let response = rx.handle_initiate(&initiate_request("t3", "c.bin", 4, 4)).await;
        assert_eq!(response.error.unwrap().kind, ErrorKind::Disposed);
        let ack = rx.handle_chunk(&header("t1", 1, 4), b"efgh").await;
        assert_eq!(ack.error.unwrap().kind, ErrorKind::Disposed);
    }
}
