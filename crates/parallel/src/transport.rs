//! Peer transport abstraction.
//!
//! `PeerTransport` is implemented on top of the TCP data channel. Using a
//! trait keeps the sender decoupled from sockets and testable with mocks.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use syndro_protocol::{
    ApprovalStatusResponse, ChunkAck, ChunkHeader, CompleteRequest, CompleteResponse,
    InitiateRequest, InitiateResponse,
};

use crate::error::TransportError;
use crate::receiver::ParallelReceiver;

pub type TransportFuture<'a, T> =
    Pin<Box<dyn Future<Output = Result<T, TransportError>> + Send + 'a>>;

/// One logical connection to a receiving peer.
///
/// A receiver-side failure comes back as `Ok` with `success == false` and an
/// error payload; `Err` is reserved for the transport itself.
pub trait PeerTransport: Send + Sync {
    fn initiate<'a>(&'a self, request: &'a InitiateRequest)
    -> TransportFuture<'a, InitiateResponse>;

    fn approval_status<'a>(
        &'a self,
        request_id: &'a str,
    ) -> TransportFuture<'a, ApprovalStatusResponse>;

    /// Uploads one chunk body (ciphertext frame when `header.encrypted`).
    fn upload_chunk<'a>(
        &'a self,
        header: &'a ChunkHeader,
        body: &'a [u8],
    ) -> TransportFuture<'a, ChunkAck>;

    fn notify_complete<'a>(
        &'a self,
        request: &'a CompleteRequest,
    ) -> TransportFuture<'a, CompleteResponse>;
}

/// Calls a [`ParallelReceiver`] in the same process.
#[derive(Clone)]
pub struct LoopbackTransport {
    receiver: Arc<ParallelReceiver>,
}

impl LoopbackTransport {
    pub fn new(receiver: Arc<ParallelReceiver>) -> Self {
        Self { receiver }
    }
}

impl PeerTransport for LoopbackTransport {
    fn initiate<'a>(
        &'a self,
        request: &'a InitiateRequest,
    ) -> TransportFuture<'a, InitiateResponse> {
        Box::pin(async move { Ok(self.receiver.handle_initiate(request).await) })
    }

    fn approval_status<'a>(
        &'a self,
        request_id: &'a str,
    ) -> TransportFuture<'a, ApprovalStatusResponse> {
        Box::pin(async move { Ok(self.receiver.approval_status(request_id).await) })
    }

    fn upload_chunk<'a>(
        &'a self,
        header: &'a ChunkHeader,
        body: &'a [u8],
    ) -> TransportFuture<'a, ChunkAck> {
        Box::pin(async move { Ok(self.receiver.handle_chunk(header, body).await) })
    }

    fn notify_complete<'a>(
        &'a self,
        request: &'a CompleteRequest,
    ) -> TransportFuture<'a, CompleteResponse> {
        Box::pin(async move { Ok(self.receiver.handle_complete(request).await) })
    }
}
