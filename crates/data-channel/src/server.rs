//! TCP data server (receiving side).
//!
//! Accepts any number of sender connections. Each connection authenticates
//! with the shared token and then issues requests that are dispatched to a
//! [`ParallelReceiver`].

use std::net::SocketAddr;
use std::sync::Arc;

use syndro_parallel::ParallelReceiver;
use syndro_protocol::{ApprovalStatusRequest, ChunkHeader, CompleteRequest, InitiateRequest};
use tokio::io::{BufReader, BufWriter};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::DataChannelError;
use crate::wire::{Op, RequestFrame, read_request, read_token, write_auth_response, write_response};
use crate::{TCP_AUTH_TIMEOUT, TCP_BUFFER_SIZE};

/// Info about a bound listener, shared with senders out of band.
#[derive(Debug, Clone)]
pub struct DataChannelInfo {
    pub port: u16,
    pub token: String,
}

/// TCP data server for receiving parallel transfers.
pub struct TcpDataServer {
    receiver: Arc<ParallelReceiver>,
    token: String,
    cancel: CancellationToken,
}

impl TcpDataServer {
    pub fn new(receiver: Arc<ParallelReceiver>, token: String, cancel: CancellationToken) -> Self {
        Self {
            receiver,
            token,
            cancel,
        }
    }

    pub fn receiver(&self) -> &Arc<ParallelReceiver> {
        &self.receiver
    }

    /// Binds a TCP listener on `addr` (port 0 picks an ephemeral port).
    pub async fn listen(
        &self,
        addr: SocketAddr,
    ) -> Result<(DataChannelInfo, TcpListener), DataChannelError> {
        let listener = TcpListener::bind(addr).await?;
        let port = listener.local_addr()?.port();

        info!(port, "TCP data channel listener bound");

        Ok((
            DataChannelInfo {
                port,
                token: self.token.clone(),
            },
            listener,
        ))
    }

    /// Accepts connections until cancelled. Each connection runs on its own task.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> Result<(), DataChannelError> {
        loop {
            let (stream, addr) = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    info!("TCP data channel: server stopped");
                    return Ok(());
                }
                result = listener.accept() => result?,
            };

            debug!(%addr, "TCP data channel connection accepted");
            let server = Arc::clone(&self);
            tokio::spawn(async move {
                match server.handle_connection(stream).await {
                    Ok(()) => debug!(%addr, "TCP data channel connection closed"),
                    Err(DataChannelError::Cancelled) => {}
                    Err(e) => warn!(%addr, error = %e, "TCP data channel connection failed"),
                }
            });
        }
    }

    async fn handle_connection(&self, stream: TcpStream) -> Result<(), DataChannelError> {
        stream.set_nodelay(true)?;
        let (reader, writer) = stream.into_split();
        let mut reader = BufReader::with_capacity(TCP_BUFFER_SIZE, reader);
        let mut writer = BufWriter::new(writer);

        let received_token = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                return Err(DataChannelError::Cancelled);
            }
            result = tokio::time::timeout(TCP_AUTH_TIMEOUT, read_token(&mut reader)) => {
                match result {
                    Ok(Ok(t)) => t,
                    Ok(Err(e)) => return Err(e),
                    Err(_) => return Err(DataChannelError::Timeout),
                }
            }
        };

        if !crate::token::validate_token(&received_token, &self.token) {
            warn!("TCP data channel: invalid token");
            write_auth_response(&mut writer, false).await?;
            return Err(DataChannelError::AuthFailed("invalid token".into()));
        }

        write_auth_response(&mut writer, true).await?;
        debug!("TCP data channel: authenticated");

        let max_body = self
            .receiver
            .config()
            .max_chunk_size
            .saturating_add(syndro_transfer::FRAME_OVERHEAD as u32);

        loop {
            // Only the wait for the next request is cancellable; a request
            // already read is answered.
            let frame = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    return Err(DataChannelError::Cancelled);
                }
                result = read_request(&mut reader, max_body) => result?,
            };
            let Some(frame) = frame else {
                return Ok(());
            };
            self.dispatch(&frame, &mut writer).await?;
        }
    }

    async fn dispatch<W>(&self, frame: &RequestFrame, writer: &mut W) -> Result<(), DataChannelError>
    where
        W: tokio::io::AsyncWrite + Unpin,
    {
        match frame.op {
            Op::Initiate => {
                let request: InitiateRequest = frame.parse_header()?;
                let response = self.receiver.handle_initiate(&request).await;
                write_response(writer, &response).await
            }
            Op::ApprovalStatus => {
                let request: ApprovalStatusRequest = frame.parse_header()?;
                let response = self.receiver.approval_status(&request.request_id).await;
                write_response(writer, &response).await
            }
            Op::UploadChunk => {
                let header: ChunkHeader = frame.parse_header()?;
                let ack = self.receiver.handle_chunk(&header, &frame.body).await;
                write_response(writer, &ack).await
            }
            Op::Complete => {
                let request: CompleteRequest = frame.parse_header()?;
                let response = self.receiver.handle_complete(&request).await;
                write_response(writer, &response).await
            }
        }
    }
}
