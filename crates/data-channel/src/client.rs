//! TCP data client (sending side).
//!
//! One [`TcpPeerClient`] backs one upload lane. It opens its connection
//! lazily, authenticates with the token, and keeps the stream for later
//! requests. A stream that fails mid-request is dropped and reopened on
//! the next call.

use std::net::SocketAddr;

use serde::Serialize;
use serde::de::DeserializeOwned;
use syndro_parallel::{PeerTransport, TransportFuture};
use syndro_protocol::{
    ApprovalStatusRequest, ApprovalStatusResponse, ChunkAck, ChunkHeader, CompleteRequest,
    CompleteResponse, DeviceDescriptor, InitiateRequest, InitiateResponse,
};
use tokio::io::{AsyncWriteExt, BufReader, BufWriter};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::DataChannelError;
use crate::wire::{Op, read_auth_response, read_response, write_request, write_token};
use crate::{TCP_AUTH_TIMEOUT, TCP_BUFFER_SIZE, TCP_CONNECT_TIMEOUT};

struct Connection {
    reader: BufReader<OwnedReadHalf>,
    writer: BufWriter<OwnedWriteHalf>,
}

/// [`PeerTransport`] over one authenticated TCP connection.
pub struct TcpPeerClient {
    addr: SocketAddr,
    token: String,
    conn: Mutex<Option<Connection>>,
}

impl TcpPeerClient {
    pub fn new(addr: SocketAddr, token: impl Into<String>) -> Self {
        Self {
            addr,
            token: token.into(),
            conn: Mutex::new(None),
        }
    }

    /// Client for a peer handed over by discovery. The descriptor's address
    /// must be an IP literal.
    pub fn for_device(
        device: &DeviceDescriptor,
        token: impl Into<String>,
    ) -> Result<Self, DataChannelError> {
        let addr = device.socket_addr().parse::<SocketAddr>().map_err(|e| {
            DataChannelError::Protocol(format!(
                "device {} has no usable address {:?}: {e}",
                device.id, device.address
            ))
        })?;
        Ok(Self::new(addr, token))
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Opens the connection now instead of on the first request.
    pub async fn connect(&self) -> Result<(), DataChannelError> {
        let mut guard = self.conn.lock().await;
        if guard.is_none() {
            *guard = Some(self.open().await?);
        }
        Ok(())
    }

    /// Drops the connection; the next request reconnects.
    pub async fn close(&self) {
        if let Some(mut conn) = self.conn.lock().await.take() {
            let _ = conn.writer.shutdown().await;
        }
    }

    pub async fn is_connected(&self) -> bool {
        self.conn.lock().await.is_some()
    }

    async fn open(&self) -> Result<Connection, DataChannelError> {
        let stream = match tokio::time::timeout(TCP_CONNECT_TIMEOUT, TcpStream::connect(self.addr))
            .await
        {
            Ok(Ok(s)) => s,
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => return Err(DataChannelError::Timeout),
        };
        stream.set_nodelay(true)?;

        let (reader, writer) = stream.into_split();
        let mut reader = BufReader::new(reader);
        let mut writer = BufWriter::with_capacity(TCP_BUFFER_SIZE, writer);

        write_token(&mut writer, &self.token).await?;
        writer.flush().await?;

        let accepted =
            match tokio::time::timeout(TCP_AUTH_TIMEOUT, read_auth_response(&mut reader)).await {
                Ok(Ok(a)) => a,
                Ok(Err(e)) => return Err(e),
                Err(_) => return Err(DataChannelError::Timeout),
            };

        if !accepted {
            return Err(DataChannelError::AuthFailed("peer rejected token".into()));
        }

        info!(addr = %self.addr, "TCP data channel connected");
        Ok(Connection { reader, writer })
    }

    /// Sends one request and waits for its response.
    ///
    /// Requests on one client are serialized; parallelism comes from using
    /// one client per lane.
    async fn request<H, T>(&self, op: Op, header: &H, body: &[u8]) -> Result<T, DataChannelError>
    where
        H: Serialize,
        T: DeserializeOwned,
    {
        let mut guard = self.conn.lock().await;
        // The slot stays empty while the exchange runs, so a request dropped
        // halfway (timeout, cancellation) closes the stream with it instead
        // of leaving an unread response behind for the next caller.
        let mut conn = match guard.take() {
            Some(conn) => conn,
            None => self.open().await?,
        };

        match exchange(&mut conn, op, header, body).await {
            Ok(response) => {
                *guard = Some(conn);
                Ok(response)
            }
            Err(e) => {
                debug!(addr = %self.addr, error = %e, "dropping TCP data channel connection");
                Err(e)
            }
        }
    }
}

async fn exchange<H, T>(
    conn: &mut Connection,
    op: Op,
    header: &H,
    body: &[u8],
) -> Result<T, DataChannelError>
where
    H: Serialize,
    T: DeserializeOwned,
{
    write_request(&mut conn.writer, op, header, body).await?;
    conn.writer.flush().await?;
    read_response(&mut conn.reader).await
}

impl PeerTransport for TcpPeerClient {
    fn initiate<'a>(
        &'a self,
        request: &'a InitiateRequest,
    ) -> TransportFuture<'a, InitiateResponse> {
        Box::pin(async move { Ok(self.request(Op::Initiate, request, &[]).await?) })
    }

    fn approval_status<'a>(
        &'a self,
        request_id: &'a str,
    ) -> TransportFuture<'a, ApprovalStatusResponse> {
        Box::pin(async move {
            let request = ApprovalStatusRequest {
                request_id: request_id.to_string(),
            };
            Ok(self.request(Op::ApprovalStatus, &request, &[]).await?)
        })
    }

    fn upload_chunk<'a>(
        &'a self,
        header: &'a ChunkHeader,
        body: &'a [u8],
    ) -> TransportFuture<'a, ChunkAck> {
        Box::pin(async move { Ok(self.request(Op::UploadChunk, header, body).await?) })
    }

    fn notify_complete<'a>(
        &'a self,
        request: &'a CompleteRequest,
    ) -> TransportFuture<'a, CompleteResponse> {
        Box::pin(async move { Ok(self.request(Op::Complete, request, &[]).await?) })
    }
}
