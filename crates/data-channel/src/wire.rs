//! TCP wire format for peer requests.
//!
//! # Wire format
//!
//! ```text
//! HANDSHAKE (sender -> receiver):     [32 bytes: hex token ASCII]
//! AUTH RESPONSE (receiver -> sender): [1 byte: 0x01=OK, 0x00=rejected]
//!
//! REQUEST (sender -> receiver):
//!   [1 byte: op]
//!   [4 bytes BE: header_len][header_len bytes: JSON header]
//!   [4 bytes BE: body_len][body_len bytes: chunk body, empty for non-chunk ops]
//!
//! RESPONSE (receiver -> sender):
//!   [4 bytes BE: len][len bytes: JSON response]
//! ```
//!
//! Requests and responses alternate strictly on one connection.

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::DataChannelError;

/// Authentication response: accepted.
pub const AUTH_OK: u8 = 0x01;

/// Authentication response: rejected.
pub const AUTH_REJECTED: u8 = 0x00;

/// Token length in bytes (32 hex characters).
pub const TOKEN_LEN: usize = 32;

/// Largest accepted JSON header or response (1 MiB).
pub const MAX_JSON_LEN: u32 = 1024 * 1024;

/// Request kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Op {
    Initiate = 0x01,
    ApprovalStatus = 0x02,
    UploadChunk = 0x03,
    Complete = 0x04,
}

impl TryFrom<u8> for Op {
    type Error = DataChannelError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(Self::Initiate),
            0x02 => Ok(Self::ApprovalStatus),
            0x03 => Ok(Self::UploadChunk),
            0x04 => Ok(Self::Complete),
            other => Err(DataChannelError::Protocol(format!(
                "unknown op 0x{other:02x}"
            ))),
        }
    }
}

/// One decoded request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestFrame {
    pub op: Op,
    pub header: Vec<u8>,
    pub body: Vec<u8>,
}

impl RequestFrame {
    pub fn parse_header<T: DeserializeOwned>(&self) -> Result<T, DataChannelError> {
        Ok(serde_json::from_slice(&self.header)?)
    }
}

/// Writes a request frame. Does not flush.
pub async fn write_request<W: AsyncWrite + Unpin, H: Serialize>(
    writer: &mut W,
    op: Op,
    header: &H,
    body: &[u8],
) -> Result<(), DataChannelError> {
    let header = serde_json::to_vec(header)?;
    writer.write_u8(op as u8).await?;
    write_block(writer, &header, MAX_JSON_LEN).await?;
    write_block(writer, body, u32::MAX).await?;
    Ok(())
}

/// Reads a request frame.
///
/// Returns `None` if the peer closed the connection between requests.
/// Bodies larger than `max_body` are rejected before allocation.
pub async fn read_request<R: AsyncRead + Unpin>(
    reader: &mut R,
    max_body: u32,
) -> Result<Option<RequestFrame>, DataChannelError> {
    let op = match reader.read_u8().await {
        Ok(byte) => Op::try_from(byte)?,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    let header = read_block(reader, MAX_JSON_LEN).await?;
    let body = read_block(reader, max_body).await?;
    Ok(Some(RequestFrame { op, header, body }))
}

/// Writes a JSON response and flushes.
pub async fn write_response<W: AsyncWrite + Unpin, T: Serialize>(
    writer: &mut W,
    response: &T,
) -> Result<(), DataChannelError> {
    let json = serde_json::to_vec(response)?;
    write_block(writer, &json, MAX_JSON_LEN).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads a JSON response.
pub async fn read_response<R: AsyncRead + Unpin, T: DeserializeOwned>(
    reader: &mut R,
) -> Result<T, DataChannelError> {
    let json = read_block(reader, MAX_JSON_LEN).await?;
    Ok(serde_json::from_slice(&json)?)
}

async fn write_block<W: AsyncWrite + Unpin>(
    writer: &mut W,
    bytes: &[u8],
    max: u32,
) -> Result<(), DataChannelError> {
    let len = u32::try_from(bytes.len())
        .ok()
        .filter(|len| *len <= max)
        .ok_or_else(|| {
            DataChannelError::Protocol(format!("block of {} bytes exceeds {max}", bytes.len()))
        })?;
    writer.write_u32(len).await?;
    writer.write_all(bytes).await?;
    Ok(())
}

async fn read_block<R: AsyncRead + Unpin>(
    reader: &mut R,
    max: u32,
) -> Result<Vec<u8>, DataChannelError> {
    let len = reader.read_u32().await?;
    if len > max {
        return Err(DataChannelError::Protocol(format!(
            "block of {len} bytes exceeds {max}"
        )));
    }
    let mut buf = vec![0u8; len as usize];
    reader.read_exact(&mut buf).await?;
    Ok(buf)
}

/// Writes the authentication token (32 hex ASCII bytes).
pub async fn write_token<W: AsyncWrite + Unpin>(
    writer: &mut W,
    token: &str,
) -> Result<(), DataChannelError> {
    if !crate::token::is_well_formed(token) {
        return Err(DataChannelError::Protocol(format!(
            "token must be {TOKEN_LEN} hex characters"
        )));
    }
    writer.write_all(token.as_bytes()).await?;
    Ok(())
}

/// Reads the authentication token (32 hex ASCII bytes).
pub async fn read_token<R: AsyncRead + Unpin>(reader: &mut R) -> Result<String, DataChannelError> {
    let mut buf = [0u8; TOKEN_LEN];
    reader.read_exact(&mut buf).await?;
    String::from_utf8(buf.to_vec())
        .map_err(|e| DataChannelError::Protocol(format!("invalid token encoding: {e}")))
}

/// Writes the authentication response byte.
pub async fn write_auth_response<W: AsyncWrite + Unpin>(
    writer: &mut W,
    accepted: bool,
) -> Result<(), DataChannelError> {
    writer
        .write_u8(if accepted { AUTH_OK } else { AUTH_REJECTED })
        .await?;
    writer.flush().await?;
    Ok(())
}

/// Reads the authentication response byte.
pub async fn read_auth_response<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<bool, DataChannelError> {
    let byte = reader.read_u8().await?;
    Ok(byte == AUTH_OK)
}
