//! Node-to-node messages carried over hidden-service connections.
//!
//! Frame format: `[4-byte BE u32 length][payload bytes]`. Control messages
//! are JSON objects tagged by `op`; resource bodies travel as one raw frame
//! right after the message that announces them.

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::config::ProtocolConfig;
use crate::resource::Resource;
use crate::{CenoError, Result};

/// Status line and headers of a resource sent ahead of its body frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceHead {
    pub status: u16,
    pub headers: Vec<(String, String)>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Message {
    /// Ask an injector to fetch `url` from its origin.
    Proxy { url: String },
    /// Followed by one body frame.
    ProxyResponse {
        status: u16,
        headers: Vec<(String, String)>,
    },
    ProxyError {
        reason: String,
        #[serde(default)]
        filtered: bool,
    },
    /// Ask a seeder to help keep `url` available. When `copy` is present a
    /// body frame follows with the requester's own copy.
    IncreaseAvailability {
        url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        copy: Option<ResourceHead>,
    },
    IncreaseAvailabilityResponse {
        accepted: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
}

/// Read one frame. Returns `None` on a clean EOF before the length prefix.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > ProtocolConfig::MAX_FRAME_SIZE {
        return Err(CenoError::protocol(format!(
            "frame of {} bytes exceeds maximum {}",
            len,
            ProtocolConfig::MAX_FRAME_SIZE
        )));
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload).await?;
    Ok(Some(payload))
}

pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, payload: &[u8]) -> Result<()> {
    if payload.len() > ProtocolConfig::MAX_FRAME_SIZE {
        return Err(CenoError::protocol(format!(
            "refusing to send {} byte frame",
            payload.len()
        )));
    }
    writer.write_all(&(payload.len() as u32).to_be_bytes()).await?;
    writer.write_all(payload).await?;
    writer.flush().await?;
    Ok(())
}

pub async fn write_message<W: AsyncWrite + Unpin>(writer: &mut W, message: &Message) -> Result<()> {
    write_frame(writer, &serde_json::to_vec(message)?).await
}

/// Read a message; `None` if the peer closed the stream.
pub async fn read_message<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<Message>> {
    match read_frame(reader).await? {
        Some(payload) => Ok(Some(serde_json::from_slice(&payload)?)),
        None => Ok(None),
    }
}

/// Read a message, treating EOF as a protocol error.
pub async fn expect_message<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Message> {
    read_message(reader)
        .await?
        .ok_or_else(|| CenoError::protocol("connection closed before message"))
}

/// Read a body frame, treating EOF as a protocol error.
pub async fn expect_body<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Vec<u8>> {
    read_frame(reader)
        .await?
        .ok_or_else(|| CenoError::protocol("connection closed before body"))
}

/// Send `resource` as a proxy response plus its body frame.
pub async fn write_proxy_response<W: AsyncWrite + Unpin>(writer: &mut W, resource: &Resource) -> Result<()> {
    write_message(
        writer,
        &Message::ProxyResponse {
            status: resource.status(),
            headers: resource.headers().to_vec(),
        },
    )
    .await?;
    write_frame(writer, resource.content()).await
}
