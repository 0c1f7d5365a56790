//! Broker connection framing: 4-byte big-endian length + JSON frame body.

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Ceiling on a single bus frame. Anything larger is a protocol violation.
const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Client↔broker protocol frames.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub(crate) enum Frame {
    /// Client requests delivery of `subject` under subscription `sid`.
    Sub { sid: u64, subject: String },
    /// Client cancels subscription `sid`.
    Unsub { sid: u64 },
    /// Client publishes to `subject`, optionally naming a reply subject.
    Pub {
        subject: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reply: Option<String>,
        data: Vec<u8>,
    },
    /// Broker delivers a published message to subscription `sid`.
    Msg {
        sid: u64,
        subject: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reply: Option<String>,
        data: Vec<u8>,
    },
}

pub(crate) async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    frame: &Frame,
) -> std::io::Result<()> {
    let body = serde_json::to_vec(frame)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    writer.write_all(&(body.len() as u32).to_be_bytes()).await?;
    writer.write_all(&body).await?;
    writer.flush().await
}

pub(crate) async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> std::io::Result<Frame> {
    let mut len = [0u8; 4];
    reader.read_exact(&mut len).await?;
    let len = u32::from_be_bytes(len) as usize;
    if len > MAX_FRAME_LEN {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("bus frame of {len} bytes exceeds {MAX_FRAME_LEN}"),
        ));
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    serde_json::from_slice(&body)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}
