//! Transport abstraction under the agent.
//!
//! The agent only needs two capabilities: pull the next raw chunk off the
//! connection, and write bytes to it. TCP sockets and WebSocket streams both
//! reduce to that, so gate nodes can serve either with the same agent.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::WebSocketStream;

/// Read side of a client connection.
#[async_trait]
pub trait ConnReader: Send + 'static {
    /// The next chunk of raw bytes. An empty chunk means the peer closed.
    async fn read_chunk(&mut self) -> std::io::Result<Vec<u8>>;
}

/// Write side of a client connection.
#[async_trait]
pub trait ConnWriter: Send + 'static {
    async fn write_all(&mut self, bytes: &[u8]) -> std::io::Result<()>;

    async fn shutdown(&mut self) -> std::io::Result<()>;
}

/// A split connection handed to an agent.
pub struct AgentConn {
    pub reader: Box<dyn ConnReader>,
    pub writer: Box<dyn ConnWriter>,
    pub remote_addr: String,
}

struct TcpReader {
    half: OwnedReadHalf,
    buf: Vec<u8>,
}

#[async_trait]
impl ConnReader for TcpReader {
    async fn read_chunk(&mut self) -> std::io::Result<Vec<u8>> {
        let n = self.half.read(&mut self.buf).await?;
        Ok(self.buf[..n].to_vec())
    }
}

struct TcpWriter {
    half: OwnedWriteHalf,
}

#[async_trait]
impl ConnWriter for TcpWriter {
    async fn write_all(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        self.half.write_all(bytes).await
    }

    async fn shutdown(&mut self) -> std::io::Result<()> {
        self.half.shutdown().await
    }
}

/// Wrap an accepted TCP stream.
pub fn tcp_conn(stream: TcpStream) -> AgentConn {
    let remote_addr = stream
        .peer_addr()
        .map(|a| a.to_string())
        .unwrap_or_default();
    let (rd, wr) = stream.into_split();
    AgentConn {
        reader: Box::new(TcpReader {
            half: rd,
            buf: vec![0u8; 4096],
        }),
        writer: Box::new(TcpWriter { half: wr }),
        remote_addr,
    }
}

struct WsReader {
    stream: futures::stream::SplitStream<WebSocketStream<TcpStream>>,
}

#[async_trait]
impl ConnReader for WsReader {
    async fn read_chunk(&mut self) -> std::io::Result<Vec<u8>> {
        loop {
            match self.stream.next().await {
                Some(Ok(WsMessage::Binary(bytes))) => return Ok(bytes),
                // Control frames are tungstenite's concern; skip them.
                Some(Ok(WsMessage::Ping(_) | WsMessage::Pong(_))) => continue,
                Some(Ok(WsMessage::Text(text))) => return Ok(text.into_bytes()),
                Some(Ok(WsMessage::Close(_))) | None => return Ok(Vec::new()),
                Some(Ok(WsMessage::Frame(_))) => continue,
                Some(Err(e)) => {
                    return Err(std::io::Error::new(std::io::ErrorKind::Other, e));
                }
            }
        }
    }
}

struct WsWriter {
    sink: futures::stream::SplitSink<WebSocketStream<TcpStream>, WsMessage>,
}

#[async_trait]
impl ConnWriter for WsWriter {
    async fn write_all(&mut self, bytes: &[u8]) -> std::io::Result<()> {
        self.sink
            .send(WsMessage::Binary(bytes.to_vec()))
            .await
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))
    }

    async fn shutdown(&mut self) -> std::io::Result<()> {
        self.sink
            .close()
            .await
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))
    }
}

/// Wrap a completed WebSocket upgrade.
pub fn ws_conn(stream: WebSocketStream<TcpStream>, remote_addr: String) -> AgentConn {
    let (sink, source) = stream.split();
    AgentConn {
        reader: Box::new(WsReader { stream: source }),
        writer: Box::new(WsWriter { sink }),
        remote_addr,
    }
}
