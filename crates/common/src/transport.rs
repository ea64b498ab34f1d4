//! JSON-line transport for signed envelopes over TCP.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use crate::auth::{AuthError, Envelope, Signer};
use crate::protocol::Message;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Longest accepted line; larger frames are treated as malformed.
const MAX_FRAME: usize = 16 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("connect to {addr} failed: {source}")]
    Connect { addr: String, source: io::Error },
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("malformed message: {0}")]
    Decode(#[from] serde_json::Error),
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error("message failed authentication")]
    BadSignature,
    #[error("frame exceeds {MAX_FRAME} bytes")]
    Oversized,
    #[error("timed out")]
    Timeout,
    #[error("connection closed before a reply was received")]
    Closed,
}

/// One framed connection, used by both sides of an exchange.
pub struct Connection {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
    peer: Option<SocketAddr>,
}

impl Connection {
    pub fn new(stream: TcpStream) -> Self {
        let peer = stream.peer_addr().ok();
        let (reader, writer) = stream.into_split();
        Self {
            reader: BufReader::new(reader),
            writer,
            peer,
        }
    }

    pub async fn connect(addr: &str, limit: Duration) -> Result<Self, TransportError> {
        let stream = timeout(limit, TcpStream::connect(addr))
            .await
            .map_err(|_| TransportError::Timeout)?
            .map_err(|source| TransportError::Connect {
                addr: addr.to_string(),
                source,
            })?;
        Ok(Self::new(stream))
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// Read the next envelope. `Ok(None)` means the peer closed the stream.
    pub async fn recv(&mut self, key: &[u8]) -> Result<Option<Envelope>, TransportError> {
        let mut line = String::new();
        loop {
            line.clear();
            if self.reader.read_line(&mut line).await? == 0 {
                return Ok(None);
            }
            if line.len() > MAX_FRAME {
                return Err(TransportError::Oversized);
            }
            let raw = line.trim();
            if raw.is_empty() {
                continue;
            }
            let envelope: Envelope = serde_json::from_str(raw)?;
            if !envelope.verify(key) {
                return Err(TransportError::BadSignature);
            }
            return Ok(Some(envelope));
        }
    }

    pub async fn send(&mut self, envelope: &Envelope) -> Result<(), TransportError> {
        let line = serde_json::to_string(envelope)? + "\n";
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Half-close the connection; the peer sees EOF.
    pub async fn close(mut self) -> Result<(), TransportError> {
        self.writer.shutdown().await?;
        Ok(())
    }
}

/// Capability used by the daemon and step managers to reach other parties.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Send a message and wait for the single reply.
    async fn call(&self, addr: &str, message: Message) -> Result<Envelope, TransportError>;

    /// Deliver a message without waiting for a reply.
    async fn send(&self, addr: &str, message: Message) -> Result<(), TransportError>;
}

#[derive(Debug, Clone)]
pub struct TcpTransport {
    signer: Signer,
    timeout: Duration,
}

impl TcpTransport {
    pub fn new(signer: Signer) -> Self {
        Self {
            signer,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, limit: Duration) -> Self {
        self.timeout = limit;
        self
    }

    pub fn signer(&self) -> &Signer {
        &self.signer
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn call(&self, addr: &str, message: Message) -> Result<Envelope, TransportError> {
        let kind = message.kind();
        let envelope = self.signer.seal(message)?;
        let mut conn = Connection::connect(addr, self.timeout).await?;
        conn.send(&envelope).await?;
        let reply = timeout(self.timeout, conn.recv(self.signer.key()))
            .await
            .map_err(|_| TransportError::Timeout)??;
        debug!(addr, kind, "call completed");
        reply.ok_or(TransportError::Closed)
    }

    async fn send(&self, addr: &str, message: Message) -> Result<(), TransportError> {
        let kind = message.kind();
        let envelope = self.signer.seal(message)?;
        let mut conn = Connection::connect(addr, self.timeout).await?;
        timeout(self.timeout, conn.send(&envelope))
            .await
            .map_err(|_| TransportError::Timeout)??;
        conn.close().await?;
        debug!(addr, kind, "message sent");
        Ok(())
    }
}
