//! Remote peers.

use crate::{Frame, P2pError, Result};
use async_trait::async_trait;
use std::fmt;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::Mutex;
use tokio::time::timeout;

/// Lifecycle of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Stream accepted or dialed.
    Connecting,
    /// Running the handshake.
    Handshaking,
    /// Registered and decoding frames.
    Active,
    /// Terminal.
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Connecting => "connecting",
            Self::Handshaking => "handshaking",
            Self::Active => "active",
            Self::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Handle to one live remote connection.
#[async_trait]
pub trait Peer: Send + Sync + fmt::Debug {
    /// Identifier unique among this transport's connections.
    fn id(&self) -> u64;

    /// Address of the remote end.
    fn remote_addr(&self) -> String;

    /// True if this side dialed the connection.
    fn is_outbound(&self) -> bool;

    /// Writes raw bytes to the connection.
    async fn send(&self, data: &[u8]) -> Result<()>;

    /// Encodes and writes a frame.
    async fn send_frame(&self, frame: &Frame) -> Result<()> {
        let encoded = frame.encode()?;
        self.send(&encoded).await
    }

    /// Writes `frames` back to back. No other write to this peer lands
    /// between them.
    async fn send_frames(&self, frames: &[Frame]) -> Result<()>;

    /// Shuts down the sending side of the connection.
    async fn close(&self) -> Result<()>;
}

/// A peer reached over TCP.
///
/// Owns the write half of the stream; the read half belongs to the
/// connection's decode loop.
pub struct TcpPeer {
    id: u64,
    remote_addr: SocketAddr,
    outbound: bool,
    writer: Mutex<OwnedWriteHalf>,
    write_timeout: Duration,
}

impl TcpPeer {
    /// Wraps the write half of a connection.
    #[must_use]
    pub fn new(
        id: u64,
        remote_addr: SocketAddr,
        outbound: bool,
        writer: OwnedWriteHalf,
        write_timeout: Duration,
    ) -> Self {
        Self {
            id,
            remote_addr,
            outbound,
            writer: Mutex::new(writer),
            write_timeout,
        }
    }

    /// Returns the remote socket address.
    #[must_use]
    pub fn socket_addr(&self) -> SocketAddr {
        self.remote_addr
    }
}

#[async_trait]
impl Peer for TcpPeer {
    fn id(&self) -> u64 {
        self.id
    }

    fn remote_addr(&self) -> String {
        self.remote_addr.to_string()
    }

    fn is_outbound(&self) -> bool {
        self.outbound
    }

    async fn send(&self, data: &[u8]) -> Result<()> {
        let mut writer = self.writer.lock().await;
        match timeout(self.write_timeout, writer.write_all(data)).await {
            Ok(result) => result.map_err(P2pError::from),
            Err(_) => Err(P2pError::Timeout(self.write_timeout)),
        }
    }

    async fn send_frames(&self, frames: &[Frame]) -> Result<()> {
        let mut writer = self.writer.lock().await;
        for frame in frames {
            let encoded = frame.encode()?;
            match timeout(self.write_timeout, writer.write_all(&encoded)).await {
                Ok(result) => result?,
                Err(_) => return Err(P2pError::Timeout(self.write_timeout)),
            }
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        let mut writer = self.writer.lock().await;
        writer.shutdown().await?;
        Ok(())
    }
}

impl fmt::Debug for TcpPeer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpPeer")
            .field("id", &self.id)
            .field("remote_addr", &self.remote_addr)
            .field("outbound", &self.outbound)
            .finish()
    }
}
