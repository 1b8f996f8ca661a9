//! Pluggable connection handshakes.

use crate::{P2pError, Peer, Result, DEFAULT_IO_TIMEOUT};
use async_trait::async_trait;
use bytes::BufMut;
use hoard_protocol::{Version, PROTOCOL_VERSION};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::time::timeout;
use tracing::debug;

/// Negotiation run on every new connection before it is used.
///
/// Returning an error closes the connection before the peer is registered.
#[async_trait]
pub trait Handshake: Send + Sync + 'static {
    /// Negotiates with the remote side of `peer`, reading its replies from
    /// `reader`.
    async fn handshake(
        &self,
        peer: &dyn Peer,
        reader: &mut (dyn AsyncRead + Unpin + Send),
    ) -> Result<()>;
}

/// Handshake that accepts every connection.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoHandshake;

#[async_trait]
impl Handshake for NoHandshake {
    async fn handshake(
        &self,
        _peer: &dyn Peer,
        _reader: &mut (dyn AsyncRead + Unpin + Send),
    ) -> Result<()> {
        Ok(())
    }
}

/// Handshake in which both sides announce their protocol version and reject
/// incompatible peers.
///
/// Wire format, sent by each side: `"HRDH" | major u16 | minor u16 | patch u16`.
#[derive(Debug, Clone, Copy)]
pub struct VersionHandshake {
    version: Version,
    timeout: Duration,
}

impl VersionHandshake {
    /// Magic bytes opening the hello.
    pub const MAGIC: [u8; 4] = *b"HRDH";

    /// Length of the hello each side sends.
    pub const HELLO_LEN: usize = 4 + Version::ENCODED_LEN;

    /// Creates a handshake announcing [`PROTOCOL_VERSION`].
    #[must_use]
    pub fn new() -> Self {
        Self::with_version(PROTOCOL_VERSION)
    }

    /// Creates a handshake announcing `version`.
    #[must_use]
    pub fn with_version(version: Version) -> Self {
        Self {
            version,
            timeout: DEFAULT_IO_TIMEOUT,
        }
    }

    /// Sets how long to wait for the remote hello.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

impl Default for VersionHandshake {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Handshake for VersionHandshake {
    async fn handshake(
        &self,
        peer: &dyn Peer,
        reader: &mut (dyn AsyncRead + Unpin + Send),
    ) -> Result<()> {
        let mut hello = Vec::with_capacity(Self::HELLO_LEN);
        hello.put_slice(&Self::MAGIC);
        self.version.put(&mut hello);
        peer.send(&hello).await?;

        let mut reply = [0u8; Self::HELLO_LEN];
        match timeout(self.timeout, reader.read_exact(&mut reply)).await {
            Ok(Ok(_)) => {}
            Ok(Err(e)) => return Err(P2pError::Handshake(format!("reading hello: {e}"))),
            Err(_) => return Err(P2pError::Timeout(self.timeout)),
        }

        if reply[..4] != Self::MAGIC {
            return Err(P2pError::Handshake("invalid hello magic".into()));
        }
        let remote = Version::get(&mut &reply[4..])
            .ok_or_else(|| P2pError::Handshake("truncated hello".into()))?;
        if !self.version.is_compatible_with(&remote) {
            return Err(P2pError::Handshake(format!(
                "incompatible protocol version {remote} (local {})",
                self.version
            )));
        }

        debug!(peer = %peer.remote_addr(), version = %remote, "Handshake complete");
        Ok(())
    }
}
