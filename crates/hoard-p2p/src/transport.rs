//! TCP transport.

use crate::{
    ConnectionState, Decoder, FramedDecoder, Handshake, NoHandshake, P2pError, Peer, Result, Rpc,
    TcpPeer, DEFAULT_CHANNEL_CAPACITY, DEFAULT_CONNECT_TIMEOUT, DEFAULT_IO_TIMEOUT,
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Pause after a failed `accept` before trying again.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Called once a connection has passed its handshake. Returning an error
/// drops the connection.
pub type OnPeer = Arc<dyn Fn(Arc<dyn Peer>) -> Result<()> + Send + Sync>;

/// Called when an established connection's decode loop exits.
pub type OnDisconnect = Arc<dyn Fn(&dyn Peer) + Send + Sync>;

/// A way for nodes to exchange frames.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Binds the listen address and starts accepting connections in the
    /// background. Returns once the listener is bound.
    async fn listen_and_accept(&self) -> Result<()>;

    /// Connects to `addr` and starts serving the connection in the
    /// background.
    async fn dial(&self, addr: &str) -> Result<()>;

    /// Takes the channel every connection delivers its frames to.
    ///
    /// # Errors
    ///
    /// Returns [`P2pError::AlreadyConsumed`] after the first call.
    fn consume(&self) -> Result<mpsc::Receiver<Rpc>>;

    /// Stops accepting new connections. Established connections stay open.
    async fn close(&self) -> Result<()>;

    /// The configured listen address.
    fn listen_addr(&self) -> String;
}

/// Configuration for a [`TcpTransport`].
#[derive(Clone)]
pub struct TcpTransportConfig {
    /// Address to listen on. A bare `:port` listens on all interfaces.
    pub listen_addr: String,
    /// Negotiation run on every connection.
    pub handshake: Arc<dyn Handshake>,
    /// Turns connection bytes into frames.
    pub decoder: Arc<dyn Decoder>,
    /// Called when a connection becomes active.
    pub on_peer: Option<OnPeer>,
    /// Called when an active connection ends.
    pub on_disconnect: Option<OnDisconnect>,
    /// Capacity of the inbound frame channel.
    pub channel_capacity: usize,
    /// Bound on each write to a peer.
    pub write_timeout: Duration,
    /// Bound on establishing an outbound connection.
    pub connect_timeout: Duration,
}

impl TcpTransportConfig {
    /// Creates a configuration with default settings.
    #[must_use]
    pub fn new(listen_addr: impl Into<String>) -> Self {
        Self {
            listen_addr: listen_addr.into(),
            handshake: Arc::new(NoHandshake),
            decoder: Arc::new(FramedDecoder::new()),
            on_peer: None,
            on_disconnect: None,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            write_timeout: DEFAULT_IO_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    /// Sets the handshake.
    #[must_use]
    pub fn with_handshake(mut self, handshake: impl Handshake) -> Self {
        self.handshake = Arc::new(handshake);
        self
    }

    /// Sets the decoder.
    #[must_use]
    pub fn with_decoder(mut self, decoder: impl Decoder) -> Self {
        self.decoder = Arc::new(decoder);
        self
    }

    /// Sets the peer callback.
    #[must_use]
    pub fn with_on_peer(mut self, on_peer: OnPeer) -> Self {
        self.on_peer = Some(on_peer);
        self
    }

    /// Sets the disconnect callback.
    #[must_use]
    pub fn with_on_disconnect(mut self, on_disconnect: OnDisconnect) -> Self {
        self.on_disconnect = Some(on_disconnect);
        self
    }

    /// Sets the inbound channel capacity.
    #[must_use]
    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity;
        self
    }

    /// Sets the write timeout.
    #[must_use]
    pub fn with_write_timeout(mut self, write_timeout: Duration) -> Self {
        self.write_timeout = write_timeout;
        self
    }

    /// Sets the connect timeout.
    #[must_use]
    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }
}

impl Default for TcpTransportConfig {
    fn default() -> Self {
        Self::new("127.0.0.1:3000")
    }
}

impl fmt::Debug for TcpTransportConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpTransportConfig")
            .field("listen_addr", &self.listen_addr)
            .field("on_peer", &self.on_peer.is_some())
            .field("on_disconnect", &self.on_disconnect.is_some())
            .field("channel_capacity", &self.channel_capacity)
            .field("write_timeout", &self.write_timeout)
            .field("connect_timeout", &self.connect_timeout)
            .finish_non_exhaustive()
    }
}

/// [`Transport`] over TCP streams.
///
/// Every connection, accepted or dialed, gets its own task that runs the
/// handshake and then decodes frames into the shared inbound channel.
#[derive(Clone)]
pub struct TcpTransport {
    inner: Arc<Inner>,
}

struct Inner {
    config: TcpTransportConfig,
    tx: mpsc::Sender<Rpc>,
    rx: Mutex<Option<mpsc::Receiver<Rpc>>>,
    shutdown: CancellationToken,
    local_addr: Mutex<Option<SocketAddr>>,
    next_id: AtomicU64,
}

impl TcpTransport {
    /// Creates a transport. Nothing is bound until
    /// [`Transport::listen_and_accept`].
    #[must_use]
    pub fn new(config: TcpTransportConfig) -> Self {
        let (tx, rx) = mpsc::channel(config.channel_capacity.max(1));
        Self {
            inner: Arc::new(Inner {
                config,
                tx,
                rx: Mutex::new(Some(rx)),
                shutdown: CancellationToken::new(),
                local_addr: Mutex::new(None),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Returns the bound socket address once listening.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.inner.local_addr.lock()
    }

    /// Returns the transport configuration.
    #[must_use]
    pub fn config(&self) -> &TcpTransportConfig {
        &self.inner.config
    }
}

impl fmt::Debug for TcpTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpTransport")
            .field("listen_addr", &self.inner.config.listen_addr)
            .field("local_addr", &self.local_addr())
            .finish()
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn listen_and_accept(&self) -> Result<()> {
        let addr = &self.inner.config.listen_addr;
        let listener = TcpListener::bind(bind_addr(addr))
            .await
            .map_err(|source| P2pError::Bind {
                addr: addr.clone(),
                source,
            })?;
        let local = listener.local_addr()?;
        *self.inner.local_addr.lock() = Some(local);

        info!(listen_addr = %addr, local_addr = %local, "Transport listening");

        let inner = Arc::clone(&self.inner);
        tokio::spawn(inner.accept_loop(listener));
        Ok(())
    }

    async fn dial(&self, addr: &str) -> Result<()> {
        let connect = TcpStream::connect(dial_addr(addr));
        let stream = match timeout(self.inner.config.connect_timeout, connect).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => {
                return Err(P2pError::Connect {
                    addr: addr.to_string(),
                    source,
                })
            }
            Err(_) => {
                return Err(P2pError::Connect {
                    addr: addr.to_string(),
                    source: io::Error::new(io::ErrorKind::TimedOut, "connect timed out"),
                })
            }
        };
        let remote = stream.peer_addr()?;

        debug!(addr = %addr, remote = %remote, "Dialed peer");

        let inner = Arc::clone(&self.inner);
        tokio::spawn(inner.handle_connection(stream, remote, true));
        Ok(())
    }

    fn consume(&self) -> Result<mpsc::Receiver<Rpc>> {
        self.inner.rx.lock().take().ok_or(P2pError::AlreadyConsumed)
    }

    async fn close(&self) -> Result<()> {
        self.inner.shutdown.cancel();
        Ok(())
    }

    fn listen_addr(&self) -> String {
        self.inner.config.listen_addr.clone()
    }
}

impl Inner {
    async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            tokio::select! {
                () = self.shutdown.cancelled() => {
                    debug!(listen_addr = %self.config.listen_addr, "Accept loop stopped");
                    return;
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, remote)) => {
                        let inner = Arc::clone(&self);
                        tokio::spawn(inner.handle_connection(stream, remote, false));
                    }
                    Err(e) => {
                        warn!(error = %e, "Accept failed");
                        // Keeps persistent errors such as EMFILE from spinning.
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                    }
                }
            }
        }
    }

    async fn handle_connection(self: Arc<Self>, stream: TcpStream, remote: SocketAddr, outbound: bool) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        if let Err(e) = stream.set_nodelay(true) {
            debug!(peer = %remote, error = %e, "Failed to set TCP_NODELAY");
        }

        let (mut reader, writer) = stream.into_split();
        let peer = Arc::new(TcpPeer::new(
            id,
            remote,
            outbound,
            writer,
            self.config.write_timeout,
        ));
        debug!(peer = %remote, id, outbound, state = %ConnectionState::Connecting, "Connection opened");

        if let Err(e) = self.establish(&peer, &mut reader).await {
            warn!(peer = %remote, id, error = %e, state = %ConnectionState::Closed, "Dropping connection");
            close_quietly(peer.as_ref()).await;
            return;
        }

        self.read_loop(peer.as_ref(), &mut reader).await;

        close_quietly(peer.as_ref()).await;
        debug!(peer = %remote, id, state = %ConnectionState::Closed, "Connection closed");
        if let Some(on_disconnect) = &self.config.on_disconnect {
            on_disconnect(peer.as_ref());
        }
    }

    async fn establish(&self, peer: &Arc<TcpPeer>, reader: &mut OwnedReadHalf) -> Result<()> {
        debug!(peer = %peer.socket_addr(), state = %ConnectionState::Handshaking, "Running handshake");
        self.config.handshake.handshake(peer.as_ref(), reader).await?;

        if let Some(on_peer) = &self.config.on_peer {
            let handle: Arc<dyn Peer> = peer.clone();
            on_peer(handle)?;
        }

        info!(
            peer = %peer.socket_addr(),
            id = peer.id(),
            outbound = peer.is_outbound(),
            state = %ConnectionState::Active,
            "Peer connected"
        );
        Ok(())
    }

    async fn read_loop(&self, peer: &TcpPeer, reader: &mut OwnedReadHalf) {
        let from = peer.remote_addr();
        loop {
            match self.config.decoder.decode(reader).await {
                Ok(frame) => {
                    let rpc = Rpc {
                        from: from.clone(),
                        conn_id: peer.id(),
                        kind: frame.kind,
                        payload: frame.payload,
                    };
                    if self.tx.send(rpc).await.is_err() {
                        debug!(peer = %from, "Inbound channel closed");
                        return;
                    }
                }
                Err(e) if e.is_closed() => {
                    debug!(peer = %from, "Remote closed connection");
                    return;
                }
                Err(e) if e.is_fatal() => {
                    warn!(peer = %from, error = %e, "Connection read failed");
                    return;
                }
                Err(e) => warn!(peer = %from, error = %e, "Dropping undecodable frame"),
            }
        }
    }
}

async fn close_quietly(peer: &dyn Peer) {
    if let Err(e) = peer.close().await {
        debug!(peer = %peer.remote_addr(), error = %e, "Close failed");
    }
}

/// A bare `:port` binds every interface.
fn bind_addr(addr: &str) -> String {
    if addr.starts_with(':') {
        format!("0.0.0.0{addr}")
    } else {
        addr.to_string()
    }
}

/// A bare `:port` dials the local host.
fn dial_addr(addr: &str) -> String {
    if addr.starts_with(':') {
        format!("127.0.0.1{addr}")
    } else {
        addr.to_string()
    }
}
