//! Replication coordinator.
//!
//! A [`FileServer`] owns a local [`Store`] and keeps every registered peer's
//! store in step with it. Writes go to disk first, then a `StoreFile`
//! message and the file bytes are sent to each peer on the same connection:
//!
//! ```text
//!  store_write(key)          peer
//!      │  Message(StoreFile{key, size}) ──►  enqueue pending file
//!      │  Stream(chunk 1..n)            ──►  append, write once size bytes arrived
//! ```
//!
//! Every transfer holds the receiving peer's transfer lock from the
//! announcement to the last chunk, so concurrent writes and fetch replies
//! never interleave on a connection. All inbound frames
//! are handled by a single dispatch loop, so store mutation from the network
//! is serialized. Files still arriving are tracked per connection and
//! dropped when that connection leaves the registry.

use crate::registry::PeerRegistry;
use crate::{NodeError, Result};
use bytes::{Bytes, BytesMut};
use hoard_p2p::{Frame, FrameKind, Peer, Rpc, TcpTransport, TcpTransportConfig, Transport, STREAM_CHUNK_SIZE};
use hoard_protocol::{Payload, ProtocolError, ReplicationMessage};
use hoard_storage::{default_path_transform, PathTransform, StorageError, Store, StoreOpts, DEFAULT_ROOT};
use std::collections::{HashMap, VecDeque};
use std::io::{self, Read};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tokio::time::{timeout, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Default bound on waiting for peers to answer a fetch.
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(10);

/// Options for a [`FileServer`].
#[derive(Clone)]
pub struct FileServerOpts {
    /// Root folder of the local store.
    pub storage_root: PathBuf,
    /// Maps keys to their on-disk layout.
    pub path_transform: PathTransform,
    /// Addresses dialed on start. Empty entries are skipped.
    pub bootstrap_nodes: Vec<String>,
    /// How long [`FileServer::store_read`] waits for peers.
    pub fetch_timeout: Duration,
}

impl Default for FileServerOpts {
    fn default() -> Self {
        Self {
            storage_root: PathBuf::from(DEFAULT_ROOT),
            path_transform: Arc::new(default_path_transform),
            bootstrap_nodes: Vec::new(),
            fetch_timeout: DEFAULT_FETCH_TIMEOUT,
        }
    }
}

impl std::fmt::Debug for FileServerOpts {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileServerOpts")
            .field("storage_root", &self.storage_root)
            .field("bootstrap_nodes", &self.bootstrap_nodes)
            .field("fetch_timeout", &self.fetch_timeout)
            .finish_non_exhaustive()
    }
}

/// A file announced by a peer whose bytes are still arriving.
#[derive(Debug)]
struct PendingFile {
    key: String,
    size: u64,
    data: BytesMut,
}

impl PendingFile {
    fn new(key: String, size: u64) -> Self {
        let capacity = usize::try_from(size).unwrap_or(usize::MAX).min(STREAM_CHUNK_SIZE);
        Self {
            key,
            size,
            data: BytesMut::with_capacity(capacity),
        }
    }

    fn remaining(&self) -> u64 {
        self.size - self.data.len() as u64
    }
}

/// Files announced per connection id, oldest first.
type PendingFiles = HashMap<u64, VecDeque<PendingFile>>;

/// A node of the replicated store.
pub struct FileServer {
    store: Store,
    registry: PeerRegistry,
    transport: Arc<dyn Transport>,
    bootstrap_nodes: Vec<String>,
    fetch_timeout: Duration,
    landed: broadcast::Sender<String>,
    shutdown: CancellationToken,
}

impl FileServer {
    /// Creates a server over `transport`.
    ///
    /// The transport's connection callbacks should feed `registry`; see
    /// [`FileServer::with_tcp`].
    #[must_use]
    pub fn new(opts: FileServerOpts, transport: Arc<dyn Transport>, registry: PeerRegistry) -> Self {
        let store = Store::new(StoreOpts::new(opts.storage_root, opts.path_transform));
        let (landed, _) = broadcast::channel(64);
        Self {
            store,
            registry,
            transport,
            bootstrap_nodes: opts.bootstrap_nodes,
            fetch_timeout: opts.fetch_timeout,
            landed,
            shutdown: CancellationToken::new(),
        }
    }

    /// Creates a server on a TCP transport whose connections register with
    /// the server's peer registry.
    #[must_use]
    pub fn with_tcp(opts: FileServerOpts, config: TcpTransportConfig) -> (Self, TcpTransport) {
        let registry = PeerRegistry::new();
        let config = config
            .with_on_peer(registry.on_peer_hook())
            .with_on_disconnect(registry.on_disconnect_hook());
        let transport = TcpTransport::new(config);
        let server = Self::new(opts, Arc::new(transport.clone()), registry);
        (server, transport)
    }

    /// Returns the local store.
    #[must_use]
    pub fn store(&self) -> &Store {
        &self.store
    }

    /// Returns the peer registry.
    #[must_use]
    pub fn registry(&self) -> &PeerRegistry {
        &self.registry
    }

    /// Returns the address this node advertises.
    #[must_use]
    pub fn listen_addr(&self) -> String {
        self.transport.listen_addr()
    }

    /// Starts listening and dials every bootstrap node.
    ///
    /// Bootstrap failures are logged and do not fail the call.
    pub async fn open(&self) -> Result<()> {
        self.transport.listen_and_accept().await?;
        self.bootstrap_network().await;
        Ok(())
    }

    /// Opens the node and runs the dispatch loop until [`FileServer::stop`].
    pub async fn start(&self) -> Result<()> {
        self.open().await?;
        self.run().await
    }

    /// Runs the dispatch loop until [`FileServer::stop`] or until every
    /// connection and the transport are gone, then closes the transport.
    pub async fn run(&self) -> Result<()> {
        let mut departures = self.registry.departures();
        let mut inbound = self.transport.consume()?;
        let mut pending = PendingFiles::new();

        info!(listen_addr = %self.listen_addr(), "File server running");

        loop {
            tokio::select! {
                () = self.shutdown.cancelled() => break,
                departed = departures.recv() => match departed {
                    Ok(conn_id) => drop_pending(&mut pending, conn_id),
                    Err(broadcast::error::RecvError::Lagged(_)) => self.prune_pending(&mut pending),
                    // The registry keeps the sender alive as long as `self`.
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                rpc = inbound.recv() => match rpc {
                    Some(rpc) => {
                        let from = rpc.from.clone();
                        if let Err(e) = self.handle_rpc(rpc, &mut pending).await {
                            warn!(peer = %from, error = %e, "Failed to handle frame");
                        }
                    }
                    None => break,
                },
            }
        }

        info!(listen_addr = %self.listen_addr(), "File server stopped");
        self.transport.close().await?;
        Ok(())
    }

    /// Stops the dispatch loop. Calling it again has no effect.
    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    /// Registers a connected peer under its remote address.
    pub fn on_peer(&self, peer: Arc<dyn Peer>) -> Result<()> {
        self.registry.insert(peer);
        Ok(())
    }

    /// Unregisters a peer whose connection ended. An entry that has since
    /// been replaced by a newer connection is kept.
    pub fn on_disconnect(&self, peer: &dyn Peer) -> bool {
        self.registry.remove_if_same(&peer.remote_addr(), peer.id())
    }

    /// Waits until at least `count` peers are registered.
    pub async fn wait_for_peers(&self, count: usize, within: Duration) -> bool {
        let deadline = Instant::now() + within;
        while self.registry.len() < count {
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        true
    }

    /// Stores the reader's content under `key` locally, then replicates it to
    /// every registered peer. Returns the number of bytes stored.
    ///
    /// The announcement goes to every peer first, then the file bytes, both
    /// in address order, with every peer's transfer lock held throughout.
    /// The first send failure is returned; peers before it have already been
    /// sent to and the local write is kept.
    pub async fn store_write<R: Read>(&self, key: &str, reader: R) -> Result<u64> {
        let mut tee = TeeReader::new(reader);
        let size = self.store.write(key, &mut tee)?;
        let data = tee.into_captured();

        let length = i64::try_from(size)
            .map_err(|_| ProtocolError::Malformed(format!("file too large: {size} bytes")))?;
        let message = ReplicationMessage::store_file(self.listen_addr(), key, length);
        let announce = Frame::message(message.encode()?);
        let chunks: Vec<Frame> = Frame::stream_chunks(&data).collect();

        // Address order everywhere, so two writers cannot deadlock.
        let entries = self.registry.entries();
        let mut transfers = Vec::with_capacity(entries.len());
        for entry in &entries {
            transfers.push(entry.lock_transfer().await);
        }
        let peers: Vec<_> = entries.into_iter().map(|entry| entry.peer).collect();

        broadcast_frame(&peers, &announce).await?;
        for peer in &peers {
            if let Err(e) = peer.send_frames(&chunks).await {
                warn!(peer = %peer.remote_addr(), key = %key, error = %e, "Streaming failed");
                return Err(e.into());
            }
        }
        drop(transfers);

        info!(key = %key, bytes = size, peers = peers.len(), "Stored and replicated file");
        Ok(size)
    }

    /// Deletes `key` locally, then asks every registered peer to do the same.
    pub async fn store_delete(&self, key: &str) -> Result<()> {
        self.store.delete(key)?;

        let message = ReplicationMessage::delete_file(self.listen_addr(), key);
        let peers = self.registry.snapshot();
        broadcast_frame(&peers, &Frame::message(message.encode()?)).await?;

        info!(key = %key, peers = peers.len(), "Deleted and replicated delete");
        Ok(())
    }

    /// Reads `key`, fetching it from peers when it is not stored locally.
    ///
    /// Returns [`StorageError::NotFound`] if no peer delivers the file
    /// within the fetch timeout.
    pub async fn store_read(&self, key: &str) -> Result<Bytes> {
        match self.store.read(key) {
            Ok(data) => return Ok(data),
            Err(StorageError::NotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }

        let peers = self.registry.snapshot();
        if peers.is_empty() {
            return Err(StorageError::NotFound(key.to_string()).into());
        }

        let mut landed = self.landed.subscribe();
        let message = ReplicationMessage::get_file(self.listen_addr(), key);
        broadcast_frame(&peers, &Frame::message(message.encode()?)).await?;
        debug!(key = %key, peers = peers.len(), "Fetching file from peers");

        let arrived = async {
            loop {
                match landed.recv().await {
                    Ok(stored) if stored == key => return true,
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => {
                        if self.store.has(key) {
                            return true;
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => return false,
                }
            }
        };

        match timeout(self.fetch_timeout, arrived).await {
            Ok(true) => Ok(self.store.read(key)?),
            _ => Err(StorageError::NotFound(key.to_string()).into()),
        }
    }

    /// Dials every bootstrap node concurrently and waits for all dials to
    /// settle.
    async fn bootstrap_network(&self) {
        let mut dials = JoinSet::new();
        for addr in self.bootstrap_nodes.iter().filter(|addr| !addr.is_empty()) {
            let transport = Arc::clone(&self.transport);
            let addr = addr.clone();
            dials.spawn(async move {
                debug!(addr = %addr, "Dialing bootstrap node");
                if let Err(e) = transport.dial(&addr).await {
                    warn!(addr = %addr, error = %e, "Failed to dial bootstrap node");
                }
            });
        }
        while let Some(joined) = dials.join_next().await {
            if let Err(e) = joined {
                warn!(error = %e, "Bootstrap dial task failed");
            }
        }
    }

    async fn handle_rpc(&self, rpc: Rpc, pending: &mut PendingFiles) -> Result<()> {
        match rpc.kind {
            FrameKind::Message => {
                let message = ReplicationMessage::decode(&rpc.payload)?;
                self.handle_message(&rpc.from, rpc.conn_id, message, pending)
                    .await
            }
            FrameKind::Stream => self.handle_stream(&rpc.from, rpc.conn_id, &rpc.payload, pending),
        }
    }

    async fn handle_message(
        &self,
        from: &str,
        conn_id: u64,
        message: ReplicationMessage,
        pending: &mut PendingFiles,
    ) -> Result<()> {
        // Frames still queued from a replaced or closed connection are refused.
        let Some(entry) = self.registry.entry(from).filter(|entry| entry.peer.id() == conn_id) else {
            return Err(NodeError::PeerNotFound(from.to_string()));
        };
        debug!(peer = %from, origin = %message.from, kind = ?message.payload.kind(), "Received message");

        match message.payload {
            Payload::StoreFile { key, size } => {
                let size = u64::try_from(size)
                    .map_err(|_| ProtocolError::Malformed(format!("negative size {size}")))?;
                if size == 0 {
                    self.store.write(&key, &mut io::empty())?;
                    info!(peer = %from, key = %key, bytes = 0, "Stored replicated file");
                    self.announce_landed(key);
                } else {
                    pending
                        .entry(conn_id)
                        .or_default()
                        .push_back(PendingFile::new(key, size));
                }
            }
            Payload::DeleteFile { key } => {
                self.store.delete(&key)?;
                info!(peer = %from, key = %key, "Deleted on request");
            }
            Payload::GetFile { key } => {
                if !self.store.has(&key) {
                    debug!(peer = %from, key = %key, "Requested file not stored here");
                    return Ok(());
                }
                let data = self.store.read(&key)?;
                let frames = file_frames(&self.listen_addr(), &key, &data)?;
                let _transfer = entry.lock_transfer().await;
                entry.peer.send_frames(&frames).await?;
                info!(peer = %from, key = %key, bytes = data.len(), "Served file");
            }
        }
        Ok(())
    }

    fn handle_stream(
        &self,
        from: &str,
        conn_id: u64,
        chunk: &Bytes,
        pending: &mut PendingFiles,
    ) -> Result<()> {
        let unexpected = |reason: String| NodeError::UnexpectedStream {
            from: from.to_string(),
            reason,
        };

        let Some(queue) = pending.get_mut(&conn_id) else {
            return Err(unexpected("no file pending".into()));
        };
        let Some(file) = queue.front_mut() else {
            return Err(unexpected("no file pending".into()));
        };

        if chunk.len() as u64 > file.remaining() {
            let reason = format!(
                "{} bytes overrun {} ({} remaining)",
                chunk.len(),
                file.key,
                file.remaining()
            );
            queue.pop_front();
            if queue.is_empty() {
                pending.remove(&conn_id);
            }
            return Err(unexpected(reason));
        }

        file.data.extend_from_slice(chunk);
        if file.remaining() > 0 {
            return Ok(());
        }

        let complete = queue.pop_front();
        if queue.is_empty() {
            pending.remove(&conn_id);
        }
        if let Some(file) = complete {
            let written = self.store.write(&file.key, &mut &file.data[..])?;
            info!(peer = %from, key = %file.key, bytes = written, "Stored replicated file");
            self.announce_landed(file.key);
        }
        Ok(())
    }

    /// Drops pending files of every connection no longer registered.
    fn prune_pending(&self, pending: &mut PendingFiles) {
        let live: Vec<u64> = self.registry.snapshot().iter().map(|peer| peer.id()).collect();
        let gone: Vec<u64> = pending.keys().filter(|id| !live.contains(id)).copied().collect();
        for conn_id in gone {
            drop_pending(pending, conn_id);
        }
    }

    fn announce_landed(&self, key: String) {
        // Nobody waiting is fine.
        let _ = self.landed.send(key);
    }
}

impl std::fmt::Debug for FileServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileServer")
            .field("listen_addr", &self.listen_addr())
            .field("store", &self.store)
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

/// Forgets the files still arriving on connection `conn_id`.
fn drop_pending(pending: &mut PendingFiles, conn_id: u64) {
    if let Some(queue) = pending.remove(&conn_id) {
        let keys: Vec<_> = queue.iter().map(|file| file.key.as_str()).collect();
        warn!(conn_id, files = ?keys, "Connection left before its files arrived");
    }
}

/// Sends `frame` to each peer in order, stopping at the first failure.
async fn broadcast_frame(peers: &[Arc<dyn Peer>], frame: &Frame) -> Result<()> {
    let encoded = frame.encode()?;
    for peer in peers {
        if let Err(e) = peer.send(&encoded).await {
            warn!(peer = %peer.remote_addr(), error = %e, "Broadcast failed");
            return Err(e.into());
        }
    }
    Ok(())
}

/// Builds a `StoreFile` announcement followed by the file's stream chunks.
fn file_frames(origin: &str, key: &str, data: &Bytes) -> Result<Vec<Frame>> {
    let length = i64::try_from(data.len())
        .map_err(|_| ProtocolError::Malformed(format!("file too large: {} bytes", data.len())))?;
    let message = ReplicationMessage::store_file(origin, key, length);
    let mut frames = vec![Frame::message(message.encode()?)];
    frames.extend(Frame::stream_chunks(data));
    Ok(frames)
}

/// Reader that keeps a copy of everything read through it.
struct TeeReader<R> {
    inner: R,
    captured: BytesMut,
}

impl<R: Read> TeeReader<R> {
    fn new(inner: R) -> Self {
        Self {
            inner,
            captured: BytesMut::new(),
        }
    }

    fn into_captured(self) -> Bytes {
        self.captured.freeze()
    }
}

impl<R: Read> Read for TeeReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.captured.extend_from_slice(&buf[..n]);
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingPeer;
    use hoard_p2p::FRAME_HEADER_LEN;
    use hoard_storage::cas_path_transform;
    use tempfile::TempDir;

    const PEER: &str = "10.0.0.1:4000";
    const PEER_ID: u64 = 1;

    fn create_test_server() -> (FileServer, TempDir) {
        let dir = TempDir::new().unwrap();
        let opts = FileServerOpts {
            storage_root: dir.path().join("root"),
            path_transform: Arc::new(cas_path_transform),
            bootstrap_nodes: Vec::new(),
            fetch_timeout: Duration::from_millis(200),
        };
        let (server, _transport) = FileServer::with_tcp(opts, TcpTransportConfig::new("127.0.0.1:0"));
        (server, dir)
    }

    fn message_rpc(from: &str, message: &ReplicationMessage) -> Rpc {
        message_rpc_on(from, PEER_ID, message)
    }

    fn message_rpc_on(from: &str, conn_id: u64, message: &ReplicationMessage) -> Rpc {
        Rpc {
            from: from.to_string(),
            conn_id,
            kind: FrameKind::Message,
            payload: message.encode().unwrap(),
        }
    }

    fn stream_rpc(from: &str, data: &[u8]) -> Rpc {
        stream_rpc_on(from, PEER_ID, data)
    }

    fn stream_rpc_on(from: &str, conn_id: u64, data: &[u8]) -> Rpc {
        Rpc {
            from: from.to_string(),
            conn_id,
            kind: FrameKind::Stream,
            payload: Bytes::copy_from_slice(data),
        }
    }

    fn decode_sent(sent: &Bytes) -> ReplicationMessage {
        ReplicationMessage::decode(&sent[FRAME_HEADER_LEN..]).unwrap()
    }

    #[tokio::test]
    async fn store_file_from_unregistered_peer() {
        let (server, _dir) = create_test_server();
        let mut pending = PendingFiles::new();

        let rpc = message_rpc(PEER, &ReplicationMessage::store_file("x", "key", 4));
        let err = server.handle_rpc(rpc, &mut pending).await.unwrap_err();
        assert!(matches!(err, NodeError::PeerNotFound(addr) if addr == PEER));
        assert!(pending.is_empty());
        assert!(!server.store().has("key"));
    }

    #[tokio::test]
    async fn stream_chunks_complete_a_pending_file() {
        let (server, _dir) = create_test_server();
        server.on_peer(RecordingPeer::new(1, PEER)).unwrap();
        let mut pending = PendingFiles::new();

        let rpc = message_rpc(PEER, &ReplicationMessage::store_file("x", "key", 10));
        server.handle_rpc(rpc, &mut pending).await.unwrap();
        server
            .handle_rpc(stream_rpc(PEER, b"hello"), &mut pending)
            .await
            .unwrap();
        assert!(!server.store().has("key"));

        server
            .handle_rpc(stream_rpc(PEER, b"world"), &mut pending)
            .await
            .unwrap();
        assert_eq!(&server.store().read("key").unwrap()[..], b"helloworld");
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn pending_files_complete_in_order() {
        let (server, _dir) = create_test_server();
        server.on_peer(RecordingPeer::new(1, PEER)).unwrap();
        let mut pending = PendingFiles::new();

        for (key, size) in [("first", 3), ("second", 2)] {
            let rpc = message_rpc(PEER, &ReplicationMessage::store_file("x", key, size));
            server.handle_rpc(rpc, &mut pending).await.unwrap();
        }
        server
            .handle_rpc(stream_rpc(PEER, b"abc"), &mut pending)
            .await
            .unwrap();
        server
            .handle_rpc(stream_rpc(PEER, b"de"), &mut pending)
            .await
            .unwrap();

        assert_eq!(&server.store().read("first").unwrap()[..], b"abc");
        assert_eq!(&server.store().read("second").unwrap()[..], b"de");
    }

    #[tokio::test]
    async fn zero_size_file_written_immediately() {
        let (server, _dir) = create_test_server();
        server.on_peer(RecordingPeer::new(1, PEER)).unwrap();
        let mut pending = PendingFiles::new();

        let rpc = message_rpc(PEER, &ReplicationMessage::store_file("x", "empty", 0));
        server.handle_rpc(rpc, &mut pending).await.unwrap();

        assert!(pending.is_empty());
        assert!(server.store().read("empty").unwrap().is_empty());
    }

    #[tokio::test]
    async fn stream_without_pending_file() {
        let (server, _dir) = create_test_server();
        server.on_peer(RecordingPeer::new(1, PEER)).unwrap();
        let mut pending = PendingFiles::new();

        let err = server
            .handle_rpc(stream_rpc(PEER, b"stray"), &mut pending)
            .await
            .unwrap_err();
        assert!(matches!(err, NodeError::UnexpectedStream { .. }));
    }

    #[tokio::test]
    async fn overrun_discards_pending_file() {
        let (server, _dir) = create_test_server();
        server.on_peer(RecordingPeer::new(1, PEER)).unwrap();
        let mut pending = PendingFiles::new();

        let rpc = message_rpc(PEER, &ReplicationMessage::store_file("x", "key", 3));
        server.handle_rpc(rpc, &mut pending).await.unwrap();
        let err = server
            .handle_rpc(stream_rpc(PEER, b"too long"), &mut pending)
            .await
            .unwrap_err();

        assert!(matches!(err, NodeError::UnexpectedStream { .. }));
        assert!(pending.is_empty());
        assert!(!server.store().has("key"));
    }

    #[tokio::test]
    async fn malformed_message_is_an_error() {
        let (server, _dir) = create_test_server();
        server.on_peer(RecordingPeer::new(1, PEER)).unwrap();
        let mut pending = PendingFiles::new();

        let rpc = Rpc {
            from: PEER.to_string(),
            conn_id: PEER_ID,
            kind: FrameKind::Message,
            payload: Bytes::from_static(b"garbage"),
        };
        let err = server.handle_rpc(rpc, &mut pending).await.unwrap_err();
        assert!(matches!(err, NodeError::Protocol(_)));
    }

    #[tokio::test]
    async fn delete_request_removes_file() {
        let (server, _dir) = create_test_server();
        server.on_peer(RecordingPeer::new(1, PEER)).unwrap();
        server.store().write("key", &mut &b"data"[..]).unwrap();
        let mut pending = PendingFiles::new();

        let rpc = message_rpc(PEER, &ReplicationMessage::delete_file("x", "key"));
        server.handle_rpc(rpc, &mut pending).await.unwrap();
        assert!(!server.store().has("key"));
    }

    #[tokio::test]
    async fn get_request_is_answered_with_the_file() {
        let (server, _dir) = create_test_server();
        let peer = RecordingPeer::new(1, PEER);
        server.on_peer(peer.clone()).unwrap();
        server.store().write("key", &mut &b"data"[..]).unwrap();
        let mut pending = PendingFiles::new();

        let rpc = message_rpc(PEER, &ReplicationMessage::get_file("x", "key"));
        server.handle_rpc(rpc, &mut pending).await.unwrap();

        let sent = peer.sent();
        assert_eq!(sent.len(), 2);
        assert_eq!(
            decode_sent(&sent[0]).payload,
            Payload::StoreFile {
                key: "key".into(),
                size: 4
            }
        );
        assert_eq!(&sent[1][FRAME_HEADER_LEN..], b"data");
    }

    #[tokio::test]
    async fn get_reply_waits_for_running_transfer() {
        let (server, _dir) = create_test_server();
        let peer = RecordingPeer::new(1, PEER);
        server.on_peer(peer.clone()).unwrap();
        server.store().write("key", &mut &b"data"[..]).unwrap();
        let mut pending = PendingFiles::new();

        let transfer = server.registry().entry(PEER).unwrap().lock_transfer().await;
        let rpc = message_rpc(PEER, &ReplicationMessage::get_file("x", "key"));
        let blocked = timeout(Duration::from_millis(50), server.handle_rpc(rpc, &mut pending)).await;
        assert!(blocked.is_err());
        assert!(peer.sent().is_empty());

        drop(transfer);
        let rpc = message_rpc(PEER, &ReplicationMessage::get_file("x", "key"));
        server.handle_rpc(rpc, &mut pending).await.unwrap();
        assert_eq!(peer.sent().len(), 2);
    }

    #[tokio::test]
    async fn get_request_for_missing_file_is_ignored() {
        let (server, _dir) = create_test_server();
        let peer = RecordingPeer::new(1, PEER);
        server.on_peer(peer.clone()).unwrap();
        let mut pending = PendingFiles::new();

        let rpc = message_rpc(PEER, &ReplicationMessage::get_file("x", "missing"));
        server.handle_rpc(rpc, &mut pending).await.unwrap();
        assert!(peer.sent().is_empty());
    }

    #[tokio::test]
    async fn store_write_sends_metadata_then_payload() {
        let (server, _dir) = create_test_server();
        let a = RecordingPeer::new(1, "10.0.0.1:4000");
        let b = RecordingPeer::new(2, "10.0.0.2:4000");
        server.on_peer(b.clone()).unwrap();
        server.on_peer(a.clone()).unwrap();

        let size = server.store_write("key", &b"payload"[..]).await.unwrap();
        assert_eq!(size, 7);
        assert_eq!(&server.store().read("key").unwrap()[..], b"payload");

        for peer in [&a, &b] {
            let sent = peer.sent();
            assert_eq!(sent.len(), 2);
            assert_eq!(sent[0][4], FrameKind::Message as u8);
            assert_eq!(
                decode_sent(&sent[0]).payload,
                Payload::StoreFile {
                    key: "key".into(),
                    size: 7
                }
            );
            assert_eq!(sent[1][4], FrameKind::Stream as u8);
            assert_eq!(&sent[1][FRAME_HEADER_LEN..], b"payload");
        }
    }

    #[tokio::test]
    async fn partial_broadcast_failure() {
        let (server, _dir) = create_test_server();
        let first = RecordingPeer::new(1, "10.0.0.1:4000");
        let broken = RecordingPeer::failing(2, "10.0.0.2:4000");
        let last = RecordingPeer::new(3, "10.0.0.3:4000");
        server.on_peer(last.clone()).unwrap();
        server.on_peer(broken).unwrap();
        server.on_peer(first.clone()).unwrap();

        let err = server.store_write("key", &b"payload"[..]).await.unwrap_err();
        assert!(matches!(err, NodeError::P2p(_)));

        // Local write is kept, the first peer saw the metadata only.
        assert!(server.store().has("key"));
        assert_eq!(first.sent().len(), 1);
        assert!(last.sent().is_empty());
    }

    #[tokio::test]
    async fn reconnect_starts_with_fresh_pending_files() {
        let (server, _dir) = create_test_server();
        server.on_peer(RecordingPeer::new(1, PEER)).unwrap();
        let mut pending = PendingFiles::new();

        let rpc = message_rpc_on(PEER, 1, &ReplicationMessage::store_file("x", "k1", 10));
        server.handle_rpc(rpc, &mut pending).await.unwrap();
        server
            .handle_rpc(stream_rpc_on(PEER, 1, b"abc"), &mut pending)
            .await
            .unwrap();

        // Same address, new connection.
        server.on_peer(RecordingPeer::new(2, PEER)).unwrap();
        let rpc = message_rpc_on(PEER, 2, &ReplicationMessage::store_file("x", "k2", 5));
        server.handle_rpc(rpc, &mut pending).await.unwrap();
        server
            .handle_rpc(stream_rpc_on(PEER, 2, b"hello"), &mut pending)
            .await
            .unwrap();

        assert_eq!(&server.store().read("k2").unwrap()[..], b"hello");
        assert!(!server.store().has("k1"));

        server.prune_pending(&mut pending);
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn frames_from_replaced_connection_are_refused() {
        let (server, _dir) = create_test_server();
        server.on_peer(RecordingPeer::new(1, PEER)).unwrap();
        server.on_peer(RecordingPeer::new(2, PEER)).unwrap();
        let mut pending = PendingFiles::new();

        let rpc = message_rpc_on(PEER, 1, &ReplicationMessage::store_file("x", "late", 4));
        let err = server.handle_rpc(rpc, &mut pending).await.unwrap_err();
        assert!(matches!(err, NodeError::PeerNotFound(_)));
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn departed_connection_drops_its_pending_files() {
        let (server, _dir) = create_test_server();
        let mut pending = PendingFiles::new();
        let peer = RecordingPeer::new(1, PEER);
        server.on_peer(peer.clone()).unwrap();
        let rpc = message_rpc(PEER, &ReplicationMessage::store_file("x", "half", 10));
        server.handle_rpc(rpc, &mut pending).await.unwrap();

        let mut departures = server.registry().departures();
        assert!(server.on_disconnect(peer.as_ref()));
        let conn_id = departures.recv().await.unwrap();
        assert_eq!(conn_id, 1);
        drop_pending(&mut pending, conn_id);
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn store_delete_broadcasts() {
        let (server, _dir) = create_test_server();
        let peer = RecordingPeer::new(1, PEER);
        server.on_peer(peer.clone()).unwrap();
        server.store().write("key", &mut &b"data"[..]).unwrap();

        server.store_delete("key").await.unwrap();
        assert!(!server.store().has("key"));

        let sent = peer.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(
            decode_sent(&sent[0]).payload,
            Payload::DeleteFile { key: "key".into() }
        );
    }

    #[tokio::test]
    async fn store_read_times_out_without_answer() {
        let (server, _dir) = create_test_server();
        let peer = RecordingPeer::new(1, PEER);
        server.on_peer(peer.clone()).unwrap();

        let err = server.store_read("missing").await.unwrap_err();
        assert!(matches!(err, NodeError::Storage(StorageError::NotFound(_))));
        assert_eq!(
            decode_sent(&peer.sent()[0]).payload,
            Payload::GetFile {
                key: "missing".into()
            }
        );
    }

    #[tokio::test]
    async fn store_read_without_peers() {
        let (server, _dir) = create_test_server();
        let err = server.store_read("missing").await.unwrap_err();
        assert!(matches!(err, NodeError::Storage(StorageError::NotFound(_))));
    }

    #[tokio::test]
    async fn disconnect_only_removes_same_connection() {
        let (server, _dir) = create_test_server();
        let old = RecordingPeer::new(1, PEER);
        let new = RecordingPeer::new(2, PEER);
        server.on_peer(old.clone()).unwrap();
        server.on_peer(new.clone()).unwrap();

        assert!(!server.on_disconnect(old.as_ref()));
        assert!(server.registry().contains(PEER));
        assert!(server.on_disconnect(new.as_ref()));
        assert!(server.registry().is_empty());
    }

    #[tokio::test]
    async fn stop_ends_run() {
        let (server, _dir) = create_test_server();
        let server = Arc::new(server);
        let task = tokio::spawn({
            let server = Arc::clone(&server);
            async move { server.run().await }
        });

        server.stop();
        server.stop();
        timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    /// Transport whose dials take a while and always succeed.
    #[derive(Debug, Default)]
    struct SlowDialTransport {
        dialed: parking_lot::Mutex<Vec<String>>,
    }

    const SLOW_DIAL: Duration = Duration::from_millis(300);

    #[async_trait::async_trait]
    impl Transport for SlowDialTransport {
        async fn listen_and_accept(&self) -> hoard_p2p::Result<()> {
            Ok(())
        }

        async fn dial(&self, addr: &str) -> hoard_p2p::Result<()> {
            tokio::time::sleep(SLOW_DIAL).await;
            self.dialed.lock().push(addr.to_string());
            Ok(())
        }

        fn consume(&self) -> hoard_p2p::Result<tokio::sync::mpsc::Receiver<Rpc>> {
            Err(hoard_p2p::P2pError::AlreadyConsumed)
        }

        async fn close(&self) -> hoard_p2p::Result<()> {
            Ok(())
        }

        fn listen_addr(&self) -> String {
            "127.0.0.1:0".to_string()
        }
    }

    #[tokio::test]
    async fn bootstrap_dials_run_concurrently() {
        let dir = TempDir::new().unwrap();
        let transport = Arc::new(SlowDialTransport::default());
        let opts = FileServerOpts {
            storage_root: dir.path().join("root"),
            bootstrap_nodes: vec![
                "10.0.0.1:4000".into(),
                String::new(),
                "10.0.0.2:4000".into(),
                "10.0.0.3:4000".into(),
            ],
            ..FileServerOpts::default()
        };
        let server = FileServer::new(opts, transport.clone(), PeerRegistry::new());

        let started = Instant::now();
        server.open().await.unwrap();
        assert!(started.elapsed() < SLOW_DIAL * 2);

        let mut dialed = transport.dialed.lock().clone();
        dialed.sort();
        assert_eq!(dialed, vec!["10.0.0.1:4000", "10.0.0.2:4000", "10.0.0.3:4000"]);
    }

    #[test]
    fn tee_reader_captures_everything() {
        let mut tee = TeeReader::new(&b"copy me"[..]);
        let mut out = Vec::new();
        tee.read_to_end(&mut out).unwrap();
        assert_eq!(out, b"copy me");
        assert_eq!(&tee.into_captured()[..], b"copy me");
    }
}
