//! Registry of connected peers.

use hoard_p2p::{OnDisconnect, OnPeer, Peer};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{broadcast, OwnedMutexGuard};
use tracing::{debug, info};

const DEPARTURES_CAPACITY: usize = 256;

/// A registered connection and the lock held for the whole of a file
/// transfer to it.
#[derive(Clone)]
pub struct PeerEntry {
    /// The connection.
    pub peer: Arc<dyn Peer>,
    transfer: Arc<tokio::sync::Mutex<()>>,
}

impl PeerEntry {
    fn new(peer: Arc<dyn Peer>) -> Self {
        Self {
            peer,
            transfer: Arc::default(),
        }
    }

    /// Waits for exclusive use of this connection for an announcement and
    /// the stream chunks that follow it.
    pub async fn lock_transfer(&self) -> OwnedMutexGuard<()> {
        Arc::clone(&self.transfer).lock_owned().await
    }
}

impl std::fmt::Debug for PeerEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerEntry").field("peer", &self.peer).finish_non_exhaustive()
    }
}

/// Connected peers keyed by remote address.
///
/// Ordered so that broadcasts visit peers in the same order every time. The
/// lock is never held across an `.await`; senders work on a [`snapshot`].
///
/// Every connection that leaves the registry, removed or replaced by a
/// reconnect, is announced on [`departures`].
///
/// [`snapshot`]: PeerRegistry::snapshot
/// [`departures`]: PeerRegistry::departures
#[derive(Clone)]
pub struct PeerRegistry {
    peers: Arc<Mutex<BTreeMap<String, PeerEntry>>>,
    departures: broadcast::Sender<u64>,
}

impl Default for PeerRegistry {
    fn default() -> Self {
        let (departures, _) = broadcast::channel(DEPARTURES_CAPACITY);
        Self {
            peers: Arc::default(),
            departures,
        }
    }
}

impl PeerRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `peer` under its remote address, replacing any previous
    /// connection from that address.
    pub fn insert(&self, peer: Arc<dyn Peer>) -> Option<Arc<dyn Peer>> {
        let addr = peer.remote_addr();
        let replaced = self
            .peers
            .lock()
            .insert(addr.clone(), PeerEntry::new(peer))
            .map(|old| old.peer);
        info!(peer = %addr, replaced = replaced.is_some(), "Registered peer");
        if let Some(old) = &replaced {
            self.depart(old.id());
        }
        replaced
    }

    /// Removes the entry for `addr` if it still belongs to connection `id`.
    pub fn remove_if_same(&self, addr: &str, id: u64) -> bool {
        let removed = {
            let mut peers = self.peers.lock();
            let same = peers.get(addr).is_some_and(|entry| entry.peer.id() == id);
            if same {
                peers.remove(addr);
            }
            same
        };
        if removed {
            info!(peer = %addr, id, "Unregistered peer");
            self.depart(id);
        } else {
            debug!(peer = %addr, id, "Stale disconnect ignored");
        }
        removed
    }

    /// Subscribes to the ids of connections leaving the registry.
    #[must_use]
    pub fn departures(&self) -> broadcast::Receiver<u64> {
        self.departures.subscribe()
    }

    /// Looks up the peer registered for `addr`.
    #[must_use]
    pub fn get(&self, addr: &str) -> Option<Arc<dyn Peer>> {
        self.peers.lock().get(addr).map(|entry| Arc::clone(&entry.peer))
    }

    /// Looks up the entry registered for `addr`.
    #[must_use]
    pub fn entry(&self, addr: &str) -> Option<PeerEntry> {
        self.peers.lock().get(addr).cloned()
    }

    /// Returns true if `addr` is registered.
    #[must_use]
    pub fn contains(&self, addr: &str) -> bool {
        self.peers.lock().contains_key(addr)
    }

    /// Returns every registered peer in address order.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Arc<dyn Peer>> {
        self.peers
            .lock()
            .values()
            .map(|entry| Arc::clone(&entry.peer))
            .collect()
    }

    /// Returns every registered entry in address order.
    #[must_use]
    pub fn entries(&self) -> Vec<PeerEntry> {
        self.peers.lock().values().cloned().collect()
    }

    /// Returns every registered address in order.
    #[must_use]
    pub fn addresses(&self) -> Vec<String> {
        self.peers.lock().keys().cloned().collect()
    }

    /// Returns the number of registered peers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.peers.lock().len()
    }

    /// Returns true if no peer is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.peers.lock().is_empty()
    }

    fn depart(&self, id: u64) {
        // No subscriber is fine.
        let _ = self.departures.send(id);
    }

    /// Transport callback registering every connection that becomes active.
    #[must_use]
    pub fn on_peer_hook(&self) -> OnPeer {
        let registry = self.clone();
        Arc::new(move |peer| {
            registry.insert(peer);
            Ok(())
        })
    }

    /// Transport callback unregistering connections as they end.
    #[must_use]
    pub fn on_disconnect_hook(&self) -> OnDisconnect {
        let registry = self.clone();
        Arc::new(move |peer| {
            registry.remove_if_same(&peer.remote_addr(), peer.id());
        })
    }
}

impl std::fmt::Debug for PeerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerRegistry")
            .field("peers", &self.addresses())
            .finish()
    }
}
