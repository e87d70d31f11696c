//! Peer registry: remote address -> live connection. All mutation goes through one lock;
//! readers take a snapshot and do their I/O without holding it.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, info};

use crate::peer::Peer;
use crate::transport::{PeerHandler, TransportError};

#[derive(Debug, Default)]
pub struct PeerRegistry {
    peers: Mutex<BTreeMap<String, Arc<Peer>>>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<String, Arc<Peer>>> {
        self.peers.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Insert keyed by remote address. A later registration for the same address wins.
    pub fn register(&self, peer: Arc<Peer>) {
        let addr = peer.remote_addr().to_string();
        let replaced = self.lock().insert(addr.clone(), peer).is_some();
        info!(peer = %addr, replaced, "connected with remote");
    }

    /// Point-in-time copy, ordered by address.
    pub fn snapshot(&self) -> Vec<Arc<Peer>> {
        self.lock().values().cloned().collect()
    }

    pub fn get(&self, addr: &str) -> Option<Arc<Peer>> {
        self.lock().get(addr).cloned()
    }

    /// Remove `addr` only if it still maps to this exact connection.
    pub fn forget(&self, peer: &Arc<Peer>) -> bool {
        let mut peers = self.lock();
        match peers.get(peer.remote_addr()) {
            Some(current) if Arc::ptr_eq(current, peer) => {
                peers.remove(peer.remote_addr());
                debug!(peer = %peer.remote_addr(), "peer removed from registry");
                true
            }
            _ => false,
        }
    }

    /// Empty the registry, returning every peer it held.
    pub fn drain(&self) -> Vec<Arc<Peer>> {
        std::mem::take(&mut *self.lock()).into_values().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

impl PeerHandler for PeerRegistry {
    fn on_peer(&self, peer: Arc<Peer>) -> Result<(), TransportError> {
        self.register(peer);
        Ok(())
    }

    fn on_peer_closed(&self, peer: &Arc<Peer>) {
        self.forget(peer);
    }
}
