//! Registry of live peers
//!
//! At most one peer per identity is registered at a time. The membership
//! check and insertion happen under one write lock so two concurrent
//! handshakes for the same identity cannot both succeed.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use crate::network::node_info::PeerId;
use crate::network::peer::Peer;

#[derive(Default)]
struct Inner {
    lookup: HashMap<PeerId, Arc<Peer>>,
    list: Vec<Arc<Peer>>,
}

/// Concurrency-safe set of connected peers
#[derive(Default)]
pub struct PeerSet {
    inner: RwLock<Inner>,
}

impl PeerSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `peer`; fails with the existing peer if the identity is taken
    pub fn add(&self, peer: Arc<Peer>) -> Result<(), Arc<Peer>> {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = inner.lookup.get(peer.id()) {
            return Err(existing.clone());
        }
        inner.lookup.insert(peer.id().clone(), peer.clone());
        inner.list.push(peer);
        Ok(())
    }

    pub fn has(&self, id: &PeerId) -> bool {
        self.read().lookup.contains_key(id)
    }

    pub fn get(&self, id: &PeerId) -> Option<Arc<Peer>> {
        self.read().lookup.get(id).cloned()
    }

    /// Remove exactly this peer instance. A newer peer registered under the
    /// same identity is left alone.
    pub fn remove(&self, peer: &Arc<Peer>) -> bool {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        match inner.lookup.get(peer.id()) {
            Some(current) if Arc::ptr_eq(current, peer) => {}
            _ => return false,
        }
        inner.lookup.remove(peer.id());
        inner.list.retain(|p| !Arc::ptr_eq(p, peer));
        true
    }

    /// Snapshot of registered peers in insertion order
    pub fn list(&self) -> Vec<Arc<Peer>> {
        self.read().list.clone()
    }

    pub fn size(&self) -> usize {
        self.read().list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// (outbound, inbound) counts
    pub fn direction_counts(&self) -> (usize, usize) {
        let inner = self.read();
        let outbound = inner.list.iter().filter(|p| p.is_outbound()).count();
        (outbound, inner.list.len() - outbound)
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }
}
