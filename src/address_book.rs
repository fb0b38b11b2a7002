//! The table of known peers shared by the swarm's tasks.

use std::sync::Arc;

use ahash::AHashMap;
use multiaddr::Multiaddr;
use parking_lot::RwLock;

use crate::keys::PublicKey;
use crate::peer::{Peer, PeerId};

/// Concurrent map of known peers.
///
/// Every accessor copies data out, the lock is never held by callers.
#[derive(Debug, Clone, Default)]
pub struct AddressBook {
    peers: Arc<RwLock<AHashMap<PeerId, Peer>>>,
}

impl AddressBook {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records `addr` for `id`. Returns `true` if the peer was not known before.
    pub fn register(&self, id: PeerId, addr: Option<&Multiaddr>) -> bool {
        let mut peers = self.peers.write();
        let mut is_new = false;
        let peer = peers.entry(id).or_insert_with(|| {
            is_new = true;
            Peer::new(id)
        });
        if let Some(addr) = addr {
            peer.add_address(addr);
        }
        is_new
    }

    pub fn get(&self, id: &PeerId) -> Option<Peer> {
        self.peers.read().get(id).cloned()
    }

    pub fn contains(&self, id: &PeerId) -> bool {
        self.peers.read().contains_key(id)
    }

    pub fn remove(&self, id: &PeerId) -> Option<Peer> {
        self.peers.write().remove(id)
    }

    pub fn len(&self) -> usize {
        self.peers.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.read().is_empty()
    }

    /// Copies out the current set of peers.
    pub fn snapshot(&self) -> Vec<Peer> {
        self.peers.read().values().cloned().collect()
    }

    /// Ids of all known peers.
    pub fn known_peers(&self) -> Vec<PeerId> {
        self.peers.read().keys().copied().collect()
    }

    pub fn addresses(&self, id: &PeerId) -> Vec<Multiaddr> {
        self.peers
            .read()
            .get(id)
            .map(|p| p.addresses().to_vec())
            .unwrap_or_default()
    }

    pub fn set_connected(&self, id: &PeerId, addr: Option<Multiaddr>) {
        if let Some(peer) = self.peers.write().get_mut(id) {
            peer.set_connected_address(addr);
        }
    }

    pub fn remove_address(&self, id: &PeerId, addr: &Multiaddr) {
        if let Some(peer) = self.peers.write().get_mut(id) {
            peer.remove_address(addr);
        }
    }

    /// Applies the identity information learned from the remote.
    pub fn update<F>(&self, id: &PeerId, f: F)
    where
        F: FnOnce(&mut Peer),
    {
        let mut peers = self.peers.write();
        let peer = peers.entry(*id).or_insert_with(|| Peer::new(*id));
        f(peer);
    }

    pub fn set_public_key(&self, id: &PeerId, key: PublicKey) -> bool {
        let mut peers = self.peers.write();
        let peer = peers.entry(*id).or_insert_with(|| Peer::new(*id));
        peer.set_public_key(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register() {
        let book = AddressBook::new();
        let id = PeerId::random();
        let a: Multiaddr = "/ip4/10.0.0.1/tcp/1".parse().unwrap();
        let b: Multiaddr = "/ip4/10.0.0.2/tcp/1".parse().unwrap();

        assert!(book.register(id, Some(&a)));
        assert!(!book.register(id, Some(&b)));
        assert!(!book.register(id, Some(&a)));
        assert_eq!(book.addresses(&id), vec![a.clone(), b]);

        book.set_connected(&id, Some(a.clone()));
        assert_eq!(book.get(&id).unwrap().connected_address(), Some(&a));
        book.set_connected(&id, None);
        assert!(!book.get(&id).unwrap().is_connected());
    }

    #[test]
    fn test_snapshot_is_detached() {
        let book = AddressBook::new();
        for _ in 0..10 {
            book.register(PeerId::random(), None);
        }
        assert_eq!(book.known_peers().len(), 10);
        let snapshot = book.snapshot();
        for peer in &snapshot {
            book.remove(peer.id());
        }
        assert_eq!(snapshot.len(), 10);
        assert!(book.is_empty());
    }
}
