//! A Kademlia style table of peers, ordered by their distance to the local peer.
//!
//! Distances are computed between the sha2-256 hashes of the peer ids rather than the ids
//! themselves. Peer ids all share the multihash prefix, hashing them again spreads them evenly
//! over the 256 buckets.
//!
//! A full bucket admits a new peer by evicting its oldest entry, without checking whether that
//! entry is still alive.

use std::collections::VecDeque;
use std::fmt;

use sha2::{Digest, Sha256};

use crate::peer::PeerId;

/// Entries per bucket.
pub const BUCKET_SIZE: usize = 20;

const NUM_BUCKETS: usize = 256;

/// Position of an id in the key space.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Key([u8; 32]);

impl Key {
    /// Hashes arbitrary id bytes into the key space.
    pub fn new(id: &[u8]) -> Self {
        Key(Sha256::digest(id).into())
    }

    pub fn from_peer(peer: &PeerId) -> Self {
        Key::new(&peer.to_bytes())
    }

    pub fn distance(&self, other: &Key) -> Distance {
        let mut out = [0u8; 32];
        for (o, (a, b)) in out.iter_mut().zip(self.0.iter().zip(other.0.iter())) {
            *o = a ^ b;
        }
        Distance(out)
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Key({})", data_encoding::HEXLOWER.encode(&self.0[..4]))
    }
}

/// XOR distance between two keys, compared as a big endian number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Distance([u8; 32]);

impl Distance {
    /// Index of the bucket holding keys at this distance, `None` for distance zero.
    pub fn bucket_index(&self) -> Option<usize> {
        let mut zeros = 0;
        for byte in self.0 {
            if byte != 0 {
                zeros += byte.leading_zeros() as usize;
                return Some(NUM_BUCKETS - 1 - zeros);
            }
            zeros += 8;
        }
        None
    }
}

#[derive(Debug, Clone)]
struct Entry {
    peer: PeerId,
    key: Key,
}

/// Peers bucketed by distance to the local peer, at most `bucket_size` per bucket.
#[derive(Debug, Clone)]
pub struct RoutingTable {
    local: Key,
    bucket_size: usize,
    /// Oldest entry first.
    buckets: Vec<VecDeque<Entry>>,
}

impl RoutingTable {
    pub fn new(local: &PeerId) -> Self {
        Self::with_bucket_size(local, BUCKET_SIZE)
    }

    pub fn with_bucket_size(local: &PeerId, bucket_size: usize) -> Self {
        RoutingTable {
            local: Key::from_peer(local),
            bucket_size,
            buckets: vec![VecDeque::new(); NUM_BUCKETS],
        }
    }

    fn bucket_of(&self, key: &Key) -> Option<usize> {
        self.local.distance(key).bucket_index()
    }

    /// Adds `peer`, or marks it as most recently seen if already present.
    ///
    /// Returns the peer evicted to make room, if any. The local peer is never added.
    pub fn add(&mut self, peer: PeerId) -> Option<PeerId> {
        let key = Key::from_peer(&peer);
        let index = self.bucket_of(&key)?;
        let bucket_size = self.bucket_size;
        let bucket = &mut self.buckets[index];
        if let Some(pos) = bucket.iter().position(|e| e.peer == peer) {
            if let Some(entry) = bucket.remove(pos) {
                bucket.push_back(entry);
            }
            return None;
        }
        let evicted = if bucket.len() >= bucket_size {
            bucket.pop_front().map(|e| e.peer)
        } else {
            None
        };
        bucket.push_back(Entry { peer, key });
        evicted
    }

    pub fn remove(&mut self, peer: &PeerId) -> bool {
        let Some(index) = self.bucket_of(&Key::from_peer(peer)) else {
            return false;
        };
        let bucket = &mut self.buckets[index];
        match bucket.iter().position(|e| e.peer == *peer) {
            Some(pos) => bucket.remove(pos).is_some(),
            None => false,
        }
    }

    pub fn contains(&self, peer: &PeerId) -> bool {
        self.bucket_of(&Key::from_peer(peer))
            .map_or(false, |index| self.buckets[index].iter().any(|e| e.peer == *peer))
    }

    pub fn len(&self) -> usize {
        self.buckets.iter().map(VecDeque::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.iter().all(VecDeque::is_empty)
    }

    pub fn peers(&self) -> impl Iterator<Item = &PeerId> {
        self.buckets.iter().flatten().map(|e| &e.peer)
    }

    /// Up to `count` peers closest to the id `target`, closest first.
    pub fn nearest_peers(&self, target: &[u8], count: usize) -> Vec<PeerId> {
        let target = Key::new(target);
        let mut entries: Vec<(Distance, PeerId)> = self
            .buckets
            .iter()
            .flatten()
            .map(|e| (e.key.distance(&target), e.peer))
            .collect();
        entries.sort_unstable_by(|a, b| a.0.cmp(&b.0));
        entries.into_iter().take(count).map(|(_, peer)| peer).collect()
    }
}
