//! Peer identities and the information we keep about remote peers.

use std::fmt;
use std::str::FromStr;

use cid::multihash::Multihash;
use multiaddr::{Multiaddr, Protocol};
use sha2::{Digest, Sha256};

use crate::keys::PublicKey;

const IDENTITY: u64 = 0x00;
const SHA2_256: u64 = 0x12;

/// Inlined public keys longer than this are not valid peer ids.
const MAX_INLINE_KEY_LENGTH: usize = 42;

/// Identifier of a peer: the sha2-256 multihash of its encoded public key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(Multihash<64>);

#[derive(Debug, thiserror::Error)]
pub enum PeerIdError {
    #[error("invalid multihash: {0}")]
    Multihash(#[from] cid::multihash::Error),
    #[error("unsupported multihash code {0:#x}")]
    UnsupportedCode(u64),
    #[error("invalid base58 encoding: {0}")]
    Base58(#[from] bs58::decode::Error),
}

impl PeerId {
    pub fn from_public_key(key: &PublicKey) -> Self {
        let digest = Sha256::digest(key.to_protobuf_encoding());
        let hash = Multihash::wrap(SHA2_256, digest.as_slice())
            .expect("sha2-256 digest fits a multihash");
        PeerId(hash)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, PeerIdError> {
        let hash = Multihash::from_bytes(bytes)?;
        match hash.code() {
            SHA2_256 => Ok(PeerId(hash)),
            IDENTITY if hash.digest().len() <= MAX_INLINE_KEY_LENGTH => Ok(PeerId(hash)),
            code => Err(PeerIdError::UnsupportedCode(code)),
        }
    }

    /// Creates a random peer id, which no key corresponds to.
    pub fn random() -> Self {
        let digest: [u8; 32] = rand::random();
        PeerId(Multihash::wrap(SHA2_256, &digest).expect("sha2-256 digest fits a multihash"))
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.0.to_bytes()
    }

    pub fn to_base58(&self) -> String {
        bs58::encode(self.to_bytes()).into_string()
    }

    /// Checks that `key` is the key this id was derived from.
    pub fn matches(&self, key: &PublicKey) -> bool {
        *self == key.to_peer_id()
    }

    /// Returns the `/p2p/<id>` component for this peer.
    pub fn to_protocol(&self) -> Protocol<'static> {
        let id = libp2p_identity::PeerId::from_bytes(&self.to_bytes())
            .expect("peer ids are always valid multihashes");
        Protocol::P2p(id)
    }

    /// Extracts the peer id of the last `/p2p/<id>` component of `addr`, if any.
    pub fn from_multiaddr(addr: &Multiaddr) -> Option<Self> {
        addr.iter()
            .filter_map(|p| match p {
                Protocol::P2p(id) => PeerId::from_bytes(&id.to_bytes()).ok(),
                _ => None,
            })
            .last()
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_base58())
    }
}

impl fmt::Debug for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerId({})", self.to_base58())
    }
}

impl FromStr for PeerId {
    type Err = PeerIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = bs58::decode(s).into_vec()?;
        PeerId::from_bytes(&bytes)
    }
}

/// Returns `addr` without any `/p2p/<id>` component.
pub fn strip_peer_id(addr: &Multiaddr) -> Multiaddr {
    addr.iter()
        .filter(|p| !matches!(p, Protocol::P2p(_)))
        .collect()
}

/// Returns `addr` with a trailing `/p2p/<id>` component.
pub fn with_peer_id(addr: &Multiaddr, id: &PeerId) -> Multiaddr {
    strip_peer_id(addr).with(id.to_protocol())
}

/// Everything we know about a remote peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peer {
    id: PeerId,
    /// Known addresses, without `/p2p` components and without duplicates.
    addresses: Vec<Multiaddr>,
    /// The address of the current connection, if connected.
    connected_address: Option<Multiaddr>,
    public_key: Option<PublicKey>,
    pub agent_version: Option<String>,
    pub protocol_version: Option<String>,
    /// Protocols the peer announced through identify.
    pub protocols: Vec<String>,
}

impl Peer {
    pub fn new(id: PeerId) -> Self {
        Peer {
            id,
            addresses: Vec::new(),
            connected_address: None,
            public_key: None,
            agent_version: None,
            protocol_version: None,
            protocols: Vec::new(),
        }
    }

    pub fn id(&self) -> &PeerId {
        &self.id
    }

    pub fn addresses(&self) -> &[Multiaddr] {
        &self.addresses
    }

    /// Adds an address, returns `false` if it was already known.
    pub fn add_address(&mut self, addr: &Multiaddr) -> bool {
        let addr = strip_peer_id(addr);
        if addr.is_empty() || self.addresses.contains(&addr) {
            return false;
        }
        self.addresses.push(addr);
        true
    }

    pub fn remove_address(&mut self, addr: &Multiaddr) {
        let addr = strip_peer_id(addr);
        self.addresses.retain(|a| a != &addr);
    }

    pub fn connected_address(&self) -> Option<&Multiaddr> {
        self.connected_address.as_ref()
    }

    pub fn set_connected_address(&mut self, addr: Option<Multiaddr>) {
        self.connected_address = addr.map(|a| strip_peer_id(&a));
    }

    pub fn is_connected(&self) -> bool {
        self.connected_address.is_some()
    }

    pub fn public_key(&self) -> Option<&PublicKey> {
        self.public_key.as_ref()
    }

    /// Records the public key, ignoring keys that do not belong to this peer.
    pub fn set_public_key(&mut self, key: PublicKey) -> bool {
        if !self.id.matches(&key) {
            return false;
        }
        self.public_key = Some(key);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::Keypair;

    #[test]
    fn test_peer_id_roundtrip() {
        let id = Keypair::generate().peer_id();
        assert_eq!(PeerId::from_bytes(&id.to_bytes()).unwrap(), id);
        assert_eq!(id.to_string().parse::<PeerId>().unwrap(), id);
        assert!(id.to_string().starts_with("Qm"));
    }

    #[test]
    fn test_peer_id_multiaddr() {
        let id = PeerId::random();
        let addr: Multiaddr = "/ip4/127.0.0.1/tcp/4001".parse().unwrap();
        let full = with_peer_id(&addr, &id);
        assert_eq!(PeerId::from_multiaddr(&full), Some(id));
        assert_eq!(PeerId::from_multiaddr(&addr), None);
        assert_eq!(strip_peer_id(&full), addr);
    }

    #[test]
    fn test_addresses_are_deduplicated() {
        let id = PeerId::random();
        let mut peer = Peer::new(id);
        let addr: Multiaddr = "/ip4/10.0.0.1/tcp/4001".parse().unwrap();
        assert!(peer.add_address(&addr));
        assert!(!peer.add_address(&addr));
        assert!(!peer.add_address(&with_peer_id(&addr, &id)));
        assert_eq!(peer.addresses().len(), 1);

        peer.remove_address(&addr);
        assert!(peer.addresses().is_empty());
    }

    #[test]
    fn test_foreign_public_key_is_rejected() {
        let keypair = Keypair::generate();
        let mut peer = Peer::new(keypair.peer_id());
        assert!(!peer.set_public_key(Keypair::generate().public()));
        assert!(peer.public_key().is_none());
        assert!(peer.set_public_key(keypair.public()));
    }
}
