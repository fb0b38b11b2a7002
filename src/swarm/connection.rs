use std::fmt;
use std::sync::Arc;

use multiaddr::Multiaddr;

use crate::error::Result;
use crate::keys::PublicKey;
use crate::mplex::{Multiplexer, Substream};
use crate::multistream;
use crate::peer::PeerId;

/// An authenticated, multiplexed connection to one remote peer.
///
/// Cheap to clone, every clone refers to the same connection.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

struct Inner {
    id: u64,
    local_peer: PeerId,
    remote_peer: PeerId,
    remote_key: PublicKey,
    remote_addr: Multiaddr,
    is_incoming: bool,
    muxer: Multiplexer,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("remote_peer", &self.inner.remote_peer)
            .field("remote_addr", &self.inner.remote_addr)
            .field("is_incoming", &self.inner.is_incoming)
            .finish()
    }
}

impl PartialEq for Connection {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Connection {}

impl Connection {
    pub(crate) fn new(
        id: u64,
        local_peer: PeerId,
        remote_key: PublicKey,
        remote_addr: Multiaddr,
        is_incoming: bool,
        muxer: Multiplexer,
    ) -> Self {
        Connection {
            inner: Arc::new(Inner {
                id,
                local_peer,
                remote_peer: remote_key.to_peer_id(),
                remote_key,
                remote_addr,
                is_incoming,
                muxer,
            }),
        }
    }

    /// Identifies this connection among all connections of the swarm.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn local_peer(&self) -> &PeerId {
        &self.inner.local_peer
    }

    pub fn remote_peer(&self) -> &PeerId {
        &self.inner.remote_peer
    }

    /// The key the remote proved to own during the handshake.
    pub fn remote_public_key(&self) -> &PublicKey {
        &self.inner.remote_key
    }

    pub fn remote_addr(&self) -> &Multiaddr {
        &self.inner.remote_addr
    }

    pub fn is_incoming(&self) -> bool {
        self.inner.is_incoming
    }

    pub fn is_closed(&self) -> bool {
        self.inner.muxer.is_closed()
    }

    /// Resolves once the connection is closed.
    pub async fn closed(&self) {
        self.inner.muxer.closed().await
    }

    /// Opens a substream and negotiates `protocol` on it.
    pub async fn open_stream(&self, protocol: &str) -> Result<Substream> {
        let mut stream = self.inner.muxer.create_stream(protocol).await?;
        multistream::select(&mut stream, protocol).await?;
        Ok(stream)
    }

    /// Closes the connection and all its substreams.
    pub fn close(&self) {
        self.inner.muxer.close();
    }
}
