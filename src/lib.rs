//! Peer connections and block exchange.
//!
//! A [`Swarm`](swarm::Swarm) dials and accepts connections, secures them with
//! [`secio`], multiplexes them with [`mplex`] and negotiates protocols with [`multistream`].
//! [`Bitswap`](bitswap::Bitswap) exchanges content addressed blocks with the connected peers.

pub mod address_book;
pub mod bitswap;
pub mod config;
pub mod error;
pub mod keys;
pub mod logging;
pub mod mplex;
pub mod multistream;
pub mod peer;
pub mod protocol;
pub mod routing;
pub mod secio;
pub mod swarm;

pub use error::{Error, ErrorKind, Result};
pub use keys::{Keypair, PublicKey};
pub use peer::{Peer, PeerId};
