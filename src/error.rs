use std::io;
use std::sync::Arc;

use multiaddr::Multiaddr;

use crate::bitswap::BitswapError;
use crate::mplex::MplexError;
use crate::multistream::NegotiationError;
use crate::peer::PeerId;
use crate::secio::HandshakeError;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// How a failure should be treated by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Refused by local policy, never attempted and never retried.
    Policy,
    /// The remote violated a wire protocol, the connection is torn down.
    Protocol,
    /// The network failed or the peer is unreachable.
    Transport,
    /// The caller gave up.
    Cancellation,
    /// Everything else, such as misuse of the API.
    Application,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("address {0} is denied")]
    AddressDenied(Multiaddr),
    #[error("no transport for {0}")]
    UnsupportedAddress(Multiaddr),
    #[error("refusing to dial ourselves")]
    DialSelf,
    #[error("dialed {expected} but reached {actual}")]
    PeerIdMismatch { expected: PeerId, actual: PeerId },
    #[error("no known address for {0}")]
    NoAddresses(PeerId),
    #[error("not connected to {0}")]
    NotConnected(PeerId),
    #[error("no connection to {0}")]
    NoConnection(Multiaddr),
    #[error("{0} must end in /p2p/<peer id>")]
    MissingPeerId(Multiaddr),
    #[error("failed to dial {addr}: {source}")]
    Dial {
        addr: Multiaddr,
        #[source]
        source: Arc<Error>,
    },
    #[error("identify failed: {0}")]
    Identify(String),
    #[error("timed out")]
    Timeout,
    #[error("swarm is not running")]
    NotRunning,
    #[error("cancelled")]
    Cancelled,
    #[error("secure channel: {0}")]
    Handshake(#[from] HandshakeError),
    #[error("multiplexer: {0}")]
    Mplex(#[from] MplexError),
    #[error("negotiation: {0}")]
    Negotiation(#[from] NegotiationError),
    #[error("bitswap: {0}")]
    Bitswap(#[from] BitswapError),
    #[error("io: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::AddressDenied(_) => ErrorKind::Policy,
            Error::DialSelf
            | Error::NoAddresses(_)
            | Error::NotConnected(_)
            | Error::NoConnection(_)
            | Error::MissingPeerId(_)
            | Error::UnsupportedAddress(_)
            | Error::NotRunning => ErrorKind::Application,
            Error::PeerIdMismatch { .. } | Error::Identify(_) => ErrorKind::Protocol,
            Error::Dial { source, .. } => source.kind(),
            Error::Timeout | Error::Io(_) => ErrorKind::Transport,
            Error::Cancelled => ErrorKind::Cancellation,
            Error::Handshake(err) => match err {
                HandshakeError::Io(_) | HandshakeError::Timeout => ErrorKind::Transport,
                _ => ErrorKind::Protocol,
            },
            Error::Mplex(err) => match err {
                MplexError::Closed => ErrorKind::Transport,
                MplexError::Io(err) => io_kind(err),
                MplexError::DuplicateStream(_) => ErrorKind::Protocol,
            },
            Error::Negotiation(err) => match err {
                NegotiationError::Io(err) => io_kind(err),
                _ => ErrorKind::Protocol,
            },
            Error::Bitswap(err) => match err {
                BitswapError::Cancelled => ErrorKind::Cancellation,
                BitswapError::InvalidBlock(_)
                | BitswapError::InvalidPrefix(_)
                | BitswapError::UnsupportedHash(_)
                | BitswapError::Cid(_)
                | BitswapError::Decode(_) => ErrorKind::Protocol,
                _ => ErrorKind::Application,
            },
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.kind() == ErrorKind::Cancellation
    }
}

fn io_kind(err: &io::Error) -> ErrorKind {
    match err.kind() {
        io::ErrorKind::InvalidData => ErrorKind::Protocol,
        _ => ErrorKind::Transport,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kinds() {
        let addr: Multiaddr = "/ip4/127.0.0.1/tcp/1".parse().unwrap();
        assert_eq!(Error::AddressDenied(addr.clone()).kind(), ErrorKind::Policy);
        assert_eq!(
            Error::Handshake(HandshakeError::InvalidSignature).kind(),
            ErrorKind::Protocol
        );
        assert_eq!(
            Error::Mplex(MplexError::DuplicateStream(1000)).kind(),
            ErrorKind::Protocol
        );
        let hmac = io::Error::new(io::ErrorKind::InvalidData, "hmac mismatch");
        assert_eq!(Error::Mplex(MplexError::Io(hmac)).kind(), ErrorKind::Protocol);
        let refused = io::Error::from(io::ErrorKind::ConnectionRefused);
        let dial = Error::Dial {
            addr,
            source: Arc::new(Error::Io(refused)),
        };
        assert_eq!(dial.kind(), ErrorKind::Transport);
        assert!(Error::Cancelled.is_cancelled());
        assert!(Error::Bitswap(BitswapError::Cancelled).is_cancelled());
    }
}
