//! multistream-select 1.0 protocol negotiation.
//!
//! Every message is `varint(len) | name | '\n'`. Both sides first exchange the
//! [`PROTOCOL_HEADER`], then the dialer proposes one protocol and the listener either echoes it
//! or answers [`NOT_AVAILABLE`].

use std::fmt;
use std::io;
use std::sync::Arc;

use ahash::AHashMap;
use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::{debug, trace};

use crate::mplex::Substream;
use crate::protocol::{read_lp, write_lp};
use crate::swarm::Connection;

pub const PROTOCOL_HEADER: &str = "/multistream/1.0.0";
pub const NOT_AVAILABLE: &str = "na";
/// Request to list the supported protocols. Not implemented, always answered with `na`.
pub const LIST: &str = "ls";

/// Longest negotiation message we accept.
const MAX_MESSAGE_LEN: usize = 1024;

#[derive(Debug, thiserror::Error)]
pub enum NegotiationError {
    #[error("invalid multistream header {0:?}")]
    InvalidHeader(String),
    #[error("protocol {0} is not available")]
    NotAvailable(String),
    #[error("{0} is not implemented")]
    Unimplemented(String),
    #[error("unexpected answer {0:?}")]
    UnexpectedAnswer(String),
    #[error("malformed negotiation message")]
    Malformed,
    #[error("io: {0}")]
    Io(#[from] io::Error),
}

async fn write_message<S>(stream: &mut S, message: &str) -> io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    let mut buf = Vec::with_capacity(message.len() + 1);
    buf.extend_from_slice(message.as_bytes());
    buf.push(b'\n');
    write_lp(stream, &buf).await
}

async fn read_message<S>(stream: &mut S) -> Result<String, NegotiationError>
where
    S: AsyncRead + Unpin,
{
    let buf = read_lp(stream, MAX_MESSAGE_LEN)
        .await?
        .ok_or_else(|| io::Error::from(io::ErrorKind::UnexpectedEof))?;
    let line = buf.strip_suffix(b"\n").ok_or(NegotiationError::Malformed)?;
    String::from_utf8(line.to_vec()).map_err(|_| NegotiationError::Malformed)
}

async fn read_header<S>(stream: &mut S) -> Result<(), NegotiationError>
where
    S: AsyncRead + Unpin,
{
    let header = read_message(stream).await?;
    if header != PROTOCOL_HEADER {
        return Err(NegotiationError::InvalidHeader(header));
    }
    Ok(())
}

/// Dialer side: asks the remote to speak `protocol` on `stream`.
pub async fn select<S>(stream: &mut S, protocol: &str) -> Result<(), NegotiationError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    write_message(stream, PROTOCOL_HEADER).await?;
    write_message(stream, protocol).await?;
    stream.flush().await?;

    read_header(stream).await?;
    let answer = read_message(stream).await?;
    if answer == protocol {
        trace!(protocol, "negotiated");
        Ok(())
    } else if answer == NOT_AVAILABLE {
        Err(NegotiationError::NotAvailable(protocol.to_string()))
    } else {
        Err(NegotiationError::UnexpectedAnswer(answer))
    }
}

/// Listener side: waits for the remote's proposal and accepts it if `supported` says so.
///
/// Returns the accepted protocol name.
pub async fn accept<S, F>(stream: &mut S, supported: F) -> Result<String, NegotiationError>
where
    S: AsyncRead + AsyncWrite + Unpin,
    F: Fn(&str) -> bool,
{
    read_header(stream).await?;
    write_message(stream, PROTOCOL_HEADER).await?;

    let protocol = read_message(stream).await?;
    if protocol == LIST {
        write_message(stream, NOT_AVAILABLE).await?;
        stream.flush().await?;
        return Err(NegotiationError::Unimplemented(protocol));
    }
    if protocol == NOT_AVAILABLE || !supported(&protocol) {
        write_message(stream, NOT_AVAILABLE).await?;
        stream.flush().await?;
        return Err(NegotiationError::NotAvailable(protocol));
    }
    write_message(stream, &protocol).await?;
    stream.flush().await?;
    trace!(%protocol, "accepted");
    Ok(protocol)
}

/// Handles the substreams negotiated for one protocol.
#[async_trait]
pub trait ProtocolHandler: Send + Sync + 'static {
    /// Runs the protocol on a freshly negotiated substream until it is done with it.
    async fn handle(&self, connection: Connection, stream: Substream) -> anyhow::Result<()>;
}

/// The protocols a node answers on its substreams, keyed by name.
#[derive(Clone, Default)]
pub struct ProtocolRegistry {
    handlers: AHashMap<String, Arc<dyn ProtocolHandler>>,
}

impl fmt::Debug for ProtocolRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.handlers.keys()).finish()
    }
}

impl ProtocolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` for `name`, replacing any previous handler.
    pub fn insert(&mut self, name: impl Into<String>, handler: Arc<dyn ProtocolHandler>) {
        let name = name.into();
        if self.handlers.insert(name.clone(), handler).is_some() {
            debug!(%name, "replaced protocol handler");
        }
    }

    pub fn with(mut self, name: impl Into<String>, handler: Arc<dyn ProtocolHandler>) -> Self {
        self.insert(name, handler);
        self
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ProtocolHandler>> {
        self.handlers.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }

    /// Runs the listener side of the negotiation against the registered protocols.
    pub async fn negotiate<S>(
        &self,
        stream: &mut S,
    ) -> Result<(String, Arc<dyn ProtocolHandler>), NegotiationError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let protocol = accept(stream, |name| self.contains(name)).await?;
        let handler = self
            .get(&protocol)
            .ok_or_else(|| NegotiationError::NotAvailable(protocol.clone()))?;
        Ok((protocol, handler))
    }
}
