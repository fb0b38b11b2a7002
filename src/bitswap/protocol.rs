use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio_util::codec::Framed;
use tracing::{debug, trace};

use super::{Bitswap, BitswapMessage};
use crate::error::{Error, Result};
use crate::mplex::Substream;
use crate::multistream::{NegotiationError, ProtocolHandler};
use crate::protocol::UviBytes;
use crate::swarm::Connection;

#[derive(Clone, Debug, Copy, PartialEq, Eq, Hash, Deserialize)]
pub enum ProtocolId {
    #[serde(rename = "/ipfs/bitswap/1.0.0")]
    Bitswap100,
    #[serde(rename = "/ipfs/bitswap/1.1.0")]
    Bitswap110,
}

impl ProtocolId {
    pub fn name(&self) -> &'static str {
        match self {
            ProtocolId::Bitswap100 => "/ipfs/bitswap/1.0.0",
            ProtocolId::Bitswap110 => "/ipfs/bitswap/1.1.0",
        }
    }
}

impl std::fmt::Display for ProtocolId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Reads messages from substreams the remote opened.
pub(crate) struct BitswapHandler {
    pub(crate) bitswap: Bitswap,
    pub(crate) protocol: ProtocolId,
}

#[async_trait]
impl ProtocolHandler for BitswapHandler {
    async fn handle(&self, connection: Connection, stream: Substream) -> anyhow::Result<()> {
        let peer = *connection.remote_peer();
        let codec = UviBytes::new(self.bitswap.config().max_message_size);
        let mut framed = Framed::new(stream, codec);
        while let Some(frame) = framed.next().await {
            let message = BitswapMessage::decode(frame?.freeze())?;
            trace!(%peer, protocol = %self.protocol, "received {:?}", message);
            self.bitswap.receive_message(peer, message).await;
        }
        Ok(())
    }
}

/// Sends `message` on a new substream, trying `protocols` in order.
pub(crate) async fn send_message(
    connection: &Connection,
    protocols: &[ProtocolId],
    max_message_size: usize,
    message: &BitswapMessage,
) -> Result<ProtocolId> {
    let mut last_err = None;
    for protocol in protocols {
        let stream = match connection.open_stream(protocol.name()).await {
            Ok(stream) => stream,
            Err(err @ Error::Negotiation(NegotiationError::NotAvailable(_))) => {
                debug!(peer = %connection.remote_peer(), %protocol, "not supported by peer");
                last_err = Some(err);
                continue;
            }
            Err(err) => return Err(err),
        };
        let mut framed = Framed::new(stream, UviBytes::new(max_message_size));
        framed.send(message.encode(*protocol)).await?;
        framed.close().await?;
        return Ok(*protocol);
    }
    Err(last_err.unwrap_or_else(|| {
        Error::Negotiation(NegotiationError::NotAvailable("bitswap".to_string()))
    }))
}
