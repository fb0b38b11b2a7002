//! The `/ipfs/id/1.0.0` protocol: peers tell each other who they are.

use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use multiaddr::Multiaddr;
use parking_lot::RwLock;
use prost::Message;
use tokio::io::AsyncWriteExt;
use tracing::{debug, trace};

use super::Connection;
use crate::error::{Error, Result};
use crate::keys::PublicKey;
use crate::mplex::Substream;
use crate::multistream::ProtocolHandler;
use crate::protocol::{read_lp, write_lp};

pub const PROTOCOL_NAME: &str = "/ipfs/id/1.0.0";
pub const PROTOCOL_VERSION: &str = "ipfs/0.1.0";

const MAX_MESSAGE_SIZE: usize = 64 * 1024;

mod pb {
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Identify {
        #[prost(bytes = "vec", optional, tag = "1")]
        pub public_key: Option<Vec<u8>>,
        #[prost(bytes = "vec", repeated, tag = "2")]
        pub listen_addrs: Vec<Vec<u8>>,
        #[prost(string, repeated, tag = "3")]
        pub protocols: Vec<String>,
        #[prost(bytes = "vec", optional, tag = "4")]
        pub observed_addr: Option<Vec<u8>>,
        #[prost(string, optional, tag = "5")]
        pub protocol_version: Option<String>,
        #[prost(string, optional, tag = "6")]
        pub agent_version: Option<String>,
    }
}

/// What a peer says about itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentifyInfo {
    pub public_key: PublicKey,
    pub listen_addrs: Vec<Multiaddr>,
    pub protocols: Vec<String>,
    /// How the remote sees our address.
    pub observed_addr: Option<Multiaddr>,
    pub protocol_version: String,
    pub agent_version: String,
}

impl IdentifyInfo {
    fn encode(&self) -> Vec<u8> {
        pb::Identify {
            public_key: Some(self.public_key.to_protobuf_encoding()),
            listen_addrs: self.listen_addrs.iter().map(|a| a.to_vec()).collect(),
            protocols: self.protocols.clone(),
            observed_addr: self.observed_addr.as_ref().map(|a| a.to_vec()),
            protocol_version: Some(self.protocol_version.clone()),
            agent_version: Some(self.agent_version.clone()),
        }
        .encode_to_vec()
    }

    fn decode(bytes: &[u8]) -> Result<Self> {
        let msg = pb::Identify::decode(bytes).map_err(|err| Error::Identify(err.to_string()))?;
        let public_key = msg
            .public_key
            .ok_or_else(|| Error::Identify("missing public key".into()))?;
        let public_key = PublicKey::from_protobuf_encoding(&public_key)
            .map_err(|err| Error::Identify(err.to_string()))?;
        // unparsable addresses are skipped, the rest is still useful
        let listen_addrs = msg
            .listen_addrs
            .into_iter()
            .filter_map(|bytes| Multiaddr::try_from(bytes).ok())
            .collect();
        let observed_addr = msg
            .observed_addr
            .and_then(|bytes| Multiaddr::try_from(bytes).ok());
        Ok(IdentifyInfo {
            public_key,
            listen_addrs,
            protocols: msg.protocols,
            observed_addr,
            protocol_version: msg.protocol_version.unwrap_or_default(),
            agent_version: msg.agent_version.unwrap_or_default(),
        })
    }
}

/// Answers identify requests with the local node's information.
#[derive(Debug)]
pub(crate) struct IdentifyHandler {
    pub(crate) public_key: PublicKey,
    pub(crate) agent_version: String,
    pub(crate) protocols: Vec<String>,
    pub(crate) listen_addrs: Arc<RwLock<Vec<Multiaddr>>>,
}

#[async_trait]
impl ProtocolHandler for IdentifyHandler {
    async fn handle(&self, connection: Connection, mut stream: Substream) -> anyhow::Result<()> {
        let info = IdentifyInfo {
            public_key: self.public_key,
            listen_addrs: self.listen_addrs.read().clone(),
            protocols: self.protocols.clone(),
            observed_addr: Some(connection.remote_addr().clone()),
            protocol_version: PROTOCOL_VERSION.to_string(),
            agent_version: self.agent_version.clone(),
        };
        write_lp(&mut stream, &info.encode())
            .await
            .context("failed to send identify")?;
        stream.shutdown().await?;
        trace!(peer = %connection.remote_peer(), "sent identify");
        Ok(())
    }
}

/// Asks the remote of `connection` to identify itself.
///
/// The announced key must be the one the secure channel authenticated.
pub async fn request(connection: &Connection) -> Result<IdentifyInfo> {
    let mut stream = connection.open_stream(PROTOCOL_NAME).await?;
    let bytes = read_lp(&mut stream, MAX_MESSAGE_SIZE)
        .await?
        .ok_or_else(|| Error::Identify("stream closed before the response".into()))?;
    let info = IdentifyInfo::decode(&bytes)?;
    if &info.public_key != connection.remote_public_key() {
        return Err(Error::Identify(
            "announced key differs from the authenticated one".into(),
        ));
    }
    debug!(
        peer = %connection.remote_peer(),
        agent = %info.agent_version,
        "identified"
    );
    Ok(info)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::Keypair;

    #[test]
    fn test_info_roundtrip() {
        let info = IdentifyInfo {
            public_key: Keypair::generate().public(),
            listen_addrs: vec!["/ip4/127.0.0.1/tcp/4001".parse().unwrap()],
            protocols: vec![PROTOCOL_NAME.to_string(), "/ipfs/bitswap/1.1.0".to_string()],
            observed_addr: Some("/ip4/1.2.3.4/tcp/5".parse().unwrap()),
            protocol_version: PROTOCOL_VERSION.to_string(),
            agent_version: "test/1.0".to_string(),
        };
        assert_eq!(IdentifyInfo::decode(&info.encode()).unwrap(), info);
    }

    #[test]
    fn test_missing_key() {
        let bytes = pb::Identify::default().encode_to_vec();
        assert!(matches!(
            IdentifyInfo::decode(&bytes),
            Err(Error::Identify(_))
        ));
    }
}
