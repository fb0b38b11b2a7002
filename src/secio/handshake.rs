use std::cmp::Ordering;
use std::io;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures_util::{SinkExt, StreamExt};
use prost::Message;
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest as _, Sha256};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{Framed, FramedParts, LengthDelimitedCodec};
use tracing::{debug, trace};

use super::cipher::{stretch_keys, Cipher, Digest};
use super::stream::{SecioCodec, SecureStream};
use crate::keys::{KeyError, Keypair, PublicKey};

mod pb {
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Propose {
        #[prost(bytes = "vec", tag = "1")]
        pub rand: Vec<u8>,
        #[prost(bytes = "vec", tag = "2")]
        pub pubkey: Vec<u8>,
        #[prost(string, tag = "3")]
        pub exchanges: String,
        #[prost(string, tag = "4")]
        pub ciphers: String,
        #[prost(string, tag = "5")]
        pub hashes: String,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Exchange {
        #[prost(bytes = "vec", tag = "1")]
        pub epubkey: Vec<u8>,
        #[prost(bytes = "vec", tag = "2")]
        pub signature: Vec<u8>,
    }
}

const NONCE_SIZE: usize = 16;
const EXCHANGE_X25519: &str = "X25519";

/// Default maximum size of a single packet.
pub const MAX_PACKET_LEN: usize = 8 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum HandshakeError {
    #[error("no common {kind}, remote supports {remote:?}")]
    NotSupported { kind: &'static str, remote: String },
    #[error("connected to ourselves")]
    ConnectedToSelf,
    #[error("invalid exchange signature")]
    InvalidSignature,
    #[error("invalid ephemeral public key")]
    InvalidEphemeralKey,
    #[error("invalid stretched key length")]
    InvalidKeyLength,
    #[error("remote did not return our nonce")]
    NonceMismatch,
    #[error("handshake timed out")]
    Timeout,
    #[error("invalid remote public key: {0}")]
    Key(#[from] KeyError),
    #[error("invalid handshake message: {0}")]
    Decode(#[from] prost::DecodeError),
    #[error("io: {0}")]
    Io(#[from] io::Error),
}

/// Parameters of the secure channel handshake.
#[derive(Debug, Clone)]
pub struct Config {
    /// Supported ciphers, most preferred first.
    pub ciphers: Vec<Cipher>,
    /// Supported hashes for the mac, most preferred first.
    pub hashes: Vec<Digest>,
    /// Bound on the whole handshake.
    pub timeout: Duration,
    pub max_packet_len: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            ciphers: vec![Cipher::Aes256, Cipher::Aes128],
            hashes: vec![Digest::Sha256, Digest::Sha512],
            timeout: Duration::from_secs(30),
            max_packet_len: MAX_PACKET_LEN,
        }
    }
}

/// Runs the handshake over `socket`.
///
/// Returns the encrypted stream and the authenticated public key of the remote.
pub async fn handshake<T>(
    socket: T,
    keypair: &Keypair,
    config: &Config,
) -> Result<(SecureStream<T>, PublicKey), HandshakeError>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    tokio::time::timeout(config.timeout, run(socket, keypair, config))
        .await
        .map_err(|_| HandshakeError::Timeout)?
}

async fn run<T>(
    socket: T,
    keypair: &Keypair,
    config: &Config,
) -> Result<(SecureStream<T>, PublicKey), HandshakeError>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    let codec = LengthDelimitedCodec::builder()
        .max_frame_length(config.max_packet_len)
        .new_codec();
    let mut framed = Framed::new(socket, codec);

    let mut local_nonce = [0u8; NONCE_SIZE];
    OsRng.fill_bytes(&mut local_nonce);
    let local_pubkey = keypair.public().to_protobuf_encoding();
    let local_propose = pb::Propose {
        rand: local_nonce.to_vec(),
        pubkey: local_pubkey.clone(),
        exchanges: EXCHANGE_X25519.to_string(),
        ciphers: join_names(config.ciphers.iter().map(Cipher::name)),
        hashes: join_names(config.hashes.iter().map(Digest::name)),
    }
    .encode_to_vec();

    framed.send(Bytes::from(local_propose.clone())).await?;
    let remote_propose_bytes = recv(&mut framed).await?;
    let remote_propose = pb::Propose::decode(&remote_propose_bytes[..])?;
    let remote_public = PublicKey::from_protobuf_encoding(&remote_propose.pubkey)?;
    trace!("received proposition from {}", remote_public.to_peer_id());

    let order = {
        let oh1 = Sha256::new()
            .chain_update(&remote_propose.pubkey)
            .chain_update(local_nonce)
            .finalize();
        let oh2 = Sha256::new()
            .chain_update(&local_pubkey)
            .chain_update(&remote_propose.rand)
            .finalize();
        oh1.as_slice().cmp(oh2.as_slice())
    };
    if order == Ordering::Equal {
        return Err(HandshakeError::ConnectedToSelf);
    }

    select_best(order, "exchange", &[EXCHANGE_X25519], &remote_propose.exchanges, |e| *e)?;
    let cipher = select_best(order, "cipher", &config.ciphers, &remote_propose.ciphers, |c| {
        c.name()
    })?;
    let digest = select_best(order, "hash", &config.hashes, &remote_propose.hashes, |d| {
        d.name()
    })?;
    debug!(cipher = cipher.name(), hash = digest.name(), "negotiated secure channel");

    let secret = x25519_dalek::EphemeralSecret::random_from_rng(OsRng);
    let local_epubkey = x25519_dalek::PublicKey::from(&secret);

    let mut to_sign = Vec::with_capacity(
        local_propose.len() + remote_propose_bytes.len() + local_epubkey.as_bytes().len(),
    );
    to_sign.extend_from_slice(&local_propose);
    to_sign.extend_from_slice(&remote_propose_bytes);
    to_sign.extend_from_slice(local_epubkey.as_bytes());
    let local_exchange = pb::Exchange {
        epubkey: local_epubkey.as_bytes().to_vec(),
        signature: keypair.sign(&to_sign),
    };
    framed.send(Bytes::from(local_exchange.encode_to_vec())).await?;

    let remote_exchange = pb::Exchange::decode(recv(&mut framed).await?)?;
    let mut to_verify = Vec::with_capacity(to_sign.len());
    to_verify.extend_from_slice(&remote_propose_bytes);
    to_verify.extend_from_slice(&local_propose);
    to_verify.extend_from_slice(&remote_exchange.epubkey);
    remote_public
        .verify(&to_verify, &remote_exchange.signature)
        .map_err(|_| HandshakeError::InvalidSignature)?;

    let remote_epubkey: [u8; 32] = remote_exchange
        .epubkey
        .as_slice()
        .try_into()
        .map_err(|_| HandshakeError::InvalidEphemeralKey)?;
    let shared = secret.diffie_hellman(&x25519_dalek::PublicKey::from(remote_epubkey));
    if !shared.was_contributory() {
        return Err(HandshakeError::InvalidEphemeralKey);
    }

    let (k1, k2) = stretch_keys(cipher, digest, shared.as_bytes());
    let (local_key, remote_key) = match order {
        Ordering::Greater => (k1, k2),
        _ => (k2, k1),
    };
    let codec = SecioCodec::new(cipher, digest, &local_key, &remote_key, config.max_packet_len)?;

    // keep whatever the remote already sent past the exchange
    let old = framed.into_parts();
    let mut parts = FramedParts::new::<Bytes>(old.io, codec);
    parts.read_buf = old.read_buf;
    parts.write_buf = old.write_buf;
    let mut stream = SecureStream::new(Framed::from_parts(parts));

    stream
        .send_packet(Bytes::from(remote_propose.rand.clone()))
        .await?;
    let echoed = stream
        .next_packet()
        .await?
        .ok_or_else(|| io::Error::from(io::ErrorKind::UnexpectedEof))?;
    if echoed[..] != local_nonce[..] {
        return Err(HandshakeError::NonceMismatch);
    }

    Ok((stream, remote_public))
}

async fn recv<T>(framed: &mut Framed<T, LengthDelimitedCodec>) -> Result<BytesMut, HandshakeError>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    match framed.next().await {
        Some(res) => Ok(res?),
        None => Err(io::Error::from(io::ErrorKind::UnexpectedEof).into()),
    }
}

fn join_names<'a>(names: impl Iterator<Item = &'a str>) -> String {
    names.collect::<Vec<_>>().join(",")
}

/// Picks the first entry of the preferred side's list that the other side supports.
///
/// With a `Greater` order our own list is preferred.
fn select_best<T, F>(
    order: Ordering,
    kind: &'static str,
    local: &[T],
    remote: &str,
    name: F,
) -> Result<T, HandshakeError>
where
    T: Copy,
    F: Fn(&T) -> &str,
{
    let remote_names: Vec<&str> = remote.split(',').map(str::trim).collect();
    let found = match order {
        Ordering::Greater => local
            .iter()
            .find(|l| remote_names.contains(&name(l)))
            .copied(),
        _ => remote_names
            .iter()
            .find_map(|r| local.iter().find(|l| name(l) == *r))
            .copied(),
    };
    found.ok_or_else(|| HandshakeError::NotSupported {
        kind,
        remote: remote.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;

    #[tokio::test]
    async fn test_loopback_handshake() {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let key_a = Keypair::generate();
        let key_b = Keypair::generate();
        let config = Config::default();

        let (res_a, res_b) = tokio::join!(
            handshake(a, &key_a, &config),
            handshake(b, &key_b, &config)
        );
        let (mut stream_a, remote_of_a) = res_a.unwrap();
        let (mut stream_b, remote_of_b) = res_b.unwrap();
        assert_eq!(remote_of_a, key_b.public());
        assert_eq!(remote_of_b, key_a.public());

        stream_a.write_all(b"secret data").await.unwrap();
        stream_a.flush().await.unwrap();
        let mut buf = [0u8; 11];
        stream_b.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"secret data");

        stream_b.write_all(b"reply").await.unwrap();
        stream_b.flush().await.unwrap();
        let mut buf = [0u8; 5];
        stream_a.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"reply");
    }

    #[tokio::test]
    async fn test_cipher_mismatch() {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let key_a = Keypair::generate();
        let key_b = Keypair::generate();
        let config_a = Config {
            ciphers: vec![Cipher::Aes128],
            ..Default::default()
        };
        let config_b = Config {
            ciphers: vec![Cipher::Aes256],
            ..Default::default()
        };

        let (res_a, res_b) = tokio::join!(
            handshake(a, &key_a, &config_a),
            handshake(b, &key_b, &config_b)
        );
        assert!(matches!(
            res_a,
            Err(HandshakeError::NotSupported { kind: "cipher", .. })
        ));
        assert!(matches!(
            res_b,
            Err(HandshakeError::NotSupported { kind: "cipher", .. })
        ));
    }

    #[tokio::test]
    async fn test_connected_to_self() {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let key = Keypair::generate();
        let config = Config::default();

        // echo our own proposition back
        let (res_a, _) = tokio::join!(handshake(a, &key, &config), async move {
            let mut framed = Framed::new(b, LengthDelimitedCodec::new());
            let propose = framed.next().await.unwrap().unwrap();
            framed.send(propose.freeze()).await.unwrap();
            framed
        });
        assert!(matches!(res_a, Err(HandshakeError::ConnectedToSelf)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout() {
        let (a, _b) = tokio::io::duplex(64 * 1024);
        let config = Config {
            timeout: Duration::from_secs(1),
            ..Default::default()
        };
        let res = handshake(a, &Keypair::generate(), &config).await;
        assert!(matches!(res, Err(HandshakeError::Timeout)));
    }

    #[test]
    fn test_select_best_follows_order() {
        let local = [Cipher::Aes256, Cipher::Aes128];
        let remote = "AES-128,AES-256";
        let ours = select_best(Ordering::Greater, "cipher", &local, remote, |c| c.name()).unwrap();
        let theirs = select_best(Ordering::Less, "cipher", &local, remote, |c| c.name()).unwrap();
        assert_eq!(ours, Cipher::Aes256);
        assert_eq!(theirs, Cipher::Aes128);
    }
}
