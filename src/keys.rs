//! Handles the local identity: ed25519 keypairs, their wire encoding and storage on disk.

use std::fmt;
use std::path::Path;

use anyhow::{anyhow, Context, Result};
use data_encoding::HEXLOWER;
use ed25519_dalek::{Signer, Verifier};
use prost::Message;
use rand::rngs::OsRng;
use tokio::fs;
use tracing::{debug, info};
use zeroize::Zeroizing;

use crate::peer::PeerId;

mod pb {
    /// Wire encoding of a public key, as used by the handshake and the identify protocol.
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct PublicKey {
        #[prost(int32, tag = "1")]
        pub key_type: i32,
        #[prost(bytes = "vec", tag = "2")]
        pub data: Vec<u8>,
    }

    pub const KEY_TYPE_ED25519: i32 = 1;
}

/// Errors when decoding a remote public key or verifying its signatures.
#[derive(Debug, thiserror::Error)]
pub enum KeyError {
    #[error("invalid public key encoding: {0}")]
    Decode(#[from] prost::DecodeError),
    #[error("unsupported key type {0}")]
    UnsupportedKeyType(i32),
    #[error("invalid ed25519 public key")]
    InvalidKey,
    #[error("invalid signature")]
    InvalidSignature,
}

/// The public half of an identity.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct PublicKey(ed25519_dalek::VerifyingKey);

impl PublicKey {
    /// Encodes the key into its protobuf form, which is what peer ids are derived from.
    pub fn to_protobuf_encoding(&self) -> Vec<u8> {
        pb::PublicKey {
            key_type: pb::KEY_TYPE_ED25519,
            data: self.0.to_bytes().to_vec(),
        }
        .encode_to_vec()
    }

    pub fn from_protobuf_encoding(bytes: &[u8]) -> Result<Self, KeyError> {
        let key = pb::PublicKey::decode(bytes)?;
        if key.key_type != pb::KEY_TYPE_ED25519 {
            return Err(KeyError::UnsupportedKeyType(key.key_type));
        }
        let data: [u8; 32] = key
            .data
            .as_slice()
            .try_into()
            .map_err(|_| KeyError::InvalidKey)?;
        let key = ed25519_dalek::VerifyingKey::from_bytes(&data).map_err(|_| KeyError::InvalidKey)?;
        Ok(PublicKey(key))
    }

    pub fn to_peer_id(&self) -> PeerId {
        PeerId::from_public_key(self)
    }

    /// Verifies an ed25519 signature over `msg`.
    pub fn verify(&self, msg: &[u8], signature: &[u8]) -> Result<(), KeyError> {
        let signature =
            ed25519_dalek::Signature::from_slice(signature).map_err(|_| KeyError::InvalidSignature)?;
        self.0
            .verify(msg, &signature)
            .map_err(|_| KeyError::InvalidSignature)
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", HEXLOWER.encode(self.0.as_bytes()))
    }
}

/// The local identity.
#[derive(Clone)]
pub struct Keypair {
    secret: ed25519_dalek::SigningKey,
}

impl fmt::Debug for Keypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Keypair")
            .field("public", &self.public())
            .finish_non_exhaustive()
    }
}

impl Keypair {
    /// Generates a new random ed25519 keypair.
    pub fn generate() -> Self {
        Keypair {
            secret: ed25519_dalek::SigningKey::generate(&mut OsRng),
        }
    }

    pub fn from_secret_bytes(bytes: &[u8; 32]) -> Self {
        Keypair {
            secret: ed25519_dalek::SigningKey::from_bytes(bytes),
        }
    }

    pub fn secret_bytes(&self) -> Zeroizing<[u8; 32]> {
        Zeroizing::new(self.secret.to_bytes())
    }

    pub fn public(&self) -> PublicKey {
        PublicKey(self.secret.verifying_key())
    }

    pub fn peer_id(&self) -> PeerId {
        self.public().to_peer_id()
    }

    pub fn sign(&self, msg: &[u8]) -> Vec<u8> {
        self.secret.sign(msg).to_bytes().to_vec()
    }
}

/// Loads the keypair stored at `path`, creating and storing a new one if the file is missing.
///
/// The secret is stored hex encoded.
pub async fn load_or_create(path: &Path) -> Result<Keypair> {
    if fs::try_exists(path).await? {
        let content = Zeroizing::new(
            fs::read_to_string(path)
                .await
                .with_context(|| format!("failed to read key file {}", path.display()))?,
        );
        let bytes = Zeroizing::new(
            HEXLOWER
                .decode(content.trim().as_bytes())
                .map_err(|err| anyhow!("invalid key file {}: {err}", path.display()))?,
        );
        let secret: [u8; 32] = bytes
            .as_slice()
            .try_into()
            .map_err(|_| anyhow!("invalid key length in {}", path.display()))?;
        let keypair = Keypair::from_secret_bytes(&secret);
        debug!("loaded identity {} from {}", keypair.peer_id(), path.display());
        return Ok(keypair);
    }

    let keypair = Keypair::generate();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }
    let encoded = Zeroizing::new(HEXLOWER.encode(keypair.secret_bytes().as_slice()));
    fs::write(path, encoded.as_bytes())
        .await
        .with_context(|| format!("failed to write key file {}", path.display()))?;
    info!("created new identity {} at {}", keypair.peer_id(), path.display());
    Ok(keypair)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_public_key_encoding() {
        let keypair = Keypair::generate();
        let encoded = keypair.public().to_protobuf_encoding();
        let decoded = PublicKey::from_protobuf_encoding(&encoded).unwrap();
        assert_eq!(decoded, keypair.public());
        assert_eq!(decoded.to_peer_id(), keypair.peer_id());
    }

    #[test]
    fn test_sign_verify() {
        let keypair = Keypair::generate();
        let sig = keypair.sign(b"hello");
        keypair.public().verify(b"hello", &sig).unwrap();
        assert!(keypair.public().verify(b"hellO", &sig).is_err());
        assert!(Keypair::generate().public().verify(b"hello", &sig).is_err());
    }

    #[test]
    fn test_unsupported_key_type() {
        let encoded = pb::PublicKey {
            key_type: 0,
            data: vec![1; 32],
        }
        .encode_to_vec();
        assert!(matches!(
            PublicKey::from_protobuf_encoding(&encoded),
            Err(KeyError::UnsupportedKeyType(0))
        ));
    }

    #[tokio::test]
    async fn test_load_or_create() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keys").join("identity");
        let created = load_or_create(&path).await.unwrap();
        let loaded = load_or_create(&path).await.unwrap();
        assert_eq!(created.peer_id(), loaded.peer_id());
    }
}
