//! Symmetric state of an established secure channel.

use std::fmt;

use ctr::cipher::{KeyIvInit, StreamCipher as _};
use hmac::{Hmac, Mac as _};
use sha2::{Sha256, Sha512};

use super::HandshakeError;

const IV_SIZE: usize = 16;
const MAC_KEY_SIZE: usize = 20;
const SEED: &[u8] = b"key expansion";

/// Symmetric ciphers that can be negotiated, all used in CTR mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cipher {
    Aes128,
    Aes256,
}

impl Cipher {
    pub fn name(&self) -> &'static str {
        match self {
            Cipher::Aes128 => "AES-128",
            Cipher::Aes256 => "AES-256",
        }
    }

    pub fn key_size(&self) -> usize {
        match self {
            Cipher::Aes128 => 16,
            Cipher::Aes256 => 32,
        }
    }
}

/// Hash functions that can be negotiated for the HMAC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Digest {
    Sha256,
    Sha512,
}

impl Digest {
    pub fn name(&self) -> &'static str {
        match self {
            Digest::Sha256 => "SHA256",
            Digest::Sha512 => "SHA512",
        }
    }
}

/// Keys for one direction of a connection.
#[derive(Clone, PartialEq, Eq)]
pub struct StretchedKey {
    pub iv: Vec<u8>,
    pub cipher_key: Vec<u8>,
    pub mac_key: Vec<u8>,
}

impl fmt::Debug for StretchedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StretchedKey").finish_non_exhaustive()
    }
}

impl Drop for StretchedKey {
    fn drop(&mut self) {
        use zeroize::Zeroize;
        self.iv.zeroize();
        self.cipher_key.zeroize();
        self.mac_key.zeroize();
    }
}

/// Derives the two directional keys from the Diffie-Hellman shared secret.
pub fn stretch_keys(cipher: Cipher, digest: Digest, secret: &[u8]) -> (StretchedKey, StretchedKey) {
    let cipher_key_size = cipher.key_size();
    let half = IV_SIZE + cipher_key_size + MAC_KEY_SIZE;
    let total = 2 * half;

    let mut result = Vec::with_capacity(total);
    let mut a = hmac(digest, secret, &[SEED]);
    while result.len() < total {
        let b = hmac(digest, secret, &[&a, SEED]);
        let todo = b.len().min(total - result.len());
        result.extend_from_slice(&b[..todo]);
        a = hmac(digest, secret, &[&a]);
    }

    let split = |half: &[u8]| {
        let (iv, rest) = half.split_at(IV_SIZE);
        let (cipher_key, mac_key) = rest.split_at(cipher_key_size);
        StretchedKey {
            iv: iv.to_vec(),
            cipher_key: cipher_key.to_vec(),
            mac_key: mac_key.to_vec(),
        }
    };
    let (k1, k2) = result.split_at(half);
    (split(k1), split(k2))
}

fn hmac(digest: Digest, key: &[u8], parts: &[&[u8]]) -> Vec<u8> {
    let mut mac = Mac::new(digest, key);
    for part in parts {
        mac.update(part);
    }
    mac.finalize()
}

#[derive(Clone)]
enum Mac {
    Sha256(Hmac<Sha256>),
    Sha512(Hmac<Sha512>),
}

impl Mac {
    fn new(digest: Digest, key: &[u8]) -> Self {
        match digest {
            Digest::Sha256 => Mac::Sha256(
                Hmac::new_from_slice(key).expect("hmac accepts keys of any size"),
            ),
            Digest::Sha512 => Mac::Sha512(
                Hmac::new_from_slice(key).expect("hmac accepts keys of any size"),
            ),
        }
    }

    fn size(&self) -> usize {
        match self {
            Mac::Sha256(_) => 32,
            Mac::Sha512(_) => 64,
        }
    }

    fn update(&mut self, data: &[u8]) {
        match self {
            Mac::Sha256(m) => m.update(data),
            Mac::Sha512(m) => m.update(data),
        }
    }

    fn finalize(self) -> Vec<u8> {
        match self {
            Mac::Sha256(m) => m.finalize().into_bytes().to_vec(),
            Mac::Sha512(m) => m.finalize().into_bytes().to_vec(),
        }
    }

    fn verify(self, tag: &[u8]) -> bool {
        match self {
            Mac::Sha256(m) => m.verify_slice(tag).is_ok(),
            Mac::Sha512(m) => m.verify_slice(tag).is_ok(),
        }
    }
}

enum StreamCipher {
    Aes128(ctr::Ctr128BE<aes::Aes128>),
    Aes256(ctr::Ctr128BE<aes::Aes256>),
}

impl StreamCipher {
    fn new(cipher: Cipher, key: &StretchedKey) -> Result<Self, HandshakeError> {
        let res = match cipher {
            Cipher::Aes128 => {
                ctr::Ctr128BE::new_from_slices(&key.cipher_key, &key.iv).map(StreamCipher::Aes128)
            }
            Cipher::Aes256 => {
                ctr::Ctr128BE::new_from_slices(&key.cipher_key, &key.iv).map(StreamCipher::Aes256)
            }
        };
        res.map_err(|_| HandshakeError::InvalidKeyLength)
    }

    fn apply_keystream(&mut self, buf: &mut [u8]) {
        match self {
            StreamCipher::Aes128(c) => c.apply_keystream(buf),
            StreamCipher::Aes256(c) => c.apply_keystream(buf),
        }
    }
}

/// Cipher and MAC state for one direction of a secure channel.
///
/// The CTR keystream position advances with every packet, so each direction has exactly one
/// owner and packets must be processed in order. Not `Clone` on purpose.
pub struct CipherState {
    cipher: StreamCipher,
    mac: Mac,
}

impl fmt::Debug for CipherState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CipherState")
            .field("mac_size", &self.mac.size())
            .finish_non_exhaustive()
    }
}

impl CipherState {
    pub fn new(cipher: Cipher, digest: Digest, key: &StretchedKey) -> Result<Self, HandshakeError> {
        Ok(CipherState {
            cipher: StreamCipher::new(cipher, key)?,
            mac: Mac::new(digest, &key.mac_key),
        })
    }

    pub fn mac_size(&self) -> usize {
        self.mac.size()
    }

    /// Encrypts `data` in place and returns the MAC of the ciphertext.
    pub fn seal(&mut self, data: &mut [u8]) -> Vec<u8> {
        self.cipher.apply_keystream(data);
        let mut mac = self.mac.clone();
        mac.update(data);
        mac.finalize()
    }

    /// Verifies `tag` against the ciphertext, then decrypts it in place.
    ///
    /// On a MAC mismatch the data is left untouched and the keystream does not advance.
    pub fn open(&mut self, data: &mut [u8], tag: &[u8]) -> bool {
        let mut mac = self.mac.clone();
        mac.update(data);
        if !mac.verify(tag) {
            return false;
        }
        self.cipher.apply_keystream(data);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stretch_sizes() {
        let (k1, k2) = stretch_keys(Cipher::Aes256, Digest::Sha256, b"shared secret");
        assert_eq!(k1.iv.len(), 16);
        assert_eq!(k1.cipher_key.len(), 32);
        assert_eq!(k1.mac_key.len(), 20);
        assert_ne!(k1, k2);

        let (k3, _) = stretch_keys(Cipher::Aes128, Digest::Sha512, b"shared secret");
        assert_eq!(k3.cipher_key.len(), 16);
    }

    #[test]
    fn test_stretch_is_deterministic() {
        let a = stretch_keys(Cipher::Aes128, Digest::Sha256, b"secret");
        let b = stretch_keys(Cipher::Aes128, Digest::Sha256, b"secret");
        assert_eq!(a, b);
        let c = stretch_keys(Cipher::Aes128, Digest::Sha256, b"other secret");
        assert_ne!(a, c);
    }

    #[test]
    fn test_seal_open() {
        let (key, _) = stretch_keys(Cipher::Aes128, Digest::Sha256, b"secret");
        let mut sender = CipherState::new(Cipher::Aes128, Digest::Sha256, &key).unwrap();
        let mut receiver = CipherState::new(Cipher::Aes128, Digest::Sha256, &key).unwrap();

        for msg in [&b"first"[..], b"second message", b""] {
            let mut data = msg.to_vec();
            let tag = sender.seal(&mut data);
            if !msg.is_empty() {
                assert_ne!(data.as_slice(), msg, "ciphertext must differ");
            }
            assert!(receiver.open(&mut data, &tag));
            assert_eq!(data.as_slice(), msg);
        }
    }

    #[test]
    fn test_open_rejects_bad_tag() {
        let (key, _) = stretch_keys(Cipher::Aes256, Digest::Sha512, b"secret");
        let mut sender = CipherState::new(Cipher::Aes256, Digest::Sha512, &key).unwrap();
        let mut receiver = CipherState::new(Cipher::Aes256, Digest::Sha512, &key).unwrap();

        let mut data = b"payload".to_vec();
        let mut tag = sender.seal(&mut data);
        tag[0] ^= 1;
        let before = data.clone();
        assert!(!receiver.open(&mut data, &tag));
        assert_eq!(data, before);
    }
}
