//! The `/secio/1.0.0` secure channel.
//!
//! Both sides exchange a proposition with their identity key and supported algorithms, then
//! an ephemeral X25519 key signed with the identity key. The shared secret is stretched into
//! one [`StretchedKey`] per direction, after which every packet is encrypted with AES in CTR
//! mode and authenticated with an HMAC over the ciphertext.

mod cipher;
mod handshake;
mod stream;

pub use self::cipher::{stretch_keys, Cipher, CipherState, Digest, StretchedKey};
pub use self::handshake::{handshake, Config, HandshakeError, MAX_PACKET_LEN};
pub use self::stream::{SecioCodec, SecureStream};

/// Protocol name negotiated on the raw transport before the handshake.
pub const PROTOCOL_NAME: &str = "/secio/1.0.0";
