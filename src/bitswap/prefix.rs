use cid::{Cid, Version};
use unsigned_varint::{decode as varint_decode, encode as varint_encode};

use super::block::hash;
use super::BitswapError;

/// Prefix represents all metadata of a CID, without the actual content.
#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub struct Prefix {
    pub version: Version,
    pub codec: u64,
    /// The multihash function.
    pub mh_type: u64,
    /// The length of the digest.
    pub mh_len: usize,
}

fn varint_error(err: varint_decode::Error) -> BitswapError {
    BitswapError::InvalidPrefix(err.to_string())
}

impl Prefix {
    /// Create a new prefix from encoded bytes.
    pub fn new(data: &[u8]) -> Result<Prefix, BitswapError> {
        let (raw_version, remain) = varint_decode::u64(data).map_err(varint_error)?;
        let version = Version::try_from(raw_version)?;
        let (codec, remain) = varint_decode::u64(remain).map_err(varint_error)?;
        let (mh_type, remain) = varint_decode::u64(remain).map_err(varint_error)?;
        let (mh_len, _remain) = varint_decode::usize(remain).map_err(varint_error)?;

        Ok(Prefix {
            version,
            codec,
            mh_type,
            mh_len,
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut res = Vec::with_capacity(4);
        for value in [
            u64::from(self.version),
            self.codec,
            self.mh_type,
            self.mh_len as u64,
        ] {
            let mut buf = varint_encode::u64_buffer();
            res.extend_from_slice(varint_encode::u64(value, &mut buf));
        }
        res
    }

    /// Hashes `data` into the CID this prefix describes.
    ///
    /// Fails if the hash function produces a digest of another length than announced.
    pub fn to_cid(&self, data: &[u8]) -> Result<Cid, BitswapError> {
        let mh = hash(self.mh_type, data)?;
        if mh.digest().len() != self.mh_len {
            return Err(BitswapError::InvalidPrefix(format!(
                "digest length {} does not match {}",
                mh.digest().len(),
                self.mh_len
            )));
        }
        Ok(Cid::new(self.version, self.codec, mh)?)
    }
}

impl From<&Cid> for Prefix {
    fn from(cid: &Cid) -> Self {
        Self {
            version: cid.version(),
            codec: cid.codec(),
            mh_type: cid.hash().code(),
            mh_len: cid.hash().digest().len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bitswap::block::{Block, RAW, SHA2_256};

    #[test]
    fn test_prefix_layout() {
        let block = Block::raw(&b"prefix"[..]);
        let prefix = Prefix::from(block.cid());
        assert_eq!(prefix.to_bytes(), vec![0x01, 0x55, 0x12, 0x20]);
        assert_eq!(Prefix::new(&prefix.to_bytes()).unwrap(), prefix);
        assert_eq!(prefix.codec, RAW);
        assert_eq!(prefix.mh_type, SHA2_256);
    }

    #[test]
    fn test_prefix_recreates_cid() {
        let block = Block::raw(&b"some data"[..]);
        let prefix = Prefix::from(block.cid());
        assert_eq!(prefix.to_cid(block.data()).unwrap(), block.cid);
    }

    #[test]
    fn test_wrong_digest_length() {
        let prefix = Prefix {
            version: Version::V1,
            codec: RAW,
            mh_type: SHA2_256,
            mh_len: 20,
        };
        assert!(matches!(
            prefix.to_cid(b"data"),
            Err(BitswapError::InvalidPrefix(_))
        ));
    }

    #[test]
    fn test_truncated_prefix() {
        assert!(Prefix::new(&[0x01, 0x55]).is_err());
    }
}
