use bytes::Bytes;
use cid::multihash::Multihash;
use cid::Cid;
use sha2::{Digest, Sha256, Sha512};

use super::BitswapError;

pub const IDENTITY: u64 = 0x00;
pub const SHA2_256: u64 = 0x12;
pub const SHA2_512: u64 = 0x13;

/// Multicodec of raw binary blocks.
pub const RAW: u64 = 0x55;

/// Hashes `data` with the multihash function `code`.
pub fn hash(code: u64, data: &[u8]) -> Result<Multihash<64>, BitswapError> {
    let mh = match code {
        SHA2_256 => Multihash::wrap(code, Sha256::digest(data).as_slice()),
        SHA2_512 => Multihash::wrap(code, Sha512::digest(data).as_slice()),
        IDENTITY => Multihash::wrap(code, data),
        _ => return Err(BitswapError::UnsupportedHash(code)),
    };
    mh.map_err(|_| BitswapError::UnsupportedHash(code))
}

/// A wrapper around bytes with their `Cid`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Block {
    pub cid: Cid,
    pub data: Bytes,
}

impl Block {
    pub fn new(data: Bytes, cid: Cid) -> Self {
        Self { cid, data }
    }

    /// Hashes `data` into a CIDv1 `raw` block.
    pub fn raw(data: impl Into<Bytes>) -> Self {
        let data = data.into();
        let mh = hash(SHA2_256, &data).expect("sha2-256 is supported");
        Block::new(data, Cid::new_v1(RAW, mh))
    }

    /// Blocks of `/ipfs/bitswap/1.0.0` carry no prefix and are always CIDv0.
    pub fn from_v0_data(data: Bytes) -> Result<Self, BitswapError> {
        let cid = Cid::new_v0(hash(SHA2_256, &data)?)?;
        Ok(Block::new(data, cid))
    }

    pub fn cid(&self) -> &Cid {
        &self.cid
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    /// Checks that the data hashes to the cid.
    pub fn verify(&self) -> Result<(), BitswapError> {
        let mh = self.cid.hash();
        if hash(mh.code(), &self.data)? == *mh {
            Ok(())
        } else {
            Err(BitswapError::InvalidBlock(self.cid))
        }
    }
}
