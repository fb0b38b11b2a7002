//! The block store the engine serves from and saves received blocks to.

use std::sync::Arc;

use ahash::{AHashMap, AHashSet};
use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use cid::multibase::Base;
use cid::{Cid, Version};
use parking_lot::RwLock;
use tracing::trace;

use super::block::{hash, RAW, SHA2_256};

/// How to turn bytes into a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PutOptions {
    pub version: Version,
    pub codec: u64,
    /// Multihash function code.
    pub hash: u64,
    /// Multibase the CID is shown in.
    pub encoding: Base,
    /// Pinned blocks are never evicted.
    pub pin: bool,
}

impl Default for PutOptions {
    fn default() -> Self {
        PutOptions {
            version: Version::V1,
            codec: RAW,
            hash: SHA2_256,
            encoding: Base::Base32Lower,
            pin: false,
        }
    }
}

impl From<&Cid> for PutOptions {
    fn from(cid: &Cid) -> Self {
        PutOptions {
            version: cid.version(),
            codec: cid.codec(),
            hash: cid.hash().code(),
            encoding: match cid.version() {
                Version::V0 => Base::Base58Btc,
                Version::V1 => Base::Base32Lower,
            },
            pin: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockStat {
    pub size: usize,
}

#[async_trait]
pub trait BlockStore: Send + Sync + 'static {
    async fn get(&self, cid: &Cid) -> Result<Option<Bytes>>;

    /// Stores `data`, returning the CID it is stored under.
    async fn put(&self, data: Bytes, options: PutOptions) -> Result<Cid>;

    /// Returns `None` if the block is not stored.
    async fn stat(&self, cid: &Cid) -> Result<Option<BlockStat>>;
}

/// Keeps blocks in memory.
#[derive(Debug, Clone, Default)]
pub struct MemoryBlockStore {
    inner: Arc<RwLock<Blocks>>,
}

#[derive(Debug, Default)]
struct Blocks {
    data: AHashMap<Cid, Bytes>,
    pinned: AHashSet<Cid>,
}

impl MemoryBlockStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.inner.read().data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().data.is_empty()
    }

    pub fn is_pinned(&self, cid: &Cid) -> bool {
        self.inner.read().pinned.contains(cid)
    }
}

#[async_trait]
impl BlockStore for MemoryBlockStore {
    async fn get(&self, cid: &Cid) -> Result<Option<Bytes>> {
        Ok(self.inner.read().data.get(cid).cloned())
    }

    async fn put(&self, data: Bytes, options: PutOptions) -> Result<Cid> {
        let mh = hash(options.hash, &data)?;
        let cid = Cid::new(options.version, options.codec, mh)?;
        trace!(cid = %cid.to_string_of_base(options.encoding)?, len = data.len(), "put block");
        let mut blocks = self.inner.write();
        blocks.data.insert(cid, data);
        if options.pin {
            blocks.pinned.insert(cid);
        }
        Ok(cid)
    }

    async fn stat(&self, cid: &Cid) -> Result<Option<BlockStat>> {
        Ok(self
            .inner
            .read()
            .data
            .get(cid)
            .map(|data| BlockStat { size: data.len() }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bitswap::Block;

    #[tokio::test]
    async fn test_put_get_stat() {
        let store = MemoryBlockStore::new();
        let data = Bytes::from_static(b"hello");
        let cid = store
            .put(
                data.clone(),
                PutOptions {
                    pin: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(cid, *Block::raw(data.clone()).cid());
        assert_eq!(store.get(&cid).await.unwrap(), Some(data));
        assert_eq!(store.stat(&cid).await.unwrap(), Some(BlockStat { size: 5 }));
        assert!(store.is_pinned(&cid));

        let missing = *Block::raw(&b"missing"[..]).cid();
        assert_eq!(store.get(&missing).await.unwrap(), None);
        assert_eq!(store.stat(&missing).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_put_with_cid_options_keeps_cid() {
        let store = MemoryBlockStore::new();
        let block = Block::from_v0_data(Bytes::from_static(b"v0 block")).unwrap();
        let cid = store
            .put(block.data.clone(), PutOptions::from(block.cid()))
            .await
            .unwrap();
        assert_eq!(cid, block.cid);
    }
}
