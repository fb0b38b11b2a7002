use std::fmt::{self, Debug};

use ahash::AHashMap;
use bytes::Bytes;
use cid::Cid;
use prost::Message;

use super::block::Block;
use super::prefix::Prefix;
use super::protocol::ProtocolId;
use super::BitswapError;

mod pb {
    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct Message {
        #[prost(message, optional, tag = "1")]
        pub wantlist: Option<message::Wantlist>,
        /// Blocks of `/ipfs/bitswap/1.0.0`.
        #[prost(bytes = "bytes", repeated, tag = "2")]
        pub blocks: Vec<::bytes::Bytes>,
        #[prost(message, repeated, tag = "3")]
        pub payload: Vec<message::Block>,
    }

    pub mod message {
        #[derive(Clone, PartialEq, ::prost::Message)]
        pub struct Wantlist {
            #[prost(message, repeated, tag = "1")]
            pub entries: Vec<wantlist::Entry>,
            #[prost(bool, tag = "2")]
            pub full: bool,
        }

        pub mod wantlist {
            #[derive(Clone, PartialEq, ::prost::Message)]
            pub struct Entry {
                #[prost(bytes = "vec", tag = "1")]
                pub block: Vec<u8>,
                #[prost(int32, tag = "2")]
                pub priority: i32,
                #[prost(bool, tag = "3")]
                pub cancel: bool,
            }
        }

        #[derive(Clone, PartialEq, ::prost::Message)]
        pub struct Block {
            #[prost(bytes = "vec", tag = "1")]
            pub prefix: Vec<u8>,
            #[prost(bytes = "bytes", tag = "2")]
            pub data: ::bytes::Bytes,
        }
    }
}

/// Priority of a wanted block.
pub type Priority = i32;

/// A want list entry, either asking for a block or cancelling an earlier request.
#[derive(Clone, PartialEq, Eq)]
pub struct Entry {
    pub cid: Cid,
    pub priority: Priority,
    pub cancel: bool,
}

impl Debug for Entry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Entry")
            .field("cid", &self.cid.to_string())
            .field("priority", &self.priority)
            .field("cancel", &self.cancel)
            .finish()
    }
}

impl From<&Entry> for pb::message::wantlist::Entry {
    fn from(e: &Entry) -> Self {
        pb::message::wantlist::Entry {
            block: e.cid.to_bytes(),
            priority: e.priority,
            cancel: e.cancel,
        }
    }
}

/// A bitswap message.
#[derive(Default, Clone, PartialEq, Eq)]
pub struct BitswapMessage {
    full: bool,
    wantlist: AHashMap<Cid, Entry>,
    blocks: AHashMap<Cid, Block>,
}

impl Debug for BitswapMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BitswapMessage")
            .field("full", &self.full)
            .field("wantlist", &self.wantlist.values().collect::<Vec<_>>())
            .field(
                "blocks",
                &self
                    .blocks
                    .keys()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl BitswapMessage {
    /// A `full` message replaces everything the receiver knew about our wants.
    pub fn new(full: bool) -> Self {
        BitswapMessage {
            full,
            ..Default::default()
        }
    }

    pub fn full(&self) -> bool {
        self.full
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty() && self.wantlist.is_empty()
    }

    pub fn wantlist(&self) -> impl Iterator<Item = &Entry> {
        self.wantlist.values()
    }

    pub fn blocks(&self) -> impl Iterator<Item = &Block> {
        self.blocks.values()
    }

    pub fn blocks_len(&self) -> usize {
        self.blocks.len()
    }

    /// Total size of the block data carried.
    pub fn blocks_size(&self) -> usize {
        self.blocks.values().map(|b| b.data.len()).sum()
    }

    pub fn add_entry(&mut self, cid: Cid, priority: Priority) {
        self.add_full_entry(cid, priority, false);
    }

    pub fn cancel(&mut self, cid: Cid) {
        self.add_full_entry(cid, 0, true);
    }

    fn add_full_entry(&mut self, cid: Cid, priority: Priority, cancel: bool) {
        if let Some(entry) = self.wantlist.get_mut(&cid) {
            entry.priority = priority;
            // only change from dont cancel to cancel
            if cancel {
                entry.cancel = true;
            }
            return;
        }
        self.wantlist.insert(
            cid,
            Entry {
                cid,
                priority,
                cancel,
            },
        );
    }

    pub fn add_block(&mut self, block: Block) {
        self.blocks.insert(*block.cid(), block);
    }

    fn to_proto(&self, protocol: ProtocolId) -> pb::Message {
        let mut message = pb::Message::default();
        if self.full || !self.wantlist.is_empty() {
            message.wantlist = Some(pb::message::Wantlist {
                entries: self.wantlist.values().map(Into::into).collect(),
                full: self.full,
            });
        }
        match protocol {
            ProtocolId::Bitswap100 => {
                message.blocks = self.blocks.values().map(|b| b.data.clone()).collect();
            }
            ProtocolId::Bitswap110 => {
                message.payload = self
                    .blocks
                    .values()
                    .map(|block| pb::message::Block {
                        prefix: Prefix::from(block.cid()).to_bytes(),
                        data: block.data.clone(),
                    })
                    .collect();
            }
        }
        message
    }

    /// Encodes the message the way `protocol` expects it.
    pub fn encode(&self, protocol: ProtocolId) -> Bytes {
        self.to_proto(protocol).encode_to_vec().into()
    }

    /// Decodes a message of either protocol version.
    ///
    /// Block CIDs are computed from the data, so every decoded block hashes to its CID.
    pub fn decode(bytes: Bytes) -> Result<Self, BitswapError> {
        let pbm = pb::Message::decode(bytes)?;
        let full = pbm.wantlist.as_ref().map(|w| w.full).unwrap_or_default();
        let mut message = BitswapMessage::new(full);

        if let Some(wantlist) = pbm.wantlist {
            for entry in wantlist.entries {
                let cid = Cid::try_from(entry.block)?;
                message.add_full_entry(cid, entry.priority, entry.cancel);
            }
        }

        for data in pbm.blocks {
            message.add_block(Block::from_v0_data(data)?);
        }

        for block in pbm.payload {
            let prefix = Prefix::new(&block.prefix)?;
            let cid = prefix.to_cid(&block.data)?;
            message.add_block(Block::new(block.data, cid));
        }

        Ok(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_overrides_want() {
        let cid = *Block::raw(&b"a"[..]).cid();
        let mut msg = BitswapMessage::new(false);
        msg.add_entry(cid, 3);
        msg.cancel(cid);
        msg.add_entry(cid, 5);
        let entries: Vec<_> = msg.wantlist().collect();
        assert_eq!(entries.len(), 1);
        assert!(entries[0].cancel);
        assert_eq!(entries[0].priority, 5);
    }

    #[test]
    fn test_v1_carries_prefix() {
        let block = Block::raw(&b"payload"[..]);
        let wanted = *Block::raw(&b"wanted"[..]).cid();
        let mut msg = BitswapMessage::new(true);
        msg.add_block(block.clone());
        msg.add_entry(wanted, 1);

        let decoded = BitswapMessage::decode(msg.encode(ProtocolId::Bitswap110)).unwrap();
        assert!(decoded.full());
        assert_eq!(decoded.blocks().collect::<Vec<_>>(), vec![&block]);
        assert_eq!(decoded.wantlist().next().unwrap().cid, wanted);
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_v0_blocks_become_cid_v0() {
        let block = Block::raw(&b"legacy"[..]);
        let mut msg = BitswapMessage::new(false);
        msg.add_block(block.clone());

        let decoded = BitswapMessage::decode(msg.encode(ProtocolId::Bitswap100)).unwrap();
        let received = decoded.blocks().next().unwrap();
        assert_eq!(received.data, block.data);
        assert_eq!(received.cid.version(), cid::Version::V0);
        assert_eq!(received.cid.hash(), block.cid.hash());
    }

    #[test]
    fn test_garbage_fails() {
        assert!(BitswapMessage::decode(Bytes::from_static(&[0xff, 0xff, 0xff])).is_err());
    }
}
