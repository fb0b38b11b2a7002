use ahash::AHashSet;
use cid::Cid;

/// The history of block exchanges with one peer.
#[derive(Default, Debug, Clone, PartialEq)]
pub struct Ledger {
    /// Blocks sent plus blocks received.
    pub blocks_exchanged: u64,
    pub data_sent: u64,
    pub data_received: u64,
    /// Wants we sent to the peer and did not cancel yet.
    sent_wants: AHashSet<Cid>,
}

impl Ledger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_sent(&mut self, blocks: usize, bytes: usize) {
        self.blocks_exchanged += blocks as u64;
        self.data_sent += bytes as u64;
    }

    pub fn record_received(&mut self, bytes: usize) {
        self.blocks_exchanged += 1;
        self.data_received += bytes as u64;
    }

    /// How much more we gave than we got.
    pub fn debt_ratio(&self) -> f64 {
        self.data_sent as f64 / (self.data_received + 1) as f64
    }

    /// Remembers a want sent to the peer, returns `false` if it was sent before.
    pub(crate) fn want_sent(&mut self, cid: Cid) -> bool {
        self.sent_wants.insert(cid)
    }

    /// Forgets a want, returns whether the peer had been told about it.
    pub(crate) fn want_cancelled(&mut self, cid: &Cid) -> bool {
        self.sent_wants.remove(cid)
    }

    pub(crate) fn has_sent_wants(&self) -> bool {
        !self.sent_wants.is_empty()
    }

    /// The peer is gone and forgot what we asked for.
    pub(crate) fn reset_wants(&mut self) {
        self.sent_wants.clear();
    }
}
