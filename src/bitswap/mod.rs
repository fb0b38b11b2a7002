//! Block exchange over `/ipfs/bitswap/1.1.0` and `/ipfs/bitswap/1.0.0`.
//!
//! [`Bitswap`] keeps the set of wanted blocks. Local callers wait in [`Bitswap::want_block`],
//! remote peers register their interest by sending want lists. Whoever calls
//! [`Bitswap::found`] first for a CID satisfies everybody interested in it.

mod block;
mod ledger;
mod message;
mod prefix;
mod protocol;
mod store;

use std::collections::hash_map::Entry as MapEntry;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use ahash::{AHashMap, AHashSet};
use cid::Cid;
use parking_lot::Mutex;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, debug_span, trace, warn, Instrument};

pub use self::block::Block;
pub use self::ledger::Ledger;
pub use self::message::{BitswapMessage, Entry, Priority};
pub use self::prefix::Prefix;
pub use self::protocol::ProtocolId;
pub use self::store::{BlockStat, BlockStore, MemoryBlockStore, PutOptions};
use self::protocol::BitswapHandler;
use crate::config::BitswapConfig;
use crate::peer::PeerId;
use crate::swarm::{Swarm, SwarmBuilder, SwarmEvent};

const EVENT_CAPACITY: usize = 1024;
const DEFAULT_PRIORITY: Priority = 1;

#[derive(Debug, thiserror::Error)]
pub enum BitswapError {
    #[error("cancelled")]
    Cancelled,
    #[error("block does not hash to {0}")]
    InvalidBlock(Cid),
    #[error("invalid cid prefix: {0}")]
    InvalidPrefix(String),
    #[error("unsupported hash function {0:#x}")]
    UnsupportedHash(u64),
    #[error("invalid cid: {0}")]
    Cid(#[from] cid::Error),
    #[error("failed to decode message: {0}")]
    Decode(#[from] prost::DecodeError),
    #[error("block store: {0:#}")]
    Store(anyhow::Error),
    #[error("already started")]
    AlreadyStarted,
}

/// Changes of the want list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BitswapEvent {
    /// Somebody started wanting a block nobody wanted before.
    BlockNeeded(Cid),
    /// The last party interested in a block went away without it being found.
    Unwanted(Cid),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BitswapStats {
    pub blocks_received: u64,
    pub data_received: u64,
    pub blocks_sent: u64,
    pub data_sent: u64,
    /// Received blocks nobody wanted.
    pub dup_blocks_received: u64,
    pub dup_data_received: u64,
    pub messages_received: u64,
    pub want_list: Vec<Cid>,
    pub peers: Vec<PeerId>,
}

#[derive(Debug, Default)]
struct Counters {
    blocks_received: AtomicU64,
    data_received: AtomicU64,
    blocks_sent: AtomicU64,
    data_sent: AtomicU64,
    dup_blocks_received: AtomicU64,
    dup_data_received: AtomicU64,
    messages_received: AtomicU64,
}

impl Counters {
    fn add(counter: &AtomicU64, value: usize) {
        counter.fetch_add(value as u64, Ordering::Relaxed);
    }
}

struct Requester {
    id: u64,
    peer: PeerId,
    tx: oneshot::Sender<Block>,
}

/// Everybody waiting for one block.
#[derive(Default)]
struct WantedBlock {
    requesters: Vec<Requester>,
    /// Remote peers the block is forwarded to once found.
    remotes: AHashSet<PeerId>,
}

impl WantedBlock {
    fn is_empty(&self) -> bool {
        self.requesters.is_empty() && self.remotes.is_empty()
    }
}

/// Work for the event loop, which owns all outbound traffic.
#[derive(Debug)]
enum Command {
    Want(Cid),
    Cancel(Cid),
    SendBlock { peers: Vec<PeerId>, block: Block },
}

struct Inner {
    store: Arc<dyn BlockStore>,
    config: BitswapConfig,
    wanted: Mutex<AHashMap<Cid, WantedBlock>>,
    ledgers: Mutex<AHashMap<PeerId, Ledger>>,
    counters: Counters,
    events: broadcast::Sender<BitswapEvent>,
    commands: mpsc::UnboundedSender<Command>,
    command_rx: Mutex<Option<mpsc::UnboundedReceiver<Command>>>,
    swarm: OnceLock<Swarm>,
    next_id: AtomicU64,
    cancel: CancellationToken,
}

/// The block exchange engine.
///
/// Cheap to clone, every clone refers to the same engine.
#[derive(Clone)]
pub struct Bitswap {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Bitswap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bitswap")
            .field("wanted", &self.inner.wanted.lock().len())
            .finish_non_exhaustive()
    }
}

/// Withdraws one local requester when its `want_block` future goes away.
struct WantGuard<'a> {
    bitswap: &'a Bitswap,
    cid: Cid,
    id: u64,
}

impl Drop for WantGuard<'_> {
    fn drop(&mut self) {
        let removed = {
            let mut wanted = self.bitswap.inner.wanted.lock();
            match wanted.get_mut(&self.cid) {
                Some(want) => {
                    let before = want.requesters.len();
                    want.requesters.retain(|r| r.id != self.id);
                    let left = want.requesters.len() < before && want.is_empty();
                    if left {
                        wanted.remove(&self.cid);
                    }
                    left
                }
                None => false,
            }
        };
        if removed {
            self.bitswap.unwanted(self.cid);
        }
    }
}

impl Bitswap {
    pub fn new(store: Arc<dyn BlockStore>, config: BitswapConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (commands, command_rx) = mpsc::unbounded_channel();
        Bitswap {
            inner: Arc::new(Inner {
                store,
                config,
                wanted: Mutex::new(AHashMap::new()),
                ledgers: Mutex::new(AHashMap::new()),
                counters: Counters::default(),
                events,
                commands,
                command_rx: Mutex::new(Some(command_rx)),
                swarm: OnceLock::new(),
                next_id: AtomicU64::new(0),
                cancel: CancellationToken::new(),
            }),
        }
    }

    pub fn config(&self) -> &BitswapConfig {
        &self.inner.config
    }

    pub fn store(&self) -> &Arc<dyn BlockStore> {
        &self.inner.store
    }

    /// Registers the configured protocol versions with a swarm under construction.
    pub fn register(&self, mut builder: SwarmBuilder) -> SwarmBuilder {
        for protocol in &self.inner.config.protocols {
            builder = builder.protocol(
                protocol.name(),
                Arc::new(BitswapHandler {
                    bitswap: self.clone(),
                    protocol: *protocol,
                }),
            );
        }
        builder
    }

    /// Starts talking to the peers of `swarm`.
    ///
    /// Wants registered before are sent out once peers connect.
    pub fn start(&self, swarm: Swarm) -> Result<JoinHandle<()>, BitswapError> {
        let commands = self
            .inner
            .command_rx
            .lock()
            .take()
            .ok_or(BitswapError::AlreadyStarted)?;
        let events = swarm.subscribe();
        self.inner
            .swarm
            .set(swarm)
            .map_err(|_| BitswapError::AlreadyStarted)?;
        let span = debug_span!("bitswap");
        Ok(tokio::spawn(self.clone().run(events, commands).instrument(span)))
    }

    pub fn stop(&self) {
        self.inner.cancel.cancel();
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BitswapEvent> {
        self.inner.events.subscribe()
    }

    /// Waits until the block `cid` is found or `cancel` fires.
    ///
    /// Concurrent calls for the same CID share one want. Cancelling, or dropping the future,
    /// withdraws only this caller; the want goes away with the last caller.
    #[tracing::instrument(skip_all, fields(%cid, %requester))]
    pub async fn want_block(
        &self,
        cid: Cid,
        requester: PeerId,
        cancel: CancellationToken,
    ) -> Result<Block, BitswapError> {
        let (tx, rx) = oneshot::channel();
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let is_new = {
            let mut wanted = self.inner.wanted.lock();
            let entry = wanted.entry(cid);
            let is_new = matches!(entry, MapEntry::Vacant(_));
            entry.or_default().requesters.push(Requester {
                id,
                peer: requester,
                tx,
            });
            is_new
        };
        if is_new {
            self.needed(cid);
        }
        let _guard = WantGuard {
            bitswap: self,
            cid,
            id,
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(BitswapError::Cancelled),
            block = rx => block.map_err(|_| BitswapError::Cancelled),
        }
    }

    /// Withdraws every interest in `cid`, waiting callers fail with [`BitswapError::Cancelled`].
    pub fn unwant(&self, cid: &Cid) {
        let removed = self.inner.wanted.lock().remove(cid);
        if let Some(want) = removed {
            debug!(%cid, requesters = want.requesters.len(), "unwanted");
            // dropping the senders fails the waiters
            drop(want);
            self.unwanted(*cid);
        }
    }

    /// Hands `block` to everybody who wants it and returns how many parties that were.
    ///
    /// Remote peers that asked for the block are counted as well, it is forwarded to them.
    pub fn found(&self, block: Block) -> usize {
        let Some(want) = self.inner.wanted.lock().remove(block.cid()) else {
            return 0;
        };
        let count = want.requesters.len() + want.remotes.len();
        for requester in want.requesters {
            trace!(cid = %block.cid, requester = %requester.peer, "block found");
            // a requester that went away in the meantime is fine
            requester.tx.send(block.clone()).ok();
        }
        if !want.remotes.is_empty() {
            self.command(Command::SendBlock {
                peers: want.remotes.into_iter().collect(),
                block: block.clone(),
            });
        }
        self.command(Command::Cancel(block.cid));
        count
    }

    pub fn is_wanted(&self, cid: &Cid) -> bool {
        self.inner.wanted.lock().contains_key(cid)
    }

    pub fn want_list(&self) -> Vec<Cid> {
        self.inner.wanted.lock().keys().copied().collect()
    }

    /// The blocks `peer` asked us for that we do not have yet.
    pub fn peer_wants(&self, peer: &PeerId) -> Vec<Cid> {
        self.inner
            .wanted
            .lock()
            .iter()
            .filter(|(_, want)| want.remotes.contains(peer))
            .map(|(cid, _)| *cid)
            .collect()
    }

    pub fn ledger(&self, peer: &PeerId) -> Option<Ledger> {
        self.inner.ledgers.lock().get(peer).cloned()
    }

    pub fn stats(&self) -> BitswapStats {
        let c = &self.inner.counters;
        BitswapStats {
            blocks_received: c.blocks_received.load(Ordering::Relaxed),
            data_received: c.data_received.load(Ordering::Relaxed),
            blocks_sent: c.blocks_sent.load(Ordering::Relaxed),
            data_sent: c.data_sent.load(Ordering::Relaxed),
            dup_blocks_received: c.dup_blocks_received.load(Ordering::Relaxed),
            dup_data_received: c.dup_data_received.load(Ordering::Relaxed),
            messages_received: c.messages_received.load(Ordering::Relaxed),
            want_list: self.want_list(),
            peers: self.inner.ledgers.lock().keys().copied().collect(),
        }
    }

    fn emit(&self, event: BitswapEvent) {
        self.inner.events.send(event).ok();
    }

    fn command(&self, command: Command) {
        // the receiver lives as long as the engine
        self.inner.commands.send(command).ok();
    }

    fn needed(&self, cid: Cid) {
        debug!(%cid, "block needed");
        self.emit(BitswapEvent::BlockNeeded(cid));
        self.command(Command::Want(cid));
    }

    fn unwanted(&self, cid: Cid) {
        debug!(%cid, "block no longer needed");
        self.emit(BitswapEvent::Unwanted(cid));
        self.command(Command::Cancel(cid));
    }

    fn add_remote_want(&self, peer: PeerId, cid: Cid) {
        let is_new = {
            let mut wanted = self.inner.wanted.lock();
            let entry = wanted.entry(cid);
            let is_new = matches!(entry, MapEntry::Vacant(_));
            entry.or_default().remotes.insert(peer);
            is_new
        };
        if is_new {
            self.needed(cid);
        }
    }

    fn remove_remote_want(&self, peer: &PeerId, cid: &Cid) {
        let removed = {
            let mut wanted = self.inner.wanted.lock();
            let empty = match wanted.get_mut(cid) {
                Some(want) => want.remotes.remove(peer) && want.is_empty(),
                None => false,
            };
            if empty {
                wanted.remove(cid);
            }
            empty
        };
        if removed {
            self.unwanted(*cid);
        }
    }

    fn remove_remote_wants(&self, peer: &PeerId) {
        let removed: Vec<Cid> = {
            let mut wanted = self.inner.wanted.lock();
            let mut removed = Vec::new();
            wanted.retain(|cid, want| {
                if want.remotes.remove(peer) && want.is_empty() {
                    removed.push(*cid);
                    return false;
                }
                true
            });
            removed
        };
        for cid in removed {
            self.unwanted(cid);
        }
    }

    /// Handles one message from `peer`: stores wanted blocks, then answers its want list.
    pub async fn receive_message(&self, peer: PeerId, message: BitswapMessage) {
        Counters::add(&self.inner.counters.messages_received, 1);
        if message.full() {
            self.remove_remote_wants(&peer);
        }

        for block in message.blocks() {
            self.receive_block(peer, block.clone()).await;
        }

        let mut response = BitswapMessage::new(false);
        for entry in message.wantlist() {
            if entry.cancel {
                self.remove_remote_want(&peer, &entry.cid);
                continue;
            }
            match self.load_block(&entry.cid).await {
                Ok(Some(block)) => response.add_block(block),
                Ok(None) => self.add_remote_want(peer, entry.cid),
                Err(err) => warn!(%peer, cid = %entry.cid, "failed to serve block: {err}"),
            }
        }
        if !response.is_empty() {
            self.send(peer, response);
        }
    }

    async fn load_block(&self, cid: &Cid) -> Result<Option<Block>, BitswapError> {
        let store = &self.inner.store;
        if store.stat(cid).await.map_err(BitswapError::Store)?.is_none() {
            return Ok(None);
        }
        let Some(data) = store.get(cid).await.map_err(BitswapError::Store)? else {
            return Ok(None);
        };
        let block = Block::new(data, *cid);
        block.verify()?;
        Ok(Some(block))
    }

    async fn receive_block(&self, peer: PeerId, block: Block) {
        let len = block.data.len();
        let counters = &self.inner.counters;
        if !self.is_wanted(block.cid()) {
            trace!(%peer, cid = %block.cid, "dropping unwanted block");
            Counters::add(&counters.dup_blocks_received, 1);
            Counters::add(&counters.dup_data_received, len);
            return;
        }
        Counters::add(&counters.blocks_received, 1);
        Counters::add(&counters.data_received, len);
        self.inner
            .ledgers
            .lock()
            .entry(peer)
            .or_default()
            .record_received(len);

        let options = PutOptions::from(block.cid());
        if let Err(err) = self.inner.store.put(block.data.clone(), options).await {
            warn!(cid = %block.cid, "failed to store block: {err:#}");
        }
        let satisfied = self.found(block);
        trace!(%peer, satisfied, "received wanted block");
    }

    /// Sends `message` to `peer` in the background.
    fn send(&self, peer: PeerId, message: BitswapMessage) {
        let Some(swarm) = self.inner.swarm.get().cloned() else {
            trace!(%peer, "not started, dropping message");
            return;
        };
        let this = self.clone();
        let span = debug_span!("bitswap_send", %peer);
        tokio::spawn(
            async move {
                let Some(conn) = swarm.connection(&peer) else {
                    debug!("not connected, dropping message");
                    return;
                };
                let config = &this.inner.config;
                let res = protocol::send_message(
                    &conn,
                    &config.protocols,
                    config.max_message_size,
                    &message,
                )
                .await;
                match res {
                    Ok(protocol) => {
                        trace!(%protocol, "sent {:?}", message);
                        let (blocks, size) = (message.blocks_len(), message.blocks_size());
                        if blocks > 0 {
                            let counters = &this.inner.counters;
                            Counters::add(&counters.blocks_sent, blocks);
                            Counters::add(&counters.data_sent, size);
                            this.inner
                                .ledgers
                                .lock()
                                .entry(peer)
                                .or_default()
                                .record_sent(blocks, size);
                        }
                    }
                    Err(err) => warn!("failed to send message: {err}"),
                }
            }
            .instrument(span),
        );
    }

    async fn run(
        self,
        mut events: broadcast::Receiver<SwarmEvent>,
        mut commands: mpsc::UnboundedReceiver<Command>,
    ) {
        let cancel = self.inner.cancel.clone();
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                Some(command) = commands.recv() => self.handle_command(command),
                event = events.recv() => match event {
                    Ok(SwarmEvent::PeerConnected(peer)) => self.on_connected(peer),
                    Ok(SwarmEvent::PeerDisconnected(peer)) => self.on_disconnected(peer),
                    Ok(SwarmEvent::PeerDiscovered(_)) => {}
                    Err(RecvError::Lagged(n)) => warn!("missed {n} swarm events"),
                    Err(RecvError::Closed) => break,
                },
            }
        }
        debug!("bitswap stopped");
    }

    fn connected_peers(&self) -> Vec<PeerId> {
        self.inner
            .swarm
            .get()
            .map(|swarm| {
                swarm
                    .connections()
                    .iter()
                    .map(|conn| *conn.remote_peer())
                    .collect()
            })
            .unwrap_or_default()
    }

    fn handle_command(&self, command: Command) {
        trace!(?command, "handling");
        match command {
            Command::Want(cid) => {
                let interested = match self.inner.wanted.lock().get(&cid) {
                    Some(want) => want.remotes.clone(),
                    // already found or cancelled
                    None => return,
                };
                for peer in self.connected_peers() {
                    if interested.contains(&peer) {
                        continue;
                    }
                    let first = self
                        .inner
                        .ledgers
                        .lock()
                        .entry(peer)
                        .or_default()
                        .want_sent(cid);
                    if first {
                        let mut message = BitswapMessage::new(false);
                        message.add_entry(cid, DEFAULT_PRIORITY);
                        self.send(peer, message);
                    }
                }
            }
            Command::Cancel(cid) => {
                let peers: Vec<PeerId> = self
                    .inner
                    .ledgers
                    .lock()
                    .iter_mut()
                    .filter_map(|(peer, ledger)| ledger.want_cancelled(&cid).then_some(*peer))
                    .collect();
                for peer in peers {
                    let mut message = BitswapMessage::new(false);
                    message.cancel(cid);
                    self.send(peer, message);
                }
            }
            Command::SendBlock { peers, block } => {
                for peer in peers {
                    let mut message = BitswapMessage::new(false);
                    message.add_block(block.clone());
                    self.send(peer, message);
                }
            }
        }
    }

    /// Tells a new peer what we want.
    fn on_connected(&self, peer: PeerId) {
        let wants: Vec<Cid> = self
            .inner
            .wanted
            .lock()
            .iter()
            .filter(|(_, want)| !want.remotes.contains(&peer))
            .map(|(cid, _)| *cid)
            .collect();
        let message = {
            let mut ledgers = self.inner.ledgers.lock();
            let ledger = ledgers.entry(peer).or_default();
            // the full list replaces what the peer knows, unless it already heard from us
            let mut message = BitswapMessage::new(!ledger.has_sent_wants());
            for cid in wants {
                if ledger.want_sent(cid) {
                    message.add_entry(cid, DEFAULT_PRIORITY);
                }
            }
            message
        };
        if !message.is_empty() {
            debug!(%peer, "sending want list");
            self.send(peer, message);
        }
    }

    fn on_disconnected(&self, peer: PeerId) {
        if let Some(ledger) = self.inner.ledgers.lock().get_mut(&peer) {
            ledger.reset_wants();
        }
        self.remove_remote_wants(&peer);
    }

    #[cfg(test)]
    fn num_requesters(&self, cid: &Cid) -> usize {
        self.inner
            .wanted
            .lock()
            .get(cid)
            .map_or(0, |want| want.requesters.len())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;

    use super::*;

    fn engine() -> (Bitswap, MemoryBlockStore) {
        let store = MemoryBlockStore::new();
        let bitswap = Bitswap::new(Arc::new(store.clone()), BitswapConfig::default());
        (bitswap, store)
    }

    async fn wait_for_requesters(bitswap: &Bitswap, cid: &Cid, n: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while bitswap.num_requesters(cid) != n {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("requesters registered");
    }

    #[tokio::test]
    async fn test_found_satisfies_all_requesters() {
        let (bitswap, _) = engine();
        let mut events = bitswap.subscribe();
        let block = Block::raw(&b"wanted"[..]);
        let me = PeerId::random();

        let waiters: Vec<_> = (0..5)
            .map(|_| {
                let bitswap = bitswap.clone();
                let cid = block.cid;
                tokio::spawn(async move {
                    bitswap
                        .want_block(cid, me, CancellationToken::new())
                        .await
                })
            })
            .collect();
        wait_for_requesters(&bitswap, &block.cid, 5).await;
        assert_eq!(bitswap.want_list(), vec![block.cid]);

        assert_eq!(bitswap.found(block.clone()), 5);
        for waiter in waiters {
            assert_eq!(waiter.await.unwrap().unwrap(), block);
        }
        assert!(!bitswap.is_wanted(&block.cid));

        // announced once, not once per requester
        assert_eq!(
            events.recv().await.unwrap(),
            BitswapEvent::BlockNeeded(block.cid)
        );
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_found_without_requesters() {
        let (bitswap, _) = engine();
        assert_eq!(bitswap.found(Block::raw(&b"unsolicited"[..])), 0);
    }

    #[tokio::test]
    async fn test_cancel_removes_only_one_requester() {
        let (bitswap, _) = engine();
        let mut events = bitswap.subscribe();
        let block = Block::raw(&b"shared"[..]);
        let cid = block.cid;
        let me = PeerId::random();

        let cancel_a = CancellationToken::new();
        let a = tokio::spawn({
            let bitswap = bitswap.clone();
            let cancel = cancel_a.clone();
            async move { bitswap.want_block(cid, me, cancel).await }
        });
        let cancel_b = CancellationToken::new();
        let b = tokio::spawn({
            let bitswap = bitswap.clone();
            let cancel = cancel_b.clone();
            async move { bitswap.want_block(cid, me, cancel).await }
        });
        wait_for_requesters(&bitswap, &block.cid, 2).await;

        cancel_a.cancel();
        assert!(matches!(a.await.unwrap(), Err(BitswapError::Cancelled)));
        assert!(bitswap.is_wanted(&block.cid));
        assert_eq!(bitswap.num_requesters(&block.cid), 1);

        cancel_b.cancel();
        assert!(matches!(b.await.unwrap(), Err(BitswapError::Cancelled)));
        assert!(!bitswap.is_wanted(&block.cid));

        assert_eq!(
            events.recv().await.unwrap(),
            BitswapEvent::BlockNeeded(block.cid)
        );
        assert_eq!(
            events.recv().await.unwrap(),
            BitswapEvent::Unwanted(block.cid)
        );
    }

    #[tokio::test]
    async fn test_unwant_cancels_everybody() {
        let (bitswap, _) = engine();
        let cid = *Block::raw(&b"gone"[..]).cid();
        let me = PeerId::random();
        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let bitswap = bitswap.clone();
                tokio::spawn(async move {
                    bitswap.want_block(cid, me, CancellationToken::new()).await
                })
            })
            .collect();
        wait_for_requesters(&bitswap, &cid, 3).await;

        bitswap.unwant(&cid);
        for waiter in waiters {
            assert!(matches!(
                waiter.await.unwrap(),
                Err(BitswapError::Cancelled)
            ));
        }
        assert!(bitswap.want_list().is_empty());
    }

    #[tokio::test]
    async fn test_remote_wants() {
        let (bitswap, store) = engine();
        let remote = PeerId::random();
        let have = Block::raw(&b"have"[..]);
        store
            .put(have.data.clone(), PutOptions::default())
            .await
            .unwrap();
        let missing = *Block::raw(&b"missing"[..]).cid();

        let mut message = BitswapMessage::new(true);
        message.add_entry(have.cid, 1);
        message.add_entry(missing, 1);
        bitswap.receive_message(remote, message).await;

        // only the block we lack is remembered for the peer
        assert_eq!(bitswap.peer_wants(&remote), vec![missing]);
        assert_eq!(bitswap.stats().messages_received, 1);

        let mut cancel = BitswapMessage::new(false);
        cancel.cancel(missing);
        bitswap.receive_message(remote, cancel).await;
        assert!(bitswap.peer_wants(&remote).is_empty());
        assert!(!bitswap.is_wanted(&missing));
    }

    /// Hands out the same bytes for every cid.
    struct CorruptStore(Bytes);

    #[async_trait::async_trait]
    impl BlockStore for CorruptStore {
        async fn get(&self, _cid: &Cid) -> anyhow::Result<Option<Bytes>> {
            Ok(Some(self.0.clone()))
        }

        async fn put(&self, _data: Bytes, _options: PutOptions) -> anyhow::Result<Cid> {
            anyhow::bail!("read only")
        }

        async fn stat(&self, _cid: &Cid) -> anyhow::Result<Option<BlockStat>> {
            Ok(Some(BlockStat { size: self.0.len() }))
        }
    }

    #[tokio::test]
    async fn test_corrupt_blocks_are_not_served() {
        let store = CorruptStore(Bytes::from_static(b"garbage"));
        let bitswap = Bitswap::new(Arc::new(store), BitswapConfig::default());
        let cid = *Block::raw(&b"expected"[..]).cid();
        assert!(matches!(
            bitswap.load_block(&cid).await,
            Err(BitswapError::InvalidBlock(c)) if c == cid
        ));

        let good = Block::raw(&b"garbage"[..]);
        assert_eq!(bitswap.load_block(&good.cid).await.unwrap(), Some(good));
    }

    #[tokio::test]
    async fn test_found_counts_remote_interest() {
        let (bitswap, _) = engine();
        let block = Block::raw(&b"relay"[..]);
        let mut message = BitswapMessage::new(false);
        message.add_entry(block.cid, 1);
        bitswap.receive_message(PeerId::random(), message).await;
        assert_eq!(bitswap.found(block), 1);
    }

    #[tokio::test]
    async fn test_received_blocks() {
        let (bitswap, store) = engine();
        let remote = PeerId::random();
        let wanted = Block::raw(&b"wanted block"[..]);
        let unwanted = Block::raw(&b"spam"[..]);
        let cid = wanted.cid;

        let waiter = tokio::spawn({
            let bitswap = bitswap.clone();
            async move {
                bitswap
                    .want_block(cid, PeerId::random(), CancellationToken::new())
                    .await
            }
        });
        wait_for_requesters(&bitswap, &wanted.cid, 1).await;

        let mut message = BitswapMessage::new(false);
        message.add_block(wanted.clone());
        message.add_block(unwanted.clone());
        bitswap.receive_message(remote, message).await;

        assert_eq!(waiter.await.unwrap().unwrap(), wanted);
        assert_eq!(
            store.get(&wanted.cid).await.unwrap(),
            Some(wanted.data.clone())
        );
        assert_eq!(store.get(&unwanted.cid).await.unwrap(), None);

        let stats = bitswap.stats();
        assert_eq!(stats.blocks_received, 1);
        assert_eq!(stats.data_received, wanted.data.len() as u64);
        assert_eq!(stats.dup_blocks_received, 1);
        assert_eq!(stats.dup_data_received, 4);
        assert_eq!(stats.peers, vec![remote]);
        assert_eq!(bitswap.ledger(&remote).unwrap().data_received, 12);
    }

    #[tokio::test]
    async fn test_dropped_want_is_withdrawn() {
        let (bitswap, _) = engine();
        let cid = *Block::raw(Bytes::from_static(b"timeout")).cid();
        let res = tokio::time::timeout(
            Duration::from_millis(10),
            bitswap.want_block(cid, PeerId::random(), CancellationToken::new()),
        )
        .await;
        assert!(res.is_err());
        assert!(!bitswap.is_wanted(&cid));
    }
}
