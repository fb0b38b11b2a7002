//! Connection management.
//!
//! The [`Swarm`] dials and accepts transport streams and upgrades them into [`Connection`]s:
//! `/secio/1.0.0` is negotiated and the secure channel handshake runs, then `/mplex/6.7.0` is
//! negotiated and the multiplexer takes over. Every substream the remote opens is negotiated
//! against the registered protocols and handed to the matching handler.

mod auto_dial;
mod connection;
pub mod identify;
pub mod ping;
mod policy;
pub mod transport;

use std::collections::hash_map::Entry;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ahash::AHashMap;
use multiaddr::{Multiaddr, Protocol};
use parking_lot::{Mutex, RwLock};
use tokio::io::ReadHalf;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, debug_span, info, info_span, trace, warn, Instrument};

pub use self::connection::Connection;
pub use self::identify::IdentifyInfo;
pub use self::policy::AddressPolicy;
pub use self::transport::{AsyncStream, BoxedStream, Listener, TcpTransport, Transport};
use self::auto_dial::AutoDialer;
use self::identify::IdentifyHandler;
use self::ping::PingHandler;
use crate::address_book::AddressBook;
use crate::config::SwarmConfig;
use crate::error::{Error, Result};
use crate::keys::Keypair;
use crate::mplex::{self, Multiplexer, Role, Substream};
use crate::multistream::{self, ProtocolHandler, ProtocolRegistry};
use crate::peer::{strip_peer_id, with_peer_id, PeerId};
use crate::secio::{self, SecureStream};

const EVENT_CAPACITY: usize = 1024;

/// Notifications about the peers the swarm knows and talks to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SwarmEvent {
    /// A peer was added to the address book.
    PeerDiscovered(PeerId),
    PeerConnected(PeerId),
    PeerDisconnected(PeerId),
}

/// Dials to the same key are collapsed into one attempt.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum DialKey {
    Peer(PeerId),
    Address(Multiaddr),
}

type DialResult = std::result::Result<Connection, Arc<Error>>;

struct PendingDial {
    id: u64,
    waiters: Vec<(u64, oneshot::Sender<DialResult>)>,
    cancel: CancellationToken,
}

/// Builds a [`Swarm`].
pub struct SwarmBuilder {
    keypair: Keypair,
    config: SwarmConfig,
    protocols: ProtocolRegistry,
    transports: Vec<Arc<dyn Transport>>,
}

impl SwarmBuilder {
    pub fn config(mut self, config: SwarmConfig) -> Self {
        self.config = config;
        self
    }

    /// Answers substreams negotiating `name` with `handler`.
    pub fn protocol(mut self, name: impl Into<String>, handler: Arc<dyn ProtocolHandler>) -> Self {
        self.protocols.insert(name, handler);
        self
    }

    /// Adds a transport. Without any, plain TCP is used.
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transports.push(transport);
        self
    }

    pub fn build(self) -> Swarm {
        let SwarmBuilder {
            keypair,
            config,
            mut protocols,
            mut transports,
        } = self;
        if transports.is_empty() {
            transports.push(Arc::new(TcpTransport));
        }

        let listen_addrs = Arc::new(RwLock::new(Vec::new()));
        protocols.insert(ping::PROTOCOL_NAME, Arc::new(PingHandler));
        let mut names: Vec<String> = protocols.names().map(ToString::to_string).collect();
        names.push(identify::PROTOCOL_NAME.to_string());
        names.sort();
        protocols.insert(
            identify::PROTOCOL_NAME,
            Arc::new(IdentifyHandler {
                public_key: keypair.public(),
                agent_version: config.agent_version.clone(),
                protocols: names,
                listen_addrs: listen_addrs.clone(),
            }),
        );

        let secio = secio::Config {
            timeout: config.handshake_timeout(),
            ..Default::default()
        };
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let inner = Inner {
            local_peer: keypair.peer_id(),
            keypair,
            policy: AddressPolicy::new(config.allow.clone(), config.deny.clone()),
            config,
            secio,
            transports,
            protocols: Arc::new(protocols),
            address_book: AddressBook::new(),
            connections: RwLock::new(AHashMap::new()),
            pending: Mutex::new(AHashMap::new()),
            listeners: Mutex::new(AHashMap::new()),
            listen_addrs,
            events,
            cancel: CancellationToken::new(),
            next_id: AtomicU64::new(0),
        };
        Swarm {
            inner: Arc::new(inner),
        }
    }
}

struct Inner {
    keypair: Keypair,
    local_peer: PeerId,
    config: SwarmConfig,
    secio: secio::Config,
    policy: AddressPolicy,
    transports: Vec<Arc<dyn Transport>>,
    protocols: Arc<ProtocolRegistry>,
    address_book: AddressBook,
    connections: RwLock<AHashMap<PeerId, Connection>>,
    pending: Mutex<AHashMap<DialKey, PendingDial>>,
    listeners: Mutex<AHashMap<Multiaddr, CancellationToken>>,
    listen_addrs: Arc<RwLock<Vec<Multiaddr>>>,
    events: broadcast::Sender<SwarmEvent>,
    cancel: CancellationToken,
    next_id: AtomicU64,
}

/// Owns the peer and connection tables of a node.
///
/// Cheap to clone, every clone refers to the same swarm.
#[derive(Clone)]
pub struct Swarm {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Swarm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Swarm")
            .field("local_peer", &self.inner.local_peer)
            .field("connections", &self.num_connections())
            .finish_non_exhaustive()
    }
}

/// Removes a waiter from a pending dial when its caller goes away.
///
/// The last waiter leaving aborts the dial.
struct WaiterGuard<'a> {
    swarm: &'a Swarm,
    key: DialKey,
    waiter: u64,
}

impl Drop for WaiterGuard<'_> {
    fn drop(&mut self) {
        let mut pending = self.swarm.inner.pending.lock();
        if let Some(dial) = pending.get_mut(&self.key) {
            let before = dial.waiters.len();
            dial.waiters.retain(|(id, _)| *id != self.waiter);
            if dial.waiters.len() < before && dial.waiters.is_empty() {
                dial.cancel.cancel();
                pending.remove(&self.key);
            }
        }
    }
}

/// Holds a dialed connection that was not announced yet.
///
/// Dropped before [`Unannounced::announce`], as when the dial times out or is aborted while
/// identify runs, the connection is taken out of the tables again.
struct Unannounced<'a> {
    swarm: &'a Swarm,
    conn: Connection,
    armed: bool,
}

impl Unannounced<'_> {
    fn announce(mut self) {
        self.armed = false;
        self.swarm
            .emit(SwarmEvent::PeerConnected(*self.conn.remote_peer()));
    }
}

impl Drop for Unannounced<'_> {
    fn drop(&mut self) {
        if self.armed {
            debug!(peer = %self.conn.remote_peer(), "dial abandoned, dropping its connection");
            self.swarm.discard_connection(&self.conn);
        }
    }
}

impl Swarm {
    pub fn builder(keypair: Keypair) -> SwarmBuilder {
        SwarmBuilder {
            keypair,
            config: SwarmConfig::default(),
            protocols: ProtocolRegistry::new(),
            transports: Vec::new(),
        }
    }

    pub fn local_peer_id(&self) -> PeerId {
        self.inner.local_peer
    }

    pub fn keypair(&self) -> &Keypair {
        &self.inner.keypair
    }

    pub fn config(&self) -> &SwarmConfig {
        &self.inner.config
    }

    pub fn policy(&self) -> &AddressPolicy {
        &self.inner.policy
    }

    pub fn address_book(&self) -> &AddressBook {
        &self.inner.address_book
    }

    pub(crate) fn cancel_token(&self) -> CancellationToken {
        self.inner.cancel.clone()
    }

    pub fn is_running(&self) -> bool {
        !self.inner.cancel.is_cancelled()
    }

    /// Subscribes to [`SwarmEvent`]s fired from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<SwarmEvent> {
        self.inner.events.subscribe()
    }

    fn emit(&self, event: SwarmEvent) {
        trace!(?event, "swarm event");
        // nobody listening is fine
        self.inner.events.send(event).ok();
    }

    /// Addresses we are listening on.
    pub fn listen_addrs(&self) -> Vec<Multiaddr> {
        self.inner.listen_addrs.read().clone()
    }

    /// Protocols answered on incoming substreams.
    pub fn protocols(&self) -> Vec<String> {
        self.inner.protocols.names().map(ToString::to_string).collect()
    }

    pub fn connection(&self, peer: &PeerId) -> Option<Connection> {
        self.inner
            .connections
            .read()
            .get(peer)
            .filter(|conn| !conn.is_closed())
            .cloned()
    }

    pub fn connections(&self) -> Vec<Connection> {
        self.inner.connections.read().values().cloned().collect()
    }

    pub fn is_connected(&self, peer: &PeerId) -> bool {
        self.connection(peer).is_some()
    }

    pub fn num_connections(&self) -> usize {
        self.inner.connections.read().len()
    }

    pub fn is_dialing(&self, peer: &PeerId) -> bool {
        self.inner
            .pending
            .lock()
            .contains_key(&DialKey::Peer(*peer))
    }

    pub fn num_pending_dials(&self) -> usize {
        self.inner.pending.lock().len()
    }

    /// Listens on the configured addresses, registers the bootstrap peers and starts the
    /// auto dialer.
    pub async fn start(&self) -> Result<()> {
        if !self.is_running() {
            return Err(Error::NotRunning);
        }
        info!("local peer id: {}", self.local_peer_id());
        if self.inner.config.auto_dial {
            AutoDialer::spawn(self.clone());
        }
        for addr in self.inner.config.listen_addrs.clone() {
            self.start_listening(&addr).await?;
        }
        for addr in &self.inner.config.bootstrap {
            if let Err(err) = self.register_peer(addr) {
                warn!("invalid bootstrap address {addr}: {err}");
            }
        }
        Ok(())
    }

    /// Stops listening and closes every connection. The swarm cannot be restarted.
    pub fn stop(&self) {
        debug!("stopping swarm");
        self.inner.cancel.cancel();
        self.inner.listeners.lock().clear();
        self.inner.listen_addrs.write().clear();
        for conn in self.connections() {
            conn.close();
            self.remove_connection(&conn);
        }
    }

    /// Adds the peer of `addr`, which must end in `/p2p/<id>`, to the address book.
    pub fn register_peer(&self, addr: &Multiaddr) -> Result<PeerId> {
        let peer = PeerId::from_multiaddr(addr).ok_or_else(|| Error::MissingPeerId(addr.clone()))?;
        if peer == self.inner.local_peer {
            return Err(Error::DialSelf);
        }
        if self.inner.address_book.register(peer, Some(addr)) {
            self.emit(SwarmEvent::PeerDiscovered(peer));
        }
        Ok(peer)
    }

    fn transport_for(&self, addr: &Multiaddr) -> Result<&Arc<dyn Transport>> {
        self.inner
            .transports
            .iter()
            .find(|t| t.can_handle(addr))
            .ok_or_else(|| Error::UnsupportedAddress(addr.clone()))
    }

    /// Starts accepting connections on `addr`, returns the address actually bound.
    pub async fn start_listening(&self, addr: &Multiaddr) -> Result<Multiaddr> {
        if !self.is_running() {
            return Err(Error::NotRunning);
        }
        let transport = self.transport_for(addr)?.clone();
        let mut listener = transport.listen(addr).await?;
        let local = listener.local_addr();
        let cancel = self.inner.cancel.child_token();
        self.inner
            .listeners
            .lock()
            .insert(local.clone(), cancel.clone());
        self.inner.listen_addrs.write().push(local.clone());
        info!("listening on {local}");

        let swarm = self.clone();
        let span = info_span!("listener", addr = %local);
        let bound = local.clone();
        tokio::spawn(
            async move {
                loop {
                    let accepted = tokio::select! {
                        biased;
                        _ = cancel.cancelled() => break,
                        accepted = listener.accept() => accepted,
                    };
                    match accepted {
                        Ok((stream, remote)) => swarm.handle_inbound(stream, remote),
                        Err(err) => {
                            warn!("accept failed: {err}");
                            tokio::time::sleep(Duration::from_millis(100)).await;
                        }
                    }
                }
                swarm.inner.listen_addrs.write().retain(|a| a != &bound);
                debug!("listener stopped");
            }
            .instrument(span),
        );
        Ok(local)
    }

    /// Stops the listener bound to `addr`. Returns `false` if there was none.
    pub fn stop_listening(&self, addr: &Multiaddr) -> bool {
        match self.inner.listeners.lock().remove(addr) {
            Some(cancel) => {
                cancel.cancel();
                self.inner.listen_addrs.write().retain(|a| a != addr);
                true
            }
            None => false,
        }
    }

    fn handle_inbound(&self, stream: BoxedStream, remote: Multiaddr) {
        if !self.inner.policy.is_allowed(&remote) {
            debug!(%remote, "refusing connection from denied address");
            return;
        }
        let swarm = self.clone();
        let timeout = self.inner.config.dial_timeout();
        tokio::spawn(async move {
            let upgraded = tokio::time::timeout(
                timeout,
                swarm.upgrade(stream, remote.clone(), Role::Receiver),
            )
            .await
            .unwrap_or(Err(Error::Timeout));
            match upgraded {
                Ok((conn, true)) => {
                    swarm.emit(SwarmEvent::PeerConnected(*conn.remote_peer()));
                    if swarm.identify(&conn).await.is_err() {
                        swarm.close_connection(&conn);
                    }
                }
                Ok((_, false)) => {}
                Err(err) => debug!(%remote, "inbound upgrade failed: {err}"),
            }
        });
    }

    /// Connects to `addr`, reusing an existing connection to its peer.
    ///
    /// Concurrent calls for the same peer, or for the same address if it names no peer, share
    /// one dial. Dropping the returned future leaves the dial to the other callers, the last
    /// one leaving aborts it.
    #[tracing::instrument(skip_all, fields(%addr))]
    pub async fn connect(&self, addr: &Multiaddr) -> Result<Connection> {
        if !self.is_running() {
            return Err(Error::NotRunning);
        }
        if !self.inner.policy.is_allowed(addr) {
            return Err(Error::AddressDenied(addr.clone()));
        }
        let peer = PeerId::from_multiaddr(addr);
        if let Some(peer) = peer {
            if peer == self.inner.local_peer {
                return Err(Error::DialSelf);
            }
            if let Some(conn) = self.connection(&peer) {
                return Ok(conn);
            }
        }
        let key = match peer {
            Some(peer) => DialKey::Peer(peer),
            None => DialKey::Address(strip_peer_id(addr)),
        };

        let (tx, rx) = oneshot::channel();
        let waiter = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let start = {
            let mut pending = self.inner.pending.lock();
            match pending.entry(key.clone()) {
                Entry::Occupied(mut entry) => {
                    trace!("joining pending dial");
                    entry.get_mut().waiters.push((waiter, tx));
                    None
                }
                Entry::Vacant(entry) => {
                    let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
                    let cancel = self.inner.cancel.child_token();
                    entry.insert(PendingDial {
                        id,
                        waiters: vec![(waiter, tx)],
                        cancel: cancel.clone(),
                    });
                    Some((id, cancel))
                }
            }
        };
        let _guard = WaiterGuard {
            swarm: self,
            key: key.clone(),
            waiter,
        };
        if let Some((id, cancel)) = start {
            tokio::spawn(
                self.clone()
                    .dial_task(key, id, addr.clone(), cancel)
                    .in_current_span(),
            );
        }

        match rx.await {
            Ok(Ok(conn)) => Ok(conn),
            Ok(Err(source)) => Err(Error::Dial {
                addr: addr.clone(),
                source,
            }),
            Err(_) => Err(Error::Cancelled),
        }
    }

    async fn dial_task(self, key: DialKey, id: u64, addr: Multiaddr, cancel: CancellationToken) {
        let res = tokio::select! {
            _ = cancel.cancelled() => Err(Error::Cancelled),
            res = tokio::time::timeout(self.inner.config.dial_timeout(), self.dial(&addr)) => {
                res.unwrap_or(Err(Error::Timeout))
            }
        };
        if let Err(err) = &res {
            debug!("dial failed: {err}");
        }

        let waiters = {
            let mut pending = self.inner.pending.lock();
            match pending.get(&key) {
                Some(dial) if dial.id == id => pending
                    .remove(&key)
                    .map(|dial| dial.waiters)
                    .unwrap_or_default(),
                _ => Vec::new(),
            }
        };
        let res = res.map_err(Arc::new);
        for (_, waiter) in waiters {
            waiter.send(res.clone()).ok();
        }
    }

    async fn dial(&self, addr: &Multiaddr) -> Result<Connection> {
        let transport = self.transport_for(addr)?;
        trace!(transport = transport.name(), "dialing");
        let stream = transport.dial(addr).await?;
        let (conn, is_new) = self.upgrade(stream, addr.clone(), Role::Initiator).await?;
        if !is_new {
            return Ok(conn);
        }
        let peer = *conn.remote_peer();
        let pending = Unannounced {
            swarm: self,
            conn: conn.clone(),
            armed: true,
        };
        let identified = self.identify(&conn).await;
        if conn.is_closed() {
            // a simultaneous dial from the remote may have replaced it
            let current = self.connection(&peer).ok_or(Error::NotConnected(peer))?;
            pending.announce();
            return Ok(current);
        }
        identified?;
        pending.announce();
        Ok(conn)
    }

    /// Connects to any known address of `peer`.
    pub async fn connect_peer(&self, peer: &PeerId) -> Result<Connection> {
        if let Some(conn) = self.connection(peer) {
            return Ok(conn);
        }
        if *peer == self.inner.local_peer {
            return Err(Error::DialSelf);
        }
        let mut last_err = Error::NoAddresses(*peer);
        for addr in self.inner.address_book.addresses(peer) {
            match self.connect(&with_peer_id(&addr, peer)).await {
                Ok(conn) => return Ok(conn),
                Err(err) => {
                    debug!(%peer, %addr, "failed to connect: {err}");
                    last_err = err;
                }
            }
        }
        Err(last_err)
    }

    /// Closes the connection to the peer of `addr`, or to `addr` itself if it names no peer.
    pub async fn disconnect(&self, addr: &Multiaddr) -> Result<()> {
        let conn = match PeerId::from_multiaddr(addr) {
            Some(peer) => self.connection(&peer),
            None => {
                let target = strip_peer_id(addr);
                self.connections()
                    .into_iter()
                    .find(|conn| conn.remote_addr() == &target)
            }
        };
        let conn = conn.ok_or_else(|| Error::NoConnection(addr.clone()))?;
        self.close_connection(&conn);
        Ok(())
    }

    pub async fn disconnect_peer(&self, peer: &PeerId) -> Result<()> {
        let conn = self.connection(peer).ok_or(Error::NotConnected(*peer))?;
        self.close_connection(&conn);
        Ok(())
    }

    fn close_connection(&self, conn: &Connection) {
        conn.close();
        self.remove_connection(conn);
    }

    /// Opens a substream to `peer` speaking `protocol`, connecting first if needed.
    pub async fn open_stream(&self, peer: &PeerId, protocol: &str) -> Result<Substream> {
        let conn = self.connect_peer(peer).await?;
        conn.open_stream(protocol).await
    }

    /// Measures `count` round trips to `peer`.
    pub async fn ping(&self, peer: &PeerId, count: usize) -> Result<Vec<Duration>> {
        let conn = self.connect_peer(peer).await?;
        ping::ping(&conn, count).await
    }

    /// Secures and multiplexes a raw stream.
    ///
    /// Returns the connection and whether it is new, an existing connection to the same peer
    /// is kept over a new one.
    async fn upgrade(
        &self,
        mut stream: BoxedStream,
        remote_addr: Multiaddr,
        role: Role,
    ) -> Result<(Connection, bool)> {
        let expected = PeerId::from_multiaddr(&remote_addr);
        match role {
            Role::Initiator => multistream::select(&mut stream, secio::PROTOCOL_NAME).await?,
            Role::Receiver => {
                multistream::accept(&mut stream, |p| p == secio::PROTOCOL_NAME).await?;
            }
        }
        let (mut secure, remote_key) =
            secio::handshake(stream, &self.inner.keypair, &self.inner.secio).await?;
        let remote_peer = remote_key.to_peer_id();
        if let Some(expected) = expected {
            if expected != remote_peer {
                return Err(Error::PeerIdMismatch {
                    expected,
                    actual: remote_peer,
                });
            }
        }
        if remote_peer == self.inner.local_peer {
            return Err(Error::DialSelf);
        }
        match role {
            Role::Initiator => multistream::select(&mut secure, mplex::PROTOCOL_NAME).await?,
            Role::Receiver => {
                multistream::accept(&mut secure, |p| p == mplex::PROTOCOL_NAME).await?;
            }
        }

        let (reader, writer) = tokio::io::split(secure);
        let (muxer, incoming) = Multiplexer::new(writer, role);
        let conn = Connection::new(
            self.inner.next_id.fetch_add(1, Ordering::Relaxed),
            self.inner.local_peer,
            remote_key,
            strip_peer_id(&remote_addr),
            role == Role::Receiver,
            muxer.clone(),
        );

        let replaced = {
            let mut connections = self.inner.connections.write();
            let existing = connections
                .get(&remote_peer)
                .filter(|existing| !existing.is_closed())
                .cloned();
            match existing {
                Some(existing) if !self.survives(&conn, &existing) => {
                    debug!(peer = %remote_peer, "keeping existing connection");
                    conn.close();
                    return Ok((existing, false));
                }
                existing => {
                    connections.insert(remote_peer, conn.clone());
                    existing
                }
            }
        };
        if let Some(old) = &replaced {
            debug!(peer = %remote_peer, old = old.id(), "replacing connection");
            old.close();
        }

        let book = &self.inner.address_book;
        let dialable = (role == Role::Initiator).then_some(&remote_addr);
        let is_new = book.register(remote_peer, dialable);
        book.set_public_key(&remote_peer, remote_key);
        book.set_connected(&remote_peer, Some(remote_addr.clone()));
        if is_new {
            self.emit(SwarmEvent::PeerDiscovered(remote_peer));
        }
        debug!(peer = %remote_peer, addr = %remote_addr, ?role, "connection established");

        let span = info_span!("connection", peer = %remote_peer, id = conn.id());
        tokio::spawn(
            self.clone()
                .run_connection(conn.clone(), muxer, reader, incoming)
                .instrument(span),
        );
        Ok((conn, replaced.is_none()))
    }

    /// Whether `new` wins over `existing`, an open connection to the same peer.
    ///
    /// Both ends keep the connection dialed by the smaller peer id, so simultaneous dials
    /// settle on the same connection.
    fn survives(&self, new: &Connection, existing: &Connection) -> bool {
        let dialer = |conn: &Connection| {
            if conn.is_incoming() {
                *conn.remote_peer()
            } else {
                self.inner.local_peer
            }
        };
        dialer(new) < dialer(existing)
    }

    async fn run_connection(
        self,
        conn: Connection,
        muxer: Multiplexer,
        reader: ReadHalf<SecureStream<BoxedStream>>,
        incoming: mpsc::UnboundedReceiver<Substream>,
    ) {
        let dispatcher = tokio::spawn(
            self.clone()
                .dispatch_substreams(conn.clone(), incoming)
                .in_current_span(),
        );
        if let Err(err) = muxer.process_requests(reader).await {
            debug!("connection failed: {err}");
        }
        dispatcher.await.ok();
        self.remove_connection(&conn);
    }

    async fn dispatch_substreams(
        self,
        conn: Connection,
        mut incoming: mpsc::UnboundedReceiver<Substream>,
    ) {
        while let Some(mut stream) = incoming.recv().await {
            let protocols = self.inner.protocols.clone();
            let conn = conn.clone();
            let timeout = self.inner.config.handshake_timeout();
            let span = debug_span!("substream", id = stream.id());
            tokio::spawn(
                async move {
                    let negotiated =
                        tokio::time::timeout(timeout, protocols.negotiate(&mut stream)).await;
                    let (protocol, handler) = match negotiated {
                        Ok(Ok(res)) => res,
                        Ok(Err(err)) => {
                            debug!("negotiation failed: {err}");
                            return;
                        }
                        Err(_) => {
                            debug!("negotiation timed out");
                            return;
                        }
                    };
                    trace!(%protocol, "dispatching");
                    if let Err(err) = handler.handle(conn, stream).await {
                        debug!(%protocol, "handler failed: {err:#}");
                    }
                }
                .instrument(span),
            );
        }
    }

    /// Closes a connection that was never announced, without firing events.
    fn discard_connection(&self, conn: &Connection) {
        let peer = *conn.remote_peer();
        let removed = {
            let mut connections = self.inner.connections.write();
            match connections.get(&peer) {
                Some(current) if current.id() == conn.id() => connections.remove(&peer).is_some(),
                _ => false,
            }
        };
        if removed {
            self.inner.address_book.set_connected(&peer, None);
        }
        conn.close();
    }

    /// Drops `conn` from the tables, firing `PeerDisconnected` if it was the current one.
    fn remove_connection(&self, conn: &Connection) {
        let peer = *conn.remote_peer();
        let removed = {
            let mut connections = self.inner.connections.write();
            match connections.get(&peer) {
                Some(current) if current.id() == conn.id() => connections.remove(&peer).is_some(),
                _ => false,
            }
        };
        if removed {
            self.inner.address_book.set_connected(&peer, None);
            debug!(%peer, "disconnected");
            self.emit(SwarmEvent::PeerDisconnected(peer));
        }
    }

    /// Runs identify on `conn` and records what the remote announced.
    ///
    /// Fails only if the remote announced a different key than it authenticated with, the
    /// caller drops the connection then.
    async fn identify(&self, conn: &Connection) -> Result<()> {
        match identify::request(conn).await {
            Ok(info) => {
                self.inner.address_book.update(conn.remote_peer(), |peer| {
                    peer.agent_version = Some(info.agent_version);
                    peer.protocol_version = Some(info.protocol_version);
                    peer.protocols = info.protocols;
                    for addr in info.listen_addrs.iter().filter(|a| is_dialable(a)) {
                        peer.add_address(addr);
                    }
                });
                Ok(())
            }
            Err(err @ Error::Identify(_)) => {
                warn!(peer = %conn.remote_peer(), "{err}");
                Err(err)
            }
            Err(err) => {
                debug!(peer = %conn.remote_peer(), "identify unavailable: {err}");
                Ok(())
            }
        }
    }
}

/// Wildcard listen addresses are useless to others.
fn is_dialable(addr: &Multiaddr) -> bool {
    match addr.iter().next() {
        Some(Protocol::Ip4(ip)) => !ip.is_unspecified(),
        Some(Protocol::Ip6(ip)) => !ip.is_unspecified(),
        Some(_) => true,
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use tracing_test::traced_test;

    use super::*;

    fn test_swarm() -> Swarm {
        let config = SwarmConfig {
            auto_dial: false,
            ..Default::default()
        };
        Swarm::builder(Keypair::generate()).config(config).build()
    }

    async fn listening_swarm() -> (Swarm, Multiaddr) {
        let swarm = test_swarm();
        let addr = swarm
            .start_listening(&"/ip4/127.0.0.1/tcp/0".parse().unwrap())
            .await
            .unwrap();
        let addr = with_peer_id(&addr, &swarm.local_peer_id());
        (swarm, addr)
    }

    #[tokio::test]
    async fn test_denied_address_fails_fast() {
        let config = SwarmConfig {
            deny: vec!["/ip4/127.0.0.1".parse().unwrap()],
            auto_dial: false,
            ..Default::default()
        };
        let swarm = Swarm::builder(Keypair::generate()).config(config).build();
        let err = swarm
            .connect(&"/ip4/127.0.0.1/tcp/1".parse().unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AddressDenied(_)));
        assert_eq!(err.kind(), crate::error::ErrorKind::Policy);
        assert_eq!(swarm.num_pending_dials(), 0);
    }

    #[tokio::test]
    async fn test_dial_self() {
        let (swarm, addr) = listening_swarm().await;
        assert!(matches!(
            swarm.connect(&addr).await,
            Err(Error::DialSelf)
        ));
    }

    #[tokio::test]
    async fn test_register_peer_fires_discovered_once() {
        let swarm = test_swarm();
        let mut events = swarm.subscribe();
        let other = Keypair::generate().peer_id();
        let addr = with_peer_id(&"/ip4/10.0.0.1/tcp/4001".parse().unwrap(), &other);

        assert_eq!(swarm.register_peer(&addr).unwrap(), other);
        swarm.register_peer(&addr).unwrap();
        assert_eq!(events.recv().await.unwrap(), SwarmEvent::PeerDiscovered(other));
        assert!(events.try_recv().is_err());

        let bare: Multiaddr = "/ip4/10.0.0.1/tcp/4001".parse().unwrap();
        assert!(matches!(
            swarm.register_peer(&bare),
            Err(Error::MissingPeerId(_))
        ));
    }

    #[tokio::test]
    #[traced_test]
    async fn test_connect_identify_ping_disconnect() {
        let (a, _) = listening_swarm().await;
        let (b, b_addr) = listening_swarm().await;
        let mut a_events = a.subscribe();

        let conn = a.connect(&b_addr).await.unwrap();
        assert_eq!(*conn.remote_peer(), b.local_peer_id());
        assert!(!conn.is_incoming());
        assert!(a.is_connected(&b.local_peer_id()));

        // identify taught us who b is
        let peer = a.address_book().get(&b.local_peer_id()).unwrap();
        assert!(peer
            .protocols
            .iter()
            .any(|p| p == identify::PROTOCOL_NAME));
        assert!(peer
            .agent_version
            .as_deref()
            .unwrap()
            .starts_with("iroh-swarm/"));
        assert_eq!(peer.public_key(), Some(&b.keypair().public()));

        // connecting again reuses the connection
        let again = a.connect(&b_addr).await.unwrap();
        assert_eq!(again, conn);

        let rtts = a.ping(&b.local_peer_id(), 3).await.unwrap();
        assert_eq!(rtts.len(), 3);

        a.disconnect(&b_addr).await.unwrap();
        assert!(!a.is_connected(&b.local_peer_id()));
        let mut saw_disconnect = false;
        while let Ok(event) = a_events.try_recv() {
            if event == SwarmEvent::PeerDisconnected(b.local_peer_id()) {
                saw_disconnect = true;
            }
        }
        assert!(saw_disconnect);
    }

    /// A peer that secures and multiplexes one inbound connection, then never answers any
    /// substream.
    async fn silent_peer() -> Multiaddr {
        let keypair = Keypair::generate();
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = transport::socket_addr_to_multiaddr(listener.local_addr().unwrap());
        let addr = with_peer_id(&addr, &keypair.peer_id());
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut stream: BoxedStream = Box::new(stream);
            multistream::accept(&mut stream, |p| p == secio::PROTOCOL_NAME)
                .await
                .unwrap();
            let (mut secure, _) = secio::handshake(stream, &keypair, &secio::Config::default())
                .await
                .unwrap();
            multistream::accept(&mut secure, |p| p == mplex::PROTOCOL_NAME)
                .await
                .unwrap();
            let (reader, writer) = tokio::io::split(secure);
            let (muxer, mut incoming) = Multiplexer::new(writer, Role::Receiver);
            let hold = tokio::spawn(async move {
                let mut held = Vec::new();
                while let Some(stream) = incoming.recv().await {
                    held.push(stream);
                }
            });
            muxer.process_requests(reader).await.ok();
            hold.abort();
        });
        addr
    }

    #[tokio::test]
    async fn test_dial_timing_out_in_identify_drops_connection() {
        let config = SwarmConfig {
            auto_dial: false,
            dial_timeout: 1,
            ..Default::default()
        };
        let swarm = Swarm::builder(Keypair::generate()).config(config).build();
        let mut events = swarm.subscribe();
        let addr = silent_peer().await;
        let peer = PeerId::from_multiaddr(&addr).unwrap();

        let err = swarm.connect(&addr).await.unwrap_err();
        assert!(matches!(
            err,
            Error::Dial { ref source, .. } if matches!(**source, Error::Timeout)
        ));
        assert!(!swarm.is_connected(&peer));
        assert_eq!(swarm.num_connections(), 0);
        assert!(swarm
            .address_book()
            .get(&peer)
            .unwrap()
            .connected_address()
            .is_none());

        while let Ok(event) = events.try_recv() {
            assert!(
                !matches!(
                    event,
                    SwarmEvent::PeerConnected(_) | SwarmEvent::PeerDisconnected(_)
                ),
                "unexpected {event:?}"
            );
        }
    }

    #[tokio::test]
    async fn test_simultaneous_dials_settle_on_one_connection() {
        let (a, a_addr) = listening_swarm().await;
        let (b, b_addr) = listening_swarm().await;
        let (a_id, b_id) = (a.local_peer_id(), b.local_peer_id());
        for _ in 0..10 {
            let (ra, rb) = tokio::join!(a.connect(&b_addr), b.connect(&a_addr));
            ra.unwrap();
            rb.unwrap();
            tokio::time::sleep(Duration::from_millis(100)).await;
            let a_conn = a.connection(&b_id).expect("a keeps a connection to b");
            let b_conn = b.connection(&a_id).expect("b keeps a connection to a");
            // both ends agree on who dialed the survivor
            assert_ne!(a_conn.is_incoming(), b_conn.is_incoming());
            assert_eq!(a_conn.is_incoming(), b_id < a_id);

            a.disconnect_peer(&b_id).await.unwrap();
            tokio::time::timeout(Duration::from_secs(5), async {
                while b.is_connected(&a_id) {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            })
            .await
            .expect("b notices the disconnect");
        }
    }

    #[tokio::test]
    async fn test_peer_id_mismatch() {
        let a = test_swarm();
        let (_b, b_addr) = listening_swarm().await;
        let wrong = with_peer_id(&strip_peer_id(&b_addr), &Keypair::generate().peer_id());
        let err = a.connect(&wrong).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Protocol);
    }

    #[tokio::test]
    async fn test_stop_listening() {
        let (swarm, addr) = listening_swarm().await;
        let bound = strip_peer_id(&addr);
        assert_eq!(swarm.listen_addrs(), vec![bound.clone()]);
        assert!(swarm.stop_listening(&bound));
        assert!(!swarm.stop_listening(&bound));
        assert!(swarm.listen_addrs().is_empty());
    }

    #[test]
    fn test_is_dialable() {
        assert!(!is_dialable(&"/ip4/0.0.0.0/tcp/1".parse().unwrap()));
        assert!(is_dialable(&"/ip4/127.0.0.1/tcp/1".parse().unwrap()));
        assert!(is_dialable(&"/dns4/example.com/tcp/1".parse().unwrap()));
    }
}
