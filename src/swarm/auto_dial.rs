use rand::seq::SliceRandom;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use super::{Swarm, SwarmEvent};
use crate::peer::PeerId;

/// Keeps the number of connections between the configured bounds by reacting to swarm events.
///
/// Dial failures are logged and never leave the event loop.
pub(crate) struct AutoDialer {
    swarm: Swarm,
    min_connections: usize,
    max_connections: Option<usize>,
}

impl AutoDialer {
    pub(crate) fn spawn(swarm: Swarm) -> JoinHandle<()> {
        let config = swarm.config();
        let dialer = AutoDialer {
            min_connections: config.min_connections,
            max_connections: config.max_connections,
            swarm,
        };
        // subscribe before returning so no event fired after `spawn` is missed
        let events = dialer.swarm.subscribe();
        tokio::spawn(dialer.run(events))
    }

    async fn run(self, mut events: broadcast::Receiver<SwarmEvent>) {
        let cancel = self.swarm.cancel_token();
        loop {
            let event = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                event = events.recv() => event,
            };
            match event {
                Ok(SwarmEvent::PeerDiscovered(peer)) => self.on_discovered(peer),
                Ok(SwarmEvent::PeerDisconnected(peer)) => self.on_disconnected(peer),
                Ok(SwarmEvent::PeerConnected(_)) => {}
                Err(RecvError::Lagged(n)) => debug!("auto dialer missed {n} events"),
                Err(RecvError::Closed) => break,
            }
        }
        trace!("auto dialer stopped");
    }

    /// Whether another dial keeps us within the bounds.
    fn wants_more(&self) -> bool {
        let active = self.swarm.num_connections() + self.swarm.num_pending_dials();
        active < self.min_connections && self.max_connections.map_or(true, |max| active < max)
    }

    fn is_candidate(&self, peer: &PeerId) -> bool {
        *peer != self.swarm.local_peer_id()
            && !self.swarm.is_connected(peer)
            && !self.swarm.is_dialing(peer)
            && self
                .swarm
                .address_book()
                .addresses(peer)
                .iter()
                .any(|addr| self.swarm.policy().is_allowed(addr))
    }

    fn on_discovered(&self, peer: PeerId) {
        if self.wants_more() && self.is_candidate(&peer) {
            self.dial(peer);
        }
    }

    fn on_disconnected(&self, peer: PeerId) {
        if !self.wants_more() {
            return;
        }
        let candidates: Vec<PeerId> = self
            .swarm
            .address_book()
            .snapshot()
            .into_iter()
            .map(|p| *p.id())
            .filter(|id| *id != peer && self.is_candidate(id))
            .collect();
        match candidates.choose(&mut rand::thread_rng()) {
            Some(candidate) => self.dial(*candidate),
            None => trace!("no peer left to replace {peer}"),
        }
    }

    fn dial(&self, peer: PeerId) {
        let swarm = self.swarm.clone();
        tokio::spawn(async move {
            debug!(%peer, "auto dialing");
            if let Err(err) = swarm.connect_peer(&peer).await {
                warn!(%peer, "auto dial failed: {err}");
            }
        });
    }
}
