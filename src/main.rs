use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use bytes::Bytes;
use cid::Cid;
use clap::Parser;
use multiaddr::Multiaddr;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use iroh_swarm::bitswap::{Bitswap, BlockStore, MemoryBlockStore, PutOptions};
use iroh_swarm::config::Config;
use iroh_swarm::peer::with_peer_id;
use iroh_swarm::routing::RoutingTable;
use iroh_swarm::swarm::{Swarm, SwarmEvent};
use iroh_swarm::{keys, logging, PeerId};

#[derive(Parser, Debug, Clone)]
#[clap(version, about = "Exchange blocks with other peers.", long_about = None)]
struct Cli {
    /// Config file to use instead of the one in the config directory.
    #[clap(long)]
    config: Option<PathBuf>,
    /// Additional addresses to listen on.
    #[clap(long)]
    listen: Vec<Multiaddr>,
    /// Peers to connect to once started.
    #[clap(long)]
    connect: Vec<Multiaddr>,
    /// Files to add as raw blocks.
    #[clap(long)]
    add: Vec<PathBuf>,
    /// Blocks to fetch from the network.
    #[clap(long)]
    want: Vec<Cid>,
}

fn main() -> Result<()> {
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    rt.block_on(main_impl())?;
    // give the runtime some time to finish, but do not wait indefinitely.
    rt.shutdown_timeout(Duration::from_millis(500));
    Ok(())
}

async fn main_impl() -> Result<()> {
    let cli = Cli::parse();
    let mut config = Config::load(cli.config.as_deref()).await?;
    logging::init(config.rust_log.as_deref())?;
    config.swarm.listen_addrs.extend(cli.listen);
    if config.swarm.listen_addrs.is_empty() {
        config.swarm.listen_addrs.push("/ip4/0.0.0.0/tcp/0".parse()?);
    }

    let keypair = keys::load_or_create(&config.key_file()?).await?;
    let store = MemoryBlockStore::new();
    let bitswap = Bitswap::new(Arc::new(store.clone()), config.bitswap.clone());
    let swarm = bitswap
        .register(Swarm::builder(keypair).config(config.swarm.clone()))
        .build();
    bitswap.start(swarm.clone())?;
    swarm.start().await?;
    let local = swarm.local_peer_id();
    for addr in swarm.listen_addrs() {
        println!("listening on {}", with_peer_id(&addr, &local));
    }
    tokio::spawn(track_peers(swarm.clone()));

    for path in &cli.add {
        let data = tokio::fs::read(path)
            .await
            .with_context(|| format!("failed to read {}", path.display()))?;
        let options = PutOptions {
            pin: true,
            ..Default::default()
        };
        let cid = store.put(data.into(), options).await?;
        println!("added {}: {}", path.display(), cid);
    }

    for addr in &cli.connect {
        match swarm.connect(addr).await {
            Ok(conn) => println!("connected to {}", conn.remote_peer()),
            Err(err) => warn!("failed to connect to {addr}: {err}"),
        }
    }

    let cancel = CancellationToken::new();
    for cid in cli.want {
        let bitswap = bitswap.clone();
        let cancel = cancel.child_token();
        tokio::spawn(async move {
            match fetch(&bitswap, cid, local, cancel).await {
                Ok(data) => println!("{cid}: {} bytes", data.len()),
                Err(err) => warn!("failed to fetch {cid}: {err:#}"),
            }
        });
    }

    tokio::signal::ctrl_c().await?;
    println!("shutting down");
    cancel.cancel();
    bitswap.stop();
    swarm.stop();
    Ok(())
}

/// Reads `cid` from the local store, asking the network only if it is not there.
async fn fetch(
    bitswap: &Bitswap,
    cid: Cid,
    local: PeerId,
    cancel: CancellationToken,
) -> Result<Bytes> {
    let store = bitswap.store();
    if store.stat(&cid).await?.is_some() {
        if let Some(data) = store.get(&cid).await? {
            debug!(%cid, "found locally");
            return Ok(data);
        }
    }
    let block = bitswap.want_block(cid, local, cancel).await?;
    Ok(block.data().clone())
}

/// Keeps a routing table of the connected peers.
async fn track_peers(swarm: Swarm) {
    let mut table = RoutingTable::new(&swarm.local_peer_id());
    let mut events = swarm.subscribe();
    loop {
        match events.recv().await {
            Ok(SwarmEvent::PeerConnected(peer)) => {
                if let Some(evicted) = table.add(peer) {
                    debug!(%evicted, "evicted from routing table");
                }
            }
            Ok(SwarmEvent::PeerDisconnected(peer)) => {
                table.remove(&peer);
            }
            Ok(SwarmEvent::PeerDiscovered(_)) => continue,
            Err(RecvError::Lagged(_)) => continue,
            Err(RecvError::Closed) => break,
        }
        info!("{} peers in routing table", table.len());
    }
}

#[cfg(test)]
mod tests {
    use iroh_swarm::config::BitswapConfig;

    use super::*;

    #[tokio::test]
    async fn test_fetch_prefers_local_blocks() {
        let store = MemoryBlockStore::new();
        let bitswap = Bitswap::new(Arc::new(store.clone()), BitswapConfig::default());
        let cid = store
            .put(Bytes::from_static(b"local"), PutOptions::default())
            .await
            .unwrap();

        let cancel = CancellationToken::new();
        let data = fetch(&bitswap, cid, PeerId::random(), cancel).await.unwrap();
        assert_eq!(&data[..], b"local");
        assert!(bitswap.want_list().is_empty());
    }
}
