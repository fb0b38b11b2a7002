//! The `/ipfs/ping/1.0.0` protocol: 32 random bytes echoed back.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use rand::RngCore;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::trace;

use super::Connection;
use crate::error::{Error, Result};
use crate::mplex::Substream;
use crate::multistream::ProtocolHandler;

pub const PROTOCOL_NAME: &str = "/ipfs/ping/1.0.0";

const PING_SIZE: usize = 32;

#[derive(Debug, Default)]
pub(crate) struct PingHandler;

#[async_trait]
impl ProtocolHandler for PingHandler {
    async fn handle(&self, connection: Connection, mut stream: Substream) -> anyhow::Result<()> {
        let mut buf = [0u8; PING_SIZE];
        loop {
            match stream.read_exact(&mut buf).await {
                Ok(_) => {}
                Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => break,
                Err(err) => return Err(err.into()),
            }
            stream.write_all(&buf).await?;
            stream.flush().await?;
        }
        trace!(peer = %connection.remote_peer(), "ping stream done");
        stream.shutdown().await?;
        Ok(())
    }
}

/// Pings the remote of `connection` `count` times, returning the round trip times.
pub async fn ping(connection: &Connection, count: usize) -> Result<Vec<Duration>> {
    let mut stream = connection.open_stream(PROTOCOL_NAME).await?;
    let mut rtts = Vec::with_capacity(count);
    let mut payload = [0u8; PING_SIZE];
    let mut echo = [0u8; PING_SIZE];
    for _ in 0..count {
        rand::thread_rng().fill_bytes(&mut payload);
        let start = Instant::now();
        stream.write_all(&payload).await?;
        stream.flush().await?;
        stream.read_exact(&mut echo).await?;
        if echo != payload {
            return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "ping payload mismatch",
            )));
        }
        rtts.push(start.elapsed());
    }
    stream.shutdown().await?;
    Ok(rtts)
}
