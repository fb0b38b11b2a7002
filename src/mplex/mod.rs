//! The `/mplex/6.7.0` stream multiplexer.
//!
//! A [`Multiplexer`] owns one writer task that is the only code touching the outbound half of
//! the connection, substreams queue whole frames to it. The read loop in
//! [`Multiplexer::process_requests`] dispatches inbound frames to per-substream queues without
//! ever waiting on a consumer.

mod codec;
mod substream;

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use ahash::AHashMap;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

pub use self::codec::{Flag, Frame, MplexCodec, MAX_FRAME_SIZE};
pub use self::substream::Substream;
use self::substream::Shared;

/// Protocol name negotiated on the secure channel before the multiplexer takes over.
pub const PROTOCOL_NAME: &str = "/mplex/6.7.0";

/// First substream id used by the side that dialed the connection.
pub const INITIATOR_ORIGIN: u64 = 1000;
/// First substream id used by the side that accepted the connection.
pub const RECEIVER_ORIGIN: u64 = 1001;

/// Capacity of the queue of frames waiting for the writer task.
const OUTBOUND_QUEUE: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum MplexError {
    #[error("substream {0} was created twice")]
    DuplicateStream(u64),
    #[error("multiplexer is closed")]
    Closed,
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

/// Which side of the connection we are, decides the parity of the ids we hand out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Receiver,
}

impl Role {
    pub fn origin(&self) -> u64 {
        match self {
            Role::Initiator => INITIATOR_ORIGIN,
            Role::Receiver => RECEIVER_ORIGIN,
        }
    }
}

struct Slot {
    inbound: mpsc::UnboundedSender<Bytes>,
    shared: Arc<Shared>,
}

#[derive(Default)]
struct Substreams {
    open: AHashMap<u64, Slot>,
    /// Highest id created so far for each parity. Ids only grow, so any id at or below the
    /// mark was used before.
    highest: [Option<u64>; 2],
}

impl Substreams {
    fn is_used(&self, id: u64) -> bool {
        self.open.contains_key(&id) || self.highest[parity(id)].map_or(false, |high| id <= high)
    }

    fn insert(&mut self, id: u64, slot: Slot) {
        self.open.insert(id, slot);
        let high = &mut self.highest[parity(id)];
        *high = Some(high.map_or(id, |high| high.max(id)));
    }

    fn retire(&mut self, id: u64) -> Option<Slot> {
        self.open.remove(&id)
    }
}

fn parity(id: u64) -> usize {
    (id % 2) as usize
}

struct Inner {
    role: Role,
    next_id: AtomicU64,
    substreams: Mutex<Substreams>,
    outbound: mpsc::Sender<Frame>,
    /// Taken on close so the consumer of incoming substreams sees the end.
    incoming: Mutex<Option<mpsc::UnboundedSender<Substream>>>,
    closed: CancellationToken,
}

/// Multiplexes substreams over one duplex connection.
#[derive(Clone)]
pub struct Multiplexer {
    inner: Arc<Inner>,
}

impl fmt::Debug for Multiplexer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Multiplexer")
            .field("role", &self.inner.role)
            .field("open", &self.inner.substreams.lock().open.len())
            .field("closed", &self.inner.closed.is_cancelled())
            .finish()
    }
}

impl Multiplexer {
    /// Creates a multiplexer writing to `writer`.
    ///
    /// Spawns the writer task. Substreams opened by the remote are delivered on the returned
    /// receiver once [`Multiplexer::process_requests`] runs.
    pub fn new<W>(writer: W, role: Role) -> (Self, mpsc::UnboundedReceiver<Substream>)
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let (outbound, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE);
        let (incoming, incoming_rx) = mpsc::unbounded_channel();
        let closed = CancellationToken::new();
        tokio::spawn(write_loop(writer, outbound_rx, closed.clone()));

        let inner = Inner {
            role,
            next_id: AtomicU64::new(role.origin()),
            substreams: Mutex::new(Substreams::default()),
            outbound,
            incoming: Mutex::new(Some(incoming)),
            closed,
        };
        (
            Multiplexer {
                inner: Arc::new(inner),
            },
            incoming_rx,
        )
    }

    pub fn role(&self) -> Role {
        self.inner.role
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.is_cancelled()
    }

    /// Resolves once the multiplexer is closed.
    pub async fn closed(&self) {
        self.inner.closed.cancelled().await
    }

    pub fn num_substreams(&self) -> usize {
        self.inner.substreams.lock().open.len()
    }

    /// Opens a new substream named `name`.
    pub async fn create_stream(&self, name: &str) -> Result<Substream, MplexError> {
        if self.is_closed() {
            return Err(MplexError::Closed);
        }
        let permit = self
            .inner
            .outbound
            .reserve()
            .await
            .map_err(|_| MplexError::Closed)?;
        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared::default());
        // ids must reach the wire in the order they are handed out
        let id = {
            let mut substreams = self.inner.substreams.lock();
            let id = self.inner.next_id.fetch_add(2, Ordering::Relaxed);
            if substreams.is_used(id) {
                return Err(MplexError::DuplicateStream(id));
            }
            substreams.insert(
                id,
                Slot {
                    inbound: tx,
                    shared: shared.clone(),
                },
            );
            permit.send(Frame::new(
                id,
                Flag::NewStream,
                Bytes::copy_from_slice(name.as_bytes()),
            ));
            id
        };
        trace!(id, name, "created substream");
        Ok(Substream::new(
            id,
            name.to_string(),
            true,
            rx,
            self.inner.outbound.clone(),
            shared,
        ))
    }

    /// Runs the read loop until the connection ends, then closes the multiplexer.
    ///
    /// A duplicated substream id is fatal to the whole connection.
    pub async fn process_requests<R>(&self, reader: R) -> Result<(), MplexError>
    where
        R: AsyncRead + Unpin,
    {
        let mut frames = FramedRead::new(reader, MplexCodec);
        let res = loop {
            let frame = tokio::select! {
                biased;
                _ = self.inner.closed.cancelled() => break Ok(()),
                frame = frames.next() => frame,
            };
            match frame {
                Some(Ok(frame)) => {
                    if let Err(err) = self.handle_frame(frame) {
                        break Err(err);
                    }
                }
                Some(Err(err)) => break Err(err.into()),
                None => break Ok(()),
            }
        };
        if let Err(err) = &res {
            warn!("closing multiplexer: {err}");
        } else {
            debug!("multiplexer read loop finished");
        }
        self.close();
        res
    }

    fn handle_frame(&self, frame: Frame) -> Result<(), MplexError> {
        let Frame { id, flag, payload } = frame;
        match flag {
            Flag::NewStream => {
                let (tx, rx) = mpsc::unbounded_channel();
                let shared = Arc::new(Shared::default());
                {
                    let mut substreams = self.inner.substreams.lock();
                    if substreams.is_used(id) {
                        return Err(MplexError::DuplicateStream(id));
                    }
                    substreams.insert(
                        id,
                        Slot {
                            inbound: tx,
                            shared: shared.clone(),
                        },
                    );
                }
                let name = String::from_utf8_lossy(&payload).into_owned();
                trace!(id, %name, "remote opened substream");
                let substream = Substream::new(
                    id,
                    name,
                    false,
                    rx,
                    self.inner.outbound.clone(),
                    shared,
                );
                let incoming = self.inner.incoming.lock();
                let delivered = incoming
                    .as_ref()
                    .map(|tx| tx.send(substream).is_ok())
                    .unwrap_or(false);
                if !delivered {
                    debug!(id, "nobody accepts incoming substreams");
                }
            }
            Flag::MessageInitiator | Flag::MessageReceiver => {
                let substreams = self.inner.substreams.lock();
                match substreams.open.get(&id) {
                    Some(slot) => {
                        // the reader may be gone, data for it is dropped
                        slot.inbound.send(payload).ok();
                    }
                    None => trace!(id, "data for unknown substream"),
                }
            }
            Flag::CloseInitiator | Flag::CloseReceiver => {
                if self.inner.substreams.lock().retire(id).is_none() {
                    trace!(id, "close for unknown substream");
                }
            }
            Flag::ResetInitiator | Flag::ResetReceiver => {
                match self.inner.substreams.lock().retire(id) {
                    Some(slot) => slot.shared.reset.store(true, Ordering::Relaxed),
                    None => trace!(id, "reset for unknown substream"),
                }
            }
        }
        Ok(())
    }

    /// Closes the connection, forcing every substream closed.
    pub fn close(&self) {
        self.inner.closed.cancel();
        self.inner.incoming.lock().take();
        let mut substreams = self.inner.substreams.lock();
        let ids: Vec<u64> = substreams.open.keys().copied().collect();
        for id in ids {
            substreams.retire(id);
        }
    }
}

async fn write_loop<W>(writer: W, mut frames: mpsc::Receiver<Frame>, closed: CancellationToken)
where
    W: AsyncWrite + Unpin,
{
    let mut sink = FramedWrite::new(writer, MplexCodec);
    loop {
        let frame = tokio::select! {
            biased;
            _ = closed.cancelled() => break,
            frame = frames.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };
        if let Err(err) = sink.feed(frame).await {
            debug!("multiplexer write failed: {err}");
            break;
        }
        // batch whatever else is queued into one flush
        let mut failed = false;
        while let Ok(frame) = frames.try_recv() {
            if let Err(err) = sink.feed(frame).await {
                debug!("multiplexer write failed: {err}");
                failed = true;
                break;
            }
        }
        if failed {
            break;
        }
        if let Err(err) = sink.flush().await {
            debug!("multiplexer flush failed: {err}");
            break;
        }
    }
    closed.cancel();
    sink.close().await.ok();
}
