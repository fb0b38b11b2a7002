use std::fmt;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{ready, Context, Poll};

use bytes::{Buf, Bytes};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::PollSender;
use tracing::{trace, warn};

use super::codec::{Flag, Frame, MAX_FRAME_SIZE};

/// State shared between a substream and the read loop of its multiplexer.
#[derive(Debug, Default)]
pub(super) struct Shared {
    pub(super) reset: AtomicBool,
}

/// A logical duplex channel inside a multiplexed connection.
///
/// Reading returns EOF once the remote closed its side or the connection went away.
/// [`AsyncWriteExt::shutdown`](tokio::io::AsyncWriteExt::shutdown) closes our side.
pub struct Substream {
    id: u64,
    name: String,
    opened_locally: bool,
    inbound: mpsc::UnboundedReceiver<Bytes>,
    read_buf: Bytes,
    outbound: PollSender<Frame>,
    shared: Arc<Shared>,
    local_closed: bool,
}

impl fmt::Debug for Substream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Substream")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("opened_locally", &self.opened_locally)
            .field("local_closed", &self.local_closed)
            .finish_non_exhaustive()
    }
}

impl Substream {
    pub(super) fn new(
        id: u64,
        name: String,
        opened_locally: bool,
        inbound: mpsc::UnboundedReceiver<Bytes>,
        outbound: mpsc::Sender<Frame>,
        shared: Arc<Shared>,
    ) -> Self {
        Substream {
            id,
            name,
            opened_locally,
            inbound,
            read_buf: Bytes::new(),
            outbound: PollSender::new(outbound),
            shared,
            local_closed: false,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether this side created the substream.
    pub fn is_initiator(&self) -> bool {
        self.opened_locally
    }

    /// Aborts the substream in both directions.
    pub async fn reset(mut self) -> io::Result<()> {
        self.local_closed = true;
        let frame = Frame::new(self.id, Flag::reset(self.opened_locally), Bytes::new());
        match self.outbound.get_ref() {
            Some(sender) => sender
                .send(frame)
                .await
                .map_err(|_| io::Error::from(io::ErrorKind::BrokenPipe)),
            None => Err(io::ErrorKind::BrokenPipe.into()),
        }
    }

    fn check_writable(&self) -> io::Result<()> {
        if self.shared.reset.load(Ordering::Relaxed) {
            return Err(io::ErrorKind::ConnectionReset.into());
        }
        if self.local_closed {
            return Err(io::ErrorKind::BrokenPipe.into());
        }
        Ok(())
    }

    fn poll_send(&mut self, cx: &mut Context<'_>, frame: Frame) -> Poll<io::Result<()>> {
        let broken = |_| io::Error::from(io::ErrorKind::BrokenPipe);
        ready!(self.outbound.poll_reserve(cx)).map_err(broken)?;
        self.outbound.send_item(frame).map_err(broken)?;
        Poll::Ready(Ok(()))
    }
}

impl AsyncRead for Substream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        loop {
            if !this.read_buf.is_empty() {
                let n = this.read_buf.len().min(buf.remaining());
                buf.put_slice(&this.read_buf[..n]);
                this.read_buf.advance(n);
                return Poll::Ready(Ok(()));
            }
            match ready!(this.inbound.poll_recv(cx)) {
                Some(data) => this.read_buf = data,
                None if this.shared.reset.load(Ordering::Relaxed) => {
                    return Poll::Ready(Err(io::ErrorKind::ConnectionReset.into()))
                }
                None => return Poll::Ready(Ok(())),
            }
        }
    }
}

impl AsyncWrite for Substream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        this.check_writable()?;
        let n = buf.len().min(MAX_FRAME_SIZE);
        let frame = Frame::new(
            this.id,
            Flag::message(this.opened_locally),
            Bytes::copy_from_slice(&buf[..n]),
        );
        ready!(this.poll_send(cx, frame))?;
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        // frames are handed to the connection writer as soon as they are written
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.local_closed {
            return Poll::Ready(Ok(()));
        }
        let frame = Frame::new(this.id, Flag::close(this.opened_locally), Bytes::new());
        ready!(this.poll_send(cx, frame))?;
        this.local_closed = true;
        Poll::Ready(Ok(()))
    }
}

impl Drop for Substream {
    fn drop(&mut self) {
        if self.local_closed {
            return;
        }
        let Some(sender) = self.outbound.get_ref() else {
            return;
        };
        let id = self.id;
        let frame = Frame::new(id, Flag::close(self.opened_locally), Bytes::new());
        match sender.try_send(frame) {
            Ok(()) => {}
            Err(TrySendError::Full(frame)) => match Handle::try_current() {
                Ok(handle) => {
                    let sender = sender.clone();
                    handle.spawn(async move {
                        if sender.send(frame).await.is_err() {
                            trace!(id, "connection went away before close was sent");
                        }
                    });
                }
                Err(_) => warn!(id, "outbound queue full, close frame dropped"),
            },
            Err(TrySendError::Closed(_)) => trace!(id, "connection closed, no close frame sent"),
        }
    }
}
