use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_util::codec::{Decoder, Encoder, Framed};

use super::cipher::{Cipher, CipherState, Digest, StretchedKey};
use super::HandshakeError;
use crate::protocol::invalid_data;

/// Size of the big endian length prefix of every packet.
const LENGTH_PREFIX: usize = 4;

/// Largest mac we may append to a packet.
const MAX_MAC_SIZE: usize = 64;

/// Codec for the encrypted packets: `u32be length | ciphertext | mac`.
///
/// Holds the cipher state of both directions, each advanced only by its own half of the codec.
#[derive(Debug)]
pub struct SecioCodec {
    encrypt: CipherState,
    decrypt: CipherState,
    max_packet_len: usize,
}

impl SecioCodec {
    pub fn new(
        cipher: Cipher,
        digest: Digest,
        local: &StretchedKey,
        remote: &StretchedKey,
        max_packet_len: usize,
    ) -> Result<Self, HandshakeError> {
        Ok(SecioCodec {
            encrypt: CipherState::new(cipher, digest, local)?,
            decrypt: CipherState::new(cipher, digest, remote)?,
            max_packet_len,
        })
    }

    /// The largest plaintext that fits a single packet.
    pub fn max_plaintext_len(&self) -> usize {
        self.max_packet_len.saturating_sub(MAX_MAC_SIZE)
    }
}

impl Decoder for SecioCodec {
    type Item = BytesMut;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> io::Result<Option<BytesMut>> {
        if src.len() < LENGTH_PREFIX {
            return Ok(None);
        }
        let len = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if len > self.max_packet_len {
            return Err(invalid_data(format!(
                "packet of {len} bytes exceeds the limit of {}",
                self.max_packet_len
            )));
        }
        let mac_size = self.decrypt.mac_size();
        if len < mac_size {
            return Err(invalid_data("packet is shorter than its mac"));
        }
        if src.len() < LENGTH_PREFIX + len {
            src.reserve(LENGTH_PREFIX + len - src.len());
            return Ok(None);
        }

        src.advance(LENGTH_PREFIX);
        let mut data = src.split_to(len);
        let mac = data.split_off(len - mac_size);
        if !self.decrypt.open(&mut data, &mac) {
            return Err(invalid_data("hmac mismatch"));
        }
        Ok(Some(data))
    }
}

impl Encoder<Bytes> for SecioCodec {
    type Error = io::Error;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> io::Result<()> {
        let mut data = BytesMut::from(&item[..]);
        let mac = self.encrypt.seal(&mut data);
        let len = data.len() + mac.len();
        if len > self.max_packet_len {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "sending packet is too large",
            ));
        }
        dst.reserve(LENGTH_PREFIX + len);
        dst.put_u32(len as u32);
        dst.extend_from_slice(&data);
        dst.extend_from_slice(&mac);
        Ok(())
    }
}

/// An authenticated and encrypted duplex stream.
///
/// Written data is buffered until [`AsyncWriteExt::flush`](tokio::io::AsyncWriteExt::flush)
/// and then sent as a single packet.
#[derive(Debug)]
pub struct SecureStream<T> {
    inner: Framed<T, SecioCodec>,
    read_buf: Bytes,
    write_buf: BytesMut,
}

impl<T> SecureStream<T>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    pub(crate) fn new(inner: Framed<T, SecioCodec>) -> Self {
        SecureStream {
            inner,
            read_buf: Bytes::new(),
            write_buf: BytesMut::new(),
        }
    }

    /// Reads the next decrypted packet, bypassing the byte oriented interface.
    pub(crate) async fn next_packet(&mut self) -> io::Result<Option<BytesMut>> {
        self.inner.next().await.transpose()
    }

    pub(crate) async fn send_packet(&mut self, data: Bytes) -> io::Result<()> {
        self.inner.send(data).await
    }

    pub fn get_ref(&self) -> &T {
        self.inner.get_ref()
    }

    fn poll_flush_buf(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        if !self.write_buf.is_empty() {
            ready!(self.inner.poll_ready_unpin(cx))?;
            let data = self.write_buf.split().freeze();
            self.inner.start_send_unpin(data)?;
        }
        Poll::Ready(Ok(()))
    }
}

impl<T> AsyncRead for SecureStream<T>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
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
            match ready!(this.inner.poll_next_unpin(cx)) {
                Some(Ok(data)) => this.read_buf = data.freeze(),
                Some(Err(err)) => return Poll::Ready(Err(err)),
                None => return Poll::Ready(Ok(())),
            }
        }
    }
}

impl<T> AsyncWrite for SecureStream<T>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        let max = this.inner.codec().max_plaintext_len();
        if this.write_buf.len() >= max {
            ready!(this.poll_flush_buf(cx))?;
        }
        let n = buf.len().min(max - this.write_buf.len());
        this.write_buf.extend_from_slice(&buf[..n]);
        Poll::Ready(Ok(n))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_flush_buf(cx))?;
        this.inner.poll_flush_unpin(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        ready!(this.poll_flush_buf(cx))?;
        this.inner.poll_close_unpin(cx)
    }
}
