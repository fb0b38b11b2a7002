//! Length prefixed framing shared by the wire protocols.

use std::io;

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::codec::{Decoder, Encoder};
use unsigned_varint::{decode, encode};

/// Default limit for a single length prefixed message.
pub const MAX_MESSAGE_SIZE: usize = 4 * 1024 * 1024;

/// The longest encoding of a `u64` varint.
const MAX_VARINT_LEN: usize = 10;

pub(crate) fn invalid_data<E>(err: E) -> io::Error
where
    E: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    io::Error::new(io::ErrorKind::InvalidData, err)
}

/// Write the given data to the sink, with an unsigned varint length prefix.
pub async fn write_lp<W: AsyncWrite + Unpin>(writer: &mut W, data: &[u8]) -> io::Result<()> {
    if data.len() > MAX_MESSAGE_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "sending message is too large",
        ));
    }

    let mut buf = encode::usize_buffer();
    writer
        .write_all(encode::usize(data.len(), &mut buf))
        .await?;
    writer.write_all(data).await?;
    Ok(())
}

/// Reads a single unsigned varint, one byte at a time so nothing past it is consumed.
///
/// Returns `None` if the source is at EOF before the first byte.
pub async fn read_varint<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<Option<u64>> {
    let mut buf = [0u8; MAX_VARINT_LEN];
    for i in 0..MAX_VARINT_LEN {
        let n = reader.read(&mut buf[i..i + 1]).await?;
        if n == 0 {
            if i == 0 {
                return Ok(None);
            }
            return Err(io::ErrorKind::UnexpectedEof.into());
        }
        if decode::is_last(buf[i]) {
            let (value, _) = decode::u64(&buf[..=i]).map_err(invalid_data)?;
            return Ok(Some(value));
        }
    }
    Err(invalid_data("varint is too long"))
}

/// Reads a varint length prefixed message of at most `max_len` bytes.
///
/// Returns `None` on a clean EOF.
pub async fn read_lp<R: AsyncRead + Unpin>(
    reader: &mut R,
    max_len: usize,
) -> io::Result<Option<Bytes>> {
    let Some(size) = read_varint(reader).await? else {
        return Ok(None);
    };
    let size = usize::try_from(size).map_err(invalid_data)?;
    if size > max_len {
        return Err(invalid_data(format!(
            "message of {size} bytes exceeds the limit of {max_len}"
        )));
    }
    let mut buffer = BytesMut::zeroed(size);
    reader.read_exact(&mut buffer).await?;
    Ok(Some(buffer.freeze()))
}

/// Codec for unsigned varint length prefixed frames.
#[derive(Debug, Clone)]
pub struct UviBytes {
    max_len: usize,
}

impl Default for UviBytes {
    fn default() -> Self {
        UviBytes {
            max_len: MAX_MESSAGE_SIZE,
        }
    }
}

impl UviBytes {
    pub fn new(max_len: usize) -> Self {
        UviBytes { max_len }
    }

    pub fn max_len(&self) -> usize {
        self.max_len
    }
}

impl Decoder for UviBytes {
    type Item = BytesMut;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> io::Result<Option<Self::Item>> {
        let (size, rest) = match decode::usize(&src[..]) {
            Ok(res) => res,
            Err(decode::Error::Insufficient) => return Ok(None),
            Err(err) => return Err(invalid_data(err)),
        };
        if size > self.max_len {
            return Err(invalid_data(format!(
                "frame of {size} bytes exceeds the limit of {}",
                self.max_len
            )));
        }
        let header_len = src.len() - rest.len();
        if rest.len() < size {
            src.reserve(header_len + size - src.len());
            return Ok(None);
        }
        src.advance(header_len);
        Ok(Some(src.split_to(size)))
    }
}

impl Encoder<Bytes> for UviBytes {
    type Error = io::Error;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> io::Result<()> {
        if item.len() > self.max_len {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "sending message is too large",
            ));
        }
        let mut buf = encode::usize_buffer();
        let header = encode::usize(item.len(), &mut buf);
        dst.reserve(header.len() + item.len());
        dst.extend_from_slice(header);
        dst.extend_from_slice(&item);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_lp_roundtrip() {
        let mut out = Vec::new();
        write_lp(&mut out, b"hello").await.unwrap();
        write_lp(&mut out, &[7u8; 300]).await.unwrap();
        // 300 needs a two byte prefix
        assert_eq!(out.len(), 1 + 5 + 2 + 300);

        let mut reader = &out[..];
        let a = read_lp(&mut reader, 1024).await.unwrap().unwrap();
        let b = read_lp(&mut reader, 1024).await.unwrap().unwrap();
        assert_eq!(&a[..], b"hello");
        assert_eq!(b.len(), 300);
        assert!(read_lp(&mut reader, 1024).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_read_lp_limits() {
        let mut out = Vec::new();
        write_lp(&mut out, &[0u8; 100]).await.unwrap();
        let err = read_lp(&mut &out[..], 99).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);

        let err = read_lp(&mut &out[..50], 1024).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn test_uvi_codec_partial() {
        let mut codec = UviBytes::default();
        let mut encoded = BytesMut::new();
        codec
            .encode(Bytes::from_static(b"frame one"), &mut encoded)
            .unwrap();
        codec
            .encode(Bytes::from_static(b"two"), &mut encoded)
            .unwrap();

        let mut src = BytesMut::new();
        let mut frames = Vec::new();
        for byte in encoded.iter() {
            src.extend_from_slice(&[*byte]);
            if let Some(frame) = codec.decode(&mut src).unwrap() {
                frames.push(frame);
            }
        }
        assert_eq!(frames, vec![&b"frame one"[..], &b"two"[..]]);
        assert!(src.is_empty());
    }

    #[test]
    fn test_uvi_codec_limit() {
        let mut codec = UviBytes::new(4);
        let mut src = BytesMut::new();
        UviBytes::default()
            .encode(Bytes::from_static(b"too long"), &mut src)
            .unwrap();
        assert!(codec.decode(&mut src).is_err());
    }
}
