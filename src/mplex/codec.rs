use std::io;

use bytes::{Buf, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use unsigned_varint::{decode, encode};

use crate::protocol::invalid_data;

/// Largest payload accepted in a single frame.
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flag {
    NewStream = 0,
    MessageReceiver = 1,
    MessageInitiator = 2,
    CloseReceiver = 3,
    CloseInitiator = 4,
    ResetReceiver = 5,
    ResetInitiator = 6,
}

impl Flag {
    fn from_u64(value: u64) -> Option<Self> {
        let flag = match value {
            0 => Flag::NewStream,
            1 => Flag::MessageReceiver,
            2 => Flag::MessageInitiator,
            3 => Flag::CloseReceiver,
            4 => Flag::CloseInitiator,
            5 => Flag::ResetReceiver,
            6 => Flag::ResetInitiator,
            _ => return None,
        };
        Some(flag)
    }

    pub fn message(opened_locally: bool) -> Self {
        if opened_locally {
            Flag::MessageInitiator
        } else {
            Flag::MessageReceiver
        }
    }

    pub fn close(opened_locally: bool) -> Self {
        if opened_locally {
            Flag::CloseInitiator
        } else {
            Flag::CloseReceiver
        }
    }

    pub fn reset(opened_locally: bool) -> Self {
        if opened_locally {
            Flag::ResetInitiator
        } else {
            Flag::ResetReceiver
        }
    }
}

/// A single mplex frame: `varint(id << 3 | flag) | varint(len) | payload`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub id: u64,
    pub flag: Flag,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(id: u64, flag: Flag, payload: Bytes) -> Self {
        Frame { id, flag, payload }
    }
}

#[derive(Debug, Clone, Default)]
pub struct MplexCodec;

impl Decoder for MplexCodec {
    type Item = Frame;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> io::Result<Option<Frame>> {
        let (header, rest) = match decode::u64(&src[..]) {
            Ok(res) => res,
            Err(decode::Error::Insufficient) => return Ok(None),
            Err(err) => return Err(invalid_data(err)),
        };
        let (len, rest) = match decode::usize(rest) {
            Ok(res) => res,
            Err(decode::Error::Insufficient) => return Ok(None),
            Err(err) => return Err(invalid_data(err)),
        };
        if len > MAX_FRAME_SIZE {
            return Err(invalid_data(format!(
                "frame of {len} bytes exceeds the limit of {MAX_FRAME_SIZE}"
            )));
        }
        let flag = Flag::from_u64(header & 0b111)
            .ok_or_else(|| invalid_data(format!("unknown flag {}", header & 0b111)))?;

        let header_len = src.len() - rest.len();
        if rest.len() < len {
            src.reserve(header_len + len - src.len());
            return Ok(None);
        }
        src.advance(header_len);
        let payload = src.split_to(len).freeze();
        Ok(Some(Frame {
            id: header >> 3,
            flag,
            payload,
        }))
    }
}

impl Encoder<Frame> for MplexCodec {
    type Error = io::Error;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> io::Result<()> {
        if frame.payload.len() > MAX_FRAME_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "frame payload is too large",
            ));
        }
        let mut header_buf = encode::u64_buffer();
        let header = encode::u64((frame.id << 3) | frame.flag as u64, &mut header_buf);
        let mut len_buf = encode::usize_buffer();
        let len = encode::usize(frame.payload.len(), &mut len_buf);

        dst.reserve(header.len() + len.len() + frame.payload.len());
        dst.extend_from_slice(header);
        dst.extend_from_slice(len);
        dst.extend_from_slice(&frame.payload);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_layout() {
        let mut dst = BytesMut::new();
        MplexCodec
            .encode(
                Frame::new(17, Flag::MessageInitiator, Bytes::from_static(b"hi")),
                &mut dst,
            )
            .unwrap();
        // 17 << 3 | 2 = 138, which needs two varint bytes
        assert_eq!(&dst[..], &[0x8a, 0x01, 0x02, b'h', b'i']);

        let frame = MplexCodec.decode(&mut dst).unwrap().unwrap();
        assert_eq!(frame.id, 17);
        assert_eq!(frame.flag, Flag::MessageInitiator);
        assert_eq!(&frame.payload[..], b"hi");
        assert!(dst.is_empty());
    }

    #[test]
    fn test_partial_and_invalid_frames() {
        let mut dst = BytesMut::new();
        MplexCodec
            .encode(
                Frame::new(1000, Flag::NewStream, Bytes::from_static(b"foo")),
                &mut dst,
            )
            .unwrap();
        let mut partial = BytesMut::from(&dst[..dst.len() - 1]);
        assert!(MplexCodec.decode(&mut partial).unwrap().is_none());

        let mut unknown = BytesMut::from(&[0x07u8, 0x00][..]);
        assert!(MplexCodec.decode(&mut unknown).is_err());

        let mut huge = BytesMut::new();
        let mut buf = encode::usize_buffer();
        huge.extend_from_slice(&[0x08]);
        huge.extend_from_slice(encode::usize(MAX_FRAME_SIZE + 1, &mut buf));
        assert!(MplexCodec.decode(&mut huge).is_err());
    }
}
