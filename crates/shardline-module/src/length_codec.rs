//! `LengthPrefixCodec` — default `Decoder` + `Encoder`.
//!
//! Wire envelope:
//!
//! ```text
//! ┌──────────────────────┬──────────────────────────┐
//! │ len: u16/u32 LE      │ payload: len bytes       │
//! └──────────────────────┴──────────────────────────┘
//! ```
//!
//! `len == 0` is a valid empty message. `len > max_msg_size` is a protocol
//! violation: decode fails without consuming the prefix, and the caller
//! closes the connection.

use bytes::BytesMut;

use shardline_core::codec::{Decoded, Decoder, Encoder, PrefixWidth};
use shardline_core::cursor::{ByteReader, ByteWriter};
use shardline_core::error::{NetError, Result};
use shardline_core::msg::Msg;

#[derive(Debug, Clone, Copy)]
pub struct LengthPrefixCodec {
    width: PrefixWidth,
    max_msg_size: usize,
}

impl LengthPrefixCodec {
    /// `max_msg_size` is clamped to what the prefix can express.
    pub fn new(width: PrefixWidth, max_msg_size: usize) -> Self {
        Self {
            width,
            max_msg_size: max_msg_size.min(width.max_len()),
        }
    }

    /// u16 prefix, as used by the reference protocol.
    pub fn u16(max_msg_size: usize) -> Self {
        Self::new(PrefixWidth::U16, max_msg_size)
    }

    pub fn width(&self) -> PrefixWidth {
        self.width
    }

    /// Total wire size of a payload of `len` bytes.
    #[inline]
    pub fn frame_len(&self, len: usize) -> usize {
        self.width.bytes() + len
    }

    fn read_prefix(&self, src: &mut ByteReader<'_>) -> Option<usize> {
        match self.width {
            PrefixWidth::U16 => src.try_read::<u16>().map(usize::from),
            PrefixWidth::U32 => src.try_read::<u32>().map(|n| n as usize),
        }
    }
}

impl Decoder for LengthPrefixCodec {
    fn decode(&self, src: &mut ByteReader<'_>) -> Result<Decoded> {
        let mark = src.position();

        let declared = match self.read_prefix(src) {
            Some(n) => n,
            None => {
                src.rewind(mark);
                return Ok(Decoded::NeedMore);
            }
        };

        if declared > self.max_msg_size {
            src.rewind(mark);
            return Err(NetError::ProtocolViolation {
                declared,
                max: self.max_msg_size,
            });
        }

        match src.read_bytes(declared) {
            Some(payload) => Ok(Decoded::Frame(Msg::copy_from(payload))),
            None => {
                src.rewind(mark);
                Ok(Decoded::NeedMore)
            }
        }
    }

    fn max_msg_size(&self) -> usize {
        self.max_msg_size
    }
}

impl Encoder for LengthPrefixCodec {
    fn encode(&self, msg: &Msg, dst: &mut BytesMut) -> Result<usize> {
        let len = msg.len();
        if len > self.max_msg_size {
            return Err(NetError::ProtocolViolation {
                declared: len,
                max: self.max_msg_size,
            });
        }

        let mut w = ByteWriter::new(dst);
        w.reserve(self.frame_len(len));
        match self.width {
            PrefixWidth::U16 => w.write(len as u16),
            PrefixWidth::U32 => w.write(len as u32),
        }
        w.write_bytes(msg.as_bytes());
        Ok(w.written())
    }

    fn max_msg_size(&self) -> usize {
        self.max_msg_size
    }
}
