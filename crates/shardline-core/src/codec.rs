//! Framing codec abstraction.
//!
//! A `Decoder` pulls complete frames out of a connection's receive buffer;
//! an `Encoder` appends one framed message to a send buffer.
//!
//! # Implementors
//!
//! - `LengthPrefixCodec` (default, in shardline-module): little-endian
//!   u16/u32 length prefix followed by the payload.
//!
//! Both traits are `Send + Sync` because a single codec instance is shared
//! (behind an `Arc`) by every I/O thread. Codecs are stateless; all
//! per-connection state lives in the connection's buffers.

use bytes::BytesMut;

use crate::cursor::ByteReader;
use crate::error::Result;
use crate::msg::Msg;

/// Width of the little-endian length prefix on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrefixWidth {
    U16,
    U32,
}

impl PrefixWidth {
    /// Prefix size in bytes.
    #[inline]
    pub const fn bytes(self) -> usize {
        match self {
            PrefixWidth::U16 => 2,
            PrefixWidth::U32 => 4,
        }
    }

    /// Largest payload length the prefix can express.
    #[inline]
    pub const fn max_len(self) -> usize {
        match self {
            PrefixWidth::U16 => u16::MAX as usize,
            PrefixWidth::U32 => u32::MAX as usize,
        }
    }

    /// 2 → U16, 4 → U32.
    pub const fn from_bytes(n: usize) -> Option<Self> {
        match n {
            2 => Some(PrefixWidth::U16),
            4 => Some(PrefixWidth::U32),
            _ => None,
        }
    }
}

/// Outcome of one decode attempt.
#[derive(Debug, PartialEq, Eq)]
pub enum Decoded {
    /// A complete frame; the cursor has advanced past prefix + payload.
    Frame(Msg),
    /// Not enough buffered bytes. The cursor is where it was before the call.
    NeedMore,
}

/// Extracts frames from buffered bytes.
///
/// **Contract:**
/// - On `NeedMore` the cursor must not have moved, so the caller keeps the
///   partial bytes for the next read.
/// - A frame longer than `max_msg_size()` is `Err(ProtocolViolation)`. The
///   connection is then closed, never retried.
/// - The returned `Msg` owns a copy of the payload. It must not alias the
///   receive buffer, which is compacted right after decoding.
pub trait Decoder: Send + Sync {
    fn decode(&self, src: &mut ByteReader<'_>) -> Result<Decoded>;

    /// Largest payload this decoder accepts.
    fn max_msg_size(&self) -> usize;
}

/// Frames outgoing messages.
///
/// **Contract:** byte-identical inputs produce byte-identical output, and
/// `decode(encode(m)) == m` for every `m` with `m.len() <= max_msg_size()`.
pub trait Encoder: Send + Sync {
    /// Append the framed `msg` to `dst`. Returns bytes written.
    fn encode(&self, msg: &Msg, dst: &mut BytesMut) -> Result<usize>;

    /// Largest payload this encoder accepts.
    fn max_msg_size(&self) -> usize;
}

/// Run `decoder` over `buf` until it needs more data, handing each frame
/// to `on_frame`.
///
/// Returns the number of bytes consumed. On a decode error the frames
/// already handed out stay delivered and the error is returned.
pub fn decode_frames<D, F>(decoder: &D, buf: &[u8], mut on_frame: F) -> Result<usize>
where
    D: Decoder + ?Sized,
    F: FnMut(Msg),
{
    let mut reader = ByteReader::new(buf);
    loop {
        if reader.is_empty() {
            break;
        }
        match decoder.decode(&mut reader)? {
            Decoded::Frame(msg) => on_frame(msg),
            Decoded::NeedMore => break,
        }
    }
    Ok(reader.position())
}
