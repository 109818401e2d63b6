//! Byte cursor over wire buffers.
//!
//! `ByteReader` walks a borrowed slice and records failure instead of
//! panicking: a short read leaves the position untouched and sets `fail()`.
//! Callers read, check `fail()`, and `rewind()` to a saved position when a
//! frame turns out to be incomplete.
//!
//! `ByteWriter` appends to a `BytesMut` and counts what it wrote.
//!
//! All multi-byte integers are little-endian.

use bytes::{BufMut, BytesMut};

/// Fixed-width integer that can be read/written in little-endian order.
pub trait WireInt: Copy {
    /// Encoded width in bytes.
    const SIZE: usize;

    /// Decode from the first `SIZE` bytes of `src`. `src.len() >= SIZE`.
    fn from_le_slice(src: &[u8]) -> Self;

    /// Append the little-endian encoding to `dst`.
    fn put_le(self, dst: &mut BytesMut);
}

macro_rules! impl_wire_int {
    ($($t:ty),*) => {$(
        impl WireInt for $t {
            const SIZE: usize = std::mem::size_of::<$t>();

            #[inline]
            fn from_le_slice(src: &[u8]) -> Self {
                let mut raw = [0u8; std::mem::size_of::<$t>()];
                raw.copy_from_slice(&src[..Self::SIZE]);
                <$t>::from_le_bytes(raw)
            }

            #[inline]
            fn put_le(self, dst: &mut BytesMut) {
                dst.put_slice(&self.to_le_bytes());
            }
        }
    )*};
}

impl_wire_int!(u8, u16, u32, u64);

/// Read cursor over a borrowed byte slice.
#[derive(Debug)]
pub struct ByteReader<'a> {
    buf: &'a [u8],
    pos: usize,
    failed: bool,
}

impl<'a> ByteReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0, failed: false }
    }

    /// Read a `T`. On a short buffer returns zero, sets `fail()`, and does
    /// not advance.
    #[inline]
    pub fn read<T: WireInt + Default>(&mut self) -> T {
        match self.try_read() {
            Some(v) => v,
            None => T::default(),
        }
    }

    /// Read a `T`, or `None` (and set `fail()`) if too few bytes remain.
    #[inline]
    pub fn try_read<T: WireInt>(&mut self) -> Option<T> {
        if !self.can_grow_by(T::SIZE) {
            self.failed = true;
            return None;
        }
        let v = T::from_le_slice(&self.buf[self.pos..]);
        self.pos += T::SIZE;
        Some(v)
    }

    /// Borrow the next `n` bytes and advance past them.
    #[inline]
    pub fn read_bytes(&mut self, n: usize) -> Option<&'a [u8]> {
        if !self.can_grow_by(n) {
            self.failed = true;
            return None;
        }
        let out = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Some(out)
    }

    /// Whether any read since construction (or the last `rewind`) came up short.
    #[inline]
    pub fn fail(&self) -> bool {
        self.failed
    }

    /// Whether at least `n` more bytes are available.
    #[inline]
    pub fn can_grow_by(&self, n: usize) -> bool {
        self.remaining() >= n
    }

    #[inline]
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    /// Bytes consumed so far.
    #[inline]
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Move back to a previously saved position and clear the fail flag.
    #[inline]
    pub fn rewind(&mut self, pos: usize) {
        debug_assert!(pos <= self.buf.len());
        self.pos = pos.min(self.buf.len());
        self.failed = false;
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }
}

/// Append cursor over a `BytesMut`.
#[derive(Debug)]
pub struct ByteWriter<'a> {
    dst: &'a mut BytesMut,
    start: usize,
}

impl<'a> ByteWriter<'a> {
    pub fn new(dst: &'a mut BytesMut) -> Self {
        let start = dst.len();
        Self { dst, start }
    }

    #[inline]
    pub fn write<T: WireInt>(&mut self, v: T) {
        v.put_le(self.dst);
    }

    #[inline]
    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.dst.put_slice(bytes);
    }

    /// Reserve room for `n` more bytes.
    #[inline]
    pub fn reserve(&mut self, n: usize) {
        self.dst.reserve(n);
    }

    /// Bytes appended through this writer.
    #[inline]
    pub fn written(&self) -> usize {
        self.dst.len() - self.start
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reader_little_endian() {
        let buf = [0x34, 0x12, 0x78, 0x56, 0x34, 0x12, 0xff];
        let mut r = ByteReader::new(&buf);
        assert_eq!(r.read::<u16>(), 0x1234);
        assert_eq!(r.read::<u32>(), 0x1234_5678);
        assert_eq!(r.read::<u8>(), 0xff);
        assert!(!r.fail());
        assert!(r.is_empty());
    }

    #[test]
    fn test_reader_short_read_sets_fail() {
        let buf = [0x01];
        let mut r = ByteReader::new(&buf);
        assert_eq!(r.read::<u16>(), 0);
        assert!(r.fail());
        assert_eq!(r.position(), 0);

        r.rewind(0);
        assert!(!r.fail());
        assert_eq!(r.read::<u8>(), 1);
    }

    #[test]
    fn test_read_bytes_and_can_grow_by() {
        let buf = b"abcdef";
        let mut r = ByteReader::new(buf);
        assert!(r.can_grow_by(6));
        assert!(!r.can_grow_by(7));
        assert_eq!(r.read_bytes(2), Some(&b"ab"[..]));
        assert_eq!(r.read_bytes(5), None);
        assert!(r.fail());
        assert_eq!(r.remaining(), 4);
    }

    #[test]
    fn test_writer_counts_bytes() {
        let mut dst = BytesMut::from(&b"xx"[..]);
        let mut w = ByteWriter::new(&mut dst);
        w.write(0x0102u16);
        w.write(7u32);
        w.write_bytes(b"hi");
        assert_eq!(w.written(), 8);
        assert_eq!(&dst[..], &[b'x', b'x', 0x02, 0x01, 7, 0, 0, 0, b'h', b'i']);
    }
}
