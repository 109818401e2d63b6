//! Owned application message.
//!
//! A `Msg` is the unit that crosses threads. It is deliberately move-only:
//! there is no `Clone`, so once a `Msg` is pushed into a channel the sender
//! has nothing left to inspect or mutate. Ownership transfers exactly once
//! per hop (I/O thread → channel → logic thread, or back).

use core::fmt;

/// An owned payload buffer.
///
/// The declared payload length is the buffer length; capacity may exceed it.
pub struct Msg {
    data: Vec<u8>,
}

impl Msg {
    /// Wrap an owned buffer without copying.
    #[inline]
    pub fn new(data: Vec<u8>) -> Self {
        Self { data }
    }

    /// Empty message (length 0 is a valid frame).
    #[inline]
    pub fn empty() -> Self {
        Self { data: Vec::new() }
    }

    /// Copy `bytes` into a fresh buffer.
    #[inline]
    pub fn copy_from(bytes: &[u8]) -> Self {
        Self { data: bytes.to_vec() }
    }

    /// Payload length in bytes.
    #[inline]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Give up ownership of the underlying buffer.
    #[inline]
    pub fn into_vec(self) -> Vec<u8> {
        self.data
    }
}

impl From<Vec<u8>> for Msg {
    fn from(data: Vec<u8>) -> Self {
        Msg::new(data)
    }
}

impl From<&[u8]> for Msg {
    fn from(bytes: &[u8]) -> Self {
        Msg::copy_from(bytes)
    }
}

impl From<&str> for Msg {
    fn from(s: &str) -> Self {
        Msg::copy_from(s.as_bytes())
    }
}

impl AsRef<[u8]> for Msg {
    fn as_ref(&self) -> &[u8] {
        &self.data
    }
}

impl PartialEq for Msg {
    fn eq(&self, other: &Self) -> bool {
        self.data == other.data
    }
}

impl Eq for Msg {}

impl fmt::Debug for Msg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const PREVIEW: usize = 16;
        write!(f, "Msg(len={}", self.data.len())?;
        if !self.data.is_empty() {
            write!(f, ", ")?;
            for b in self.data.iter().take(PREVIEW) {
                write!(f, "{:02x}", b)?;
            }
            if self.data.len() > PREVIEW {
                write!(f, "..")?;
            }
        }
        write!(f, ")")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_msg_basics() {
        let m = Msg::from("hello");
        assert_eq!(m.len(), 5);
        assert!(!m.is_empty());
        assert_eq!(m.as_bytes(), b"hello");
        assert_eq!(m.into_vec(), b"hello".to_vec());

        assert!(Msg::empty().is_empty());
    }

    #[test]
    fn test_msg_debug_preview() {
        let m = Msg::copy_from(&[0xab; 20]);
        let s = format!("{:?}", m);
        assert!(s.starts_with("Msg(len=20, abab"));
        assert!(s.ends_with("..)"));
        assert_eq!(format!("{:?}", Msg::empty()), "Msg(len=0)");
    }
}
