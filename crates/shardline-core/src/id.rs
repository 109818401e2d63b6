//! Connection and I/O thread identifiers

use core::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Engine-assigned identity of a connection.
///
/// Stable for the connection's lifetime, including reconnect attempts of an
/// outbound target. The value 0 is reserved as a sentinel for "no connection".
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct ConnId(u64);

impl ConnId {
    /// Sentinel value indicating no connection
    pub const NONE: ConnId = ConnId(0);

    /// Create a new ConnId from a raw value
    #[inline]
    pub const fn new(id: u64) -> Self {
        ConnId(id)
    }

    /// Get the raw u64 value
    #[inline]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Check if this is the NONE sentinel
    #[inline]
    pub const fn is_none(self) -> bool {
        self.0 == 0
    }

    /// Check if this is a valid ConnId
    #[inline]
    pub const fn is_some(self) -> bool {
        self.0 != 0
    }
}

impl From<u64> for ConnId {
    #[inline]
    fn from(id: u64) -> Self {
        ConnId(id)
    }
}

impl From<ConnId> for u64 {
    #[inline]
    fn from(id: ConnId) -> Self {
        id.0
    }
}

impl fmt::Debug for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            write!(f, "ConnId(NONE)")
        } else {
            write!(f, "ConnId({})", self.0)
        }
    }
}

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            write!(f, "none")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

impl Default for ConnId {
    fn default() -> Self {
        ConnId::NONE
    }
}

/// Index of an I/O thread in the engine's pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct IoThreadId(usize);

impl IoThreadId {
    #[inline]
    pub const fn new(idx: usize) -> Self {
        IoThreadId(idx)
    }

    #[inline]
    pub const fn as_usize(self) -> usize {
        self.0
    }
}

impl fmt::Display for IoThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Process-local connection id allocator.
///
/// A single atomic counter, owned by the engine and handed by reference to
/// whatever allocates connections. Ids start at 1 and are never reused.
#[derive(Debug)]
pub struct UuidGen {
    next: AtomicU64,
}

impl UuidGen {
    pub const fn new() -> Self {
        Self { next: AtomicU64::new(1) }
    }

    /// Allocate the next id.
    #[inline]
    pub fn next_id(&self) -> ConnId {
        ConnId(self.next.fetch_add(1, Ordering::Relaxed))
    }

    /// Number of ids handed out so far.
    pub fn issued(&self) -> u64 {
        self.next.load(Ordering::Relaxed) - 1
    }
}

impl Default for UuidGen {
    fn default() -> Self {
        Self::new()
    }
}
