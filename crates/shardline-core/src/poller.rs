//! OS readiness multiplexer abstraction.
//!
//! A `Poller` watches a set of fds and reports which ones became readable,
//! writable, or errored.
//!
//! # Implementors
//!
//! - `EpollPoller` (default on Linux): level-triggered `epoll(7)`.
//!   O(ready) per wait, no fd limit beyond RLIMIT_NOFILE.
//!
//! - `SelectPoller` (portable fallback): `select(2)`. Rebuilds the fd sets on
//!   every wait, limited to fds below `FD_SETSIZE`. Fine for a handful of
//!   connections per shard.
//!
//! The backend is picked once at construction (`PollerKind`) and used
//! through `Box<dyn Poller>` afterwards.

use std::ops::{BitOr, BitOrAssign};
use std::os::unix::io::RawFd;
use std::time::Duration;

use crate::error::Result;

/// Interest mask for a registered fd.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Interest(u8);

impl Interest {
    pub const NONE: Interest = Interest(0);
    pub const READABLE: Interest = Interest(0b01);
    pub const WRITABLE: Interest = Interest(0b10);
    pub const BOTH: Interest = Interest(0b11);

    #[inline]
    pub const fn is_readable(self) -> bool {
        self.0 & Self::READABLE.0 != 0
    }

    #[inline]
    pub const fn is_writable(self) -> bool {
        self.0 & Self::WRITABLE.0 != 0
    }

    /// `self` plus `other`.
    #[inline]
    pub const fn with(self, other: Interest) -> Interest {
        Interest(self.0 | other.0)
    }

    /// `self` without `other`.
    #[inline]
    pub const fn without(self, other: Interest) -> Interest {
        Interest(self.0 & !other.0)
    }
}

impl BitOr for Interest {
    type Output = Interest;

    fn bitor(self, rhs: Interest) -> Interest {
        self.with(rhs)
    }
}

impl BitOrAssign for Interest {
    fn bitor_assign(&mut self, rhs: Interest) {
        *self = self.with(rhs);
    }
}

/// One readiness report from `Poller::poll`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollEvent {
    pub fd: RawFd,
    pub readable: bool,
    pub writable: bool,
    /// Error or hangup. Takes precedence over `readable`: teardown first,
    /// no data delivery.
    pub error: bool,
}

impl PollEvent {
    /// Readable and not errored.
    #[inline]
    pub fn is_readable(&self) -> bool {
        self.readable && !self.error
    }

    #[inline]
    pub fn is_writable(&self) -> bool {
        self.writable && !self.error
    }

    #[inline]
    pub fn is_error(&self) -> bool {
        self.error
    }
}

/// Which backend to construct.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollerKind {
    Epoll,
    Select,
}

impl std::str::FromStr for PollerKind {
    type Err = ();

    fn from_str(s: &str) -> std::result::Result<Self, ()> {
        match s.to_ascii_lowercase().as_str() {
            "epoll" => Ok(PollerKind::Epoll),
            "select" => Ok(PollerKind::Select),
            _ => Err(()),
        }
    }
}

/// Readiness multiplexing.
///
/// **Contract:**
/// - `reregister()` replaces the whole interest mask; callers that only
///   want to toggle WRITABLE must pass READABLE along with it.
/// - `poll()` blocks up to `timeout` (`None` = forever, `Some(ZERO)` = no
///   wait). It also returns early when any registered fd fires, which
///   includes channel wake fds.
/// - An interrupted wait (EINTR) returns `Ok(0)`, not an error.
/// - Owned by exactly one thread; `Send` so it can be moved there.
pub trait Poller: Send {
    /// Start watching `fd`.
    fn register(&mut self, fd: RawFd, interest: Interest) -> Result<()>;

    /// Replace the interest mask of an already registered `fd`.
    fn reregister(&mut self, fd: RawFd, interest: Interest) -> Result<()>;

    /// Stop watching `fd`. Must be called before the fd is closed.
    fn unregister(&mut self, fd: RawFd) -> Result<()>;

    /// Wait for readiness. Clears `events` and fills it; returns its length.
    fn poll(&mut self, events: &mut Vec<PollEvent>, timeout: Option<Duration>) -> Result<usize>;

    /// Number of registered fds.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Backend name, for logs.
    fn name(&self) -> &'static str;
}
