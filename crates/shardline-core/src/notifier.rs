//! Cross-thread wake primitive abstraction.
//!
//! A `Notifier` wakes the thread that consumes a channel. It exposes a raw
//! fd so the consumer can register it with its `Poller` next to its sockets.
//!
//! # Implementors
//!
//! - `EventFdNotifier` (default on Linux): writes 1 to an eventfd.
//!   One fd, counter semantics, one read drains every pending signal.
//!
//! - `PipeNotifier` (portable fallback): self-pipe. Writes one byte per
//!   notify into a non-blocking pipe; `clear()` reads until empty.

use std::os::unix::io::RawFd;

use crate::error::Result;

/// Wakes the consumer side of a channel.
///
/// **Contract:**
/// - `notify()` must NEVER block.
/// - Multiple calls before the consumer clears are coalesced into (at
///   least) one readable event on `fd()`.
/// - `clear()` resets the readable state. Consumers call it BEFORE draining
///   the queue, so a push that races with the drain still leaves the fd
///   readable. Spurious wakeups are fine; lost ones are not.
pub trait Notifier: Send + Sync {
    /// Signal that the queue has (or may have) new items.
    fn notify(&self) -> Result<()>;

    /// Drain pending signals.
    fn clear(&self) -> Result<()>;

    /// The fd to register with a `Poller` for READABLE interest.
    fn fd(&self) -> RawFd;
}

/// Which wake primitive to construct.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotifierKind {
    EventFd,
    Pipe,
}
