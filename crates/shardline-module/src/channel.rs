//! Single-producer, single-consumer notify channel.
//!
//! A lock-free queue paired with one `Notifier`. The producer pushes and
//! signals; the consumer registers `wake_fd()` with its poller, and when it
//! fires calls `clear_wake()` and then drains with `try_recv()` until empty.
//!
//! ```text
//!   producer thread                       consumer thread
//!   ───────────────                       ───────────────
//!   tx.send(v) ──► queue.push(v)          poll() returns wake_fd
//!              └─► notifier.notify() ──►  rx.clear_wake()
//!                                         while let Some(v) = rx.try_recv() { .. }
//! ```
//!
//! Clearing before draining means a push racing with the drain either lands
//! in this drain or leaves the fd readable for the next poll. Never lost.
//!
//! Neither half is `Clone`: exactly one producer and one consumer.

use std::fmt;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crossbeam_queue::{ArrayQueue, SegQueue};

use shardline_core::error::{NetError, Result};
use shardline_core::notifier::{Notifier, NotifierKind};

use crate::new_notifier;

/// Create a channel.
///
/// `capacity = None` is unbounded (`SegQueue`); `Some(n)` is bounded
/// (`ArrayQueue`) and `send` fails with `SendError::Full` once `n` values
/// are queued.
pub fn notify_channel<T: Send>(
    capacity: Option<usize>,
    kind: NotifierKind,
) -> Result<(NotifySender<T>, NotifyReceiver<T>)> {
    let queue = match capacity {
        None => Backing::Unbounded(SegQueue::new()),
        Some(0) => return Err(NetError::InvalidConfig("channel capacity must be at least 1")),
        Some(n) => Backing::Bounded(ArrayQueue::new(n)),
    };
    let inner = Arc::new(Shared {
        queue,
        notifier: new_notifier(kind)?,
        closed: AtomicBool::new(false),
    });
    Ok((
        NotifySender { inner: Arc::clone(&inner) },
        NotifyReceiver { inner },
    ))
}

enum Backing<T> {
    Unbounded(SegQueue<T>),
    Bounded(ArrayQueue<T>),
}

struct Shared<T> {
    queue: Backing<T>,
    notifier: Box<dyn Notifier>,
    /// Set when either half is dropped.
    closed: AtomicBool,
}

impl<T> Shared<T> {
    fn len(&self) -> usize {
        match &self.queue {
            Backing::Unbounded(q) => q.len(),
            Backing::Bounded(q) => q.len(),
        }
    }
}

/// Why a `send` did not complete.
pub enum SendError<T> {
    /// Bounded queue is full. The value is handed back.
    Full(T),
    /// The receiver is gone. The value is handed back.
    Closed(T),
    /// The value was queued but the wake signal failed.
    Wake(NetError),
}

impl<T> SendError<T> {
    /// The value that was not queued, if any.
    pub fn into_inner(self) -> Option<T> {
        match self {
            SendError::Full(v) | SendError::Closed(v) => Some(v),
            SendError::Wake(_) => None,
        }
    }
}

impl<T> fmt::Debug for SendError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SendError::Full(_) => write!(f, "SendError::Full(..)"),
            SendError::Closed(_) => write!(f, "SendError::Closed(..)"),
            SendError::Wake(e) => write!(f, "SendError::Wake({:?})", e),
        }
    }
}

impl<T> fmt::Display for SendError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SendError::Full(_) => write!(f, "channel full"),
            SendError::Closed(_) => write!(f, "channel closed"),
            SendError::Wake(e) => write!(f, "wake failed: {}", e),
        }
    }
}

impl<T> From<SendError<T>> for NetError {
    fn from(e: SendError<T>) -> Self {
        match e {
            SendError::Full(_) => NetError::ChannelOverflow,
            SendError::Closed(_) => NetError::ShutDown,
            SendError::Wake(e) => e,
        }
    }
}

/// Producing half.
pub struct NotifySender<T> {
    inner: Arc<Shared<T>>,
}

impl<T> NotifySender<T> {
    /// Queue `value` and wake the consumer. Never blocks.
    pub fn send(&self, value: T) -> std::result::Result<(), SendError<T>> {
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(SendError::Closed(value));
        }
        match &self.inner.queue {
            Backing::Unbounded(q) => q.push(value),
            Backing::Bounded(q) => q.push(value).map_err(SendError::Full)?,
        }
        self.inner.notifier.notify().map_err(SendError::Wake)
    }

    /// Whether the receiver has been dropped.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Values queued and not yet received.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Drop for NotifySender<T> {
    fn drop(&mut self) {
        self.inner.closed.store(true, Ordering::Release);
        // Let the consumer observe the hang-up on its next poll.
        let _ = self.inner.notifier.notify();
    }
}

impl<T> fmt::Debug for NotifySender<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NotifySender")
            .field("len", &self.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Consuming half.
pub struct NotifyReceiver<T> {
    inner: Arc<Shared<T>>,
}

impl<T> NotifyReceiver<T> {
    /// Pop the oldest value, if any.
    #[inline]
    pub fn try_recv(&self) -> Option<T> {
        match &self.inner.queue {
            Backing::Unbounded(q) => q.pop(),
            Backing::Bounded(q) => q.pop(),
        }
    }

    /// Reset the wake signal. Call before draining.
    #[inline]
    pub fn clear_wake(&self) -> Result<()> {
        self.inner.notifier.clear()
    }

    /// fd to register for READABLE interest.
    #[inline]
    pub fn wake_fd(&self) -> RawFd {
        self.inner.notifier.fd()
    }

    /// Whether the sender has been dropped. Values already queued can still
    /// be received.
    pub fn is_disconnected(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> Drop for NotifyReceiver<T> {
    fn drop(&mut self) {
        self.inner.closed.store(true, Ordering::Release);
    }
}

impl<T> fmt::Debug for NotifyReceiver<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NotifyReceiver")
            .field("len", &self.len())
            .field("wake_fd", &self.wake_fd())
            .finish()
    }
}
