//! # shardline-module — Default implementations
//!
//! This crate provides the default implementation for every shardline trait.
//! Each impl prioritizes correctness and simplicity over raw speed.
//!
//! ## Default stack
//!
//! | Trait              | Default Impl        | Alternative            |
//! |--------------------|---------------------|------------------------|
//! | Decoder + Encoder  | LengthPrefixCodec   | (user codec)           |
//! | Poller             | EpollPoller (Linux) | SelectPoller           |
//! | Notifier           | EventFdNotifier     | PipeNotifier           |
//!
//! Plus the SPSC `notify_channel` that pairs a lock-free queue with a
//! `Notifier`, used for every logic ↔ I/O thread hop.

pub mod length_codec;
pub mod channel;
pub mod pipe_notifier;
pub mod select_poller;

pub use channel::{notify_channel, NotifyReceiver, NotifySender, SendError};
pub use length_codec::LengthPrefixCodec;

use std::time::Duration;

use shardline_core::error::Result;
use shardline_core::notifier::{Notifier, NotifierKind};
use shardline_core::poller::{Poller, PollerKind};

cfg_if::cfg_if! {
    if #[cfg(any(target_os = "linux", target_os = "android"))] {
        pub mod eventfd_notifier;
        pub mod epoll_poller;

        fn epoll() -> Result<Box<dyn Poller>> {
            Ok(Box::new(epoll_poller::EpollPoller::new()?))
        }

        fn eventfd() -> Result<Box<dyn Notifier>> {
            Ok(Box::new(eventfd_notifier::EventFdNotifier::create()?))
        }
    } else {
        fn epoll() -> Result<Box<dyn Poller>> {
            Err(shardline_core::error::NetError::InvalidConfig("epoll is not available on this target"))
        }

        fn eventfd() -> Result<Box<dyn Notifier>> {
            Err(shardline_core::error::NetError::InvalidConfig("eventfd is not available on this target"))
        }
    }
}

/// Construct the requested poller backend.
pub fn new_poller(kind: PollerKind) -> Result<Box<dyn Poller>> {
    match kind {
        PollerKind::Epoll => epoll(),
        PollerKind::Select => Ok(Box::new(select_poller::SelectPoller::new())),
    }
}

/// Construct the requested wake primitive.
pub fn new_notifier(kind: NotifierKind) -> Result<Box<dyn Notifier>> {
    match kind {
        NotifierKind::EventFd => eventfd(),
        NotifierKind::Pipe => Ok(Box::new(pipe_notifier::PipeNotifier::create()?)),
    }
}

/// Poll timeout in milliseconds, rounded up. `None` → -1 (infinite).
pub(crate) fn timeout_ms(timeout: Option<Duration>) -> libc::c_int {
    match timeout {
        None => -1,
        Some(d) => {
            let ms = d.as_nanos().div_ceil(1_000_000);
            ms.min(libc::c_int::MAX as u128) as libc::c_int
        }
    }
}

#[cfg(test)]
pub(crate) fn fd_is_readable(fd: std::os::unix::io::RawFd) -> bool {
    let mut pfd = libc::pollfd { fd, events: libc::POLLIN, revents: 0 };
    let ret = unsafe { libc::poll(&mut pfd, 1, 0) };
    ret > 0 && pfd.revents & libc::POLLIN != 0
}
