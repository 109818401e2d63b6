//! `EventFdNotifier` — default `Notifier` implementation on Linux.
//!
//! Writes to an eventfd to wake the thread that drains a channel.
//! Coalescing: multiple calls to `notify()` before the consumer
//! reads the eventfd result in a single wakeup (eventfd counter semantics).

use shardline_core::error::{NetError, Result};
use shardline_core::notifier::Notifier;

use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};

pub struct EventFdNotifier {
    fd: OwnedFd,
}

impl EventFdNotifier {
    /// Create a non-blocking, close-on-exec eventfd. It closes on drop.
    pub fn create() -> Result<Self> {
        let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if fd < 0 {
            return Err(NetError::last_os_error());
        }
        // SAFETY: `fd` was just returned by eventfd and nothing else owns it.
        Ok(Self { fd: unsafe { OwnedFd::from_raw_fd(fd) } })
    }
}

impl Notifier for EventFdNotifier {
    fn notify(&self) -> Result<()> {
        let val: u64 = 1;
        let ret = unsafe {
            libc::write(
                self.fd.as_raw_fd(),
                &val as *const u64 as *const libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        if ret < 0 {
            let err = NetError::last_os_error();
            // EAGAIN: the counter would overflow, so a signal is already pending.
            if matches!(err, NetError::Os(libc::EAGAIN)) {
                return Ok(());
            }
            return Err(err);
        }
        Ok(())
    }

    fn clear(&self) -> Result<()> {
        let mut val: u64 = 0;
        let ret = unsafe {
            libc::read(
                self.fd.as_raw_fd(),
                &mut val as *mut u64 as *mut libc::c_void,
                std::mem::size_of::<u64>(),
            )
        };
        if ret < 0 {
            let err = NetError::last_os_error();
            // EAGAIN: counter already zero.
            if matches!(err, NetError::Os(libc::EAGAIN)) {
                return Ok(());
            }
            return Err(err);
        }
        Ok(())
    }

    fn fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fd_is_readable;

    #[test]
    fn test_notify_coalesces_and_clears() {
        let n = EventFdNotifier::create().unwrap();
        assert!(!fd_is_readable(n.fd()));

        n.notify().unwrap();
        n.notify().unwrap();
        n.notify().unwrap();
        assert!(fd_is_readable(n.fd()));

        // One read drains the whole counter.
        n.clear().unwrap();
        assert!(!fd_is_readable(n.fd()));

        // Clearing an idle eventfd is not an error.
        n.clear().unwrap();
    }
}
