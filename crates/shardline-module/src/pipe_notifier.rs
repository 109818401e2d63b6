//! `PipeNotifier` — self-pipe `Notifier` for targets without eventfd.
//!
//! `notify()` writes one byte to the write end; the read end is what the
//! consumer registers with its poller. A full pipe means a wakeup is
//! already pending, so EAGAIN on write is success. `clear()` reads until
//! the pipe is empty.

use std::os::fd::{AsRawFd, OwnedFd};
use std::os::unix::io::RawFd;

use nix::errno::Errno;

use shardline_core::error::{NetError, Result};
use shardline_core::notifier::Notifier;

pub struct PipeNotifier {
    rx: OwnedFd,
    tx: OwnedFd,
}

impl PipeNotifier {
    /// Create a non-blocking, close-on-exec pipe.
    pub fn create() -> Result<Self> {
        let (rx, tx) = open_pipe().map_err(errno)?;
        Ok(Self { rx, tx })
    }
}

cfg_if::cfg_if! {
    if #[cfg(any(
        target_os = "linux",
        target_os = "android",
        target_os = "freebsd",
        target_os = "dragonfly",
        target_os = "netbsd",
        target_os = "openbsd",
    ))] {
        fn open_pipe() -> nix::Result<(OwnedFd, OwnedFd)> {
            use nix::fcntl::OFlag;
            nix::unistd::pipe2(OFlag::O_NONBLOCK | OFlag::O_CLOEXEC)
        }
    } else {
        fn open_pipe() -> nix::Result<(OwnedFd, OwnedFd)> {
            use nix::fcntl::{fcntl, FcntlArg, FdFlag, OFlag};
            let (rx, tx) = nix::unistd::pipe()?;
            for fd in [rx.as_raw_fd(), tx.as_raw_fd()] {
                fcntl(fd, FcntlArg::F_SETFL(OFlag::O_NONBLOCK))?;
                fcntl(fd, FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))?;
            }
            Ok((rx, tx))
        }
    }
}

#[inline]
fn errno(e: Errno) -> NetError {
    NetError::Os(e as i32)
}

impl Notifier for PipeNotifier {
    fn notify(&self) -> Result<()> {
        loop {
            match nix::unistd::write(&self.tx, &[1u8]) {
                Ok(_) => return Ok(()),
                Err(Errno::EAGAIN) => return Ok(()),
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(errno(e)),
            }
        }
    }

    fn clear(&self) -> Result<()> {
        let mut buf = [0u8; 64];
        loop {
            match nix::unistd::read(self.rx.as_raw_fd(), &mut buf) {
                Ok(0) => return Ok(()),
                Ok(n) if n < buf.len() => return Ok(()),
                Ok(_) => continue,
                Err(Errno::EAGAIN) => return Ok(()),
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(errno(e)),
            }
        }
    }

    fn fd(&self) -> RawFd {
        self.rx.as_raw_fd()
    }
}
