//! `SelectPoller` — portable `select(2)` fallback.
//!
//! Keeps the interest set in a sorted map and rebuilds the fd sets on every
//! wait. Only fds below `FD_SETSIZE` can be watched; `register` rejects the
//! rest with `FdOutOfRange`.
//!
//! select has no separate hang-up signal. A closed or failed socket shows up
//! as readable and the following read reports EOF or the error.

use std::collections::BTreeMap;
use std::os::unix::io::RawFd;
use std::time::Duration;

use tracing::warn;

use shardline_core::error::{NetError, Result};
use shardline_core::poller::{Interest, PollEvent, Poller};

#[derive(Default)]
pub struct SelectPoller {
    fds: BTreeMap<RawFd, Interest>,
}

impl SelectPoller {
    pub fn new() -> Self {
        Self::default()
    }
}

#[inline]
fn in_range(fd: RawFd) -> bool {
    fd >= 0 && (fd as usize) < libc::FD_SETSIZE as usize
}

fn empty_set() -> libc::fd_set {
    let mut set: libc::fd_set = unsafe { std::mem::zeroed() };
    unsafe { libc::FD_ZERO(&mut set) };
    set
}

impl Poller for SelectPoller {
    fn register(&mut self, fd: RawFd, interest: Interest) -> Result<()> {
        if !in_range(fd) {
            warn!(fd, limit = libc::FD_SETSIZE, "fd beyond select() range");
            return Err(NetError::FdOutOfRange(fd));
        }
        self.fds.insert(fd, interest);
        Ok(())
    }

    fn reregister(&mut self, fd: RawFd, interest: Interest) -> Result<()> {
        match self.fds.get_mut(&fd) {
            Some(slot) => {
                *slot = interest;
                Ok(())
            }
            None => Err(NetError::NotRegistered(fd)),
        }
    }

    fn unregister(&mut self, fd: RawFd) -> Result<()> {
        self.fds
            .remove(&fd)
            .map(|_| ())
            .ok_or(NetError::NotRegistered(fd))
    }

    fn poll(&mut self, events: &mut Vec<PollEvent>, timeout: Option<Duration>) -> Result<usize> {
        events.clear();

        let mut rd = empty_set();
        let mut wr = empty_set();
        let mut max_fd: RawFd = -1;
        for (&fd, &interest) in &self.fds {
            if interest.is_readable() {
                unsafe { libc::FD_SET(fd, &mut rd) };
            }
            if interest.is_writable() {
                unsafe { libc::FD_SET(fd, &mut wr) };
            }
            max_fd = max_fd.max(fd);
        }

        let mut tv;
        let tvp = match timeout {
            None => std::ptr::null_mut(),
            Some(d) => {
                tv = libc::timeval {
                    tv_sec: d.as_secs().min(libc::time_t::MAX as u64) as libc::time_t,
                    tv_usec: d.subsec_micros() as libc::suseconds_t,
                };
                &mut tv as *mut libc::timeval
            }
        };

        let n = unsafe {
            libc::select(max_fd + 1, &mut rd, &mut wr, std::ptr::null_mut(), tvp)
        };
        if n < 0 {
            return match NetError::last_os_error() {
                NetError::Os(libc::EINTR) => Ok(0),
                e => Err(e),
            };
        }
        if n == 0 {
            return Ok(0);
        }

        for &fd in self.fds.keys() {
            let readable = unsafe { libc::FD_ISSET(fd, &rd) };
            let writable = unsafe { libc::FD_ISSET(fd, &wr) };
            if readable || writable {
                events.push(PollEvent { fd, readable, writable, error: false });
            }
        }
        Ok(events.len())
    }

    fn len(&self) -> usize {
        self.fds.len()
    }

    fn name(&self) -> &'static str {
        "select"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests_support::socket_pair;
    use std::io::{Read, Write};
    use std::os::unix::io::AsRawFd;

    #[test]
    fn test_readable_and_writable() {
        let mut p = SelectPoller::new();
        let (mut a, mut b) = socket_pair();
        p.register(b.as_raw_fd(), Interest::READABLE).unwrap();

        let mut evs = Vec::new();
        assert_eq!(p.poll(&mut evs, Some(Duration::ZERO)).unwrap(), 0);

        a.write_all(b"hi").unwrap();
        assert_eq!(p.poll(&mut evs, Some(Duration::from_secs(1))).unwrap(), 1);
        assert!(evs[0].is_readable());

        let mut buf = [0u8; 2];
        b.read_exact(&mut buf).unwrap();
        assert_eq!(p.poll(&mut evs, Some(Duration::ZERO)).unwrap(), 0);

        p.reregister(b.as_raw_fd(), Interest::BOTH).unwrap();
        assert_eq!(p.poll(&mut evs, Some(Duration::ZERO)).unwrap(), 1);
        assert!(evs[0].is_writable());
        assert!(!evs[0].is_readable());
    }

    #[test]
    fn test_out_of_range_fd() {
        let mut p = SelectPoller::new();
        let big = libc::FD_SETSIZE as RawFd;
        assert!(matches!(
            p.register(big, Interest::READABLE),
            Err(NetError::FdOutOfRange(fd)) if fd == big
        ));
        assert!(matches!(p.register(-1, Interest::READABLE), Err(NetError::FdOutOfRange(-1))));
        assert!(p.is_empty());
    }

    #[test]
    fn test_unregister_unknown() {
        let mut p = SelectPoller::new();
        assert!(matches!(p.unregister(5), Err(NetError::NotRegistered(5))));
        assert!(matches!(p.reregister(5, Interest::BOTH), Err(NetError::NotRegistered(5))));
    }

    #[test]
    fn test_peer_close_is_readable() {
        let mut p = SelectPoller::new();
        let (a, b) = socket_pair();
        p.register(b.as_raw_fd(), Interest::READABLE).unwrap();
        drop(a);

        let mut evs = Vec::new();
        assert_eq!(p.poll(&mut evs, Some(Duration::from_secs(1))).unwrap(), 1);
        assert!(evs[0].is_readable());
    }
}
