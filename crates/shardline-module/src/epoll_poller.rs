//! `EpollPoller` — default `Poller` on Linux.
//!
//! Level-triggered `epoll(7)`. Each registered fd is stored in the event's
//! `u64` payload so readiness maps straight back to the fd without a lookup.
//!
//! `EPOLLRDHUP` is folded into `readable`: the next read returns 0 and the
//! connection takes the normal peer-closed path. `EPOLLERR | EPOLLHUP`
//! set `error`.

use std::collections::HashSet;
use std::os::unix::io::RawFd;
use std::time::Duration;

use tracing::trace;

use shardline_core::error::{NetError, Result};
use shardline_core::poller::{Interest, PollEvent, Poller};

use crate::timeout_ms;

const INITIAL_EVENTS: usize = 256;
const MAX_EVENTS: usize = 4096;

pub struct EpollPoller {
    epfd: RawFd,
    registered: HashSet<RawFd>,
    buf: Vec<libc::epoll_event>,
}

impl EpollPoller {
    pub fn new() -> Result<Self> {
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            return Err(NetError::last_os_error());
        }
        Ok(Self {
            epfd,
            registered: HashSet::new(),
            buf: vec![libc::epoll_event { events: 0, u64: 0 }; INITIAL_EVENTS],
        })
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, interest: Interest) -> Result<()> {
        let mut ev = libc::epoll_event {
            events: epoll_bits(interest),
            u64: fd as u64,
        };
        let ret = unsafe { libc::epoll_ctl(self.epfd, op, fd, &mut ev) };
        if ret < 0 {
            return Err(match NetError::last_os_error() {
                NetError::Os(libc::ENOENT) => NetError::NotRegistered(fd),
                e => e,
            });
        }
        Ok(())
    }
}

fn epoll_bits(interest: Interest) -> u32 {
    let mut bits = libc::EPOLLRDHUP as u32;
    if interest.is_readable() {
        bits |= libc::EPOLLIN as u32;
    }
    if interest.is_writable() {
        bits |= libc::EPOLLOUT as u32;
    }
    bits
}

impl Poller for EpollPoller {
    fn register(&mut self, fd: RawFd, interest: Interest) -> Result<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, interest)?;
        self.registered.insert(fd);
        Ok(())
    }

    fn reregister(&mut self, fd: RawFd, interest: Interest) -> Result<()> {
        if !self.registered.contains(&fd) {
            return Err(NetError::NotRegistered(fd));
        }
        self.ctl(libc::EPOLL_CTL_MOD, fd, interest)
    }

    fn unregister(&mut self, fd: RawFd) -> Result<()> {
        if !self.registered.remove(&fd) {
            return Err(NetError::NotRegistered(fd));
        }
        self.ctl(libc::EPOLL_CTL_DEL, fd, Interest::NONE)
    }

    fn poll(&mut self, events: &mut Vec<PollEvent>, timeout: Option<Duration>) -> Result<usize> {
        events.clear();

        let n = unsafe {
            libc::epoll_wait(
                self.epfd,
                self.buf.as_mut_ptr(),
                self.buf.len() as libc::c_int,
                timeout_ms(timeout),
            )
        };
        if n < 0 {
            return match NetError::last_os_error() {
                NetError::Os(libc::EINTR) => Ok(0),
                e => Err(e),
            };
        }

        let n = n as usize;
        for ev in &self.buf[..n] {
            // epoll_event is packed on x86_64: copy fields out, never borrow.
            let bits = ev.events;
            let fd = ev.u64 as RawFd;
            events.push(PollEvent {
                fd,
                readable: bits & (libc::EPOLLIN | libc::EPOLLRDHUP) as u32 != 0,
                writable: bits & libc::EPOLLOUT as u32 != 0,
                error: bits & (libc::EPOLLERR | libc::EPOLLHUP) as u32 != 0,
            });
        }

        if n == self.buf.len() && n < MAX_EVENTS {
            let grown = (n * 2).min(MAX_EVENTS);
            self.buf.resize(grown, libc::epoll_event { events: 0, u64: 0 });
            trace!(events = grown, "epoll event buffer grown");
        }

        Ok(n)
    }

    fn len(&self) -> usize {
        self.registered.len()
    }

    fn name(&self) -> &'static str {
        "epoll"
    }
}

impl Drop for EpollPoller {
    fn drop(&mut self) {
        if self.epfd >= 0 {
            unsafe {
                libc::close(self.epfd);
            }
            self.epfd = -1;
        }
    }
}
