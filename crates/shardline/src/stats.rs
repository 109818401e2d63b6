//! Per-I/O-thread counters.
//!
//! The I/O thread bumps them with relaxed atomics; the logic thread reads a
//! `IoStatsSnapshot` whenever it likes. Counters are monotonic.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use shardline_core::id::IoThreadId;

/// Live counters shared between an I/O thread and the engine handle.
#[derive(Debug, Default)]
pub struct IoStats {
    pub(crate) accepted: AtomicU64,
    pub(crate) connected: AtomicU64,
    pub(crate) connect_failed: AtomicU64,
    pub(crate) closed: AtomicU64,
    pub(crate) bytes_in: AtomicU64,
    pub(crate) bytes_out: AtomicU64,
    pub(crate) frames_in: AtomicU64,
    pub(crate) frames_out: AtomicU64,
    pub(crate) protocol_errors: AtomicU64,
    pub(crate) spilled: AtomicU64,
}

#[inline]
pub(crate) fn bump(counter: &AtomicU64, n: u64) {
    counter.fetch_add(n, Ordering::Relaxed);
}

impl IoStats {
    /// Point-in-time copy of every counter.
    pub fn snapshot(&self, tid: IoThreadId) -> IoStatsSnapshot {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        IoStatsSnapshot {
            tid,
            accepted: get(&self.accepted),
            connected: get(&self.connected),
            connect_failed: get(&self.connect_failed),
            closed: get(&self.closed),
            bytes_in: get(&self.bytes_in),
            bytes_out: get(&self.bytes_out),
            frames_in: get(&self.frames_in),
            frames_out: get(&self.frames_out),
            protocol_errors: get(&self.protocol_errors),
            spilled: get(&self.spilled),
        }
    }
}

/// Statistics from one I/O thread
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IoStatsSnapshot {
    pub tid: IoThreadId,
    /// Inbound connections adopted
    pub accepted: u64,
    /// Outbound connects that completed
    pub connected: u64,
    /// Outbound connects that failed or timed out
    pub connect_failed: u64,
    /// Connections torn down, any reason
    pub closed: u64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    /// Frames decoded and handed to the logic thread
    pub frames_in: u64,
    /// Frames encoded into send buffers
    pub frames_out: u64,
    /// Connections closed for an oversize frame
    pub protocol_errors: u64,
    /// Events parked because the outbound channel was full
    pub spilled: u64,
}

impl IoStatsSnapshot {
    /// Connections currently open on this thread.
    pub fn open(&self) -> u64 {
        (self.accepted + self.connected).saturating_sub(self.closed)
    }

    /// Sum counters across threads. `tid` is kept from `self`.
    pub fn merge(mut self, other: &IoStatsSnapshot) -> IoStatsSnapshot {
        self.accepted += other.accepted;
        self.connected += other.connected;
        self.connect_failed += other.connect_failed;
        self.closed += other.closed;
        self.bytes_in += other.bytes_in;
        self.bytes_out += other.bytes_out;
        self.frames_in += other.frames_in;
        self.frames_out += other.frames_out;
        self.protocol_errors += other.protocol_errors;
        self.spilled += other.spilled;
        self
    }
}

impl fmt::Display for IoStatsSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "io-{} conns={} accepted={} connected={} failed={} closed={} \
             frames_in={} frames_out={} bytes_in={} bytes_out={} proto_err={}",
            self.tid,
            self.open(),
            self.accepted,
            self.connected,
            self.connect_failed,
            self.closed,
            self.frames_in,
            self.frames_out,
            self.bytes_in,
            self.bytes_out,
            self.protocol_errors,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_and_merge() {
        let s = IoStats::default();
        bump(&s.accepted, 3);
        bump(&s.closed, 1);
        bump(&s.bytes_in, 100);

        let a = s.snapshot(IoThreadId::new(0));
        assert_eq!(a.accepted, 3);
        assert_eq!(a.open(), 2);

        let b = IoStatsSnapshot { connected: 2, bytes_in: 50, ..Default::default() };
        let total = a.merge(&b);
        assert_eq!(total.open(), 4);
        assert_eq!(total.bytes_in, 150);
        assert_eq!(total.tid, IoThreadId::new(0));
    }
}
