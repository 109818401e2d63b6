//! One TCP connection as seen by its owning I/O thread.
//!
//! ```text
//!   connect_to ──► Connecting ──writable, SO_ERROR=0──► Open ──close()──► Closing ──drained──► Closed
//!                      │                                 ▲  │                                   ▲
//!                      └─► ConnectFailed (error,         │  └───────────────────────────────────┘
//!                          timeout or abort)             │        EOF, error, violation
//!   accept ──────────────────────────────────────────────┘
//! ```
//!
//! `Closed` is not a state a `Connection` is ever in: the reactor drops the
//! value once it is unregistered. `Closing` only exists for a requested
//! close whose send buffer did not drain in one write; the socket stays
//! registered for WRITABLE until it drains or `close_linger` runs out.
//!
//! Only the owning I/O thread touches a `Connection`. The receive buffer
//! holds at most one partial frame between reads; the send buffer holds
//! encoded frames not yet accepted by the kernel.

use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::{Duration, Instant};

use bytes::{Buf, BytesMut};

use shardline_core::codec::{decode_frames, Decoder, Encoder};
use shardline_core::error::{CloseReason, ConnectError, Result};
use shardline_core::id::ConnId;
use shardline_core::msg::Msg;
use shardline_core::poller::{Interest, Poller};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Connecting,
    Open,
    /// Requested close draining its send buffer. Reads stop.
    Closing,
}

/// What one readable event produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ReadStatus {
    pub bytes: usize,
    /// Peer closed its write side (read returned 0).
    pub eof: bool,
}

#[derive(Debug)]
pub struct Connection {
    uuid: ConnId,
    stream: TcpStream,
    peer: Option<SocketAddr>,
    outbound: bool,
    state: ConnState,
    recv: BytesMut,
    send: BytesMut,
    interest: Interest,
    /// When the current state was entered.
    since: Instant,
    /// Reported once a `Closing` connection finishes.
    close_reason: Option<CloseReason>,
}

impl Connection {
    /// An accepted socket. Starts `Open`, watching READABLE.
    pub fn accepted(uuid: ConnId, stream: TcpStream, peer: Option<SocketAddr>) -> Self {
        Self::with_state(uuid, stream, peer, false, ConnState::Open)
    }

    /// An outbound socket with a connect in flight. Watches both directions
    /// until the connect resolves.
    pub fn connecting(uuid: ConnId, stream: TcpStream, peer: SocketAddr) -> Self {
        Self::with_state(uuid, stream, Some(peer), true, ConnState::Connecting)
    }

    fn with_state(
        uuid: ConnId,
        stream: TcpStream,
        peer: Option<SocketAddr>,
        outbound: bool,
        state: ConnState,
    ) -> Self {
        let mut conn = Self {
            uuid,
            stream,
            peer,
            outbound,
            state,
            recv: BytesMut::new(),
            send: BytesMut::new(),
            interest: Interest::NONE,
            since: Instant::now(),
            close_reason: None,
        };
        conn.interest = conn.desired_interest();
        conn
    }

    #[inline]
    pub fn uuid(&self) -> ConnId {
        self.uuid
    }

    #[inline]
    pub fn fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.peer
    }

    pub fn is_outbound(&self) -> bool {
        self.outbound
    }

    #[inline]
    pub fn state(&self) -> ConnState {
        self.state
    }

    /// Enter `Closing`: stop reading, keep flushing, report `reason` later.
    pub fn begin_close(&mut self, reason: CloseReason) {
        self.state = ConnState::Closing;
        self.since = Instant::now();
        self.close_reason = Some(reason);
    }

    /// Reason stored by `begin_close`.
    pub fn close_reason(&self) -> Option<CloseReason> {
        self.close_reason
    }

    /// Interest the poller currently holds for this fd.
    pub fn interest(&self) -> Interest {
        self.interest
    }

    /// Bytes encoded but not yet written.
    pub fn pending_send(&self) -> usize {
        self.send.len()
    }

    /// Bytes received but not yet decoded (a partial frame).
    pub fn pending_recv(&self) -> usize {
        self.recv.len()
    }

    /// READABLE unless closing; WRITABLE while connecting or while bytes
    /// wait.
    pub fn desired_interest(&self) -> Interest {
        match self.state {
            ConnState::Connecting => Interest::BOTH,
            ConnState::Closing => Interest::WRITABLE,
            _ if !self.send.is_empty() => Interest::BOTH,
            _ => Interest::READABLE,
        }
    }

    /// Push `desired_interest()` to the poller if it changed.
    pub fn sync_interest(&mut self, poller: &mut dyn Poller) -> Result<()> {
        let want = self.desired_interest();
        if want != self.interest {
            poller.reregister(self.fd(), want)?;
            self.interest = want;
        }
        Ok(())
    }

    /// Read until the socket would block, EOF, or `cap` bytes.
    ///
    /// Bytes read before an EOF are kept and reported together with it, so
    /// frames that arrived just before the close still get decoded.
    pub fn read_available(&mut self, chunk: usize, cap: usize) -> io::Result<ReadStatus> {
        let mut status = ReadStatus::default();
        while status.bytes < cap {
            let start = self.recv.len();
            self.recv.resize(start + chunk, 0);
            let res = (&self.stream).read(&mut self.recv[start..]);
            match res {
                Ok(0) => {
                    self.recv.truncate(start);
                    status.eof = true;
                    break;
                }
                Ok(n) => {
                    self.recv.truncate(start + n);
                    status.bytes += n;
                }
                Err(e) => {
                    self.recv.truncate(start);
                    match e.kind() {
                        io::ErrorKind::WouldBlock => break,
                        io::ErrorKind::Interrupted => continue,
                        _ => return Err(e),
                    }
                }
            }
        }
        Ok(status)
    }

    /// Decode every complete frame in the receive buffer and drop the
    /// consumed bytes. Returns the number of frames.
    ///
    /// On a decode error the frames before the bad one have already been
    /// handed to `on_frame`; the caller closes the connection.
    pub fn decode<F>(&mut self, decoder: &dyn Decoder, mut on_frame: F) -> Result<usize>
    where
        F: FnMut(Msg),
    {
        let mut frames = 0;
        let consumed = decode_frames(decoder, &self.recv, |msg| {
            frames += 1;
            on_frame(msg);
        })?;
        self.recv.advance(consumed);
        Ok(frames)
    }

    /// Encode `msg` onto the send buffer.
    ///
    /// Returns `Ok(false)` when pending bytes now exceed `limit`; the
    /// caller closes the connection with `SendOverflow`.
    pub fn enqueue(&mut self, encoder: &dyn Encoder, msg: &Msg, limit: usize) -> Result<bool> {
        encoder.encode(msg, &mut self.send)?;
        Ok(self.send.len() <= limit)
    }

    /// Write as much of the send buffer as the kernel takes.
    pub fn flush(&mut self) -> io::Result<usize> {
        let mut written = 0;
        while !self.send.is_empty() {
            match (&self.stream).write(&self.send) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => {
                    self.send.advance(n);
                    written += n;
                }
                Err(e) => match e.kind() {
                    io::ErrorKind::WouldBlock => break,
                    io::ErrorKind::Interrupted => continue,
                    _ => return Err(e),
                },
            }
        }
        Ok(written)
    }

    /// Resolve a `Connecting` socket after the poller reported it.
    ///
    /// `Ok(true)`: connected, now `Open`. `Ok(false)`: spurious readiness,
    /// still connecting. `Err`: the connect failed.
    pub fn finish_connect(&mut self) -> std::result::Result<bool, ConnectError> {
        match self.stream.take_error() {
            Ok(Some(e)) | Err(e) => return Err(ConnectError::from(&e)),
            Ok(None) => {}
        }
        match self.stream.peer_addr() {
            Ok(addr) => {
                self.peer = Some(addr);
                self.state = ConnState::Open;
                self.since = Instant::now();
                Ok(true)
            }
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(false),
            Err(e) => Err(ConnectError::from(&e)),
        }
    }

    /// Whether a `Connecting` socket has been pending longer than `timeout`.
    pub fn connect_expired(&self, now: Instant, timeout: Duration) -> bool {
        self.state == ConnState::Connecting && now.duration_since(self.since) > timeout
    }

    /// Whether a `Closing` socket has been draining longer than `linger`.
    pub fn linger_expired(&self, now: Instant, linger: Duration) -> bool {
        self.state == ConnState::Closing && now.duration_since(self.since) > linger
    }
}
