//! # I/O thread — one reactor shard
//!
//! Each I/O thread runs on a dedicated OS thread and owns a `Poller` plus
//! every connection assigned to it. Per iteration it:
//! 1. Waits on the poller (sockets + the inbound channel's wake fd)
//! 2. Reads readable sockets and decodes frames → `Event::Data`
//! 3. Flushes writable sockets and completes in-flight connects
//! 4. Clears the wake fd, then drains `Command`s from the logic thread
//! 5. Tears down connections that hit EOF, errors or protocol violations
//!
//! A requested close whose send buffer does not drain at once lingers in
//! `Closing` (WRITABLE only) until it drains or `close_linger` expires.
//! Closing a socket that is still connecting reports
//! `ConnectFailed(Aborted)`, never `Closed`.
//!
//! Nothing here panics across threads. Failures become `Event`s.

use std::collections::{HashMap, VecDeque};
use std::net::{SocketAddr, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use tracing::{debug, error, info, info_span, trace, warn};

use shardline_core::codec::{Decoder, Encoder};
use shardline_core::config::EngineConfig;
use shardline_core::error::{CloseReason, ConnectError, NetError, Result};
use shardline_core::id::{ConnId, IoThreadId};
use shardline_core::msg::Msg;
use shardline_core::poller::{Interest, PollEvent, Poller};
use shardline_module::{new_poller, notify_channel, NotifyReceiver, NotifySender, SendError};

use crate::connection::{ConnState, Connection};
use crate::socket;
use crate::stats::{bump, IoStats, IoStatsSnapshot};

/// Reads per readable event before yielding to other sockets.
const READS_PER_EVENT: usize = 16;

/// Logic thread → I/O thread.
#[derive(Debug)]
pub enum Command {
    /// Take ownership of an accepted socket.
    Adopt { uuid: ConnId, stream: TcpStream },
    /// Encode and send one message.
    Send { uuid: ConnId, msg: Msg },
    /// Flush what is pending, then close.
    Close(ConnId),
    /// Dial `host:port` under `uuid`.
    ConnectTo { uuid: ConnId, host: String, port: u16 },
    /// Close everything and exit.
    Shutdown,
}

/// I/O thread → logic thread.
#[derive(Debug)]
pub enum Event {
    Opened { uuid: ConnId, tid: IoThreadId, peer: SocketAddr, outbound: bool },
    ConnectFailed { uuid: ConnId, error: ConnectError },
    Data { uuid: ConnId, msg: Msg },
    Closed { uuid: ConnId, reason: CloseReason },
}

/// Logic-side handle to a running I/O thread.
pub(crate) struct IoThreadHandle {
    pub(crate) tid: IoThreadId,
    pub(crate) commands: NotifySender<Command>,
    pub(crate) events: NotifyReceiver<Event>,
    stats: Arc<IoStats>,
    thread: Option<JoinHandle<()>>,
}

impl IoThreadHandle {
    /// Create the channels and poller, then start the thread.
    ///
    /// Every OS primitive is created here, on the caller's thread, so a
    /// failure is reported before anything runs.
    pub(crate) fn spawn(
        tid: IoThreadId,
        config: &EngineConfig,
        decoder: Arc<dyn Decoder>,
        encoder: Arc<dyn Encoder>,
        shutdown: Arc<AtomicBool>,
    ) -> Result<Self> {
        let (cmd_tx, cmd_rx) = notify_channel(config.channel_capacity, config.notifier)?;
        let (evt_tx, evt_rx) = notify_channel(config.channel_capacity, config.notifier)?;

        let mut poller = new_poller(config.poller)?;
        poller.register(cmd_rx.wake_fd(), Interest::READABLE)?;

        let stats = Arc::new(IoStats::default());
        let reactor = Reactor {
            tid,
            poller,
            commands: cmd_rx,
            outbox: Outbox { tx: evt_tx, spill: VecDeque::new() },
            conns: HashMap::new(),
            by_uuid: HashMap::new(),
            connecting: 0,
            lingering: 0,
            decoder,
            encoder,
            config: config.clone(),
            stats: Arc::clone(&stats),
            shutdown,
        };

        let thread = thread::Builder::new()
            .name(format!("shardline-io-{}", tid))
            .spawn(move || reactor.run())
            .map_err(NetError::ThreadSpawn)?;

        Ok(Self {
            tid,
            commands: cmd_tx,
            events: evt_rx,
            stats,
            thread: Some(thread),
        })
    }

    pub(crate) fn send(&self, cmd: Command) -> Result<()> {
        self.commands.send(cmd).map_err(NetError::from)
    }

    pub(crate) fn stats(&self) -> IoStatsSnapshot {
        self.stats.snapshot(self.tid)
    }

    /// Ask the thread to exit and wait for it.
    pub(crate) fn stop(&mut self) {
        if let Some(handle) = self.thread.take() {
            let _ = self.commands.send(Command::Shutdown);
            if handle.join().is_err() {
                error!(tid = %self.tid, "I/O thread panicked");
            }
        }
    }
}

impl Drop for IoThreadHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Outbound event queue with a local spill for a full bounded channel.
///
/// Once anything is spilled, later events queue behind it so the logic
/// thread still sees them in order.
struct Outbox {
    tx: NotifySender<Event>,
    spill: VecDeque<Event>,
}

impl Outbox {
    fn push(&mut self, ev: Event, stats: &IoStats) {
        if !self.spill.is_empty() {
            self.spill.push_back(ev);
            return;
        }
        match self.tx.send(ev) {
            Ok(()) => {}
            Err(SendError::Full(ev)) => {
                bump(&stats.spilled, 1);
                self.spill.push_back(ev);
            }
            Err(SendError::Closed(_)) => {}
            Err(SendError::Wake(e)) => warn!(error = %e, "event wake failed"),
        }
    }

    /// Move spilled events into the channel until it fills again.
    fn retry(&mut self) {
        while let Some(ev) = self.spill.pop_front() {
            match self.tx.send(ev) {
                Ok(()) => {}
                Err(SendError::Full(ev)) => {
                    self.spill.push_front(ev);
                    return;
                }
                Err(SendError::Closed(_)) => {
                    self.spill.clear();
                    return;
                }
                Err(SendError::Wake(e)) => warn!(error = %e, "event wake failed"),
            }
        }
    }
}

struct Reactor {
    tid: IoThreadId,
    poller: Box<dyn Poller>,
    commands: NotifyReceiver<Command>,
    outbox: Outbox,
    conns: HashMap<RawFd, Connection>,
    by_uuid: HashMap<ConnId, RawFd>,
    /// Connections still in `Connecting`.
    connecting: usize,
    /// Connections in `Closing`.
    lingering: usize,
    decoder: Arc<dyn Decoder>,
    encoder: Arc<dyn Encoder>,
    config: EngineConfig,
    stats: Arc<IoStats>,
    shutdown: Arc<AtomicBool>,
}

impl Reactor {
    fn run(mut self) {
        let span = info_span!("io", tid = self.tid.as_usize());
        let _enter = span.enter();
        info!(poller = self.poller.name(), "I/O thread started");

        let wake_fd = self.commands.wake_fd();
        let mut ready: Vec<PollEvent> = Vec::with_capacity(256);

        loop {
            if self.shutdown.load(Ordering::Acquire) {
                break;
            }
            self.outbox.retry();

            // ── Step 1: wait ──
            if let Err(e) = self.poller.poll(&mut ready, Some(self.config.poll_timeout)) {
                error!(error = %e, "poll failed, stopping");
                break;
            }

            // ── Steps 2-3: socket readiness ──
            let mut woken = false;
            for ev in &ready {
                if ev.fd == wake_fd {
                    woken = true;
                } else {
                    self.on_ready(*ev);
                }
            }

            // ── Step 4: commands ──
            if woken {
                if let Err(e) = self.commands.clear_wake() {
                    warn!(error = %e, "clearing wake fd failed");
                }
            }
            if self.drain_commands() {
                break;
            }
            if self.commands.is_disconnected() {
                debug!("engine handle dropped");
                break;
            }

            if self.connecting > 0 || self.lingering > 0 {
                self.expire_deadlines();
            }
        }

        // ── Step 5 for everything left ──
        let fds: Vec<RawFd> = self.conns.keys().copied().collect();
        for fd in fds {
            self.close_active(fd, CloseReason::Shutdown);
        }
        self.outbox.retry();
        info!("I/O thread stopped");
    }

    fn on_ready(&mut self, ev: PollEvent) {
        let Some(conn) = self.conns.get(&ev.fd) else {
            return;
        };

        match conn.state() {
            ConnState::Connecting => {
                self.complete_connect(ev.fd);
                return;
            }
            ConnState::Closing => {
                if ev.is_error() {
                    self.close(ev.fd, CloseReason::Hangup);
                } else if ev.is_writable() {
                    self.drain_closing(ev.fd);
                }
                return;
            }
            ConnState::Open => {}
        }
        if ev.is_error() {
            self.close(ev.fd, CloseReason::Hangup);
            return;
        }
        if ev.is_readable() && !self.on_readable(ev.fd) {
            return;
        }
        if ev.is_writable() {
            self.on_writable(ev.fd);
        }
    }

    /// Returns false if the connection was closed.
    fn on_readable(&mut self, fd: RawFd) -> bool {
        let chunk = self.config.read_chunk;
        let Some(conn) = self.conns.get_mut(&fd) else {
            return false;
        };
        let uuid = conn.uuid();

        let status = match conn.read_available(chunk, chunk * READS_PER_EVENT) {
            Ok(s) => s,
            Err(e) => {
                debug!(%uuid, error = %e, "read failed");
                self.close(fd, CloseReason::Io(e.kind()));
                return false;
            }
        };
        bump(&self.stats.bytes_in, status.bytes as u64);

        let outbox = &mut self.outbox;
        let stats = &self.stats;
        let decoded = conn.decode(&*self.decoder, |msg| {
            trace!(%uuid, len = msg.len(), "frame in");
            outbox.push(Event::Data { uuid, msg }, stats);
        });
        match decoded {
            Ok(n) => bump(&self.stats.frames_in, n as u64),
            Err(e) => {
                bump(&self.stats.protocol_errors, 1);
                warn!(%uuid, error = %e, "closing on bad frame");
                self.close(fd, CloseReason::from(&e));
                return false;
            }
        }

        if status.eof {
            self.close(fd, CloseReason::PeerClosed);
            return false;
        }
        true
    }

    fn on_writable(&mut self, fd: RawFd) {
        let Some(conn) = self.conns.get_mut(&fd) else {
            return;
        };
        match conn.flush() {
            Ok(n) => bump(&self.stats.bytes_out, n as u64),
            Err(e) => {
                let uuid = conn.uuid();
                debug!(%uuid, error = %e, "write failed");
                self.close(fd, CloseReason::Io(e.kind()));
                return;
            }
        }
        self.sync_interest(fd);
    }

    /// Flush a `Closing` connection; finish the close once it is empty.
    fn drain_closing(&mut self, fd: RawFd) {
        let Some(conn) = self.conns.get_mut(&fd) else {
            return;
        };
        match conn.flush() {
            Ok(n) => bump(&self.stats.bytes_out, n as u64),
            Err(e) => {
                self.close(fd, CloseReason::Io(e.kind()));
                return;
            }
        }
        if conn.pending_send() == 0 {
            let reason = conn.close_reason().unwrap_or(CloseReason::Requested);
            self.close(fd, reason);
        }
    }

    fn sync_interest(&mut self, fd: RawFd) {
        let Some(conn) = self.conns.get_mut(&fd) else {
            return;
        };
        if let Err(e) = conn.sync_interest(self.poller.as_mut()) {
            let uuid = conn.uuid();
            warn!(%uuid, error = %e, "reregister failed");
            self.close(fd, CloseReason::Hangup);
        }
    }

    fn complete_connect(&mut self, fd: RawFd) {
        let Some(conn) = self.conns.get_mut(&fd) else {
            return;
        };
        let uuid = conn.uuid();
        match conn.finish_connect() {
            Ok(false) => {}
            Ok(true) => {
                self.connecting -= 1;
                bump(&self.stats.connected, 1);
                let peer = conn.peer();
                info!(%uuid, peer = ?peer, "connected");
                if let Some(peer) = peer {
                    self.outbox.push(
                        Event::Opened { uuid, tid: self.tid, peer, outbound: true },
                        &self.stats,
                    );
                }
                self.sync_interest(fd);
            }
            Err(error) => self.fail_connect(fd, error),
        }
    }

    /// Drop a connection that never opened and report why.
    fn fail_connect(&mut self, fd: RawFd, error: ConnectError) {
        let Some(conn) = self.detach(fd) else {
            return;
        };
        self.connecting -= 1;
        bump(&self.stats.connect_failed, 1);
        warn!(uuid = %conn.uuid(), peer = ?conn.peer(), %error, "connect failed");
        self.outbox.push(Event::ConnectFailed { uuid: conn.uuid(), error }, &self.stats);
    }

    fn expire_deadlines(&mut self) {
        let now = Instant::now();
        let timeout = self.config.connect_timeout;
        let linger = self.config.close_linger;
        let expired: Vec<(RawFd, ConnState)> = self
            .conns
            .iter()
            .filter(|(_, c)| c.connect_expired(now, timeout) || c.linger_expired(now, linger))
            .map(|(fd, c)| (*fd, c.state()))
            .collect();
        for (fd, state) in expired {
            if state == ConnState::Connecting {
                self.fail_connect(fd, ConnectError::TimedOut);
                continue;
            }
            let Some(conn) = self.conns.get(&fd) else {
                continue;
            };
            let reason = conn.close_reason().unwrap_or(CloseReason::Requested);
            warn!(uuid = %conn.uuid(), unsent = conn.pending_send(), "close linger expired");
            self.close(fd, reason);
        }
    }

    /// Remove from both maps and the poller. The socket closes when the
    /// returned value drops.
    fn detach(&mut self, fd: RawFd) -> Option<Connection> {
        let conn = self.conns.remove(&fd)?;
        self.by_uuid.remove(&conn.uuid());
        if let Err(e) = self.poller.unregister(fd) {
            debug!(uuid = %conn.uuid(), error = %e, "unregister failed");
        }
        Some(conn)
    }

    /// Tear down and emit `Closed`. A connection that never opened is
    /// reported as `ConnectFailed(Aborted)` instead.
    fn close(&mut self, fd: RawFd, reason: CloseReason) {
        match self.conns.get(&fd).map(Connection::state) {
            None => return,
            Some(ConnState::Connecting) => {
                self.fail_connect(fd, ConnectError::Aborted);
                return;
            }
            Some(ConnState::Closing) => self.lingering -= 1,
            Some(ConnState::Open) => {}
        }
        let Some(conn) = self.detach(fd) else {
            return;
        };
        let uuid = conn.uuid();
        bump(&self.stats.closed, 1);
        info!(%uuid, peer = ?conn.peer(), %reason, "connection closed");
        drop(conn);
        self.outbox.push(Event::Closed { uuid, reason }, &self.stats);
    }

    /// Local close. One flush first; a requested close that cannot drain
    /// at once lingers in `Closing`, anything else closes now.
    fn close_active(&mut self, fd: RawFd, reason: CloseReason) {
        let Some(conn) = self.conns.get_mut(&fd) else {
            return;
        };
        let state = conn.state();
        if state == ConnState::Closing && reason == CloseReason::Requested {
            return;
        }
        if state != ConnState::Connecting && conn.pending_send() > 0 {
            match conn.flush() {
                Ok(n) => bump(&self.stats.bytes_out, n as u64),
                Err(e) => {
                    self.close(fd, CloseReason::Io(e.kind()));
                    return;
                }
            }
            if state == ConnState::Open && reason == CloseReason::Requested && conn.pending_send() > 0 {
                debug!(uuid = %conn.uuid(), unsent = conn.pending_send(), "draining before close");
                conn.begin_close(reason);
                self.lingering += 1;
                self.sync_interest(fd);
                return;
            }
        }
        self.close(fd, reason);
    }

    /// Returns true on `Shutdown`.
    fn drain_commands(&mut self) -> bool {
        while let Some(cmd) = self.commands.try_recv() {
            match cmd {
                Command::Adopt { uuid, stream } => self.adopt(uuid, stream),
                Command::Send { uuid, msg } => self.send(uuid, msg),
                Command::Close(uuid) => {
                    if let Some(&fd) = self.by_uuid.get(&uuid) {
                        self.close_active(fd, CloseReason::Requested);
                    }
                }
                Command::ConnectTo { uuid, host, port } => self.connect_to(uuid, &host, port),
                Command::Shutdown => return true,
            }
        }
        false
    }

    fn adopt(&mut self, uuid: ConnId, stream: TcpStream) {
        if let Err(e) = socket::prepare_stream(&stream, self.config.nodelay) {
            warn!(%uuid, error = %e, "dropping accepted socket");
            return;
        }
        let peer = stream.peer_addr().ok();
        let fd = stream.as_raw_fd();
        let conn = Connection::accepted(uuid, stream, peer);
        if let Err(e) = self.poller.register(fd, conn.interest()) {
            warn!(%uuid, error = %e, "dropping accepted socket");
            return;
        }
        bump(&self.stats.accepted, 1);
        info!(%uuid, peer = ?peer, "accepted");
        self.conns.insert(fd, conn);
        self.by_uuid.insert(uuid, fd);

        match peer {
            Some(peer) => {
                self.outbox.push(
                    Event::Opened { uuid, tid: self.tid, peer, outbound: false },
                    &self.stats,
                );
            }
            // Already reset by the peer.
            None => self.close(fd, CloseReason::PeerClosed),
        }
    }

    fn send(&mut self, uuid: ConnId, msg: Msg) {
        let Some(&fd) = self.by_uuid.get(&uuid) else {
            debug!(%uuid, "send to closed connection dropped");
            return;
        };
        let Some(conn) = self.conns.get_mut(&fd) else {
            return;
        };
        if conn.state() == ConnState::Closing {
            debug!(%uuid, "send after close dropped");
            return;
        }

        match conn.enqueue(&*self.encoder, &msg, self.config.max_pending_send) {
            Ok(true) => bump(&self.stats.frames_out, 1),
            Ok(false) => {
                warn!(%uuid, pending = conn.pending_send(), "send buffer over limit");
                self.close(fd, CloseReason::SendOverflow);
                return;
            }
            Err(e) => {
                warn!(%uuid, error = %e, "message not encoded");
                return;
            }
        }

        if conn.state() == ConnState::Open {
            match conn.flush() {
                Ok(n) => bump(&self.stats.bytes_out, n as u64),
                Err(e) => {
                    debug!(%uuid, error = %e, "write failed");
                    self.close(fd, CloseReason::Io(e.kind()));
                    return;
                }
            }
        }
        self.sync_interest(fd);
    }

    fn connect_to(&mut self, uuid: ConnId, host: &str, port: u16) {
        if self.by_uuid.contains_key(&uuid) {
            debug!(%uuid, "connect already in progress");
            return;
        }

        let addr = match socket::resolve(host, port) {
            Ok(a) => a,
            Err(error) => {
                warn!(%uuid, host, port, %error, "connect failed");
                bump(&self.stats.connect_failed, 1);
                self.outbox.push(Event::ConnectFailed { uuid, error }, &self.stats);
                return;
            }
        };

        let stream = match socket::start_connect(addr, self.config.nodelay) {
            Ok(s) => s,
            Err(e) => {
                let error = ConnectError::from(&e);
                warn!(%uuid, %addr, %error, "connect failed");
                bump(&self.stats.connect_failed, 1);
                self.outbox.push(Event::ConnectFailed { uuid, error }, &self.stats);
                return;
            }
        };

        let fd = stream.as_raw_fd();
        let conn = Connection::connecting(uuid, stream, addr);
        if let Err(e) = self.poller.register(fd, conn.interest()) {
            warn!(%uuid, %addr, error = %e, "connect failed");
            bump(&self.stats.connect_failed, 1);
            let error = match e {
                NetError::Io(ref io) => ConnectError::from(io),
                _ => ConnectError::Io(std::io::ErrorKind::Other),
            };
            self.outbox.push(Event::ConnectFailed { uuid, error }, &self.stats);
            return;
        }
        debug!(%uuid, %addr, "connecting");
        self.conns.insert(fd, conn);
        self.by_uuid.insert(uuid, fd);
        self.connecting += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shardline_core::codec::PrefixWidth;
    use shardline_module::LengthPrefixCodec;
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::time::Duration;

    fn spawn_one(config: &EngineConfig) -> IoThreadHandle {
        let codec = Arc::new(LengthPrefixCodec::new(config.prefix, config.max_msg_size));
        IoThreadHandle::spawn(
            IoThreadId::new(0),
            config,
            codec.clone(),
            codec,
            Arc::new(AtomicBool::new(false)),
        )
        .unwrap()
    }

    fn next_event(h: &IoThreadHandle) -> Event {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            if let Some(ev) = h.events.try_recv() {
                return ev;
            }
            assert!(Instant::now() < deadline, "no event from I/O thread");
            thread::sleep(Duration::from_millis(1));
        }
    }

    fn config() -> EngineConfig {
        EngineConfig::new()
            .io_threads(1)
            .max_msg_size(100)
            .poll_timeout(Duration::from_millis(10))
    }

    #[test]
    fn test_adopt_data_and_close() {
        let h = spawn_one(&config());
        let l = TcpListener::bind("127.0.0.1:0").unwrap();
        let mut client = TcpStream::connect(l.local_addr().unwrap()).unwrap();
        let (server, _) = l.accept().unwrap();

        let uuid = ConnId::new(11);
        h.send(Command::Adopt { uuid, stream: server }).unwrap();
        assert!(matches!(next_event(&h), Event::Opened { uuid: u, outbound: false, .. } if u == uuid));

        client.write_all(&[2, 0, b'o', b'k']).unwrap();
        match next_event(&h) {
            Event::Data { uuid: u, msg } => {
                assert_eq!(u, uuid);
                assert_eq!(msg.as_bytes(), b"ok");
            }
            other => panic!("unexpected {:?}", other),
        }

        h.send(Command::Send { uuid, msg: Msg::from("back") }).unwrap();
        let mut buf = [0u8; 6];
        client.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, &[4, 0, b'b', b'a', b'c', b'k']);

        drop(client);
        assert!(matches!(
            next_event(&h),
            Event::Closed { reason: CloseReason::PeerClosed, .. }
        ));
        assert_eq!(h.stats().accepted, 1);
        assert_eq!(h.stats().closed, 1);
    }

    #[test]
    fn test_requested_close_flushes_first() {
        let h = spawn_one(&config());
        let l = TcpListener::bind("127.0.0.1:0").unwrap();
        let mut client = TcpStream::connect(l.local_addr().unwrap()).unwrap();
        let (server, _) = l.accept().unwrap();

        let uuid = ConnId::new(5);
        h.send(Command::Adopt { uuid, stream: server }).unwrap();
        next_event(&h);

        h.send(Command::Send { uuid, msg: Msg::from("bye") }).unwrap();
        h.send(Command::Close(uuid)).unwrap();

        let mut got = Vec::new();
        client.read_to_end(&mut got).unwrap();
        assert_eq!(got, vec![3, 0, b'b', b'y', b'e']);
        assert!(matches!(
            next_event(&h),
            Event::Closed { reason: CloseReason::Requested, .. }
        ));
    }

    fn lingering_config(linger: Duration) -> EngineConfig {
        config()
            .prefix(PrefixWidth::U32)
            .max_msg_size(1 << 20)
            .max_pending_send(64 << 20)
            .close_linger(linger)
    }

    /// Adopt a server socket and queue `n` frames of 1 MiB that the
    /// client has not read yet.
    fn stuff_unread(h: &IoThreadHandle, uuid: ConnId, n: usize) -> TcpStream {
        let l = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(l.local_addr().unwrap()).unwrap();
        let (server, _) = l.accept().unwrap();
        h.send(Command::Adopt { uuid, stream: server }).unwrap();
        next_event(h);
        for _ in 0..n {
            h.send(Command::Send { uuid, msg: Msg::new(vec![7; 1 << 20]) }).unwrap();
        }
        client
    }

    #[test]
    fn test_requested_close_lingers_until_drained() {
        const N: usize = 32;
        let h = spawn_one(&lingering_config(Duration::from_secs(5)));
        let uuid = ConnId::new(8);
        let mut client = stuff_unread(&h, uuid, N);

        h.send(Command::Close(uuid)).unwrap();
        thread::sleep(Duration::from_millis(100));
        assert!(h.events.try_recv().is_none(), "closed before the peer read anything");

        let mut got = Vec::new();
        client.read_to_end(&mut got).unwrap();
        assert_eq!(got.len(), N * (4 + (1 << 20)));
        assert!(matches!(
            next_event(&h),
            Event::Closed { uuid: u, reason: CloseReason::Requested } if u == uuid
        ));
    }

    #[test]
    fn test_close_linger_expires() {
        const N: usize = 32;
        let h = spawn_one(&lingering_config(Duration::from_millis(50)));
        let uuid = ConnId::new(9);
        let mut client = stuff_unread(&h, uuid, N);

        h.send(Command::Close(uuid)).unwrap();
        assert!(matches!(
            next_event(&h),
            Event::Closed { uuid: u, reason: CloseReason::Requested } if u == uuid
        ));

        // Whatever was still queued in user space is gone.
        let mut got = Vec::new();
        let _ = client.read_to_end(&mut got);
        assert!(got.len() < N * (4 + (1 << 20)));
    }

    #[test]
    fn test_close_while_connecting_reports_failure() {
        let h = spawn_one(&config().connect_timeout(Duration::from_secs(5)));
        let uuid = ConnId::new(6);
        // Unroutable: the connect stays in flight unless the host has no route.
        h.send(Command::ConnectTo { uuid, host: "10.255.255.1".into(), port: 9 }).unwrap();
        h.send(Command::Close(uuid)).unwrap();

        assert!(matches!(next_event(&h), Event::ConnectFailed { uuid: u, .. } if u == uuid));
        thread::sleep(Duration::from_millis(100));
        assert!(h.events.try_recv().is_none());
        assert_eq!(h.stats().connect_failed, 1);
        assert_eq!(h.stats().closed, 0);
    }

    #[test]
    fn test_connect_refused() {
        let port = {
            let l = TcpListener::bind("127.0.0.1:0").unwrap();
            l.local_addr().unwrap().port()
        };
        let h = spawn_one(&config());
        let uuid = ConnId::new(3);
        h.send(Command::ConnectTo { uuid, host: "127.0.0.1".into(), port }).unwrap();
        match next_event(&h) {
            Event::ConnectFailed { uuid: u, error } => {
                assert_eq!(u, uuid);
                assert_eq!(error, ConnectError::Refused);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(h.stats().connect_failed, 1);
    }

    #[test]
    fn test_connect_resolve_failure() {
        let h = spawn_one(&config());
        let uuid = ConnId::new(4);
        h.send(Command::ConnectTo { uuid, host: "bad host.invalid".into(), port: 1 }).unwrap();
        assert!(matches!(
            next_event(&h),
            Event::ConnectFailed { error: ConnectError::Resolve, .. }
        ));
    }

    #[test]
    fn test_oversize_frame_closes() {
        let h = spawn_one(&config());
        let l = TcpListener::bind("127.0.0.1:0").unwrap();
        let mut client = TcpStream::connect(l.local_addr().unwrap()).unwrap();
        let (server, _) = l.accept().unwrap();

        h.send(Command::Adopt { uuid: ConnId::new(1), stream: server }).unwrap();
        next_event(&h);

        client.write_all(&101u16.to_le_bytes()).unwrap();
        assert!(matches!(
            next_event(&h),
            Event::Closed { reason: CloseReason::ProtocolViolation { declared: 101, max: 100 }, .. }
        ));
        assert_eq!(h.stats().protocol_errors, 1);
    }

    #[test]
    fn test_shutdown_closes_all() {
        let mut h = spawn_one(&config());
        let l = TcpListener::bind("127.0.0.1:0").unwrap();
        let _client = TcpStream::connect(l.local_addr().unwrap()).unwrap();
        let (server, _) = l.accept().unwrap();
        h.send(Command::Adopt { uuid: ConnId::new(1), stream: server }).unwrap();
        next_event(&h);

        h.stop();
        assert!(matches!(
            h.events.try_recv(),
            Some(Event::Closed { reason: CloseReason::Shutdown, .. })
        ));
    }
}
