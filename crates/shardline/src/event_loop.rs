//! `EventLoop` — the logic thread's handle on the engine.
//!
//! Owns the I/O thread pool, the listening sockets, the connection registry
//! and the uuid allocator. Everything here runs on the one logic thread;
//! the only cross-thread traffic is `Command`s out and `Event`s back.
//!
//! ```text
//!            logic thread                       I/O threads
//!   ┌──────────────────────────┐      ┌──────────────────────────────┐
//!   │ run_once()               │ Cmd  │ shardline-io-0               │
//!   │   poll(listeners, wakes) │ ───► │   poll(sockets, wake)        │
//!   │   accept → Adopt (rr)    │      │   read → decode → Event      │
//!   │   drain → handler        │ ◄─── │   Command → encode → write   │
//!   │ send / close / connect   │ Evt  │ shardline-io-1 ...           │
//!   └──────────────────────────┘      └──────────────────────────────┘
//! ```

use std::io;
use std::net::{SocketAddr, TcpListener};
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use shardline_core::codec::{Decoder, Encoder};
use shardline_core::config::EngineConfig;
use shardline_core::error::{NetError, Result};
use shardline_core::id::{ConnId, IoThreadId, UuidGen};
use shardline_core::msg::Msg;
use shardline_core::poller::{Interest, PollEvent, Poller};
use shardline_module::{new_poller, LengthPrefixCodec};

use crate::handler::{ConnectionHandler, OpenEvent};
use crate::io_thread::{Command, Event, IoThreadHandle};
use crate::registry::{ConnectTarget, ConnectionRegistry};
use crate::socket;
use crate::stats::IoStatsSnapshot;

pub struct EventLoop {
    config: EngineConfig,
    encoder: Arc<dyn Encoder>,
    threads: Vec<IoThreadHandle>,
    registry: ConnectionRegistry,
    uuids: UuidGen,
    /// Listeners plus every I/O thread's event wake fd.
    poller: Box<dyn Poller>,
    listeners: Vec<TcpListener>,
    next_shard: usize,
    shutdown: Arc<AtomicBool>,
    ready: Vec<PollEvent>,
    scratch: Vec<Event>,
    /// Engine-initiated closes that met a full command queue.
    pending_closes: Vec<(IoThreadId, ConnId)>,
    stopped: bool,
}

impl EventLoop {
    /// Validate `config` and start `config.io_threads` I/O threads.
    pub fn new(
        config: EngineConfig,
        decoder: Arc<dyn Decoder>,
        encoder: Arc<dyn Encoder>,
    ) -> Result<Self> {
        config.validate()?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let mut poller = new_poller(config.poller)?;
        let mut threads = Vec::with_capacity(config.io_threads);
        for n in 0..config.io_threads {
            let handle = IoThreadHandle::spawn(
                IoThreadId::new(n),
                &config,
                Arc::clone(&decoder),
                Arc::clone(&encoder),
                Arc::clone(&shutdown),
            )?;
            poller.register(handle.events.wake_fd(), Interest::READABLE)?;
            threads.push(handle);
        }

        info!(
            io_threads = config.io_threads,
            poller = poller.name(),
            max_msg_size = decoder.max_msg_size(),
            "engine started"
        );

        Ok(Self {
            config,
            encoder,
            threads,
            registry: ConnectionRegistry::new(),
            uuids: UuidGen::new(),
            poller,
            listeners: Vec::new(),
            next_shard: 0,
            shutdown,
            ready: Vec::with_capacity(64),
            scratch: Vec::with_capacity(256),
            pending_closes: Vec::new(),
            stopped: false,
        })
    }

    /// Engine with a `LengthPrefixCodec` built from `config.prefix` and
    /// `config.max_msg_size`.
    pub fn with_default_codec(config: EngineConfig) -> Result<Self> {
        let codec = Arc::new(LengthPrefixCodec::new(config.prefix, config.max_msg_size));
        EventLoop::new(config, codec.clone(), codec)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Number of I/O threads.
    pub fn io_threads(&self) -> usize {
        self.threads.len()
    }

    pub fn registry(&self) -> &ConnectionRegistry {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut ConnectionRegistry {
        &mut self.registry
    }

    /// Per-thread counters.
    pub fn stats(&self) -> Vec<IoStatsSnapshot> {
        self.threads.iter().map(|t| t.stats()).collect()
    }

    /// Counters summed over all threads.
    pub fn total_stats(&self) -> IoStatsSnapshot {
        self.stats()
            .iter()
            .fold(IoStatsSnapshot::default(), |acc, s| acc.merge(s))
    }

    fn ensure_running(&self) -> Result<()> {
        if self.stopped {
            return Err(NetError::ShutDown);
        }
        Ok(())
    }

    fn pick_shard(&mut self) -> IoThreadId {
        let tid = IoThreadId::new(self.next_shard % self.threads.len());
        self.next_shard = self.next_shard.wrapping_add(1);
        tid
    }

    fn thread(&self, tid: IoThreadId) -> Result<&IoThreadHandle> {
        self.threads.get(tid.as_usize()).ok_or(NetError::ShutDown)
    }

    /// Listen on `0.0.0.0:port`. Port 0 picks a free port; the bound
    /// address is returned.
    pub fn serve_on_port(&mut self, port: u16) -> Result<SocketAddr> {
        self.ensure_running()?;
        let listener = socket::listen(port, self.config.listen_backlog)?;
        let addr = listener.local_addr()?;
        self.poller.register(listener.as_raw_fd(), Interest::READABLE)?;
        info!(%addr, "listening");
        self.listeners.push(listener);
        Ok(addr)
    }

    /// Dial `host:port`. The uuid is returned immediately; the outcome
    /// arrives as `on_open(Connected | Failed)`.
    pub fn connect_to(&mut self, host: &str, port: u16) -> Result<ConnId> {
        self.connect_to_tagged(host, port, 0)
    }

    /// `connect_to` with a user tag copied into the connection's registry
    /// entry.
    pub fn connect_to_tagged(&mut self, host: &str, port: u16, tag: u64) -> Result<ConnId> {
        self.ensure_running()?;
        let uuid = self.uuids.next_id();
        let tid = self.pick_shard();

        let mut target = ConnectTarget::new(uuid, host, port, tid).with_tag(tag);
        target.attempting = true;
        self.registry.add_target(target);

        let cmd = Command::ConnectTo { uuid, host: host.to_string(), port };
        if let Err(e) = self.thread(tid).and_then(|t| t.send(cmd)) {
            self.registry.remove_target(uuid);
            return Err(e);
        }
        info!(%uuid, host, port, io_thread = %tid, "connecting");
        Ok(uuid)
    }

    /// Queue `msg` for an open connection.
    pub fn send(&self, uuid: ConnId, msg: Msg) -> Result<()> {
        let info = self
            .registry
            .find(uuid)
            .ok_or(NetError::UnknownConnection(uuid))?;
        let max = self.encoder.max_msg_size();
        if msg.len() > max {
            return Err(NetError::ProtocolViolation { declared: msg.len(), max });
        }
        self.thread(info.io_thread)?.send(Command::Send { uuid, msg })
    }

    /// Close a connection, or abort a connect in flight. Pending sends are
    /// flushed first; a close with output still queued lingers until it
    /// drains or `close_linger` runs out. `on_close(Requested)` follows once
    /// the I/O thread has torn it down. An aborted connect reports
    /// `on_open(Failed { error: Aborted })` instead, and the target stays
    /// dialable.
    pub fn close(&self, uuid: ConnId) -> Result<()> {
        if let Some(info) = self.registry.find(uuid) {
            return self.thread(info.io_thread)?.send(Command::Close(uuid));
        }
        match self.registry.find_target(uuid) {
            Some(t) if t.attempting => self.thread(t.io_thread)?.send(Command::Close(uuid)),
            _ => Err(NetError::UnknownConnection(uuid)),
        }
    }

    /// Close and forget an outbound target so it is never dialed again.
    pub fn disconnect(&mut self, uuid: ConnId) -> Result<()> {
        let target = self.registry.remove_target(uuid);
        let owner = match (self.registry.find(uuid), &target) {
            (Some(info), _) => Some(info.io_thread),
            (None, Some(t)) if t.attempting => Some(t.io_thread),
            (None, Some(_)) => None,
            (None, None) => return Err(NetError::UnknownConnection(uuid)),
        };
        if let Some(tid) = owner {
            self.close_later(tid, uuid);
        }
        debug!(%uuid, "target forgotten");
        Ok(())
    }

    /// Dial every target that is neither connected nor being dialed, each
    /// under its original uuid and on its original I/O thread. Returns the
    /// number of attempts started. Meant to be called from a periodic timer.
    pub fn reconnect_all(&mut self) -> usize {
        if self.stopped {
            return 0;
        }
        let pending: Vec<(ConnId, String, u16, IoThreadId)> = self
            .registry
            .pending_targets()
            .map(|t| (t.uuid, t.host.clone(), t.port, t.io_thread))
            .collect();

        let mut started = 0;
        for (uuid, host, port, tid) in pending {
            let cmd = Command::ConnectTo { uuid, host, port };
            match self.thread(tid).and_then(|t| t.send(cmd)) {
                Ok(()) => {
                    if let Some(t) = self.registry.find_target_mut(uuid) {
                        t.attempting = true;
                    }
                    started += 1;
                }
                Err(e) => warn!(%uuid, error = %e, "reconnect not queued"),
            }
        }
        if started > 0 {
            debug!(started, "reconnecting");
        }
        started
    }

    /// Wait up to `timeout` for listener or I/O thread activity, accept
    /// pending connections, then `drain`. Returns the number of events
    /// dispatched.
    pub fn run_once<H>(&mut self, handler: &mut H, timeout: Option<Duration>) -> Result<usize>
    where
        H: ConnectionHandler + ?Sized,
    {
        self.ensure_running()?;
        self.retry_pending_closes();

        let mut ready = std::mem::take(&mut self.ready);
        let polled = self.poller.poll(&mut ready, timeout);
        if polled.is_ok() {
            for ev in &ready {
                if let Some(idx) = self.listeners.iter().position(|l| l.as_raw_fd() == ev.fd) {
                    self.accept_pending(idx);
                }
            }
        }
        self.ready = ready;
        polled?;

        Ok(self.drain(handler))
    }

    fn accept_pending(&mut self, idx: usize) {
        loop {
            let accepted = self.listeners[idx].accept();
            match accepted {
                Ok((stream, peer)) => {
                    let uuid = self.uuids.next_id();
                    let tid = self.pick_shard();
                    debug!(%uuid, %peer, io_thread = %tid, "accepted");
                    if let Err(e) = self.thread(tid).and_then(|t| t.send(Command::Adopt { uuid, stream })) {
                        warn!(%uuid, %peer, error = %e, "accepted socket dropped");
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    break;
                }
            }
        }
    }

    /// Pull every pending event from every I/O thread, update the registry
    /// and invoke `handler`. Events from one thread keep their order; there
    /// is no order across threads. Returns the number of events.
    pub fn drain<H>(&mut self, handler: &mut H) -> usize
    where
        H: ConnectionHandler + ?Sized,
    {
        let mut batch = std::mem::take(&mut self.scratch);
        for t in &self.threads {
            if let Err(e) = t.events.clear_wake() {
                warn!(io_thread = %t.tid, error = %e, "clearing wake fd failed");
            }
            while let Some(ev) = t.events.try_recv() {
                batch.push(ev);
            }
        }

        let n = batch.len();
        for ev in batch.drain(..) {
            self.dispatch(handler, ev);
        }
        self.scratch = batch;
        n
    }

    fn dispatch<H>(&mut self, handler: &mut H, ev: Event)
    where
        H: ConnectionHandler + ?Sized,
    {
        match ev {
            Event::Opened { uuid, tid, peer, outbound } => {
                if outbound && self.registry.find_target(uuid).is_none() {
                    // disconnect() while the connect was in flight
                    self.close_later(tid, uuid);
                    return;
                }
                self.registry.add(uuid, tid, peer.to_string(), outbound);
                let open = if outbound {
                    OpenEvent::Connected { peer }
                } else {
                    OpenEvent::Accepted { peer }
                };
                handler.on_open(self, uuid, open);
            }
            Event::ConnectFailed { uuid, error } => {
                if self.registry.mark_connected(uuid, false) {
                    handler.on_open(self, uuid, OpenEvent::Failed { error });
                }
            }
            Event::Data { uuid, msg } => {
                if self.registry.contains(uuid) {
                    handler.on_data(self, uuid, msg);
                }
            }
            Event::Closed { uuid, reason } => {
                if self.registry.remove(uuid).is_some() {
                    handler.on_close(self, uuid, reason);
                }
            }
        }
    }

    /// Queue `Close(uuid)`; if the command queue is full, keep it and try
    /// again on the next `run_once`.
    fn close_later(&mut self, tid: IoThreadId, uuid: ConnId) {
        match self.thread(tid).and_then(|t| t.send(Command::Close(uuid))) {
            Ok(()) => {}
            Err(NetError::ChannelOverflow) => {
                debug!(%uuid, io_thread = %tid, "command queue full, close deferred");
                self.pending_closes.push((tid, uuid));
            }
            Err(e) => warn!(%uuid, io_thread = %tid, error = %e, "close not queued"),
        }
    }

    fn retry_pending_closes(&mut self) {
        if self.pending_closes.is_empty() {
            return;
        }
        for (tid, uuid) in std::mem::take(&mut self.pending_closes) {
            self.close_later(tid, uuid);
        }
    }

    /// Stop every I/O thread and close all sockets. Idempotent; also runs
    /// on drop.
    pub fn shutdown(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;
        info!(connections = self.registry.len(), "engine shutting down");

        self.shutdown.store(true, Ordering::Release);
        for t in &mut self.threads {
            t.stop();
        }
        for l in self.listeners.drain(..) {
            let _ = self.poller.unregister(l.as_raw_fd());
        }
        self.registry.clear();
        self.pending_closes.clear();
        info!("engine stopped");
    }

    pub fn is_shut_down(&self) -> bool {
        self.stopped
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shardline_core::error::{CloseReason, ConnectError};
    use shardline_core::notifier::NotifierKind;
    use shardline_core::poller::PollerKind;
    use std::io::{Read, Write};
    use std::net::TcpStream;
    use std::thread;
    use std::time::Instant;

    const MAX: usize = 1000;

    fn test_config(threads: usize) -> EngineConfig {
        EngineConfig::new()
            .io_threads(threads)
            .max_msg_size(MAX)
            .poll_timeout(Duration::from_millis(10))
            .connect_timeout(Duration::from_secs(2))
    }

    fn frame(payload: &[u8]) -> Vec<u8> {
        let mut v = (payload.len() as u16).to_le_bytes().to_vec();
        v.extend_from_slice(payload);
        v
    }

    fn read_frame(s: &mut TcpStream) -> Vec<u8> {
        let mut len = [0u8; 2];
        s.read_exact(&mut len).unwrap();
        let mut payload = vec![0u8; u16::from_le_bytes(len) as usize];
        s.read_exact(&mut payload).unwrap();
        payload
    }

    fn free_port() -> u16 {
        let l = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        l.local_addr().unwrap().port()
    }

    #[derive(Default)]
    struct Recorder {
        echo: bool,
        opened: Vec<(ConnId, OpenEvent)>,
        data: Vec<(ConnId, Vec<u8>)>,
        closed: Vec<(ConnId, CloseReason)>,
    }

    impl Recorder {
        fn echo() -> Self {
            Self { echo: true, ..Default::default() }
        }

        fn connected(&self, uuid: ConnId) -> bool {
            self.opened
                .iter()
                .any(|(u, e)| *u == uuid && matches!(e, OpenEvent::Connected { .. }))
        }
    }

    impl ConnectionHandler for Recorder {
        fn on_open(&mut self, _net: &mut EventLoop, uuid: ConnId, event: OpenEvent) {
            self.opened.push((uuid, event));
        }

        fn on_data(&mut self, net: &mut EventLoop, uuid: ConnId, msg: Msg) {
            self.data.push((uuid, msg.as_bytes().to_vec()));
            if self.echo {
                net.send(uuid, msg).unwrap();
            }
        }

        fn on_close(&mut self, _net: &mut EventLoop, uuid: ConnId, reason: CloseReason) {
            self.closed.push((uuid, reason));
        }
    }

    fn pump_until<F>(net: &mut EventLoop, h: &mut Recorder, mut done: F)
    where
        F: FnMut(&EventLoop, &Recorder) -> bool,
    {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !done(net, h) {
            assert!(Instant::now() < deadline, "timed out pumping event loop");
            net.run_once(h, Some(Duration::from_millis(10))).unwrap();
        }
    }

    fn pump_pair<F>(a: &mut EventLoop, ha: &mut Recorder, b: &mut EventLoop, hb: &mut Recorder, mut done: F)
    where
        F: FnMut(&Recorder, &Recorder) -> bool,
    {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !done(ha, hb) {
            assert!(Instant::now() < deadline, "timed out pumping event loops");
            a.run_once(ha, Some(Duration::from_millis(5))).unwrap();
            b.run_once(hb, Some(Duration::from_millis(5))).unwrap();
        }
    }

    #[test]
    fn test_echo_round_trip_and_oversize() {
        let mut server = EventLoop::with_default_codec(test_config(1)).unwrap();
        let port = server.serve_on_port(0).unwrap().port();
        let mut h = Recorder::echo();

        let client = thread::spawn(move || {
            let mut s = TcpStream::connect(("127.0.0.1", port)).unwrap();
            for len in [0usize, 1, MAX] {
                let payload: Vec<u8> = (0..len).map(|i| i as u8).collect();
                s.write_all(&frame(&payload)).unwrap();
                assert_eq!(read_frame(&mut s), payload, "len {}", len);
            }

            // One byte over the limit: the server drops the connection.
            let mut bad = ((MAX + 1) as u16).to_le_bytes().to_vec();
            bad.extend(vec![0u8; MAX + 1]);
            let _ = s.write_all(&bad);
            let mut buf = [0u8; 16];
            match s.read(&mut buf) {
                Ok(0) | Err(_) => {}
                Ok(n) => panic!("expected close, read {} bytes", n),
            }
        });

        pump_until(&mut server, &mut h, |_, h| !h.closed.is_empty());
        client.join().unwrap();

        assert_eq!(h.opened.len(), 1);
        assert!(matches!(h.opened[0].1, OpenEvent::Accepted { .. }));
        let lens: Vec<usize> = h.data.iter().map(|(_, d)| d.len()).collect();
        assert_eq!(lens, vec![0, 1, MAX]);
        assert_eq!(
            h.closed[0].1,
            CloseReason::ProtocolViolation { declared: MAX + 1, max: MAX }
        );
        assert!(server.registry().is_empty());
        assert_eq!(server.total_stats().protocol_errors, 1);
    }

    #[test]
    fn test_reconnect_keeps_uuid() {
        let port = free_port();
        let mut client = EventLoop::with_default_codec(test_config(1)).unwrap();
        let mut hc = Recorder::default();

        // Nothing listening yet.
        let uuid = client.connect_to("127.0.0.1", port).unwrap();
        pump_until(&mut client, &mut hc, |_, h| !h.opened.is_empty());
        assert_eq!(
            hc.opened[0],
            (uuid, OpenEvent::Failed { error: ConnectError::Refused })
        );
        assert!(client.registry().find_target(uuid).unwrap().is_idle());
        assert!(client.registry().find(uuid).is_none());

        // Still unreachable: the retry fails again under the same uuid.
        assert_eq!(client.reconnect_all(), 1);
        pump_until(&mut client, &mut hc, |_, h| h.opened.len() == 2);
        let refused = (uuid, OpenEvent::Failed { error: ConnectError::Refused });
        assert_eq!(hc.opened, vec![refused, refused]);
        assert!(client.registry().find_target(uuid).unwrap().is_idle());

        let mut server = EventLoop::with_default_codec(test_config(1)).unwrap();
        server.serve_on_port(port).unwrap();
        let mut hs = Recorder::echo();

        assert_eq!(client.reconnect_all(), 1);
        // Attempt in flight: nothing more to dial.
        assert_eq!(client.reconnect_all(), 0);

        pump_pair(&mut client, &mut hc, &mut server, &mut hs, |hc, _| hc.connected(uuid));
        let info = client.registry().find(uuid).unwrap();
        assert!(info.outbound);
        assert!(client.registry().find_target(uuid).unwrap().connected);

        client.send(uuid, Msg::from("ping")).unwrap();
        pump_pair(&mut client, &mut hc, &mut server, &mut hs, |hc, _| !hc.data.is_empty());
        assert_eq!(hc.data[0], (uuid, b"ping".to_vec()));

        // Server drops it; the client target becomes dialable again.
        let server_side = hs.opened[0].0;
        server.close(server_side).unwrap();
        pump_pair(&mut client, &mut hc, &mut server, &mut hs, |hc, _| !hc.closed.is_empty());
        assert_eq!(hc.closed[0], (uuid, CloseReason::PeerClosed));

        assert_eq!(client.reconnect_all(), 1);
        pump_pair(&mut client, &mut hc, &mut server, &mut hs, |hc, _| {
            hc.opened.iter().filter(|(u, e)| *u == uuid && !e.is_failed()).count() == 2
        });
        assert!(client.registry().contains(uuid));
    }

    #[test]
    fn test_two_shards_deliver_concurrently() {
        const N: u32 = 300;
        let mut server = EventLoop::with_default_codec(test_config(2)).unwrap();
        let port = server.serve_on_port(0).unwrap().port();
        let mut h = Recorder::echo();

        let a = TcpStream::connect(("127.0.0.1", port)).unwrap();
        pump_until(&mut server, &mut h, |_, h| h.opened.len() == 1);
        let b = TcpStream::connect(("127.0.0.1", port)).unwrap();
        pump_until(&mut server, &mut h, |_, h| h.opened.len() == 2);

        let (ua, ub) = (h.opened[0].0, h.opened[1].0);
        let ta = server.registry().find(ua).unwrap().io_thread;
        let tb = server.registry().find(ub).unwrap().io_thread;
        assert_ne!(ta, tb, "round-robin puts the two connections on different shards");

        let run = |mut s: TcpStream| {
            thread::spawn(move || {
                for i in 0..N {
                    s.write_all(&frame(&i.to_le_bytes())).unwrap();
                }
                for i in 0..N {
                    assert_eq!(read_frame(&mut s), i.to_le_bytes().to_vec());
                }
            })
        };
        let (ja, jb) = (run(a), run(b));

        pump_until(&mut server, &mut h, |_, h| h.data.len() == 2 * N as usize);
        ja.join().unwrap();
        jb.join().unwrap();

        for uuid in [ua, ub] {
            let seq: Vec<u32> = h
                .data
                .iter()
                .filter(|(u, _)| *u == uuid)
                .map(|(_, d)| u32::from_le_bytes([d[0], d[1], d[2], d[3]]))
                .collect();
            assert_eq!(seq, (0..N).collect::<Vec<_>>());
        }
        let stats = server.stats();
        assert_eq!(stats.len(), 2);
        assert!(stats.iter().all(|s| s.frames_in == N as u64));
    }

    #[test]
    fn test_send_errors_and_requested_close() {
        let mut server = EventLoop::with_default_codec(test_config(1)).unwrap();
        let port = server.serve_on_port(0).unwrap().port();
        let mut h = Recorder::default();

        assert!(matches!(
            server.send(ConnId::new(999), Msg::from("x")),
            Err(NetError::UnknownConnection(_))
        ));

        let mut s = TcpStream::connect(("127.0.0.1", port)).unwrap();
        pump_until(&mut server, &mut h, |_, h| !h.opened.is_empty());
        let uuid = h.opened[0].0;

        assert!(matches!(
            server.send(uuid, Msg::new(vec![0; MAX + 1])),
            Err(NetError::ProtocolViolation { .. })
        ));

        server.send(uuid, Msg::from("last")).unwrap();
        server.close(uuid).unwrap();
        pump_until(&mut server, &mut h, |_, h| !h.closed.is_empty());
        assert_eq!(h.closed[0], (uuid, CloseReason::Requested));

        let mut got = Vec::new();
        s.read_to_end(&mut got).unwrap();
        assert_eq!(got, frame(b"last"));

        assert!(matches!(server.close(uuid), Err(NetError::UnknownConnection(_))));
    }

    #[test]
    fn test_close_aborts_connect_in_flight() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let mut client = EventLoop::with_default_codec(test_config(1)).unwrap();
        let mut h = Recorder::default();

        let uuid = client.connect_to("127.0.0.1", port).unwrap();
        client.close(uuid).unwrap();
        pump_until(&mut client, &mut h, |_, h| {
            h.opened.iter().any(|(_, e)| e.is_failed()) || !h.closed.is_empty()
        });

        // Either the close beat the handshake or it closed the fresh socket.
        match &h.opened[0] {
            (u, OpenEvent::Failed { error }) => {
                assert_eq!(*u, uuid);
                assert_eq!(*error, ConnectError::Aborted);
                assert!(h.closed.is_empty());
            }
            (u, OpenEvent::Connected { .. }) => {
                assert_eq!(*u, uuid);
                assert_eq!(h.closed, vec![(uuid, CloseReason::Requested)]);
            }
            other => panic!("unexpected open event {:?}", other),
        }
        assert!(client.registry().find(uuid).is_none());
        assert!(client.registry().find_target(uuid).unwrap().is_idle());
        assert!(matches!(client.close(uuid), Err(NetError::UnknownConnection(_))));
    }

    #[test]
    fn test_deferred_close_is_retried() {
        let config = test_config(1).channel_capacity(Some(1));
        let mut server = EventLoop::with_default_codec(config).unwrap();
        let port = server.serve_on_port(0).unwrap().port();
        let mut h = Recorder::default();

        let mut s = TcpStream::connect(("127.0.0.1", port)).unwrap();
        pump_until(&mut server, &mut h, |_, h| !h.opened.is_empty());
        let uuid = h.opened[0].0;
        let tid = server.registry().find(uuid).unwrap().io_thread;

        // As left behind by a close that met a full command queue.
        server.pending_closes.push((tid, uuid));
        pump_until(&mut server, &mut h, |_, h| !h.closed.is_empty());
        assert!(server.pending_closes.is_empty());
        assert_eq!(h.closed, vec![(uuid, CloseReason::Requested)]);

        let mut got = Vec::new();
        s.read_to_end(&mut got).unwrap();
        assert!(got.is_empty());
    }

    #[test]
    fn test_disconnect_forgets_target() {
        let port = free_port();
        let mut client = EventLoop::with_default_codec(test_config(1)).unwrap();
        let mut h = Recorder::default();

        let uuid = client.connect_to_tagged("127.0.0.1", port, 77).unwrap();
        assert_eq!(client.registry().find_target(uuid).unwrap().tag, 77);
        pump_until(&mut client, &mut h, |_, h| !h.opened.is_empty());

        client.disconnect(uuid).unwrap();
        assert_eq!(client.reconnect_all(), 0);
        assert!(matches!(client.disconnect(uuid), Err(NetError::UnknownConnection(_))));
    }

    #[test]
    fn test_select_and_pipe_backends() {
        let config = test_config(1)
            .poller(PollerKind::Select)
            .notifier(NotifierKind::Pipe);
        let mut server = EventLoop::with_default_codec(config).unwrap();
        let port = server.serve_on_port(0).unwrap().port();
        let mut h = Recorder::echo();

        let client = thread::spawn(move || {
            let mut s = TcpStream::connect(("127.0.0.1", port)).unwrap();
            s.write_all(&frame(b"portable")).unwrap();
            read_frame(&mut s)
        });

        pump_until(&mut server, &mut h, |_, h| !h.data.is_empty());
        assert_eq!(client.join().unwrap(), b"portable".to_vec());
    }

    #[test]
    fn test_bounded_channels_lose_nothing() {
        const N: usize = 200;
        let config = test_config(1).channel_capacity(Some(4));
        let mut server = EventLoop::with_default_codec(config).unwrap();
        let port = server.serve_on_port(0).unwrap().port();
        let mut h = Recorder::default();

        let mut s = TcpStream::connect(("127.0.0.1", port)).unwrap();
        let mut burst = Vec::new();
        for i in 0..N {
            burst.extend(frame(&[(i % 256) as u8]));
        }
        s.write_all(&burst).unwrap();

        pump_until(&mut server, &mut h, |_, h| h.data.len() == N);
        let got: Vec<u8> = h.data.iter().map(|(_, d)| d[0]).collect();
        let want: Vec<u8> = (0..N).map(|i| (i % 256) as u8).collect();
        assert_eq!(got, want);
    }

    #[derive(Debug)]
    struct Session {
        name: &'static str,
    }

    #[test]
    fn test_attached_object_dies_with_connection() {
        let mut server = EventLoop::with_default_codec(test_config(1)).unwrap();
        let port = server.serve_on_port(0).unwrap().port();
        let mut h = Recorder::default();

        let s = TcpStream::connect(("127.0.0.1", port)).unwrap();
        pump_until(&mut server, &mut h, |_, h| !h.opened.is_empty());
        let uuid = h.opened[0].0;

        let session = Arc::new(Session { name: "lobby" });
        server.registry_mut().attach(uuid, &session).unwrap();
        assert_eq!(server.registry().attached::<Session>(uuid).unwrap().name, "lobby");

        drop(s);
        pump_until(&mut server, &mut h, |_, h| !h.closed.is_empty());
        assert!(server.registry().attached::<Session>(uuid).is_none());
        // The registry never owned it.
        assert_eq!(Arc::strong_count(&session), 1);
    }

    #[test]
    fn test_shutdown_is_idempotent() {
        let mut net = EventLoop::with_default_codec(test_config(2)).unwrap();
        assert_eq!(net.io_threads(), 2);
        net.serve_on_port(0).unwrap();

        net.shutdown();
        net.shutdown();
        assert!(net.is_shut_down());
        assert!(matches!(net.connect_to("127.0.0.1", 1), Err(NetError::ShutDown)));
        assert!(matches!(net.serve_on_port(0), Err(NetError::ShutDown)));
        assert_eq!(net.reconnect_all(), 0);
    }

    #[test]
    fn test_invalid_config_rejected() {
        assert!(matches!(
            EventLoop::with_default_codec(EngineConfig::new().io_threads(0)),
            Err(NetError::InvalidConfig(_))
        ));
    }
}
