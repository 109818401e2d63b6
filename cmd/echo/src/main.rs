//! shardline echo
//!
//! Length-prefixed echo server and load client on the shardline engine.
//!
//! Usage:
//!     cargo build --release -p shardline-echo
//!     ./target/release/shardline-echo server --port 9000 --threads 4
//!     ./target/release/shardline-echo client --port 9000 --conns 64 --count 10000
//!
//! The client keeps `--conns` connections, each ping-ponging `--count`
//! messages of `--size` bytes. Dropped connections are redialed every
//! second under the same uuid. Set `RUST_LOG=debug` for per-connection logs.

use std::collections::HashMap;
use std::error::Error;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use clap::{Parser, Subcommand, ValueEnum};
use tracing::{debug, info, warn};

use shardline::{
    CloseReason, ConnId, ConnectionHandler, EngineConfig, EventLoop, Msg, OpenEvent, PollerKind,
};

static RUNNING: AtomicBool = AtomicBool::new(true);

const RECONNECT_EVERY: Duration = Duration::from_secs(1);
const STATS_EVERY: Duration = Duration::from_secs(5);

#[derive(Parser, Debug)]
#[command(name = "shardline-echo")]
#[command(about = "Length-prefixed echo server and client")]
struct Args {
    #[command(subcommand)]
    mode: Mode,

    /// I/O threads (default: SHARDLINE_IO_THREADS or CPU count)
    #[arg(short, long, global = true)]
    threads: Option<usize>,

    /// Readiness backend
    #[arg(long, global = true, value_enum)]
    poller: Option<Backend>,

    /// Largest payload in bytes
    #[arg(long, global = true)]
    max_msg: Option<usize>,
}

#[derive(Subcommand, Debug)]
enum Mode {
    /// Echo every message back to its sender
    Server {
        #[arg(short, long, default_value = "9000")]
        port: u16,
    },
    /// Ping-pong against an echo server
    Client {
        #[arg(long, default_value = "127.0.0.1")]
        host: String,

        #[arg(short, long, default_value = "9000")]
        port: u16,

        /// Concurrent connections
        #[arg(short, long, default_value = "1")]
        conns: usize,

        /// Round trips per connection
        #[arg(short = 'n', long, default_value = "1000")]
        count: u64,

        /// Payload size in bytes
        #[arg(short, long, default_value = "64")]
        size: usize,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Backend {
    Epoll,
    Select,
}

impl From<Backend> for PollerKind {
    fn from(b: Backend) -> Self {
        match b {
            Backend::Epoll => PollerKind::Epoll,
            Backend::Select => PollerKind::Select,
        }
    }
}

struct EchoServer;

impl ConnectionHandler for EchoServer {
    fn on_open(&mut self, net: &mut EventLoop, uuid: ConnId, event: OpenEvent) {
        debug!(%uuid, ?event, open = net.registry().len(), "open");
    }

    fn on_data(&mut self, net: &mut EventLoop, uuid: ConnId, msg: Msg) {
        if let Err(e) = net.send(uuid, msg) {
            warn!(%uuid, error = %e, "echo failed");
        }
    }

    fn on_close(&mut self, _net: &mut EventLoop, uuid: ConnId, reason: CloseReason) {
        debug!(%uuid, %reason, "closed");
    }
}

struct EchoClient {
    payload: Msg,
    count: u64,
    /// Round trips completed per target.
    done: HashMap<ConnId, u64>,
    finished: usize,
    round_trips: u64,
}

impl EchoClient {
    fn new(size: usize, count: u64) -> Self {
        let payload = Msg::new((0..size).map(|i| i as u8).collect());
        Self { payload, count, done: HashMap::new(), finished: 0, round_trips: 0 }
    }

    fn ping(&self, net: &mut EventLoop, uuid: ConnId) {
        if let Err(e) = net.send(uuid, Msg::copy_from(self.payload.as_bytes())) {
            warn!(%uuid, error = %e, "send failed");
        }
    }
}

impl ConnectionHandler for EchoClient {
    fn on_open(&mut self, net: &mut EventLoop, uuid: ConnId, event: OpenEvent) {
        match event {
            OpenEvent::Failed { error } => debug!(%uuid, %error, "connect failed"),
            _ => {
                debug!(%uuid, ?event, "connected");
                let done = *self.done.entry(uuid).or_insert(0);
                if done < self.count {
                    self.ping(net, uuid);
                }
            }
        }
    }

    fn on_data(&mut self, net: &mut EventLoop, uuid: ConnId, msg: Msg) {
        if msg != self.payload {
            warn!(%uuid, len = msg.len(), "echo mismatch");
        }
        self.round_trips += 1;
        let done = self.done.entry(uuid).or_insert(0);
        *done += 1;
        if *done < self.count {
            self.ping(net, uuid);
        } else {
            self.finished += 1;
            if let Err(e) = net.disconnect(uuid) {
                warn!(%uuid, error = %e, "disconnect failed");
            }
        }
    }

    fn on_close(&mut self, _net: &mut EventLoop, uuid: ConnId, reason: CloseReason) {
        debug!(%uuid, %reason, "closed");
    }
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with_thread_names(true)
        .with_target(false)
        .compact()
        .init();
}

fn main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();
    init_tracing();

    unsafe {
        libc::signal(libc::SIGINT, handle_signal as usize);
        libc::signal(libc::SIGTERM, handle_signal as usize);
    }

    let mut config = EngineConfig::from_env();
    if let Some(n) = args.threads {
        config = config.io_threads(n);
    }
    if let Some(kind) = args.poller {
        config = config.poller(kind.into());
    }
    if let Some(n) = args.max_msg {
        config = config.max_msg_size(n);
    }
    let tick = config.poll_timeout;

    let mut net = EventLoop::with_default_codec(config)?;
    let started = Instant::now();
    let mut last_stats = Instant::now();

    match args.mode {
        Mode::Server { port } => {
            let addr = net.serve_on_port(port)?;
            info!(%addr, io_threads = net.io_threads(), "echo server ready");

            let mut handler = EchoServer;
            while RUNNING.load(Ordering::Relaxed) {
                net.run_once(&mut handler, Some(tick))?;
                if last_stats.elapsed() >= STATS_EVERY {
                    info!(
                        elapsed = started.elapsed().as_secs(),
                        stats = %net.total_stats(),
                        "server"
                    );
                    last_stats = Instant::now();
                }
            }
        }
        Mode::Client { host, port, conns, count, size } => {
            for _ in 0..conns {
                net.connect_to(&host, port)?;
            }
            info!(%host, port, conns, count, size, "echo client started");

            let mut handler = EchoClient::new(size, count);
            let mut last_reconnect = Instant::now();
            while RUNNING.load(Ordering::Relaxed) && handler.finished < conns {
                net.run_once(&mut handler, Some(tick))?;
                if last_reconnect.elapsed() >= RECONNECT_EVERY {
                    net.reconnect_all();
                    last_reconnect = Instant::now();
                }
                if last_stats.elapsed() >= STATS_EVERY {
                    info!(round_trips = handler.round_trips, finished = handler.finished, "client");
                    last_stats = Instant::now();
                }
            }

            let secs = started.elapsed().as_secs_f64();
            info!(
                round_trips = handler.round_trips,
                secs,
                per_sec = handler.round_trips as f64 / secs.max(1e-9),
                "client done"
            );
        }
    }

    net.shutdown();
    info!(stats = %net.total_stats(), "bye");
    Ok(())
}

extern "C" fn handle_signal(_sig: libc::c_int) {
    RUNNING.store(false, Ordering::Relaxed);
}
