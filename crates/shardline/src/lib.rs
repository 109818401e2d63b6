//! # shardline — Sharded reactor network engine
//!
//! A fixed pool of I/O threads owns every socket. Each one runs a
//! readiness reactor (epoll or select), frames bytes into `Msg`s with a
//! length-prefix codec, and talks to a single logic thread over lock-free
//! queues paired with a wake fd. Application code lives entirely on the
//! logic thread and never touches a socket.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │          Application (ConnectionHandler)                 │
//! │   on_open / on_data / on_close                           │
//! │   net.send(uuid, msg)  net.connect_to(host, port)        │
//! └──────────────────┬──────────────────────────────────────┘
//!                    │ &mut EventLoop
//!                    ▼
//! ┌─────────────────────────────────────────────────────────┐
//! │         EventLoop (logic thread)                         │
//! │   listeners → accept → round-robin Adopt                 │
//! │   ConnectionRegistry: live connections + dial targets    │
//! │   drain(): Event queues → registry → handler             │
//! └──────────────────┬──────────────────────────────────────┘
//!                    │ Command ▼   ▲ Event   (notify_channel)
//! ┌──────────────────▼──────────────────────────────────────┐
//! │         I/O threads (shardline-io-N)                     │
//! │   Poller → read → Decoder → Event::Data                  │
//! │   Command::Send → Encoder → write, spill on EAGAIN       │
//! │   non-blocking connect, connect deadline, close reasons  │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```ignore
//! use shardline::{ConnectionHandler, EngineConfig, EventLoop, Msg, ConnId, OpenEvent};
//!
//! struct Echo;
//!
//! impl ConnectionHandler for Echo {
//!     fn on_open(&mut self, _net: &mut EventLoop, _uuid: ConnId, _ev: OpenEvent) {}
//!
//!     fn on_data(&mut self, net: &mut EventLoop, uuid: ConnId, msg: Msg) {
//!         let _ = net.send(uuid, msg);
//!     }
//! }
//!
//! fn main() -> shardline::Result<()> {
//!     let mut net = EventLoop::with_default_codec(EngineConfig::from_env())?;
//!     net.serve_on_port(9000)?;
//!     loop {
//!         net.run_once(&mut Echo, None)?;
//!     }
//! }
//! ```
//!
//! ## Design Decisions
//!
//! - **One owner per socket**: a connection lives on one I/O thread for its
//!   whole life, so its messages stay ordered in both directions
//! - **Uuids, not fds**: the application addresses connections by `ConnId`;
//!   a reconnected target keeps its uuid
//! - **Weak attachments**: the registry holds application objects weakly
//! - **No lost events**: a full event queue spills locally, in order, and is
//!   retried every reactor tick

pub mod connection;
pub mod event_loop;
pub mod handler;
pub mod io_thread;
pub mod registry;
pub mod socket;
pub mod stats;

pub use event_loop::EventLoop;
pub use handler::{ConnectionHandler, OpenEvent};
pub use io_thread::{Command, Event};
pub use registry::{ConnectTarget, ConnectionInfo, ConnectionRegistry};
pub use stats::IoStatsSnapshot;

pub use shardline_core::{
    CloseReason, ConnId, ConnectError, Decoder, Encoder, EngineConfig, IoThreadId, Msg,
    NetError, NotifierKind, PollerKind, PrefixWidth, Result,
};
pub use shardline_module::LengthPrefixCodec;
