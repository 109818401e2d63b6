//! # shardline-core — Trait definitions and shared types
//!
//! This crate defines the trait boundaries for every axis of variability in
//! the shardline engine, plus the plain data types that cross them. It is
//! platform-agnostic and contains no OS calls; default implementations
//! live in `shardline-module`.
//!
//! ## Modules
//!
//! - `id` - `ConnId`, `IoThreadId`, `UuidGen`
//! - `msg` - move-only `Msg` payload
//! - `cursor` - `ByteReader` / `ByteWriter` over wire buffers
//! - `codec` - `Decoder` / `Encoder` framing traits
//! - `poller` - `Poller` readiness trait, `Interest`, `PollEvent`
//! - `notifier` - `Notifier` wake primitive trait
//! - `config` - `EngineConfig`
//! - `env` - environment variable helpers
//! - `error` - `NetError`, `CloseReason`, `ConnectError`

pub mod id;
pub mod msg;
pub mod cursor;
pub mod codec;
pub mod poller;
pub mod notifier;
pub mod config;
pub mod env;
pub mod error;

// Re-exports for convenience
pub use id::{ConnId, IoThreadId, UuidGen};
pub use msg::Msg;
pub use cursor::{ByteReader, ByteWriter, WireInt};
pub use codec::{decode_frames, Decoded, Decoder, Encoder, PrefixWidth};
pub use poller::{Interest, PollEvent, Poller, PollerKind};
pub use notifier::{Notifier, NotifierKind};
pub use config::EngineConfig;
pub use error::{CloseReason, ConnectError, NetError, Result};
