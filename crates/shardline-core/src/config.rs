//! Engine configuration
//!
//! Library defaults with runtime environment overrides.
//!
//! # Configuration Priority (highest wins)
//!
//! 1. Builder calls in code
//! 2. Environment variables (`from_env()`)
//! 3. Library defaults (`defaults` module)
//!
//! # Example
//!
//! ```rust,ignore
//! use shardline_core::config::EngineConfig;
//!
//! let config = EngineConfig::from_env()
//!     .io_threads(4)
//!     .max_msg_size(20000);
//! config.validate()?;
//! ```

use std::time::Duration;

use crate::codec::PrefixWidth;
use crate::env::{env_get, env_get_bool, env_get_opt};
use crate::error::{NetError, Result};
use crate::notifier::NotifierKind;
use crate::poller::PollerKind;

/// Library defaults.
pub mod defaults {
    use super::*;

    /// Upper bound on I/O threads
    pub const MAX_IO_THREADS: usize = 64;
    /// Largest payload accepted by the default codec
    pub const MAX_MSG_SIZE: usize = 20000;
    /// Length prefix width in bytes
    pub const PREFIX_BYTES: usize = 2;
    /// Reactor poll timeout
    pub const POLL_TIMEOUT_MS: u64 = 50;
    /// Bytes read per `read()` call
    pub const READ_CHUNK: usize = 16 * 1024;
    /// Outbound connect deadline
    pub const CONNECT_TIMEOUT_MS: u64 = 5000;
    /// How long a requested close waits for pending sends to drain
    pub const CLOSE_LINGER_MS: u64 = 5000;
    /// Pending send bytes per connection before it is dropped
    pub const MAX_PENDING_SEND: usize = 16 * 1024 * 1024;
    /// listen(2) backlog
    pub const LISTEN_BACKLOG: i32 = 1024;
    /// TCP_NODELAY on every socket
    pub const NODELAY: bool = true;

    /// Half the CPUs, at least 1, at most 8.
    pub fn io_threads() -> usize {
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(2);
        (cpus / 2).clamp(1, 8)
    }

    pub fn poller() -> PollerKind {
        if cfg!(target_os = "linux") {
            PollerKind::Epoll
        } else {
            PollerKind::Select
        }
    }

    pub fn notifier() -> NotifierKind {
        if cfg!(any(target_os = "linux", target_os = "android")) {
            NotifierKind::EventFd
        } else {
            NotifierKind::Pipe
        }
    }
}

/// Engine configuration with builder pattern.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Number of I/O (reactor) threads
    pub io_threads: usize,
    /// Largest accepted payload; bigger frames close the connection
    pub max_msg_size: usize,
    /// Wire length prefix width
    pub prefix: PrefixWidth,
    /// Poller backend for I/O threads and the logic thread
    pub poller: PollerKind,
    /// Wake primitive for cross-thread channels
    pub notifier: NotifierKind,
    /// Upper bound on one reactor wait
    pub poll_timeout: Duration,
    /// Bytes requested per read
    pub read_chunk: usize,
    /// `None` = unbounded channels; `Some(n)` = bounded, overflow is an error
    pub channel_capacity: Option<usize>,
    /// Outbound connect deadline
    pub connect_timeout: Duration,
    /// Upper bound on a requested close waiting for its send buffer to drain
    pub close_linger: Duration,
    /// Pending send bytes per connection before it is closed
    pub max_pending_send: usize,
    /// listen(2) backlog
    pub listen_backlog: i32,
    /// Set TCP_NODELAY on accepted and connected sockets
    pub nodelay: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineConfig {
    /// Library defaults, no environment lookups.
    pub fn new() -> Self {
        Self {
            io_threads: defaults::io_threads(),
            max_msg_size: defaults::MAX_MSG_SIZE,
            prefix: PrefixWidth::U16,
            poller: defaults::poller(),
            notifier: defaults::notifier(),
            poll_timeout: Duration::from_millis(defaults::POLL_TIMEOUT_MS),
            read_chunk: defaults::READ_CHUNK,
            channel_capacity: None,
            connect_timeout: Duration::from_millis(defaults::CONNECT_TIMEOUT_MS),
            close_linger: Duration::from_millis(defaults::CLOSE_LINGER_MS),
            max_pending_send: defaults::MAX_PENDING_SEND,
            listen_backlog: defaults::LISTEN_BACKLOG,
            nodelay: defaults::NODELAY,
        }
    }

    /// Defaults with environment overrides.
    ///
    /// Environment variables (all optional):
    /// - `SHARDLINE_IO_THREADS` - Number of I/O threads
    /// - `SHARDLINE_MAX_MSG_SIZE` - Largest payload in bytes
    /// - `SHARDLINE_PREFIX_BYTES` - Length prefix width (2 or 4)
    /// - `SHARDLINE_POLLER` - `epoll` or `select`
    /// - `SHARDLINE_POLL_TIMEOUT_MS` - Reactor wait bound
    /// - `SHARDLINE_READ_CHUNK` - Bytes per read
    /// - `SHARDLINE_CHANNEL_CAPACITY` - Bounded channel size (unset = unbounded)
    /// - `SHARDLINE_CONNECT_TIMEOUT_MS` - Outbound connect deadline
    /// - `SHARDLINE_CLOSE_LINGER_MS` - Requested-close drain bound
    /// - `SHARDLINE_MAX_PENDING_SEND` - Send buffer cap per connection
    /// - `SHARDLINE_BACKLOG` - listen(2) backlog
    /// - `SHARDLINE_NODELAY` - TCP_NODELAY (0/1)
    pub fn from_env() -> Self {
        let base = Self::new();
        Self {
            io_threads: env_get("SHARDLINE_IO_THREADS", base.io_threads),
            max_msg_size: env_get("SHARDLINE_MAX_MSG_SIZE", base.max_msg_size),
            prefix: env_get_opt::<usize>("SHARDLINE_PREFIX_BYTES")
                .and_then(PrefixWidth::from_bytes)
                .unwrap_or(base.prefix),
            poller: env_get_opt("SHARDLINE_POLLER").unwrap_or(base.poller),
            notifier: base.notifier,
            poll_timeout: Duration::from_millis(env_get(
                "SHARDLINE_POLL_TIMEOUT_MS",
                defaults::POLL_TIMEOUT_MS,
            )),
            read_chunk: env_get("SHARDLINE_READ_CHUNK", base.read_chunk),
            channel_capacity: env_get_opt("SHARDLINE_CHANNEL_CAPACITY"),
            connect_timeout: Duration::from_millis(env_get(
                "SHARDLINE_CONNECT_TIMEOUT_MS",
                defaults::CONNECT_TIMEOUT_MS,
            )),
            close_linger: Duration::from_millis(env_get(
                "SHARDLINE_CLOSE_LINGER_MS",
                defaults::CLOSE_LINGER_MS,
            )),
            max_pending_send: env_get("SHARDLINE_MAX_PENDING_SEND", base.max_pending_send),
            listen_backlog: env_get("SHARDLINE_BACKLOG", base.listen_backlog),
            nodelay: env_get_bool("SHARDLINE_NODELAY", base.nodelay),
        }
    }

    /// Set number of I/O threads
    pub fn io_threads(mut self, n: usize) -> Self {
        self.io_threads = n;
        self
    }

    /// Set largest accepted payload
    pub fn max_msg_size(mut self, n: usize) -> Self {
        self.max_msg_size = n;
        self
    }

    /// Set wire length prefix width
    pub fn prefix(mut self, width: PrefixWidth) -> Self {
        self.prefix = width;
        self
    }

    /// Set poller backend
    pub fn poller(mut self, kind: PollerKind) -> Self {
        self.poller = kind;
        self
    }

    /// Set wake primitive
    pub fn notifier(mut self, kind: NotifierKind) -> Self {
        self.notifier = kind;
        self
    }

    /// Set reactor poll timeout
    pub fn poll_timeout(mut self, d: Duration) -> Self {
        self.poll_timeout = d;
        self
    }

    /// Set read chunk size
    pub fn read_chunk(mut self, n: usize) -> Self {
        self.read_chunk = n;
        self
    }

    /// Bound every cross-thread channel to `n` entries
    pub fn channel_capacity(mut self, n: Option<usize>) -> Self {
        self.channel_capacity = n;
        self
    }

    /// Set outbound connect deadline
    pub fn connect_timeout(mut self, d: Duration) -> Self {
        self.connect_timeout = d;
        self
    }

    /// Set how long a requested close may wait for pending sends
    pub fn close_linger(mut self, d: Duration) -> Self {
        self.close_linger = d;
        self
    }

    /// Set pending send cap per connection
    pub fn max_pending_send(mut self, n: usize) -> Self {
        self.max_pending_send = n;
        self
    }

    /// Set listen backlog
    pub fn listen_backlog(mut self, n: i32) -> Self {
        self.listen_backlog = n;
        self
    }

    /// Enable or disable TCP_NODELAY
    pub fn nodelay(mut self, enable: bool) -> Self {
        self.nodelay = enable;
        self
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.io_threads == 0 {
            return Err(NetError::InvalidConfig("io_threads must be at least 1"));
        }
        if self.io_threads > defaults::MAX_IO_THREADS {
            return Err(NetError::InvalidConfig("io_threads exceeds maximum"));
        }
        if self.max_msg_size > self.prefix.max_len() {
            return Err(NetError::InvalidConfig("max_msg_size does not fit the length prefix"));
        }
        if self.read_chunk == 0 {
            return Err(NetError::InvalidConfig("read_chunk must be at least 1"));
        }
        if self.channel_capacity == Some(0) {
            return Err(NetError::InvalidConfig("channel_capacity must be at least 1"));
        }
        if self.max_pending_send < self.max_msg_size + self.prefix.bytes() {
            return Err(NetError::InvalidConfig("max_pending_send smaller than one frame"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let c = EngineConfig::new();
        assert!(c.validate().is_ok());
        assert_eq!(c.max_msg_size, 20000);
        assert_eq!(c.prefix, PrefixWidth::U16);
        assert!(c.channel_capacity.is_none());
    }

    #[test]
    fn test_validate_rejects() {
        assert!(EngineConfig::new().io_threads(0).validate().is_err());
        assert!(EngineConfig::new().io_threads(65).validate().is_err());
        assert!(EngineConfig::new().max_msg_size(70000).validate().is_err());
        assert!(EngineConfig::new()
            .prefix(PrefixWidth::U32)
            .max_msg_size(70000)
            .validate()
            .is_ok());
        assert!(EngineConfig::new().channel_capacity(Some(0)).validate().is_err());
        assert!(EngineConfig::new().max_pending_send(10).validate().is_err());
    }

    #[test]
    fn test_from_env_overrides() {
        std::env::set_var("SHARDLINE_PREFIX_BYTES", "4");
        std::env::set_var("SHARDLINE_POLLER", "select");
        std::env::set_var("SHARDLINE_CLOSE_LINGER_MS", "250");
        let c = EngineConfig::from_env();
        assert_eq!(c.prefix, PrefixWidth::U32);
        assert_eq!(c.poller, PollerKind::Select);
        assert_eq!(c.close_linger, Duration::from_millis(250));
        std::env::remove_var("SHARDLINE_PREFIX_BYTES");
        std::env::remove_var("SHARDLINE_POLLER");
        std::env::remove_var("SHARDLINE_CLOSE_LINGER_MS");
    }
}
