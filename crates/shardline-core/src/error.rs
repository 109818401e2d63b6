//! shardline error types.
//!
//! Errors local to an I/O thread never cross threads as panics. The reactor
//! turns them into a [`CloseReason`] or [`ConnectError`] and ships that to
//! the logic thread as an ordinary event.

use std::fmt;
use std::io;

use crate::id::ConnId;

/// Errors returned by engine, codec, poller and channel operations.
#[derive(Debug, thiserror::Error)]
pub enum NetError {
    /// Frame declares a payload larger than the configured maximum.
    /// Fatal to the connection, never to the process.
    #[error("protocol violation: declared length {declared} exceeds max {max}")]
    ProtocolViolation { declared: usize, max: usize },

    /// OS-level I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Raw OS error with errno (from libc calls).
    #[error("OS error: errno {0}")]
    Os(i32),

    /// Outbound connect did not complete.
    #[error("connect failed: {0}")]
    ConnectFailure(ConnectError),

    /// Bounded channel is full; the value was handed back to the caller.
    #[error("channel full")]
    ChannelOverflow,

    /// No live connection (or pending target) with this id.
    #[error("unknown connection {0}")]
    UnknownConnection(ConnId),

    /// fd cannot be watched by this poller backend (select: fd >= FD_SETSIZE).
    #[error("fd {0} out of range for poller")]
    FdOutOfRange(i32),

    /// fd is not registered with the poller.
    #[error("fd {0} not registered")]
    NotRegistered(i32),

    /// Configuration rejected by `validate()`.
    #[error("invalid config: {0}")]
    InvalidConfig(&'static str),

    /// Failed to spawn an I/O thread.
    #[error("failed to spawn I/O thread: {0}")]
    ThreadSpawn(io::Error),

    /// The engine (or the peer end of a channel) has shut down.
    #[error("engine shut down")]
    ShutDown,
}

impl NetError {
    /// Capture `errno` after a failed libc call.
    #[inline]
    pub fn last_os_error() -> Self {
        NetError::Os(io::Error::last_os_error().raw_os_error().unwrap_or(0))
    }
}

pub type Result<T> = std::result::Result<T, NetError>;

/// Why an outbound connect failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectError {
    /// Host name did not resolve to any address.
    Resolve,
    /// Peer actively refused (ECONNREFUSED).
    Refused,
    /// Did not complete within `connect_timeout`.
    TimedOut,
    /// Closed locally while still connecting.
    Aborted,
    /// Any other socket error.
    Io(io::ErrorKind),
}

impl fmt::Display for ConnectError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectError::Resolve => write!(f, "address did not resolve"),
            ConnectError::Refused => write!(f, "connection refused"),
            ConnectError::TimedOut => write!(f, "connect timed out"),
            ConnectError::Aborted => write!(f, "connect aborted"),
            ConnectError::Io(kind) => write!(f, "{}", kind),
        }
    }
}

impl From<&io::Error> for ConnectError {
    fn from(e: &io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::ConnectionRefused => ConnectError::Refused,
            io::ErrorKind::TimedOut => ConnectError::TimedOut,
            kind => ConnectError::Io(kind),
        }
    }
}

/// Why a connection left the `Open` state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Peer closed its end (read returned 0).
    PeerClosed,
    /// The logic thread asked for it.
    Requested,
    /// Peer sent an oversize frame.
    ProtocolViolation { declared: usize, max: usize },
    /// read/write failed.
    Io(io::ErrorKind),
    /// Poller reported error/hangup on the socket.
    Hangup,
    /// Pending send bytes exceeded `max_pending_send`.
    SendOverflow,
    /// Engine shutdown.
    Shutdown,
}

impl CloseReason {
    /// Whether the close was initiated locally.
    pub fn is_local(&self) -> bool {
        matches!(
            self,
            CloseReason::Requested | CloseReason::SendOverflow | CloseReason::Shutdown
        )
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::PeerClosed => write!(f, "closed by peer"),
            CloseReason::Requested => write!(f, "closed by request"),
            CloseReason::ProtocolViolation { declared, max } => {
                write!(f, "protocol violation ({} > {})", declared, max)
            }
            CloseReason::Io(kind) => write!(f, "I/O error: {}", kind),
            CloseReason::Hangup => write!(f, "hangup"),
            CloseReason::SendOverflow => write!(f, "send buffer overflow"),
            CloseReason::Shutdown => write!(f, "engine shutdown"),
        }
    }
}

impl From<&NetError> for CloseReason {
    fn from(e: &NetError) -> Self {
        match e {
            NetError::ProtocolViolation { declared, max } => CloseReason::ProtocolViolation {
                declared: *declared,
                max: *max,
            },
            NetError::Io(io) => CloseReason::Io(io.kind()),
            NetError::ShutDown => CloseReason::Shutdown,
            _ => CloseReason::Hangup,
        }
    }
}
