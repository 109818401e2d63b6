//! Application callbacks.

use std::net::SocketAddr;

use shardline_core::error::{CloseReason, ConnectError};
use shardline_core::id::ConnId;
use shardline_core::msg::Msg;

use crate::event_loop::EventLoop;

/// How a connection came to be, or why it did not.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenEvent {
    /// Inbound connection on a listening port.
    Accepted { peer: SocketAddr },
    /// Outbound `connect_to` succeeded.
    Connected { peer: SocketAddr },
    /// Outbound `connect_to` failed. The target stays registered and
    /// `reconnect_all` will dial it again under the same uuid.
    Failed { error: ConnectError },
}

impl OpenEvent {
    pub fn is_failed(&self) -> bool {
        matches!(self, OpenEvent::Failed { .. })
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        match self {
            OpenEvent::Accepted { peer } | OpenEvent::Connected { peer } => Some(*peer),
            OpenEvent::Failed { .. } => None,
        }
    }
}

/// Logic-thread callbacks, invoked from `EventLoop::drain`.
///
/// Each callback gets the engine back so it can `send`, `close` or
/// `connect_to` in response. For one connection the calls arrive in order:
/// `on_open`, any number of `on_data`, then `on_close`. A failed connect
/// produces only `on_open(Failed)`.
pub trait ConnectionHandler {
    fn on_open(&mut self, net: &mut EventLoop, uuid: ConnId, event: OpenEvent);

    fn on_data(&mut self, net: &mut EventLoop, uuid: ConnId, msg: Msg);

    fn on_close(&mut self, net: &mut EventLoop, uuid: ConnId, reason: CloseReason) {
        let _ = (net, uuid, reason);
    }
}
