//! Logic-thread view of every connection.
//!
//! Two tables, both keyed by `ConnId`:
//!
//! - **live**: connections that reached `Open`, with owning thread, peer and
//!   an optional weakly-held application object.
//! - **targets**: outbound destinations created by `connect_to`. A target
//!   outlives its connections; a failed or dropped connection leaves the
//!   target with `connected == false` and `reconnect_all` dials it again
//!   under the same uuid.
//!
//! No I/O happens here. The registry is updated from engine events only.

use std::any::Any;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::{Arc, Weak};

use shardline_core::error::{NetError, Result};
use shardline_core::id::{ConnId, IoThreadId};

/// Registry entry for an open connection.
#[derive(Debug)]
pub struct ConnectionInfo {
    pub id: ConnId,
    pub io_thread: IoThreadId,
    /// Peer address, for logs and display.
    pub peer: String,
    /// Dialed by us (`connect_to`) rather than accepted.
    pub outbound: bool,
    /// User tag copied from the target; 0 for accepted connections.
    pub tag: u64,
    attached: Option<Weak<dyn Any + Send + Sync>>,
}

impl ConnectionInfo {
    pub fn new(id: ConnId, io_thread: IoThreadId, peer: String, outbound: bool) -> Self {
        Self { id, io_thread, peer, outbound, tag: 0, attached: None }
    }

    /// Whether an application object is attached and still alive.
    pub fn has_attachment(&self) -> bool {
        self.attached
            .as_ref()
            .map(|w| w.strong_count() > 0)
            .unwrap_or(false)
    }
}

/// An outbound destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectTarget {
    pub uuid: ConnId,
    pub host: String,
    pub port: u16,
    /// A live connection currently exists for this target.
    pub connected: bool,
    /// Shard that dials it; reconnects stay on the same thread.
    pub io_thread: IoThreadId,
    pub tag: u64,
    /// A connect is in flight.
    pub attempting: bool,
}

impl ConnectTarget {
    pub fn new(uuid: ConnId, host: impl Into<String>, port: u16, io_thread: IoThreadId) -> Self {
        Self {
            uuid,
            host: host.into(),
            port,
            connected: false,
            io_thread,
            tag: 0,
            attempting: false,
        }
    }

    pub fn with_tag(mut self, tag: u64) -> Self {
        self.tag = tag;
        self
    }

    /// Not connected and not being dialed.
    pub fn is_idle(&self) -> bool {
        !self.connected && !self.attempting
    }
}

#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    live: HashMap<ConnId, ConnectionInfo>,
    targets: HashMap<ConnId, ConnectTarget>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an open connection. A matching target is marked connected
    /// and lends its tag.
    pub fn add(
        &mut self,
        uuid: ConnId,
        io_thread: IoThreadId,
        peer: String,
        outbound: bool,
    ) -> &mut ConnectionInfo {
        let mut info = ConnectionInfo::new(uuid, io_thread, peer, outbound);
        if let Some(t) = self.targets.get_mut(&uuid) {
            t.connected = true;
            t.attempting = false;
            info.tag = t.tag;
        }
        match self.live.entry(uuid) {
            Entry::Occupied(mut e) => {
                e.insert(info);
                e.into_mut()
            }
            Entry::Vacant(e) => e.insert(info),
        }
    }

    /// Forget an open connection. A matching target goes back to idle.
    pub fn remove(&mut self, uuid: ConnId) -> Option<ConnectionInfo> {
        self.mark_connected(uuid, false);
        self.live.remove(&uuid)
    }

    pub fn find(&self, uuid: ConnId) -> Option<&ConnectionInfo> {
        self.live.get(&uuid)
    }

    pub fn find_mut(&mut self, uuid: ConnId) -> Option<&mut ConnectionInfo> {
        self.live.get_mut(&uuid)
    }

    pub fn contains(&self, uuid: ConnId) -> bool {
        self.live.contains_key(&uuid)
    }

    /// Open connections.
    pub fn iter(&self) -> impl Iterator<Item = &ConnectionInfo> {
        self.live.values()
    }

    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }

    pub fn add_target(&mut self, target: ConnectTarget) {
        self.targets.insert(target.uuid, target);
    }

    pub fn find_target(&self, uuid: ConnId) -> Option<&ConnectTarget> {
        self.targets.get(&uuid)
    }

    pub fn find_target_mut(&mut self, uuid: ConnId) -> Option<&mut ConnectTarget> {
        self.targets.get_mut(&uuid)
    }

    pub fn remove_target(&mut self, uuid: ConnId) -> Option<ConnectTarget> {
        self.targets.remove(&uuid)
    }

    /// Set a target's connected flag and end any attempt. Returns whether
    /// the target exists.
    pub fn mark_connected(&mut self, uuid: ConnId, connected: bool) -> bool {
        match self.targets.get_mut(&uuid) {
            Some(t) => {
                t.connected = connected;
                t.attempting = false;
                true
            }
            None => false,
        }
    }

    /// Targets that are neither connected nor being dialed.
    pub fn pending_targets(&self) -> impl Iterator<Item = &ConnectTarget> {
        self.targets.values().filter(|t| t.is_idle())
    }

    pub fn targets(&self) -> impl Iterator<Item = &ConnectTarget> {
        self.targets.values()
    }

    /// Attach an application object. Held weakly: the registry never keeps
    /// it alive.
    pub fn attach<T: Any + Send + Sync>(&mut self, uuid: ConnId, obj: &Arc<T>) -> Result<()> {
        let info = self.live.get_mut(&uuid).ok_or(NetError::UnknownConnection(uuid))?;
        let weak: Weak<T> = Arc::downgrade(obj);
        let weak: Weak<dyn Any + Send + Sync> = weak;
        info.attached = Some(weak);
        Ok(())
    }

    /// The attached object, if it is a `T` and still alive.
    pub fn attached<T: Any + Send + Sync>(&self, uuid: ConnId) -> Option<Arc<T>> {
        let strong = self.live.get(&uuid)?.attached.as_ref()?.upgrade()?;
        strong.downcast::<T>().ok()
    }

    /// Drop the attachment. Returns whether there was one.
    pub fn detach(&mut self, uuid: ConnId) -> bool {
        self.live
            .get_mut(&uuid)
            .and_then(|info| info.attached.take())
            .is_some()
    }

    /// Drop every entry.
    pub fn clear(&mut self) {
        self.live.clear();
        self.targets.clear();
    }
}
