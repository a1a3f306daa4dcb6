//! Per-connection state and the registry that owns it
//!
//! Each worker thread keeps its connections in a slot arena. Slot indices
//! double as readiness tokens, so a connection's registry id is also what the
//! poller reports for it. Freed slots are reused lowest-first to keep token
//! values small and stable.

use phloem_transport::NetChannel;
use std::fmt;

/// Identifies a connection within one worker's registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnId(usize);

impl ConnId {
    pub fn index(&self) -> usize {
        self.0
    }

    pub(crate) fn from_index(index: usize) -> Self {
        Self(index)
    }
}

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Lifecycle tag for a connection
///
/// A handle is in exactly one state at a time; `Closing` exists only for the
/// window between a close decision and removal from the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Handshake or session setup still in progress
    Initializing,
    /// Fully established and participating in traffic
    Active,
    /// Being torn down
    Closing,
}

/// One multiplexed connection plus the event-loop bookkeeping around it
pub struct ConnectionHandle {
    /// Registry slot, also the poller token
    pub id: ConnId,
    /// Transport channel
    pub channel: NetChannel,
    /// Lifecycle state
    pub state: ConnState,
    /// Queued bytes are waiting on a writable event
    pub needs_flush: bool,
    /// Any frame went out since the last send-window check
    pub sent_since_ping: bool,
    /// Any frame came in since the last receive-window check
    pub received_since_ping: bool,
    /// When a keepalive ping is due if nothing else was sent
    pub next_ping_due_ns: u64,
    /// When the peer must have been heard from, or the connection is dead
    pub recv_deadline_ns: u64,
}

impl ConnectionHandle {
    fn new(id: ConnId, channel: NetChannel) -> Self {
        Self {
            id,
            channel,
            state: ConnState::Initializing,
            needs_flush: false,
            sent_since_ping: false,
            received_since_ping: false,
            next_ping_due_ns: 0,
            recv_deadline_ns: 0,
        }
    }

    /// Start ping tracking. Pings go out at a third of the liveness window so
    /// a quiet connection gets several chances before the peer's deadline.
    pub fn arm_ping_deadlines(&mut self, now_ns: u64) {
        let timeout_ns = self.channel.ping_timeout().as_nanos() as u64;
        self.next_ping_due_ns = now_ns + timeout_ns / 3;
        self.recv_deadline_ns = now_ns + timeout_ns;
        self.sent_since_ping = false;
        self.received_since_ping = false;
    }

    pub fn mark_sent(&mut self) {
        self.sent_since_ping = true;
    }

    pub fn mark_received(&mut self) {
        self.received_since_ping = true;
    }
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("needs_flush", &self.needs_flush)
            .finish_non_exhaustive()
    }
}

/// Slot arena of connections for one worker thread
#[derive(Default)]
pub struct ConnectionRegistry {
    slots: Vec<Option<ConnectionHandle>>,
    len: usize,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a channel in the `Initializing` state, reusing the lowest free slot
    pub fn insert(&mut self, channel: NetChannel) -> ConnId {
        let index = match self.slots.iter().position(Option::is_none) {
            Some(free) => free,
            None => {
                self.slots.push(None);
                self.slots.len() - 1
            }
        };
        let id = ConnId::from_index(index);
        self.slots[index] = Some(ConnectionHandle::new(id, channel));
        self.len += 1;
        id
    }

    pub fn get(&self, id: ConnId) -> Option<&ConnectionHandle> {
        self.slots.get(id.index())?.as_ref()
    }

    pub fn get_mut(&mut self, id: ConnId) -> Option<&mut ConnectionHandle> {
        self.slots.get_mut(id.index())?.as_mut()
    }

    /// Remove and return a handle; later lookups of the id fail
    pub fn remove(&mut self, id: ConnId) -> Option<ConnectionHandle> {
        let handle = self.slots.get_mut(id.index())?.take()?;
        self.len -= 1;
        handle.into()
    }

    pub fn ids(&self) -> Vec<ConnId> {
        self.slots.iter().flatten().map(|h| h.id).collect()
    }

    pub fn ids_in(&self, state: ConnState) -> Vec<ConnId> {
        self.slots.iter().flatten().filter(|h| h.state == state).map(|h| h.id).collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ConnectionHandle> {
        self.slots.iter().flatten()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut ConnectionHandle> {
        self.slots.iter_mut().flatten()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}
