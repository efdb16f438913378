//! # Connection Registry
//!
//! The authoritative map from [`ConnectionId`] to live connection state.
//!
//! Outbound connections get their slot *before* the handshake finishes, so
//! callbacks firing on connection-open always find somewhere to record the
//! result. The pre-handshake window is an explicit [`ConnectionSlot::Pending`]
//! variant rather than an empty value:
//!
//! ```text
//!   reserve(id) ──► Pending ──fill(id, c)──► Established(c)
//!                      │                          │
//!                      └────────remove(id)────────┘
//! ```
//!
//! The registry itself is a plain data structure. It is owned exclusively by
//! the endpoint actor, which serializes every mutation, so no locking happens
//! here.

use std::collections::HashMap;
use std::collections::hash_map::Entry;
use std::fmt;
use std::net::SocketAddr;

use crate::identity::Identity;
use crate::stream::{ControlStream, PendingMessage};

/// Identifier assigned when a connection is dialed or accepted. Ids are
/// allocated from a monotonically increasing counter and never reused.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionId(pub(crate) u64);

impl ConnectionId {
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "c{}", self.0)
    }
}

/// An established peer connection: the QUIC connection plus its control
/// stream. Both handles are shared with the tasks driving them.
#[derive(Debug)]
pub struct Connection {
    id: ConnectionId,
    peer: Identity,
    conn: quinn::Connection,
    control: ControlStream,
}

impl Connection {
    pub(crate) fn new(
        id: ConnectionId,
        peer: Identity,
        conn: quinn::Connection,
        control: ControlStream,
    ) -> Self {
        Self {
            id,
            peer,
            conn,
            control,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// The peer's TLS-verified identity.
    pub fn peer(&self) -> Identity {
        self.peer
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.conn.remote_address()
    }

    pub fn control_stream(&self) -> &ControlStream {
        &self.control
    }

    /// Queue a message on this connection's control stream.
    pub fn send(&self, message: PendingMessage) -> bool {
        self.control.enqueue(message)
    }

    /// Close the connection locally. Registry removal follows through the
    /// normal connection-closed path.
    pub fn close(&self, code: u32, reason: &[u8]) {
        self.conn.close(code.into(), reason);
    }

    pub fn is_closed(&self) -> bool {
        self.conn.close_reason().is_some()
    }
}

/// Registry entry state.
#[derive(Debug)]
pub enum ConnectionSlot<C> {
    /// Dialed, handshake not yet complete.
    Pending,
    Established(C),
}

impl<C> ConnectionSlot<C> {
    pub fn is_established(&self) -> bool {
        matches!(self, ConnectionSlot::Established(_))
    }
}

#[derive(Debug)]
pub struct ConnectionRegistry<C> {
    slots: HashMap<ConnectionId, ConnectionSlot<C>>,
}

impl<C> Default for ConnectionRegistry<C> {
    fn default() -> Self {
        Self {
            slots: HashMap::new(),
        }
    }
}

impl<C> ConnectionRegistry<C> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve a pending slot for a dial in progress.
    ///
    /// Returns `false` without touching the existing entry if `id` is already
    /// present; a reservation never overwrites.
    pub fn reserve(&mut self, id: ConnectionId) -> bool {
        match self.slots.entry(id) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(ConnectionSlot::Pending);
                true
            }
        }
    }

    /// Fill a reserved slot with its established connection.
    ///
    /// Fails if there is no reservation for `id` (the connection was closed
    /// before the handshake finished) or if the slot is already established.
    /// The connection is handed back on failure so the caller can close it.
    pub fn fill(&mut self, id: ConnectionId, conn: C) -> Result<(), C> {
        match self.slots.get_mut(&id) {
            Some(slot @ ConnectionSlot::Pending) => {
                *slot = ConnectionSlot::Established(conn);
                Ok(())
            }
            _ => Err(conn),
        }
    }

    /// Register an already established connection (the inbound path, where
    /// nothing is visible before the handshake completes).
    pub fn insert(&mut self, id: ConnectionId, conn: C) -> Result<(), C> {
        match self.slots.entry(id) {
            Entry::Occupied(_) => Err(conn),
            Entry::Vacant(slot) => {
                slot.insert(ConnectionSlot::Established(conn));
                Ok(())
            }
        }
    }

    /// Established connection for `id`. Pending and absent ids both give
    /// `None`: neither counts as connected.
    pub fn get(&self, id: ConnectionId) -> Option<&C> {
        match self.slots.get(&id)? {
            ConnectionSlot::Established(conn) => Some(conn),
            ConnectionSlot::Pending => None,
        }
    }

    pub fn slot(&self, id: ConnectionId) -> Option<&ConnectionSlot<C>> {
        self.slots.get(&id)
    }

    /// Remove `id` in whatever state it is in.
    pub fn remove(&mut self, id: ConnectionId) -> Option<ConnectionSlot<C>> {
        self.slots.remove(&id)
    }

    pub fn is_connected(&self, id: ConnectionId) -> bool {
        self.get(id).is_some()
    }

    /// Number of established connections.
    pub fn len(&self) -> usize {
        self.slots.values().filter(|s| s.is_established()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn pending_len(&self) -> usize {
        self.slots.len() - self.len()
    }

    pub fn established(&self) -> impl Iterator<Item = (ConnectionId, &C)> {
        self.slots.iter().filter_map(|(id, slot)| match slot {
            ConnectionSlot::Established(c) => Some((*id, c)),
            ConnectionSlot::Pending => None,
        })
    }

    pub fn drain(&mut self) -> impl Iterator<Item = (ConnectionId, ConnectionSlot<C>)> + '_ {
        self.slots.drain()
    }
}
