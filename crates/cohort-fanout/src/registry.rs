//! Local connection registry: which connections this worker holds, who
//! they belong to and which rooms they joined.
//!
//! The registry never sees another worker's connections. When a
//! [`Delivery`] arrives from the bus, [`ConnectionRegistry::dispatch`]
//! writes it to the matching local connections and ignores the rest.

use std::borrow::Borrow;
use std::collections::HashSet;
use std::hash::Hash;
use std::sync::Arc;

use cohort_protocol::{Delivery, Recipient, ServerMessage, SessionId};
use cohort_transport::ConnectionId;
use dashmap::DashMap;
use tokio::sync::mpsc;

use crate::FanoutError;

/// Channel sender feeding one connection's write loop.
pub type OutboundSender = mpsc::UnboundedSender<ServerMessage>;

/// One persistent connection owned by this worker.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    pub id: ConnectionId,
    /// The session resolved at handshake time. Fixed for the connection's
    /// lifetime.
    pub session_id: SessionId,
    pub rooms: HashSet<String>,
    outbound: OutboundSender,
}

impl ConnectionHandle {
    /// Queues a message for the connection's write loop. Returns `false`
    /// if the connection is already gone.
    pub fn send(&self, message: ServerMessage) -> bool {
        self.outbound.send(message).is_ok()
    }
}

#[derive(Debug, Default)]
struct Inner {
    connections: DashMap<ConnectionId, ConnectionHandle>,
    rooms: DashMap<String, HashSet<ConnectionId>>,
    sessions: DashMap<SessionId, HashSet<ConnectionId>>,
}

/// Index of the connections held by this worker. Clones share the index.
#[derive(Debug, Clone, Default)]
pub struct ConnectionRegistry {
    inner: Arc<Inner>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a freshly authenticated connection.
    pub fn register(&self, id: ConnectionId, session_id: SessionId, outbound: OutboundSender) {
        self.inner
            .sessions
            .entry(session_id.clone())
            .or_default()
            .insert(id);
        self.inner.connections.insert(
            id,
            ConnectionHandle {
                id,
                session_id,
                rooms: HashSet::new(),
                outbound,
            },
        );
        tracing::debug!(conn_id = %id, "connection registered");
    }

    /// Removes a connection and all its memberships. Returns the removed
    /// handle, if it was registered.
    pub fn unregister(&self, id: ConnectionId) -> Option<ConnectionHandle> {
        let (_, handle) = self.inner.connections.remove(&id)?;

        for room in &handle.rooms {
            remove_member(&self.inner.rooms, room, id);
        }
        remove_member(&self.inner.sessions, &handle.session_id, id);

        tracing::debug!(conn_id = %id, "connection unregistered");
        Some(handle)
    }

    /// Adds a connection to a room. Returns `false` if it was already a
    /// member.
    pub fn join_room(&self, id: ConnectionId, room: &str) -> Result<bool, FanoutError> {
        let added = {
            let mut handle = self
                .inner
                .connections
                .get_mut(&id)
                .ok_or(FanoutError::UnknownConnection(id))?;
            handle.rooms.insert(room.to_string())
        };
        if added {
            self.inner
                .rooms
                .entry(room.to_string())
                .or_default()
                .insert(id);
            tracing::debug!(conn_id = %id, room, "joined room");
        }
        Ok(added)
    }

    /// Removes a connection from a room. Returns `false` if it was not a
    /// member.
    pub fn leave_room(&self, id: ConnectionId, room: &str) -> Result<bool, FanoutError> {
        let removed = {
            let mut handle = self
                .inner
                .connections
                .get_mut(&id)
                .ok_or(FanoutError::UnknownConnection(id))?;
            handle.rooms.remove(room)
        };
        if removed {
            remove_member(&self.inner.rooms, room, id);
            tracing::debug!(conn_id = %id, room, "left room");
        }
        Ok(removed)
    }

    /// Writes a delivery to every matching local connection and returns
    /// how many were written to.
    pub fn dispatch(&self, delivery: &Delivery) -> usize {
        let targets: Vec<ConnectionId> = match &delivery.to {
            Recipient::All => self.inner.connections.iter().map(|e| *e.key()).collect(),
            Recipient::Session(session_id) => self.connections_for_session(session_id),
            Recipient::Room(room) => self
                .inner
                .rooms
                .get(room)
                .map(|members| members.iter().copied().collect())
                .unwrap_or_default(),
        };

        let mut delivered = 0;
        for id in targets {
            let Some(handle) = self.inner.connections.get(&id) else {
                continue;
            };
            let message = ServerMessage::Event {
                event: delivery.event.clone(),
                data: delivery.data.clone(),
            };
            if handle.send(message) {
                delivered += 1;
            } else {
                tracing::trace!(conn_id = %id, "connection closed before delivery");
            }
        }
        delivered
    }

    /// Connections on this worker authenticated as `session_id`.
    pub fn connections_for_session(&self, session_id: &SessionId) -> Vec<ConnectionId> {
        self.inner
            .sessions
            .get(session_id)
            .map(|ids| ids.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Rooms a connection has joined.
    pub fn rooms_of(&self, id: ConnectionId) -> Vec<String> {
        self.inner
            .connections
            .get(&id)
            .map(|h| h.rooms.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn get(&self, id: ConnectionId) -> Option<ConnectionHandle> {
        self.inner.connections.get(&id).map(|h| h.clone())
    }

    pub fn len(&self) -> usize {
        self.inner.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.connections.is_empty()
    }
}

/// Removes `id` from an index set, dropping the set once empty.
fn remove_member<K, Q>(index: &DashMap<K, HashSet<ConnectionId>>, key: &Q, id: ConnectionId)
where
    K: Borrow<Q> + Hash + Eq,
    Q: Hash + Eq + ?Sized,
{
    index.remove_if_mut(key, |_, members| {
        members.remove(&id);
        members.is_empty()
    });
}
