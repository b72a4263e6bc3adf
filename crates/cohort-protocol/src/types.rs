//! Core protocol types.
//!
//! Two families live here. The realtime family ([`Envelope`],
//! [`ClientMessage`], [`ServerMessage`]) is what a browser exchanges with
//! the worker that holds its connection. The fan-out family
//! ([`FanoutMessage`], [`Delivery`], [`Recipient`]) is what workers
//! exchange with each other through the broker.

use serde::{Deserialize, Serialize};
use std::fmt;

// ---------------------------------------------------------------------------
// Identity types
// ---------------------------------------------------------------------------

/// An opaque session identifier, the key of a record in the shared
/// session store.
///
/// The value is a secret: whoever holds it is the session's user. For
/// that reason [`Display`](fmt::Display) only prints a short prefix, so
/// ids can be logged with `%session_id` without leaking them.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    /// Wraps a raw identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the full identifier.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let prefix: String = self.0.chars().take(8).collect();
        write!(f, "S-{prefix}…")
    }
}

/// Identifies one worker incarnation.
///
/// Ids are handed out by the supervisor and increase monotonically: a
/// replacement worker gets a new id even though it reuses the dead
/// worker's pool slot.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct WorkerId(pub u64);

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "W-{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Fan-out
// ---------------------------------------------------------------------------

/// A message on the fan-out bus: a channel name and opaque bytes.
///
/// Transient. The broker does not persist it, and every subscribed worker
/// (the publisher included) sees it at least once.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FanoutMessage {
    pub channel: String,
    pub payload: Vec<u8>,
}

impl FanoutMessage {
    pub fn new(channel: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            channel: channel.into(),
            payload: payload.into(),
        }
    }
}

/// Which connections a [`Delivery`] is meant for.
///
/// Every worker evaluates the recipient against the connections it owns;
/// none of them can see the others' connections.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Recipient {
    /// Every connection on every worker.
    All,

    /// Every connection authenticated as this session (a user may have
    /// several tabs open, possibly on different workers).
    Session(SessionId),

    /// Every connection that joined the named room.
    Room(String),
}

/// The payload of the gateway's own dispatch channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Delivery {
    pub to: Recipient,
    /// Application-defined event name, forwarded to the client as-is.
    pub event: String,
    /// Application-defined data. The gateway never looks inside.
    #[serde(default)]
    pub data: serde_json::Value,
}

// ---------------------------------------------------------------------------
// Realtime connection messages
// ---------------------------------------------------------------------------

/// Client → server messages on a persistent connection.
///
/// Internally tagged, so on the wire a join looks like
/// `{ "type": "Join", "room": "lobby" }`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    /// Subscribe this connection to a room.
    Join { room: String },

    /// Unsubscribe this connection from a room.
    Leave { room: String },

    /// Keep-alive. The server echoes `client_time` back so the client can
    /// compute its round-trip time.
    Heartbeat { client_time: u64 },

    /// The client is going away.
    Disconnect { reason: String },
}

/// Server → client messages on a persistent connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    /// First frame on every connection, sent once authentication passed.
    Welcome {
        connection_id: u64,
        worker_id: WorkerId,
    },

    Joined { room: String },

    Left { room: String },

    /// An event fanned out by application code on some worker.
    Event {
        event: String,
        data: serde_json::Value,
    },

    HeartbeatAck { client_time: u64, server_time: u64 },

    /// `code` follows HTTP conventions (400 bad request, 401
    /// unauthorized, ...).
    Error { code: u16, message: String },
}

/// Every frame on a persistent connection is an envelope.
///
/// `seq` increases by one per frame in each direction; `timestamp` is
/// milliseconds since the connection was accepted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope<M> {
    pub seq: u64,
    pub timestamp: u64,
    pub message: M,
}

// =========================================================================
// Tests
// =========================================================================
