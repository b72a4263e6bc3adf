//! Transport layer for Cohort.
//!
//! Provides the [`Connection`] trait that abstracts over the ways a browser
//! can hold a persistent connection to a worker, plus the shared-port
//! listener every worker binds.
//!
//! # Feature Flags
//!
//! - `websocket` (default): native WebSocket, served through axum's
//!   upgrade extractor.
//! - `polling` (default): long-polling fallback for clients that cannot
//!   keep a socket open.

mod error;
mod listener;
#[cfg(feature = "polling")]
mod polling;
#[cfg(feature = "websocket")]
mod websocket;

pub use error::TransportError;
pub use listener::bind_shared;
#[cfg(feature = "polling")]
pub use polling::{PollingConnection, PollingHub};
#[cfg(feature = "websocket")]
pub use websocket::WebSocketConnection;

use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Counter for generating unique connection IDs within a worker.
static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Opaque identifier for a connection, unique within one worker process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Creates a new `ConnectionId` from a raw `u64`.
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Allocates the next process-wide id.
    pub fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Returns the underlying `u64` value.
    pub fn into_inner(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// A single persistent connection that can send and receive frames.
///
/// Methods take `&self` so one task can wait in [`recv`](Self::recv)
/// while another pushes frames through [`send`](Self::send).
pub trait Connection: Send + Sync + 'static {
    /// Sends one frame to the remote peer.
    fn send(
        &self,
        data: &[u8],
    ) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Receives the next frame from the remote peer.
    ///
    /// Returns `Ok(None)` when the connection is cleanly closed.
    fn recv(
        &self,
    ) -> impl Future<Output = Result<Option<Vec<u8>>, TransportError>> + Send;

    /// Closes the connection.
    fn close(&self) -> impl Future<Output = Result<(), TransportError>> + Send;

    /// Liveness check, called periodically by the worker.
    ///
    /// Fails when nothing at all arrived from the peer within `timeout`,
    /// and otherwise prompts the peer to answer before the next check.
    /// Transports whose liveness is tracked elsewhere keep the default,
    /// which always succeeds.
    fn keepalive(
        &self,
        timeout: Duration,
    ) -> impl Future<Output = Result<(), TransportError>> + Send {
        let _ = timeout;
        async { Ok(()) }
    }

    /// Returns the unique identifier for this connection.
    fn id(&self) -> ConnectionId;

    /// Which transport carries this connection.
    fn kind(&self) -> TransportKind;
}

/// The persistent-connection transports a worker can offer.
///
/// Order matters in configuration: clients try the first one first and
/// degrade down the list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportKind {
    /// Native bidirectional WebSocket.
    WebSocket,
    /// HTTP long-polling.
    Polling,
}

impl TransportKind {
    /// The name used on the command line and in the transport listing.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::WebSocket => "websocket",
            Self::Polling => "polling",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransportKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "websocket" | "ws" => Ok(Self::WebSocket),
            "polling" | "xhr-polling" | "long-polling" => Ok(Self::Polling),
            other => Err(format!("unknown transport `{other}`")),
        }
    }
}
