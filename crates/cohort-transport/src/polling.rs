//! Long-polling fallback transport.
//!
//! A polling connection is a pair of queues parked in the worker's
//! [`PollingHub`]. HTTP requests feed the inbound queue (`push`) and drain
//! the outbound queue (`poll`); the connection task on the other side sees
//! an ordinary [`Connection`].
//!
//! ```text
//!  POST /poll/{id} ──push──► inbound ──► PollingConnection::recv
//!  GET  /poll/{id} ◄──poll── outbound ◄── PollingConnection::send
//! ```
//!
//! Endpoints are bound to an owner key (the session id) and only accept
//! requests from that owner. Endpoints that nobody polls for a while are
//! removed by [`PollingHub::sweep`]; removing an endpoint closes its
//! connection.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use rand::Rng;
use tokio::sync::{Mutex, mpsc};
use tokio::time::Instant;

use crate::{Connection, ConnectionId, TransportError, TransportKind};

/// Upper bound on frames returned by a single poll.
const MAX_BATCH: usize = 256;

struct Endpoint {
    owner: String,
    inbound: mpsc::UnboundedSender<Vec<u8>>,
    outbound: Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
    /// Milliseconds since the hub's epoch at the last request.
    last_seen_ms: AtomicU64,
}

/// The open long-polling endpoints of one worker.
pub struct PollingHub {
    endpoints: DashMap<String, Arc<Endpoint>>,
    epoch: Instant,
}

impl PollingHub {
    pub fn new() -> Self {
        Self {
            endpoints: DashMap::new(),
            epoch: Instant::now(),
        }
    }

    /// Opens an endpoint for `owner` and returns its id together with the
    /// server-side connection.
    pub fn open(&self, owner: &str) -> (String, PollingConnection) {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();

        let poll_id = generate_poll_id();
        let endpoint = Endpoint {
            owner: owner.to_string(),
            inbound: inbound_tx,
            outbound: Mutex::new(outbound_rx),
            last_seen_ms: AtomicU64::new(self.now_ms()),
        };
        self.endpoints.insert(poll_id.clone(), Arc::new(endpoint));

        let conn = PollingConnection {
            id: ConnectionId::next(),
            inbound: Mutex::new(inbound_rx),
            outbound: outbound_tx,
        };
        tracing::debug!(id = %conn.id, "opened polling connection");
        (poll_id, conn)
    }

    /// Waits up to `wait` for outbound frames and returns everything
    /// queued (possibly nothing).
    ///
    /// # Errors
    /// - [`TransportError::UnknownEndpoint`]: no such endpoint for `owner`
    /// - [`TransportError::ConnectionClosed`]: the server side hung up;
    ///   the endpoint is removed
    pub async fn poll(
        &self,
        poll_id: &str,
        owner: &str,
        wait: Duration,
    ) -> Result<Vec<Vec<u8>>, TransportError> {
        let endpoint = self.endpoint(poll_id, owner)?;
        // A GET in flight is activity; the sweeper must not reap it.
        endpoint.last_seen_ms.store(self.now_ms(), Ordering::Relaxed);
        let mut outbound = endpoint.outbound.lock().await;

        let first = match tokio::time::timeout(wait, outbound.recv()).await {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                drop(outbound);
                self.endpoints.remove(poll_id);
                return Err(TransportError::ConnectionClosed(
                    "polling connection ended".into(),
                ));
            }
            Err(_) => {
                endpoint.last_seen_ms.store(self.now_ms(), Ordering::Relaxed);
                return Ok(Vec::new());
            }
        };

        let mut frames = vec![first];
        while frames.len() < MAX_BATCH {
            match outbound.try_recv() {
                Ok(frame) => frames.push(frame),
                Err(_) => break,
            }
        }
        endpoint.last_seen_ms.store(self.now_ms(), Ordering::Relaxed);
        Ok(frames)
    }

    /// Hands one client frame to the connection.
    pub fn push(
        &self,
        poll_id: &str,
        owner: &str,
        frame: Vec<u8>,
    ) -> Result<(), TransportError> {
        let endpoint = self.endpoint(poll_id, owner)?;
        endpoint.last_seen_ms.store(self.now_ms(), Ordering::Relaxed);
        endpoint.inbound.send(frame).map_err(|_| {
            TransportError::ConnectionClosed("polling connection ended".into())
        })
    }

    /// Removes the endpoint; its connection sees a clean close.
    pub fn close(&self, poll_id: &str, owner: &str) -> Result<(), TransportError> {
        self.endpoint(poll_id, owner)?;
        self.endpoints.remove(poll_id);
        Ok(())
    }

    /// Removes every endpoint idle for longer than `idle`. Returns how many
    /// were removed.
    pub fn sweep(&self, idle: Duration) -> usize {
        let now = self.now_ms();
        let limit = u64::try_from(idle.as_millis()).unwrap_or(u64::MAX);
        let before = self.endpoints.len();
        self.endpoints.retain(|_, ep| {
            now.saturating_sub(ep.last_seen_ms.load(Ordering::Relaxed)) <= limit
        });
        let removed = before.saturating_sub(self.endpoints.len());
        if removed > 0 {
            tracing::debug!(removed, "swept idle polling endpoints");
        }
        removed
    }

    /// Number of open endpoints.
    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    fn endpoint(&self, poll_id: &str, owner: &str) -> Result<Arc<Endpoint>, TransportError> {
        match self.endpoints.get(poll_id) {
            Some(ep) if ep.owner == owner => Ok(Arc::clone(ep.value())),
            _ => Err(TransportError::UnknownEndpoint),
        }
    }

    fn now_ms(&self) -> u64 {
        u64::try_from(self.epoch.elapsed().as_millis()).unwrap_or(u64::MAX)
    }
}

impl Default for PollingHub {
    fn default() -> Self {
        Self::new()
    }
}

/// Server side of a long-polling endpoint.
pub struct PollingConnection {
    id: ConnectionId,
    inbound: Mutex<mpsc::UnboundedReceiver<Vec<u8>>>,
    outbound: mpsc::UnboundedSender<Vec<u8>>,
}

impl Connection for PollingConnection {
    async fn send(&self, data: &[u8]) -> Result<(), TransportError> {
        self.outbound.send(data.to_vec()).map_err(|_| {
            TransportError::ConnectionClosed("polling endpoint removed".into())
        })
    }

    async fn recv(&self) -> Result<Option<Vec<u8>>, TransportError> {
        Ok(self.inbound.lock().await.recv().await)
    }

    /// Dropping the connection is what closes it: the next poll sees the
    /// outbound queue end and removes the endpoint.
    async fn close(&self) -> Result<(), TransportError> {
        Ok(())
    }

    fn id(&self) -> ConnectionId {
        self.id
    }

    fn kind(&self) -> TransportKind {
        TransportKind::Polling
    }
}

/// 128 random bits as 32 hex characters.
fn generate_poll_id() -> String {
    let bytes: [u8; 16] = rand::rng().random();
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}
