//! WebSocket connections, upgraded by axum on the worker's HTTP port.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::{Connection, ConnectionId, TransportError, TransportKind};

/// A single upgraded WebSocket.
///
/// The socket is split so a task blocked in `recv` never holds up a
/// `send` from the fan-out side.
///
/// Liveness is server-driven: [`keepalive`](Connection::keepalive) sends a
/// Ping, which browsers answer on their own, and every frame the peer
/// sends (Pong included) counts as a sign of life. A client that only
/// listens stays connected.
pub struct WebSocketConnection {
    id: ConnectionId,
    sink: Mutex<SplitSink<WebSocket, Message>>,
    stream: Mutex<SplitStream<WebSocket>>,
    epoch: Instant,
    last_seen_ms: AtomicU64,
}

impl WebSocketConnection {
    /// Wraps a socket handed over by `WebSocketUpgrade::on_upgrade`.
    pub fn new(socket: WebSocket) -> Self {
        let (sink, stream) = socket.split();
        let id = ConnectionId::next();
        tracing::debug!(%id, "accepted WebSocket connection");
        Self {
            id,
            sink: Mutex::new(sink),
            stream: Mutex::new(stream),
            epoch: Instant::now(),
            last_seen_ms: AtomicU64::new(0),
        }
    }

    fn now_ms(&self) -> u64 {
        u64::try_from(self.epoch.elapsed().as_millis()).unwrap_or(u64::MAX)
    }

    fn mark_seen(&self) {
        self.last_seen_ms.store(self.now_ms(), Ordering::Relaxed);
    }
}

impl Connection for WebSocketConnection {
    async fn send(&self, data: &[u8]) -> Result<(), TransportError> {
        // Frames are JSON, so text frames are what browsers expect;
        // anything that is not UTF-8 goes out as binary.
        let msg = match String::from_utf8(data.to_vec()) {
            Ok(text) => Message::Text(text.into()),
            Err(e) => Message::Binary(e.into_bytes().into()),
        };
        self.sink.lock().await.send(msg).await.map_err(|e| {
            TransportError::SendFailed(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                e,
            ))
        })
    }

    async fn recv(&self) -> Result<Option<Vec<u8>>, TransportError> {
        let mut stream = self.stream.lock().await;
        loop {
            let next = stream.next().await;
            if matches!(next, Some(Ok(_))) {
                self.mark_seen();
            }
            match next {
                Some(Ok(Message::Text(text))) => {
                    return Ok(Some(text.as_str().as_bytes().to_vec()));
                }
                Some(Ok(Message::Binary(data))) => return Ok(Some(data.to_vec())),
                Some(Ok(Message::Close(_))) | None => return Ok(None),
                Some(Ok(_)) => continue, // ping/pong
                Some(Err(e)) => {
                    return Err(TransportError::ReceiveFailed(std::io::Error::new(
                        std::io::ErrorKind::ConnectionReset,
                        e,
                    )));
                }
            }
        }
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.sink.lock().await.close().await.map_err(|e| {
            TransportError::SendFailed(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                e,
            ))
        })
    }

    async fn keepalive(&self, timeout: Duration) -> Result<(), TransportError> {
        let silent_ms = self
            .now_ms()
            .saturating_sub(self.last_seen_ms.load(Ordering::Relaxed));
        let limit = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        if silent_ms > limit {
            return Err(TransportError::ConnectionClosed(format!(
                "no frame from peer in {silent_ms} ms"
            )));
        }
        self.sink
            .lock()
            .await
            .send(Message::Ping(Default::default()))
            .await
            .map_err(|e| {
                TransportError::SendFailed(std::io::Error::new(
                    std::io::ErrorKind::BrokenPipe,
                    e,
                ))
            })
    }

    fn id(&self) -> ConnectionId {
        self.id
    }

    fn kind(&self) -> TransportKind {
        TransportKind::WebSocket
    }
}
