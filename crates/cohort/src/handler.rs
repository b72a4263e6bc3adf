//! Per-connection handler: registration, message routing, delivery.
//!
//! Each persistent connection gets its own Tokio task running this
//! handler, whatever transport carries it. The session was resolved at
//! handshake time, before the task started. The flow is:
//!   1. Register in the worker's registry → send Welcome
//!   2. Loop: client frames (Join/Leave/Heartbeat/Disconnect) and
//!      deliveries queued by the fan-out side, until close or until the
//!      transport's keepalive reports the peer gone
//!   3. Unregister (drop guard)

use std::sync::Arc;
use std::time::{Duration, Instant};

use cohort_fanout::ConnectionRegistry;
use cohort_protocol::{ClientMessage, Codec, Envelope, ServerMessage};
use cohort_session::SessionRecord;
use cohort_transport::{Connection, ConnectionId};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;

use crate::CohortError;
use crate::server::Realtime;

/// Drop guard that removes the connection from the registry when the
/// handler exits, panics included.
struct ConnectionGuard {
    id: ConnectionId,
    registry: ConnectionRegistry,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        if self.registry.unregister(self.id).is_some() {
            tracing::debug!(conn_id = %self.id, "connection unregistered");
        }
    }
}

/// Handles a single authenticated connection from accept to close.
pub(crate) async fn handle_connection<C: Connection>(
    conn: C,
    session: SessionRecord,
    rt: Arc<Realtime>,
) -> Result<(), CohortError> {
    let conn_id = conn.id();
    let session_id = session.id;

    let (outbound_tx, mut outbound) = mpsc::unbounded_channel();
    rt.registry.register(conn_id, session_id.clone(), outbound_tx);
    let _guard = ConnectionGuard {
        id: conn_id,
        registry: rt.registry.clone(),
    };
    tracing::info!(%conn_id, %session_id, transport = %conn.kind(), "connection opened");

    let start = Instant::now();
    let mut seq: u64 = 0;
    send(
        &conn,
        &rt,
        ServerMessage::Welcome {
            connection_id: conn_id.into_inner(),
            worker_id: rt.worker_id,
        },
        next_seq(&mut seq),
        &start,
    )
    .await?;

    // Checked twice per idle window so a silent peer is gone within
    // one and a half windows at most.
    let period = (rt.idle_timeout / 2).max(Duration::from_millis(10));
    let mut keepalive = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            queued = outbound.recv() => {
                // The registry holds the sender until the guard drops.
                let Some(message) = queued else { break };
                send(&conn, &rt, message, next_seq(&mut seq), &start).await?;
            }

            received = conn.recv() => {
                let data = match received {
                    Ok(Some(data)) => data,
                    Ok(None) => {
                        tracing::info!(%conn_id, "connection closed cleanly");
                        break;
                    }
                    Err(e) => {
                        tracing::debug!(%conn_id, error = %e, "recv error");
                        break;
                    }
                };
                let envelope: Envelope<ClientMessage> = match rt.codec.decode(&data) {
                    Ok(env) => env,
                    Err(e) => {
                        tracing::debug!(%conn_id, error = %e, "failed to decode envelope");
                        send_error(&conn, &rt, 400, "malformed message", next_seq(&mut seq), &start).await?;
                        continue;
                    }
                };

                let should_close =
                    handle_client_message(&conn, &rt, envelope.message, &mut seq, &start).await?;
                if should_close {
                    break;
                }
            }

            _ = keepalive.tick() => {
                if let Err(e) = conn.keepalive(rt.idle_timeout).await {
                    tracing::info!(%conn_id, error = %e, "peer unresponsive, closing");
                    break;
                }
            }
        }
    }

    if let Err(e) = conn.close().await {
        tracing::debug!(%conn_id, error = %e, "close failed");
    }
    // _guard drops here → connection leaves the registry.
    Ok(())
}

/// Handles one client message. Returns `true` if the connection should
/// close.
async fn handle_client_message<C: Connection>(
    conn: &C,
    rt: &Realtime,
    msg: ClientMessage,
    seq: &mut u64,
    start: &Instant,
) -> Result<bool, CohortError> {
    let conn_id = conn.id();
    match msg {
        ClientMessage::Heartbeat { client_time } => {
            let ack = ServerMessage::HeartbeatAck {
                client_time,
                server_time: elapsed_ms(start),
            };
            send(conn, rt, ack, next_seq(seq), start).await?;
        }

        ClientMessage::Join { room } => {
            if room.trim().is_empty() {
                send_error(conn, rt, 400, "room name must not be empty", next_seq(seq), start).await?;
                return Ok(false);
            }
            rt.registry.join_room(conn_id, &room)?;
            tracing::debug!(%conn_id, %room, "joined room");
            send(conn, rt, ServerMessage::Joined { room }, next_seq(seq), start).await?;
        }

        ClientMessage::Leave { room } => {
            rt.registry.leave_room(conn_id, &room)?;
            tracing::debug!(%conn_id, %room, "left room");
            send(conn, rt, ServerMessage::Left { room }, next_seq(seq), start).await?;
        }

        ClientMessage::Disconnect { reason } => {
            tracing::info!(%conn_id, %reason, "client disconnecting");
            return Ok(true);
        }
    }
    Ok(false)
}

async fn send<C: Connection>(
    conn: &C,
    rt: &Realtime,
    message: ServerMessage,
    seq: u64,
    start: &Instant,
) -> Result<(), CohortError> {
    let envelope = Envelope {
        seq,
        timestamp: elapsed_ms(start),
        message,
    };
    let bytes = rt.codec.encode(&envelope)?;
    conn.send(&bytes).await?;
    Ok(())
}

async fn send_error<C: Connection>(
    conn: &C,
    rt: &Realtime,
    code: u16,
    message: &str,
    seq: u64,
    start: &Instant,
) -> Result<(), CohortError> {
    let error = ServerMessage::Error {
        code,
        message: message.to_string(),
    };
    send(conn, rt, error, seq, start).await
}

/// Increments and returns the next sequence number.
fn next_seq(seq: &mut u64) -> u64 {
    let current = *seq;
    *seq += 1;
    current
}

fn elapsed_ms(start: &Instant) -> u64 {
    u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX)
}
