//! HTTP routes of the long-polling fallback.
//!
//! ```text
//! POST   /realtime/poll        open  → {"sid": "<poll id>"}
//! GET    /realtime/poll/{sid}  wait for queued server frames → [frame, ...]
//! POST   /realtime/poll/{sid}  one client frame
//! DELETE /realtime/poll/{sid}  close
//! ```
//!
//! Every request goes through the session middleware again and must carry
//! the session that opened the endpoint.

use std::sync::Arc;
use std::time::Duration;

use axum::Json;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use cohort_transport::{PollingHub, TransportError, TransportKind};
use serde::Serialize;
use serde_json::Value;

use crate::boundary::AppError;
use crate::handler::handle_connection;
use crate::server::Realtime;
use crate::sessions::Authenticated;

#[derive(Debug, Serialize)]
pub(crate) struct Opened {
    sid: String,
}

pub(crate) async fn open(
    State(rt): State<Arc<Realtime>>,
    Authenticated(session): Authenticated,
) -> Result<Json<Opened>, AppError> {
    ensure_enabled(&rt)?;

    let (sid, conn) = rt.polling.open(session.id.as_str());
    let task_rt = Arc::clone(&rt);
    tokio::spawn(async move {
        if let Err(e) = handle_connection(conn, session, task_rt).await {
            tracing::debug!(error = %e, "polling connection ended with error");
        }
    });
    Ok(Json(Opened { sid }))
}

pub(crate) async fn poll(
    State(rt): State<Arc<Realtime>>,
    Authenticated(session): Authenticated,
    Path(sid): Path<String>,
) -> Result<Json<Vec<Value>>, AppError> {
    ensure_enabled(&rt)?;

    let frames = rt
        .polling
        .poll(&sid, session.id.as_str(), rt.poll_wait)
        .await
        .map_err(endpoint_error)?;

    let messages = frames
        .iter()
        .filter_map(|frame| match serde_json::from_slice(frame) {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::warn!(error = %e, "dropping non-JSON polling frame");
                None
            }
        })
        .collect();
    Ok(Json(messages))
}

pub(crate) async fn push(
    State(rt): State<Arc<Realtime>>,
    Authenticated(session): Authenticated,
    Path(sid): Path<String>,
    body: Bytes,
) -> Result<StatusCode, AppError> {
    ensure_enabled(&rt)?;
    rt.polling
        .push(&sid, session.id.as_str(), body.to_vec())
        .map_err(endpoint_error)?;
    Ok(StatusCode::NO_CONTENT)
}

pub(crate) async fn close(
    State(rt): State<Arc<Realtime>>,
    Authenticated(session): Authenticated,
    Path(sid): Path<String>,
) -> Result<StatusCode, AppError> {
    ensure_enabled(&rt)?;
    rt.polling
        .close(&sid, session.id.as_str())
        .map_err(endpoint_error)?;
    Ok(StatusCode::NO_CONTENT)
}

/// Removes endpoints nobody polled within `idle`, forever.
pub(crate) async fn sweep(hub: Arc<PollingHub>, idle: Duration) {
    let mut ticker = tokio::time::interval((idle / 2).max(Duration::from_secs(1)));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        hub.sweep(idle);
    }
}

fn ensure_enabled(rt: &Realtime) -> Result<(), AppError> {
    if rt.transports.contains(&TransportKind::Polling) {
        Ok(())
    } else {
        Err(AppError::not_found())
    }
}

fn endpoint_error(e: TransportError) -> AppError {
    match e {
        TransportError::ConnectionClosed(_) => {
            AppError::with_status(StatusCode::GONE, "Polling connection closed")
        }
        _ => AppError::with_status(StatusCode::NOT_FOUND, "Unknown polling connection"),
    }
}
