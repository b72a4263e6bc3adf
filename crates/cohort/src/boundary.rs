//! The error boundary: the last thing between a request and the client,
//! and the last word on faults outside any request.
//!
//! Request-scoped failures travel as [`AppError`] responses. Whatever
//! produced them (a handler, the 404 fallback, the session middleware, a
//! caught panic), the render middleware turns them into one uniform view
//! through the worker's [`ErrorRenderer`]. Faults outside a request are
//! logged by the panic hook and end the worker; see
//! [`Worker::run`](crate::Worker::run).

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::{StatusCode, header};
use axum::middleware::Next;
use axum::response::{Html, IntoResponse, Response};
use cohort_fanout::FanoutError;
use cohort_session::SessionError;

use crate::CohortError;

/// A request failed. `status` defaults to 500 when unset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppError {
    status: Option<StatusCode>,
    message: String,
}

impl AppError {
    /// An error with no explicit status (rendered as 500).
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            status: None,
            message: message.into(),
        }
    }

    pub fn with_status(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status: Some(status),
            message: message.into(),
        }
    }

    pub fn not_found() -> Self {
        Self::with_status(StatusCode::NOT_FOUND, "Not Found")
    }

    pub fn unauthorized() -> Self {
        Self::with_status(StatusCode::UNAUTHORIZED, "Unauthorized")
    }

    pub fn status(&self) -> StatusCode {
        self.status.unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.status().as_u16(), self.message)
    }
}

/// Plain-text response carrying the error as an extension. The render
/// middleware swaps it for the rendered view.
impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let mut response = (self.status(), self.message.clone()).into_response();
        response.extensions_mut().insert(self);
        response
    }
}

impl From<SessionError> for AppError {
    fn from(e: SessionError) -> Self {
        if e.is_unresolved() {
            Self::unauthorized()
        } else {
            Self::with_status(StatusCode::SERVICE_UNAVAILABLE, "Session store unavailable")
        }
    }
}

impl From<FanoutError> for AppError {
    fn from(e: FanoutError) -> Self {
        match e {
            FanoutError::Broker(_) | FanoutError::Timeout(_) => {
                Self::with_status(StatusCode::SERVICE_UNAVAILABLE, "Message broker unavailable")
            }
            other => Self::new(other.to_string()),
        }
    }
}

impl From<CohortError> for AppError {
    fn from(e: CohortError) -> Self {
        match e {
            CohortError::Session(e) => e.into(),
            CohortError::Fanout(e) => e.into(),
            other => Self::new(other.to_string()),
        }
    }
}

/// Turns an error into the page the client sees.
pub trait ErrorRenderer: Send + Sync + 'static {
    fn render(&self, status: StatusCode, message: &str) -> Response;
}

/// Minimal HTML error page with the message as its heading.
#[derive(Debug, Clone, Copy, Default)]
pub struct HtmlErrorRenderer;

impl ErrorRenderer for HtmlErrorRenderer {
    fn render(&self, status: StatusCode, message: &str) -> Response {
        let message = escape_html(message);
        let page = format!(
            "<!DOCTYPE html>\n<html>\n<head><title>{code} {message}</title></head>\n\
             <body>\n<h1>{message}</h1>\n<p>{code}</p>\n</body>\n</html>\n",
            code = status.as_u16(),
        );
        (status, Html(page)).into_response()
    }
}

fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            c => out.push(c),
        }
    }
    out
}

/// Fallback for requests no route matched.
pub(crate) async fn not_found() -> AppError {
    AppError::not_found()
}

/// Renders every [`AppError`] response that reaches it, and every bare
/// plain-text error response (extractor rejections and the like), so no
/// framework message reaches the client in place of the error page.
pub(crate) async fn render_errors(
    State(renderer): State<Arc<dyn ErrorRenderer>>,
    request: Request,
    next: Next,
) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_owned();

    let mut response = next.run(request).await;
    let error = match response.extensions_mut().remove::<AppError>() {
        Some(error) => error,
        None if is_bare_error(&response) => {
            let status = response.status();
            AppError::with_status(status, status.canonical_reason().unwrap_or("Error"))
        }
        None => return response,
    };

    let status = error.status();
    if status.is_server_error() {
        tracing::error!(%method, %path, status = status.as_u16(), error = %error.message, "request failed");
    } else {
        tracing::debug!(%method, %path, status = status.as_u16(), error = %error.message, "request rejected");
    }

    let mut rendered = renderer.render(status, error.message());
    *rendered.status_mut() = status;
    rendered
}

/// An error status with no body a client could use: empty or plain text.
fn is_bare_error(response: &Response) -> bool {
    let status = response.status();
    if !(status.is_client_error() || status.is_server_error()) {
        return false;
    }
    match response.headers().get(header::CONTENT_TYPE) {
        None => true,
        Some(value) => value
            .to_str()
            .is_ok_and(|v| v.starts_with("text/plain")),
    }
}

/// Response for a request whose handler panicked. The panic message stays
/// in the log.
pub(crate) fn panic_response(payload: Box<dyn Any + Send + 'static>) -> Response {
    tracing::error!(panic = %panic_message(&*payload), "request handler panicked");
    AppError::with_status(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error").into_response()
}

/// Routes panic reports through `tracing`, with a backtrace.
///
/// Installed once by the binary. Panics inside request handlers are still
/// answered with a 500; this only makes sure every panic is logged in the
/// same place as everything else.
pub fn install_panic_hook() {
    std::panic::set_hook(Box::new(|info| {
        let message = panic_message(info.payload());
        let location = info
            .location()
            .map(|l| l.to_string())
            .unwrap_or_else(|| "<unknown>".to_string());
        let backtrace = std::backtrace::Backtrace::force_capture();
        tracing::error!(%message, %location, %backtrace, "panic");
    }));
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "<non-string panic payload>".to_string()
    }
}
