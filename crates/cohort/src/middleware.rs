//! Request middleware: session authentication, response hardening, CORS
//! and request logging.

use axum::extract::{Request, State};
use axum::http::header::{self, HeaderValue};
use axum::http::Method;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum_extra::extract::CookieJar;
use cohort_session::{SessionAuthenticator, SessionStore};
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::set_header::SetResponseHeaderLayer;
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, HttpMakeClassifier, TraceLayer};
use tracing::Level;

use crate::boundary::AppError;
use crate::sessions::CurrentSession;

/// Resolves the request's session cookie and attaches the result as a
/// [`CurrentSession`].
///
/// An unresolved session lets the request through as anonymous; routes
/// that need a session reject it themselves. A store failure ends the
/// request with 503.
pub async fn authenticate<S: SessionStore>(
    State(auth): State<SessionAuthenticator<S>>,
    jar: CookieJar,
    mut request: Request,
    next: Next,
) -> Response {
    let cookie = jar.get(&auth.settings().cookie_name).map(|c| c.value().to_owned());

    let current = match auth.authenticate(cookie.as_deref()).await {
        Ok(record) => CurrentSession(Some(record)),
        Err(e) if e.is_unresolved() => {
            if cookie.is_some() {
                tracing::debug!(reason = %e, "session cookie not resolved, continuing anonymously");
            }
            CurrentSession(None)
        }
        Err(e) => {
            tracing::warn!(error = %e, "session store failure");
            return AppError::from(e).into_response();
        }
    };

    request.extensions_mut().insert(current);
    next.run(request).await
}

pub(crate) fn frame_options() -> SetResponseHeaderLayer<HeaderValue> {
    SetResponseHeaderLayer::overriding(header::X_FRAME_OPTIONS, HeaderValue::from_static("SAMEORIGIN"))
}

pub(crate) fn xss_protection() -> SetResponseHeaderLayer<HeaderValue> {
    SetResponseHeaderLayer::overriding(
        header::X_XSS_PROTECTION,
        HeaderValue::from_static("1; mode=block"),
    )
}

/// Credentialed CORS for an explicit list of origins. `None` when the list
/// is empty: no CORS headers at all.
pub(crate) fn cors(origins: &[HeaderValue]) -> Option<CorsLayer> {
    if origins.is_empty() {
        return None;
    }
    Some(
        CorsLayer::new()
            .allow_origin(AllowOrigin::list(origins.iter().cloned()))
            .allow_credentials(true)
            .allow_methods([Method::GET, Method::POST, Method::DELETE])
            .allow_headers([header::CONTENT_TYPE]),
    )
}

/// One INFO line per finished request, with method, path, status and
/// latency. `None` in production.
pub(crate) fn request_log(production: bool) -> Option<TraceLayer<HttpMakeClassifier>> {
    if production {
        return None;
    }
    Some(
        TraceLayer::new_for_http()
            .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
            .on_response(DefaultOnResponse::new().level(Level::INFO)),
    )
}
