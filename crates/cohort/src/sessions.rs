//! Session access for request handlers.
//!
//! The authenticate middleware leaves a [`CurrentSession`] in every
//! request's extensions. Handlers read it with the [`CurrentSession`] or
//! [`Authenticated`] extractors, and start or end sessions through the
//! [`Sessions`] extension.

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum_extra::extract::cookie::{Cookie, SameSite};
use cohort_protocol::SessionId;
use cohort_session::{SameSitePolicy, SessionAuthenticator, SessionRecord, SessionStore};

use crate::boundary::AppError;

/// The session resolved for this request, if any.
///
/// `None` means anonymous: no cookie, a bad signature, or a session that
/// no longer exists.
#[derive(Debug, Clone, Default)]
pub struct CurrentSession(pub Option<SessionRecord>);

impl CurrentSession {
    pub fn record(&self) -> Option<&SessionRecord> {
        self.0.as_ref()
    }

    pub fn is_anonymous(&self) -> bool {
        self.0.is_none()
    }
}

impl<S: Send + Sync> FromRequestParts<S> for CurrentSession {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<CurrentSession>()
            .cloned()
            .ok_or_else(|| AppError::new("session middleware is not installed"))
    }
}

/// Like [`CurrentSession`], but rejects anonymous requests with 401.
///
/// Every persistent-connection entry point uses it: there are no anonymous
/// connections.
#[derive(Debug, Clone)]
pub struct Authenticated(pub SessionRecord);

impl<S: Send + Sync> FromRequestParts<S> for Authenticated {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let CurrentSession(record) = CurrentSession::from_request_parts(parts, state).await?;
        record.map(Authenticated).ok_or_else(AppError::unauthorized)
    }
}

/// Starts and ends sessions. Available to handlers as
/// `Extension<Sessions<S>>`.
///
/// Whether a user may log in is the application's call; this only records
/// the outcome in the shared store and produces the cookie.
#[derive(Debug, Clone)]
pub struct Sessions<S> {
    auth: SessionAuthenticator<S>,
}

impl<S: SessionStore> Sessions<S> {
    pub fn new(auth: SessionAuthenticator<S>) -> Self {
        Self { auth }
    }

    /// Creates a session holding `payload` and returns the cookie to set.
    pub async fn login(
        &self,
        payload: serde_json::Value,
    ) -> Result<(SessionId, Cookie<'static>), AppError> {
        let (id, value) = self.auth.login(payload).await?;
        Ok((id, self.session_cookie(value)))
    }

    /// Destroys a session and returns a cookie that clears it.
    pub async fn logout(&self, id: &SessionId) -> Result<Cookie<'static>, AppError> {
        self.auth.logout(id).await?;
        Ok(self.removal_cookie())
    }

    pub fn authenticator(&self) -> &SessionAuthenticator<S> {
        &self.auth
    }

    fn session_cookie(&self, value: String) -> Cookie<'static> {
        let settings = self.auth.settings();
        let max_age = time::Duration::try_from(settings.ttl).unwrap_or(time::Duration::MAX);
        Cookie::build((settings.cookie_name.clone(), value))
            .path("/")
            .http_only(true)
            .secure(settings.secure)
            .same_site(same_site(settings.same_site))
            .max_age(max_age)
            .build()
    }

    fn removal_cookie(&self) -> Cookie<'static> {
        let settings = self.auth.settings();
        Cookie::build((settings.cookie_name.clone(), String::new()))
            .path("/")
            .http_only(true)
            .secure(settings.secure)
            .same_site(same_site(settings.same_site))
            .max_age(time::Duration::ZERO)
            .expires(time::OffsetDateTime::UNIX_EPOCH)
            .build()
    }
}

fn same_site(policy: SameSitePolicy) -> SameSite {
    match policy {
        SameSitePolicy::Strict => SameSite::Strict,
        SameSitePolicy::Lax => SameSite::Lax,
        SameSitePolicy::None => SameSite::None,
    }
}
