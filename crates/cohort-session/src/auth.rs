//! Turning a request's session cookie into a live session.
//!
//! The worker calls [`SessionAuthenticator::authenticate`] for every HTTP
//! request and every connection handshake. Nothing is remembered between
//! calls: each one reads the shared store, so a session created, refreshed
//! or destroyed by any worker is seen by all of them on their next call.

use cohort_protocol::SessionId;
use tokio::time::Instant;

use crate::{CookieSigner, SessionError, SessionRecord, SessionSettings, SessionStore};

/// Resolves signed session cookies against the shared store.
#[derive(Debug, Clone)]
pub struct SessionAuthenticator<S> {
    store: S,
    signer: CookieSigner,
    settings: SessionSettings,
}

impl<S: SessionStore> SessionAuthenticator<S> {
    /// # Errors
    /// Fails if the secret cannot key the cookie signature.
    pub fn new(store: S, settings: SessionSettings) -> Result<Self, SessionError> {
        let signer = CookieSigner::new(settings.secret.as_bytes())?;
        Ok(Self {
            store,
            signer,
            settings,
        })
    }

    /// Resolves the session named by a cookie value and refreshes its TTL.
    ///
    /// `cookie` is the raw value of the session cookie, if the request had
    /// one. The returned record carries the refreshed expiry.
    ///
    /// # Errors
    /// - [`SessionError::MissingCredentials`] when there is no cookie
    /// - [`SessionError::InvalidSignature`] when it does not verify
    /// - [`SessionError::NotFound`] when the session is gone
    /// - a store error when the store fails or times out
    pub async fn authenticate(
        &self,
        cookie: Option<&str>,
    ) -> Result<SessionRecord, SessionError> {
        let value = cookie.ok_or(SessionError::MissingCredentials)?;
        let id = self.signer.unsign(value)?;

        let mut record = self.store.resolve(&id).await?;
        self.store.touch(&id).await?;
        record.expires_at = record.expires_at.max(Instant::now() + self.store.ttl());

        tracing::trace!(session_id = %record.id, "session resolved");
        Ok(record)
    }

    /// Creates a session and returns its id with the signed cookie value.
    pub async fn login(
        &self,
        payload: serde_json::Value,
    ) -> Result<(SessionId, String), SessionError> {
        let id = self.store.create(payload).await?;
        let cookie = self.signer.sign(&id);
        tracing::info!(session_id = %id, "session started");
        Ok((id, cookie))
    }

    /// Destroys a session.
    pub async fn logout(&self, id: &SessionId) -> Result<(), SessionError> {
        self.store.destroy(id).await?;
        tracing::info!(session_id = %id, "session ended");
        Ok(())
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn signer(&self) -> &CookieSigner {
        &self.signer
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::MemorySessionStore;

    const TTL: Duration = Duration::from_secs(100);

    fn authenticator() -> SessionAuthenticator<MemorySessionStore> {
        let settings = SessionSettings {
            ttl: TTL,
            cookie_name: "cohort.sid".into(),
            secret: "s3cret".into(),
            ..SessionSettings::default()
        };
        SessionAuthenticator::new(MemorySessionStore::new(TTL), settings).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_authenticate_valid_cookie_returns_record() {
        let auth = authenticator();
        let (id, cookie) = auth.login(json!({"user": 7})).await.unwrap();

        let record = auth.authenticate(Some(&cookie)).await.unwrap();
        assert_eq!(record.id, id);
        assert_eq!(record.payload, json!({"user": 7}));
    }

    #[tokio::test(start_paused = true)]
    async fn test_authenticate_refreshes_ttl() {
        let auth = authenticator();
        let (_, cookie) = auth.login(json!(null)).await.unwrap();

        tokio::time::advance(Duration::from_secs(80)).await;
        let record = auth.authenticate(Some(&cookie)).await.unwrap();
        assert_eq!(record.remaining(), TTL);

        // Alive 160s after login thanks to the refresh at 80s.
        tokio::time::advance(Duration::from_secs(80)).await;
        assert!(auth.authenticate(Some(&cookie)).await.is_ok());
    }

    #[tokio::test]
    async fn test_authenticate_without_cookie_is_missing_credentials() {
        let err = authenticator().authenticate(None).await.unwrap_err();
        assert!(matches!(err, SessionError::MissingCredentials));
    }

    #[tokio::test]
    async fn test_authenticate_forged_cookie_is_invalid_signature() {
        let auth = authenticator();
        let forged = CookieSigner::new("other").unwrap().sign(&SessionId::new("abc"));

        let err = auth.authenticate(Some(&forged)).await.unwrap_err();
        assert!(matches!(err, SessionError::InvalidSignature));
    }

    #[tokio::test]
    async fn test_authenticate_after_logout_is_not_found() {
        let auth = authenticator();
        let (id, cookie) = auth.login(json!(1)).await.unwrap();
        auth.logout(&id).await.unwrap();

        let err = auth.authenticate(Some(&cookie)).await.unwrap_err();
        assert!(matches!(err, SessionError::NotFound));
    }

    #[tokio::test]
    async fn test_authenticate_store_outage_is_not_unresolved() {
        let auth = authenticator();
        let (_, cookie) = auth.login(json!(1)).await.unwrap();
        auth.store().set_unavailable(true);

        let err = auth.authenticate(Some(&cookie)).await.unwrap_err();
        assert!(!err.is_unresolved());
    }
}
