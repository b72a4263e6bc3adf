//! The shared session store contract.

use std::future::Future;
use std::time::Duration;

use cohort_protocol::SessionId;
use rand::Rng;

use crate::{SessionError, SessionRecord};

/// A client of the key-value service that holds every session.
///
/// Each worker owns its own client value; all clients of one deployment
/// point at the same service. Implementations must not cache records:
/// two workers resolving the same id at the same time must see the same
/// payload.
///
/// `Clone` is expected to be cheap (a handle to a shared connection), so
/// the worker can hand a copy to every request.
pub trait SessionStore: Clone + Send + Sync + 'static {
    /// Loads a live session.
    ///
    /// # Errors
    /// [`SessionError::NotFound`] when the id is unknown or expired.
    fn resolve(
        &self,
        id: &SessionId,
    ) -> impl Future<Output = Result<SessionRecord, SessionError>> + Send;

    /// Stores a new session under a fresh id and returns the id.
    fn create(
        &self,
        payload: serde_json::Value,
    ) -> impl Future<Output = Result<SessionId, SessionError>> + Send;

    /// Pushes expiry to `now + ttl` without touching the payload.
    ///
    /// Calls from different workers commute: whichever lands last sets
    /// the TTL, and expiry never moves backwards.
    ///
    /// # Errors
    /// [`SessionError::NotFound`] when the session is already gone.
    fn touch(
        &self,
        id: &SessionId,
    ) -> impl Future<Output = Result<(), SessionError>> + Send;

    /// Deletes the session. Deleting a missing session is not an error.
    fn destroy(
        &self,
        id: &SessionId,
    ) -> impl Future<Output = Result<(), SessionError>> + Send;

    /// The sliding TTL applied by `create` and `touch`.
    fn ttl(&self) -> Duration;
}

/// Generates a random 32-character hex session id (128 bits of entropy).
pub fn generate_session_id() -> SessionId {
    let bytes: [u8; 16] = rand::rng().random();
    SessionId::new(bytes.iter().map(|b| format!("{b:02x}")).collect::<String>())
}
