//! Error types for the session layer.

use std::time::Duration;

/// Errors that can occur while resolving or managing sessions.
///
/// The first group means "this request has no usable session" and is
/// routine. The second group means the store itself misbehaved.
/// [`is_unresolved`](Self::is_unresolved) tells them apart.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// The request carried no session cookie.
    #[error("no session credentials")]
    MissingCredentials,

    /// The cookie's signature does not match the configured secret.
    #[error("session cookie signature mismatch")]
    InvalidSignature,

    /// No live session exists for the identifier: never created,
    /// destroyed, or its TTL ran out.
    #[error("session not found")]
    NotFound,

    /// The store answered with something that is not a session payload.
    #[error("corrupt session payload: {0}")]
    Corrupt(#[source] serde_json::Error),

    /// The store could not be reached or returned an error.
    #[error("session store error: {0}")]
    Backend(String),

    /// A store round trip exceeded the configured I/O timeout.
    #[error("session store timed out after {0:?}")]
    Timeout(Duration),
}

impl SessionError {
    /// `true` when the error only means the caller is not logged in.
    ///
    /// HTTP requests carry on anonymously on these; connection handshakes
    /// are refused. Everything else is a store failure.
    pub fn is_unresolved(&self) -> bool {
        matches!(
            self,
            Self::MissingCredentials | Self::InvalidSignature | Self::NotFound
        )
    }
}
