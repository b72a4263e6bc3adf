//! An in-process session store.
//!
//! Clones of one [`MemorySessionStore`] share the same map, so within a
//! single process they behave like separate clients of one external
//! service. Useful for tests and for running the whole pool in one
//! process; useless across real worker processes.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use cohort_protocol::SessionId;
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::store::generate_session_id;
use crate::{SessionError, SessionRecord, SessionStore};

#[derive(Debug)]
struct Entry {
    payload: serde_json::Value,
    expires_at: Instant,
}

#[derive(Debug, Default)]
struct Shared {
    entries: Mutex<HashMap<String, Entry>>,
    unavailable: AtomicBool,
}

/// Session store backed by a shared in-memory map.
///
/// Expiry follows tokio's clock, so tests can drive it with
/// `tokio::time::pause` and `advance`.
#[derive(Debug, Clone)]
pub struct MemorySessionStore {
    shared: Arc<Shared>,
    ttl: Duration,
}

impl MemorySessionStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            shared: Arc::new(Shared::default()),
            ttl,
        }
    }

    /// Makes every operation fail with [`SessionError::Backend`] until
    /// switched back, as if the service had gone away. Affects all clones.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.shared.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Number of live sessions.
    pub async fn len(&self) -> usize {
        let now = Instant::now();
        let entries = self.shared.entries.lock().await;
        entries.values().filter(|e| e.expires_at > now).count()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    fn check_available(&self) -> Result<(), SessionError> {
        if self.shared.unavailable.load(Ordering::SeqCst) {
            return Err(SessionError::Backend("session store unavailable".into()));
        }
        Ok(())
    }
}

impl SessionStore for MemorySessionStore {
    async fn resolve(&self, id: &SessionId) -> Result<SessionRecord, SessionError> {
        self.check_available()?;
        let now = Instant::now();
        let mut entries = self.shared.entries.lock().await;

        match entries.get(id.as_str()) {
            Some(entry) if entry.expires_at > now => Ok(SessionRecord {
                id: id.clone(),
                payload: entry.payload.clone(),
                expires_at: entry.expires_at,
            }),
            Some(_) => {
                entries.remove(id.as_str());
                Err(SessionError::NotFound)
            }
            None => Err(SessionError::NotFound),
        }
    }

    async fn create(&self, payload: serde_json::Value) -> Result<SessionId, SessionError> {
        self.check_available()?;
        let mut entries = self.shared.entries.lock().await;

        let mut id = generate_session_id();
        while entries.contains_key(id.as_str()) {
            id = generate_session_id();
        }
        entries.insert(
            id.as_str().to_string(),
            Entry {
                payload,
                expires_at: Instant::now() + self.ttl,
            },
        );
        tracing::debug!(session_id = %id, "session created");
        Ok(id)
    }

    async fn touch(&self, id: &SessionId) -> Result<(), SessionError> {
        self.check_available()?;
        let now = Instant::now();
        let mut entries = self.shared.entries.lock().await;

        match entries.get_mut(id.as_str()) {
            Some(entry) if entry.expires_at > now => {
                entry.expires_at = entry.expires_at.max(now + self.ttl);
                Ok(())
            }
            Some(_) => {
                entries.remove(id.as_str());
                Err(SessionError::NotFound)
            }
            None => Err(SessionError::NotFound),
        }
    }

    async fn destroy(&self, id: &SessionId) -> Result<(), SessionError> {
        self.check_available()?;
        self.shared.entries.lock().await.remove(id.as_str());
        tracing::debug!(session_id = %id, "session destroyed");
        Ok(())
    }

    fn ttl(&self) -> Duration {
        self.ttl
    }
}
