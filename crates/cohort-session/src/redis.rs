//! Redis session store client.
//!
//! Each session is one string key, `<prefix><id>`, holding the payload as
//! JSON. Expiry is Redis's own key TTL, so sessions vanish without any
//! worker sweeping them and every worker sees the same deadline.

use std::future::Future;
use std::time::Duration;

use cohort_protocol::SessionId;
use redis::RedisResult;
use redis::aio::ConnectionManager;
use tokio::time::Instant;

use crate::store::generate_session_id;
use crate::{SessionError, SessionRecord, SessionSettings, SessionStore};

/// How many fresh ids `create` tries before giving up. A collision on a
/// 128-bit random id means something is wrong with the RNG, not bad luck.
const CREATE_ATTEMPTS: usize = 3;

/// A worker's client of the shared Redis session store.
///
/// Cloning shares the underlying multiplexed connection, which reconnects
/// by itself after the server goes away.
#[derive(Clone)]
pub struct RedisSessionStore {
    conn: ConnectionManager,
    key_prefix: String,
    ttl: Duration,
    io_timeout: Duration,
}

impl RedisSessionStore {
    /// Connects to the store at `url` (`redis://host:port/db`).
    ///
    /// # Errors
    /// [`SessionError::Backend`] if the URL is invalid or the first
    /// connection fails; [`SessionError::Timeout`] if it takes longer than
    /// the configured I/O timeout.
    pub async fn connect(url: &str, settings: &SessionSettings) -> Result<Self, SessionError> {
        let client = redis::Client::open(url).map_err(backend)?;
        let conn = match tokio::time::timeout(
            settings.io_timeout,
            client.get_connection_manager(),
        )
        .await
        {
            Ok(conn) => conn.map_err(backend)?,
            Err(_) => return Err(SessionError::Timeout(settings.io_timeout)),
        };

        tracing::info!(url = %redact_url(url), "connected to session store");
        Ok(Self {
            conn,
            key_prefix: settings.key_prefix.clone(),
            ttl: settings.ttl,
            io_timeout: settings.io_timeout,
        })
    }

    fn key(&self, id: &SessionId) -> String {
        format!("{}{}", self.key_prefix, id.as_str())
    }

    fn ttl_millis(&self) -> u64 {
        u64::try_from(self.ttl.as_millis()).unwrap_or(u64::MAX)
    }

    /// Runs one round trip under the I/O timeout.
    async fn bounded<T>(
        &self,
        fut: impl Future<Output = RedisResult<T>>,
    ) -> Result<T, SessionError> {
        match tokio::time::timeout(self.io_timeout, fut).await {
            Ok(result) => result.map_err(backend),
            Err(_) => Err(SessionError::Timeout(self.io_timeout)),
        }
    }
}

impl SessionStore for RedisSessionStore {
    async fn resolve(&self, id: &SessionId) -> Result<SessionRecord, SessionError> {
        let key = self.key(id);
        let mut conn = self.conn.clone();

        let (raw, pttl): (Option<String>, i64) = self
            .bounded(redis::pipe().get(&key).pttl(&key).query_async(&mut conn))
            .await?;

        let raw = raw.ok_or(SessionError::NotFound)?;
        let payload = serde_json::from_str(&raw).map_err(SessionError::Corrupt)?;
        let remaining = match pttl {
            // Expired between GET and PTTL.
            -2 => return Err(SessionError::NotFound),
            // Written without a TTL by someone else; treat as freshly set.
            ms if ms < 0 => self.ttl,
            ms => Duration::from_millis(ms.unsigned_abs()),
        };

        Ok(SessionRecord {
            id: id.clone(),
            payload,
            expires_at: Instant::now() + remaining,
        })
    }

    async fn create(&self, payload: serde_json::Value) -> Result<SessionId, SessionError> {
        let value = serde_json::to_string(&payload).map_err(SessionError::Corrupt)?;
        let mut conn = self.conn.clone();

        for _ in 0..CREATE_ATTEMPTS {
            let id = generate_session_id();
            let key = self.key(&id);
            let set: Option<String> = self
                .bounded(
                    redis::cmd("SET")
                        .arg(&key)
                        .arg(&value)
                        .arg("PX")
                        .arg(self.ttl_millis())
                        .arg("NX")
                        .query_async(&mut conn),
                )
                .await?;
            if set.is_some() {
                tracing::debug!(session_id = %id, "session created");
                return Ok(id);
            }
            tracing::warn!("session id collision, retrying");
        }
        Err(SessionError::Backend(
            "could not allocate an unused session id".into(),
        ))
    }

    async fn touch(&self, id: &SessionId) -> Result<(), SessionError> {
        let key = self.key(id);
        let mut conn = self.conn.clone();

        let updated: i64 = self
            .bounded(
                redis::cmd("PEXPIRE")
                    .arg(&key)
                    .arg(self.ttl_millis())
                    .query_async(&mut conn),
            )
            .await?;
        if updated == 0 {
            return Err(SessionError::NotFound);
        }
        Ok(())
    }

    async fn destroy(&self, id: &SessionId) -> Result<(), SessionError> {
        let key = self.key(id);
        let mut conn = self.conn.clone();

        let _removed: i64 = self
            .bounded(redis::cmd("DEL").arg(&key).query_async(&mut conn))
            .await?;
        tracing::debug!(session_id = %id, "session destroyed");
        Ok(())
    }

    fn ttl(&self) -> Duration {
        self.ttl
    }
}

impl std::fmt::Debug for RedisSessionStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisSessionStore")
            .field("key_prefix", &self.key_prefix)
            .field("ttl", &self.ttl)
            .field("io_timeout", &self.io_timeout)
            .finish_non_exhaustive()
    }
}

fn backend(err: redis::RedisError) -> SessionError {
    SessionError::Backend(err.to_string())
}

/// Drops any `user:password@` part so store URLs can be logged.
fn redact_url(url: &str) -> String {
    match (url.find("://"), url.rfind('@')) {
        (Some(scheme_end), Some(at)) if at > scheme_end => {
            format!("{}://***@{}", &url[..scheme_end], &url[at + 1..])
        }
        _ => url.to_string(),
    }
}
