//! Session types: the record a store hands out, and the settings that
//! govern how sessions live and travel.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use cohort_protocol::SessionId;
use tokio::time::Instant;

/// Sessions live for seven days after their last use.
pub const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(7 * 24 * 3600);

// ---------------------------------------------------------------------------
// SessionSettings
// ---------------------------------------------------------------------------

/// Configuration for sessions and the cookie that carries their id.
///
/// `cookie_name` and `secret` have no usable default. A worker refuses to
/// start with them empty; see [`validate`](Self::validate).
#[derive(Clone)]
pub struct SessionSettings {
    /// Sliding time-to-live. Every authenticated access pushes expiry to
    /// `now + ttl`.
    pub ttl: Duration,

    /// Name of the session cookie.
    pub cookie_name: String,

    /// Secret used to sign the cookie value.
    pub secret: String,

    /// Emit the `Secure` cookie attribute.
    pub secure: bool,

    /// `SameSite` cookie attribute.
    pub same_site: SameSitePolicy,

    /// Prefix of session keys in the store.
    pub key_prefix: String,

    /// Upper bound on one store round trip.
    pub io_timeout: Duration,
}

impl SessionSettings {
    /// Returns the name of the first required field that is empty.
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.cookie_name.trim().is_empty() {
            return Err("session cookie name");
        }
        if self.secret.is_empty() {
            return Err("session secret");
        }
        if self.ttl.is_zero() {
            return Err("session ttl");
        }
        Ok(())
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            ttl: DEFAULT_SESSION_TTL,
            cookie_name: String::new(),
            secret: String::new(),
            secure: false,
            same_site: SameSitePolicy::Lax,
            key_prefix: "sess:".to_string(),
            io_timeout: Duration::from_secs(2),
        }
    }
}

impl fmt::Debug for SessionSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionSettings")
            .field("ttl", &self.ttl)
            .field("cookie_name", &self.cookie_name)
            .field("secret", &"<redacted>")
            .field("secure", &self.secure)
            .field("same_site", &self.same_site)
            .field("key_prefix", &self.key_prefix)
            .field("io_timeout", &self.io_timeout)
            .finish()
    }
}

/// The `SameSite` attribute of the session cookie.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SameSitePolicy {
    Strict,
    Lax,
    /// Browsers only accept this together with `Secure`.
    None,
}

impl FromStr for SameSitePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "strict" => Ok(Self::Strict),
            "lax" => Ok(Self::Lax),
            "none" => Ok(Self::None),
            other => Err(format!("unknown SameSite policy `{other}`")),
        }
    }
}

// ---------------------------------------------------------------------------
// SessionRecord
// ---------------------------------------------------------------------------

/// A session as read from the shared store.
///
/// Only valid for the request (or handshake) that loaded it: the store is
/// the single source of truth and another worker may change or destroy
/// the session at any time.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionRecord {
    pub id: SessionId,

    /// Whatever the application stored at login. Opaque to Cohort.
    pub payload: serde_json::Value,

    /// When the session expires unless it is touched again.
    pub expires_at: Instant,
}

impl SessionRecord {
    /// Time left before expiry, zero if already past.
    pub fn remaining(&self) -> Duration {
        self.expires_at.saturating_duration_since(Instant::now())
    }
}
