//! Shared session state for Cohort.
//!
//! Workers are separate processes and keep nothing about users in memory.
//! Everything they know about a session comes from a store that lives
//! outside all of them, so a cookie set by a request on one worker is good
//! for a WebSocket handshake on any other.
//!
//! 1. **Storage**: the [`SessionStore`] trait and its clients
//!    ([`RedisSessionStore`], [`MemorySessionStore`])
//! 2. **Credentials**: signed session cookies ([`CookieSigner`])
//! 3. **Authentication**: turning a request's cookie into a live
//!    [`SessionRecord`] ([`SessionAuthenticator`])
//!
//! # How it fits in the stack
//!
//! ```text
//! Worker middleware (above)  ← attaches the record to requests/connections
//!     ↕
//! Session Layer (this crate)  ← resolves and refreshes sessions
//!     ↕
//! External store (below)  ← Redis, shared by every worker
//! ```

mod auth;
mod cookie;
mod error;
mod memory;
#[cfg(feature = "redis")]
mod redis;
mod session;
mod store;

pub use auth::SessionAuthenticator;
pub use cookie::CookieSigner;
pub use error::SessionError;
pub use memory::MemorySessionStore;
#[cfg(feature = "redis")]
pub use redis::RedisSessionStore;
pub use session::{SameSitePolicy, SessionRecord, SessionSettings, DEFAULT_SESSION_TTL};
pub use store::{SessionStore, generate_session_id};
