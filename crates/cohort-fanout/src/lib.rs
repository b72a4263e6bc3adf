//! Cross-worker fan-out for Cohort.
//!
//! A worker only holds the connections it accepted. To reach a user whose
//! socket lives in another process, application code publishes on the
//! [`FanoutBus`]; every worker (the publisher included) receives the
//! message and writes it to the matching connections it owns.
//!
//! ```text
//! Broadcaster::to_room("lobby", ..)
//!     │ publish "<prefix>:deliver"
//!     ▼
//! Broker (Redis) ──► worker 1 handler ──► ConnectionRegistry::dispatch ──► local sockets
//!                └─► worker 2 handler ──► ConnectionRegistry::dispatch ──► local sockets
//! ```
//!
//! Delivery is best-effort. Messages published while the broker is away
//! are lost and logged.

mod broadcaster;
mod bus;
mod error;
mod memory;
#[cfg(feature = "redis")]
mod redis;
mod registry;

pub use broadcaster::{Broadcaster, attach_registry, dispatch_channel};
pub use bus::{FanoutBus, MessageHandler, Subscription, SubscriptionEnd};
pub use error::FanoutError;
pub use memory::{MemoryBroker, MemoryBus};
#[cfg(feature = "redis")]
pub use redis::RedisBus;
pub use registry::{ConnectionHandle, ConnectionRegistry, OutboundSender};
