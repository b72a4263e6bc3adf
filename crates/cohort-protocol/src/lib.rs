//! Wire protocol for Cohort.
//!
//! This crate defines what travels between the pieces of the gateway:
//!
//! - **Identifiers** ([`SessionId`], [`WorkerId`]) shared by every layer.
//! - **Realtime messages** ([`Envelope`], [`ClientMessage`],
//!   [`ServerMessage`]) spoken over a persistent connection.
//! - **Fan-out payloads** ([`FanoutMessage`], [`Delivery`], [`Recipient`])
//!   that cross process boundaries through the broker.
//! - **Codec** ([`Codec`] trait, [`JsonCodec`]) for turning all of the
//!   above into bytes.
//!
//! It knows nothing about sockets, stores or processes.
//!
//! ```text
//! Transport (bytes) → Protocol (Envelope / Delivery) → Worker (connections)
//! ```

mod codec;
mod error;
mod types;

pub use codec::{Codec, JsonCodec};
pub use error::ProtocolError;
pub use types::{
    ClientMessage, Delivery, Envelope, FanoutMessage, Recipient,
    ServerMessage, SessionId, WorkerId,
};
