//! Typed publishing for application code, and the worker side that turns
//! published deliveries back into writes on local connections.

use cohort_protocol::{Codec, Delivery, FanoutMessage, JsonCodec, Recipient, SessionId};

use crate::{ConnectionRegistry, FanoutBus, FanoutError, Subscription};

/// The channel carrying [`Delivery`] payloads for a deployment.
pub fn dispatch_channel(prefix: &str) -> String {
    format!("{prefix}:deliver")
}

/// Publishes events to connections on every worker.
///
/// Business logic holds one of these (cheap to clone) and never needs to
/// know which worker a connection lives on.
#[derive(Debug, Clone)]
pub struct Broadcaster<B> {
    bus: B,
    channel: String,
    codec: JsonCodec,
}

impl<B: FanoutBus> Broadcaster<B> {
    pub fn new(bus: B, channel: impl Into<String>) -> Self {
        Self {
            bus,
            channel: channel.into(),
            codec: JsonCodec,
        }
    }

    /// Every connection on every worker.
    pub async fn to_all(
        &self,
        event: impl Into<String>,
        data: serde_json::Value,
    ) -> Result<(), FanoutError> {
        self.deliver(Recipient::All, event, data).await
    }

    /// Every connection of one session, wherever it is attached.
    pub async fn to_session(
        &self,
        session_id: &SessionId,
        event: impl Into<String>,
        data: serde_json::Value,
    ) -> Result<(), FanoutError> {
        self.deliver(Recipient::Session(session_id.clone()), event, data)
            .await
    }

    /// Every member of a room, on every worker.
    pub async fn to_room(
        &self,
        room: impl Into<String>,
        event: impl Into<String>,
        data: serde_json::Value,
    ) -> Result<(), FanoutError> {
        self.deliver(Recipient::Room(room.into()), event, data).await
    }

    async fn deliver(
        &self,
        to: Recipient,
        event: impl Into<String>,
        data: serde_json::Value,
    ) -> Result<(), FanoutError> {
        let delivery = Delivery {
            to,
            event: event.into(),
            data,
        };
        let payload = self.codec.encode(&delivery)?;
        if let Err(e) = self.bus.publish(&self.channel, payload).await {
            tracing::warn!(
                channel = %self.channel,
                event = %delivery.event,
                error = %e,
                "delivery lost"
            );
            return Err(e);
        }
        Ok(())
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn bus(&self) -> &B {
        &self.bus
    }
}

/// Subscribes the worker's registry to the dispatch channel.
///
/// Every delivery published by any worker is decoded and written to the
/// matching local connections. Undecodable payloads are logged and
/// skipped.
pub async fn attach_registry<B: FanoutBus>(
    bus: &B,
    channel: &str,
    registry: ConnectionRegistry,
) -> Result<Subscription, FanoutError> {
    let codec = JsonCodec;
    bus.subscribe(channel, move |message: FanoutMessage| {
        match codec.decode::<Delivery>(&message.payload) {
            Ok(delivery) => {
                let delivered = registry.dispatch(&delivery);
                tracing::trace!(event = %delivery.event, delivered, "delivery dispatched");
            }
            Err(e) => {
                tracing::warn!(channel = %message.channel, error = %e, "undecodable delivery dropped");
            }
        }
    })
    .await
}
