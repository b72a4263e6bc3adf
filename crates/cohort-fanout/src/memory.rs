//! In-process broker.
//!
//! A [`MemoryBroker`] stands in for the external broker; each
//! [`MemoryBus`] obtained from it is one worker's client. Used when the
//! whole pool runs inside one process (tests, embedding).

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use cohort_protocol::FanoutMessage;
use dashmap::DashMap;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

use crate::{FanoutBus, FanoutError, MessageHandler, Subscription};

/// Messages a slow subscriber may fall behind by before it starts losing
/// them.
const CHANNEL_CAPACITY: usize = 1024;

#[derive(Debug, Default)]
struct BrokerInner {
    channels: DashMap<String, broadcast::Sender<FanoutMessage>>,
    unavailable: AtomicBool,
}

/// The shared in-memory broker.
#[derive(Debug, Clone, Default)]
pub struct MemoryBroker {
    inner: Arc<BrokerInner>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// A new client of this broker.
    pub fn client(&self) -> MemoryBus {
        MemoryBus {
            broker: self.clone(),
        }
    }

    /// Makes publishing fail until switched back, as if the broker were
    /// unreachable. Existing subscriptions stay attached.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.inner.unavailable.store(unavailable, Ordering::SeqCst);
    }

    fn sender(&self, channel: &str) -> broadcast::Sender<FanoutMessage> {
        self.inner
            .channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0)
            .clone()
    }
}

/// One worker's client of a [`MemoryBroker`].
#[derive(Debug, Clone)]
pub struct MemoryBus {
    broker: MemoryBroker,
}

impl FanoutBus for MemoryBus {
    async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<(), FanoutError> {
        if self.broker.inner.unavailable.load(Ordering::SeqCst) {
            return Err(FanoutError::Broker("broker unavailable".into()));
        }
        // No subscribers is not an error: nobody was listening.
        let receivers = self
            .broker
            .sender(channel)
            .send(FanoutMessage::new(channel, payload))
            .unwrap_or(0);
        tracing::trace!(channel, receivers, "published");
        Ok(())
    }

    async fn subscribe<H: MessageHandler>(
        &self,
        channel: &str,
        handler: H,
    ) -> Result<Subscription, FanoutError> {
        let mut rx = self.broker.sender(channel).subscribe();
        let name = channel.to_string();

        let task = tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(message) => handler.handle(message),
                    Err(RecvError::Lagged(missed)) => {
                        tracing::warn!(channel = %name, missed, "subscriber lagged, messages dropped");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });

        tracing::debug!(channel, "subscribed");
        Ok(Subscription::new(channel, task))
    }
}
