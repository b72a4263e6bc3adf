//! Redis pub/sub broker client.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use cohort_protocol::FanoutMessage;
use futures_util::StreamExt;
use redis::aio::{ConnectionManager, PubSub};
use redis::{Client, RedisResult};

use crate::{FanoutBus, FanoutError, MessageHandler, Subscription};

/// Pause between attempts to re-establish a dropped subscription.
const RESUBSCRIBE_DELAY: Duration = Duration::from_secs(1);

/// A worker's client of the Redis broker.
///
/// Publishing goes through one auto-reconnecting multiplexed connection.
/// Each subscription holds its own dedicated connection, as Redis
/// requires, and re-subscribes by itself when that connection drops.
#[derive(Clone)]
pub struct RedisBus {
    client: Arc<Client>,
    conn: ConnectionManager,
    io_timeout: Duration,
}

impl RedisBus {
    /// Connects to the broker at `url`.
    pub async fn connect(url: &str, io_timeout: Duration) -> Result<Self, FanoutError> {
        let client = Client::open(url).map_err(broker)?;
        let conn = bounded(io_timeout, client.get_connection_manager()).await?;

        tracing::info!("connected to fan-out broker");
        Ok(Self {
            client: Arc::new(client),
            conn,
            io_timeout,
        })
    }
}

impl FanoutBus for RedisBus {
    async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<(), FanoutError> {
        let mut conn = self.conn.clone();
        let receivers: i64 = bounded(
            self.io_timeout,
            redis::cmd("PUBLISH")
                .arg(channel)
                .arg(payload)
                .query_async(&mut conn),
        )
        .await?;
        tracing::trace!(channel, receivers, "published");
        Ok(())
    }

    async fn subscribe<H: MessageHandler>(
        &self,
        channel: &str,
        handler: H,
    ) -> Result<Subscription, FanoutError> {
        // The first subscription must succeed before we return, so callers
        // know that later publishes will be seen.
        let first = open_subscription(&self.client, channel, self.io_timeout).await?;

        let client = Arc::clone(&self.client);
        let name = channel.to_string();
        let io_timeout = self.io_timeout;

        let task = tokio::spawn(async move {
            let mut pubsub = Some(first);
            loop {
                let mut current = match pubsub.take() {
                    Some(current) => current,
                    None => match open_subscription(&client, &name, io_timeout).await {
                        Ok(current) => {
                            tracing::warn!(
                                channel = %name,
                                "re-subscribed; messages published while disconnected were lost"
                            );
                            current
                        }
                        Err(e) => {
                            tracing::warn!(channel = %name, error = %e, "re-subscribe failed");
                            tokio::time::sleep(RESUBSCRIBE_DELAY).await;
                            continue;
                        }
                    },
                };

                let mut messages = current.on_message();
                while let Some(msg) = messages.next().await {
                    let message =
                        FanoutMessage::new(msg.get_channel_name(), msg.get_payload_bytes());
                    handler.handle(message);
                }
                tracing::warn!(channel = %name, "subscription connection lost");
            }
        });

        tracing::debug!(channel, "subscribed");
        Ok(Subscription::new(channel, task))
    }
}

impl std::fmt::Debug for RedisBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisBus")
            .field("io_timeout", &self.io_timeout)
            .finish_non_exhaustive()
    }
}

async fn open_subscription(
    client: &Client,
    channel: &str,
    io_timeout: Duration,
) -> Result<PubSub, FanoutError> {
    let mut pubsub = bounded(io_timeout, client.get_async_pubsub()).await?;
    bounded(io_timeout, pubsub.subscribe(channel)).await?;
    Ok(pubsub)
}

async fn bounded<T>(
    io_timeout: Duration,
    fut: impl Future<Output = RedisResult<T>>,
) -> Result<T, FanoutError> {
    match tokio::time::timeout(io_timeout, fut).await {
        Ok(result) => result.map_err(broker),
        Err(_) => Err(FanoutError::Timeout(io_timeout)),
    }
}

fn broker(err: redis::RedisError) -> FanoutError {
    FanoutError::Broker(err.to_string())
}
