//! The publish/subscribe contract every broker client implements.

use std::any::Any;
use std::future::Future;

use cohort_protocol::FanoutMessage;
use tokio::task::JoinHandle;

use crate::FanoutError;

/// Receives every message published on a subscribed channel.
///
/// Called from the subscription's receive task, one message at a time, in
/// the order the broker delivered them. Handlers should not block: hand
/// slow work to another task.
///
/// A panic in a handler ends the subscription and is reported through
/// [`Subscription::closed`]. Workers treat that as fatal.
pub trait MessageHandler: Send + Sync + 'static {
    fn handle(&self, message: FanoutMessage);
}

impl<F> MessageHandler for F
where
    F: Fn(FanoutMessage) + Send + Sync + 'static,
{
    fn handle(&self, message: FanoutMessage) {
        self(message)
    }
}

/// A client of the broker shared by all workers.
///
/// Each worker owns its own client value; clones share one connection.
pub trait FanoutBus: Clone + Send + Sync + 'static {
    /// Sends `payload` to every subscriber of `channel` on every worker.
    ///
    /// # Errors
    /// Fails when the broker is unreachable. The message is then lost;
    /// there is no retry queue.
    fn publish(
        &self,
        channel: &str,
        payload: Vec<u8>,
    ) -> impl Future<Output = Result<(), FanoutError>> + Send;

    /// Registers `handler` for every message published on `channel` from
    /// now on, by any worker including this one.
    ///
    /// Returns once the broker has confirmed the subscription, so a
    /// publish issued after this returns is guaranteed to be seen.
    fn subscribe<H: MessageHandler>(
        &self,
        channel: &str,
        handler: H,
    ) -> impl Future<Output = Result<Subscription, FanoutError>> + Send;
}

/// Why a subscription's receive loop ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionEnd {
    /// The loop finished on its own (the broker client went away).
    Stopped,
    /// The loop was aborted.
    Cancelled,
    /// The handler panicked with this message.
    Panicked(String),
}

impl SubscriptionEnd {
    pub fn is_panic(&self) -> bool {
        matches!(self, Self::Panicked(_))
    }
}

/// A live subscription. Dropping it unsubscribes.
#[derive(Debug)]
pub struct Subscription {
    channel: String,
    task: Option<JoinHandle<()>>,
}

impl Subscription {
    pub(crate) fn new(channel: impl Into<String>, task: JoinHandle<()>) -> Self {
        Self {
            channel: channel.into(),
            task: Some(task),
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Waits until the receive loop ends and reports why.
    ///
    /// Only reports the first time; later calls return
    /// [`SubscriptionEnd::Stopped`] immediately.
    pub async fn closed(&mut self) -> SubscriptionEnd {
        let Some(task) = self.task.as_mut() else {
            return SubscriptionEnd::Stopped;
        };
        let result = task.await;
        self.task = None;

        match result {
            Ok(()) => SubscriptionEnd::Stopped,
            Err(e) if e.is_panic() => SubscriptionEnd::Panicked(panic_message(e.into_panic())),
            Err(_) => SubscriptionEnd::Cancelled,
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

/// Extracts the message of a panic payload.
pub(crate) fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
