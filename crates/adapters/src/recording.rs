//! An adapter that records what it is asked to send. Used to observe routing
//! in tests and dry runs without a transport.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use agentmesh_core::{DeliveryError, UniversalMessage};
use async_trait::async_trait;
use futures::stream::{self, StreamExt};

use crate::{Ack, Adapter, DeliveryResult, MessageStream};

#[derive(Debug, Clone, PartialEq)]
pub struct SentMessage {
    pub destination: String,
    pub message: UniversalMessage,
}

#[derive(Default)]
pub struct RecordingAdapter {
    sent: Mutex<Vec<SentMessage>>,
    failures: Mutex<HashMap<String, DeliveryError>>,
    inbound: Mutex<HashMap<String, Vec<UniversalMessage>>>,
    delay: Mutex<HashMap<String, Duration>>,
}

impl RecordingAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every send to `destination` fails with `error`.
    pub fn fail_on(&self, destination: &str, error: DeliveryError) {
        lock(&self.failures).insert(destination.to_string(), error);
    }

    /// Sends to `destination` take `delay` before completing.
    pub fn delay_on(&self, destination: &str, delay: Duration) {
        lock(&self.delay).insert(destination.to_string(), delay);
    }

    /// Queue a message to be yielded by `consume(subscription)`.
    pub fn push_inbound(&self, subscription: &str, message: UniversalMessage) {
        lock(&self.inbound)
            .entry(subscription.to_string())
            .or_default()
            .push(message);
    }

    /// Successful sends, in completion order.
    pub fn sent(&self) -> Vec<SentMessage> {
        lock(&self.sent).clone()
    }

    pub fn sent_to(&self, destination: &str) -> Vec<UniversalMessage> {
        lock(&self.sent)
            .iter()
            .filter(|s| s.destination == destination)
            .map(|s| s.message.clone())
            .collect()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

#[async_trait]
impl Adapter for RecordingAdapter {
    fn kind(&self) -> &'static str {
        "recording"
    }

    async fn send(&self, message: &UniversalMessage, destination: &str) -> DeliveryResult<Ack> {
        let delay = lock(&self.delay).get(destination).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(err) = lock(&self.failures).get(destination).cloned() {
            return Err(err);
        }
        lock(&self.sent).push(SentMessage {
            destination: destination.to_string(),
            message: message.clone(),
        });
        Ok(Ack::new(message, destination))
    }

    /// Yields the queued inbound messages, then stays open.
    async fn consume(&self, subscription: &str) -> DeliveryResult<MessageStream> {
        let queued = lock(&self.inbound).remove(subscription).unwrap_or_default();
        Ok(stream::iter(queued).chain(stream::pending()).boxed())
    }
}
