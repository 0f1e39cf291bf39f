//! In-process broker with topic and queue semantics.
//!
//! Topics model push-callback subscription: a publish hands the body to every
//! live subscriber immediately and the delivery counts as acknowledged.
//! Queues model pull-poll with explicit ack: a received message stays
//! in-flight until it is acked, and goes back to the head of the queue when it
//! is nacked or its consumer goes away.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use agentmesh_core::{DeliveryError, UniversalMessage};
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use tokio::sync::{mpsc, Notify};
use tracing::{debug, info, warn};

use crate::connection::{ConnectionState, LazyConnection};
use crate::{Ack, Adapter, DeliveryResult, MessageStream};

const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_secs(1);
const DEFAULT_IDLE_BACKOFF: Duration = Duration::from_millis(100);

/// A body that could not be delivered as an envelope.
#[derive(Debug, Clone)]
pub struct DeadLetter {
    pub source: String,
    pub body: Vec<u8>,
    pub reason: String,
}

/// A message handed out by [`MemoryBroker::receive`], in-flight until acked.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub receipt: u64,
    pub body: Vec<u8>,
    /// 1 on first delivery, incremented on every redelivery.
    pub attempt: u32,
}

#[derive(Debug)]
struct QueuedMessage {
    receipt: u64,
    body: Vec<u8>,
    attempt: u32,
}

#[derive(Default)]
struct QueueState {
    ready: VecDeque<QueuedMessage>,
    in_flight: HashMap<u64, QueuedMessage>,
}

#[derive(Default)]
struct MemoryQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

pub struct MemoryBroker {
    topics: Mutex<HashMap<String, Vec<mpsc::UnboundedSender<Vec<u8>>>>>,
    queues: Mutex<HashMap<String, Arc<MemoryQueue>>>,
    dead_letters: Mutex<Vec<DeadLetter>>,
    next_receipt: AtomicU64,
    connections: AtomicUsize,
    available: AtomicBool,
    shut_down: AtomicBool,
}

impl MemoryBroker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            topics: Mutex::new(HashMap::new()),
            queues: Mutex::new(HashMap::new()),
            dead_letters: Mutex::new(Vec::new()),
            next_receipt: AtomicU64::new(1),
            connections: AtomicUsize::new(0),
            available: AtomicBool::new(true),
            shut_down: AtomicBool::new(false),
        })
    }

    /// Open a client handle. Every successful call counts as one connection.
    pub async fn connect(self: &Arc<Self>) -> DeliveryResult<BrokerHandle> {
        tokio::task::yield_now().await;
        self.check_available()?;
        let id = self.connections.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(connection = id, "Memory broker connection opened");
        Ok(BrokerHandle {
            broker: self.clone(),
            id,
        })
    }

    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    /// Simulate a transient outage: sends and polls fail with a connection
    /// error until the broker is available again.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Tear the broker down for good. Open subscriptions end.
    pub fn shutdown(&self) {
        self.shut_down.store(true, Ordering::SeqCst);
        lock(&self.topics).clear();
        for queue in lock(&self.queues).values() {
            queue.notify.notify_waiters();
        }
        info!("Memory broker shut down");
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    fn check_available(&self) -> DeliveryResult<()> {
        if self.is_shut_down() {
            return Err(DeliveryError::Connection("broker shut down".to_string()));
        }
        if !self.available.load(Ordering::SeqCst) {
            return Err(DeliveryError::Connection("broker unavailable".to_string()));
        }
        Ok(())
    }

    // ── Topics ──────────────────────────────────────────────────────────────

    /// Deliver to every live subscriber. Returns how many received it; zero
    /// subscribers is not an error.
    pub fn publish(&self, topic: &str, body: Vec<u8>) -> DeliveryResult<usize> {
        self.check_available()?;
        let mut topics = lock(&self.topics);
        let Some(subscribers) = topics.get_mut(topic) else {
            return Ok(0);
        };
        subscribers.retain(|tx| tx.send(body.clone()).is_ok());
        Ok(subscribers.len())
    }

    pub fn subscribe(&self, topic: &str) -> DeliveryResult<mpsc::UnboundedReceiver<Vec<u8>>> {
        self.check_available()?;
        let (tx, rx) = mpsc::unbounded_channel();
        lock(&self.topics)
            .entry(topic.to_string())
            .or_default()
            .push(tx);
        Ok(rx)
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        lock(&self.topics)
            .get(topic)
            .map(|subs| subs.iter().filter(|tx| !tx.is_closed()).count())
            .unwrap_or(0)
    }

    // ── Queues ──────────────────────────────────────────────────────────────

    /// Create a queue if it does not exist yet.
    pub fn declare_queue(&self, name: &str) {
        lock(&self.queues).entry(name.to_string()).or_default();
    }

    fn queue(&self, name: &str) -> DeliveryResult<Arc<MemoryQueue>> {
        lock(&self.queues)
            .get(name)
            .cloned()
            .ok_or_else(|| DeliveryError::DestinationNotFound(format!("queue '{}'", name)))
    }

    pub fn enqueue(&self, name: &str, body: Vec<u8>) -> DeliveryResult<u64> {
        self.check_available()?;
        let queue = self.queue(name)?;
        let receipt = self.next_receipt.fetch_add(1, Ordering::SeqCst);
        lock(&queue.state).ready.push_back(QueuedMessage {
            receipt,
            body,
            attempt: 0,
        });
        queue.notify.notify_one();
        Ok(receipt)
    }

    /// Wait up to `timeout` for a message. `Ok(None)` means the poll timed out.
    pub async fn receive(&self, name: &str, timeout: Duration) -> DeliveryResult<Option<Delivery>> {
        let queue = self.queue(name)?;
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            self.check_available()?;
            {
                let mut state = lock(&queue.state);
                if let Some(mut msg) = state.ready.pop_front() {
                    msg.attempt += 1;
                    let delivery = Delivery {
                        receipt: msg.receipt,
                        body: msg.body.clone(),
                        attempt: msg.attempt,
                    };
                    state.in_flight.insert(msg.receipt, msg);
                    return Ok(Some(delivery));
                }
            }
            if tokio::time::timeout_at(deadline, queue.notify.notified())
                .await
                .is_err()
            {
                return Ok(None);
            }
        }
    }

    /// Remove an in-flight message for good.
    pub fn ack(&self, name: &str, receipt: u64) -> bool {
        match self.queue(name) {
            Ok(queue) => lock(&queue.state).in_flight.remove(&receipt).is_some(),
            Err(_) => false,
        }
    }

    /// Return an in-flight message to the head of its queue.
    pub fn nack(&self, name: &str, receipt: u64) -> bool {
        let Ok(queue) = self.queue(name) else {
            return false;
        };
        let returned = {
            let mut state = lock(&queue.state);
            match state.in_flight.remove(&receipt) {
                Some(msg) => {
                    state.ready.push_front(msg);
                    true
                }
                None => false,
            }
        };
        if returned {
            queue.notify.notify_one();
        }
        returned
    }

    /// Move an in-flight message to the dead-letter list.
    pub fn dead_letter(&self, name: &str, receipt: u64, reason: &str) {
        let body = self
            .queue(name)
            .ok()
            .and_then(|queue| lock(&queue.state).in_flight.remove(&receipt))
            .map(|msg| msg.body);
        if let Some(body) = body {
            self.record_dead_letter(name, body, reason);
        }
    }

    fn record_dead_letter(&self, source: &str, body: Vec<u8>, reason: &str) {
        lock(&self.dead_letters).push(DeadLetter {
            source: source.to_string(),
            body,
            reason: reason.to_string(),
        });
    }

    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        lock(&self.dead_letters).clone()
    }

    /// `(ready, in_flight)` counts, or `None` for an undeclared queue.
    pub fn queue_depth(&self, name: &str) -> Option<(usize, usize)> {
        let queue = self.queue(name).ok()?;
        let state = lock(&queue.state);
        Some((state.ready.len(), state.in_flight.len()))
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// A live client connection to a [`MemoryBroker`].
#[derive(Clone)]
pub struct BrokerHandle {
    broker: Arc<MemoryBroker>,
    id: usize,
}

impl BrokerHandle {
    pub fn id(&self) -> usize {
        self.id
    }
}

// ── Topic adapter ───────────────────────────────────────────────────────────

pub struct MemoryTopicAdapter {
    broker: Arc<MemoryBroker>,
    conn: LazyConnection<BrokerHandle>,
}

impl MemoryTopicAdapter {
    pub fn new(broker: Arc<MemoryBroker>) -> Self {
        Self {
            broker,
            conn: LazyConnection::new(),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.conn.state()
    }

    async fn handle(&self) -> DeliveryResult<&BrokerHandle> {
        self.conn.get_or_connect(|| self.broker.connect()).await
    }
}

#[async_trait]
impl Adapter for MemoryTopicAdapter {
    fn kind(&self) -> &'static str {
        "memory-topic"
    }

    async fn send(&self, message: &UniversalMessage, destination: &str) -> DeliveryResult<Ack> {
        let handle = self.handle().await?;
        let body = message
            .to_bytes()
            .map_err(|e| DeliveryError::Rejected(e.to_string()))?;
        let receivers = handle.broker.publish(destination, body)?;
        debug!(message_id = %message.id(), topic = %destination, receivers, "Published to memory topic");
        Ok(Ack::new(message, destination))
    }

    async fn consume(&self, subscription: &str) -> DeliveryResult<MessageStream> {
        let handle = self.handle().await?.clone();
        let rx = handle.broker.subscribe(subscription)?;
        let topic = subscription.to_string();
        info!(topic = %topic, "Subscribed to memory topic");

        let stream = stream::unfold((rx, handle, topic), |(mut rx, handle, topic)| async move {
            loop {
                let body = rx.recv().await?;
                match UniversalMessage::from_bytes(&body) {
                    Ok(msg) => return Some((msg, (rx, handle, topic))),
                    Err(e) => {
                        warn!(topic = %topic, error = %e, "Undecodable message on topic, dead-lettered");
                        handle.broker.record_dead_letter(&topic, body, &e.to_string());
                    }
                }
            }
        });
        Ok(stream.boxed())
    }
}

// ── Queue adapter ───────────────────────────────────────────────────────────

pub struct MemoryQueueAdapter {
    broker: Arc<MemoryBroker>,
    conn: LazyConnection<BrokerHandle>,
    poll_timeout: Duration,
    idle_backoff: Duration,
}

impl MemoryQueueAdapter {
    pub fn new(broker: Arc<MemoryBroker>) -> Self {
        Self {
            broker,
            conn: LazyConnection::new(),
            poll_timeout: DEFAULT_POLL_TIMEOUT,
            idle_backoff: DEFAULT_IDLE_BACKOFF,
        }
    }

    pub fn with_polling(mut self, poll_timeout: Duration, idle_backoff: Duration) -> Self {
        self.poll_timeout = poll_timeout;
        self.idle_backoff = idle_backoff;
        self
    }

    pub fn state(&self) -> ConnectionState {
        self.conn.state()
    }

    async fn handle(&self) -> DeliveryResult<&BrokerHandle> {
        self.conn.get_or_connect(|| self.broker.connect()).await
    }
}

/// Consumer-side state of one queue subscription.
///
/// `pending` is the receipt of the last message handed to the caller. It is
/// acked when the caller pulls again; if the consumer is dropped first, it is
/// nacked so the message is redelivered.
struct QueueCursor {
    handle: BrokerHandle,
    queue: String,
    pending: Option<u64>,
    poll_timeout: Duration,
    idle_backoff: Duration,
}

impl QueueCursor {
    fn ack_pending(&mut self) {
        if let Some(receipt) = self.pending.take() {
            self.handle.broker.ack(&self.queue, receipt);
        }
    }

    async fn next_message(&mut self) -> Option<UniversalMessage> {
        self.ack_pending();
        loop {
            match self.handle.broker.receive(&self.queue, self.poll_timeout).await {
                Ok(Some(delivery)) => match UniversalMessage::from_bytes(&delivery.body) {
                    Ok(msg) => {
                        self.pending = Some(delivery.receipt);
                        return Some(msg);
                    }
                    Err(e) => {
                        warn!(queue = %self.queue, receipt = delivery.receipt, error = %e, "Undecodable message on queue, dead-lettered");
                        self.handle
                            .broker
                            .dead_letter(&self.queue, delivery.receipt, &e.to_string());
                    }
                },
                Ok(None) => tokio::time::sleep(self.idle_backoff).await,
                Err(e) => {
                    if self.handle.broker.is_shut_down() {
                        info!(queue = %self.queue, "Queue subscription closed by broker shutdown");
                        return None;
                    }
                    debug!(queue = %self.queue, error = %e, "Queue poll failed, backing off");
                    tokio::time::sleep(self.idle_backoff).await;
                }
            }
        }
    }
}

impl Drop for QueueCursor {
    fn drop(&mut self) {
        if let Some(receipt) = self.pending.take() {
            if self.handle.broker.nack(&self.queue, receipt) {
                debug!(queue = %self.queue, receipt, "Returned unacknowledged message for redelivery");
            }
        }
    }
}

#[async_trait]
impl Adapter for MemoryQueueAdapter {
    fn kind(&self) -> &'static str {
        "memory-queue"
    }

    async fn send(&self, message: &UniversalMessage, destination: &str) -> DeliveryResult<Ack> {
        let handle = self.handle().await?;
        let body = message
            .to_bytes()
            .map_err(|e| DeliveryError::Rejected(e.to_string()))?;
        let receipt = handle.broker.enqueue(destination, body)?;
        debug!(message_id = %message.id(), queue = %destination, receipt, "Enqueued on memory queue");
        Ok(Ack::new(message, destination).with_receipt(receipt.to_string()))
    }

    async fn consume(&self, subscription: &str) -> DeliveryResult<MessageStream> {
        let handle = self.handle().await?.clone();
        // Fail fast on an undeclared queue instead of polling it forever.
        handle.broker.queue(subscription)?;
        info!(queue = %subscription, "Consuming memory queue");

        let cursor = QueueCursor {
            handle,
            queue: subscription.to_string(),
            pending: None,
            poll_timeout: self.poll_timeout,
            idle_backoff: self.idle_backoff,
        };
        let stream = stream::unfold(cursor, |mut cursor| async move {
            let msg = cursor.next_message().await?;
            Some((msg, cursor))
        });
        Ok(stream.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentmesh_core::MessageParts;
    use serde_json::json;

    fn message(n: i64) -> UniversalMessage {
        let mut parts = MessageParts::new().tenant("t1");
        parts.payload.insert("n".into(), json!(n));
        parts.build()
    }

    fn queue_adapter(broker: &Arc<MemoryBroker>) -> MemoryQueueAdapter {
        MemoryQueueAdapter::new(broker.clone())
            .with_polling(Duration::from_millis(20), Duration::from_millis(5))
    }

    #[tokio::test]
    async fn test_topic_push_to_subscribers() {
        let broker = MemoryBroker::new();
        let adapter = MemoryTopicAdapter::new(broker.clone());

        let mut stream = adapter.consume("orders.created").await.unwrap();
        let sent = message(1);
        let ack = adapter.send(&sent, "orders.created").await.unwrap();
        assert_eq!(ack.destination, "orders.created");
        assert_eq!(ack.message_id, sent.id());

        let received = stream.next().await.unwrap();
        assert_eq!(received, sent);
        assert_eq!(broker.connection_count(), 1);
    }

    #[tokio::test]
    async fn test_topic_without_subscribers_succeeds() {
        let broker = MemoryBroker::new();
        let adapter = MemoryTopicAdapter::new(broker.clone());
        assert_eq!(adapter.state(), ConnectionState::Disconnected);
        adapter.send(&message(1), "nobody.listens").await.unwrap();
        assert_eq!(adapter.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_dropped_topic_subscription_is_released() {
        let broker = MemoryBroker::new();
        let adapter = MemoryTopicAdapter::new(broker.clone());
        let stream = adapter.consume("t").await.unwrap();
        assert_eq!(broker.subscriber_count("t"), 1);
        drop(stream);
        assert_eq!(broker.subscriber_count("t"), 0);
    }

    #[tokio::test]
    async fn test_topic_dead_letters_garbage() {
        let broker = MemoryBroker::new();
        let adapter = MemoryTopicAdapter::new(broker.clone());
        let mut stream = adapter.consume("t").await.unwrap();

        broker.publish("t", b"garbage".to_vec()).unwrap();
        let good = message(2);
        adapter.send(&good, "t").await.unwrap();

        assert_eq!(stream.next().await.unwrap(), good);
        let dead = broker.dead_letters();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].source, "t");
        assert_eq!(dead[0].body, b"garbage".to_vec());
    }

    #[tokio::test]
    async fn test_topic_stream_ends_on_shutdown() {
        let broker = MemoryBroker::new();
        let adapter = MemoryTopicAdapter::new(broker.clone());
        let mut stream = adapter.consume("t").await.unwrap();
        broker.shutdown();
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_send_to_undeclared_queue_fails() {
        let broker = MemoryBroker::new();
        let adapter = queue_adapter(&broker);
        let err = adapter.send(&message(1), "missing").await.unwrap_err();
        assert!(matches!(err, DeliveryError::DestinationNotFound(_)));
    }

    #[tokio::test]
    async fn test_queue_acks_only_after_next_pull() {
        let broker = MemoryBroker::new();
        broker.declare_queue("work");
        let adapter = queue_adapter(&broker);

        let first = message(1);
        let second = message(2);
        adapter.send(&first, "work").await.unwrap();
        adapter.send(&second, "work").await.unwrap();
        assert_eq!(broker.queue_depth("work"), Some((2, 0)));

        let mut stream = adapter.consume("work").await.unwrap();
        assert_eq!(stream.next().await.unwrap(), first);
        // Yielded but not yet acknowledged.
        assert_eq!(broker.queue_depth("work"), Some((1, 1)));

        assert_eq!(stream.next().await.unwrap(), second);
        assert_eq!(broker.queue_depth("work"), Some((0, 1)));
    }

    #[tokio::test]
    async fn test_dropped_consumer_returns_message() {
        let broker = MemoryBroker::new();
        broker.declare_queue("work");
        let adapter = queue_adapter(&broker);
        let sent = message(7);
        adapter.send(&sent, "work").await.unwrap();

        let mut stream = adapter.consume("work").await.unwrap();
        assert_eq!(stream.next().await.unwrap(), sent);
        drop(stream);
        assert_eq!(broker.queue_depth("work"), Some((1, 0)));

        let mut again = adapter.consume("work").await.unwrap();
        assert_eq!(again.next().await.unwrap(), sent);
        let delivery_count = broker.queue_depth("work").unwrap();
        assert_eq!(delivery_count, (0, 1));
    }

    #[tokio::test]
    async fn test_queue_consume_waits_for_late_message() {
        let broker = MemoryBroker::new();
        broker.declare_queue("work");
        let adapter = Arc::new(queue_adapter(&broker));

        let mut stream = adapter.consume("work").await.unwrap();
        let producer = {
            let adapter = adapter.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(60)).await;
                adapter.send(&message(3), "work").await.unwrap();
            })
        };

        let received = tokio::time::timeout(Duration::from_secs(2), stream.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received.payload().get("n"), Some(&json!(3)));
        producer.await.unwrap();
    }

    #[tokio::test]
    async fn test_queue_dead_letters_garbage() {
        let broker = MemoryBroker::new();
        broker.declare_queue("work");
        broker.enqueue("work", b"{not json".to_vec()).unwrap();
        let adapter = queue_adapter(&broker);
        let good = message(4);
        adapter.send(&good, "work").await.unwrap();

        let mut stream = adapter.consume("work").await.unwrap();
        assert_eq!(stream.next().await.unwrap(), good);
        assert_eq!(broker.dead_letters().len(), 1);
        assert_eq!(broker.queue_depth("work"), Some((0, 1)));
    }

    #[tokio::test]
    async fn test_nack_redelivers_with_attempt_count() {
        let broker = MemoryBroker::new();
        broker.declare_queue("q");
        broker.enqueue("q", b"x".to_vec()).unwrap();

        let first = broker.receive("q", Duration::from_millis(10)).await.unwrap().unwrap();
        assert_eq!(first.attempt, 1);
        assert!(broker.nack("q", first.receipt));
        let second = broker.receive("q", Duration::from_millis(10)).await.unwrap().unwrap();
        assert_eq!(second.receipt, first.receipt);
        assert_eq!(second.attempt, 2);
        assert!(broker.ack("q", second.receipt));
        assert!(!broker.ack("q", second.receipt));
        assert!(broker.receive("q", Duration::from_millis(10)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unavailable_broker_fails_with_connection_error() {
        let broker = MemoryBroker::new();
        broker.declare_queue("q");
        let adapter = queue_adapter(&broker);
        broker.set_available(false);
        let err = adapter.send(&message(1), "q").await.unwrap_err();
        assert!(err.is_transient());
        assert_eq!(adapter.state(), ConnectionState::Disconnected);

        broker.set_available(true);
        adapter.send(&message(1), "q").await.unwrap();
        assert_eq!(adapter.state(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn test_concurrent_first_sends_share_one_connection() {
        let broker = MemoryBroker::new();
        let adapter = Arc::new(MemoryTopicAdapter::new(broker.clone()));
        let mut handles = Vec::new();
        for i in 0..10 {
            let adapter = adapter.clone();
            handles.push(tokio::spawn(async move {
                adapter.send(&message(i), "t").await.unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        assert_eq!(broker.connection_count(), 1);
    }
}
