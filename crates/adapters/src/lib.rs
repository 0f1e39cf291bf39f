pub mod bulkhead;
pub mod circuit_breaker;
pub mod connection;
pub mod factory;
pub mod memory;
pub mod rate_limit;
pub mod recording;
pub mod retry;

#[cfg(feature = "webhook")]
pub mod webhook;

use agentmesh_core::{DeliveryError, UniversalMessage};
use async_trait::async_trait;
use futures::stream::BoxStream;

pub use bulkhead::BulkheadAdapter;
pub use circuit_breaker::{CircuitBreakerAdapter, CircuitState};
pub use connection::{ConnectionState, LazyConnection};
pub use factory::create_adapter;
pub use memory::{DeadLetter, Delivery, MemoryBroker, MemoryQueueAdapter, MemoryTopicAdapter};
pub use rate_limit::RateLimitedAdapter;
pub use recording::{RecordingAdapter, SentMessage};
pub use retry::{RetryPolicy, RetryingAdapter};

#[cfg(feature = "webhook")]
pub use webhook::WebhookAdapter;

pub type DeliveryResult<T> = std::result::Result<T, DeliveryError>;

/// Inbound envelopes from one subscription. Never ends on its own; it ends
/// when the caller drops it or the transport is torn down.
pub type MessageStream = BoxStream<'static, UniversalMessage>;

/// Transport acknowledgement of one send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ack {
    pub destination: String,
    pub message_id: String,
    /// Transport-specific handle (queue receipt, HTTP status, ...).
    pub receipt: Option<String>,
}

impl Ack {
    pub fn new(message: &UniversalMessage, destination: &str) -> Self {
        Self {
            destination: destination.to_string(),
            message_id: message.id().to_string(),
            receipt: None,
        }
    }

    pub fn with_receipt(mut self, receipt: impl Into<String>) -> Self {
        self.receipt = Some(receipt.into());
        self
    }
}

/// The send/consume capability every transport implements. The router only
/// ever talks to transports through this trait.
#[async_trait]
pub trait Adapter: Send + Sync {
    /// Short label for logs and status output.
    fn kind(&self) -> &'static str;

    async fn send(&self, message: &UniversalMessage, destination: &str) -> DeliveryResult<Ack>;

    async fn consume(&self, subscription: &str) -> DeliveryResult<MessageStream>;
}
