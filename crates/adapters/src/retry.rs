use std::sync::Arc;
use std::time::Duration;

use agentmesh_core::config::RetryConfig;
use agentmesh_core::UniversalMessage;
use async_trait::async_trait;
use tracing::{debug, warn};

use crate::{Ack, Adapter, DeliveryResult, MessageStream};

/// Exponential backoff: attempt `n` (1-based) waits `base * 2^(n-1)` before
/// the next try, capped at `max_delay`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay,
        }
    }

    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(31);
        self.base_delay
            .checked_mul(1u32 << exp)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryConfig::default().into()
    }
}

impl From<RetryConfig> for RetryPolicy {
    fn from(cfg: RetryConfig) -> Self {
        Self::new(
            cfg.max_attempts,
            Duration::from_millis(cfg.base_delay_ms),
            Duration::from_millis(cfg.max_delay_ms),
        )
    }
}

/// Retries `send` on transient (connection) failures. Permanent failures are
/// returned on the first attempt.
pub struct RetryingAdapter {
    inner: Arc<dyn Adapter>,
    policy: RetryPolicy,
}

impl RetryingAdapter {
    pub fn new(inner: Arc<dyn Adapter>, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }
}

#[async_trait]
impl Adapter for RetryingAdapter {
    fn kind(&self) -> &'static str {
        self.inner.kind()
    }

    async fn send(&self, message: &UniversalMessage, destination: &str) -> DeliveryResult<Ack> {
        let mut attempt = 1;
        loop {
            match self.inner.send(message, destination).await {
                Ok(ack) => return Ok(ack),
                Err(e) if e.is_transient() && attempt < self.policy.max_attempts => {
                    let delay = self.policy.delay_for(attempt);
                    debug!(
                        message_id = %message.id(),
                        destination = %destination,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Transient send failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    if e.is_transient() {
                        warn!(message_id = %message.id(), destination = %destination, attempts = attempt, "Send retries exhausted");
                    }
                    return Err(e);
                }
            }
        }
    }

    async fn consume(&self, subscription: &str) -> DeliveryResult<MessageStream> {
        self.inner.consume(subscription).await
    }
}
