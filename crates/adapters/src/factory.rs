use std::sync::Arc;
use std::time::Duration;

use agentmesh_core::{AdapterConfig, AdapterKind, Result};
use tracing::debug;

use crate::bulkhead::BulkheadAdapter;
use crate::circuit_breaker::CircuitBreakerAdapter;
use crate::memory::{MemoryBroker, MemoryQueueAdapter, MemoryTopicAdapter};
use crate::rate_limit::RateLimitedAdapter;
use crate::retry::{RetryPolicy, RetryingAdapter};
use crate::Adapter;

/// Build the adapter configured for `scheme`.
///
/// Decorators wrap in a fixed order: transport, bulkhead, rate limit, retry,
/// circuit breaker. Every retried attempt waits for a send slot and a
/// bulkhead permit; an open circuit refuses the send before any retry.
pub fn create_adapter(
    scheme: &str,
    config: &AdapterConfig,
    broker: &Arc<MemoryBroker>,
) -> Result<Arc<dyn Adapter>> {
    let mut adapter: Arc<dyn Adapter> = match config.kind {
        AdapterKind::MemoryTopic => Arc::new(MemoryTopicAdapter::new(broker.clone())),
        AdapterKind::MemoryQueue => {
            for queue in &config.queues {
                broker.declare_queue(queue);
            }
            Arc::new(
                MemoryQueueAdapter::new(broker.clone()).with_polling(
                    Duration::from_millis(config.poll_timeout_ms),
                    Duration::from_millis(config.idle_backoff_ms),
                ),
            )
        }
        AdapterKind::Webhook => webhook_adapter(scheme, config)?,
    };

    if let Some(bh) = &config.bulkhead {
        debug!(scheme = %scheme, max_concurrent = bh.max_concurrent, max_waiting = bh.max_waiting, "Bulkhead on adapter");
        adapter = Arc::new(BulkheadAdapter::new(adapter, bh));
    }
    if let Some(rl) = &config.rate_limit {
        debug!(scheme = %scheme, capacity = rl.capacity, per_second = rl.per_second, "Rate limiting adapter");
        adapter = Arc::new(RateLimitedAdapter::new(adapter, rl.capacity, rl.per_second));
    }
    if let Some(retry) = &config.retry {
        debug!(scheme = %scheme, max_attempts = retry.max_attempts, "Retrying adapter");
        adapter = Arc::new(RetryingAdapter::new(adapter, RetryPolicy::from(retry.clone())));
    }
    if let Some(cb) = &config.circuit_breaker {
        debug!(scheme = %scheme, failure_threshold = cb.failure_threshold, "Circuit breaker on adapter");
        adapter = Arc::new(CircuitBreakerAdapter::new(adapter, cb));
    }
    Ok(adapter)
}

#[cfg(feature = "webhook")]
fn webhook_adapter(_scheme: &str, config: &AdapterConfig) -> Result<Arc<dyn Adapter>> {
    Ok(Arc::new(crate::webhook::WebhookAdapter::new(Duration::from_secs(
        config.request_timeout_secs,
    ))))
}

#[cfg(not(feature = "webhook"))]
fn webhook_adapter(scheme: &str, _config: &AdapterConfig) -> Result<Arc<dyn Adapter>> {
    Err(agentmesh_core::Error::Config(format!(
        "scheme '{}' needs the webhook adapter, which is not compiled in",
        scheme
    )))
}
