use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use agentmesh_core::config::BulkheadConfig;
use agentmesh_core::{DeliveryError, UniversalMessage};
use async_trait::async_trait;
use tokio::sync::Semaphore;
use tracing::warn;

use crate::{Ack, Adapter, DeliveryResult, MessageStream};

/// Caps how many sends run against the wrapped adapter at once.
///
/// Up to `max_waiting` callers queue for a free slot; beyond that a send is
/// refused with `DeliveryError::Connection` instead of piling up.
pub struct BulkheadAdapter {
    inner: Arc<dyn Adapter>,
    slots: Semaphore,
    max_waiting: usize,
    waiting: AtomicUsize,
}

impl BulkheadAdapter {
    pub fn new(inner: Arc<dyn Adapter>, config: &BulkheadConfig) -> Self {
        Self {
            inner,
            slots: Semaphore::new(config.max_concurrent.max(1) as usize),
            max_waiting: config.max_waiting as usize,
            waiting: AtomicUsize::new(0),
        }
    }

    pub fn available(&self) -> usize {
        self.slots.available_permits()
    }

    fn full(&self, destination: &str) -> DeliveryError {
        warn!(kind = self.inner.kind(), destination = %destination, "Bulkhead full, send refused");
        DeliveryError::Connection(format!("bulkhead full for {} adapter", self.inner.kind()))
    }
}

#[async_trait]
impl Adapter for BulkheadAdapter {
    fn kind(&self) -> &'static str {
        self.inner.kind()
    }

    async fn send(&self, message: &UniversalMessage, destination: &str) -> DeliveryResult<Ack> {
        let _permit = match self.slots.try_acquire() {
            Ok(permit) => permit,
            Err(_) => {
                let queued = self.waiting.fetch_add(1, Ordering::SeqCst);
                if queued >= self.max_waiting {
                    self.waiting.fetch_sub(1, Ordering::SeqCst);
                    return Err(self.full(destination));
                }
                let acquired = self.slots.acquire().await;
                self.waiting.fetch_sub(1, Ordering::SeqCst);
                acquired.map_err(|_| self.full(destination))?
            }
        };
        self.inner.send(message, destination).await
    }

    async fn consume(&self, subscription: &str) -> DeliveryResult<MessageStream> {
        self.inner.consume(subscription).await
    }
}
