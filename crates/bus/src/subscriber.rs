use std::sync::Arc;

use agentmesh_adapters::Adapter;
use agentmesh_core::{Metrics, Result, UniversalMessage};
use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, error, info, warn};

use crate::event::record_from_message;
use crate::projection::Projector;

/// Receives envelopes pulled by a [`Subscriber`].
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: UniversalMessage) -> Result<()>;
}

/// Feeds event envelopes into a projector as they arrive.
pub struct ProjectionHandler<P> {
    projector: Mutex<P>,
}

impl<P: Projector + Send> ProjectionHandler<P> {
    pub fn new(projector: P) -> Self {
        Self {
            projector: Mutex::new(projector),
        }
    }

    /// Run `f` against the current read model.
    pub async fn read<R>(&self, f: impl FnOnce(&P) -> R) -> R {
        let projector = self.projector.lock().await;
        f(&projector)
    }
}

#[async_trait]
impl<P: Projector + Send> MessageHandler for ProjectionHandler<P> {
    async fn handle(&self, message: UniversalMessage) -> Result<()> {
        match record_from_message(&message) {
            Some(record) => self.projector.lock().await.apply(&record),
            None => {
                warn!(message_id = %message.id(), "Not an event envelope, skipped");
                Ok(())
            }
        }
    }
}

/// Pulls one subscription of one adapter and hands each envelope to a
/// handler until shutdown.
pub struct Subscriber {
    scheme: String,
    adapter: Arc<dyn Adapter>,
    metrics: Arc<Metrics>,
}

impl Subscriber {
    pub fn new(scheme: impl Into<String>, adapter: Arc<dyn Adapter>, metrics: Arc<Metrics>) -> Self {
        Self {
            scheme: scheme.into(),
            adapter,
            metrics,
        }
    }

    /// Returns the number of envelopes handled.
    ///
    /// Handler errors are logged and do not stop the loop. On shutdown the
    /// stream is dropped, which releases the subscription.
    pub async fn run(
        &self,
        subscription: &str,
        handler: Arc<dyn MessageHandler>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<usize> {
        let mut stream = self.adapter.consume(subscription).await?;
        info!(scheme = %self.scheme, subscription = %subscription, "Subscriber started");

        let mut handled = 0usize;
        loop {
            tokio::select! {
                next = stream.next() => {
                    let Some(message) = next else {
                        info!(scheme = %self.scheme, subscription = %subscription, "Subscription closed by transport");
                        break;
                    };
                    let message_id = message.id().to_string();
                    self.metrics
                        .messages_received
                        .inc(&[self.scheme.as_str(), subscription]);
                    match handler.handle(message).await {
                        Ok(()) => debug!(message_id = %message_id, "Message handled"),
                        Err(e) => error!(message_id = %message_id, error = %e, "Message handler failed"),
                    }
                    handled += 1;
                }
                _ = shutdown.recv() => {
                    info!(scheme = %self.scheme, subscription = %subscription, handled, "Subscriber shutting down");
                    break;
                }
            }
        }
        Ok(handled)
    }
}
