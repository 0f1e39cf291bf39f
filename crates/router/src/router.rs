use std::collections::HashMap;
use std::sync::Arc;

use agentmesh_adapters::{Ack, Adapter, DeliveryResult};
use agentmesh_core::{Metrics, RoutingError, UniversalMessage};
use agentmesh_storage::{AuditRecord, AuditStore, MemoryAuditStore};
use futures::future::join_all;
use tracing::{debug, error, info};

use crate::address::RoutingAddress;

/// Outcome of one target: the address as written on the envelope and what its
/// adapter returned.
pub type TargetResult = (String, DeliveryResult<Ack>);

pub struct RouterBuilder {
    adapters: HashMap<String, Arc<dyn Adapter>>,
    audit_store: Option<Arc<dyn AuditStore>>,
    metrics: Option<Arc<Metrics>>,
    tenant_scope: Option<String>,
}

impl RouterBuilder {
    pub fn new() -> Self {
        Self {
            adapters: HashMap::new(),
            audit_store: None,
            metrics: None,
            tenant_scope: None,
        }
    }

    /// Register `adapter` under `scheme`. A later registration of the same
    /// scheme replaces the earlier one.
    pub fn adapter(mut self, scheme: impl Into<String>, adapter: Arc<dyn Adapter>) -> Self {
        self.adapters.insert(scheme.into(), adapter);
        self
    }

    pub fn audit_store(mut self, store: Arc<dyn AuditStore>) -> Self {
        self.audit_store = Some(store);
        self
    }

    pub fn metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Only accept envelopes of this tenant.
    pub fn tenant_scope(mut self, tenant_id: Option<String>) -> Self {
        self.tenant_scope = tenant_id;
        self
    }

    /// Without an explicit audit store the router keeps its trail in memory.
    pub fn build(self) -> MessageRouter {
        MessageRouter {
            adapters: self.adapters,
            audit_store: self
                .audit_store
                .unwrap_or_else(|| Arc::new(MemoryAuditStore::new())),
            metrics: self.metrics.unwrap_or_else(|| Arc::new(Metrics::new())),
            tenant_scope: self.tenant_scope,
        }
    }
}

impl Default for RouterBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Resolves envelope targets to adapters, audits, and fans out.
///
/// The adapter registry is fixed at build time, so the router can be shared
/// behind an `Arc` with no locking.
pub struct MessageRouter {
    adapters: HashMap<String, Arc<dyn Adapter>>,
    audit_store: Arc<dyn AuditStore>,
    metrics: Arc<Metrics>,
    tenant_scope: Option<String>,
}

impl MessageRouter {
    pub fn builder() -> RouterBuilder {
        RouterBuilder::new()
    }

    /// Route one envelope to all of its targets.
    ///
    /// Every target is resolved before anything else happens: a malformed
    /// address or unknown scheme fails the call with no audit record and no
    /// send. The audit record is then written (a failure is fatal), and the
    /// sends run concurrently. Individual delivery failures are returned in
    /// the result list, which follows the envelope's target order.
    pub async fn route_message(
        &self,
        message: &UniversalMessage,
    ) -> Result<Vec<TargetResult>, RoutingError> {
        if let Some(scope) = &self.tenant_scope {
            if message.tenant_id() != scope.as_str() {
                return Err(RoutingError::TenantMismatch {
                    expected: scope.clone(),
                    actual: message.tenant_id().to_string(),
                });
            }
        }

        let targets = message.targets()?;
        if targets.is_empty() {
            return Err(RoutingError::NoTargets);
        }

        let mut resolved = Vec::with_capacity(targets.len());
        for target in &targets {
            let address = RoutingAddress::parse(target)?;
            let adapter = self
                .adapters
                .get(&address.scheme)
                .ok_or_else(|| RoutingError::UnknownScheme(address.scheme.clone()))?;
            resolved.push((address, adapter.clone()));
        }

        let record = AuditRecord::from_message(message, targets.clone());
        self.audit_store
            .append(record)
            .await
            .map_err(RoutingError::AuditFailure)?;
        self.metrics.audit_records.inc(&[message.tenant_id()]);

        info!(
            message_id = %message.id(),
            tenant_id = %message.tenant_id(),
            targets = targets.len(),
            "Routing message"
        );

        let sends = resolved.iter().map(|(address, adapter)| async move {
            adapter.send(message, &address.destination).await
        });
        let outcomes = join_all(sends).await;

        let mut results = Vec::with_capacity(outcomes.len());
        for ((target, (address, _)), outcome) in targets.into_iter().zip(&resolved).zip(outcomes) {
            match &outcome {
                Ok(_) => {
                    self.metrics
                        .messages_sent
                        .inc(&[address.scheme.as_str(), address.destination.as_str()]);
                    debug!(message_id = %message.id(), target = %target, "Delivered");
                }
                Err(e) => {
                    self.metrics.delivery_failures.inc(&[address.scheme.as_str()]);
                    error!(message_id = %message.id(), target = %target, error = %e, "Delivery failed");
                }
            }
            results.push((target, outcome));
        }
        Ok(results)
    }

    /// Registered schemes, sorted.
    pub fn schemes(&self) -> Vec<String> {
        let mut schemes: Vec<String> = self.adapters.keys().cloned().collect();
        schemes.sort();
        schemes
    }

    pub fn adapter(&self, scheme: &str) -> Option<Arc<dyn Adapter>> {
        self.adapters.get(scheme).cloned()
    }

    pub fn audit_store(&self) -> &Arc<dyn AuditStore> {
        &self.audit_store
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }
}
