use std::collections::BTreeMap;
use std::sync::Arc;

use agentmesh_adapters::{create_adapter, MemoryBroker};
use agentmesh_core::config::{AuditBackend, EventBackend};
use agentmesh_core::{AdapterKind, Config, Error, Metrics, Paths, Result};
use agentmesh_router::MessageRouter;
use agentmesh_storage::{
    AuditStore, EventStore, InMemoryEventStore, JsonlAuditStore, MemoryAuditStore,
    SqliteAuditStore, SqliteEventStore,
};
use tokio::sync::broadcast;
use tracing::info;

use crate::command::CommandBus;
use crate::event::EventBus;
use crate::query::QueryBus;
use crate::subscriber::Subscriber;

/// Everything a mesh process needs, built once from config and passed
/// around explicitly.
pub struct MeshRuntime {
    pub metrics: Arc<Metrics>,
    pub broker: Arc<MemoryBroker>,
    pub router: Arc<MessageRouter>,
    pub audit_store: Arc<dyn AuditStore>,
    pub event_store: Arc<dyn EventStore>,
    pub commands: CommandBus,
    pub queries: QueryBus,
    pub events: EventBus,
    adapter_kinds: BTreeMap<String, AdapterKind>,
    shutdown_tx: broadcast::Sender<()>,
}

impl MeshRuntime {
    pub fn from_config(config: &Config, paths: &Paths) -> Result<Self> {
        let metrics = Arc::new(Metrics::new());
        let broker = MemoryBroker::new();

        let audit_store: Arc<dyn AuditStore> = match config.storage.audit {
            AuditBackend::Sqlite => {
                Arc::new(SqliteAuditStore::open(&config.storage.audit_db_path(paths))?)
            }
            AuditBackend::Jsonl => Arc::new(JsonlAuditStore::open(paths)?),
            AuditBackend::Memory => Arc::new(MemoryAuditStore::new()),
        };

        let event_store: Arc<dyn EventStore> = match config.storage.events {
            EventBackend::Sqlite => Arc::new(SqliteEventStore::open_with_metrics(
                &config.storage.events_db_path(paths),
                metrics.clone(),
            )?),
            EventBackend::Memory => Arc::new(InMemoryEventStore::with_metrics(metrics.clone())),
        };

        let mut builder = MessageRouter::builder()
            .audit_store(audit_store.clone())
            .metrics(metrics.clone())
            .tenant_scope(config.router.tenant_scope.clone());
        let mut adapter_kinds = BTreeMap::new();
        for (scheme, adapter_config) in &config.adapters {
            let adapter = create_adapter(scheme, adapter_config, &broker)?;
            builder = builder.adapter(scheme.clone(), adapter);
            adapter_kinds.insert(scheme.clone(), adapter_config.kind);
        }
        if !adapter_kinds.contains_key(&config.bus.default_scheme) {
            return Err(Error::Config(format!(
                "bus.defaultScheme '{}' has no adapter configured",
                config.bus.default_scheme
            )));
        }
        let router = Arc::new(builder.build());

        let events = EventBus::new(
            router.clone(),
            config.bus.tenant_id.clone(),
            config.bus.default_scheme.clone(),
        )
        .with_store(event_store.clone());

        let (shutdown_tx, _) = broadcast::channel(1);

        info!(
            schemes = adapter_kinds.len(),
            audit = ?config.storage.audit,
            events = ?config.storage.events,
            tenant_id = %config.bus.tenant_id,
            "Mesh runtime ready"
        );

        Ok(Self {
            commands: CommandBus::new(metrics.clone()),
            queries: QueryBus::new(),
            metrics,
            broker,
            router,
            audit_store,
            event_store,
            events,
            adapter_kinds,
            shutdown_tx,
        })
    }

    /// Configured schemes with their adapter kind, sorted by scheme.
    pub fn adapter_kinds(&self) -> &BTreeMap<String, AdapterKind> {
        &self.adapter_kinds
    }

    pub fn subscriber(&self, scheme: &str) -> Result<Subscriber> {
        let adapter = self
            .router
            .adapter(scheme)
            .ok_or_else(|| Error::Config(format!("no adapter for scheme '{}'", scheme)))?;
        Ok(Subscriber::new(scheme, adapter, self.metrics.clone()))
    }

    pub fn shutdown_receiver(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    /// Stop every subscriber loop and close the in-memory broker.
    pub fn shutdown(&self) {
        let receivers = self.shutdown_tx.send(()).unwrap_or(0);
        self.broker.shutdown();
        info!(receivers, "Mesh runtime shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::projection::{replay, AgentStatusChanged, AgentStatusReadModel};
    use crate::subscriber::{MessageHandler, ProjectionHandler};
    use agentmesh_core::{AdapterConfig, MessageParts};
    use std::time::Duration;
    use tempfile::TempDir;

    fn memory_config() -> Config {
        let mut config = Config::default();
        config.storage.audit = AuditBackend::Memory;
        config.storage.events = EventBackend::Memory;
        config
    }

    #[tokio::test]
    async fn test_default_config_on_disk() {
        let dir = TempDir::new().unwrap();
        let paths = Paths::with_base(dir.path().to_path_buf());
        let runtime = MeshRuntime::from_config(&Config::default(), &paths).unwrap();

        assert_eq!(runtime.router.schemes(), vec!["default".to_string()]);
        assert_eq!(runtime.audit_store.backend(), "sqlite");
        assert_eq!(runtime.event_store.backend(), "sqlite");
        assert!(paths.audit_db().exists());
        assert!(paths.events_db().exists());

        let msg = MessageParts::new().target("default:orders").build();
        runtime.router.route_message(&msg).await.unwrap();
        assert!(runtime.audit_store.get(msg.id()).await.unwrap().is_some());
    }

    #[test]
    fn test_missing_default_scheme_is_config_error() {
        let mut config = memory_config();
        config.bus.default_scheme = "nats".into();
        let dir = TempDir::new().unwrap();
        let paths = Paths::with_base(dir.path().to_path_buf());
        let err = MeshRuntime::from_config(&config, &paths).err().unwrap();
        assert!(matches!(err, Error::Config(_)));
    }

    #[tokio::test]
    async fn test_store_publish_and_replay() {
        let config = memory_config();
        let dir = TempDir::new().unwrap();
        let runtime =
            MeshRuntime::from_config(&config, &Paths::with_base(dir.path().to_path_buf())).unwrap();

        let outcomes = runtime
            .events
            .publish_and_store(
                "agents",
                &[
                    AgentStatusChanged::new("default_tenant", "a1", "idle"),
                    AgentStatusChanged::new("default_tenant", "a1", "busy"),
                ],
            )
            .await
            .unwrap();
        assert_eq!(outcomes.len(), 2);
        assert!(outcomes.iter().all(|o| o.is_delivered()));
        assert_eq!(
            runtime
                .metrics
                .events_saved
                .get(&["default_tenant", "AgentStatusChanged"]),
            2
        );

        let mut model = AgentStatusReadModel::new();
        let applied = replay(
            runtime.event_store.as_ref(),
            "default_tenant",
            "agents",
            &mut model,
        )
        .unwrap();
        assert_eq!(applied, 2);
        assert_eq!(model.get_agent_status("default_tenant", "a1").status, "busy");
    }

    #[tokio::test]
    async fn test_shutdown_stops_subscribers() {
        let mut config = memory_config();
        let mut queue = AdapterConfig::new(AdapterKind::MemoryQueue);
        queue.queues = vec!["work".into()];
        queue.poll_timeout_ms = 10;
        queue.idle_backoff_ms = 5;
        config.adapters.insert("q".into(), queue);

        let dir = TempDir::new().unwrap();
        let runtime =
            MeshRuntime::from_config(&config, &Paths::with_base(dir.path().to_path_buf())).unwrap();

        let handler: Arc<dyn MessageHandler> =
            Arc::new(ProjectionHandler::new(AgentStatusReadModel::new()));
        let topic = {
            let subscriber = runtime.subscriber("default").unwrap();
            let handler = handler.clone();
            let rx = runtime.shutdown_receiver();
            tokio::spawn(async move { subscriber.run("events.AgentStatusChanged", handler, rx).await })
        };
        let queue = {
            let subscriber = runtime.subscriber("q").unwrap();
            let rx = runtime.shutdown_receiver();
            tokio::spawn(async move { subscriber.run("work", handler, rx).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        runtime.shutdown();

        let topic = tokio::time::timeout(Duration::from_secs(1), topic).await.unwrap();
        let queue = tokio::time::timeout(Duration::from_secs(1), queue).await.unwrap();
        assert_eq!(topic.unwrap().unwrap(), 0);
        assert_eq!(queue.unwrap().unwrap(), 0);
        assert!(runtime.broker.is_shut_down());
        assert!(matches!(runtime.subscriber("ghost"), Err(Error::Config(_))));
    }
}
