use std::sync::Arc;

use agentmesh_core::{Error, Result, UniversalMessage};
use agentmesh_router::{MessageRouter, TargetResult};
use agentmesh_storage::{save_events_async, EventRecord, EventStore};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, error, info};

/// Unqualified name of `T`: `my_crate::events::TaskAssigned` becomes
/// `TaskAssigned`. Generic parameters are dropped.
pub fn short_type_name<T: ?Sized>() -> &'static str {
    let full = std::any::type_name::<T>();
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base)
}

/// Identity shared by every event. Flatten it into event structs:
///
/// ```ignore
/// #[derive(Serialize)]
/// struct TaskAssigned {
///     #[serde(flatten)]
///     meta: EventMeta,
///     task_id: String,
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventMeta {
    pub event_id: String,
    pub created_at: DateTime<Utc>,
}

impl EventMeta {
    pub fn new() -> Self {
        Self {
            event_id: uuid::Uuid::new_v4().to_string(),
            created_at: Utc::now(),
        }
    }

    pub fn with_id(event_id: impl Into<String>) -> Self {
        Self {
            event_id: event_id.into(),
            created_at: Utc::now(),
        }
    }
}

impl Default for EventMeta {
    fn default() -> Self {
        Self::new()
    }
}

/// An immutable fact. Its serialized fields become the envelope payload.
pub trait Event: Serialize + Send + Sync + 'static {
    fn event_id(&self) -> &str;

    fn created_at(&self) -> DateTime<Utc>;

    fn event_type(&self) -> &'static str {
        short_type_name::<Self>()
    }

    fn to_record(&self) -> Result<EventRecord> {
        Ok(EventRecord {
            event_id: self.event_id().to_string(),
            event_type: self.event_type().to_string(),
            created_at: self.created_at(),
            data: serde_json::to_value(self)?,
        })
    }
}

/// Result of publishing one event.
#[derive(Debug)]
pub struct PublishOutcome {
    pub event_id: String,
    pub result: Result<Vec<TargetResult>>,
}

impl PublishOutcome {
    /// Routed, audited and accepted by every target.
    pub fn is_delivered(&self) -> bool {
        matches!(&self.result, Ok(targets) if targets.iter().all(|(_, r)| r.is_ok()))
    }
}

/// Publishes events as envelopes through the router, one at a time and in
/// order. Each event is routed and audited on its own: a failure on one does
/// not stop the next.
pub struct EventBus {
    router: Arc<MessageRouter>,
    tenant_id: String,
    default_scheme: String,
    store: Option<Arc<dyn EventStore>>,
}

impl EventBus {
    pub fn new(
        router: Arc<MessageRouter>,
        tenant_id: impl Into<String>,
        default_scheme: impl Into<String>,
    ) -> Self {
        Self {
            router,
            tenant_id: tenant_id.into(),
            default_scheme: default_scheme.into(),
            store: None,
        }
    }

    pub fn with_store(mut self, store: Arc<dyn EventStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn tenant_id(&self) -> &str {
        &self.tenant_id
    }

    /// `<scheme>:events.<EventType>`
    pub fn address_for(&self, event_type: &str) -> String {
        format!("{}:events.{}", self.default_scheme, event_type)
    }

    pub fn envelope_for(&self, record: &EventRecord) -> UniversalMessage {
        let payload = match &record.data {
            Value::Object(fields) => fields.clone(),
            other => {
                let mut fields = Map::new();
                fields.insert("data".to_string(), other.clone());
                fields
            }
        };
        UniversalMessage::builder()
            .tenant(self.tenant_id.clone())
            .target(self.address_for(&record.event_type))
            .metadata("type", record.event_type.clone())
            .payload(payload)
            .build()
    }

    pub async fn publish<E: Event>(&self, events: &[E]) -> Vec<PublishOutcome> {
        let mut outcomes = Vec::with_capacity(events.len());
        for event in events {
            let outcome = match event.to_record() {
                Ok(record) => self.publish_one(&record).await,
                Err(e) => {
                    error!(event_id = %event.event_id(), error = %e, "Failed to serialize event");
                    PublishOutcome {
                        event_id: event.event_id().to_string(),
                        result: Err(e),
                    }
                }
            };
            outcomes.push(outcome);
        }
        outcomes
    }

    pub async fn publish_records(&self, records: &[EventRecord]) -> Vec<PublishOutcome> {
        let mut outcomes = Vec::with_capacity(records.len());
        for record in records {
            outcomes.push(self.publish_one(record).await);
        }
        outcomes
    }

    async fn publish_one(&self, record: &EventRecord) -> PublishOutcome {
        let message = self.envelope_for(record);
        let result = self
            .router
            .route_message(&message)
            .await
            .map_err(Error::from);
        match &result {
            Ok(_) => debug!(event_id = %record.event_id, event_type = %record.event_type, "Event published"),
            Err(e) => error!(event_id = %record.event_id, event_type = %record.event_type, error = %e, "Event publish failed"),
        }
        PublishOutcome {
            event_id: record.event_id.clone(),
            result,
        }
    }

    /// Append `events` to the aggregate's log as one batch, then publish them.
    /// Nothing is published if the append fails.
    pub async fn publish_and_store<E: Event>(
        &self,
        aggregate_id: &str,
        events: &[E],
    ) -> Result<Vec<PublishOutcome>> {
        let store = self
            .store
            .as_ref()
            .ok_or_else(|| Error::Config("event bus has no event store".to_string()))?;
        let records = events
            .iter()
            .map(|e| e.to_record())
            .collect::<Result<Vec<_>>>()?;
        let last =
            save_events_async(store.clone(), &self.tenant_id, aggregate_id, records.clone()).await?;
        info!(
            tenant_id = %self.tenant_id,
            aggregate_id = %aggregate_id,
            count = records.len(),
            last_sequence = last,
            "Events stored"
        );
        Ok(self.publish_records(&records).await)
    }
}

/// Rebuild an event record from an envelope produced by [`EventBus`].
/// Returns `None` for envelopes that are not events.
pub fn record_from_message(message: &UniversalMessage) -> Option<EventRecord> {
    let event_type = message.message_type()?.to_string();
    let payload = message.payload();
    let event_id = payload.get("event_id")?.as_str()?.to_string();
    let created_at = payload
        .get("created_at")
        .and_then(|v| v.as_str())
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(Utc::now);
    Some(EventRecord {
        event_id,
        event_type,
        created_at,
        data: Value::Object(payload.clone()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentmesh_adapters::RecordingAdapter;
    use agentmesh_core::{DeliveryError, RoutingError};
    use agentmesh_storage::{AuditStore, InMemoryEventStore, MemoryAuditStore, SqliteEventStore};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Clone, Serialize)]
    struct TaskAssigned {
        #[serde(flatten)]
        meta: EventMeta,
        task_id: String,
        agent_id: String,
        task_details: Value,
    }

    impl Event for TaskAssigned {
        fn event_id(&self) -> &str {
            &self.meta.event_id
        }

        fn created_at(&self) -> DateTime<Utc> {
            self.meta.created_at
        }
    }

    fn task_assigned(event_id: &str, task_id: &str) -> TaskAssigned {
        TaskAssigned {
            meta: EventMeta::with_id(event_id),
            task_id: task_id.to_string(),
            agent_id: "a1".to_string(),
            task_details: json!({"x": 1}),
        }
    }

    fn setup() -> (EventBus, Arc<RecordingAdapter>, Arc<MemoryAuditStore>) {
        let adapter = Arc::new(RecordingAdapter::new());
        let audit = Arc::new(MemoryAuditStore::new());
        let router = MessageRouter::builder()
            .adapter("default", adapter.clone())
            .audit_store(audit.clone())
            .build();
        let bus = EventBus::new(Arc::new(router), "acme", "default");
        (bus, adapter, audit)
    }

    #[test]
    fn test_short_type_name() {
        assert_eq!(short_type_name::<TaskAssigned>(), "TaskAssigned");
        assert_eq!(short_type_name::<Vec<String>>(), "Vec");
        assert_eq!(task_assigned("e1", "t1").event_type(), "TaskAssigned");
    }

    #[tokio::test]
    async fn test_publish_end_to_end() {
        let (bus, adapter, audit) = setup();
        let event = task_assigned("e1", "t1");

        let outcomes = bus.publish(&[event.clone()]).await;
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].event_id, "e1");
        assert!(outcomes[0].is_delivered());

        let sent = adapter.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].destination, "events.TaskAssigned");
        let expected = serde_json::to_value(&event).unwrap();
        assert_eq!(Value::Object(sent[0].message.payload().clone()), expected);
        assert_eq!(sent[0].message.message_type(), Some("TaskAssigned"));

        let records = audit.query("acme", 10).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].tenant_id, "acme");
        assert_eq!(records[0].targets, vec!["default:events.TaskAssigned".to_string()]);
    }

    #[tokio::test]
    async fn test_publish_preserves_order_and_continues_past_failure() {
        let adapter = Arc::new(RecordingAdapter::new());
        let router = MessageRouter::builder()
            .adapter("default", adapter.clone())
            .build();
        let bus = EventBus::new(Arc::new(router), "acme", "default");
        let events = vec![task_assigned("e1", "t1"), task_assigned("e2", "t2"), task_assigned("e3", "t3")];

        adapter.fail_on("events.TaskAssigned", DeliveryError::Connection("down".into()));
        let outcomes = bus.publish(&events).await;
        let ids: Vec<&str> = outcomes.iter().map(|o| o.event_id.as_str()).collect();
        assert_eq!(ids, vec!["e1", "e2", "e3"]);
        // Routed and audited, but delivery failed for each.
        assert!(outcomes.iter().all(|o| o.result.is_ok() && !o.is_delivered()));
    }

    #[tokio::test]
    async fn test_routing_failure_does_not_stop_next_event() {
        let (_, adapter, _) = setup();
        let router = MessageRouter::builder().adapter("default", adapter.clone()).build();
        // Events go to a scheme nobody registered.
        let bus = EventBus::new(Arc::new(router), "acme", "ghost");
        let outcomes = bus
            .publish(&[task_assigned("e1", "t1"), task_assigned("e2", "t2")])
            .await;
        assert_eq!(outcomes.len(), 2);
        for outcome in &outcomes {
            assert!(matches!(
                outcome.result,
                Err(Error::Routing(RoutingError::UnknownScheme(_)))
            ));
        }
    }

    #[tokio::test]
    async fn test_publish_and_store() {
        let (bus, adapter, _) = setup();
        let store = Arc::new(InMemoryEventStore::new());
        let bus = bus.with_store(store.clone());

        let events = vec![task_assigned("e1", "t1"), task_assigned("e2", "t1")];
        let outcomes = bus.publish_and_store("t1", &events).await.unwrap();
        assert!(outcomes.iter().all(|o| o.is_delivered()));

        let stored = store.load_events("acme", "t1").unwrap();
        let ids: Vec<&str> = stored.iter().map(|r| r.event_id.as_str()).collect();
        assert_eq!(ids, vec!["e1", "e2"]);
        assert_eq!(adapter.sent().len(), 2);
    }

    #[tokio::test]
    async fn test_store_wait_does_not_block_executor() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("events.db");
        let store = Arc::new(SqliteEventStore::open(&path).unwrap());
        let (bus, adapter, _) = setup();
        let bus = bus.with_store(store.clone());

        // Another process holds the write lock for a while.
        let (locked_tx, locked_rx) = std::sync::mpsc::channel();
        let holder = std::thread::spawn(move || {
            let conn = rusqlite::Connection::open(&path).unwrap();
            conn.execute_batch("BEGIN IMMEDIATE").unwrap();
            locked_tx.send(()).unwrap();
            std::thread::sleep(std::time::Duration::from_millis(300));
            conn.execute_batch("COMMIT").unwrap();
        });
        locked_rx.recv().unwrap();

        let ticks = Arc::new(AtomicUsize::new(0));
        let ticker = {
            let ticks = ticks.clone();
            tokio::spawn(async move {
                loop {
                    tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                    ticks.fetch_add(1, Ordering::SeqCst);
                }
            })
        };

        let outcomes = bus
            .publish_and_store("t1", &[task_assigned("e1", "t1")])
            .await
            .unwrap();
        ticker.abort();
        holder.join().unwrap();

        // The single-threaded runtime kept running other tasks while the
        // append waited on the lock.
        assert!(ticks.load(Ordering::SeqCst) >= 5);
        assert!(outcomes[0].is_delivered());
        assert_eq!(store.load_events("acme", "t1").unwrap().len(), 1);
        assert_eq!(adapter.sent().len(), 1);
    }

    #[tokio::test]
    async fn test_publish_and_store_requires_store() {
        let (bus, adapter, _) = setup();
        let err = bus
            .publish_and_store("t1", &[task_assigned("e1", "t1")])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert!(adapter.sent().is_empty());
    }

    #[test]
    fn test_record_from_message() {
        let (bus, _, _) = setup();
        let original = task_assigned("e9", "t9").to_record().unwrap();
        let message = bus.envelope_for(&original);
        let rebuilt = record_from_message(&message).unwrap();
        assert_eq!(rebuilt.event_id, "e9");
        assert_eq!(rebuilt.event_type, "TaskAssigned");
        assert_eq!(rebuilt.data, original.data);
        assert_eq!(rebuilt.created_at.timestamp_micros(), original.created_at.timestamp_micros());

        let plain = UniversalMessage::builder().build();
        assert!(record_from_message(&plain).is_none());
    }
}
