//! Per-tenant, per-aggregate append-only event logs.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

use agentmesh_core::{Metrics, StoreError};
use chrono::{DateTime, Utc};
use rusqlite::{params, TransactionBehavior};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::{sqlite, StoreResult};

/// A type-erased event: what the store persists and projectors consume.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub event_id: String,
    pub event_type: String,
    pub created_at: DateTime<Utc>,
    /// The event's own fields.
    pub data: Value,
}

impl EventRecord {
    /// Fresh id and current time.
    pub fn new(event_type: impl Into<String>, data: Value) -> Self {
        Self {
            event_id: uuid::Uuid::new_v4().to_string(),
            event_type: event_type.into(),
            created_at: Utc::now(),
            data,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEntry {
    pub tenant_id: String,
    pub aggregate_id: String,
    /// 1-based position in the aggregate's log.
    pub sequence: u64,
    pub event: EventRecord,
}

/// Synchronous so command handlers can persist without an executor.
pub trait EventStore: Send + Sync {
    fn backend(&self) -> &'static str;

    /// Append `events` to the log of `(tenant_id, aggregate_id)` as one
    /// all-or-nothing batch. Returns the sequence of the last event in the
    /// log afterwards (0 for an empty log).
    fn save_events(&self, tenant_id: &str, aggregate_id: &str, events: &[EventRecord]) -> StoreResult<u64>;

    /// Full history in append order. An unknown aggregate has an empty history.
    fn load_entries(&self, tenant_id: &str, aggregate_id: &str) -> StoreResult<Vec<EventEntry>>;

    fn load_events(&self, tenant_id: &str, aggregate_id: &str) -> StoreResult<Vec<EventRecord>> {
        Ok(self
            .load_entries(tenant_id, aggregate_id)?
            .into_iter()
            .map(|entry| entry.event)
            .collect())
    }
}

/// [`EventStore::save_events`] on the blocking pool, for async callers.
pub async fn save_events_async(
    store: Arc<dyn EventStore>,
    tenant_id: &str,
    aggregate_id: &str,
    events: Vec<EventRecord>,
) -> StoreResult<u64> {
    let tenant_id = tenant_id.to_string();
    let aggregate_id = aggregate_id.to_string();
    crate::run_blocking(move || store.save_events(&tenant_id, &aggregate_id, &events)).await
}

fn count_saved(metrics: &Metrics, tenant_id: &str, events: &[EventRecord]) {
    for event in events {
        metrics.events_saved.inc(&[tenant_id, event.event_type.as_str()]);
    }
}

// ── In-memory ───────────────────────────────────────────────────────────────

type AggregateKey = (String, String);
type AggregateLog = Arc<Mutex<Vec<EventEntry>>>;

/// One mutex per aggregate; the outer map lock is only held to find or
/// create an aggregate's log.
pub struct InMemoryEventStore {
    logs: RwLock<HashMap<AggregateKey, AggregateLog>>,
    metrics: Arc<Metrics>,
}

impl InMemoryEventStore {
    pub fn new() -> Self {
        Self::with_metrics(Arc::new(Metrics::new()))
    }

    pub fn with_metrics(metrics: Arc<Metrics>) -> Self {
        Self {
            logs: RwLock::new(HashMap::new()),
            metrics,
        }
    }

    fn log(&self, tenant_id: &str, aggregate_id: &str) -> Option<AggregateLog> {
        let logs = self.logs.read().unwrap_or_else(|e| e.into_inner());
        logs.get(&(tenant_id.to_string(), aggregate_id.to_string()))
            .cloned()
    }

    fn log_or_create(&self, tenant_id: &str, aggregate_id: &str) -> AggregateLog {
        if let Some(log) = self.log(tenant_id, aggregate_id) {
            return log;
        }
        let mut logs = self.logs.write().unwrap_or_else(|e| e.into_inner());
        logs.entry((tenant_id.to_string(), aggregate_id.to_string()))
            .or_default()
            .clone()
    }
}

impl Default for InMemoryEventStore {
    fn default() -> Self {
        Self::new()
    }
}

impl EventStore for InMemoryEventStore {
    fn backend(&self) -> &'static str {
        "memory"
    }

    fn save_events(&self, tenant_id: &str, aggregate_id: &str, events: &[EventRecord]) -> StoreResult<u64> {
        let log = self.log_or_create(tenant_id, aggregate_id);
        let mut log = log.lock().unwrap_or_else(|e| e.into_inner());
        let mut sequence = log.len() as u64;
        for event in events {
            sequence += 1;
            log.push(EventEntry {
                tenant_id: tenant_id.to_string(),
                aggregate_id: aggregate_id.to_string(),
                sequence,
                event: event.clone(),
            });
        }
        drop(log);

        count_saved(&self.metrics, tenant_id, events);
        debug!(tenant_id = %tenant_id, aggregate_id = %aggregate_id, count = events.len(), last_sequence = sequence, "Events saved");
        Ok(sequence)
    }

    fn load_entries(&self, tenant_id: &str, aggregate_id: &str) -> StoreResult<Vec<EventEntry>> {
        Ok(match self.log(tenant_id, aggregate_id) {
            Some(log) => log.lock().unwrap_or_else(|e| e.into_inner()).clone(),
            None => Vec::new(),
        })
    }
}

// ── SQLite ──────────────────────────────────────────────────────────────────

const EVENT_SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS events (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        tenant_id TEXT NOT NULL,
        aggregate_id TEXT NOT NULL,
        sequence INTEGER NOT NULL,
        event_id TEXT NOT NULL,
        event_type TEXT NOT NULL,
        created_at TEXT NOT NULL,
        data TEXT NOT NULL,
        UNIQUE(tenant_id, aggregate_id, sequence)
    );

    CREATE INDEX IF NOT EXISTS idx_events_type ON events(event_type);
";

/// SQLite-backed event store. Every batch runs in its own `BEGIN IMMEDIATE`
/// transaction on a fresh connection; the unique index on
/// `(tenant_id, aggregate_id, sequence)` rejects a reused sequence.
pub struct SqliteEventStore {
    db_path: PathBuf,
    metrics: Arc<Metrics>,
}

impl SqliteEventStore {
    pub fn open(db_path: &Path) -> StoreResult<Self> {
        Self::open_with_metrics(db_path, Arc::new(Metrics::new()))
    }

    pub fn open_with_metrics(db_path: &Path, metrics: Arc<Metrics>) -> StoreResult<Self> {
        sqlite::init(db_path, EVENT_SCHEMA)?;
        debug!(path = %db_path.display(), "Event store schema initialized");
        Ok(Self {
            db_path: db_path.to_path_buf(),
            metrics,
        })
    }
}

impl EventStore for SqliteEventStore {
    fn backend(&self) -> &'static str {
        "sqlite"
    }

    fn save_events(&self, tenant_id: &str, aggregate_id: &str, events: &[EventRecord]) -> StoreResult<u64> {
        let mut conn = sqlite::open(&self.db_path)?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| sqlite::backend("Failed to begin transaction", e))?;

        let last: i64 = tx
            .query_row(
                "SELECT COALESCE(MAX(sequence), 0) FROM events
                 WHERE tenant_id = ?1 AND aggregate_id = ?2",
                params![tenant_id, aggregate_id],
                |row| row.get(0),
            )
            .map_err(|e| sqlite::backend("Query error", e))?;

        let mut sequence = last;
        for event in events {
            sequence += 1;
            let data = serde_json::to_string(&event.data)
                .map_err(|e| StoreError::Serialization(e.to_string()))?;
            tx.execute(
                "INSERT INTO events (tenant_id, aggregate_id, sequence, event_id, event_type, created_at, data)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    tenant_id,
                    aggregate_id,
                    sequence,
                    event.event_id,
                    event.event_type,
                    sqlite::format_time(&event.created_at),
                    data
                ],
            )
            .map_err(|e| {
                if sqlite::is_constraint_violation(&e) {
                    StoreError::Duplicate(format!("{}/{}#{}", tenant_id, aggregate_id, sequence))
                } else {
                    sqlite::backend("Insert error", e)
                }
            })?;
        }

        // Dropping `tx` on an early return rolls the whole batch back.
        tx.commit()
            .map_err(|e| sqlite::backend("Failed to commit events", e))?;

        count_saved(&self.metrics, tenant_id, events);
        debug!(tenant_id = %tenant_id, aggregate_id = %aggregate_id, count = events.len(), last_sequence = sequence, "Events saved");
        Ok(sequence as u64)
    }

    fn load_entries(&self, tenant_id: &str, aggregate_id: &str) -> StoreResult<Vec<EventEntry>> {
        let conn = sqlite::open(&self.db_path)?;
        let mut stmt = conn
            .prepare(
                "SELECT sequence, event_id, event_type, created_at, data FROM events
                 WHERE tenant_id = ?1 AND aggregate_id = ?2
                 ORDER BY sequence ASC",
            )
            .map_err(|e| sqlite::backend("Prepare error", e))?;
        let rows = stmt
            .query_map(params![tenant_id, aggregate_id], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, String>(4)?,
                ))
            })
            .map_err(|e| sqlite::backend("Query error", e))?;

        let mut entries = Vec::new();
        for row in rows {
            let (sequence, event_id, event_type, created_at, data) =
                row.map_err(|e| sqlite::backend("Row error", e))?;
            entries.push(EventEntry {
                tenant_id: tenant_id.to_string(),
                aggregate_id: aggregate_id.to_string(),
                sequence: sequence as u64,
                event: EventRecord {
                    data: serde_json::from_str(&data).map_err(|e| {
                        StoreError::Serialization(format!("Bad data for event {}: {}", event_id, e))
                    })?,
                    event_id,
                    event_type,
                    created_at: sqlite::parse_time(&created_at)?,
                },
            });
        }
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    fn event(n: u32) -> EventRecord {
        EventRecord::new("Deposited", json!({"amount": n}))
    }

    fn exercise(store: &dyn EventStore) {
        assert!(store.load_events("acme", "acct-1").unwrap().is_empty());

        let e1 = event(1);
        let e2 = event(2);
        let e3 = event(3);
        assert_eq!(store.save_events("acme", "acct-1", &[e1.clone(), e2.clone()]).unwrap(), 2);
        assert_eq!(store.save_events("acme", "acct-1", &[e3.clone()]).unwrap(), 3);

        assert_eq!(store.load_events("acme", "acct-1").unwrap(), vec![e1, e2, e3]);

        let entries = store.load_entries("acme", "acct-1").unwrap();
        let seqs: Vec<u64> = entries.iter().map(|e| e.sequence).collect();
        assert_eq!(seqs, vec![1, 2, 3]);

        // Same aggregate id under another tenant is a separate log.
        assert!(store.load_events("globex", "acct-1").unwrap().is_empty());
        assert_eq!(store.save_events("globex", "acct-1", &[event(9)]).unwrap(), 1);

        // An empty batch changes nothing.
        assert_eq!(store.save_events("acme", "acct-1", &[]).unwrap(), 3);
    }

    #[test]
    fn test_in_memory_store() {
        let metrics = Arc::new(Metrics::new());
        let store = InMemoryEventStore::with_metrics(metrics.clone());
        exercise(&store);
        assert_eq!(metrics.events_saved.get(&["acme", "Deposited"]), 3);
        assert_eq!(metrics.events_saved.get(&["globex", "Deposited"]), 1);
    }

    #[test]
    fn test_sqlite_store() {
        let dir = TempDir::new().unwrap();
        let store = SqliteEventStore::open(&dir.path().join("data/events.db")).unwrap();
        exercise(&store);
    }

    #[test]
    fn test_sqlite_round_trips_event_fields() {
        let dir = TempDir::new().unwrap();
        let store = SqliteEventStore::open(&dir.path().join("events.db")).unwrap();
        let original = EventRecord::new(
            "TaskAssigned",
            json!({"task_id": "t1", "details": {"x": 1, "tags": ["a", "b"]}}),
        );
        store.save_events("acme", "t1", &[original.clone()]).unwrap();

        let loaded = store.load_events("acme", "t1").unwrap();
        assert_eq!(loaded, vec![original]);
    }

    fn concurrent_appends(store: Arc<dyn EventStore>) {
        let threads: Vec<_> = (0..8)
            .map(|t| {
                let store = store.clone();
                std::thread::spawn(move || {
                    for _ in 0..5 {
                        store
                            .save_events("acme", "shared", &[event(t), event(t)])
                            .unwrap();
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }

        let entries = store.load_entries("acme", "shared").unwrap();
        assert_eq!(entries.len(), 80);
        for (i, entry) in entries.iter().enumerate() {
            assert_eq!(entry.sequence, i as u64 + 1);
        }
        // Batches are never interleaved.
        for pair in entries.chunks(2) {
            assert_eq!(pair[0].event.data, pair[1].event.data);
        }
    }

    #[test]
    fn test_in_memory_concurrent_batches_stay_contiguous() {
        concurrent_appends(Arc::new(InMemoryEventStore::new()));
    }

    #[test]
    fn test_sqlite_concurrent_batches_stay_contiguous() {
        let dir = TempDir::new().unwrap();
        let store = SqliteEventStore::open(&dir.path().join("events.db")).unwrap();
        concurrent_appends(Arc::new(store));
    }
}
