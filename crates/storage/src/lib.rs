pub mod audit;
pub mod event_store;
mod sqlite;

use agentmesh_core::StoreError;

pub use audit::{AuditRecord, AuditStore, JsonlAuditStore, MemoryAuditStore, SqliteAuditStore};
pub use event_store::{
    save_events_async, EventEntry, EventRecord, EventStore, InMemoryEventStore, SqliteEventStore,
};

pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Run blocking storage work off the async executor.
pub(crate) async fn run_blocking<T, F>(f: F) -> StoreResult<T>
where
    T: Send + 'static,
    F: FnOnce() -> StoreResult<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| StoreError::Backend(format!("Storage task failed: {}", e)))?
}
