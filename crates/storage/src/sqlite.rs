use std::path::Path;
use std::time::Duration;

use agentmesh_core::StoreError;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, ErrorCode};

use crate::StoreResult;

/// How long a writer waits on another connection's lock before failing.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Open a fresh connection. Stores open one per call so concurrent writers
/// get their own transaction instead of queueing on a shared handle.
pub(crate) fn open(db_path: &Path) -> StoreResult<Connection> {
    let conn = Connection::open(db_path)
        .map_err(|e| StoreError::Backend(format!("Failed to open {}: {}", db_path.display(), e)))?;
    conn.busy_timeout(BUSY_TIMEOUT)
        .map_err(|e| backend("Failed to set busy timeout", e))?;
    Ok(conn)
}

/// Create the parent directory, switch to WAL and run the schema batch.
pub(crate) fn init(db_path: &Path, schema: &str) -> StoreResult<()> {
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| StoreError::Backend(format!("Failed to create db directory: {}", e)))?;
    }
    let conn = open(db_path)?;
    conn.execute_batch("PRAGMA journal_mode=WAL;").ok();
    conn.execute_batch(schema)
        .map_err(|e| backend("Failed to init schema", e))?;
    Ok(())
}

pub(crate) fn backend(context: &str, e: rusqlite::Error) -> StoreError {
    StoreError::Backend(format!("{}: {}", context, e))
}

pub(crate) fn is_constraint_violation(e: &rusqlite::Error) -> bool {
    matches!(e, rusqlite::Error::SqliteFailure(f, _) if f.code == ErrorCode::ConstraintViolation)
}

/// Fixed-width RFC 3339 at nanosecond precision, so text ordering matches
/// time ordering and stored times read back unchanged.
pub(crate) fn format_time(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

pub(crate) fn parse_time(s: &str) -> StoreResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::Serialization(format!("Bad timestamp '{}': {}", s, e)))
}
