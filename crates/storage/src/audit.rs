//! Audit trail of routed envelopes: one record per accepted envelope, written
//! once and never updated.

use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, HashSet};
use std::fs::OpenOptions;
use std::hash::{Hash, Hasher};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use agentmesh_core::{Paths, StoreError, UniversalMessage};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error};

use crate::{sqlite, StoreResult};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub message_id: String,
    pub tenant_id: String,
    pub targets: Vec<String>,
    /// Snapshot of the envelope payload at routing time.
    pub payload: Value,
    pub created_at: DateTime<Utc>,
}

impl AuditRecord {
    pub fn from_message(message: &UniversalMessage, targets: Vec<String>) -> Self {
        Self {
            message_id: message.id().to_string(),
            tenant_id: message.tenant_id().to_string(),
            targets,
            payload: Value::Object(message.payload().clone()),
            created_at: Utc::now(),
        }
    }
}

#[async_trait]
pub trait AuditStore: Send + Sync {
    fn backend(&self) -> &'static str;

    /// Fails with `StoreError::Duplicate` if a record with the same message id
    /// already exists.
    async fn append(&self, record: AuditRecord) -> StoreResult<()>;

    async fn get(&self, message_id: &str) -> StoreResult<Option<AuditRecord>>;

    /// Most recent first.
    async fn query(&self, tenant_id: &str, limit: usize) -> StoreResult<Vec<AuditRecord>>;
}

// ── In-memory ───────────────────────────────────────────────────────────────

const SHARDS: usize = 16;

/// Records sharded by message id, so appends for unrelated ids mostly take
/// different locks.
pub struct MemoryAuditStore {
    shards: Vec<Mutex<HashMap<String, (u64, AuditRecord)>>>,
    seq: AtomicU64,
}

impl MemoryAuditStore {
    pub fn new() -> Self {
        Self {
            shards: (0..SHARDS).map(|_| Mutex::new(HashMap::new())).collect(),
            seq: AtomicU64::new(0),
        }
    }

    fn shard(&self, message_id: &str) -> &Mutex<HashMap<String, (u64, AuditRecord)>> {
        let mut hasher = DefaultHasher::new();
        message_id.hash(&mut hasher);
        &self.shards[(hasher.finish() as usize) % SHARDS]
    }

    pub fn len(&self) -> usize {
        self.shards
            .iter()
            .map(|s| s.lock().unwrap_or_else(|e| e.into_inner()).len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for MemoryAuditStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AuditStore for MemoryAuditStore {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn append(&self, record: AuditRecord) -> StoreResult<()> {
        let mut shard = self
            .shard(&record.message_id)
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if shard.contains_key(&record.message_id) {
            return Err(StoreError::Duplicate(record.message_id));
        }
        let seq = self.seq.fetch_add(1, Ordering::SeqCst);
        shard.insert(record.message_id.clone(), (seq, record));
        Ok(())
    }

    async fn get(&self, message_id: &str) -> StoreResult<Option<AuditRecord>> {
        let shard = self.shard(message_id).lock().unwrap_or_else(|e| e.into_inner());
        Ok(shard.get(message_id).map(|(_, r)| r.clone()))
    }

    async fn query(&self, tenant_id: &str, limit: usize) -> StoreResult<Vec<AuditRecord>> {
        let mut matched: Vec<(u64, AuditRecord)> = Vec::new();
        for shard in &self.shards {
            let shard = shard.lock().unwrap_or_else(|e| e.into_inner());
            matched.extend(
                shard
                    .values()
                    .filter(|(_, r)| r.tenant_id == tenant_id)
                    .cloned(),
            );
        }
        matched.sort_by(|a, b| b.0.cmp(&a.0));
        Ok(matched.into_iter().take(limit).map(|(_, r)| r).collect())
    }
}

// ── SQLite ──────────────────────────────────────────────────────────────────

const AUDIT_SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS audit_records (
        message_id TEXT PRIMARY KEY,
        tenant_id TEXT NOT NULL,
        targets TEXT NOT NULL,
        payload TEXT NOT NULL,
        created_at TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_audit_tenant_created
        ON audit_records(tenant_id, created_at);
";

/// SQLite-backed audit store. Each call opens its own connection on a
/// blocking task; the primary key serializes writers per message id.
#[derive(Clone)]
pub struct SqliteAuditStore {
    db_path: PathBuf,
}

impl SqliteAuditStore {
    pub fn open(db_path: &Path) -> StoreResult<Self> {
        sqlite::init(db_path, AUDIT_SCHEMA)?;
        debug!(path = %db_path.display(), "Audit store schema initialized");
        Ok(Self {
            db_path: db_path.to_path_buf(),
        })
    }
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<(String, String, String, String, String)> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
}

fn decode_row(raw: (String, String, String, String, String)) -> StoreResult<AuditRecord> {
    let (message_id, tenant_id, targets, payload, created_at) = raw;
    Ok(AuditRecord {
        targets: serde_json::from_str(&targets)
            .map_err(|e| StoreError::Serialization(format!("Bad targets for {}: {}", message_id, e)))?,
        payload: serde_json::from_str(&payload)
            .map_err(|e| StoreError::Serialization(format!("Bad payload for {}: {}", message_id, e)))?,
        created_at: sqlite::parse_time(&created_at)?,
        message_id,
        tenant_id,
    })
}

#[async_trait]
impl AuditStore for SqliteAuditStore {
    fn backend(&self) -> &'static str {
        "sqlite"
    }

    async fn append(&self, record: AuditRecord) -> StoreResult<()> {
        let db_path = self.db_path.clone();
        crate::run_blocking(move || {
            let targets = serde_json::to_string(&record.targets)
                .map_err(|e| StoreError::Serialization(e.to_string()))?;
            let payload = serde_json::to_string(&record.payload)
                .map_err(|e| StoreError::Serialization(e.to_string()))?;
            let conn = sqlite::open(&db_path)?;
            conn.execute(
                "INSERT INTO audit_records (message_id, tenant_id, targets, payload, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    record.message_id,
                    record.tenant_id,
                    targets,
                    payload,
                    sqlite::format_time(&record.created_at)
                ],
            )
            .map_err(|e| {
                if sqlite::is_constraint_violation(&e) {
                    StoreError::Duplicate(record.message_id.clone())
                } else {
                    sqlite::backend("Insert error", e)
                }
            })?;
            Ok(())
        })
        .await
    }

    async fn get(&self, message_id: &str) -> StoreResult<Option<AuditRecord>> {
        let db_path = self.db_path.clone();
        let message_id = message_id.to_string();
        crate::run_blocking(move || {
            let conn = sqlite::open(&db_path)?;
            let raw = conn
                .query_row(
                    "SELECT message_id, tenant_id, targets, payload, created_at
                     FROM audit_records WHERE message_id = ?1",
                    params![message_id],
                    row_to_record,
                )
                .optional()
                .map_err(|e| sqlite::backend("Query error", e))?;
            raw.map(decode_row).transpose()
        })
        .await
    }

    async fn query(&self, tenant_id: &str, limit: usize) -> StoreResult<Vec<AuditRecord>> {
        let db_path = self.db_path.clone();
        let tenant_id = tenant_id.to_string();
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        crate::run_blocking(move || {
            let conn = sqlite::open(&db_path)?;
            let mut stmt = conn
                .prepare(
                    "SELECT message_id, tenant_id, targets, payload, created_at
                     FROM audit_records WHERE tenant_id = ?1
                     ORDER BY created_at DESC, rowid DESC LIMIT ?2",
                )
                .map_err(|e| sqlite::backend("Prepare error", e))?;
            let rows = stmt
                .query_map(params![tenant_id, limit], row_to_record)
                .map_err(|e| sqlite::backend("Query error", e))?;

            let mut records = Vec::new();
            for row in rows {
                let raw = row.map_err(|e| sqlite::backend("Row error", e))?;
                records.push(decode_row(raw)?);
            }
            Ok(records)
        })
        .await
    }
}

// ── JSONL ───────────────────────────────────────────────────────────────────

/// Append-only daily JSONL files (`<audit_dir>/YYYY-MM-DD.jsonl`).
///
/// Known message ids are indexed in memory at open so duplicates are rejected
/// without rescanning the files.
pub struct JsonlAuditStore {
    dir: PathBuf,
    known_ids: Arc<Mutex<HashSet<String>>>,
}

impl JsonlAuditStore {
    pub fn open(paths: &Paths) -> StoreResult<Self> {
        let dir = paths.audit_dir();
        std::fs::create_dir_all(&dir)
            .map_err(|e| StoreError::Backend(format!("Failed to create audit directory: {}", e)))?;
        let known_ids = read_all(&dir)?
            .into_iter()
            .map(|r| r.message_id)
            .collect();
        Ok(Self {
            dir,
            known_ids: Arc::new(Mutex::new(known_ids)),
        })
    }

    fn log_file_for(&self, at: &DateTime<Utc>) -> PathBuf {
        self.dir.join(format!("{}.jsonl", at.format("%Y-%m-%d")))
    }

    /// Records from one day's file, in append order.
    pub fn read_day(&self, date: &str) -> StoreResult<Vec<AuditRecord>> {
        read_file(&self.dir.join(format!("{}.jsonl", date)))
    }
}

fn read_file(path: &Path) -> StoreResult<Vec<AuditRecord>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let content = std::fs::read_to_string(path)
        .map_err(|e| StoreError::Backend(format!("Failed to read {}: {}", path.display(), e)))?;
    let mut records = Vec::new();
    for line in content.lines() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<AuditRecord>(line) {
            Ok(record) => records.push(record),
            Err(e) => {
                error!(error = %e, file = %path.display(), "Failed to parse audit record");
            }
        }
    }
    Ok(records)
}

/// Every record under `dir`, oldest day first, append order within a day.
fn read_all(dir: &Path) -> StoreResult<Vec<AuditRecord>> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(StoreError::Backend(format!("Failed to list audit dir: {}", e))),
    };
    let mut files: Vec<PathBuf> = entries
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.extension().and_then(|x| x.to_str()) == Some("jsonl"))
        .collect();
    files.sort();

    let mut records = Vec::new();
    for file in files {
        records.extend(read_file(&file)?);
    }
    Ok(records)
}

#[async_trait]
impl AuditStore for JsonlAuditStore {
    fn backend(&self) -> &'static str {
        "jsonl"
    }

    async fn append(&self, record: AuditRecord) -> StoreResult<()> {
        {
            let mut known = self.known_ids.lock().unwrap_or_else(|e| e.into_inner());
            if !known.insert(record.message_id.clone()) {
                return Err(StoreError::Duplicate(record.message_id));
            }
        }

        let path = self.log_file_for(&record.created_at);
        let message_id = record.message_id.clone();
        let written = crate::run_blocking(move || {
            let mut line = serde_json::to_string(&record)
                .map_err(|e| StoreError::Serialization(e.to_string()))?;
            line.push('\n');
            let mut file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .map_err(|e| StoreError::Backend(format!("Failed to open {}: {}", path.display(), e)))?;
            // One write per line keeps concurrent appends from interleaving.
            file.write_all(line.as_bytes())
                .map_err(|e| StoreError::Backend(format!("Failed to append audit record: {}", e)))
        })
        .await;

        if written.is_err() {
            self.known_ids
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(&message_id);
        }
        written
    }

    async fn get(&self, message_id: &str) -> StoreResult<Option<AuditRecord>> {
        if !self
            .known_ids
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(message_id)
        {
            return Ok(None);
        }
        let dir = self.dir.clone();
        let message_id = message_id.to_string();
        crate::run_blocking(move || {
            Ok(read_all(&dir)?
                .into_iter()
                .find(|r| r.message_id == message_id))
        })
        .await
    }

    async fn query(&self, tenant_id: &str, limit: usize) -> StoreResult<Vec<AuditRecord>> {
        let dir = self.dir.clone();
        let tenant_id = tenant_id.to_string();
        crate::run_blocking(move || {
            Ok(read_all(&dir)?
                .into_iter()
                .rev()
                .filter(|r| r.tenant_id == tenant_id)
                .take(limit)
                .collect())
        })
        .await
    }
}
