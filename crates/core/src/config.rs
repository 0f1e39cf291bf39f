use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::Result;
use crate::message::DEFAULT_TENANT;
use crate::paths::Paths;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct RouterConfig {
    /// When set, the router only accepts envelopes of this tenant.
    #[serde(default)]
    pub tenant_scope: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BusConfig {
    /// Scheme used for derived event addresses (`<scheme>:events.<Type>`).
    #[serde(default = "default_scheme")]
    pub default_scheme: String,
    #[serde(default = "default_tenant")]
    pub tenant_id: String,
}

fn default_scheme() -> String {
    "default".to_string()
}

fn default_tenant() -> String {
    DEFAULT_TENANT.to_string()
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            default_scheme: default_scheme(),
            tenant_id: default_tenant(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum AuditBackend {
    #[default]
    Sqlite,
    Jsonl,
    Memory,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "camelCase")]
pub enum EventBackend {
    #[default]
    Sqlite,
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct StorageConfig {
    #[serde(default)]
    pub audit: AuditBackend,
    #[serde(default)]
    pub events: EventBackend,
    /// Overrides `Paths::audit_db()`.
    #[serde(default)]
    pub audit_db: Option<String>,
    /// Overrides `Paths::events_db()`.
    #[serde(default)]
    pub events_db: Option<String>,
}

impl StorageConfig {
    pub fn audit_db_path(&self, paths: &Paths) -> PathBuf {
        self.audit_db
            .as_deref()
            .map(PathBuf::from)
            .unwrap_or_else(|| paths.audit_db())
    }

    pub fn events_db_path(&self, paths: &Paths) -> PathBuf {
        self.events_db
            .as_deref()
            .map(PathBuf::from)
            .unwrap_or_else(|| paths.events_db())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum AdapterKind {
    /// In-process topics, push-callback subscription, ack at receipt.
    MemoryTopic,
    /// In-process queues, pull-poll with ack after yield.
    MemoryQueue,
    /// HTTP POST of the serialized envelope to the destination URL.
    Webhook,
}

impl std::fmt::Display for AdapterKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AdapterKind::MemoryTopic => write!(f, "memory-topic"),
            AdapterKind::MemoryQueue => write!(f, "memory-queue"),
            AdapterKind::Webhook => write!(f, "webhook"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitConfig {
    /// Burst capacity.
    pub capacity: u32,
    pub per_second: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    100
}

fn default_max_delay_ms() -> u64 {
    30_000
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Time the circuit stays open before a trial send is let through.
    #[serde(default = "default_recovery_timeout_ms")]
    pub recovery_timeout_ms: u64,
    /// Successful trial sends needed to close it again.
    #[serde(default = "default_half_open_successes")]
    pub half_open_successes: u32,
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_recovery_timeout_ms() -> u64 {
    60_000
}

fn default_half_open_successes() -> u32 {
    2
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            recovery_timeout_ms: default_recovery_timeout_ms(),
            half_open_successes: default_half_open_successes(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkheadConfig {
    /// Sends allowed in flight at once.
    pub max_concurrent: u32,
    /// Sends allowed to wait for a slot; further ones are rejected.
    #[serde(default)]
    pub max_waiting: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdapterConfig {
    pub kind: AdapterKind,
    #[serde(default)]
    pub rate_limit: Option<RateLimitConfig>,
    #[serde(default)]
    pub retry: Option<RetryConfig>,
    #[serde(default)]
    pub circuit_breaker: Option<CircuitBreakerConfig>,
    #[serde(default)]
    pub bulkhead: Option<BulkheadConfig>,
    /// Upper bound on one blocking poll of a queue.
    #[serde(default = "default_poll_timeout_ms")]
    pub poll_timeout_ms: u64,
    /// Pause after an empty poll.
    #[serde(default = "default_idle_backoff_ms")]
    pub idle_backoff_ms: u64,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Queues declared on the in-memory broker at startup.
    #[serde(default)]
    pub queues: Vec<String>,
}

fn default_poll_timeout_ms() -> u64 {
    1000
}

fn default_idle_backoff_ms() -> u64 {
    100
}

fn default_request_timeout_secs() -> u64 {
    30
}

impl AdapterConfig {
    pub fn new(kind: AdapterKind) -> Self {
        Self {
            kind,
            rate_limit: None,
            retry: None,
            circuit_breaker: None,
            bulkhead: None,
            poll_timeout_ms: default_poll_timeout_ms(),
            idle_backoff_ms: default_idle_backoff_ms(),
            request_timeout_secs: default_request_timeout_secs(),
            queues: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default)]
    pub router: RouterConfig,
    #[serde(default)]
    pub bus: BusConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default = "default_adapters")]
    pub adapters: BTreeMap<String, AdapterConfig>,
}

fn default_adapters() -> BTreeMap<String, AdapterConfig> {
    let mut adapters = BTreeMap::new();
    adapters.insert(
        default_scheme(),
        AdapterConfig::new(AdapterKind::MemoryTopic),
    );
    adapters
}

impl Default for Config {
    fn default() -> Self {
        Self {
            router: RouterConfig::default(),
            bus: BusConfig::default(),
            storage: StorageConfig::default(),
            adapters: default_adapters(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&content)?;
        debug!(path = %path.display(), adapters = config.adapters.len(), "Loaded config");
        Ok(config)
    }

    pub fn load_or_default(paths: &Paths) -> Result<Self> {
        let config_path = paths.config_file();
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            debug!(path = %config_path.display(), "No config file, using defaults");
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_register_default_scheme() {
        let cfg: Config = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.bus.default_scheme, "default");
        assert_eq!(cfg.bus.tenant_id, DEFAULT_TENANT);
        assert_eq!(cfg.adapters["default"].kind, AdapterKind::MemoryTopic);
        assert_eq!(cfg.storage.audit, AuditBackend::Sqlite);
    }

    #[test]
    fn test_camel_case_adapters() {
        let raw = r#"{
  "router": { "tenantScope": "acme" },
  "adapters": {
    "jobs": { "kind": "memoryQueue", "queues": ["work"], "pollTimeoutMs": 50,
              "retry": { "maxAttempts": 5 } },
    "hook": { "kind": "webhook", "rateLimit": { "capacity": 2, "perSecond": 1.0 },
              "circuitBreaker": { "failureThreshold": 3 },
              "bulkhead": { "maxConcurrent": 4 } }
  }
}"#;
        let cfg: Config = serde_json::from_str(raw).unwrap();
        assert_eq!(cfg.router.tenant_scope.as_deref(), Some("acme"));
        let jobs = &cfg.adapters["jobs"];
        assert_eq!(jobs.kind, AdapterKind::MemoryQueue);
        assert_eq!(jobs.queues, vec!["work".to_string()]);
        assert_eq!(jobs.poll_timeout_ms, 50);
        assert_eq!(jobs.idle_backoff_ms, 100);
        let retry = jobs.retry.as_ref().unwrap();
        assert_eq!(retry.max_attempts, 5);
        assert_eq!(retry.base_delay_ms, 100);
        let hook = &cfg.adapters["hook"];
        assert_eq!(hook.rate_limit.as_ref().unwrap().capacity, 2);
        let breaker = hook.circuit_breaker.as_ref().unwrap();
        assert_eq!(breaker.failure_threshold, 3);
        assert_eq!(breaker.recovery_timeout_ms, 60_000);
        assert_eq!(breaker.half_open_successes, 2);
        let bulkhead = hook.bulkhead.as_ref().unwrap();
        assert_eq!((bulkhead.max_concurrent, bulkhead.max_waiting), (4, 0));
        assert!(jobs.circuit_breaker.is_none());
        assert!(!cfg.adapters.contains_key("default"));
    }

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let paths = Paths::with_base(dir.path().to_path_buf());
        let mut cfg = Config::default();
        cfg.bus.tenant_id = "tenant-x".to_string();
        cfg.save(&paths.config_file()).unwrap();

        let loaded = Config::load_or_default(&paths).unwrap();
        assert_eq!(loaded.bus.tenant_id, "tenant-x");
        assert_eq!(
            loaded.storage.events_db_path(&paths),
            dir.path().join("data").join("events.db")
        );
    }
}
