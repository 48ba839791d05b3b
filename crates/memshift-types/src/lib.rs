use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub type JsonMap = BTreeMap<String, serde_json::Value>;

/// A single agent/session-scoped memory record. `id` is the primary key and
/// immutable once created; everything else is overwritten on upsert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryEntry {
    pub id: String,
    pub agent_id: String,
    pub session_id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub content: String,
    #[serde(default)]
    pub context: JsonMap,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default = "default_version")]
    pub version: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<JsonMap>,
}

/// Filter for `MemoryBackend::query`. Every field is optional; provided
/// fields are AND-combined. `tags` matches entries carrying at least one of
/// the given tags.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MemoryFilter {
    #[serde(default)]
    pub agent_id: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
    #[serde(default)]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub search: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub namespace: Option<String>,
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub offset: Option<usize>,
}

/// Accumulated counters for one migration run. Never persisted; returned to
/// the caller and attached to `MigrationError` on abort.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationStats {
    pub total_entries: u64,
    pub migrated_entries: u64,
    pub skipped_entries: u64,
    pub errors: u64,
    pub duration_ms: u64,
}

/// Outcome of the post-migration consistency check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerificationReport {
    pub source_count: u64,
    pub target_count: u64,
    pub counts_match: bool,
    pub sample_verification: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    pub healthy: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<HealthMetrics>,
}

impl HealthStatus {
    pub fn unhealthy(error: impl Into<String>) -> Self {
        Self {
            healthy: false,
            error: Some(error.into()),
            metrics: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthMetrics {
    pub entry_count: u64,
    pub storage_bytes: u64,
    pub pool: PoolStatus,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolStatus {
    pub connections: u32,
    pub idle_connections: u32,
    pub max_size: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    InMemory,
    Postgres,
}

/// Target-side configuration consumed by `PostgresBackend::initialize`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    #[serde(default = "default_backend_kind")]
    pub backend: BackendKind,
    pub dsn: String,
    #[serde(default)]
    pub pool: PoolConfig,
}

impl BackendConfig {
    pub fn postgres(dsn: impl Into<String>) -> Self {
        Self {
            backend: BackendKind::Postgres,
            dsn: dsn.into(),
            pool: PoolConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    #[serde(default = "default_pool_max_size")]
    pub max_size: u32,
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_size: default_pool_max_size(),
            idle_timeout_secs: default_idle_timeout_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

fn default_version() -> i64 {
    1
}

fn default_backend_kind() -> BackendKind {
    BackendKind::Postgres
}

fn default_pool_max_size() -> u32 {
    10
}

fn default_idle_timeout_secs() -> u64 {
    300
}

fn default_connect_timeout_secs() -> u64 {
    30
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn roundtrip_minimal_entry() {
        let entry = MemoryEntry {
            id: "m1".to_string(),
            agent_id: "a1".to_string(),
            session_id: "s1".to_string(),
            kind: "observation".to_string(),
            content: "saw a thing".to_string(),
            context: JsonMap::new(),
            timestamp: Utc::now(),
            tags: Vec::new(),
            version: 1,
            parent_id: None,
            metadata: None,
        };

        let json = serde_json::to_string(&entry).unwrap();
        let back: MemoryEntry = serde_json::from_str(&json).unwrap();

        assert_eq!(back, entry);
        assert_eq!(back.version, 1);
    }

    #[test]
    fn absent_optionals_stay_absent() {
        let entry = MemoryEntry {
            id: "m1".to_string(),
            agent_id: "a1".to_string(),
            session_id: "s1".to_string(),
            kind: "observation".to_string(),
            content: "x".to_string(),
            context: JsonMap::new(),
            timestamp: Utc::now(),
            tags: Vec::new(),
            version: 1,
            parent_id: None,
            metadata: None,
        };

        let value = serde_json::to_value(&entry).unwrap();
        let object = value.as_object().unwrap();
        assert!(!object.contains_key("parent_id"));
        assert!(!object.contains_key("metadata"));
        assert_eq!(object.get("type"), Some(&json!("observation")));
    }

    #[test]
    fn entry_defaults_apply_on_deserialize() {
        let entry: MemoryEntry = serde_json::from_value(json!({
            "id": "m2",
            "agent_id": "a1",
            "session_id": "s1",
            "type": "note",
            "content": "hello",
            "timestamp": "2026-03-01T12:00:00Z"
        }))
        .unwrap();

        assert_eq!(entry.version, 1);
        assert!(entry.context.is_empty());
        assert!(entry.tags.is_empty());
        assert!(entry.parent_id.is_none());
        assert!(entry.metadata.is_none());
    }

    #[test]
    fn pool_config_defaults() {
        let config: BackendConfig = serde_json::from_value(json!({
            "dsn": "postgres://localhost/memshift"
        }))
        .unwrap();

        assert_eq!(config.backend, BackendKind::Postgres);
        assert_eq!(config.pool.max_size, 10);
        assert_eq!(config.pool.idle_timeout_secs, 300);
        assert_eq!(config.pool.connect_timeout_secs, 30);
    }
}
