use memshift_types::{
    BackendConfig, BackendKind, HealthMetrics, HealthStatus, MemoryEntry, MemoryFilter,
    MigrationStats, PoolStatus, VerificationReport,
};
use std::collections::BTreeMap;
use std::sync::RwLock;
use thiserror::Error;

pub mod codec;
mod migrate;
mod postgres;
mod source;
mod verify;

pub use codec::{RawEntry, ValidationError};
pub use migrate::{
    DEFAULT_BATCH_SIZE, MigrationEngine, MigrationOptions, MigrationRunner, MigrationState,
};
pub use postgres::PostgresBackend;
pub use source::SqliteSource;
pub use verify::{SAMPLE_SIZE, verify_migration};

pub type StoreResult<T> = Result<T, StoreError>;

/// Target-side operation failures. `Initialization` aborts before any data
/// moves; `Storage` is batch-scoped during migration and fatal for the
/// single operation otherwise.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("backend not initialized")]
    NotInitialized,
    #[error("initialization failed: {0}")]
    Initialization(String),
    #[error("storage operation failed: {0}")]
    Storage(String),
    #[error("maintenance failed: {0}")]
    Maintenance(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("lock poisoned")]
    Poisoned,
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        StoreError::Storage(err.to_string())
    }
}

impl From<::postgres::Error> for StoreError {
    fn from(err: ::postgres::Error) -> Self {
        StoreError::Storage(err.to_string())
    }
}

/// Whole-run migration failure. Committed batches stay committed; the
/// partial stats tell the operator how far the run got.
#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("migration engine not initialized")]
    NotInitialized,
    #[error("migration aborted after {} of {} entries: {source}", .stats.migrated_entries, .stats.total_entries)]
    Aborted {
        stats: MigrationStats,
        #[source]
        source: StoreError,
    },
}

#[derive(Debug, Error)]
#[error(
    "verification failed: source={} target={} counts_match={} sample_verification={}",
    .report.source_count,
    .report.target_count,
    .report.counts_match,
    .report.sample_verification
)]
pub struct VerificationFailedError {
    pub report: VerificationReport,
}

/// Union surfaced by the orchestrator (and the CLI exit path).
#[derive(Debug, Error)]
pub enum MigrationRunError {
    #[error("initialization failed: {0}")]
    Initialization(#[from] StoreError),
    #[error(transparent)]
    Migration(#[from] MigrationError),
    #[error(transparent)]
    Verification(#[from] VerificationFailedError),
}

/// Relational target for memory entries. `store` and `update` are the same
/// upsert; `retrieve` treats absence as `None`, not an error.
pub trait MemoryBackend: Send + Sync {
    fn initialize(&self) -> StoreResult<()>;
    fn shutdown(&self) -> StoreResult<()>;

    fn store(&self, entry: &MemoryEntry) -> StoreResult<()>;
    fn store_batch(&self, entries: &[MemoryEntry]) -> StoreResult<()>;
    fn retrieve(&self, id: &str) -> StoreResult<Option<MemoryEntry>>;
    fn update(&self, id: &str, entry: &MemoryEntry) -> StoreResult<()>;
    fn delete(&self, id: &str) -> StoreResult<()>;

    fn query(&self, filter: &MemoryFilter) -> StoreResult<Vec<MemoryEntry>>;
    fn get_all_entries(&self) -> StoreResult<Vec<MemoryEntry>>;
    fn count_entries(&self) -> StoreResult<u64>;

    fn health_status(&self) -> HealthStatus;
    fn perform_maintenance(&self) -> StoreResult<()>;
}

impl<T: MemoryBackend + ?Sized> MemoryBackend for std::sync::Arc<T> {
    fn initialize(&self) -> StoreResult<()> {
        (**self).initialize()
    }
    fn shutdown(&self) -> StoreResult<()> {
        (**self).shutdown()
    }
    fn store(&self, entry: &MemoryEntry) -> StoreResult<()> {
        (**self).store(entry)
    }
    fn store_batch(&self, entries: &[MemoryEntry]) -> StoreResult<()> {
        (**self).store_batch(entries)
    }
    fn retrieve(&self, id: &str) -> StoreResult<Option<MemoryEntry>> {
        (**self).retrieve(id)
    }
    fn update(&self, id: &str, entry: &MemoryEntry) -> StoreResult<()> {
        (**self).update(id, entry)
    }
    fn delete(&self, id: &str) -> StoreResult<()> {
        (**self).delete(id)
    }
    fn query(&self, filter: &MemoryFilter) -> StoreResult<Vec<MemoryEntry>> {
        (**self).query(filter)
    }
    fn get_all_entries(&self) -> StoreResult<Vec<MemoryEntry>> {
        (**self).get_all_entries()
    }
    fn count_entries(&self) -> StoreResult<u64> {
        (**self).count_entries()
    }
    fn health_status(&self) -> HealthStatus {
        (**self).health_status()
    }
    fn perform_maintenance(&self) -> StoreResult<()> {
        (**self).perform_maintenance()
    }
}

/// Select a backend from configuration.
pub fn open_backend(config: &BackendConfig) -> Box<dyn MemoryBackend> {
    match config.backend {
        BackendKind::InMemory => Box::new(InMemoryBackend::new()),
        BackendKind::Postgres => Box::new(PostgresBackend::new(config.clone())),
    }
}

/// Reference backend with the same query semantics as the relational one.
/// Used by the migration engine tests and selectable via
/// `BackendKind::InMemory`.
#[derive(Debug, Default)]
pub struct InMemoryBackend {
    entries: RwLock<BTreeMap<String, MemoryEntry>>,
    initialized: RwLock<bool>,
}

impl InMemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MemoryBackend for InMemoryBackend {
    fn initialize(&self) -> StoreResult<()> {
        let mut guard = self.initialized.write().map_err(|_| StoreError::Poisoned)?;
        *guard = true;
        Ok(())
    }

    fn shutdown(&self) -> StoreResult<()> {
        let mut guard = self.initialized.write().map_err(|_| StoreError::Poisoned)?;
        *guard = false;
        Ok(())
    }

    fn store(&self, entry: &MemoryEntry) -> StoreResult<()> {
        let mut guard = self.entries.write().map_err(|_| StoreError::Poisoned)?;
        guard.insert(entry.id.clone(), entry.clone());
        Ok(())
    }

    fn store_batch(&self, entries: &[MemoryEntry]) -> StoreResult<()> {
        let mut guard = self.entries.write().map_err(|_| StoreError::Poisoned)?;
        for entry in entries {
            guard.insert(entry.id.clone(), entry.clone());
        }
        Ok(())
    }

    fn retrieve(&self, id: &str) -> StoreResult<Option<MemoryEntry>> {
        let guard = self.entries.read().map_err(|_| StoreError::Poisoned)?;
        Ok(guard.get(id).cloned())
    }

    fn update(&self, id: &str, entry: &MemoryEntry) -> StoreResult<()> {
        let mut updated = entry.clone();
        updated.id = id.to_string();
        self.store(&updated)
    }

    fn delete(&self, id: &str) -> StoreResult<()> {
        let mut guard = self.entries.write().map_err(|_| StoreError::Poisoned)?;
        guard.remove(id);
        for entry in guard.values_mut() {
            if entry.parent_id.as_deref() == Some(id) {
                entry.parent_id = None;
            }
        }
        Ok(())
    }

    fn query(&self, filter: &MemoryFilter) -> StoreResult<Vec<MemoryEntry>> {
        let guard = self.entries.read().map_err(|_| StoreError::Poisoned)?;
        let mut results: Vec<MemoryEntry> = guard
            .values()
            .filter(|entry| entry_matches(entry, filter))
            .cloned()
            .collect();

        results.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then_with(|| a.id.cmp(&b.id)));

        let offset = filter.offset.unwrap_or(0);
        let results: Vec<MemoryEntry> = match filter.limit {
            Some(limit) => results.into_iter().skip(offset).take(limit).collect(),
            None => results.into_iter().skip(offset).collect(),
        };
        Ok(results)
    }

    fn get_all_entries(&self) -> StoreResult<Vec<MemoryEntry>> {
        self.query(&MemoryFilter::default())
    }

    fn count_entries(&self) -> StoreResult<u64> {
        let guard = self.entries.read().map_err(|_| StoreError::Poisoned)?;
        Ok(guard.len() as u64)
    }

    fn health_status(&self) -> HealthStatus {
        let entry_count = match self.count_entries() {
            Ok(count) => count,
            Err(err) => return HealthStatus::unhealthy(err.to_string()),
        };
        HealthStatus {
            healthy: true,
            error: None,
            metrics: Some(HealthMetrics {
                entry_count,
                storage_bytes: 0,
                pool: PoolStatus {
                    connections: 0,
                    idle_connections: 0,
                    max_size: 0,
                },
            }),
        }
    }

    fn perform_maintenance(&self) -> StoreResult<()> {
        Ok(())
    }
}

fn entry_matches(entry: &MemoryEntry, filter: &MemoryFilter) -> bool {
    if let Some(agent_id) = &filter.agent_id {
        if &entry.agent_id != agent_id {
            return false;
        }
    }
    if let Some(session_id) = &filter.session_id {
        if &entry.session_id != session_id {
            return false;
        }
    }
    if let Some(kind) = &filter.kind {
        if &entry.kind != kind {
            return false;
        }
    }
    if let Some(start) = filter.start_time {
        if entry.timestamp < start {
            return false;
        }
    }
    if let Some(end) = filter.end_time {
        if entry.timestamp > end {
            return false;
        }
    }
    if let Some(search) = &filter.search {
        let needle = search.to_lowercase();
        let content_hit = entry.content.to_lowercase().contains(&needle);
        let tag_hit = entry
            .tags
            .iter()
            .any(|tag| tag.to_lowercase().contains(&needle));
        if !content_hit && !tag_hit {
            return false;
        }
    }
    if !filter.tags.is_empty() && !entry.tags.iter().any(|tag| filter.tags.contains(tag)) {
        return false;
    }
    if let Some(namespace) = &filter.namespace {
        let entry_namespace = entry
            .metadata
            .as_ref()
            .and_then(|metadata| metadata.get("namespace"))
            .and_then(|value| value.as_str());
        if entry_namespace != Some(namespace.as_str()) {
            return false;
        }
    }
    true
}
