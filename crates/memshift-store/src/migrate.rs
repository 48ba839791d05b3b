use memshift_types::{MigrationStats, VerificationReport};
use std::path::PathBuf;
use std::time::Instant;
use tracing::{debug, info, instrument, warn};

use crate::{
    MemoryBackend, MigrationError, MigrationRunError, SqliteSource, StoreError, StoreResult,
    VerificationFailedError, codec, verify,
};

pub const DEFAULT_BATCH_SIZE: u64 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationState {
    Uninitialized,
    Initialized,
    Running,
    Completed,
    Failed,
}

/// Drives the batched source-to-target transfer. Strictly sequential: one
/// page is read, converted, and written before the next fetch, so a single
/// run never races its own offsets.
pub struct MigrationEngine<B: MemoryBackend> {
    source_path: PathBuf,
    source: Option<SqliteSource>,
    backend: B,
    batch_size: u64,
    state: MigrationState,
}

impl<B: MemoryBackend> MigrationEngine<B> {
    pub fn new<P: Into<PathBuf>>(source_path: P, backend: B, batch_size: u64) -> Self {
        Self {
            source_path: source_path.into(),
            source: None,
            backend,
            batch_size: batch_size.max(1),
            state: MigrationState::Uninitialized,
        }
    }

    /// Wrap an already-open source, e.g. an in-memory one.
    pub fn with_source(source: SqliteSource, backend: B, batch_size: u64) -> Self {
        Self {
            source_path: source.path().to_path_buf(),
            source: Some(source),
            backend,
            batch_size: batch_size.max(1),
            state: MigrationState::Initialized,
        }
    }

    pub fn state(&self) -> MigrationState {
        self.state
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn initialize(&mut self) -> StoreResult<()> {
        if self.source.is_some() {
            self.state = MigrationState::Initialized;
            return Ok(());
        }
        match SqliteSource::open(&self.source_path) {
            Ok(source) => {
                self.source = Some(source);
                self.state = MigrationState::Initialized;
                Ok(())
            }
            Err(err) => {
                self.state = MigrationState::Failed;
                Err(err)
            }
        }
    }

    #[instrument(skip(self), fields(batch_size = self.batch_size))]
    pub fn migrate(&mut self, dry_run: bool) -> Result<MigrationStats, MigrationError> {
        if !matches!(
            self.state,
            MigrationState::Initialized | MigrationState::Completed
        ) {
            return Err(MigrationError::NotInitialized);
        }
        self.state = MigrationState::Running;
        let result = match self.source.as_ref() {
            Some(source) => run_batches(source, &self.backend, self.batch_size, dry_run),
            None => Err(MigrationError::NotInitialized),
        };
        match result {
            Ok(stats) => {
                self.state = MigrationState::Completed;
                Ok(stats)
            }
            Err(err) => {
                self.state = MigrationState::Failed;
                Err(err)
            }
        }
    }

    /// Post-run consistency check. Never fails; problems surface as a
    /// non-matching report.
    pub fn verify(&self) -> VerificationReport {
        match self.source.as_ref() {
            Some(source) => verify::verify_migration(source, &self.backend),
            None => {
                warn!("verification requested without an open source");
                VerificationReport {
                    source_count: 0,
                    target_count: 0,
                    counts_match: false,
                    sample_verification: false,
                }
            }
        }
    }

    /// Close the source and shut the backend down. Logged, never panics;
    /// safe to call repeatedly.
    pub fn shutdown(&mut self) {
        if let Some(source) = self.source.take() {
            if let Err(err) = source.close() {
                warn!(%err, "source close failed");
            }
        }
        if let Err(err) = self.backend.shutdown() {
            warn!(%err, "backend shutdown failed");
        }
    }
}

fn run_batches<B: MemoryBackend>(
    source: &SqliteSource,
    backend: &B,
    batch_size: u64,
    dry_run: bool,
) -> Result<MigrationStats, MigrationError> {
    let started = Instant::now();

    let total = source
        .count()
        .map_err(|err| aborted(MigrationStats::default(), started, err))?;
    let mut stats = MigrationStats {
        total_entries: total,
        ..MigrationStats::default()
    };
    if stats.total_entries == 0 {
        info!("source is empty, nothing to migrate");
        stats.duration_ms = started.elapsed().as_millis() as u64;
        return Ok(stats);
    }

    if !dry_run {
        backend
            .initialize()
            .map_err(|err| aborted(stats.clone(), started, err))?;
    }

    info!(total = stats.total_entries, dry_run, "starting migration");

    let mut offset = 0u64;
    loop {
        let page = source
            .page(batch_size, offset)
            .map_err(|err| aborted(stats.clone(), started, err))?;
        if page.is_empty() {
            break;
        }
        let fetched = page.len() as u64;

        if dry_run {
            for raw in &page {
                match codec::validate(raw) {
                    Ok(()) => stats.migrated_entries += 1,
                    Err(err) => {
                        warn!(%err, offset, "skipping invalid row");
                        stats.skipped_entries += 1;
                    }
                }
            }
        } else {
            let mut batch = Vec::with_capacity(page.len());
            for raw in &page {
                match codec::convert(raw) {
                    Ok(entry) => batch.push(entry),
                    Err(err) => {
                        warn!(%err, offset, "skipping invalid row");
                        stats.skipped_entries += 1;
                    }
                }
            }
            // One upsert statement per batch. A failed write moves the whole
            // write set into `errors`; committed batches stay committed.
            match backend.store_batch(&batch) {
                Ok(()) => stats.migrated_entries += batch.len() as u64,
                Err(err) => {
                    warn!(%err, rows = batch.len(), offset, "batch write failed");
                    stats.errors += batch.len() as u64;
                }
            }
        }

        debug!(offset, fetched, "batch processed");
        if fetched < batch_size {
            break;
        }
        offset += batch_size;
    }

    stats.duration_ms = started.elapsed().as_millis() as u64;
    info!(
        migrated = stats.migrated_entries,
        skipped = stats.skipped_entries,
        errors = stats.errors,
        duration_ms = stats.duration_ms,
        "migration finished"
    );
    Ok(stats)
}

fn aborted(mut stats: MigrationStats, started: Instant, source: StoreError) -> MigrationError {
    stats.duration_ms = started.elapsed().as_millis() as u64;
    MigrationError::Aborted { stats, source }
}

#[derive(Debug, Clone)]
pub struct MigrationOptions {
    pub dry_run: bool,
    pub batch_size: u64,
    pub verify: bool,
}

impl Default for MigrationOptions {
    fn default() -> Self {
        Self {
            dry_run: false,
            batch_size: DEFAULT_BATCH_SIZE,
            verify: false,
        }
    }
}

/// Composes the full lifecycle: initialize both sides, migrate, optionally
/// verify, and always shut down before handing the result back.
pub struct MigrationRunner<B: MemoryBackend> {
    engine: MigrationEngine<B>,
    options: MigrationOptions,
}

impl<B: MemoryBackend> MigrationRunner<B> {
    pub fn new<P: Into<PathBuf>>(source_path: P, backend: B, options: MigrationOptions) -> Self {
        let engine = MigrationEngine::new(source_path, backend, options.batch_size);
        Self { engine, options }
    }

    pub fn with_engine(engine: MigrationEngine<B>, options: MigrationOptions) -> Self {
        Self { engine, options }
    }

    pub fn run(mut self) -> Result<MigrationStats, MigrationRunError> {
        let result = self.execute();
        self.engine.shutdown();
        result
    }

    fn execute(&mut self) -> Result<MigrationStats, MigrationRunError> {
        if !self.options.dry_run {
            self.engine.backend().initialize()?;
        }
        self.engine.initialize()?;

        let stats = self.engine.migrate(self.options.dry_run)?;

        if self.options.verify && !self.options.dry_run {
            let report = self.engine.verify();
            if !report.counts_match || !report.sample_verification {
                return Err(VerificationFailedError { report }.into());
            }
            info!(
                source = report.source_count,
                target = report.target_count,
                "verification passed"
            );
        }

        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::seed_row;
    use crate::{InMemoryBackend, StoreError};
    use memshift_types::HealthStatus;
    use std::sync::Arc;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Records batch sizes and optionally fails every write.
    #[derive(Default)]
    struct ProbeBackend {
        inner: InMemoryBackend,
        batches: Mutex<Vec<usize>>,
        fail_writes: bool,
        shutdowns: AtomicUsize,
    }

    impl ProbeBackend {
        fn failing() -> Self {
            Self {
                fail_writes: true,
                ..Self::default()
            }
        }
    }

    impl MemoryBackend for ProbeBackend {
        fn initialize(&self) -> StoreResult<()> {
            self.inner.initialize()
        }
        fn shutdown(&self) -> StoreResult<()> {
            self.shutdowns.fetch_add(1, Ordering::SeqCst);
            self.inner.shutdown()
        }
        fn store(&self, entry: &memshift_types::MemoryEntry) -> StoreResult<()> {
            self.inner.store(entry)
        }
        fn store_batch(&self, entries: &[memshift_types::MemoryEntry]) -> StoreResult<()> {
            self.batches.lock().unwrap().push(entries.len());
            if self.fail_writes {
                return Err(StoreError::Storage("injected write failure".to_string()));
            }
            self.inner.store_batch(entries)
        }
        fn retrieve(&self, id: &str) -> StoreResult<Option<memshift_types::MemoryEntry>> {
            self.inner.retrieve(id)
        }
        fn update(&self, id: &str, entry: &memshift_types::MemoryEntry) -> StoreResult<()> {
            self.inner.update(id, entry)
        }
        fn delete(&self, id: &str) -> StoreResult<()> {
            self.inner.delete(id)
        }
        fn query(
            &self,
            filter: &memshift_types::MemoryFilter,
        ) -> StoreResult<Vec<memshift_types::MemoryEntry>> {
            self.inner.query(filter)
        }
        fn get_all_entries(&self) -> StoreResult<Vec<memshift_types::MemoryEntry>> {
            self.inner.get_all_entries()
        }
        fn count_entries(&self) -> StoreResult<u64> {
            self.inner.count_entries()
        }
        fn health_status(&self) -> HealthStatus {
            self.inner.health_status()
        }
        fn perform_maintenance(&self) -> StoreResult<()> {
            self.inner.perform_maintenance()
        }
    }

    fn seeded_source(count: usize) -> SqliteSource {
        let source = SqliteSource::new_in_memory().unwrap();
        for idx in 0..count {
            seed_row(
                &source,
                &format!("m{:05}", idx),
                1_000 + idx as i64,
                Some("payload"),
            )
            .unwrap();
        }
        source
    }

    #[test]
    fn migrate_before_initialize_is_rejected() {
        let mut engine =
            MigrationEngine::new("/nonexistent/source.db", InMemoryBackend::new(), 10);
        assert_eq!(engine.state(), MigrationState::Uninitialized);
        assert!(matches!(
            engine.migrate(false),
            Err(MigrationError::NotInitialized)
        ));
    }

    #[test]
    fn empty_source_returns_zero_stats() {
        let mut engine =
            MigrationEngine::with_source(seeded_source(0), InMemoryBackend::new(), 10);
        let stats = engine.migrate(false).unwrap();
        assert_eq!(stats.total_entries, 0);
        assert_eq!(stats.migrated_entries, 0);
        assert_eq!(stats.skipped_entries, 0);
        assert_eq!(stats.errors, 0);
        assert_eq!(engine.state(), MigrationState::Completed);
    }

    #[test]
    fn migrates_2500_rows_in_3_batches() {
        let backend = Arc::new(ProbeBackend::default());
        let mut engine = MigrationEngine::with_source(seeded_source(2500), backend.clone(), 1000);

        let stats = engine.migrate(false).unwrap();

        assert_eq!(stats.total_entries, 2500);
        assert_eq!(stats.migrated_entries, 2500);
        assert_eq!(stats.skipped_entries, 0);
        assert_eq!(stats.errors, 0);
        assert_eq!(
            stats.migrated_entries + stats.skipped_entries + stats.errors,
            stats.total_entries
        );
        assert_eq!(*backend.batches.lock().unwrap(), vec![1000, 1000, 500]);
        assert_eq!(backend.inner.count_entries().unwrap(), 2500);
        assert_eq!(engine.state(), MigrationState::Completed);
    }

    #[test]
    fn dry_run_never_mutates_the_target() {
        let source = seeded_source(3);
        seed_row(&source, "bad-row", 9_000, None).unwrap();

        let backend = Arc::new(InMemoryBackend::new());
        let mut engine = MigrationEngine::with_source(source, backend.clone(), 2);

        let before = backend.get_all_entries().unwrap();
        let stats = engine.migrate(true).unwrap();
        let after = backend.get_all_entries().unwrap();

        assert_eq!(before, after);
        assert!(after.is_empty());
        assert_eq!(stats.total_entries, 4);
        assert_eq!(stats.migrated_entries, 3);
        assert_eq!(stats.skipped_entries, 1);
        assert_eq!(stats.errors, 0);
    }

    #[test]
    fn missing_content_is_skipped_in_live_mode() {
        let source = seeded_source(2);
        seed_row(&source, "bad-row", 9_000, None).unwrap();

        let backend = Arc::new(InMemoryBackend::new());
        let mut engine = MigrationEngine::with_source(source, backend.clone(), 10);

        let stats = engine.migrate(false).unwrap();
        assert_eq!(stats.migrated_entries, 2);
        assert_eq!(stats.skipped_entries, 1);
        assert_eq!(stats.errors, 0);
        assert!(backend.retrieve("bad-row").unwrap().is_none());
    }

    #[test]
    fn failed_batch_write_counts_as_errors() {
        let backend = Arc::new(ProbeBackend::failing());
        let mut engine = MigrationEngine::with_source(seeded_source(5), backend.clone(), 2);

        let stats = engine.migrate(false).unwrap();
        assert_eq!(stats.total_entries, 5);
        assert_eq!(stats.migrated_entries, 0);
        assert_eq!(stats.skipped_entries, 0);
        assert_eq!(stats.errors, 5);
        assert_eq!(*backend.batches.lock().unwrap(), vec![2, 2, 1]);
    }

    #[test]
    fn repeated_migration_is_idempotent() {
        let backend = Arc::new(InMemoryBackend::new());
        let mut engine = MigrationEngine::with_source(seeded_source(10), backend.clone(), 4);

        let first = engine.migrate(false).unwrap();
        let second = engine.migrate(false).unwrap();

        assert_eq!(first.migrated_entries, 10);
        assert_eq!(second.migrated_entries, 10);
        assert_eq!(backend.count_entries().unwrap(), 10);
    }

    #[test]
    fn runner_runs_migrate_verify_and_shutdown() {
        let backend = Arc::new(ProbeBackend::default());
        let engine = MigrationEngine::with_source(seeded_source(6), backend.clone(), 4);
        let runner = MigrationRunner::with_engine(
            engine,
            MigrationOptions {
                verify: true,
                batch_size: 4,
                ..MigrationOptions::default()
            },
        );

        let stats = runner.run().unwrap();
        assert_eq!(stats.migrated_entries, 6);
        assert_eq!(backend.shutdowns.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn runner_surfaces_verification_failure_after_shutdown() {
        let backend = Arc::new(InMemoryBackend::new());
        // A stray target row the source has never seen.
        backend.initialize().unwrap();
        let source = seeded_source(2);
        let stray = {
            let page = source.page(1, 0).unwrap();
            let mut entry = codec::convert(&page[0]).unwrap();
            entry.id = "stray".to_string();
            entry
        };
        backend.store(&stray).unwrap();

        let engine = MigrationEngine::with_source(source, backend.clone(), 10);
        let runner = MigrationRunner::with_engine(
            engine,
            MigrationOptions {
                verify: true,
                batch_size: 10,
                ..MigrationOptions::default()
            },
        );

        match runner.run() {
            Err(MigrationRunError::Verification(err)) => {
                assert_eq!(err.report.source_count, 2);
                assert_eq!(err.report.target_count, 3);
                assert!(!err.report.counts_match);
                assert!(err.report.sample_verification);
            }
            other => panic!("expected verification failure, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn runner_initialization_failure_is_surfaced() {
        let runner = MigrationRunner::new(
            "/nonexistent/source.db",
            InMemoryBackend::new(),
            MigrationOptions::default(),
        );
        assert!(matches!(
            runner.run(),
            Err(MigrationRunError::Initialization(_))
        ));
    }
}
