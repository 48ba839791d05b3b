use chrono::{DateTime, TimeZone, Utc};
use memshift_types::{
    BackendConfig, HealthMetrics, HealthStatus, JsonMap, MemoryEntry, MemoryFilter, PoolStatus,
};
use postgres::types::ToSql;
use postgres::{Client, NoTls};
use r2d2::Pool;
use r2d2_postgres::PostgresConnectionManager;
use serde::Serialize;
use serde_json::Value;
use std::sync::RwLock;
use std::time::Duration;
use tracing::{debug, info};

use crate::{MemoryBackend, StoreError, StoreResult};

const SCHEMA_VERSION: i64 = 1;

const ENTRY_COLUMNS: &str =
    "id, agent_id, session_id, type, content, context, timestamp, tags, version, parent_id, metadata";

/// PostgreSQL target. Construction does no I/O; `initialize` builds the
/// bounded pool, probes liveness, and applies the idempotent schema.
pub struct PostgresBackend {
    config: BackendConfig,
    pool: RwLock<Option<Pool<PostgresConnectionManager<NoTls>>>>,
}

impl std::fmt::Debug for PostgresBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresBackend").finish()
    }
}

impl PostgresBackend {
    pub fn new(config: BackendConfig) -> Self {
        Self {
            config,
            pool: RwLock::new(None),
        }
    }

    fn with_conn<F, T>(&self, f: F) -> StoreResult<T>
    where
        F: FnOnce(&mut Client) -> StoreResult<T>,
    {
        let pool = {
            let guard = self.pool.read().map_err(|_| StoreError::Poisoned)?;
            guard.clone().ok_or(StoreError::NotInitialized)?
        };
        let mut conn = pool
            .get()
            .map_err(|err| StoreError::Storage(err.to_string()))?;
        f(&mut conn)
    }

    fn pool_status(&self) -> Option<PoolStatus> {
        let guard = self.pool.read().ok()?;
        let pool = guard.as_ref()?;
        let state = pool.state();
        Some(PoolStatus {
            connections: state.connections,
            idle_connections: state.idle_connections,
            max_size: pool.max_size(),
        })
    }
}

impl MemoryBackend for PostgresBackend {
    fn initialize(&self) -> StoreResult<()> {
        let mut guard = self.pool.write().map_err(|_| StoreError::Poisoned)?;
        if guard.is_some() {
            return Ok(());
        }

        let (dsn, db_name) = normalize_dsn(&self.config.dsn);
        ensure_database(&dsn, &db_name)
            .map_err(|err| StoreError::Initialization(err.to_string()))?;

        let manager = PostgresConnectionManager::new(
            dsn.parse()
                .map_err(|err: postgres::Error| StoreError::Initialization(err.to_string()))?,
            NoTls,
        );
        let pool = Pool::builder()
            .max_size(self.config.pool.max_size)
            .idle_timeout(Some(Duration::from_secs(self.config.pool.idle_timeout_secs)))
            .connection_timeout(Duration::from_secs(self.config.pool.connect_timeout_secs))
            .build(manager)
            .map_err(|err| StoreError::Initialization(err.to_string()))?;

        {
            let mut conn = pool
                .get()
                .map_err(|err| StoreError::Initialization(err.to_string()))?;
            conn.query_one("SELECT 1", &[])
                .map_err(|err| StoreError::Initialization(format!("liveness probe: {}", err)))?;
            ensure_schema(&mut conn)
                .map_err(|err| StoreError::Initialization(err.to_string()))?;
        }

        info!(db = %db_name, max_size = self.config.pool.max_size, "postgres backend ready");
        *guard = Some(pool);
        Ok(())
    }

    fn shutdown(&self) -> StoreResult<()> {
        let mut guard = self.pool.write().map_err(|_| StoreError::Poisoned)?;
        if guard.take().is_some() {
            debug!("postgres pool closed");
        }
        Ok(())
    }

    fn store(&self, entry: &MemoryEntry) -> StoreResult<()> {
        self.store_batch(std::slice::from_ref(entry))
    }

    fn store_batch(&self, entries: &[MemoryEntry]) -> StoreResult<()> {
        if entries.is_empty() {
            return Ok(());
        }
        self.with_conn(|conn| {
            let now = to_millis(Utc::now());
            let mut params = PgParams::new();
            let mut sql = String::from(
                "INSERT INTO memory_entries (
                    id, agent_id, session_id, type, content, context, timestamp,
                    tags, version, parent_id, metadata, created_at, updated_at
                 ) VALUES ",
            );
            for (idx, entry) in entries.iter().enumerate() {
                if idx > 0 {
                    sql.push_str(", ");
                }
                let values = [
                    params.add(entry.id.clone()),
                    params.add(entry.agent_id.clone()),
                    params.add(entry.session_id.clone()),
                    params.add(entry.kind.clone()),
                    params.add(entry.content.clone()),
                    params.add(encode_json(&entry.context)?),
                    params.add(to_millis(entry.timestamp)),
                    params.add(encode_json(&entry.tags)?),
                    params.add(entry.version),
                    params.add(entry.parent_id.clone()),
                    params.add(entry.metadata.as_ref().map(encode_json).transpose()?),
                    params.add(now),
                    params.add(now),
                ];
                sql.push('(');
                sql.push_str(&values.join(", "));
                sql.push(')');
            }
            sql.push_str(
                " ON CONFLICT (id)
                  DO UPDATE SET agent_id = excluded.agent_id,
                                session_id = excluded.session_id,
                                type = excluded.type,
                                content = excluded.content,
                                context = excluded.context,
                                timestamp = excluded.timestamp,
                                tags = excluded.tags,
                                version = excluded.version,
                                parent_id = excluded.parent_id,
                                metadata = excluded.metadata,
                                updated_at = excluded.updated_at",
            );
            conn.execute(&sql, &params.refs())?;
            Ok(())
        })
    }

    fn retrieve(&self, id: &str) -> StoreResult<Option<MemoryEntry>> {
        self.with_conn(|conn| {
            let row = conn.query_opt(
                &format!("SELECT {} FROM memory_entries WHERE id = $1", ENTRY_COLUMNS),
                &[&id],
            )?;
            row.map(|row| entry_from_row(&row)).transpose()
        })
    }

    fn update(&self, id: &str, entry: &MemoryEntry) -> StoreResult<()> {
        let mut updated = entry.clone();
        updated.id = id.to_string();
        self.store(&updated)
    }

    fn delete(&self, id: &str) -> StoreResult<()> {
        self.with_conn(|conn| {
            conn.execute("DELETE FROM memory_entries WHERE id = $1", &[&id])?;
            Ok(())
        })
    }

    fn query(&self, filter: &MemoryFilter) -> StoreResult<Vec<MemoryEntry>> {
        self.with_conn(|conn| {
            let mut params = PgParams::new();
            let mut sql = format!("SELECT {} FROM memory_entries", ENTRY_COLUMNS);

            let mut conditions = Vec::new();
            if let Some(agent_id) = &filter.agent_id {
                conditions.push(format!("agent_id = {}", params.add(agent_id.clone())));
            }
            if let Some(session_id) = &filter.session_id {
                conditions.push(format!("session_id = {}", params.add(session_id.clone())));
            }
            if let Some(kind) = &filter.kind {
                conditions.push(format!("type = {}", params.add(kind.clone())));
            }
            if let Some(start) = filter.start_time {
                conditions.push(format!("timestamp >= {}", params.add(to_millis(start))));
            }
            if let Some(end) = filter.end_time {
                conditions.push(format!("timestamp <= {}", params.add(to_millis(end))));
            }
            if let Some(search) = &filter.search {
                let pattern = params.add(format!("%{}%", search));
                conditions.push(format!(
                    "(content ILIKE {pattern} OR tags::text ILIKE {pattern})"
                ));
            }
            if !filter.tags.is_empty() {
                conditions.push(format!("tags ?| {}", params.add(filter.tags.clone())));
            }
            if let Some(namespace) = &filter.namespace {
                conditions.push(format!(
                    "metadata->>'namespace' = {}",
                    params.add(namespace.clone())
                ));
            }
            if !conditions.is_empty() {
                sql.push_str(" WHERE ");
                sql.push_str(&conditions.join(" AND "));
            }

            sql.push_str(" ORDER BY timestamp DESC, id ASC");
            if let Some(limit) = filter.limit {
                sql.push_str(" LIMIT ");
                sql.push_str(&params.add(limit as i64));
            }
            if let Some(offset) = filter.offset {
                sql.push_str(" OFFSET ");
                sql.push_str(&params.add(offset as i64));
            }

            let rows = conn.query(&sql, &params.refs())?;
            rows.iter().map(entry_from_row).collect()
        })
    }

    fn get_all_entries(&self) -> StoreResult<Vec<MemoryEntry>> {
        self.query(&MemoryFilter::default())
    }

    fn count_entries(&self) -> StoreResult<u64> {
        self.with_conn(|conn| {
            let row = conn.query_one("SELECT COUNT(*) FROM memory_entries", &[])?;
            Ok(row.get::<_, i64>(0) as u64)
        })
    }

    fn health_status(&self) -> HealthStatus {
        let pool_status = match self.pool_status() {
            Some(status) => status,
            None => return HealthStatus::unhealthy("backend not initialized"),
        };
        let probe = self.with_conn(|conn| {
            let entry_count = conn
                .query_one("SELECT COUNT(*) FROM memory_entries", &[])?
                .get::<_, i64>(0);
            let storage_bytes = conn
                .query_one("SELECT pg_total_relation_size('memory_entries')", &[])?
                .get::<_, i64>(0);
            Ok((entry_count.max(0) as u64, storage_bytes.max(0) as u64))
        });
        match probe {
            Ok((entry_count, storage_bytes)) => HealthStatus {
                healthy: true,
                error: None,
                metrics: Some(HealthMetrics {
                    entry_count,
                    storage_bytes,
                    pool: pool_status,
                }),
            },
            Err(err) => HealthStatus::unhealthy(err.to_string()),
        }
    }

    fn perform_maintenance(&self) -> StoreResult<()> {
        self.with_conn(|conn| {
            // One statement per call: VACUUM refuses to run inside the
            // implicit transaction a multi-statement batch gets.
            for table in ["memory_entries", "swarm_metadata", "worktree_sessions"] {
                conn.batch_execute(&format!("VACUUM (ANALYZE) {}", table))
                    .map_err(|err| StoreError::Maintenance(err.to_string()))?;
            }
            Ok(())
        })
    }
}

fn ensure_schema(conn: &mut Client) -> StoreResult<()> {
    conn.batch_execute(
        "
        CREATE TABLE IF NOT EXISTS schema_migrations (
            version BIGINT NOT NULL,
            applied_at BIGINT NOT NULL
        );
        ",
    )?;

    let row = conn.query_opt(
        "SELECT version FROM schema_migrations ORDER BY version DESC LIMIT 1",
        &[],
    )?;
    let current = row.map(|row| row.get::<_, i64>(0)).unwrap_or(0);

    if current > SCHEMA_VERSION {
        return Err(StoreError::Storage(format!(
            "target schema version {} is newer than supported {}",
            current, SCHEMA_VERSION
        )));
    }
    if current < SCHEMA_VERSION && current != 0 {
        return Err(StoreError::Storage(format!(
            "target schema version {} requires migration to {}",
            current, SCHEMA_VERSION
        )));
    }

    conn.batch_execute(
        "
        CREATE TABLE IF NOT EXISTS memory_entries (
            id TEXT PRIMARY KEY,
            agent_id TEXT NOT NULL,
            session_id TEXT NOT NULL,
            type TEXT NOT NULL,
            content TEXT NOT NULL,
            context JSONB NOT NULL DEFAULT '{}'::jsonb,
            timestamp BIGINT NOT NULL,
            tags JSONB NOT NULL DEFAULT '[]'::jsonb,
            version BIGINT NOT NULL DEFAULT 1,
            parent_id TEXT REFERENCES memory_entries(id) ON DELETE SET NULL,
            metadata JSONB,
            created_at BIGINT NOT NULL,
            updated_at BIGINT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS memory_entries_agent
            ON memory_entries (agent_id);
        CREATE INDEX IF NOT EXISTS memory_entries_session
            ON memory_entries (session_id);
        CREATE INDEX IF NOT EXISTS memory_entries_type
            ON memory_entries (type);
        CREATE INDEX IF NOT EXISTS memory_entries_parent
            ON memory_entries (parent_id);
        CREATE INDEX IF NOT EXISTS memory_entries_ts
            ON memory_entries (timestamp);
        CREATE INDEX IF NOT EXISTS memory_entries_tags
            ON memory_entries USING GIN (tags);
        CREATE INDEX IF NOT EXISTS memory_entries_context
            ON memory_entries USING GIN (context);
        CREATE INDEX IF NOT EXISTS memory_entries_metadata
            ON memory_entries USING GIN (metadata);
        CREATE INDEX IF NOT EXISTS memory_entries_content_search
            ON memory_entries USING GIN (to_tsvector('english', content));

        CREATE TABLE IF NOT EXISTS swarm_metadata (
            id TEXT PRIMARY KEY,
            swarm_id TEXT NOT NULL,
            agent_id TEXT,
            type TEXT NOT NULL,
            data JSONB NOT NULL DEFAULT '{}'::jsonb,
            created_at BIGINT NOT NULL,
            updated_at BIGINT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS swarm_metadata_swarm
            ON swarm_metadata (swarm_id);

        CREATE TABLE IF NOT EXISTS worktree_sessions (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            workspace_path TEXT NOT NULL,
            agent_assignments JSONB NOT NULL DEFAULT '{}'::jsonb,
            status TEXT NOT NULL,
            created_at BIGINT NOT NULL,
            updated_at BIGINT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS worktree_sessions_status
            ON worktree_sessions (status);
        ",
    )?;

    if current == 0 {
        conn.execute(
            "INSERT INTO schema_migrations (version, applied_at) VALUES ($1,$2)",
            &[&SCHEMA_VERSION, &to_millis(Utc::now())],
        )?;
    }

    Ok(())
}

fn entry_from_row(row: &postgres::Row) -> StoreResult<MemoryEntry> {
    let context: Value = row.get(5);
    let tags: Value = row.get(7);
    let metadata: Option<Value> = row.get(10);
    Ok(MemoryEntry {
        id: row.get(0),
        agent_id: row.get(1),
        session_id: row.get(2),
        kind: row.get(3),
        content: row.get(4),
        context: decode_json(context)?,
        timestamp: from_millis(row.get(6)),
        tags: decode_json(tags)?,
        version: row.get(8),
        parent_id: row.get(9),
        metadata: metadata.map(decode_json::<JsonMap>).transpose()?,
    })
}

struct PgParams {
    values: Vec<Box<dyn ToSql + Sync>>,
}

impl PgParams {
    fn new() -> Self {
        Self { values: Vec::new() }
    }

    fn add<T: ToSql + Sync + 'static>(&mut self, value: T) -> String {
        self.values.push(Box::new(value));
        format!("${}", self.values.len())
    }

    fn refs(&self) -> Vec<&(dyn ToSql + Sync)> {
        self.values
            .iter()
            .map(|value| &**value as &(dyn ToSql + Sync))
            .collect()
    }
}

fn encode_json<T: Serialize>(value: &T) -> StoreResult<Value> {
    serde_json::to_value(value).map_err(|err| StoreError::InvalidInput(err.to_string()))
}

fn decode_json<T: serde::de::DeserializeOwned>(value: Value) -> StoreResult<T> {
    serde_json::from_value(value).map_err(|err| StoreError::InvalidInput(err.to_string()))
}

fn to_millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

fn from_millis(millis: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .unwrap_or_else(|| Utc.timestamp_millis_opt(0).single().unwrap())
}

fn normalize_dsn(dsn: &str) -> (String, String) {
    let (base_no_db, db_name, query) = split_dsn(dsn);
    let db_name = db_name.unwrap_or_else(|| "memshift".to_string());
    let mut normalized = base_no_db;
    normalized.push_str(&db_name);
    if let Some(query) = query {
        normalized.push('?');
        normalized.push_str(&query);
    }
    (normalized, db_name)
}

fn split_dsn(dsn: &str) -> (String, Option<String>, Option<String>) {
    let (base, query) = match dsn.split_once('?') {
        Some((base, query)) => (base, Some(query.to_string())),
        None => (dsn, None),
    };
    let scheme_end = base.find("://").map(|idx| idx + 3).unwrap_or(0);
    match base[scheme_end..].find('/').map(|idx| scheme_end + idx) {
        Some(idx) => {
            let db_name = if idx + 1 < base.len() {
                Some(base[idx + 1..].to_string())
            } else {
                None
            };
            (base[..=idx].to_string(), db_name, query)
        }
        None => (format!("{}/", base), None, query),
    }
}

/// Create the target database when it does not exist yet; a migration target
/// is often a fresh server.
fn ensure_database(dsn: &str, db_name: &str) -> StoreResult<()> {
    let (base_no_db, _, query) = split_dsn(dsn);
    let mut admin_dsn = base_no_db;
    admin_dsn.push_str("postgres");
    if let Some(query) = query {
        admin_dsn.push('?');
        admin_dsn.push_str(&query);
    }
    let mut admin = Client::connect(&admin_dsn, NoTls)?;
    let exists = admin.query("SELECT 1 FROM pg_database WHERE datname = $1", &[&db_name])?;
    if exists.is_empty() {
        admin.execute(
            format!("CREATE DATABASE {}", quote_identifier(db_name)).as_str(),
            &[],
        )?;
    }
    Ok(())
}

fn quote_identifier(value: &str) -> String {
    let mut quoted = String::from("\"");
    for ch in value.chars() {
        if ch == '"' {
            quoted.push_str("\"\"");
        } else {
            quoted.push(ch);
        }
    }
    quoted.push('"');
    quoted
}
