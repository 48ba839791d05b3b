use rusqlite::types::ValueRef;
use rusqlite::{Connection, OpenFlags, Row, params};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::codec::RawEntry;
use crate::{StoreError, StoreResult};

const PAGE_COLUMNS: &str =
    "id, agent_id, session_id, type, content, context, timestamp, tags, version, parent_id, metadata";

/// Paginated reader over the row-store side of a migration. Opened read-only;
/// a migration never writes back to its source.
pub struct SqliteSource {
    path: PathBuf,
    connection: Mutex<Connection>,
}

impl std::fmt::Debug for SqliteSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteSource")
            .field("path", &self.path)
            .finish()
    }
}

impl SqliteSource {
    /// Open an existing source database. Fails with an initialization error
    /// when the file is missing or unreadable.
    pub fn open<P: Into<PathBuf>>(path: P) -> StoreResult<Self> {
        let path = path.into();
        let conn = Connection::open_with_flags(
            &path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(|err| {
            StoreError::Initialization(format!("cannot open source {}: {}", path.display(), err))
        })?;
        Ok(Self {
            path,
            connection: Mutex::new(conn),
        })
    }

    /// Writable in-memory source with an empty `memory_entries` table.
    pub fn new_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|err| StoreError::Initialization(err.to_string()))?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS memory_entries (
                id TEXT PRIMARY KEY,
                agent_id TEXT,
                session_id TEXT,
                type TEXT,
                content TEXT,
                context TEXT,
                timestamp INTEGER,
                tags TEXT,
                version INTEGER,
                parent_id TEXT,
                metadata TEXT
            );
            ",
        )
        .map_err(|err| StoreError::Initialization(err.to_string()))?;
        Ok(Self {
            path: PathBuf::from(":memory:"),
            connection: Mutex::new(conn),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn with_connection<F, T>(&self, f: F) -> StoreResult<T>
    where
        F: FnOnce(&Connection) -> StoreResult<T>,
    {
        let guard = self.connection.lock().map_err(|_| StoreError::Poisoned)?;
        f(&guard)
    }

    pub fn count(&self) -> StoreResult<u64> {
        self.with_connection(|conn| {
            let count: i64 =
                conn.query_row("SELECT COUNT(*) FROM memory_entries", [], |row| row.get(0))?;
            Ok(count as u64)
        })
    }

    /// One page of raw rows ordered by `(timestamp, id)` ascending. Columns
    /// are read leniently; shape problems surface in the codec, per row,
    /// instead of aborting the fetch.
    pub fn page(&self, limit: u64, offset: u64) -> StoreResult<Vec<RawEntry>> {
        self.with_connection(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM memory_entries ORDER BY timestamp ASC, id ASC LIMIT ? OFFSET ?",
                PAGE_COLUMNS
            ))?;
            let rows = stmt.query_map(params![limit as i64, offset as i64], raw_entry_from_row)?;

            let mut entries = Vec::new();
            for row in rows {
                entries.push(row?);
            }
            Ok(entries)
        })
    }

    pub fn close(self) -> StoreResult<()> {
        let conn = self
            .connection
            .into_inner()
            .map_err(|_| StoreError::Poisoned)?;
        conn.close()
            .map_err(|(_, err)| StoreError::Storage(err.to_string()))
    }
}

fn raw_entry_from_row(row: &Row<'_>) -> rusqlite::Result<RawEntry> {
    Ok(RawEntry {
        id: column_value(row, 0)?,
        agent_id: column_value(row, 1)?,
        session_id: column_value(row, 2)?,
        kind: column_value(row, 3)?,
        content: column_value(row, 4)?,
        context: column_value(row, 5)?,
        timestamp: column_value(row, 6)?,
        tags: column_value(row, 7)?,
        version: column_value(row, 8)?,
        parent_id: column_value(row, 9)?,
        metadata: column_value(row, 10)?,
    })
}

fn column_value(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<Value>> {
    let value = match row.get_ref(idx)? {
        ValueRef::Null => None,
        ValueRef::Integer(value) => Some(Value::from(value)),
        ValueRef::Real(value) => serde_json::Number::from_f64(value).map(Value::Number),
        ValueRef::Text(bytes) => Some(Value::String(
            String::from_utf8_lossy(bytes).into_owned(),
        )),
        // A blob in a text column has no JSON reading; the codec reports the
        // field missing and the row is skipped.
        ValueRef::Blob(_) => None,
    };
    Ok(value)
}

#[cfg(test)]
pub(crate) fn seed_row(
    source: &SqliteSource,
    id: &str,
    timestamp: i64,
    content: Option<&str>,
) -> StoreResult<()> {
    source.with_connection(|conn| {
        conn.execute(
            "INSERT INTO memory_entries (
                id, agent_id, session_id, type, content, context, timestamp, tags, version
            ) VALUES (?, 'a1', 's1', 'observation', ?, '{}', ?, '[]', 1)",
            params![id, content, timestamp],
        )?;
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec;

    #[test]
    fn count_and_page_in_timestamp_order() {
        let source = SqliteSource::new_in_memory().unwrap();
        seed_row(&source, "m3", 3_000, Some("third")).unwrap();
        seed_row(&source, "m1", 1_000, Some("first")).unwrap();
        seed_row(&source, "m2", 2_000, Some("second")).unwrap();

        assert_eq!(source.count().unwrap(), 3);

        let page = source.page(2, 0).unwrap();
        assert_eq!(page.len(), 2);
        let first = codec::convert(&page[0]).unwrap();
        let second = codec::convert(&page[1]).unwrap();
        assert_eq!(first.id, "m1");
        assert_eq!(second.id, "m2");

        let rest = source.page(2, 2).unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(codec::convert(&rest[0]).unwrap().id, "m3");

        assert!(source.page(2, 3).unwrap().is_empty());
    }

    #[test]
    fn null_columns_come_back_absent() {
        let source = SqliteSource::new_in_memory().unwrap();
        seed_row(&source, "m1", 1_000, None).unwrap();

        let page = source.page(10, 0).unwrap();
        assert_eq!(page.len(), 1);
        assert!(page[0].content.is_none());
        assert!(codec::convert(&page[0]).is_err());
    }

    #[test]
    fn open_missing_file_is_an_initialization_error() {
        let result = SqliteSource::open("/nonexistent/memshift-source.db");
        assert!(matches!(result, Err(StoreError::Initialization(_))));
    }

    #[test]
    fn close_releases_the_connection() {
        let source = SqliteSource::new_in_memory().unwrap();
        source.close().unwrap();
    }
}
