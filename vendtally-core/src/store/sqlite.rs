//! SQLite-backed blob store
//!
//! Keeps the state record in a single-row table. Schema migrations are
//! embedded and tracked via PRAGMA user_version.

use std::path::Path;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use crate::error::Result;

use super::BlobStore;

/// Current schema version
pub const SCHEMA_VERSION: i32 = 1;

/// SQL migrations, indexed by version number
const MIGRATIONS: &[&str] = &[
    // Version 1: single state record
    r#"
    CREATE TABLE IF NOT EXISTS module_state (
        id               INTEGER PRIMARY KEY CHECK (id = 1),
        blob             BLOB NOT NULL,
        updated_at       DATETIME NOT NULL
    );
    "#,
];

/// Blob store persisting the counter state record in SQLite
pub struct SqliteBlobStore {
    conn: Connection,
}

impl SqliteBlobStore {
    /// Open or create a state database at the given path
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;

        // The record is tiny; favor durability of each write
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = FULL;
            ",
        )?;

        let store = Self { conn };
        store.migrate()?;
        Ok(store)
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn };
        store.migrate()?;
        Ok(store)
    }

    /// Run all pending migrations
    pub fn migrate(&self) -> Result<()> {
        let current_version: i32 = self
            .conn
            .query_row("PRAGMA user_version", [], |r| r.get(0))
            .unwrap_or(0);

        for (i, migration) in MIGRATIONS.iter().enumerate() {
            let version = (i + 1) as i32;
            if version > current_version {
                tracing::info!(version, "Running state store migration");
                self.conn.execute_batch(migration)?;
                self.conn
                    .execute(&format!("PRAGMA user_version = {}", version), [])?;
            }
        }

        Ok(())
    }

    /// Get the current schema version
    pub fn schema_version(&self) -> Result<i32> {
        let version: i32 = self
            .conn
            .query_row("PRAGMA user_version", [], |r| r.get(0))?;
        Ok(version)
    }

    /// When the record was last written, if ever
    pub fn updated_at(&self) -> Result<Option<DateTime<Utc>>> {
        let raw: Option<String> = self
            .conn
            .query_row("SELECT updated_at FROM module_state WHERE id = 1", [], |r| {
                r.get(0)
            })
            .optional()?;

        Ok(raw
            .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
            .map(|dt| dt.with_timezone(&Utc)))
    }
}

impl BlobStore for SqliteBlobStore {
    fn read(&mut self) -> Result<Option<Vec<u8>>> {
        let blob = self
            .conn
            .query_row("SELECT blob FROM module_state WHERE id = 1", [], |r| {
                r.get::<_, Vec<u8>>(0)
            })
            .optional()?;
        Ok(blob)
    }

    fn write(&mut self, blob: &[u8]) -> Result<()> {
        self.conn.execute(
            r#"
            INSERT INTO module_state (id, blob, updated_at)
            VALUES (1, ?1, ?2)
            ON CONFLICT(id) DO UPDATE SET
                blob = excluded.blob,
                updated_at = excluded.updated_at
            "#,
            params![blob, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_migrations_idempotent() {
        let store = SqliteBlobStore::open_in_memory().unwrap();
        store.migrate().unwrap();
        assert_eq!(store.schema_version().unwrap(), SCHEMA_VERSION);
    }

    #[test]
    fn test_read_before_write() {
        let mut store = SqliteBlobStore::open_in_memory().unwrap();
        assert!(store.read().unwrap().is_none());
        assert!(store.updated_at().unwrap().is_none());
    }

    #[test]
    fn test_write_replaces_record() {
        let mut store = SqliteBlobStore::open_in_memory().unwrap();
        store.write(b"first").unwrap();
        store.write(b"second").unwrap();

        assert_eq!(store.read().unwrap().as_deref(), Some(&b"second"[..]));
        assert!(store.updated_at().unwrap().is_some());

        let rows: i64 = store
            .conn
            .query_row("SELECT COUNT(*) FROM module_state", [], |r| r.get(0))
            .unwrap();
        assert_eq!(rows, 1);
    }

    #[test]
    fn test_record_survives_reopen() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("nested/state.db");

        {
            let mut store = SqliteBlobStore::open(&path).unwrap();
            store.write(b"persisted").unwrap();
        }

        let mut store = SqliteBlobStore::open(&path).unwrap();
        assert_eq!(store.read().unwrap().as_deref(), Some(&b"persisted"[..]));
    }
}
