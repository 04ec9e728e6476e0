use std::path::Path;

use log::info;
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{Connection, OptionalExtension};

use crate::error::RelayError;
use crate::schema::{CREATE_SCHEMA_SQL, SCHEMA_VERSION};

const DB_FILENAME: &str = "pkrelay.db";

/// Handle to the relay store. Cheap to clone; all clones share one pool.
#[derive(Clone)]
pub struct Database {
    pool: Pool<SqliteConnectionManager>,
}

impl Database {
    /// Open (creating if necessary) the store in the given folder and ensure
    /// the schema is current.
    pub fn new(db_folder: &Path) -> Result<Self, RelayError> {
        std::fs::create_dir_all(db_folder)?;
        let db_path = db_folder.join(DB_FILENAME);

        let manager = SqliteConnectionManager::file(&db_path).with_init(|conn| {
            conn.execute_batch("PRAGMA foreign_keys = ON; PRAGMA busy_timeout = 5000;")
        });
        let pool = Pool::builder().build(manager)?;

        let db = Database { pool };
        db.ensure_schema()?;
        info!("Database opened at: {}", db_path.display());
        Ok(db)
    }

    /// In-memory store. The pool is capped at a single connection because
    /// every new in-memory connection would otherwise be a separate database.
    pub fn new_in_memory() -> Result<Self, RelayError> {
        let manager = SqliteConnectionManager::memory()
            .with_init(|conn| conn.execute_batch("PRAGMA foreign_keys = ON;"));
        let pool = Pool::builder().max_size(1).build(manager)?;

        let db = Database { pool };
        db.ensure_schema()?;
        Ok(db)
    }

    pub fn conn(&self) -> Result<PooledConnection<SqliteConnectionManager>, RelayError> {
        Ok(self.pool.get()?)
    }

    fn ensure_schema(&self) -> Result<(), RelayError> {
        let conn = self.conn()?;

        let table_exists: bool = conn
            .query_row(
                "SELECT count(*) FROM sqlite_master WHERE type='table' AND name='meta'",
                [],
                |row| row.get::<_, i32>(0),
            )
            .map(|count| count > 0)
            .unwrap_or(false);

        if !table_exists {
            conn.execute_batch(CREATE_SCHEMA_SQL)?;
            return Ok(());
        }

        let stored_version: Option<String> = conn
            .query_row(
                "SELECT value FROM meta WHERE key = 'schema_version'",
                [],
                |row| row.get(0),
            )
            .optional()?;

        match stored_version.as_deref() {
            Some(SCHEMA_VERSION) => Ok(()), // Schema is up to date
            Some(other) => Err(RelayError::Error(format!(
                "Schema version mismatch: expected {SCHEMA_VERSION}, found {other}"
            ))),
            None => Err(RelayError::Error("Schema version missing".to_string())),
        }
    }

    /// Run `f` inside a BEGIN IMMEDIATE transaction, committing on Ok and
    /// rolling back on Err. For the read-then-write patterns used by the
    /// HTTP handlers; the migration engine manages its own long transaction.
    pub fn immediate_transaction<F, T>(conn: &Connection, f: F) -> Result<T, RelayError>
    where
        F: FnOnce(&Connection) -> Result<T, RelayError>,
    {
        conn.execute_batch("BEGIN IMMEDIATE")?;
        match f(conn) {
            Ok(value) => {
                conn.execute_batch("COMMIT")?;
                Ok(value)
            }
            Err(e) => {
                let _ = conn.execute_batch("ROLLBACK");
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_created_on_open() {
        let db = Database::new_in_memory().unwrap();
        let conn = db.conn().unwrap();

        let version: String = conn
            .query_row(
                "SELECT value FROM meta WHERE key = 'schema_version'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(version, SCHEMA_VERSION);

        for table in ["saves", "bundles", "bundle_saves"] {
            let count: i32 = conn
                .query_row(
                    "SELECT count(*) FROM sqlite_master WHERE type='table' AND name=?",
                    [table],
                    |row| row.get(0),
                )
                .unwrap();
            assert_eq!(count, 1, "table {table} should exist");
        }
    }

    #[test]
    fn test_immediate_transaction_rolls_back_on_error() {
        let db = Database::new_in_memory().unwrap();
        let conn = db.conn().unwrap();

        let result: Result<(), RelayError> = Database::immediate_transaction(&conn, |c| {
            c.execute(
                "INSERT INTO saves (upload_time, download_code, download_count, generation, legal, payload)
                 VALUES ('now', '1234567890', 0, '8', 1, 'AAAA')",
                [],
            )?;
            Err(RelayError::Error("induced".to_string()))
        });
        assert!(result.is_err());

        let count: i64 = conn
            .query_row("SELECT count(*) FROM saves", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }
}
