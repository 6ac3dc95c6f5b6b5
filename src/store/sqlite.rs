//! SQLite Persistent Storage for the Cleanup Ledger
//!
//! Durable record of scratch data accounts and fork sweep cursors that
//! survives restarts. Uses connection pooling via r2d2 for concurrent
//! access.

use async_trait::async_trait;
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, OptionalExtension};
use std::path::Path;

use super::traits::{
    CleanupStore, DataAccountRecord, DataAccountStatus, StorageError, StorageResult,
};

/// SQLite-backed cleanup store with connection pooling
pub struct SqliteCleanupStore {
    pool: Pool<SqliteConnectionManager>,
}

impl SqliteCleanupStore {
    /// Create a new store with the given database path
    ///
    /// Creates the database file and runs migrations if needed.
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self, StorageError> {
        // Ensure parent directory exists
        if let Some(parent) = db_path.as_ref().parent() {
            std::fs::create_dir_all(parent).ok();
        }

        let manager = SqliteConnectionManager::file(db_path);
        let pool = Pool::builder()
            .max_size(10)
            .build(manager)
            .map_err(|e| StorageError::Connection(e.to_string()))?;

        let store = Self { pool };
        store.run_migrations()?;

        Ok(store)
    }

    /// Create an in-memory store (for testing)
    pub fn in_memory() -> Result<Self, StorageError> {
        let manager = SqliteConnectionManager::memory();
        let pool = Pool::builder()
            .max_size(1)
            .build(manager)
            .map_err(|e| StorageError::Connection(e.to_string()))?;

        let store = Self { pool };
        store.run_migrations()?;

        Ok(store)
    }

    /// Get a connection from the pool
    fn conn(&self) -> Result<PooledConnection<SqliteConnectionManager>, StorageError> {
        self.pool
            .get()
            .map_err(|e| StorageError::Connection(e.to_string()))
    }

    /// Run database migrations
    fn run_migrations(&self) -> Result<(), StorageError> {
        let conn = self.conn()?;

        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS data_accounts (
                id TEXT PRIMARY KEY,
                address TEXT NOT NULL,
                payment_hash TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'open',
                created_at INTEGER NOT NULL,
                swept_at INTEGER
            );

            CREATE UNIQUE INDEX IF NOT EXISTS idx_data_accounts_open_address
                ON data_accounts(address) WHERE status = 'open';
            CREATE INDEX IF NOT EXISTS idx_data_accounts_status ON data_accounts(status);

            CREATE TABLE IF NOT EXISTS sweep_cursors (
                scope TEXT PRIMARY KEY,
                fork_id INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );
            "#,
        )
        .map_err(|e| StorageError::Database(e.to_string()))?;

        Ok(())
    }

    /// Convert a database row to DataAccountRecord
    fn row_to_record(row: &rusqlite::Row) -> rusqlite::Result<DataAccountRecord> {
        let status_str: String = row.get("status")?;
        let status = status_str.parse().unwrap_or(DataAccountStatus::Open);

        Ok(DataAccountRecord {
            id: row.get("id")?,
            address: row.get("address")?,
            payment_hash: row.get("payment_hash")?,
            status,
            created_at: row.get::<_, i64>("created_at")? as u64,
            swept_at: row.get::<_, Option<i64>>("swept_at")?.map(|v| v as u64),
        })
    }

    // Synchronous helper methods for the trait implementation

    fn insert_sync(&self, record: &DataAccountRecord) -> Result<(), StorageError> {
        let conn = self.conn()?;

        conn.execute(
            r#"
            INSERT INTO data_accounts (
                id, address, payment_hash, status, created_at, swept_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
            params![
                record.id,
                record.address,
                record.payment_hash,
                record.status.to_string(),
                record.created_at as i64,
                record.swept_at.map(|v| v as i64),
            ],
        )
        .map_err(|e| {
            if let rusqlite::Error::SqliteFailure(ref err, _) = e {
                if err.extended_code == 1555 || err.extended_code == 2067 {
                    return StorageError::Duplicate(record.address.clone());
                }
            }
            StorageError::Database(e.to_string())
        })?;

        Ok(())
    }

    fn open_sync(&self) -> Result<Vec<DataAccountRecord>, StorageError> {
        let conn = self.conn()?;

        let mut stmt = conn
            .prepare(
                "SELECT * FROM data_accounts WHERE status = 'open' ORDER BY created_at ASC",
            )
            .map_err(|e| StorageError::Database(e.to_string()))?;

        let rows = stmt
            .query_map([], Self::row_to_record)
            .map_err(|e| StorageError::Database(e.to_string()))?;

        let mut records = Vec::new();
        for row in rows {
            records.push(row.map_err(|e| StorageError::Database(e.to_string()))?);
        }
        Ok(records)
    }

    fn mark_swept_sync(&self, addresses: &[String]) -> Result<u64, StorageError> {
        let conn = self.conn()?;
        let now = chrono::Utc::now().timestamp();

        let mut updated = 0u64;
        for address in addresses {
            let changed = conn
                .execute(
                    r#"
                    UPDATE data_accounts
                    SET status = 'swept', swept_at = ?2
                    WHERE address = ?1 AND status = 'open'
                    "#,
                    params![address, now],
                )
                .map_err(|e| StorageError::Database(e.to_string()))?;
            updated += changed as u64;
        }
        Ok(updated)
    }

    fn sweep_cursor_sync(&self, scope: &str) -> Result<Option<u64>, StorageError> {
        let conn = self.conn()?;

        let cursor: Option<i64> = conn
            .query_row(
                "SELECT fork_id FROM sweep_cursors WHERE scope = ?1",
                params![scope],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| StorageError::Database(e.to_string()))?;

        Ok(cursor.map(|v| v as u64))
    }

    fn set_sweep_cursor_sync(&self, scope: &str, fork_id: u64) -> Result<(), StorageError> {
        let conn = self.conn()?;

        conn.execute(
            r#"
            INSERT INTO sweep_cursors (scope, fork_id, updated_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(scope) DO UPDATE SET fork_id = ?2, updated_at = ?3
            "#,
            params![scope, fork_id as i64, chrono::Utc::now().timestamp()],
        )
        .map_err(|e| StorageError::Database(e.to_string()))?;

        Ok(())
    }
}

#[async_trait]
impl CleanupStore for SqliteCleanupStore {
    async fn insert_data_account(&self, record: &DataAccountRecord) -> StorageResult<()> {
        self.insert_sync(record)
    }

    async fn open_data_accounts(&self) -> StorageResult<Vec<DataAccountRecord>> {
        self.open_sync()
    }

    async fn mark_swept(&self, addresses: &[String]) -> StorageResult<u64> {
        self.mark_swept_sync(addresses)
    }

    async fn sweep_cursor(&self, scope: &str) -> StorageResult<Option<u64>> {
        self.sweep_cursor_sync(scope)
    }

    async fn set_sweep_cursor(&self, scope: &str, fork_id: u64) -> StorageResult<()> {
        self.set_sweep_cursor_sync(scope, fork_id)
    }
}
