//! Storage Trait Definitions
//!
//! Defines the cleanup-ledger interface: which scratch data accounts this
//! submitter has opened and how far fork sweeping has progressed. The chain
//! is always authoritative; these records only let cleanup resume after a
//! restart, and stale entries are reconciled against live accounts.

use async_trait::async_trait;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

/// Storage errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Duplicate record: {0}")]
    Duplicate(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Invalid data: {0}")]
    InvalidData(String),

    #[error("Connection error: {0}")]
    Connection(String),
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Lifecycle of a scratch data account record
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataAccountStatus {
    /// Created on chain, rent not yet reclaimed
    Open,
    /// Closed (or observed missing) and settled locally
    Swept,
}

impl fmt::Display for DataAccountStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataAccountStatus::Open => write!(f, "open"),
            DataAccountStatus::Swept => write!(f, "swept"),
        }
    }
}

impl FromStr for DataAccountStatus {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(DataAccountStatus::Open),
            "swept" => Ok(DataAccountStatus::Swept),
            other => Err(StorageError::InvalidData(format!(
                "unknown data account status: {}",
                other
            ))),
        }
    }
}

/// One scratch data account opened for a tx-proof claim
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataAccountRecord {
    pub id: String,
    /// Base58 account address
    pub address: String,
    /// Hex payment hash of the swap the account was opened for
    pub payment_hash: String,
    pub status: DataAccountStatus,
    pub created_at: u64,
    pub swept_at: Option<u64>,
}

impl DataAccountRecord {
    pub fn new(address: String, payment_hash: String) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            address,
            payment_hash,
            status: DataAccountStatus::Open,
            created_at: chrono::Utc::now().timestamp().max(0) as u64,
            swept_at: None,
        }
    }
}

/// Cleanup ledger interface
///
/// Implementations:
/// - `SqliteCleanupStore` - Production storage with SQLite
/// - `MemoryCleanupStore` - In-memory storage for testing
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CleanupStore: Send + Sync {
    /// Record a newly created scratch data account.
    ///
    /// Fails with [`StorageError::Duplicate`] while an open record for the
    /// same address exists; a swept address may be recorded again.
    async fn insert_data_account(&self, record: &DataAccountRecord) -> StorageResult<()>;

    /// All records still awaiting sweep
    async fn open_data_accounts(&self) -> StorageResult<Vec<DataAccountRecord>>;

    /// Settle open records for the given addresses, returning how many
    /// were actually updated
    async fn mark_swept(&self, addresses: &[String]) -> StorageResult<u64>;

    /// Highest fork id already checked for `scope` (the submitter key)
    async fn sweep_cursor(&self, scope: &str) -> StorageResult<Option<u64>>;

    /// Advance the fork sweep cursor for `scope`
    async fn set_sweep_cursor(&self, scope: &str, fork_id: u64) -> StorageResult<()>;
}
