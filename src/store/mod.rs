//! Storage Layer Module
//!
//! Persistence for the client's cleanup ledger: scratch data accounts
//! awaiting sweep and fork sweep cursors.
//!
//! This module contains:
//! - Storage trait definitions for abstraction
//! - SQLite implementation for production
//! - In-memory implementation for testing

pub mod memory;
pub mod sqlite;
pub mod traits;

// Re-exports for convenience
pub use memory::MemoryCleanupStore;
pub use sqlite::SqliteCleanupStore;
pub use traits::{
    CleanupStore, DataAccountRecord, DataAccountStatus, StorageError, StorageResult,
};
