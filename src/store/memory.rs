//! In-Memory Storage Implementation
//!
//! Cleanup ledger for testing and development. Data is lost when the
//! process exits.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use super::traits::{
    CleanupStore, DataAccountRecord, DataAccountStatus, StorageError, StorageResult,
};

/// In-memory cleanup store
///
/// Thread-safe via `Arc<RwLock<..>>`; cloning shares the underlying maps.
#[derive(Clone, Default)]
pub struct MemoryCleanupStore {
    /// Records indexed by record id
    records: Arc<RwLock<HashMap<String, DataAccountRecord>>>,
    /// Fork sweep cursors indexed by scope
    cursors: Arc<RwLock<HashMap<String, u64>>>,
}

impl MemoryCleanupStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CleanupStore for MemoryCleanupStore {
    async fn insert_data_account(&self, record: &DataAccountRecord) -> StorageResult<()> {
        let mut records = self.records.write().await;

        let open_duplicate = records
            .values()
            .any(|r| r.address == record.address && r.status == DataAccountStatus::Open);
        if open_duplicate {
            return Err(StorageError::Duplicate(record.address.clone()));
        }

        records.insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn open_data_accounts(&self) -> StorageResult<Vec<DataAccountRecord>> {
        let records = self.records.read().await;
        let mut open: Vec<DataAccountRecord> = records
            .values()
            .filter(|r| r.status == DataAccountStatus::Open)
            .cloned()
            .collect();
        open.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(open)
    }

    async fn mark_swept(&self, addresses: &[String]) -> StorageResult<u64> {
        let mut records = self.records.write().await;
        let now = chrono::Utc::now().timestamp().max(0) as u64;

        let mut updated = 0;
        for record in records.values_mut() {
            if record.status == DataAccountStatus::Open && addresses.contains(&record.address) {
                record.status = DataAccountStatus::Swept;
                record.swept_at = Some(now);
                updated += 1;
            }
        }
        Ok(updated)
    }

    async fn sweep_cursor(&self, scope: &str) -> StorageResult<Option<u64>> {
        let cursors = self.cursors.read().await;
        Ok(cursors.get(scope).copied())
    }

    async fn set_sweep_cursor(&self, scope: &str, fork_id: u64) -> StorageResult<()> {
        let mut cursors = self.cursors.write().await;
        cursors.insert(scope.to_string(), fork_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_insert_and_list_open() {
        let store = MemoryCleanupStore::new();
        let record = DataAccountRecord::new("addr1".to_string(), "ff".repeat(32));

        store.insert_data_account(&record).await.unwrap();

        let open = store.open_data_accounts().await.unwrap();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].address, "addr1");
    }

    #[tokio::test]
    async fn test_open_duplicate_rejected_until_swept() {
        let store = MemoryCleanupStore::new();
        let first = DataAccountRecord::new("addr1".to_string(), "aa".repeat(32));
        store.insert_data_account(&first).await.unwrap();

        let second = DataAccountRecord::new("addr1".to_string(), "aa".repeat(32));
        assert!(matches!(
            store.insert_data_account(&second).await,
            Err(StorageError::Duplicate(_))
        ));

        // Once swept, the same address may be recorded again.
        let updated = store.mark_swept(&["addr1".to_string()]).await.unwrap();
        assert_eq!(updated, 1);
        store.insert_data_account(&second).await.unwrap();
    }

    #[tokio::test]
    async fn test_mark_swept_only_touches_open() {
        let store = MemoryCleanupStore::new();
        let record = DataAccountRecord::new("addr1".to_string(), "aa".repeat(32));
        store.insert_data_account(&record).await.unwrap();

        assert_eq!(store.mark_swept(&["addr1".to_string()]).await.unwrap(), 1);
        assert_eq!(store.mark_swept(&["addr1".to_string()]).await.unwrap(), 0);
        assert!(store.open_data_accounts().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_sweep_cursor_round_trip() {
        let store = MemoryCleanupStore::new();
        assert_eq!(store.sweep_cursor("submitter1").await.unwrap(), None);

        store.set_sweep_cursor("submitter1", 7).await.unwrap();
        store.set_sweep_cursor("submitter1", 9).await.unwrap();
        assert_eq!(store.sweep_cursor("submitter1").await.unwrap(), Some(9));
        assert_eq!(store.sweep_cursor("submitter2").await.unwrap(), None);
    }
}
