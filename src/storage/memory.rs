//! In-memory counter and metadata stores
//!
//! Used by tests and by dev mode when MongoDB is unreachable.

use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::Mutex;

use super::{ArchiveKey, ArchiveMetadataStore, ArchiveRecord, FinishedArchive, SequenceTracker};
use crate::types::{RelayError, Result};

/// Counter map guarded by one mutex, so increment-and-read is atomic
#[derive(Default)]
pub struct MemorySequenceTracker {
    counters: Mutex<HashMap<ArchiveKey, u64>>,
}

impl MemorySequenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current value without consuming it
    pub async fn peek(&self, key: &ArchiveKey) -> Option<u64> {
        self.counters.lock().await.get(key).copied()
    }
}

#[async_trait]
impl SequenceTracker for MemorySequenceTracker {
    async fn reset(&self, key: &ArchiveKey) -> Result<()> {
        self.counters.lock().await.insert(key.clone(), 0);
        Ok(())
    }

    async fn increment(&self, key: &ArchiveKey) -> Result<Option<u64>> {
        let mut counters = self.counters.lock().await;
        Ok(counters.get_mut(key).map(|count| {
            *count += 1;
            *count
        }))
    }

    async fn take(&self, key: &ArchiveKey) -> Result<Option<u64>> {
        Ok(self.counters.lock().await.remove(key))
    }

    async fn remove(&self, key: &ArchiveKey) -> Result<()> {
        self.counters.lock().await.remove(key);
        Ok(())
    }
}

/// Archive records in a map keyed by (owner, name)
#[derive(Default)]
pub struct MemoryArchiveStore {
    records: Mutex<HashMap<ArchiveKey, ArchiveRecord>>,
}

impl MemoryArchiveStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ArchiveMetadataStore for MemoryArchiveStore {
    async fn create(&self, record: ArchiveRecord) -> Result<()> {
        let key = record.key();
        let mut records = self.records.lock().await;
        if records.contains_key(&key) {
            return Err(RelayError::AlreadyExists(key.to_string()));
        }
        records.insert(key, record);
        Ok(())
    }

    async fn get(&self, key: &ArchiveKey) -> Result<Option<ArchiveRecord>> {
        Ok(self.records.lock().await.get(key).cloned())
    }

    async fn list(&self, owner: &str) -> Result<Vec<ArchiveRecord>> {
        let records = self.records.lock().await;
        let mut owned: Vec<ArchiveRecord> = records
            .values()
            .filter(|r| r.owner == owner)
            .cloned()
            .collect();
        owned.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.name.cmp(&b.name)));
        Ok(owned)
    }

    async fn finish(&self, key: &ArchiveKey, finished: FinishedArchive) -> Result<bool> {
        let mut records = self.records.lock().await;
        match records.get_mut(key) {
            Some(record) => {
                record.checksum = Some(finished.checksum);
                record.iv = Some(finished.iv);
                record.size_in_bytes = finished.size_in_bytes;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn remove(&self, key: &ArchiveKey) -> Result<Option<ArchiveRecord>> {
        Ok(self.records.lock().await.remove(key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_counter_lifecycle() {
        let tracker = MemorySequenceTracker::new();
        let key = ArchiveKey::new("u1", "a");

        assert_eq!(tracker.increment(&key).await.unwrap(), None);

        tracker.reset(&key).await.unwrap();
        assert_eq!(tracker.increment(&key).await.unwrap(), Some(1));
        assert_eq!(tracker.increment(&key).await.unwrap(), Some(2));
        assert_eq!(tracker.take(&key).await.unwrap(), Some(2));
        assert_eq!(tracker.take(&key).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_counters_are_independent() {
        let tracker = MemorySequenceTracker::new();
        let a = ArchiveKey::new("u1", "a");
        let b = ArchiveKey::new("u1", "b");
        tracker.reset(&a).await.unwrap();
        tracker.reset(&b).await.unwrap();

        tracker.increment(&a).await.unwrap();
        tracker.increment(&a).await.unwrap();
        tracker.increment(&b).await.unwrap();

        assert_eq!(tracker.peek(&a).await, Some(2));
        assert_eq!(tracker.peek(&b).await, Some(1));
    }

    #[tokio::test]
    async fn test_duplicate_create_rejected() {
        let store = MemoryArchiveStore::new();
        let key = ArchiveKey::new("u1", "a");
        store.create(ArchiveRecord::pending(&key, None)).await.unwrap();

        let err = store
            .create(ArchiveRecord::pending(&key, None))
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn test_finish_and_list() {
        let store = MemoryArchiveStore::new();
        let key = ArchiveKey::new("u1", "a");
        store.create(ArchiveRecord::pending(&key, None)).await.unwrap();
        store
            .create(ArchiveRecord::pending(&ArchiveKey::new("u2", "z"), None))
            .await
            .unwrap();

        let updated = store
            .finish(
                &key,
                FinishedArchive {
                    checksum: "c1".into(),
                    iv: "i1".into(),
                    size_in_bytes: 4,
                },
            )
            .await
            .unwrap();
        assert!(updated);

        let listed = store.list("u1").await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].checksum.as_deref(), Some("c1"));
        assert_eq!(listed[0].size_in_bytes, 4);

        assert!(store.remove(&key).await.unwrap().is_some());
        assert!(store.remove(&key).await.unwrap().is_none());
    }
}
