//! MongoDB-backed counter and metadata stores

use async_trait::async_trait;
use bson::{doc, DateTime, Document};

use super::{ArchiveKey, ArchiveMetadataStore, ArchiveRecord, FinishedArchive, SequenceTracker};
use crate::db::{
    schemas::{ARCHIVE_COLLECTION, COUNTER_COLLECTION},
    ArchiveDoc, ChunkCounterDoc, MongoClient, MongoCollection,
};
use crate::types::{RelayError, Result};

/// Ordering counters in the `chunk_counters` collection
///
/// `increment` is a single `$inc` round trip, so concurrent deliveries for
/// the same archive cannot observe the same value.
#[derive(Clone)]
pub struct MongoSequenceTracker {
    counters: MongoCollection<ChunkCounterDoc>,
}

impl MongoSequenceTracker {
    pub async fn new(client: &MongoClient) -> Result<Self> {
        Ok(Self {
            counters: client.collection(COUNTER_COLLECTION).await?,
        })
    }

    fn filter(key: &ArchiveKey) -> Document {
        doc! { "_id": key.counter_key() }
    }
}

#[async_trait]
impl SequenceTracker for MongoSequenceTracker {
    async fn reset(&self, key: &ArchiveKey) -> Result<()> {
        self.counters
            .upsert(Self::filter(key), ChunkCounterDoc::new(key.counter_key()))
            .await?;
        Ok(())
    }

    async fn increment(&self, key: &ArchiveKey) -> Result<Option<u64>> {
        let updated = self
            .counters
            .find_one_and_update(
                Self::filter(key),
                doc! {
                    "$inc": { "count": 1_i64 },
                    "$set": { "metadata.updated_at": DateTime::now() },
                },
            )
            .await?;
        Ok(updated.map(|c| c.count.max(0) as u64))
    }

    async fn take(&self, key: &ArchiveKey) -> Result<Option<u64>> {
        let removed = self.counters.find_one_and_delete(Self::filter(key)).await?;
        Ok(removed.map(|c| c.count.max(0) as u64))
    }

    async fn remove(&self, key: &ArchiveKey) -> Result<()> {
        self.counters.delete_one(Self::filter(key)).await?;
        Ok(())
    }
}

/// Archive records in the `archives` collection
#[derive(Clone)]
pub struct MongoArchiveStore {
    archives: MongoCollection<ArchiveDoc>,
}

impl MongoArchiveStore {
    pub async fn new(client: &MongoClient) -> Result<Self> {
        Ok(Self {
            archives: client.collection(ARCHIVE_COLLECTION).await?,
        })
    }

    fn filter(key: &ArchiveKey) -> Document {
        doc! { "owner": key.owner.clone(), "name": key.name.clone() }
    }
}

#[async_trait]
impl ArchiveMetadataStore for MongoArchiveStore {
    async fn create(&self, record: ArchiveRecord) -> Result<()> {
        let key = record.key();
        match self.archives.insert_one(ArchiveDoc::from_record(&record)).await {
            Ok(_) => Ok(()),
            Err(RelayError::AlreadyExists(_)) => Err(RelayError::AlreadyExists(key.to_string())),
            Err(e) => Err(e),
        }
    }

    async fn get(&self, key: &ArchiveKey) -> Result<Option<ArchiveRecord>> {
        Ok(self
            .archives
            .find_one(Self::filter(key))
            .await?
            .map(ArchiveDoc::into_record))
    }

    async fn list(&self, owner: &str) -> Result<Vec<ArchiveRecord>> {
        let docs = self
            .archives
            .find_many(
                doc! { "owner": owner },
                doc! { "metadata.created_at": 1, "name": 1 },
            )
            .await?;
        Ok(docs.into_iter().map(ArchiveDoc::into_record).collect())
    }

    async fn finish(&self, key: &ArchiveKey, finished: FinishedArchive) -> Result<bool> {
        let result = self
            .archives
            .update_one(
                Self::filter(key),
                doc! {
                    "$set": {
                        "checksum": finished.checksum,
                        "iv": finished.iv,
                        "size_in_bytes": (finished.size_in_bytes as i64),
                        "metadata.updated_at": DateTime::now(),
                    }
                },
            )
            .await?;
        Ok(result.matched_count > 0)
    }

    async fn remove(&self, key: &ArchiveKey) -> Result<Option<ArchiveRecord>> {
        Ok(self
            .archives
            .find_one_and_delete(Self::filter(key))
            .await?
            .map(ArchiveDoc::into_record))
    }
}
