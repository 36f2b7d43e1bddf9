//! Storage contracts for the transfer engine
//!
//! Three stores back every upload and download:
//! - [`SequenceTracker`] - per-archive ordering counter
//! - [`ArchiveMetadataStore`] - persisted archive records
//! - [`BlobStore`] - the archive bytes
//!
//! MongoDB and filesystem implementations are used in production; the
//! in-memory ones back tests and dev mode.

pub mod blob;
pub mod memory;
pub mod mongo;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::pin::Pin;
use std::sync::Arc;
use tokio::io::AsyncRead;

use crate::types::{RelayError, Result};

pub use blob::FsBlobStore;
pub use memory::{MemoryArchiveStore, MemorySequenceTracker};
pub use mongo::{MongoArchiveStore, MongoSequenceTracker};

/// Identity of an archive: owner plus archive name
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ArchiveKey {
    pub owner: String,
    pub name: String,
}

impl ArchiveKey {
    pub fn new(owner: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            name: name.into(),
        }
    }

    /// Both parts become path components in the blob store, so each must be
    /// a single non-empty segment.
    pub fn validate(&self) -> Result<()> {
        validate_component("owner", &self.owner)?;
        validate_component("archive name", &self.name)
    }

    /// Key of the ordering counter for this archive
    pub fn counter_key(&self) -> String {
        format!("{}:{}:processed-chunks", self.owner, self.name)
    }
}

impl fmt::Display for ArchiveKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.name)
    }
}

fn validate_component(label: &str, value: &str) -> Result<()> {
    if value.is_empty()
        || value == "."
        || value == ".."
        || value.contains('/')
        || value.contains('\\')
        || value.contains('\0')
    {
        return Err(RelayError::BadRequest(format!(
            "Invalid {}: {:?}",
            label, value
        )));
    }
    Ok(())
}

/// Persisted archive record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchiveRecord {
    pub owner: String,
    pub name: String,
    /// Informational; set from the blob length when the upload finishes
    pub size_in_bytes: u64,
    /// Present only once the upload has finished
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iv: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl ArchiveRecord {
    /// Record for an upload that has just started
    pub fn pending(key: &ArchiveKey, iv: Option<String>) -> Self {
        Self {
            owner: key.owner.clone(),
            name: key.name.clone(),
            size_in_bytes: 0,
            checksum: None,
            iv,
            created_at: Utc::now(),
        }
    }

    pub fn key(&self) -> ArchiveKey {
        ArchiveKey::new(self.owner.clone(), self.name.clone())
    }

    /// A record without a checksum is an in-flight or orphaned upload
    pub fn is_finished(&self) -> bool {
        self.checksum.is_some()
    }
}

/// Fields written when an upload finishes
#[derive(Debug, Clone)]
pub struct FinishedArchive {
    pub checksum: String,
    pub iv: String,
    pub size_in_bytes: u64,
}

/// Per-archive counter used to validate chunk order and count
///
/// `increment` must be a single atomic store operation; the ordering check
/// depends on it.
#[async_trait]
pub trait SequenceTracker: Send + Sync {
    /// Create (or reset) the counter at zero
    async fn reset(&self, key: &ArchiveKey) -> Result<()>;

    /// Atomically add one and return the new value; `None` if no counter exists
    async fn increment(&self, key: &ArchiveKey) -> Result<Option<u64>>;

    /// Read and delete the counter
    async fn take(&self, key: &ArchiveKey) -> Result<Option<u64>>;

    /// Delete the counter; missing counters are fine
    async fn remove(&self, key: &ArchiveKey) -> Result<()>;
}

/// Archive record storage keyed by (owner, name)
#[async_trait]
pub trait ArchiveMetadataStore: Send + Sync {
    /// Insert a new record; fails with `AlreadyExists` if the name is taken
    async fn create(&self, record: ArchiveRecord) -> Result<()>;

    async fn get(&self, key: &ArchiveKey) -> Result<Option<ArchiveRecord>>;

    async fn list(&self, owner: &str) -> Result<Vec<ArchiveRecord>>;

    /// Set checksum, iv and size; returns false if the record is gone
    async fn finish(&self, key: &ArchiveKey, finished: FinishedArchive) -> Result<bool>;

    /// Delete the record, returning it if it existed
    async fn remove(&self, key: &ArchiveKey) -> Result<Option<ArchiveRecord>>;
}

/// Sequential reader over an archive's bytes
pub type BlobReader = Pin<Box<dyn AsyncRead + Send>>;

/// Durable byte storage addressed by archive key
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Create an empty destination, truncating any leftover bytes
    async fn create(&self, key: &ArchiveKey) -> Result<()>;

    /// Append bytes; they are durable when this returns
    async fn append(&self, key: &ArchiveKey, data: &[u8]) -> Result<()>;

    async fn size(&self, key: &ArchiveKey) -> Result<u64>;

    async fn open(&self, key: &ArchiveKey) -> Result<BlobReader>;

    /// Delete the bytes; missing artifacts are fine
    async fn remove(&self, key: &ArchiveKey) -> Result<()>;
}

/// The three stores the transfer engine works against
#[derive(Clone)]
pub struct Stores {
    pub sequences: Arc<dyn SequenceTracker>,
    pub archives: Arc<dyn ArchiveMetadataStore>,
    pub blobs: Arc<dyn BlobStore>,
}

impl Stores {
    pub fn new(
        sequences: Arc<dyn SequenceTracker>,
        archives: Arc<dyn ArchiveMetadataStore>,
        blobs: Arc<dyn BlobStore>,
    ) -> Self {
        Self {
            sequences,
            archives,
            blobs,
        }
    }

    /// In-memory counter and metadata over the given blob store
    pub fn in_memory(blobs: Arc<dyn BlobStore>) -> Self {
        Self::new(
            Arc::new(MemorySequenceTracker::new()),
            Arc::new(MemoryArchiveStore::new()),
            blobs,
        )
    }
}
