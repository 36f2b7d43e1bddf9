//! Archive management for authenticated owners
//!
//! Listing, deletion and download initiation. Uploads never pass through
//! here; they arrive on the upload stream.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

use crate::download::{DownloadHandle, DownloadPipeline};
use crate::storage::{ArchiveKey, ArchiveRecord, Stores};
use crate::types::{RelayError, Result};

/// Archive as shown to its owner
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ArchiveSummary {
    pub archive_name: String,
    pub size_in_bytes: u64,
    /// `finished` once the upload completed, `pending` otherwise
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub iv: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl From<ArchiveRecord> for ArchiveSummary {
    fn from(record: ArchiveRecord) -> Self {
        let status = if record.is_finished() {
            "finished"
        } else {
            "pending"
        };
        Self {
            archive_name: record.name,
            size_in_bytes: record.size_in_bytes,
            status,
            checksum: record.checksum,
            iv: record.iv,
            created_at: record.created_at,
        }
    }
}

/// Archive operations behind the HTTP routes
#[derive(Clone)]
pub struct ArchiveService {
    stores: Stores,
    downloads: DownloadPipeline,
}

impl ArchiveService {
    pub fn new(stores: Stores, downloads: DownloadPipeline) -> Self {
        Self { stores, downloads }
    }

    pub fn downloads(&self) -> &DownloadPipeline {
        &self.downloads
    }

    /// All archives of one owner, oldest first
    pub async fn list(&self, owner: &str) -> Result<Vec<ArchiveSummary>> {
        let records = self.stores.archives.list(owner).await?;
        Ok(records.into_iter().map(ArchiveSummary::from).collect())
    }

    /// Delete an archive's record, counter and bytes
    ///
    /// Refused with `Conflict` while a download of it is emitting; no
    /// download can start until the delete is done.
    pub async fn delete(&self, key: &ArchiveKey) -> Result<()> {
        key.validate()?;

        let _claim = self.downloads.leases().begin_delete(key).ok_or_else(|| {
            RelayError::Conflict(format!("Archive \"{}\" is being downloaded", key.name))
        })?;

        if self.stores.archives.remove(key).await?.is_none() {
            return Err(RelayError::NotFound(format!(
                "Archive \"{}\" not found",
                key.name
            )));
        }

        if let Err(e) = self.stores.sequences.remove(key).await {
            warn!(archive = %key, "Failed to remove chunk counter: {}", e);
        }
        self.stores.blobs.remove(key).await?;

        info!(owner = %key.owner, archive = %key.name, "Archive deleted");
        Ok(())
    }

    /// Start emitting an archive on the download stream
    pub async fn initiate_download(&self, key: &ArchiveKey) -> Result<DownloadHandle> {
        self.downloads.initiate(key).await
    }
}
