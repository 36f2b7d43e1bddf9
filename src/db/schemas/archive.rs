//! Archive document schema
//!
//! Stores archive metadata; bytes live in the blob store.

use bson::{doc, oid::ObjectId, Document};
use chrono::Utc;
use mongodb::options::IndexOptions;
use serde::{Deserialize, Serialize};

use crate::db::mongo::{IntoIndexes, MutMetadata};
use crate::db::schemas::Metadata;
use crate::storage::ArchiveRecord;

/// Collection name for archives
pub const ARCHIVE_COLLECTION: &str = "archives";

/// Archive document stored in MongoDB
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct ArchiveDoc {
    /// MongoDB document ID
    #[serde(skip_serializing_if = "Option::is_none")]
    pub _id: Option<ObjectId>,

    /// Common metadata (created_at, updated_at)
    #[serde(default)]
    pub metadata: Metadata,

    /// Owner id
    pub owner: String,

    /// Archive name, unique per owner
    pub name: String,

    #[serde(default)]
    pub size_in_bytes: i64,

    /// Set only when the upload finished
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub iv: Option<String>,
}

impl ArchiveDoc {
    /// Build a document from a record
    pub fn from_record(record: &ArchiveRecord) -> Self {
        Self {
            _id: None,
            metadata: Metadata::created(bson::DateTime::from_chrono(record.created_at)),
            owner: record.owner.clone(),
            name: record.name.clone(),
            size_in_bytes: record.size_in_bytes as i64,
            checksum: record.checksum.clone(),
            iv: record.iv.clone(),
        }
    }

    /// Convert to the storage-agnostic record
    pub fn into_record(self) -> ArchiveRecord {
        ArchiveRecord {
            owner: self.owner,
            name: self.name,
            size_in_bytes: self.size_in_bytes.max(0) as u64,
            checksum: self.checksum,
            iv: self.iv,
            created_at: self
                .metadata
                .created_at
                .map(|d| d.to_chrono())
                .unwrap_or_else(Utc::now),
        }
    }
}

impl IntoIndexes for ArchiveDoc {
    fn into_indices() -> Vec<(Document, Option<IndexOptions>)> {
        vec![
            // Archive names are unique per owner
            (
                doc! { "owner": 1, "name": 1 },
                Some(
                    IndexOptions::builder()
                        .unique(true)
                        .name("owner_name_unique".to_string())
                        .build(),
                ),
            ),
        ]
    }
}

impl MutMetadata for ArchiveDoc {
    fn mut_metadata(&mut self) -> &mut Metadata {
        &mut self.metadata
    }
}
