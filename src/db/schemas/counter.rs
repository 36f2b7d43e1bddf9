//! Chunk counter document schema
//!
//! One document per in-flight upload, keyed by `<owner>:<name>:processed-chunks`.

use bson::Document;
use mongodb::options::IndexOptions;
use serde::{Deserialize, Serialize};

use crate::db::mongo::{IntoIndexes, MutMetadata};
use crate::db::schemas::Metadata;

/// Collection name for chunk counters
pub const COUNTER_COLLECTION: &str = "chunk_counters";

/// Ordering counter stored in MongoDB
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct ChunkCounterDoc {
    /// Counter key, used as the document id
    #[serde(rename = "_id")]
    pub key: String,

    #[serde(default)]
    pub metadata: Metadata,

    /// Data chunks accepted so far
    pub count: i64,
}

impl ChunkCounterDoc {
    pub fn new(key: String) -> Self {
        Self {
            key,
            metadata: Metadata::new(),
            count: 0,
        }
    }
}

impl IntoIndexes for ChunkCounterDoc {
    fn into_indices() -> Vec<(Document, Option<IndexOptions>)> {
        // _id is the only lookup path
        vec![]
    }
}

impl MutMetadata for ChunkCounterDoc {
    fn mut_metadata(&mut self) -> &mut Metadata {
        &mut self.metadata
    }
}
