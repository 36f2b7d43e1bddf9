//! MongoDB client and collection wrapper

use bson::{doc, oid::ObjectId, Document};
use mongodb::{
    error::{ErrorKind, WriteFailure},
    options::{IndexOptions, ReturnDocument, UpdateModifications},
    results::UpdateResult,
    Client, Collection, IndexModel,
};
use serde::{de::DeserializeOwned, Serialize};
use tracing::{error, info};

use crate::db::schemas::Metadata;
use crate::types::RelayError;

/// MongoDB server code for unique index violations
const DUPLICATE_KEY_CODE: i32 = 11000;

/// Trait for schemas that provide index definitions
pub trait IntoIndexes {
    fn into_indices() -> Vec<(Document, Option<IndexOptions>)>;
}

/// Trait for schemas with mutable metadata
pub trait MutMetadata {
    fn mut_metadata(&mut self) -> &mut Metadata;
}

/// Whether a driver error is a unique index violation
pub fn is_duplicate_key(err: &mongodb::error::Error) -> bool {
    match err.kind.as_ref() {
        ErrorKind::Write(WriteFailure::WriteError(e)) => e.code == DUPLICATE_KEY_CODE,
        ErrorKind::Command(e) => e.code == DUPLICATE_KEY_CODE,
        _ => false,
    }
}

/// MongoDB client wrapper
#[derive(Clone)]
pub struct MongoClient {
    client: Client,
    db_name: String,
}

impl MongoClient {
    /// Create a new MongoDB client
    pub async fn new(uri: &str, db_name: &str) -> Result<Self, RelayError> {
        info!("Connecting to MongoDB at {}", uri);

        // Fail fast when MongoDB is unreachable
        let timeout_uri = if uri.contains('?') {
            format!("{}&serverSelectionTimeoutMS=3000&connectTimeoutMS=3000", uri)
        } else {
            format!("{}?serverSelectionTimeoutMS=3000&connectTimeoutMS=3000", uri)
        };

        let client = Client::with_uri_str(&timeout_uri)
            .await
            .map_err(|e| RelayError::Database(format!("Failed to connect to MongoDB: {}", e)))?;

        client
            .database(db_name)
            .run_command(doc! { "ping": 1 })
            .await
            .map_err(|e| RelayError::Database(format!("MongoDB ping failed: {}", e)))?;

        info!("Connected to MongoDB database '{}'", db_name);

        Ok(Self {
            client,
            db_name: db_name.to_string(),
        })
    }

    /// Get a typed collection
    pub async fn collection<T>(&self, name: &str) -> Result<MongoCollection<T>, RelayError>
    where
        T: Serialize + DeserializeOwned + Unpin + Send + Sync + Default + IntoIndexes + MutMetadata,
    {
        MongoCollection::new(&self.client, &self.db_name, name).await
    }
}

/// Typed MongoDB collection with automatic indexing
#[derive(Debug, Clone)]
pub struct MongoCollection<T>
where
    T: Serialize + DeserializeOwned + Unpin + Send + Sync,
{
    inner: Collection<T>,
}

impl<T> MongoCollection<T>
where
    T: Serialize + DeserializeOwned + Unpin + Send + Sync + Default + IntoIndexes + MutMetadata,
{
    /// Create a new collection and apply indexes
    pub async fn new(
        client: &Client,
        db_name: &str,
        collection_name: &str,
    ) -> Result<Self, RelayError> {
        let collection = client.database(db_name).collection::<T>(collection_name);
        let mongo_collection = MongoCollection { inner: collection };

        mongo_collection.apply_indexes().await?;

        Ok(mongo_collection)
    }

    /// Apply schema-defined indexes
    async fn apply_indexes(&self) -> Result<(), RelayError> {
        let schema_indices = T::into_indices();

        if schema_indices.is_empty() {
            return Ok(());
        }

        let indices: Vec<IndexModel> = schema_indices
            .into_iter()
            .map(|(keys, opts)| IndexModel::builder().keys(keys).options(opts).build())
            .collect();

        self.inner
            .create_indexes(indices)
            .await
            .map_err(|e| RelayError::Database(format!("Failed to create indexes: {}", e)))?;

        Ok(())
    }

    /// Insert a document, filling in missing metadata timestamps
    ///
    /// Unique index violations come back as `AlreadyExists`.
    pub async fn insert_one(&self, mut item: T) -> Result<Option<ObjectId>, RelayError> {
        item.mut_metadata().touch();

        let result = self.inner.insert_one(item).await.map_err(|e| {
            if is_duplicate_key(&e) {
                RelayError::AlreadyExists("duplicate key".into())
            } else {
                RelayError::Database(format!("Insert failed: {}", e))
            }
        })?;

        // String `_id`s are valid too; only ObjectIds are surfaced
        Ok(result.inserted_id.as_object_id())
    }

    /// Insert or replace the document matching the filter
    pub async fn upsert(&self, filter: Document, mut item: T) -> Result<UpdateResult, RelayError> {
        item.mut_metadata().touch();

        self.inner
            .replace_one(filter, item)
            .upsert(true)
            .await
            .map_err(|e| RelayError::Database(format!("Upsert failed: {}", e)))
    }

    /// Find one document by filter
    pub async fn find_one(&self, filter: Document) -> Result<Option<T>, RelayError> {
        self.inner
            .find_one(filter)
            .await
            .map_err(|e| RelayError::Database(format!("Find failed: {}", e)))
    }

    /// Find many documents by filter, in the given sort order
    pub async fn find_many(&self, filter: Document, sort: Document) -> Result<Vec<T>, RelayError> {
        use futures_util::StreamExt;

        let cursor = self
            .inner
            .find(filter)
            .sort(sort)
            .await
            .map_err(|e| RelayError::Database(format!("Find failed: {}", e)))?;

        let results: Vec<T> = cursor
            .filter_map(|doc| async move {
                match doc {
                    Ok(d) => Some(d),
                    Err(e) => {
                        error!("Error reading document: {}", e);
                        None
                    }
                }
            })
            .collect()
            .await;

        Ok(results)
    }

    /// Update one document
    pub async fn update_one(
        &self,
        filter: Document,
        update: impl Into<UpdateModifications>,
    ) -> Result<UpdateResult, RelayError> {
        self.inner
            .update_one(filter, update.into())
            .await
            .map_err(|e| RelayError::Database(format!("Update failed: {}", e)))
    }

    /// Apply an update atomically and return the document as it is afterwards
    pub async fn find_one_and_update(
        &self,
        filter: Document,
        update: impl Into<UpdateModifications>,
    ) -> Result<Option<T>, RelayError> {
        self.inner
            .find_one_and_update(filter, update.into())
            .return_document(ReturnDocument::After)
            .await
            .map_err(|e| RelayError::Database(format!("Find-and-update failed: {}", e)))
    }

    /// Delete one document, returning it
    pub async fn find_one_and_delete(&self, filter: Document) -> Result<Option<T>, RelayError> {
        self.inner
            .find_one_and_delete(filter)
            .await
            .map_err(|e| RelayError::Database(format!("Find-and-delete failed: {}", e)))
    }

    /// Delete one document; returns whether anything was deleted
    pub async fn delete_one(&self, filter: Document) -> Result<bool, RelayError> {
        let result = self
            .inner
            .delete_one(filter)
            .await
            .map_err(|e| RelayError::Database(format!("Delete failed: {}", e)))?;
        Ok(result.deleted_count > 0)
    }
}
