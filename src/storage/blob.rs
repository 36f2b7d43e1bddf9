//! Filesystem blob storage
//!
//! One file per archive at `<root>/<owner>/<archive>`. Chunks are appended in
//! arrival order and synced before the append returns.

use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs::{self, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use super::{ArchiveKey, BlobReader, BlobStore};
use crate::types::{RelayError, Result};

/// Blob storage rooted at a local directory
pub struct FsBlobStore {
    root_dir: PathBuf,
}

impl FsBlobStore {
    /// Create a new blob store at the given directory
    pub async fn new<P: AsRef<Path>>(root_dir: P) -> Result<Self> {
        let root_dir = root_dir.as_ref().to_path_buf();

        fs::create_dir_all(&root_dir).await?;

        info!(path = %root_dir.display(), "Initialized archive blob store");

        Ok(Self { root_dir })
    }

    fn owner_dir(&self, key: &ArchiveKey) -> PathBuf {
        self.root_dir.join(&key.owner)
    }

    /// Get path for an archive's bytes
    pub fn archive_path(&self, key: &ArchiveKey) -> PathBuf {
        self.owner_dir(key).join(&key.name)
    }

    fn not_found(key: &ArchiveKey) -> RelayError {
        RelayError::NotFound(format!("No stored bytes for archive \"{}\"", key.name))
    }
}

#[async_trait]
impl BlobStore for FsBlobStore {
    async fn create(&self, key: &ArchiveKey) -> Result<()> {
        key.validate()?;
        fs::create_dir_all(self.owner_dir(key)).await?;

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(self.archive_path(key))
            .await?;
        file.sync_all().await?;

        debug!(archive = %key, "Created archive destination");
        Ok(())
    }

    async fn append(&self, key: &ArchiveKey, data: &[u8]) -> Result<()> {
        key.validate()?;

        // No create flag: appending to an archive that was never started is an error
        let mut file = match OpenOptions::new()
            .append(true)
            .open(self.archive_path(key))
            .await
        {
            Ok(f) => f,
            Err(e) if e.kind() == ErrorKind::NotFound => return Err(Self::not_found(key)),
            Err(e) => return Err(e.into()),
        };

        file.write_all(data).await?;
        file.flush().await?;
        file.sync_data().await?;

        Ok(())
    }

    async fn size(&self, key: &ArchiveKey) -> Result<u64> {
        key.validate()?;
        match fs::metadata(self.archive_path(key)).await {
            Ok(meta) => Ok(meta.len()),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(Self::not_found(key)),
            Err(e) => Err(e.into()),
        }
    }

    async fn open(&self, key: &ArchiveKey) -> Result<BlobReader> {
        key.validate()?;
        match fs::File::open(self.archive_path(key)).await {
            Ok(file) => Ok(Box::pin(file)),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(Self::not_found(key)),
            Err(e) => Err(e.into()),
        }
    }

    async fn remove(&self, key: &ArchiveKey) -> Result<()> {
        key.validate()?;
        let path = self.archive_path(key);

        let result = match fs::symlink_metadata(&path).await {
            Ok(meta) if meta.is_dir() => fs::remove_dir_all(&path).await,
            Ok(_) => fs::remove_file(&path).await,
            Err(e) => Err(e),
        };

        match result {
            Ok(()) => {
                debug!(archive = %key, "Removed archive bytes");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
