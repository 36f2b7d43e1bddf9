//! Download emission pipeline
//!
//! Re-emits a finished archive on the download subject as
//! `start`, one `data` per segment, then `finish`. Emission runs in a
//! background task; the caller gets a [`DownloadHandle`] as soon as the task
//! is spawned.

use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use super::lease::LeaseTable;
use crate::nats::{DownloadFrame, MessageBus};
use crate::storage::{ArchiveKey, ArchiveRecord, BlobReader, Stores};
use crate::types::{RelayError, Result};

/// Default size of one emitted data segment
pub const DEFAULT_SEGMENT_BYTES: usize = 64 * 1024;

#[derive(Debug, Clone)]
pub struct DownloadSettings {
    /// Subject download frames are published to
    pub subject: String,
    pub segment_bytes: usize,
}

impl Default for DownloadSettings {
    fn default() -> Self {
        Self {
            subject: "download-stream".to_string(),
            segment_bytes: DEFAULT_SEGMENT_BYTES,
        }
    }
}

/// What a completed emission sent
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadReport {
    pub key: ArchiveKey,
    /// Data frames emitted
    pub segments: u64,
    pub bytes: u64,
}

/// Handle on a running emission
pub struct DownloadHandle {
    key: ArchiveKey,
    task: JoinHandle<Result<DownloadReport>>,
}

impl DownloadHandle {
    pub fn key(&self) -> &ArchiveKey {
        &self.key
    }

    /// Wait for the emission to end
    pub async fn join(self) -> Result<DownloadReport> {
        self.task
            .await
            .map_err(|e| RelayError::Internal(format!("Download task failed: {}", e)))?
    }

    /// Log the outcome in the background; nothing is retried
    pub fn supervise(self) {
        tokio::spawn(async move {
            let key = self.key.clone();
            match self.join().await {
                Ok(report) => info!(
                    owner = %key.owner,
                    archive = %key.name,
                    segments = report.segments,
                    bytes = report.bytes,
                    "Download emitted"
                ),
                Err(e) => error!(owner = %key.owner, archive = %key.name, "Download failed: {}", e),
            }
        });
    }
}

/// Emits stored archives onto the bus
#[derive(Clone)]
pub struct DownloadPipeline {
    stores: Stores,
    bus: Arc<dyn MessageBus>,
    leases: LeaseTable,
    settings: Arc<DownloadSettings>,
}

impl DownloadPipeline {
    pub fn new(stores: Stores, bus: Arc<dyn MessageBus>, settings: DownloadSettings) -> Self {
        Self {
            stores,
            bus,
            leases: LeaseTable::new(),
            settings: Arc::new(settings),
        }
    }

    pub fn leases(&self) -> &LeaseTable {
        &self.leases
    }

    /// Start emitting a finished archive
    ///
    /// Fails with `NotFound`, and emits nothing, when the archive is missing
    /// or its upload never finished.
    pub async fn initiate(&self, key: &ArchiveKey) -> Result<DownloadHandle> {
        key.validate()?;
        let not_found = || RelayError::NotFound(format!("Archive \"{}\" not found", key.name));

        // Leased before the lookup so a delete cannot remove the record
        // between the two
        let lease = self.leases.acquire(key).ok_or_else(not_found)?;

        let record = self
            .stores
            .archives
            .get(key)
            .await?
            .filter(ArchiveRecord::is_finished)
            .ok_or_else(not_found)?;

        let pipeline = self.clone();

        debug!(archive = %key, "Download initiated");

        let task = tokio::spawn(async move {
            let _lease = lease;
            pipeline.emit(record).await
        });

        Ok(DownloadHandle {
            key: key.clone(),
            task,
        })
    }

    async fn emit(&self, record: ArchiveRecord) -> Result<DownloadReport> {
        let key = record.key();
        let mut reader = self.stores.blobs.open(&key).await?;

        self.send(&DownloadFrame::start(&record)).await?;

        let mut buffer = vec![0u8; self.settings.segment_bytes.max(1)];
        let mut report = DownloadReport {
            key: key.clone(),
            segments: 0,
            bytes: 0,
        };

        loop {
            let filled = fill_segment(&mut reader, &mut buffer).await?;
            if filled == 0 {
                break;
            }

            self.send(&DownloadFrame::data(&key, &buffer[..filled])).await?;
            report.segments += 1;
            report.bytes += filled as u64;

            if filled < buffer.len() {
                break;
            }
        }

        self.send(&DownloadFrame::finish(&key)).await?;
        Ok(report)
    }

    async fn send(&self, frame: &DownloadFrame) -> Result<()> {
        self.bus
            .publish(&self.settings.subject, frame.kind(), frame.to_bytes()?)
            .await
    }
}

/// Read until the buffer is full or the reader is exhausted
async fn fill_segment(reader: &mut BlobReader, buffer: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buffer.len() {
        let read = reader.read(&mut buffer[filled..]).await?;
        if read == 0 {
            break;
        }
        filled += read;
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nats::MemoryBus;
    use crate::storage::{FinishedArchive, FsBlobStore};

    async fn stored_archive(stores: &Stores, key: &ArchiveKey, bytes: &[u8]) {
        stores
            .archives
            .create(ArchiveRecord::pending(key, None))
            .await
            .unwrap();
        stores.blobs.create(key).await.unwrap();
        stores.blobs.append(key, bytes).await.unwrap();
        stores
            .archives
            .finish(
                key,
                FinishedArchive {
                    checksum: "c1".into(),
                    iv: "i1".into(),
                    size_in_bytes: bytes.len() as u64,
                },
            )
            .await
            .unwrap();
    }

    async fn setup(
        bus: Arc<MemoryBus>,
        segment_bytes: usize,
    ) -> (tempfile::TempDir, Stores, DownloadPipeline) {
        let dir = tempfile::tempdir().unwrap();
        let blobs = Arc::new(FsBlobStore::new(dir.path()).await.unwrap());
        let stores = Stores::in_memory(blobs);
        let pipeline = DownloadPipeline::new(
            stores.clone(),
            bus,
            DownloadSettings {
                segment_bytes,
                ..Default::default()
            },
        );
        (dir, stores, pipeline)
    }

    #[tokio::test]
    async fn test_emits_segments_in_order() {
        let bus = Arc::new(MemoryBus::new());
        let (_dir, stores, pipeline) = setup(bus.clone(), 4).await;
        let key = ArchiveKey::new("u1", "a");
        stored_archive(&stores, &key, b"0123456789").await;

        let report = pipeline.initiate(&key).await.unwrap().join().await.unwrap();
        assert_eq!(report.segments, 3);
        assert_eq!(report.bytes, 10);

        assert_eq!(
            bus.keys_on("download-stream"),
            vec!["start", "data", "data", "data", "finish"]
        );
        assert!(!pipeline.leases().is_leased(&key));
    }

    #[tokio::test]
    async fn test_exact_multiple_has_no_empty_segment() {
        let bus = Arc::new(MemoryBus::new());
        let (_dir, stores, pipeline) = setup(bus.clone(), 5).await;
        let key = ArchiveKey::new("u1", "a");
        stored_archive(&stores, &key, b"0123456789").await;

        let report = pipeline.initiate(&key).await.unwrap().join().await.unwrap();
        assert_eq!(report.segments, 2);
        assert_eq!(bus.keys_on("download-stream").len(), 4);
    }

    #[tokio::test]
    async fn test_pending_archive_is_not_found() {
        let bus = Arc::new(MemoryBus::new());
        let (_dir, stores, pipeline) = setup(bus.clone(), 4).await;
        let key = ArchiveKey::new("u1", "a");
        stores
            .archives
            .create(ArchiveRecord::pending(&key, None))
            .await
            .unwrap();

        assert!(matches!(
            pipeline.initiate(&key).await,
            Err(RelayError::NotFound(_))
        ));
        assert!(bus.messages().is_empty());
        assert!(pipeline.leases().is_empty());
    }

    #[tokio::test]
    async fn test_no_download_while_deleting() {
        let bus = Arc::new(MemoryBus::new());
        let (_dir, stores, pipeline) = setup(bus.clone(), 4).await;
        let key = ArchiveKey::new("u1", "a");
        stored_archive(&stores, &key, b"0123456789").await;

        let claim = pipeline.leases().begin_delete(&key).unwrap();
        assert!(matches!(
            pipeline.initiate(&key).await,
            Err(RelayError::NotFound(_))
        ));
        assert!(bus.messages().is_empty());

        drop(claim);
        pipeline.initiate(&key).await.unwrap().join().await.unwrap();
    }

    #[tokio::test]
    async fn test_bus_failure_is_reported_and_releases_lease() {
        let bus = Arc::new(MemoryBus::failing_after(2));
        let (_dir, stores, pipeline) = setup(bus.clone(), 4).await;
        let key = ArchiveKey::new("u1", "a");
        stored_archive(&stores, &key, b"0123456789").await;

        let result = pipeline.initiate(&key).await.unwrap().join().await;
        assert!(matches!(result, Err(RelayError::Nats(_))));
        assert_eq!(bus.keys_on("download-stream"), vec!["start", "data"]);
        assert!(!pipeline.leases().is_leased(&key));
    }
}
