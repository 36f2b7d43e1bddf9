//! Upload ingestion state machine
//!
//! One logical machine per archive key, tracked in a slot registry:
//!
//! ```text
//! Idle -> Started -> Receiving -> Finished | Aborted | Failed
//! ```
//!
//! The ordering counter decides which chunk comes next; a data message is
//! accepted only when `counter - 1 + order_base` equals its order number.
//! Failures are reported as `error` acknowledgements carrying a generic
//! message; the detail stays in the logs.

use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::nats::messages::{DataChunk, FinishChunk, StartChunk};
use crate::nats::{Acknowledgement, ChunkMessage, MessageBus};
use crate::storage::{ArchiveKey, ArchiveRecord, FinishedArchive, Stores};
use crate::types::{RelayError, Result};

/// Ingestion settings
#[derive(Debug, Clone)]
pub struct IngestSettings {
    /// Subject acknowledgements are published to
    pub ack_subject: String,
    /// Order number of the first data chunk
    pub order_base: u64,
}

impl Default for IngestSettings {
    fn default() -> Self {
        Self {
            ack_subject: "upload-acknowledge".to_string(),
            order_base: 0,
        }
    }
}

/// Lifecycle state of one upload
///
/// Idle is the absence of a slot. Finished and aborted uploads drop their
/// slot, so only the non-terminal states and `Failed` are ever stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadState {
    Started,
    Receiving,
    Failed,
}

/// Registry entry for an in-flight upload
#[derive(Debug, Clone)]
pub struct UploadSlot {
    pub state: UploadState,
    pub last_activity: Instant,
}

impl UploadSlot {
    fn new(state: UploadState) -> Self {
        Self {
            state,
            last_activity: Instant::now(),
        }
    }
}

/// Applies upload messages to the stores and reports the outcome
pub struct UploadIngestor {
    stores: Stores,
    bus: Arc<dyn MessageBus>,
    settings: IngestSettings,
    slots: DashMap<ArchiveKey, UploadSlot>,
}

impl UploadIngestor {
    pub fn new(stores: Stores, bus: Arc<dyn MessageBus>, settings: IngestSettings) -> Self {
        Self {
            stores,
            bus,
            settings,
            slots: DashMap::new(),
        }
    }

    /// Current state of an upload; `None` when idle or terminal
    pub fn state(&self, key: &ArchiveKey) -> Option<UploadState> {
        self.slots.get(key).map(|slot| slot.state)
    }

    /// Number of uploads with a live slot
    pub fn active_uploads(&self) -> usize {
        self.slots.len()
    }

    /// Uploads with no activity for at least `idle`
    pub fn idle_uploads(&self, idle: Duration) -> Vec<ArchiveKey> {
        self.slots
            .iter()
            .filter(|slot| slot.last_activity.elapsed() >= idle)
            .map(|slot| slot.key().clone())
            .collect()
    }

    /// Handle one upload message
    ///
    /// Messages for the same archive must be handled one at a time, in bus
    /// order. The dispatcher guarantees that.
    pub async fn handle(&self, message: ChunkMessage) {
        match message {
            ChunkMessage::Start(start) => self.on_start(start).await,
            ChunkMessage::Data(data) => self.on_data(data).await,
            ChunkMessage::Finish(finish) => self.on_finish(finish).await,
            ChunkMessage::Abort(abort) => {
                let key = ArchiveKey::new(abort.owner, abort.archive_name);
                self.cleanup(&key).await;
                debug!(archive = %key, "Upload aborted and cleaned");
            }
        }
    }

    async fn on_start(&self, start: StartChunk) {
        let key = ArchiveKey::new(start.owner, start.archive_name);

        if let Err(e) = key.validate() {
            error!(archive = %key, "Rejected upload start: {}", e);
            self.acknowledge(Acknowledgement::failed(&key)).await;
            return;
        }

        // The unique record is the claim on the name; nothing else is touched
        // until it succeeds
        match self
            .stores
            .archives
            .create(ArchiveRecord::pending(&key, start.iv))
            .await
        {
            Ok(()) => {}
            Err(RelayError::AlreadyExists(_)) => {
                warn!(archive = %key, "Upload start for an existing archive");
                self.acknowledge(Acknowledgement::failed(&key)).await;
                return;
            }
            Err(e) => {
                error!(archive = %key, "Failed to create archive record: {}", e);
                self.acknowledge(Acknowledgement::failed(&key)).await;
                return;
            }
        }

        if let Err(e) = self.prepare(&key).await {
            error!(archive = %key, "Failed to prepare upload: {}", e);
            self.cleanup(&key).await;
            self.acknowledge(Acknowledgement::failed(&key)).await;
            return;
        }

        self.slots.insert(key.clone(), UploadSlot::new(UploadState::Started));
        info!(owner = %key.owner, archive = %key.name, "Upload started");
        self.acknowledge(Acknowledgement::started(&key)).await;
    }

    async fn prepare(&self, key: &ArchiveKey) -> Result<()> {
        self.stores.sequences.reset(key).await?;
        self.stores.blobs.create(key).await
    }

    async fn on_data(&self, data: DataChunk) {
        let key = ArchiveKey::new(data.owner.clone(), data.archive_name.clone());

        if self.state(&key) == Some(UploadState::Failed) {
            debug!(archive = %key, order = data.order_number, "Dropping chunk for failed upload");
            return;
        }

        let bytes = match data.decode_data() {
            Ok(bytes) => bytes,
            Err(e) => {
                error!(archive = %key, order = data.order_number, "Undecodable chunk payload: {}", e);
                self.fail(&key).await;
                return;
            }
        };

        let count = match self.stores.sequences.increment(&key).await {
            Ok(Some(count)) => count,
            Ok(None) => {
                warn!(archive = %key, order = data.order_number, "Chunk for an archive with no active upload");
                if self.slots.contains_key(&key) {
                    self.fail(&key).await;
                } else {
                    self.acknowledge(Acknowledgement::failed(&key)).await;
                }
                return;
            }
            Err(e) => {
                error!(archive = %key, "Failed to advance chunk counter: {}", e);
                self.fail(&key).await;
                return;
            }
        };

        let expected = count - 1 + self.settings.order_base;
        if data.order_number != expected {
            error!(
                archive = %key,
                expected,
                received = data.order_number,
                "Chunk out of order"
            );
            self.fail(&key).await;
            return;
        }

        if let Err(e) = self.stores.blobs.append(&key, &bytes).await {
            error!(archive = %key, order = data.order_number, "Failed to append chunk: {}", e);
            self.fail(&key).await;
            return;
        }

        self.slots
            .entry(key.clone())
            .and_modify(|slot| {
                slot.state = UploadState::Receiving;
                slot.last_activity = Instant::now();
            })
            .or_insert_with(|| UploadSlot::new(UploadState::Receiving));

        debug!(archive = %key, order = data.order_number, bytes = bytes.len(), "Chunk stored");
    }

    async fn on_finish(&self, finish: FinishChunk) {
        let key = ArchiveKey::new(finish.owner.clone(), finish.archive_name.clone());

        if self.state(&key) == Some(UploadState::Failed) {
            warn!(archive = %key, "Ignoring finish for failed upload");
            return;
        }

        match self.complete(&key, finish).await {
            Ok(size) => {
                self.slots.remove(&key);
                info!(owner = %key.owner, archive = %key.name, size, "Upload finished");
                self.acknowledge(Acknowledgement::finished(&key)).await;
            }
            Err(e) => {
                error!(archive = %key, "Upload could not be finished: {}", e);
                self.discard_unfinished(&key).await;
                self.acknowledge(Acknowledgement::failed(&key)).await;
            }
        }
    }

    /// Check completeness and persist the integrity fields; returns the size
    async fn complete(&self, key: &ArchiveKey, finish: FinishChunk) -> Result<u64> {
        let received = self
            .stores
            .sequences
            .take(key)
            .await?
            .ok_or_else(|| RelayError::NotFound(format!("No active upload for {}", key)))?;

        if received != finish.chunk_amount {
            return Err(RelayError::InvalidMessage(format!(
                "Expected {} chunks, received {}",
                finish.chunk_amount, received
            )));
        }

        let size_in_bytes = self.stores.blobs.size(key).await?;
        let updated = self
            .stores
            .archives
            .finish(
                key,
                FinishedArchive {
                    checksum: finish.checksum,
                    iv: finish.iv,
                    size_in_bytes,
                },
            )
            .await?;

        if !updated {
            return Err(RelayError::NotFound(format!("Archive record for {} is gone", key)));
        }
        Ok(size_in_bytes)
    }

    /// Clean up after a failed finish without destroying a finished archive
    async fn discard_unfinished(&self, key: &ArchiveKey) {
        match self.stores.archives.get(key).await {
            Ok(Some(record)) if record.is_finished() => {
                warn!(archive = %key, "Stray finish for a completed archive; leaving it intact");
                self.slots.remove(key);
            }
            _ => self.cleanup(key).await,
        }
    }

    /// Move the upload to `Failed` and report it
    ///
    /// The stored counter is dropped so a finish handled by another process,
    /// or after a restart, can never seal the partial bytes.
    async fn fail(&self, key: &ArchiveKey) {
        if let Err(e) = self.stores.sequences.remove(key).await {
            warn!(archive = %key, "Failed to drop chunk counter of failed upload: {}", e);
        }
        self.slots
            .entry(key.clone())
            .and_modify(|slot| {
                slot.state = UploadState::Failed;
                slot.last_activity = Instant::now();
            })
            .or_insert_with(|| UploadSlot::new(UploadState::Failed));
        self.acknowledge(Acknowledgement::failed(key)).await;
    }

    /// Remove every trace of an upload; missing pieces are fine
    async fn cleanup(&self, key: &ArchiveKey) {
        self.slots.remove(key);

        if let Err(e) = self.stores.sequences.remove(key).await {
            warn!(archive = %key, "Failed to remove chunk counter: {}", e);
        }
        if let Err(e) = self.stores.archives.remove(key).await {
            warn!(archive = %key, "Failed to remove archive record: {}", e);
        }
        if let Err(e) = self.stores.blobs.remove(key).await {
            warn!(archive = %key, "Failed to remove archive bytes: {}", e);
        }
    }

    async fn acknowledge(&self, ack: Acknowledgement) {
        let payload = match ack.to_bytes() {
            Ok(payload) => payload,
            Err(e) => {
                error!("Failed to serialize acknowledgement: {}", e);
                return;
            }
        };

        if let Err(e) = self
            .bus
            .publish(&self.settings.ack_subject, ack.kind(), payload)
            .await
        {
            error!(
                owner = %ack.owner,
                archive = %ack.archive_name,
                "Failed to publish {} acknowledgement: {}",
                ack.kind(),
                e
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nats::{AckStatus, MemoryBus};
    use crate::storage::{
        ArchiveMetadataStore, BlobStore, FsBlobStore, MemoryArchiveStore, MemorySequenceTracker,
    };
    use tokio::io::AsyncReadExt;

    struct Harness {
        _dir: tempfile::TempDir,
        blobs: Arc<FsBlobStore>,
        archives: Arc<MemoryArchiveStore>,
        sequences: Arc<MemorySequenceTracker>,
        bus: Arc<MemoryBus>,
        ingestor: UploadIngestor,
    }

    async fn harness(order_base: u64) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let blobs = Arc::new(FsBlobStore::new(dir.path()).await.unwrap());
        let archives = Arc::new(MemoryArchiveStore::new());
        let sequences = Arc::new(MemorySequenceTracker::new());
        let bus = Arc::new(MemoryBus::new());
        let stores = Stores::new(sequences.clone(), archives.clone(), blobs.clone());
        let ingestor = UploadIngestor::new(
            stores,
            bus.clone(),
            IngestSettings {
                order_base,
                ..Default::default()
            },
        );
        Harness {
            _dir: dir,
            blobs,
            archives,
            sequences,
            bus,
            ingestor,
        }
    }

    impl Harness {
        fn acks(&self) -> Vec<Acknowledgement> {
            self.bus
                .on_topic("upload-acknowledge")
                .iter()
                .map(|m| Acknowledgement::from_bytes(&m.payload).unwrap())
                .collect()
        }

        async fn bytes(&self, key: &ArchiveKey) -> Vec<u8> {
            let mut out = Vec::new();
            self.blobs
                .open(key)
                .await
                .unwrap()
                .read_to_end(&mut out)
                .await
                .unwrap();
            out
        }
    }

    #[tokio::test]
    async fn test_start_creates_everything() {
        let h = harness(0).await;
        let key = ArchiveKey::new("u1", "a");

        h.ingestor.handle(ChunkMessage::start("u1", "a", Some("i0"))).await;

        assert_eq!(h.ingestor.state(&key), Some(UploadState::Started));
        assert_eq!(h.sequences.peek(&key).await, Some(0));
        assert_eq!(h.blobs.size(&key).await.unwrap(), 0);
        let record = h.archives.get(&key).await.unwrap().unwrap();
        assert_eq!(record.iv.as_deref(), Some("i0"));
        assert!(!record.is_finished());

        let acks = h.acks();
        assert_eq!(acks.len(), 1);
        assert_eq!(acks[0].status, AckStatus::Success);
    }

    #[tokio::test]
    async fn test_out_of_order_fails_upload() {
        let h = harness(0).await;
        let key = ArchiveKey::new("u1", "a");

        h.ingestor.handle(ChunkMessage::start("u1", "a", None)).await;
        h.ingestor.handle(ChunkMessage::data("u1", "a", 2, b"XX")).await;

        assert_eq!(h.ingestor.state(&key), Some(UploadState::Failed));
        assert_eq!(h.blobs.size(&key).await.unwrap(), 0);
        let acks = h.acks();
        assert_eq!(acks.len(), 2);
        assert_eq!(acks[1].status, AckStatus::Error);
    }

    #[tokio::test]
    async fn test_failed_upload_ignores_later_messages() {
        let h = harness(0).await;
        let key = ArchiveKey::new("u1", "a");

        h.ingestor.handle(ChunkMessage::start("u1", "a", None)).await;
        h.ingestor.handle(ChunkMessage::data("u1", "a", 1, b"XX")).await;
        let counter = h.sequences.peek(&key).await;

        h.ingestor.handle(ChunkMessage::data("u1", "a", 1, b"YY")).await;
        h.ingestor.handle(ChunkMessage::finish("u1", "a", 2, "c", "i")).await;

        // No further acks, counter gone, record still pending
        assert_eq!(counter, None);
        assert_eq!(h.acks().len(), 2);
        assert_eq!(h.sequences.peek(&key).await, None);
        assert!(!h.archives.get(&key).await.unwrap().unwrap().is_finished());
    }

    #[tokio::test]
    async fn test_one_based_ordering() {
        let h = harness(1).await;
        let key = ArchiveKey::new("u1", "a");

        h.ingestor.handle(ChunkMessage::start("u1", "a", None)).await;
        h.ingestor.handle(ChunkMessage::data("u1", "a", 1, b"AA")).await;
        h.ingestor.handle(ChunkMessage::data("u1", "a", 2, b"BB")).await;
        h.ingestor.handle(ChunkMessage::finish("u1", "a", 2, "c1", "i1")).await;

        assert_eq!(h.bytes(&key).await, b"AABB");
        assert_eq!(h.acks().last().unwrap().status, AckStatus::Ok);
    }

    #[tokio::test]
    async fn test_data_without_start_is_rejected() {
        let h = harness(0).await;
        let key = ArchiveKey::new("u1", "ghost");

        h.ingestor.handle(ChunkMessage::data("u1", "ghost", 0, b"AA")).await;

        assert!(matches!(h.blobs.size(&key).await, Err(RelayError::NotFound(_))));
        assert_eq!(h.ingestor.state(&key), None);
        let acks = h.acks();
        assert_eq!(acks.len(), 1);
        assert_eq!(acks[0].status, AckStatus::Error);
    }

    #[tokio::test]
    async fn test_bad_base64_fails_upload() {
        let h = harness(0).await;
        let key = ArchiveKey::new("u1", "a");
        h.ingestor.handle(ChunkMessage::start("u1", "a", None)).await;

        let mut message = ChunkMessage::data("u1", "a", 0, b"AA");
        if let ChunkMessage::Data(data) = &mut message {
            data.data = "not base64!".into();
        }
        h.ingestor.handle(message).await;

        assert_eq!(h.ingestor.state(&key), Some(UploadState::Failed));
        assert_eq!(h.acks().last().unwrap().status, AckStatus::Error);
    }

    #[tokio::test]
    async fn test_finish_without_counter_keeps_completed_archive() {
        let h = harness(0).await;
        let key = ArchiveKey::new("u1", "a");

        h.ingestor.handle(ChunkMessage::start("u1", "a", None)).await;
        h.ingestor.handle(ChunkMessage::data("u1", "a", 0, b"AA")).await;
        h.ingestor.handle(ChunkMessage::finish("u1", "a", 1, "c1", "i1")).await;
        h.ingestor.handle(ChunkMessage::finish("u1", "a", 1, "c1", "i1")).await;

        let acks = h.acks();
        assert_eq!(acks.last().unwrap().status, AckStatus::Error);
        assert!(h.archives.get(&key).await.unwrap().unwrap().is_finished());
        assert_eq!(h.bytes(&key).await, b"AA");
    }

    #[tokio::test]
    async fn test_invalid_name_rejected_on_start() {
        let h = harness(0).await;
        h.ingestor.handle(ChunkMessage::start("u1", "../x", None)).await;

        assert!(h.archives.list("u1").await.unwrap().is_empty());
        assert_eq!(h.acks()[0].status, AckStatus::Error);
    }

    #[tokio::test]
    async fn test_idle_uploads() {
        let h = harness(0).await;
        h.ingestor.handle(ChunkMessage::start("u1", "a", None)).await;

        assert_eq!(
            h.ingestor.idle_uploads(Duration::ZERO),
            vec![ArchiveKey::new("u1", "a")]
        );
        assert!(h.ingestor.idle_uploads(Duration::from_secs(3600)).is_empty());
    }

    #[tokio::test]
    async fn test_failed_upload_stays_failed_after_restart() {
        let h = harness(0).await;
        let key = ArchiveKey::new("u1", "a");

        h.ingestor.handle(ChunkMessage::start("u1", "a", None)).await;
        h.ingestor.handle(ChunkMessage::data("u1", "a", 0, b"AA")).await;
        h.ingestor.handle(ChunkMessage::data("u1", "a", 5, b"BB")).await;

        // A fresh process over the same stores sees the finish
        let restarted = UploadIngestor::new(
            Stores::new(h.sequences.clone(), h.archives.clone(), h.blobs.clone()),
            h.bus.clone(),
            IngestSettings::default(),
        );
        restarted
            .handle(ChunkMessage::finish("u1", "a", 2, "c1", "i1"))
            .await;

        assert!(h.archives.get(&key).await.unwrap().is_none());
        assert!(matches!(h.blobs.size(&key).await, Err(RelayError::NotFound(_))));
        let statuses: Vec<_> = h.acks().into_iter().map(|a| a.status).collect();
        assert_eq!(
            statuses,
            vec![AckStatus::Success, AckStatus::Error, AckStatus::Error]
        );
    }

    /// Blob store whose appends always fail
    struct FailingAppend(FsBlobStore);

    #[async_trait::async_trait]
    impl BlobStore for FailingAppend {
        async fn create(&self, key: &ArchiveKey) -> Result<()> {
            self.0.create(key).await
        }
        async fn append(&self, _key: &ArchiveKey, _data: &[u8]) -> Result<()> {
            Err(RelayError::Storage("disk full".into()))
        }
        async fn size(&self, key: &ArchiveKey) -> Result<u64> {
            self.0.size(key).await
        }
        async fn open(&self, key: &ArchiveKey) -> Result<crate::storage::BlobReader> {
            self.0.open(key).await
        }
        async fn remove(&self, key: &ArchiveKey) -> Result<()> {
            self.0.remove(key).await
        }
    }

    /// Metadata store that cannot persist the finished fields
    struct FailingFinish(MemoryArchiveStore);

    #[async_trait::async_trait]
    impl ArchiveMetadataStore for FailingFinish {
        async fn create(&self, record: ArchiveRecord) -> Result<()> {
            self.0.create(record).await
        }
        async fn get(&self, key: &ArchiveKey) -> Result<Option<ArchiveRecord>> {
            self.0.get(key).await
        }
        async fn list(&self, owner: &str) -> Result<Vec<ArchiveRecord>> {
            self.0.list(owner).await
        }
        async fn finish(&self, _key: &ArchiveKey, _finished: FinishedArchive) -> Result<bool> {
            Err(RelayError::Storage("write concern timeout".into()))
        }
        async fn remove(&self, key: &ArchiveKey) -> Result<Option<ArchiveRecord>> {
            self.0.remove(key).await
        }
    }

    fn statuses(bus: &MemoryBus) -> Vec<AckStatus> {
        bus.on_topic("upload-acknowledge")
            .iter()
            .map(|m| Acknowledgement::from_bytes(&m.payload).unwrap().status)
            .collect()
    }

    #[tokio::test]
    async fn test_failed_append_fails_upload() {
        let dir = tempfile::tempdir().unwrap();
        let blobs = Arc::new(FailingAppend(FsBlobStore::new(dir.path()).await.unwrap()));
        let sequences = Arc::new(MemorySequenceTracker::new());
        let bus = Arc::new(MemoryBus::new());
        let ingestor = UploadIngestor::new(
            Stores::new(sequences.clone(), Arc::new(MemoryArchiveStore::new()), blobs),
            bus.clone(),
            IngestSettings::default(),
        );
        let key = ArchiveKey::new("u1", "a");

        ingestor.handle(ChunkMessage::start("u1", "a", None)).await;
        ingestor.handle(ChunkMessage::data("u1", "a", 0, b"AA")).await;
        ingestor.handle(ChunkMessage::data("u1", "a", 1, b"BB")).await;

        assert_eq!(ingestor.state(&key), Some(UploadState::Failed));
        assert_eq!(sequences.peek(&key).await, None);
        assert_eq!(statuses(&bus), vec![AckStatus::Success, AckStatus::Error]);
    }

    #[tokio::test]
    async fn test_failed_finish_write_cleans_up_once() {
        let dir = tempfile::tempdir().unwrap();
        let blobs = Arc::new(FsBlobStore::new(dir.path()).await.unwrap());
        let archives = Arc::new(FailingFinish(MemoryArchiveStore::new()));
        let sequences = Arc::new(MemorySequenceTracker::new());
        let bus = Arc::new(MemoryBus::new());
        let ingestor = UploadIngestor::new(
            Stores::new(sequences.clone(), archives.clone(), blobs.clone()),
            bus.clone(),
            IngestSettings::default(),
        );
        let key = ArchiveKey::new("u1", "a");

        ingestor.handle(ChunkMessage::start("u1", "a", None)).await;
        ingestor.handle(ChunkMessage::data("u1", "a", 0, b"AA")).await;
        ingestor
            .handle(ChunkMessage::finish("u1", "a", 1, "c1", "i1"))
            .await;

        assert_eq!(ingestor.state(&key), None);
        assert_eq!(sequences.peek(&key).await, None);
        assert!(archives.get(&key).await.unwrap().is_none());
        assert!(matches!(blobs.size(&key).await, Err(RelayError::NotFound(_))));
        assert_eq!(statuses(&bus), vec![AckStatus::Success, AckStatus::Error]);
    }
}
