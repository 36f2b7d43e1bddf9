//! Idle upload reaper
//!
//! Uploads that never finish stay open forever unless something aborts them.
//! When an idle timeout is configured, this task periodically routes an
//! `abort` for each idle upload through the dispatcher, so the cleanup runs in
//! the archive's own lane. Every pass also retires lanes left behind by
//! messages for archives that were never started.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::dispatch::{Envelope, UploadDispatcher};
use crate::nats::ChunkMessage;

/// Abort every upload idle for at least `idle`; returns how many
pub async fn reap_idle(dispatcher: &UploadDispatcher, idle: Duration) -> usize {
    let keys = dispatcher.ingestor().idle_uploads(idle);

    for key in &keys {
        info!(owner = %key.owner, archive = %key.name, "Aborting idle upload");
        dispatcher
            .dispatch(Envelope::new(ChunkMessage::abort(&key.owner, &key.name)))
            .await;
    }

    keys.len()
}

/// Spawn the periodic reaper
pub fn spawn_reaper_task(
    dispatcher: Arc<UploadDispatcher>,
    idle: Option<Duration>,
    interval: Duration,
) -> JoinHandle<()> {
    match idle {
        Some(idle) => info!(
            "Idle upload reaper enabled (timeout {}s, every {}s)",
            idle.as_secs(),
            interval.as_secs()
        ),
        None => info!("Lane sweeper running every {}s", interval.as_secs()),
    }

    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            if let Some(idle) = idle {
                let reaped = reap_idle(&dispatcher, idle).await;
                if reaped > 0 {
                    debug!("Reaped {} idle uploads", reaped);
                }
            }
            let retired = dispatcher.retire_orphan_lanes().await;
            if retired > 0 {
                debug!("Retired {} orphan upload lanes", retired);
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::machine::{IngestSettings, UploadIngestor};
    use crate::nats::MemoryBus;
    use crate::storage::{
        ArchiveKey, ArchiveMetadataStore, BlobStore, FsBlobStore, MemoryArchiveStore,
        MemorySequenceTracker, Stores,
    };

    #[tokio::test]
    async fn test_reaper_cleans_idle_upload() {
        let dir = tempfile::tempdir().unwrap();
        let blobs = Arc::new(FsBlobStore::new(dir.path()).await.unwrap());
        let archives = Arc::new(MemoryArchiveStore::new());
        let sequences = Arc::new(MemorySequenceTracker::new());
        let ingestor = UploadIngestor::new(
            Stores::new(sequences.clone(), archives.clone(), blobs.clone()),
            Arc::new(MemoryBus::new()),
            IngestSettings::default(),
        );
        let dispatcher = UploadDispatcher::new(Arc::new(ingestor));
        let key = ArchiveKey::new("u1", "a");

        dispatcher
            .dispatch_and_wait(ChunkMessage::start("u1", "a", None))
            .await;
        dispatcher
            .dispatch_and_wait(ChunkMessage::data("u1", "a", 0, b"AA"))
            .await;

        assert_eq!(reap_idle(&dispatcher, Duration::from_secs(3600)).await, 0);
        assert_eq!(reap_idle(&dispatcher, Duration::ZERO).await, 1);
        dispatcher.close().await;

        assert!(archives.get(&key).await.unwrap().is_none());
        assert_eq!(sequences.peek(&key).await, None);
        assert!(blobs.size(&key).await.is_err());
        assert_eq!(dispatcher.ingestor().active_uploads(), 0);
    }

    #[tokio::test]
    async fn test_sweeper_retires_orphan_lanes() {
        let dir = tempfile::tempdir().unwrap();
        let blobs = Arc::new(FsBlobStore::new(dir.path()).await.unwrap());
        let ingestor = UploadIngestor::new(
            Stores::in_memory(blobs),
            Arc::new(MemoryBus::new()),
            IngestSettings::default(),
        );
        let dispatcher = Arc::new(UploadDispatcher::new(Arc::new(ingestor)));

        dispatcher
            .dispatch_and_wait(ChunkMessage::data("u1", "ghost", 0, b"AA"))
            .await;
        assert_eq!(dispatcher.active_lanes().await, 1);

        let task =
            spawn_reaper_task(Arc::clone(&dispatcher), None, Duration::from_millis(10));
        tokio::time::sleep(Duration::from_millis(100)).await;
        task.abort();

        assert_eq!(dispatcher.active_lanes().await, 0);
    }
}
