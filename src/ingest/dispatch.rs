//! Per-archive lanes over the single upload stream
//!
//! Each archive key gets a lane: an unbounded channel drained by one task.
//! Messages for one archive run one at a time in arrival order; different
//! archives run in parallel. A terminal message closes the lane, and a later
//! lane for the same key waits for the retiring one before it starts.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use super::machine::UploadIngestor;
use crate::nats::ChunkMessage;
use crate::storage::ArchiveKey;

/// A message plus an optional completion signal
pub struct Envelope {
    pub message: ChunkMessage,
    /// Fired once the ingestor has handled the message
    pub done: Option<oneshot::Sender<()>>,
}

impl Envelope {
    pub fn new(message: ChunkMessage) -> Self {
        Self {
            message,
            done: None,
        }
    }

    /// Envelope plus the receiver that fires when it has been handled
    pub fn tracked(message: ChunkMessage) -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        (
            Self {
                message,
                done: Some(tx),
            },
            rx,
        )
    }
}

struct Lane {
    sender: mpsc::UnboundedSender<Envelope>,
    task: JoinHandle<()>,
}

#[derive(Default)]
struct LaneTable {
    active: HashMap<ArchiveKey, Lane>,
    /// Lanes that got a terminal message and may still be draining
    retiring: HashMap<ArchiveKey, JoinHandle<()>>,
}

/// Routes upload messages to per-archive lanes
pub struct UploadDispatcher {
    ingestor: Arc<UploadIngestor>,
    lanes: Mutex<LaneTable>,
}

impl UploadDispatcher {
    pub fn new(ingestor: Arc<UploadIngestor>) -> Self {
        Self {
            ingestor,
            lanes: Mutex::new(LaneTable::default()),
        }
    }

    pub fn ingestor(&self) -> &Arc<UploadIngestor> {
        &self.ingestor
    }

    /// Queue a message on its archive's lane
    pub async fn dispatch(&self, envelope: Envelope) {
        let key = envelope.message.archive_key();
        let terminal = envelope.message.is_terminal();

        let mut lanes = self.lanes.lock().await;

        // A lane whose task died has a closed channel; replace it
        let needs_lane = lanes
            .active
            .get(&key)
            .map_or(true, |lane| lane.sender.is_closed());
        if needs_lane {
            let previous = match lanes.active.remove(&key) {
                Some(dead) => Some(dead.task),
                None => lanes.retiring.remove(&key),
            };
            let lane = self.spawn_lane(key.clone(), previous);
            lanes.active.insert(key.clone(), lane);
        }

        if let Some(lane) = lanes.active.get(&key) {
            if let Err(rejected) = lane.sender.send(envelope) {
                // Dropping the envelope drops its completion sender, which
                // tells the caller the message was not handled
                error!(
                    archive = %key,
                    kind = rejected.0.message.kind(),
                    "Upload lane closed before accepting message"
                );
            }
        }

        if terminal {
            if let Some(lane) = lanes.active.remove(&key) {
                drop(lane.sender);
                lanes.retiring.retain(|_, task| !task.is_finished());
                lanes.retiring.insert(key, lane.task);
            }
        }
    }

    /// Dispatch a message and wait until it has been handled
    pub async fn dispatch_and_wait(&self, message: ChunkMessage) {
        let (envelope, done) = Envelope::tracked(message);
        self.dispatch(envelope).await;
        if done.await.is_err() {
            warn!("Upload lane dropped a message before handling it");
        }
    }

    /// Number of open lanes
    pub async fn active_lanes(&self) -> usize {
        self.lanes.lock().await.active.len()
    }

    /// Retire lanes whose archive has no live upload; returns how many
    ///
    /// Data for a never-started archive opens a lane that no terminal message
    /// closes. A retired lane still drains what it has queued, and a later
    /// lane for the same key waits for it.
    pub async fn retire_orphan_lanes(&self) -> usize {
        let mut lanes = self.lanes.lock().await;
        lanes.retiring.retain(|_, task| !task.is_finished());

        let orphans: Vec<ArchiveKey> = lanes
            .active
            .keys()
            .filter(|key| self.ingestor.state(key).is_none())
            .cloned()
            .collect();

        for key in &orphans {
            if let Some(lane) = lanes.active.remove(key) {
                debug!(archive = %key, "Retiring lane with no live upload");
                drop(lane.sender);
                lanes.retiring.insert(key.clone(), lane.task);
            }
        }

        orphans.len()
    }

    /// Close every lane and wait for all queued messages to be handled
    pub async fn close(&self) {
        let tasks: Vec<JoinHandle<()>> = {
            let mut lanes = self.lanes.lock().await;
            let active = std::mem::take(&mut lanes.active);
            let retiring = std::mem::take(&mut lanes.retiring);
            active
                .into_values()
                .map(|lane| lane.task)
                .chain(retiring.into_values())
                .collect()
        };

        for task in tasks {
            if let Err(e) = task.await {
                warn!("Upload lane ended abnormally: {}", e);
            }
        }
    }

    fn spawn_lane(&self, key: ArchiveKey, previous: Option<JoinHandle<()>>) -> Lane {
        let (sender, mut receiver) = mpsc::unbounded_channel::<Envelope>();
        let ingestor = Arc::clone(&self.ingestor);

        let task = tokio::spawn(async move {
            if let Some(previous) = previous {
                if let Err(e) = previous.await {
                    warn!(archive = %key, "Previous upload lane ended abnormally: {}", e);
                }
            }

            while let Some(envelope) = receiver.recv().await {
                ingestor.handle(envelope.message).await;
                if let Some(done) = envelope.done {
                    let _ = done.send(());
                }
            }

            debug!(archive = %key, "Upload lane closed");
        });

        Lane { sender, task }
    }
}
