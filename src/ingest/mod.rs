//! Upload ingestion
//!
//! - `machine` - per-archive state machine over the three stores
//! - `dispatch` - per-archive lanes over the single inbound stream
//! - `consumer` - JetStream pull consumer feeding the dispatcher
//! - `reaper` - optional abort of idle uploads

pub mod consumer;
pub mod dispatch;
pub mod machine;
pub mod reaper;

pub use consumer::UploadConsumer;
pub use dispatch::{Envelope, UploadDispatcher};
pub use machine::{IngestSettings, UploadIngestor, UploadSlot, UploadState};
pub use reaper::{reap_idle, spawn_reaper_task};
