//! NATS transport for archive transfers
//!
//! - `client` - JetStream connection and stream setup
//! - `messages` - upload, acknowledgement and download wire types
//! - `bus` - the publish seam used by the ingestor and download pipeline

pub mod bus;
pub mod client;
pub mod messages;

pub use bus::{MemoryBus, MessageBus, NatsBus, PublishedMessage};
pub use client::{message_key, NatsClient, MESSAGE_KEY_HEADER};
pub use messages::{
    AckStatus, Acknowledgement, ChunkMessage, DownloadFrame, GENERIC_UPLOAD_ERROR,
};
