//! Database layer for archive-relay
//!
//! MongoDB storage for archive records and ordering counters.

pub mod mongo;
pub mod schemas;

pub use mongo::{MongoClient, MongoCollection};
pub use schemas::{ArchiveDoc, ChunkCounterDoc, Metadata};
