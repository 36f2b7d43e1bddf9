//! Database schemas for archive-relay
//!
//! Defines MongoDB document structures for archives and chunk counters.

mod archive;
mod counter;
mod metadata;

pub use archive::{ArchiveDoc, ARCHIVE_COLLECTION};
pub use counter::{ChunkCounterDoc, COUNTER_COLLECTION};
pub use metadata::Metadata;
