//! Services layer for archive-relay
//!
//! - **Archives**: listing, deletion and download initiation per owner

pub mod archives;

pub use archives::{ArchiveService, ArchiveSummary};
