//! Archive downloads over the message bus

pub mod lease;
pub mod pipeline;

pub use lease::{DeleteGuard, DownloadLease, LeaseTable};
pub use pipeline::{
    DownloadHandle, DownloadPipeline, DownloadReport, DownloadSettings, DEFAULT_SEGMENT_BYTES,
};
