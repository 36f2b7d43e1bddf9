//! archive-relay - chunked archive transfer over NATS JetStream
//!
//! Archives move as ordered message streams instead of HTTP bodies, so a
//! transfer of any size never holds a request open.
//!
//! ## Components
//!
//! - **Ingest**: per-archive upload state machine fed by a JetStream consumer
//!   through per-archive lanes
//! - **Download**: re-emits finished archives as `start`/`data`/`finish` frames
//! - **Storage**: ordering counters and archive records in MongoDB, bytes on
//!   the local filesystem
//! - **Server**: authenticated HTTP routes for listing, deleting and
//!   downloading archives

pub mod auth;
pub mod config;
pub mod db;
pub mod download;
pub mod ingest;
pub mod nats;
pub mod routes;
pub mod server;
pub mod services;
pub mod storage;
pub mod types;

pub use config::Args;
pub use server::{run, AppState};
pub use types::{RelayError, Result};
