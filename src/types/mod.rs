//! Shared types for archive-relay

pub mod error;

pub use error::{RelayError, Result};
