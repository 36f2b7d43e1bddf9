//! Health check endpoint
//!
//! Liveness only: returns 200 whenever the process is serving HTTP.

use bytes::Bytes;
use http_body_util::Full;
use hyper::{Response, StatusCode};
use serde::Serialize;

use super::json_response;
use crate::server::AppState;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub node_id: String,
    /// Operating mode
    pub mode: &'static str,
    /// Uploads with a live slot on this node
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active_uploads: Option<usize>,
    /// Archives currently being emitted
    pub active_downloads: usize,
    pub timestamp: String,
}

/// GET /health
pub fn health_check(state: &AppState) -> Response<Full<Bytes>> {
    let body = HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        node_id: state.args.node_id.to_string(),
        mode: if state.args.dev_mode {
            "development"
        } else {
            "production"
        },
        active_uploads: state.ingestor.as_ref().map(|i| i.active_uploads()),
        active_downloads: state.archives.downloads().leases().len(),
        timestamp: chrono::Utc::now().to_rfc3339(),
    };

    json_response(StatusCode::OK, &body)
}
