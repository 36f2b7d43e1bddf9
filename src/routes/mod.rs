//! HTTP routes for archive-relay

pub mod archives;
pub mod health;

pub use archives::{
    archive_name_from_path, handle_delete_archive, handle_download, handle_list_archives,
};
pub use health::health_check;

use bytes::Bytes;
use http_body_util::Full;
use hyper::header::{self, HeaderValue};
use hyper::{Response, StatusCode};
use serde::Serialize;
use tracing::error;

use crate::types::RelayError;

/// JSON response with the given status
pub fn json_response<T: Serialize>(status: StatusCode, body: &T) -> Response<Full<Bytes>> {
    let body = match serde_json::to_vec(body) {
        Ok(bytes) => bytes,
        Err(e) => {
            error!("Failed to serialize response: {}", e);
            return error_response(RelayError::Internal(e.to_string()));
        }
    };

    let mut response = Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() = status;
    let headers = response.headers_mut();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    response
}

/// Map an error to its status; server-side details are not echoed
pub fn error_response(err: RelayError) -> Response<Full<Bytes>> {
    let status = err.status_code();
    let message = if status.is_server_error() {
        error!("Request failed: {}", err);
        "Internal server error".to_string()
    } else {
        err.to_string()
    };

    let body = serde_json::json!({
        "error": status.canonical_reason().unwrap_or("Error"),
        "message": message,
    });

    let mut response = Response::new(Full::new(Bytes::from(body.to_string())));
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    response
}
