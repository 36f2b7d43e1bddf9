//! Archive routes
//!
//! - `GET /archives` - list the caller's archives
//! - `POST /archives/:name/download` - start emitting an archive (202)
//! - `DELETE /archives/:name` - delete an archive (204, 409 while emitting)
//!
//! The owner always comes from the bearer token, never from the path.

use bytes::Bytes;
use http_body_util::Full;
use hyper::{Response, StatusCode};
use serde::Serialize;
use tracing::{debug, warn};

use super::{error_response, json_response};
use crate::server::AppState;
use crate::storage::ArchiveKey;

/// Body returned when a download has been started
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadInitiated {
    pub owner: String,
    pub archive_name: String,
    pub status: &'static str,
}

/// Extract and percent-decode the archive name from `/archives/<name><suffix>`
pub fn archive_name_from_path(path: &str, suffix: &str) -> Option<String> {
    let rest = path.strip_prefix("/archives/")?;
    let raw = rest.strip_suffix(suffix)?;
    if raw.is_empty() || raw.contains('/') {
        return None;
    }
    urlencoding::decode(raw).ok().map(|name| name.into_owned())
}

/// GET /archives
pub async fn handle_list_archives(
    state: &AppState,
    auth_header: Option<&str>,
) -> Response<Full<Bytes>> {
    let owner = match state.jwt.authenticate(auth_header) {
        Ok(owner) => owner,
        Err(e) => return error_response(e),
    };

    match state.archives.list(&owner).await {
        Ok(archives) => json_response(StatusCode::OK, &archives),
        Err(e) => error_response(e),
    }
}

/// POST /archives/:name/download
pub async fn handle_download(
    state: &AppState,
    auth_header: Option<&str>,
    name: &str,
) -> Response<Full<Bytes>> {
    let owner = match state.jwt.authenticate(auth_header) {
        Ok(owner) => owner,
        Err(e) => return error_response(e),
    };
    let key = ArchiveKey::new(owner, name);

    match state.archives.initiate_download(&key).await {
        Ok(handle) => {
            debug!(archive = %key, "Download accepted");
            handle.supervise();
            json_response(
                StatusCode::ACCEPTED,
                &DownloadInitiated {
                    owner: key.owner,
                    archive_name: key.name,
                    status: "initiated",
                },
            )
        }
        Err(e) => {
            warn!(archive = %key, "Download refused: {}", e);
            error_response(e)
        }
    }
}

/// DELETE /archives/:name
pub async fn handle_delete_archive(
    state: &AppState,
    auth_header: Option<&str>,
    name: &str,
) -> Response<Full<Bytes>> {
    let owner = match state.jwt.authenticate(auth_header) {
        Ok(owner) => owner,
        Err(e) => return error_response(e),
    };
    let key = ArchiveKey::new(owner, name);

    match state.archives.delete(&key).await {
        Ok(()) => {
            let mut response = Response::new(Full::new(Bytes::new()));
            *response.status_mut() = StatusCode::NO_CONTENT;
            response
        }
        Err(e) => error_response(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_archive_name_from_path() {
        assert_eq!(
            archive_name_from_path("/archives/a.tar/download", "/download").as_deref(),
            Some("a.tar")
        );
        assert_eq!(
            archive_name_from_path("/archives/my%20photos", "").as_deref(),
            Some("my photos")
        );
        assert_eq!(archive_name_from_path("/archives/", ""), None);
        assert_eq!(archive_name_from_path("/archives/a/b", ""), None);
        assert_eq!(archive_name_from_path("/other/a", ""), None);
    }
}
