//! HTTP server implementation
//!
//! Uses hyper http1 with TokioIo for async handling. Handlers are generic
//! over the request body since no route reads it.

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::header::{self, HeaderValue};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use crate::auth::JwtValidator;
use crate::config::Args;
use crate::ingest::UploadIngestor;
use crate::routes;
use crate::services::ArchiveService;
use crate::types::RelayError;

pub type BoxBody = http_body_util::combinators::BoxBody<Bytes, hyper::Error>;

/// Shared application state
pub struct AppState {
    pub args: Args,
    /// Archive listing, deletion and downloads
    pub archives: ArchiveService,
    /// Bearer token validation for `/archives` routes
    pub jwt: JwtValidator,
    /// Upload state machine, for health reporting
    pub ingestor: Option<Arc<UploadIngestor>>,
}

impl AppState {
    pub fn new(args: Args, archives: ArchiveService, jwt: JwtValidator) -> Self {
        Self {
            args,
            archives,
            jwt,
            ingestor: None,
        }
    }

    pub fn with_ingestor(mut self, ingestor: Arc<UploadIngestor>) -> Self {
        self.ingestor = Some(ingestor);
        self
    }
}

/// Start the HTTP server
pub async fn run(state: Arc<AppState>) -> Result<(), RelayError> {
    let listener = TcpListener::bind(state.args.listen).await?;

    info!(
        "archive-relay listening on {} as node {}",
        state.args.listen, state.args.node_id
    );

    if state.args.dev_mode {
        warn!("Development mode enabled - dev JWT secret in use");
    }

    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                let state = Arc::clone(&state);
                tokio::spawn(async move {
                    let io = TokioIo::new(stream);

                    let service = service_fn(move |req| {
                        let state = Arc::clone(&state);
                        async move { handle_request(state, addr, req).await }
                    });

                    if let Err(err) = http1::Builder::new()
                        .preserve_header_case(true)
                        .title_case_headers(true)
                        .serve_connection(io, service)
                        .await
                    {
                        error!("Error serving connection from {}: {:?}", addr, err);
                    }
                });
            }
            Err(e) => {
                error!("Error accepting connection: {:?}", e);
            }
        }
    }
}

/// Route incoming HTTP requests
pub async fn handle_request<B>(
    state: Arc<AppState>,
    addr: SocketAddr,
    req: Request<B>,
) -> Result<Response<BoxBody>, hyper::Error> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let auth_header = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok());

    info!("[{}] {} {}", addr, method, path);

    let response = match (method, path.as_str()) {
        (Method::GET, "/health") | (Method::GET, "/healthz") => routes::health_check(&state),

        (Method::OPTIONS, _) => preflight_response(),

        (Method::GET, "/archives") | (Method::GET, "/archives/") => {
            routes::handle_list_archives(&state, auth_header).await
        }

        (Method::POST, p) if p.starts_with("/archives/") && p.ends_with("/download") => {
            match routes::archive_name_from_path(p, "/download") {
                Some(name) => routes::handle_download(&state, auth_header, &name).await,
                None => not_found_response(&path),
            }
        }

        (Method::DELETE, p) if p.starts_with("/archives/") => {
            match routes::archive_name_from_path(p, "") {
                Some(name) => routes::handle_delete_archive(&state, auth_header, &name).await,
                None => not_found_response(&path),
            }
        }

        _ => not_found_response(&path),
    };

    Ok(to_boxed(with_cors(response, &state.args.cors_origin())))
}

/// Convert a Full<Bytes> body to BoxBody
fn to_boxed(response: Response<Full<Bytes>>) -> Response<BoxBody> {
    response.map(|body| body.map_err(|never| match never {}).boxed())
}

/// CORS preflight response
fn preflight_response() -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::new()));
    let headers = response.headers_mut();
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static("Authorization, Content-Type"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("GET, POST, DELETE, OPTIONS"),
    );
    response
}

/// Echo the configured frontend origin; credentials only for a concrete origin
fn with_cors(mut response: Response<Full<Bytes>>, origin: &str) -> Response<Full<Bytes>> {
    let headers = response.headers_mut();
    match HeaderValue::from_str(origin) {
        Ok(value) => {
            headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, value);
        }
        Err(_) => {
            warn!("FRONTEND_ORIGIN is not a valid header value: {:?}", origin);
            return response;
        }
    }
    if origin != "*" {
        headers.insert(
            header::ACCESS_CONTROL_ALLOW_CREDENTIALS,
            HeaderValue::from_static("true"),
        );
        headers.insert(header::VARY, HeaderValue::from_static("Origin"));
    }
    response
}

/// Not found response
fn not_found_response(path: &str) -> Response<Full<Bytes>> {
    let body = serde_json::json!({
        "error": "Not Found",
        "path": path,
    });
    routes::json_response(StatusCode::NOT_FOUND, &body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::download::{DownloadPipeline, DownloadSettings};
    use crate::nats::MemoryBus;
    use crate::storage::{FsBlobStore, Stores};
    use clap::Parser;

    async fn state() -> (tempfile::TempDir, Arc<AppState>) {
        state_with(&[]).await
    }

    async fn state_with(extra: &[&str]) -> (tempfile::TempDir, Arc<AppState>) {
        let dir = tempfile::tempdir().unwrap();
        let blobs = Arc::new(FsBlobStore::new(dir.path()).await.unwrap());
        let stores = Stores::in_memory(blobs);
        let downloads = DownloadPipeline::new(
            stores.clone(),
            Arc::new(MemoryBus::new()),
            DownloadSettings::default(),
        );
        let mut argv = vec!["archive-relay", "--dev-mode"];
        argv.extend_from_slice(extra);
        let args = Args::try_parse_from(argv).unwrap();
        let state = AppState::new(
            args,
            ArchiveService::new(stores, downloads),
            JwtValidator::new_dev(),
        );
        (dir, Arc::new(state))
    }

    fn addr() -> SocketAddr {
        "127.0.0.1:9".parse().unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let (_dir, state) = state().await;
        let req = Request::get("/health").body(Full::new(Bytes::new())).unwrap();
        let resp = handle_request(state, addr(), req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_preflight() {
        let (_dir, state) = state().await;
        let req = Request::builder()
            .method(Method::OPTIONS)
            .uri("/archives")
            .body(Full::new(Bytes::new()))
            .unwrap();
        let resp = handle_request(state, addr(), req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(resp
            .headers()
            .contains_key(header::ACCESS_CONTROL_ALLOW_METHODS));
    }

    #[tokio::test]
    async fn test_cors_echoes_frontend_origin() {
        let (_dir, state) = state_with(&["--frontend-origin", "https://app.example.com"]).await;

        for req in [
            Request::builder()
                .method(Method::OPTIONS)
                .uri("/archives")
                .body(Full::new(Bytes::new()))
                .unwrap(),
            Request::get("/archives").body(Full::new(Bytes::new())).unwrap(),
        ] {
            let resp = handle_request(Arc::clone(&state), addr(), req).await.unwrap();
            let headers = resp.headers();
            assert_eq!(
                headers[header::ACCESS_CONTROL_ALLOW_ORIGIN],
                "https://app.example.com"
            );
            assert_eq!(headers[header::ACCESS_CONTROL_ALLOW_CREDENTIALS], "true");
        }
    }

    #[tokio::test]
    async fn test_cors_wildcard_without_credentials() {
        let (_dir, state) = state().await;
        let req = Request::get("/health").body(Full::new(Bytes::new())).unwrap();
        let resp = handle_request(state, addr(), req).await.unwrap();
        assert_eq!(resp.headers()[header::ACCESS_CONTROL_ALLOW_ORIGIN], "*");
        assert!(!resp
            .headers()
            .contains_key(header::ACCESS_CONTROL_ALLOW_CREDENTIALS));
    }

    #[tokio::test]
    async fn test_unknown_route() {
        let (_dir, state) = state().await;
        let req = Request::get("/nope").body(Full::new(Bytes::new())).unwrap();
        let resp = handle_request(state, addr(), req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }
}
