//! Error types for archive-relay
//!
//! One error enum for the whole crate. Protocol handlers turn these into
//! acknowledgement messages; the HTTP layer turns them into status codes.

use hyper::StatusCode;

/// Main error type for archive-relay operations
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Archive already exists: {0}")]
    AlreadyExists(String),

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("NATS error: {0}")]
    Nats(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl RelayError {
    /// Convert error to HTTP status code
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::AlreadyExists(_) => StatusCode::CONFLICT,
            Self::InvalidMessage(_) => StatusCode::BAD_REQUEST,
            Self::Nats(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Database(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<std::io::Error> for RelayError {
    fn from(err: std::io::Error) -> Self {
        Self::Storage(err.to_string())
    }
}

impl From<serde_json::Error> for RelayError {
    fn from(err: serde_json::Error) -> Self {
        Self::InvalidMessage(format!("JSON error: {}", err))
    }
}

impl From<hyper::Error> for RelayError {
    fn from(err: hyper::Error) -> Self {
        Self::Internal(format!("HTTP error: {}", err))
    }
}

impl From<async_nats::Error> for RelayError {
    fn from(err: async_nats::Error) -> Self {
        Self::Nats(err.to_string())
    }
}

impl From<mongodb::error::Error> for RelayError {
    fn from(err: mongodb::error::Error) -> Self {
        Self::Database(err.to_string())
    }
}

impl From<jsonwebtoken::errors::Error> for RelayError {
    fn from(err: jsonwebtoken::errors::Error) -> Self {
        Self::Unauthorized(format!("JWT error: {}", err))
    }
}

/// Result type alias for archive-relay operations
pub type Result<T> = std::result::Result<T, RelayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(
            RelayError::NotFound("a".into()).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            RelayError::Conflict("a".into()).status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            RelayError::Unauthorized("a".into()).status_code(),
            StatusCode::UNAUTHORIZED
        );
    }

    #[test]
    fn test_io_error_maps_to_storage() {
        let err: RelayError = std::io::Error::new(std::io::ErrorKind::Other, "disk").into();
        assert!(matches!(err, RelayError::Storage(_)));
    }
}
