//! JWT verification for archive owners
//!
//! Tokens are minted by the external auth service and signed with its
//! private key; this node only holds the public key. The `sub` claim is the
//! owner id that archives are stored under. Dev mode verifies HS256 tokens
//! signed with [`DEV_SECRET`].

use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::{Deserialize, Serialize};

use crate::types::RelayError;

/// Shared secret accepted in dev mode only
pub const DEV_SECRET: &str = "dev-mode-secret-not-for-production-use-123456";

/// Payload stored in JWT token
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Owner id
    pub sub: String,
    /// Issued at (Unix timestamp)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iat: Option<u64>,
    /// Expiration time (Unix timestamp)
    pub exp: u64,
}

/// Result of token validation
#[derive(Debug)]
pub struct TokenValidationResult {
    pub valid: bool,
    pub claims: Option<Claims>,
    pub error: Option<String>,
}

impl TokenValidationResult {
    pub fn valid(claims: Claims) -> Self {
        Self {
            valid: true,
            claims: Some(claims),
            error: None,
        }
    }

    pub fn invalid(error: impl Into<String>) -> Self {
        Self {
            valid: false,
            claims: None,
            error: Some(error.into()),
        }
    }
}

/// Verifies bearer tokens against the auth service's public key
#[derive(Clone)]
pub struct JwtValidator {
    key: DecodingKey,
    algorithm: Algorithm,
}

impl JwtValidator {
    /// Validator for a PEM public key (RSA for RS256, EC for ES256)
    ///
    /// Keys passed through a single-line env var may carry literal `\n`.
    pub fn from_public_key_pem(pem: &str) -> Result<Self, RelayError> {
        let pem = pem.trim().replace("\\n", "\n");
        if pem.is_empty() {
            return Err(RelayError::Config("AUTH_PUBLIC_KEY is empty".into()));
        }

        if let Ok(key) = DecodingKey::from_rsa_pem(pem.as_bytes()) {
            return Ok(Self {
                key,
                algorithm: Algorithm::RS256,
            });
        }

        DecodingKey::from_ec_pem(pem.as_bytes())
            .map(|key| Self {
                key,
                algorithm: Algorithm::ES256,
            })
            .map_err(|e| RelayError::Config(format!("AUTH_PUBLIC_KEY is not a usable PEM key: {}", e)))
    }

    /// Create a validator for dev mode
    pub fn new_dev() -> Self {
        Self {
            key: DecodingKey::from_secret(DEV_SECRET.as_bytes()),
            algorithm: Algorithm::HS256,
        }
    }

    pub fn algorithm(&self) -> Algorithm {
        self.algorithm
    }

    /// Verify and decode a JWT token
    pub fn verify_token(&self, token: &str) -> TokenValidationResult {
        let validation = Validation::new(self.algorithm);

        match decode::<Claims>(token, &self.key, &validation) {
            Ok(token_data) => TokenValidationResult::valid(token_data.claims),
            Err(err) => {
                use jsonwebtoken::errors::ErrorKind;
                let error_msg = match err.kind() {
                    ErrorKind::ExpiredSignature => "Token expired",
                    ErrorKind::InvalidToken => "Invalid token",
                    ErrorKind::InvalidSignature => "Invalid signature",
                    ErrorKind::InvalidAlgorithm => "Unexpected signing algorithm",
                    _ => "Token validation failed",
                };
                TokenValidationResult::invalid(error_msg)
            }
        }
    }

    /// Resolve the owner id from an Authorization header value
    pub fn authenticate(&self, auth_header: Option<&str>) -> Result<String, RelayError> {
        let token = extract_token_from_header(auth_header)
            .ok_or_else(|| RelayError::Unauthorized("Missing bearer token".into()))?;

        let result = self.verify_token(token);
        match result.claims {
            Some(claims) if result.valid => Ok(claims.sub),
            _ => Err(RelayError::Unauthorized(
                result.error.unwrap_or_else(|| "Invalid token".into()),
            )),
        }
    }
}

/// Extract token from Authorization header.
/// Supports "Bearer <token>" format and raw tokens.
pub fn extract_token_from_header(auth_header: Option<&str>) -> Option<&str> {
    let header = auth_header?;

    if let Some(token) = header.strip_prefix("Bearer ") {
        let token = token.trim();
        if !token.is_empty() {
            return Some(token);
        }
    }

    if !header.contains(' ') {
        let token = header.trim();
        if !token.is_empty() {
            return Some(token);
        }
    }

    None
}
