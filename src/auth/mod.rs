//! Authentication for the archive HTTP routes
//!
//! Bearer JWTs minted by the auth service identify the archive owner; every
//! `/archives` route is scoped to the `sub` claim.

pub mod jwt;

pub use jwt::{extract_token_from_header, Claims, JwtValidator, TokenValidationResult, DEV_SECRET};
