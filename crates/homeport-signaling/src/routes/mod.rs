//! HTTP route handlers.

pub mod auth;
pub mod devices;
pub mod health;

use axum::http::header::AUTHORIZATION;
use axum::http::HeaderMap;

use homeport_core::auth::{Claims, JwtManager};

use crate::error::ApiError;

/// Extract and validate the bearer token from request headers.
pub fn bearer_claims(headers: &HeaderMap, jwt: &JwtManager) -> Result<Claims, ApiError> {
    let value = headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| ApiError::Unauthorized("Missing authorization header".into()))?;

    let token = value
        .strip_prefix("Bearer ")
        .ok_or_else(|| ApiError::Unauthorized("Malformed authorization header".into()))?;

    jwt.validate(token)
        .map_err(|_| ApiError::Unauthorized("Invalid or expired token".into()))
}
