//! Authentication endpoints.

use axum::extract::State;
use axum::Json;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use homeport_core::auth::password;

use crate::error::ApiError;
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct CredentialsRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct TokenResponse {
    pub access_token: String,
}

/// `POST /auth/register` — create a user and return an access token.
pub async fn register(
    State(state): State<AppState>,
    Json(req): Json<CredentialsRequest>,
) -> Result<Json<TokenResponse>, ApiError> {
    if !req.email.contains('@') {
        return Err(ApiError::Validation("Invalid email address".into()));
    }
    if req.password.len() < 8 {
        return Err(ApiError::Validation(
            "Password must be at least 8 characters".into(),
        ));
    }

    if state.db.get_user_by_email(&req.email).await?.is_some() {
        return Err(ApiError::Conflict("Email already registered".into()));
    }

    let hash = password::hash_password(&req.password)
        .map_err(|e| ApiError::Internal(format!("Password hashing failed: {e}")))?;

    let user = state.db.create_user(&req.email, &hash).await?;

    let access_token = state
        .jwt
        .issue_access_token(user.id, &user.email)
        .map_err(|e| ApiError::Internal(format!("Token creation failed: {e}")))?;

    info!(user_id = user.id, email = %user.email, "User registered");

    Ok(Json(TokenResponse { access_token }))
}

/// `POST /auth/login` — verify credentials and return an access token.
pub async fn login(
    State(state): State<AppState>,
    Json(req): Json<CredentialsRequest>,
) -> Result<Json<TokenResponse>, ApiError> {
    let user = state
        .db
        .get_user_by_email(&req.email)
        .await?
        .ok_or_else(|| ApiError::Unauthorized("Incorrect email or password".into()))?;

    let valid = password::verify_password(&req.password, &user.password_hash)
        .map_err(|e| ApiError::Internal(format!("Password verification failed: {e}")))?;

    if !valid {
        warn!(email = %req.email, "Failed login attempt");
        return Err(ApiError::Unauthorized("Incorrect email or password".into()));
    }

    let access_token = state
        .jwt
        .issue_access_token(user.id, &user.email)
        .map_err(|e| ApiError::Internal(format!("Token creation failed: {e}")))?;

    info!(user_id = user.id, email = %user.email, "User logged in");

    Ok(Json(TokenResponse { access_token }))
}
