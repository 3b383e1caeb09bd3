//! Device registration endpoints.

use axum::extract::State;
use axum::http::HeaderMap;
use axum::Json;
use serde::Deserialize;
use tracing::info;

use crate::error::ApiError;
use crate::routes::bearer_claims;
use crate::storage::models::Device;
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct DeviceRegisterRequest {
    pub device_id: String,
    pub pubkey: String,
}

/// `POST /devices/register` — idempotent device upsert for the caller.
///
/// Re-registration by the same owner succeeds and refreshes the pubkey;
/// a device id owned by another user is a conflict.
pub async fn register_device(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<DeviceRegisterRequest>,
) -> Result<Json<Device>, ApiError> {
    let claims = bearer_claims(&headers, &state.jwt)?;

    if req.device_id.is_empty() {
        return Err(ApiError::Validation("device_id must not be empty".into()));
    }

    if let Some(existing) = state.db.get_device(&req.device_id).await? {
        if existing.user_id != claims.user_id {
            return Err(ApiError::Conflict(
                "Device ID belongs to another user".into(),
            ));
        }
    }

    let device = state
        .db
        .upsert_device(&req.device_id, claims.user_id, &req.pubkey)
        .await?;

    info!(device_id = %device.id, user_id = claims.user_id, "Device registered");

    Ok(Json(device))
}

/// `GET /devices/` — list the caller's devices.
pub async fn list_devices(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Vec<Device>>, ApiError> {
    let claims = bearer_claims(&headers, &state.jwt)?;
    let devices = state.db.list_devices(claims.user_id).await?;
    Ok(Json(devices))
}
