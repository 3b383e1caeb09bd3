//! Homeport Relay Service Library
//!
//! Accepts two authenticated endpoints into a session keyed by an opaque id
//! and forwards their binary frames verbatim until either side disconnects.
//! Used as the fallback transport when peer-to-peer establishment fails.

use std::sync::Arc;

use axum::http::HeaderValue;
use axum::routing::get;
use axum::Router;
use tower_http::cors::{Any, CorsLayer};

use homeport_core::auth::JwtManager;

pub mod config;
pub mod session;
pub mod ws;

use config::RelayConfig;
use session::SessionManager;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub jwt: Arc<JwtManager>,
    pub manager: SessionManager,
    pub config: Arc<RelayConfig>,
}

impl AppState {
    pub fn new(jwt: JwtManager, config: RelayConfig) -> Self {
        let config = Arc::new(config);
        Self {
            jwt: Arc::new(jwt),
            manager: SessionManager::new(Arc::clone(&config)),
            config,
        }
    }
}

/// Build the service router.
pub fn router(state: AppState) -> Router {
    let cors = cors_layer(&state.config.cors_origins);

    Router::new()
        .route("/health", get(health))
        .route("/relay/:session_id", get(ws::relay_ws))
        .layer(cors)
        .with_state(state)
}

async fn health() -> axum::Json<serde_json::Value> {
    axum::Json(serde_json::json!({ "status": "ok" }))
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let layer = CorsLayer::new().allow_methods(Any).allow_headers(Any);
    if origins.is_empty() {
        layer.allow_origin(Any)
    } else {
        let parsed: Vec<HeaderValue> = origins
            .iter()
            .filter_map(|o| o.parse::<HeaderValue>().ok())
            .collect();
        layer.allow_origin(parsed)
    }
}
