//! Homeport Signaling Service Library
//!
//! Core functionality for the signaling service:
//! - SQLite storage for users and devices
//! - JWT authentication endpoints (register, login)
//! - Idempotent device registration
//! - WebSocket signaling with per-device endpoint sessions, supersession,
//!   and same-owner message routing

use std::sync::Arc;

use axum::http::HeaderValue;
use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};

use homeport_core::auth::JwtManager;

pub mod error;
pub mod routes;
pub mod session;
pub mod storage;
pub mod ws;

use session::EndpointSessions;
use storage::SignalingDatabase;

/// Runtime configuration shared by the handlers.
#[derive(Debug, Clone, Default)]
pub struct ServiceConfig {
    /// Relay URL advertised to endpoints in `connect-request-received`.
    pub relay_url: Option<String>,
    /// Allowed CORS origins; empty means any origin.
    pub cors_origins: Vec<String>,
}

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub db: SignalingDatabase,
    pub jwt: Arc<JwtManager>,
    pub sessions: EndpointSessions,
    pub config: Arc<ServiceConfig>,
}

impl AppState {
    pub fn new(db: SignalingDatabase, jwt: JwtManager, config: ServiceConfig) -> Self {
        Self {
            db,
            jwt: Arc::new(jwt),
            sessions: EndpointSessions::new(),
            config: Arc::new(config),
        }
    }
}

/// Build the service router.
pub fn router(state: AppState) -> Router {
    let cors = cors_layer(&state.config.cors_origins);

    Router::new()
        .route("/health", get(routes::health::health))
        .route("/auth/register", post(routes::auth::register))
        .route("/auth/login", post(routes::auth::login))
        .route("/devices/register", post(routes::devices::register_device))
        .route("/devices/", get(routes::devices::list_devices))
        .route("/signal", get(ws::signal_ws))
        .layer(cors)
        .with_state(state)
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
