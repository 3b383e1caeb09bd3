//! Homeport Relay Service
//!
//! Forwards opaque binary frames between two endpoints pinned to a common
//! session id; the fallback transport when peer-to-peer media fails.

use std::net::SocketAddr;
use std::time::Duration;

use clap::Parser;
use tracing::info;

use homeport_core::auth::JwtManager;
use homeport_relay::config::RelayConfig;
use homeport_relay::{router, AppState};

#[derive(Parser, Debug)]
#[command(name = "homeport-relay")]
#[command(version, about = "Homeport relay service - paired WebSocket frame forwarding")]
struct Args {
    /// Address to listen on.
    #[arg(long, default_value = "0.0.0.0:8001")]
    addr: SocketAddr,

    /// Shared JWT secret (must match the signaling service's secret).
    #[arg(long, env = "HOMEPORT_JWT_SECRET")]
    jwt_secret: String,

    /// Heartbeat ping interval in seconds.
    #[arg(long, default_value_t = 20)]
    heartbeat_interval_secs: u64,

    /// Heartbeat timeout in seconds.
    #[arg(long, default_value_t = 10)]
    heartbeat_timeout_secs: u64,

    /// Half-open session timeout in seconds.
    #[arg(long, default_value_t = 300)]
    session_timeout_secs: u64,

    /// Maximum number of concurrent sessions.
    #[arg(long, default_value_t = 1024)]
    max_sessions: usize,

    /// Allowed CORS origins; may be repeated. Empty allows any origin.
    #[arg(long = "cors-origin")]
    cors_origins: Vec<String>,

    /// Emit JSON log lines.
    #[arg(long)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    homeport_core::tracing_init::init_tracing("homeport_relay=info", args.log_json);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        addr = %args.addr,
        "Starting homeport-relay"
    );

    let config = RelayConfig {
        heartbeat_interval: Duration::from_secs(args.heartbeat_interval_secs),
        heartbeat_timeout: Duration::from_secs(args.heartbeat_timeout_secs),
        session_timeout: Duration::from_secs(args.session_timeout_secs),
        max_sessions: args.max_sessions,
        cors_origins: args.cors_origins,
        ..Default::default()
    };

    let jwt = JwtManager::new(args.jwt_secret.as_bytes(), 86_400);
    let state = AppState::new(jwt, config);

    let listener = tokio::net::TcpListener::bind(args.addr).await?;
    info!(addr = %args.addr, "Relay service ready");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Received shutdown signal");
        })
        .await?;

    info!("Relay service stopped");
    Ok(())
}
