//! Homeport Signaling Service
//!
//! Authenticates users, registers devices, and routes WebRTC signaling and
//! connect-request control messages between endpoints of the same owner.

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;
use tracing::info;

use homeport_core::auth::JwtManager;
use homeport_signaling::storage::SignalingDatabase;
use homeport_signaling::{router, AppState, ServiceConfig};

#[derive(Parser, Debug)]
#[command(name = "homeport-signaling")]
#[command(version, about = "Homeport signaling service - auth, devices, WebRTC signaling")]
struct Args {
    /// Address to listen on.
    #[arg(long, default_value = "0.0.0.0:8000")]
    addr: SocketAddr,

    /// Path to SQLite database file.
    #[arg(long)]
    db_path: Option<PathBuf>,

    /// Shared JWT secret (must match the relay's secret).
    #[arg(long, env = "HOMEPORT_JWT_SECRET")]
    jwt_secret: String,

    /// Access token lifetime in seconds.
    #[arg(long, default_value_t = 86_400)]
    token_ttl_secs: i64,

    /// Relay URL advertised to endpoints (e.g. "wss://relay.example.com").
    #[arg(long, env = "HOMEPORT_RELAY_URL")]
    relay_url: Option<String>,

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

    homeport_core::tracing_init::init_tracing("homeport_signaling=info", args.log_json);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        addr = %args.addr,
        "Starting homeport-signaling"
    );

    let db = match &args.db_path {
        Some(path) => {
            info!(path = %path.display(), "Opening signaling database");
            SignalingDatabase::open(path).await?
        }
        None => {
            let default_path = default_db_path()?;
            info!(path = %default_path.display(), "Opening signaling database (default path)");
            SignalingDatabase::open(&default_path).await?
        }
    };

    let jwt = JwtManager::new(args.jwt_secret.as_bytes(), args.token_ttl_secs);
    let state = AppState::new(
        db,
        jwt,
        ServiceConfig {
            relay_url: args.relay_url,
            cors_origins: args.cors_origins,
        },
    );

    let listener = tokio::net::TcpListener::bind(args.addr).await?;
    info!(addr = %args.addr, "Signaling service ready");

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Received shutdown signal");
        })
        .await?;

    info!("Signaling service stopped");
    Ok(())
}

fn default_db_path() -> anyhow::Result<PathBuf> {
    let home =
        dirs::home_dir().ok_or_else(|| anyhow::anyhow!("Cannot determine home directory"))?;
    Ok(home.join(".homeport").join("signaling.db"))
}
