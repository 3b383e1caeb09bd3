//! Homeport Host Agent
//!
//! Long-lived daemon giving the owner's client endpoints tunneled access to
//! local HTTP and WebSocket services.

use clap::Parser;
use tracing::info;

use homeport_agent::{AgentConfig, TunnelAgent};
use homeport_proto::ids;
use homeport_tunnel::p2p::PeerConfig;

#[derive(Parser, Debug)]
#[command(name = "homeport-agent")]
#[command(version, about = "Homeport host agent - tunnels local services to your devices")]
struct Args {
    /// Signaling service base URL.
    #[arg(long, default_value = "http://localhost:8000")]
    signaling_url: String,

    /// Relay base URL fallback when signaling does not advertise one.
    #[arg(long, env = "HOMEPORT_RELAY_URL")]
    relay_url: Option<String>,

    /// Account email.
    #[arg(long, env = "HOMEPORT_EMAIL")]
    email: String,

    /// Account password.
    #[arg(long, env = "HOMEPORT_PASSWORD")]
    password: String,

    /// Device id; generated (host class) when omitted.
    #[arg(long, env = "HOMEPORT_DEVICE_ID")]
    device_id: Option<String>,

    /// Base URL of the local service to expose.
    #[arg(long, default_value = "http://127.0.0.1:5142")]
    local_base_url: String,

    /// STUN server URL; may be repeated.
    #[arg(long = "stun-server")]
    stun_servers: Vec<String>,

    /// Emit JSON log lines.
    #[arg(long)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    homeport_core::tracing_init::init_tracing("homeport_agent=info", args.log_json);

    let device_id = args
        .device_id
        .unwrap_or_else(ids::new_host_device_id);

    info!(
        version = env!("CARGO_PKG_VERSION"),
        device_id = %device_id,
        signaling_url = %args.signaling_url,
        local_base_url = %args.local_base_url,
        "Starting homeport-agent"
    );

    let mut config = AgentConfig::new(args.signaling_url, args.email, args.password, device_id);
    config.relay_url = args.relay_url;
    config.local_base_url = args.local_base_url;
    if !args.stun_servers.is_empty() {
        config.peer = PeerConfig {
            stun_servers: args.stun_servers,
        };
    }

    let agent = TunnelAgent::new(config);

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("Received shutdown signal");
        let _ = shutdown_tx.send(true);
    });

    agent.run(shutdown_rx).await;

    info!("Agent stopped");
    Ok(())
}
