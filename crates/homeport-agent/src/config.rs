//! Agent configuration.

use homeport_tunnel::p2p::PeerConfig;
use homeport_tunnel::ReconnectPolicy;

/// Configuration for the host agent.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Signaling service base URL (e.g. "http://localhost:8000").
    pub signaling_url: String,

    /// Relay base URL used when signaling does not advertise one.
    pub relay_url: Option<String>,

    /// Account credentials for the signaling service.
    pub email: String,
    pub password: String,

    /// This agent's device id (host class).
    pub device_id: String,

    /// Device public key registered with the signaling service (opaque).
    pub pubkey: String,

    /// Base URL of the local HTTP service requests are proxied to.
    pub local_base_url: String,

    /// STUN configuration for answering peer connections.
    pub peer: PeerConfig,

    /// Reconnection policy for the signaling session.
    pub reconnect: ReconnectPolicy,

    /// Cap on concurrent WebSocket sub-connections.
    pub max_ws_connections: usize,
}

impl AgentConfig {
    pub fn new(signaling_url: String, email: String, password: String, device_id: String) -> Self {
        Self {
            signaling_url,
            relay_url: None,
            email,
            password,
            device_id,
            pubkey: String::new(),
            local_base_url: "http://127.0.0.1:5142".into(),
            peer: PeerConfig::default(),
            reconnect: ReconnectPolicy::default(),
            max_ws_connections: 64,
        }
    }

    /// The `/signal` WebSocket URL derived from the HTTP base URL.
    pub fn signal_ws_url(&self) -> String {
        format!("{}/signal", http_to_ws(&self.signaling_url))
    }
}

/// Map an http(s) base URL onto its ws(s) counterpart.
pub fn http_to_ws(url: &str) -> String {
    if let Some(rest) = url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        url.to_string()
    }
}
