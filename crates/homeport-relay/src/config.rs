//! Relay service configuration.

use std::time::Duration;

use homeport_proto::RELAY_FRAME_MAX_BYTES;

/// Tunables for relay sessions.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Application-level ping interval.
    pub heartbeat_interval: Duration,

    /// How long after a missed pong the connection is considered dead.
    pub heartbeat_timeout: Duration,

    /// How long a half-open session waits for its second party.
    pub session_timeout: Duration,

    /// Maximum accepted binary frame size.
    pub max_frame_bytes: usize,

    /// Maximum number of concurrent sessions.
    pub max_sessions: usize,

    /// Per-party outbound queue depth; a saturated queue blocks the peer's
    /// read side rather than buffering without bound.
    pub forward_queue_depth: usize,

    /// Allowed CORS origins; empty means any origin.
    pub cors_origins: Vec<String>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(20),
            heartbeat_timeout: Duration::from_secs(10),
            session_timeout: Duration::from_secs(300),
            max_frame_bytes: RELAY_FRAME_MAX_BYTES,
            max_sessions: 1024,
            forward_queue_depth: 64,
            cors_origins: Vec::new(),
        }
    }
}
