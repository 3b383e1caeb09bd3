//! Homeport Tunnel Transport Library
//!
//! The ordered byte pipe between the two endpoints, behind one interface:
//! - [`transport::Transport`]: send/is_open/close plus an inbound frame
//!   channel handed out at connect time
//! - [`relay_ws::RelayTransport`]: WebSocket to the relay service
//! - [`p2p::PeerTransport`]: WebRTC data channel (label `"http-proxy"`)
//! - [`signaling::SignalingClient`]: typed messages over the `/signal` socket
//! - [`backoff::ReconnectPolicy`]: exponential backoff for re-establishment

pub mod backoff;
pub mod error;
pub mod p2p;
pub mod relay_ws;
pub mod signaling;
pub mod transport;

pub use backoff::ReconnectPolicy;
pub use error::TunnelError;
pub use transport::Transport;
