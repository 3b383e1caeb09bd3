//! Tunnel transport error types.

/// Errors raised by transports and the signaling client.
#[derive(Debug, thiserror::Error)]
pub enum TunnelError {
    #[error("connection error: {0}")]
    Connection(String),

    #[error("signaling error: {0}")]
    Signaling(String),

    #[error("transport failed: {0}")]
    TransportFailed(String),

    #[error("transport closed")]
    ConnectionClosed,
}
