//! Client endpoint error types.

use homeport_proto::FrameError;

/// Errors from the tunneled fetch surface.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    /// The pending correlation exceeded its deadline.
    #[error("request timed out")]
    RequestTimeout,

    /// The transport closed while the request was pending.
    #[error("transport closed")]
    ConnectionClosed,

    /// A direct (non-tunneled) connection could not be established.
    #[error("direct connection failed: {0}")]
    Direct(String),

    #[error("frame error: {0}")]
    Frame(#[from] FrameError),
}

/// Errors from transport establishment.
#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    #[error("signaling error: {0}")]
    Signaling(String),

    /// The connect-request was not acknowledged within the deadline.
    #[error("connect-ack timed out")]
    ConnectAckTimeout,

    /// The host acknowledged the fallback with a failure status.
    #[error("host reported fallback failure")]
    FallbackRefused,

    /// No relay URL is configured for the fallback path.
    #[error("no relay URL configured")]
    RelayUnavailable,

    #[error("relay connection failed: {0}")]
    RelayFailed(String),

    /// Every peer-connection attempt failed and no fallback succeeded.
    #[error("connection attempts exhausted")]
    AttemptsExhausted,

    #[error("connection closed")]
    Closed,
}
