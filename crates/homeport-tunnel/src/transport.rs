//! The transport interface shared by both tunnel implementations.

use async_trait::async_trait;

use crate::error::TunnelError;

/// An ordered byte pipe carrying encoded tunnel frames.
///
/// Inbound frames are delivered through the `mpsc::Receiver<Vec<u8>>` the
/// concrete transport hands out at connect time; the receiver closing means
/// the transport died. Closing a transport from above must fail everything
/// still pending on it; the multiplexer owns that bookkeeping.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Queue one encoded frame for the peer.
    async fn send(&self, frame: Vec<u8>) -> Result<(), TunnelError>;

    /// Whether the pipe is currently usable.
    fn is_open(&self) -> bool;

    /// Tear the pipe down. Idempotent.
    async fn close(&self);
}
