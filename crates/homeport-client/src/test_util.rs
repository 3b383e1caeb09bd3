//! Channel-backed transport fake shared by the client tests.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use homeport_tunnel::{Transport, TunnelError};

/// A transport whose wire is a pair of channels.
pub(crate) struct MockTransport {
    open: AtomicBool,
    sent_tx: mpsc::UnboundedSender<Vec<u8>>,
}

impl MockTransport {
    /// Returns the transport, the sender feeding its inbound side, the
    /// receiver handed to the multiplexer, and the stream of frames the
    /// multiplexer sent.
    pub(crate) fn open() -> (
        Arc<Self>,
        mpsc::Sender<Vec<u8>>,
        mpsc::Receiver<Vec<u8>>,
        mpsc::UnboundedReceiver<Vec<u8>>,
    ) {
        let (inbound_tx, inbound_rx) = mpsc::channel(64);
        let (sent_tx, sent_rx) = mpsc::unbounded_channel();
        let transport = Arc::new(Self {
            open: AtomicBool::new(true),
            sent_tx,
        });
        (transport, inbound_tx, inbound_rx, sent_rx)
    }

    /// Simulate transport death.
    pub(crate) fn shut(&self) {
        self.open.store(false, Ordering::SeqCst);
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&self, frame: Vec<u8>) -> Result<(), TunnelError> {
        if !self.is_open() {
            return Err(TunnelError::ConnectionClosed);
        }
        self.sent_tx
            .send(frame)
            .map_err(|_| TunnelError::ConnectionClosed)
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        self.shut();
    }
}

/// Await the next frame the multiplexer wrote to the transport.
pub(crate) async fn next_sent(rx: &mut mpsc::UnboundedReceiver<Vec<u8>>) -> Vec<u8> {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for sent frame")
        .expect("transport sink closed")
}
