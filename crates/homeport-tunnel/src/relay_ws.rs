//! Relay-backed transport: a WebSocket to the relay service.
//!
//! Binary frames pass through verbatim; the session id pins the two
//! endpoints together at the relay.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use crate::error::TunnelError;
use crate::transport::Transport;

/// Transport over a relay WebSocket.
pub struct RelayTransport {
    outbound: mpsc::Sender<Vec<u8>>,
    open: Arc<AtomicBool>,
    close_tx: watch::Sender<bool>,
}

impl RelayTransport {
    /// Dial `{relay_url}/relay/{session_id}?token=` and return the transport
    /// plus the inbound frame channel. The receiver closing signals
    /// transport death.
    pub async fn connect(
        relay_url: &str,
        session_id: &str,
        token: &str,
    ) -> Result<(Arc<Self>, mpsc::Receiver<Vec<u8>>), TunnelError> {
        let url = format!("{relay_url}/relay/{session_id}?token={token}");
        let (socket, _) = connect_async(&url)
            .await
            .map_err(|e| TunnelError::Connection(e.to_string()))?;

        info!(session_id, "Relay transport connected");

        let (mut sink, mut stream) = socket.split();
        let (outbound_tx, mut outbound_rx) = mpsc::channel::<Vec<u8>>(64);
        let (inbound_tx, inbound_rx) = mpsc::channel::<Vec<u8>>(64);
        let (close_tx, close_rx) = watch::channel(false);
        let open = Arc::new(AtomicBool::new(true));

        // Writer: drains the outbound queue into the socket.
        let writer_open = Arc::clone(&open);
        let mut writer_close = close_rx.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    frame = outbound_rx.recv() => {
                        match frame {
                            Some(data) => {
                                if sink.send(Message::Binary(data)).await.is_err() {
                                    break;
                                }
                            }
                            None => break,
                        }
                    }
                    _ = writer_close.changed() => {
                        let _ = sink.send(Message::Close(None)).await;
                        break;
                    }
                }
            }
            writer_open.store(false, Ordering::SeqCst);
        });

        // Reader: forwards binary frames inbound; dropping `inbound_tx` on
        // exit closes the receiver, which the multiplexer treats as
        // transport death.
        let reader_open = Arc::clone(&open);
        let mut reader_close = close_rx;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    msg = stream.next() => {
                        match msg {
                            Some(Ok(Message::Binary(data))) => {
                                if inbound_tx.send(data).await.is_err() {
                                    break;
                                }
                            }
                            Some(Ok(Message::Text(_))) => {
                                debug!("Ignoring text frame on relay transport");
                            }
                            Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
                            Some(Ok(Message::Close(_))) | Some(Err(_)) | None => {
                                warn!("Relay transport socket closed");
                                break;
                            }
                            Some(Ok(Message::Frame(_))) => {}
                        }
                    }
                    _ = reader_close.changed() => break,
                }
            }
            reader_open.store(false, Ordering::SeqCst);
        });

        Ok((
            Arc::new(Self {
                outbound: outbound_tx,
                open,
                close_tx,
            }),
            inbound_rx,
        ))
    }
}

#[async_trait]
impl Transport for RelayTransport {
    async fn send(&self, frame: Vec<u8>) -> Result<(), TunnelError> {
        if !self.is_open() {
            return Err(TunnelError::ConnectionClosed);
        }
        self.outbound
            .send(frame)
            .await
            .map_err(|_| TunnelError::ConnectionClosed)
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
        let _ = self.close_tx.send(true);
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;

    /// Minimal echo server standing in for a paired relay session.
    async fn spawn_echo_server() -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let ws = accept_async(stream).await.unwrap();
                    let (mut sink, mut stream) = ws.split();
                    while let Some(Ok(msg)) = stream.next().await {
                        if let Message::Binary(data) = msg {
                            if sink.send(Message::Binary(data)).await.is_err() {
                                break;
                            }
                        }
                    }
                });
            }
        });
        addr
    }

    #[tokio::test]
    async fn send_and_receive_frames() {
        let addr = spawn_echo_server().await;
        let (transport, mut inbound) =
            RelayTransport::connect(&format!("ws://{addr}"), "s1", "token")
                .await
                .unwrap();

        assert!(transport.is_open());

        transport.send(vec![1, 2, 3]).await.unwrap();
        assert_eq!(inbound.recv().await.unwrap(), vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn close_flips_state_and_ends_inbound() {
        let addr = spawn_echo_server().await;
        let (transport, mut inbound) =
            RelayTransport::connect(&format!("ws://{addr}"), "s1", "token")
                .await
                .unwrap();

        transport.close().await;
        assert!(!transport.is_open());
        assert!(transport.send(vec![1]).await.is_err());

        // The inbound channel drains to None once the reader stops.
        assert!(inbound.recv().await.is_none());
    }

    #[tokio::test]
    async fn connect_failure_surfaces() {
        let result = RelayTransport::connect("ws://127.0.0.1:1", "s1", "token").await;
        assert!(matches!(result, Err(TunnelError::Connection(_))));
    }
}
