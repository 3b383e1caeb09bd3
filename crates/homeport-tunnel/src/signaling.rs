//! Typed client for the signaling WebSocket.
//!
//! Wraps a tokio-tungstenite socket to `/signal`, serializing outgoing
//! [`SignalMessage`]s and parsing incoming ones. The control channel always
//! dials the signaling service directly; it is never tunneled.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use homeport_proto::SignalMessage;

use crate::error::TunnelError;

/// How long to wait for the service's `connected` confirmation.
const CONNECT_CONFIRM_TIMEOUT: Duration = Duration::from_secs(10);

/// A live signaling session.
pub struct SignalingClient {
    outbound: mpsc::Sender<SignalMessage>,
    open: Arc<AtomicBool>,
    close_tx: watch::Sender<bool>,
    device_id: String,
}

impl SignalingClient {
    /// Connect to `{signal_url}?token=&device_id=` and wait for the
    /// `connected` confirmation. Returns the client and the channel of
    /// subsequent incoming messages.
    pub async fn connect(
        signal_url: &str,
        device_id: &str,
        token: &str,
    ) -> Result<(Self, mpsc::Receiver<SignalMessage>), TunnelError> {
        let url = format!("{signal_url}?token={token}&device_id={device_id}");
        let (socket, _) = connect_async(&url)
            .await
            .map_err(|e| TunnelError::Signaling(e.to_string()))?;

        let (mut sink, mut stream) = socket.split();

        // The service speaks first.
        let confirmation = tokio::time::timeout(CONNECT_CONFIRM_TIMEOUT, async {
            while let Some(Ok(msg)) = stream.next().await {
                if let Message::Text(text) = msg {
                    return serde_json::from_str::<SignalMessage>(&text).ok();
                }
            }
            None
        })
        .await
        .map_err(|_| TunnelError::Signaling("No connected confirmation".into()))?
        .ok_or_else(|| TunnelError::Signaling("Signaling socket closed during connect".into()))?;

        match confirmation {
            SignalMessage::Connected { .. } => {
                info!(device_id, "Signaling session confirmed");
            }
            other => {
                return Err(TunnelError::Signaling(format!(
                    "Unexpected first frame: {other:?}"
                )));
            }
        }

        let (outbound_tx, mut outbound_rx) = mpsc::channel::<SignalMessage>(64);
        let (inbound_tx, inbound_rx) = mpsc::channel::<SignalMessage>(64);
        let (close_tx, close_rx) = watch::channel(false);
        let open = Arc::new(AtomicBool::new(true));

        let writer_open = Arc::clone(&open);
        let mut writer_close = close_rx.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    msg = outbound_rx.recv() => {
                        match msg {
                            Some(msg) => {
                                let json = match serde_json::to_string(&msg) {
                                    Ok(json) => json,
                                    Err(e) => {
                                        warn!(error = %e, "Failed to serialize signaling message");
                                        continue;
                                    }
                                };
                                if sink.send(Message::Text(json)).await.is_err() {
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

        let reader_open = Arc::clone(&open);
        let mut reader_close = close_rx;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    msg = stream.next() => {
                        match msg {
                            Some(Ok(Message::Text(text))) => {
                                match serde_json::from_str::<SignalMessage>(&text) {
                                    Ok(parsed) => {
                                        if inbound_tx.send(parsed).await.is_err() {
                                            break;
                                        }
                                    }
                                    Err(e) => {
                                        warn!(error = %e, "Unparseable signaling frame");
                                    }
                                }
                            }
                            Some(Ok(Message::Ping(_) | Message::Pong(_))) => {}
                            Some(Ok(Message::Binary(_))) => {
                                debug!("Ignoring binary frame on signaling socket");
                            }
                            Some(Ok(Message::Close(_))) | Some(Err(_)) | None => {
                                warn!("Signaling socket closed");
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
            Self {
                outbound: outbound_tx,
                open,
                close_tx,
                device_id: device_id.to_string(),
            },
            inbound_rx,
        ))
    }

    /// Send a signaling message.
    pub async fn send(&self, msg: SignalMessage) -> Result<(), TunnelError> {
        if !self.is_open() {
            return Err(TunnelError::ConnectionClosed);
        }
        self.outbound
            .send(msg)
            .await
            .map_err(|_| TunnelError::ConnectionClosed)
    }

    /// Whether the signaling socket is live.
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    /// The device id this session authenticated as.
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    /// Close the signaling socket.
    pub async fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
        let _ = self.close_tx.send(true);
    }
}
