//! Request/response multiplexer above the tunnel transport.
//!
//! Owns the correlation table mapping request ids to one-shot response
//! channels and the sub-connection table routing WS_DATA/WS_CLOSE frames.
//! When the transport dies, every pending request fails with
//! `ConnectionClosed` and every sub-connection is closed; nothing stays
//! pending across transport death.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, info, warn};

use homeport_proto::frame::Headers;
use homeport_proto::{
    Frame, HttpRequestFrame, HttpResponseFrame, WsCloseFrame, WsConnectFrame, WsOpcode,
};
use homeport_tunnel::Transport;

use crate::error::FetchError;
use crate::websocket::{SocketEvent, TunnelWebSocket};

/// Default deadline for a pending request.
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(30);

/// A tunneled HTTP request.
#[derive(Debug, Clone)]
pub struct ProxyRequest {
    pub method: String,
    /// Path with query string.
    pub path: String,
    pub headers: Headers,
    /// UTF-8 text body; empty means no body.
    pub body: String,
    /// Per-request deadline override.
    pub timeout: Option<Duration>,
}

impl ProxyRequest {
    pub fn get(path: &str) -> Self {
        Self {
            method: "GET".into(),
            path: path.into(),
            headers: Headers::new(),
            body: String::new(),
            timeout: None,
        }
    }
}

/// A tunneled HTTP response.
#[derive(Debug, Clone)]
pub struct ProxyResponse {
    pub status: u16,
    pub headers: Headers,
    pub body: String,
}

/// The client-side frame multiplexer.
pub struct Multiplexer {
    transport: Arc<dyn Transport>,
    pending: Arc<Mutex<HashMap<u32, oneshot::Sender<HttpResponseFrame>>>>,
    sockets: Arc<Mutex<HashMap<u32, mpsc::Sender<SocketEvent>>>>,
    next_request_id: AtomicU32,
    next_connection_id: AtomicU32,
    default_timeout: Duration,
}

impl Multiplexer {
    /// Start the multiplexer over a connected transport. `inbound` is the
    /// transport's frame channel; its closure is transport death.
    pub fn new(
        transport: Arc<dyn Transport>,
        mut inbound: mpsc::Receiver<Vec<u8>>,
        default_timeout: Duration,
    ) -> Arc<Self> {
        let mux = Arc::new(Self {
            transport,
            pending: Arc::new(Mutex::new(HashMap::new())),
            sockets: Arc::new(Mutex::new(HashMap::new())),
            next_request_id: AtomicU32::new(1),
            next_connection_id: AtomicU32::new(1),
            default_timeout,
        });

        let pending = Arc::clone(&mux.pending);
        let sockets = Arc::clone(&mux.sockets);
        tokio::spawn(async move {
            while let Some(data) = inbound.recv().await {
                dispatch_frame(&pending, &sockets, &data).await;
            }

            // Transport death: fail everything still pending, close every
            // sub-connection. Dropping the oneshot senders wakes the
            // waiters with `ConnectionClosed`.
            let dropped = pending.lock().await.drain().count();
            if dropped > 0 {
                info!(dropped, "Transport closed with pending requests");
            }

            let mut sockets = sockets.lock().await;
            for (connection_id, events) in sockets.drain() {
                debug!(connection_id, "Closing sub-connection: transport died");
                let _ = events.try_send(SocketEvent::Close {
                    code: 1006,
                    reason: "transport closed".into(),
                });
            }
        });

        mux
    }

    /// Issue a tunneled HTTP request and await its response.
    pub async fn fetch(&self, request: ProxyRequest) -> Result<ProxyResponse, FetchError> {
        let request_id = self.next_request_id.fetch_add(1, Ordering::Relaxed);
        let deadline = request.timeout.unwrap_or(self.default_timeout);

        let frame = Frame::HttpRequest(HttpRequestFrame {
            request_id,
            method: request.method,
            path: request.path,
            headers: request.headers,
            body: request.body,
        })
        .encode()?;

        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(request_id, tx);

        if self.transport.send(frame).await.is_err() {
            self.pending.lock().await.remove(&request_id);
            return Err(FetchError::ConnectionClosed);
        }

        match tokio::time::timeout(deadline, rx).await {
            Ok(Ok(response)) => Ok(ProxyResponse {
                status: response.status_code,
                headers: response.headers,
                body: response.body,
            }),
            // Sender dropped: the transport died with this request pending.
            Ok(Err(_)) => Err(FetchError::ConnectionClosed),
            Err(_) => {
                self.pending.lock().await.remove(&request_id);
                warn!(request_id, "Request timed out");
                Err(FetchError::RequestTimeout)
            }
        }
    }

    /// Open a tunneled WebSocket sub-connection.
    pub async fn open_websocket(
        self: &Arc<Self>,
        url: &str,
        headers: Headers,
    ) -> Result<TunnelWebSocket, FetchError> {
        let connection_id = self.next_connection_id.fetch_add(1, Ordering::Relaxed);

        let frame = Frame::WsConnect(WsConnectFrame {
            connection_id,
            url: url.to_string(),
            headers,
        })
        .encode()?;

        let (events_tx, events_rx) = mpsc::channel(64);
        self.sockets.lock().await.insert(connection_id, events_tx);

        if self.transport.send(frame).await.is_err() {
            self.sockets.lock().await.remove(&connection_id);
            return Err(FetchError::ConnectionClosed);
        }

        info!(connection_id, url, "Sub-connection opened");
        Ok(TunnelWebSocket::new(
            connection_id,
            Arc::clone(&self.transport),
            Arc::clone(&self.sockets),
            events_rx,
        ))
    }

    /// Number of requests still awaiting a response.
    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }

    /// Number of live sub-connections.
    pub async fn socket_count(&self) -> usize {
        self.sockets.lock().await.len()
    }

    /// Whether the underlying transport is still usable.
    pub fn is_open(&self) -> bool {
        self.transport.is_open()
    }

    /// Close the transport; pending work fails with `ConnectionClosed`.
    pub async fn close(&self) {
        self.transport.close().await;
    }
}

async fn dispatch_frame(
    pending: &Mutex<HashMap<u32, oneshot::Sender<HttpResponseFrame>>>,
    sockets: &Mutex<HashMap<u32, mpsc::Sender<SocketEvent>>>,
    data: &[u8],
) {
    match Frame::decode(data) {
        Ok(Frame::HttpResponse(response)) => {
            let waiter = pending.lock().await.remove(&response.request_id);
            match waiter {
                Some(tx) => {
                    let request_id = response.request_id;
                    if tx.send(response).is_err() {
                        // Caller gave up (timeout) between removal and send.
                        debug!(request_id, "Response arrived for abandoned request");
                    }
                }
                None => {
                    warn!(
                        request_id = response.request_id,
                        "Response for unknown request id, dropping"
                    );
                }
            }
        }
        Ok(Frame::WsData(frame)) => {
            let events = sockets.lock().await.get(&frame.connection_id).cloned();
            match events {
                Some(events) => {
                    let event = match frame.opcode {
                        WsOpcode::Text => match String::from_utf8(frame.payload) {
                            Ok(text) => SocketEvent::Text(text),
                            Err(_) => {
                                warn!(
                                    connection_id = frame.connection_id,
                                    "Invalid UTF-8 in text frame, dropping"
                                );
                                return;
                            }
                        },
                        WsOpcode::Binary => SocketEvent::Binary(frame.payload),
                        other => {
                            debug!(
                                connection_id = frame.connection_id,
                                opcode = ?other,
                                "Ignoring control opcode"
                            );
                            return;
                        }
                    };
                    if events.send(event).await.is_err() {
                        debug!(
                            connection_id = frame.connection_id,
                            "Sub-connection dropped its events"
                        );
                    }
                }
                None => {
                    warn!(
                        connection_id = frame.connection_id,
                        "WS_DATA for unknown sub-connection, dropping"
                    );
                }
            }
        }
        Ok(Frame::WsClose(WsCloseFrame {
            connection_id,
            close_code,
            reason,
        })) => {
            let events = sockets.lock().await.remove(&connection_id);
            if let Some(events) = events {
                info!(connection_id, close_code, "Sub-connection closed by host");
                let _ = events
                    .send(SocketEvent::Close {
                        code: close_code,
                        reason,
                    })
                    .await;
            }
        }
        Ok(other) => {
            warn!(frame_type = ?other.frame_type(), "Unexpected frame on client endpoint");
        }
        Err(e) => {
            warn!(error = %e, "Undecodable frame, discarding");
        }
    }
}
