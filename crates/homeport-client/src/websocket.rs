//! Tunneled WebSocket surface and the socket factory.
//!
//! Application code obtains WebSocket-shaped objects through [`WsFactory`]
//! instead of a global constructor swap. The factory tunnels every URL
//! except the signaling control channel (`/signal`), which always gets a
//! direct connection; tunneling it would deadlock the fallback path.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info};

use homeport_proto::frame::Headers;
use homeport_proto::{Frame, WsCloseFrame, WsDataFrame, WsOpcode};
use homeport_tunnel::Transport;

use crate::error::FetchError;
use crate::mux::Multiplexer;

/// Path of the signaling control channel, exempt from tunneling.
pub const SIGNAL_PATH: &str = "/signal";

/// Sub-connection lifecycle, following WebSocket semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketState {
    Connecting,
    Open,
    Closing,
    Closed,
}

/// Events delivered to the application.
#[derive(Debug)]
pub enum SocketEvent {
    Text(String),
    Binary(Vec<u8>),
    Close { code: u16, reason: String },
}

/// A WebSocket sub-connection multiplexed over the tunnel.
pub struct TunnelWebSocket {
    connection_id: u32,
    transport: Arc<dyn Transport>,
    sockets: Arc<Mutex<HashMap<u32, mpsc::Sender<SocketEvent>>>>,
    events: mpsc::Receiver<SocketEvent>,
    state: SocketState,
}

impl TunnelWebSocket {
    pub(crate) fn new(
        connection_id: u32,
        transport: Arc<dyn Transport>,
        sockets: Arc<Mutex<HashMap<u32, mpsc::Sender<SocketEvent>>>>,
        events: mpsc::Receiver<SocketEvent>,
    ) -> Self {
        Self {
            connection_id,
            transport,
            sockets,
            events,
            state: SocketState::Connecting,
        }
    }

    pub fn connection_id(&self) -> u32 {
        self.connection_id
    }

    pub fn state(&self) -> SocketState {
        self.state
    }

    /// Send a text message.
    pub async fn send_text(&self, text: &str) -> Result<(), FetchError> {
        self.send_data(WsOpcode::Text, text.as_bytes().to_vec())
            .await
    }

    /// Send a binary message.
    pub async fn send_binary(&self, payload: Vec<u8>) -> Result<(), FetchError> {
        self.send_data(WsOpcode::Binary, payload).await
    }

    async fn send_data(&self, opcode: WsOpcode, payload: Vec<u8>) -> Result<(), FetchError> {
        if matches!(self.state, SocketState::Closing | SocketState::Closed) {
            return Err(FetchError::ConnectionClosed);
        }
        let frame = Frame::WsData(WsDataFrame {
            connection_id: self.connection_id,
            opcode,
            payload,
        })
        .encode()?;
        self.transport
            .send(frame)
            .await
            .map_err(|_| FetchError::ConnectionClosed)
    }

    /// Close the sub-connection: sends WS_CLOSE and releases the local
    /// entry. The host closes its upstream socket in response and does not
    /// reply, so the local state settles at `Closed` immediately.
    pub async fn close(&mut self, code: u16, reason: &str) -> Result<(), FetchError> {
        if matches!(self.state, SocketState::Closing | SocketState::Closed) {
            return Ok(());
        }
        self.state = SocketState::Closing;

        let frame = Frame::WsClose(WsCloseFrame {
            connection_id: self.connection_id,
            close_code: code,
            reason: reason.to_string(),
        })
        .encode()?;
        let sent = self.transport.send(frame).await;

        self.sockets.lock().await.remove(&self.connection_id);
        self.state = SocketState::Closed;
        info!(connection_id = self.connection_id, code, "Sub-connection closed");

        sent.map_err(|_| FetchError::ConnectionClosed)
    }

    /// Receive the next event. `None` after close.
    pub async fn next_event(&mut self) -> Option<SocketEvent> {
        let event = self.events.recv().await;
        match &event {
            Some(SocketEvent::Close { .. }) => self.state = SocketState::Closed,
            // The host reports connect failure with WS_CLOSE; any data means
            // the sub-connection is live.
            Some(_) if self.state == SocketState::Connecting => self.state = SocketState::Open,
            _ => {}
        }
        event
    }
}

/// Where a WebSocket URL should be routed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketRoute {
    /// Native connection, bypassing the tunnel (control channel).
    Direct,
    /// Proxied through the tunnel as a sub-connection.
    Tunneled,
}

/// A socket handed out by the factory.
pub enum ClientSocket {
    Direct(WebSocketStream<MaybeTlsStream<TcpStream>>),
    Tunneled(TunnelWebSocket),
}

/// Factory for WebSocket-shaped objects.
///
/// The application asks the factory for sockets instead of constructing
/// them; the factory preserves the control-channel exclusion.
#[derive(Clone)]
pub struct WsFactory {
    mux: Arc<Multiplexer>,
}

impl WsFactory {
    pub fn new(mux: Arc<Multiplexer>) -> Self {
        Self { mux }
    }

    /// Classify a URL: the signaling path goes direct, everything else is
    /// tunneled.
    pub fn route(url: &str) -> SocketRoute {
        if url_path(url) == SIGNAL_PATH {
            SocketRoute::Direct
        } else {
            SocketRoute::Tunneled
        }
    }

    /// Open a socket for the URL, honoring the routing rule.
    pub async fn connect(&self, url: &str) -> Result<ClientSocket, FetchError> {
        self.connect_with_headers(url, Headers::new()).await
    }

    /// Open a socket with extra headers (tunneled connections only; direct
    /// connections carry their parameters in the URL).
    pub async fn connect_with_headers(
        &self,
        url: &str,
        headers: Headers,
    ) -> Result<ClientSocket, FetchError> {
        match Self::route(url) {
            SocketRoute::Direct => {
                debug!(url, "Control channel URL, connecting directly");
                let (socket, _) = connect_async(url)
                    .await
                    .map_err(|e| FetchError::Direct(e.to_string()))?;
                Ok(ClientSocket::Direct(socket))
            }
            SocketRoute::Tunneled => {
                let socket = self.mux.open_websocket(url, headers).await?;
                Ok(ClientSocket::Tunneled(socket))
            }
        }
    }
}

/// The path component of a WebSocket URL, without the query string.
fn url_path(url: &str) -> &str {
    let without_scheme = url.split_once("://").map_or(url, |(_, rest)| rest);
    let path_and_query = match without_scheme.find('/') {
        Some(index) => &without_scheme[index..],
        None => "/",
    };
    path_and_query
        .split_once('?')
        .map_or(path_and_query, |(path, _)| path)
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::mux::DEFAULT_FETCH_TIMEOUT;
    use crate::test_util::{next_sent, MockTransport};
    use futures_util::{SinkExt, StreamExt};
    use tokio_tungstenite::accept_async;
    use tokio_tungstenite::tungstenite::Message;

    #[test]
    fn control_channel_urls_go_direct() {
        assert_eq!(
            WsFactory::route("ws://signal.example/signal?token=abc&device_id=d1"),
            SocketRoute::Direct
        );
        assert_eq!(
            WsFactory::route("wss://signal.example/signal"),
            SocketRoute::Direct
        );
    }

    #[test]
    fn service_urls_are_tunneled() {
        assert_eq!(
            WsFactory::route("ws://localhost:3000/ws"),
            SocketRoute::Tunneled
        );
        assert_eq!(
            WsFactory::route("ws://localhost:3000/signal/nested"),
            SocketRoute::Tunneled
        );
        assert_eq!(WsFactory::route("ws://localhost:3000"), SocketRoute::Tunneled);
    }

    #[test]
    fn url_path_extraction() {
        assert_eq!(url_path("ws://h/signal?x=1"), "/signal");
        assert_eq!(url_path("ws://h:8000/a/b?c"), "/a/b");
        assert_eq!(url_path("ws://h"), "/");
    }

    #[tokio::test]
    async fn tunneled_connect_sends_ws_connect() {
        let (transport, _inbound_tx, inbound_rx, mut sent_rx) = MockTransport::open();
        let mux = Multiplexer::new(transport, inbound_rx, DEFAULT_FETCH_TIMEOUT);
        let factory = WsFactory::new(Arc::clone(&mux));

        let socket = factory.connect("ws://localhost:3000/ws").await.unwrap();
        match socket {
            ClientSocket::Tunneled(socket) => {
                assert_eq!(socket.connection_id(), 1);
                assert_eq!(socket.state(), SocketState::Connecting);
            }
            ClientSocket::Direct(_) => panic!("expected tunneled socket"),
        }

        match Frame::decode(&next_sent(&mut sent_rx).await).unwrap() {
            Frame::WsConnect(frame) => {
                assert_eq!(frame.connection_id, 1);
                assert_eq!(frame.url, "ws://localhost:3000/ws");
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[tokio::test]
    async fn direct_connect_bypasses_tunnel() {
        // A bare WebSocket server standing in for the signaling service.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut ws = accept_async(stream).await.unwrap();
                    let _ = ws.send(Message::Text("{\"type\":\"connected\"}".into())).await;
                });
            }
        });

        let (transport, _inbound_tx, inbound_rx, mut sent_rx) = MockTransport::open();
        let mux = Multiplexer::new(transport, inbound_rx, DEFAULT_FETCH_TIMEOUT);
        let factory = WsFactory::new(Arc::clone(&mux));

        let socket = factory
            .connect(&format!("ws://{addr}/signal?token=t&device_id=d"))
            .await
            .unwrap();
        match socket {
            ClientSocket::Direct(mut ws) => {
                // It's a real socket talking to the real server.
                let msg = ws.next().await.unwrap().unwrap();
                assert!(matches!(msg, Message::Text(_)));
            }
            ClientSocket::Tunneled(_) => panic!("expected direct socket"),
        }

        // No WS_CONNECT went over the tunnel.
        assert!(sent_rx.try_recv().is_err());
        assert_eq!(mux.socket_count().await, 0);
    }

    #[tokio::test]
    async fn close_sends_frame_and_releases_entry() {
        let (transport, _inbound_tx, inbound_rx, mut sent_rx) = MockTransport::open();
        let mux = Multiplexer::new(transport, inbound_rx, DEFAULT_FETCH_TIMEOUT);

        let mut socket = mux
            .open_websocket("ws://localhost:3000/ws", Headers::new())
            .await
            .unwrap();
        let _ = next_sent(&mut sent_rx).await; // WS_CONNECT

        socket.close(1000, "done").await.unwrap();
        assert_eq!(socket.state(), SocketState::Closed);
        assert_eq!(mux.socket_count().await, 0);

        match Frame::decode(&next_sent(&mut sent_rx).await).unwrap() {
            Frame::WsClose(frame) => {
                assert_eq!(frame.close_code, 1000);
                assert_eq!(frame.reason, "done");
            }
            other => panic!("unexpected frame: {other:?}"),
        }

        // Double close is a no-op.
        socket.close(1000, "again").await.unwrap();
    }

    #[tokio::test]
    async fn send_after_close_fails() {
        let (transport, _inbound_tx, inbound_rx, mut sent_rx) = MockTransport::open();
        let mux = Multiplexer::new(transport, inbound_rx, DEFAULT_FETCH_TIMEOUT);

        let mut socket = mux
            .open_websocket("ws://localhost:3000/ws", Headers::new())
            .await
            .unwrap();
        let _ = next_sent(&mut sent_rx).await;

        socket.close(1000, "").await.unwrap();
        assert!(matches!(
            socket.send_text("late").await,
            Err(FetchError::ConnectionClosed)
        ));
    }
}
