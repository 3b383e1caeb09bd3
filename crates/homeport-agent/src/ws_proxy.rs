//! WebSocket proxy: drives outbound sub-connections to local services.
//!
//! WS_CONNECT opens an outbound socket to the frame's URL rewritten against
//! the local base; WS_DATA forwards payloads by opcode; WS_CLOSE closes the
//! upstream socket. Upstream traffic flows back as WS_DATA/WS_CLOSE frames.
//! Any connect or relay error surfaces as WS_CLOSE code 1006.

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::{HeaderName, HeaderValue};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

use homeport_proto::{Frame, WsCloseFrame, WsConnectFrame, WsDataFrame, WsOpcode};

use crate::config::http_to_ws;

/// Abnormal closure, sent when a sub-connection fails.
const CLOSE_ABNORMAL: u16 = 1006;

/// Sent when the sub-connection cap is reached.
const CLOSE_TRY_AGAIN_LATER: u16 = 1013;

/// Request headers owned by the WebSocket handshake itself.
const RESERVED_HEADERS: &[&str] = &[
    "host",
    "connection",
    "upgrade",
    "sec-websocket-key",
    "sec-websocket-version",
    "sec-websocket-extensions",
    "sec-websocket-protocol",
];

enum UpstreamCommand {
    Send(Message),
    Close { code: u16, reason: String },
}

/// Tracks live sub-connections by connection id.
pub struct WsProxy {
    base_url: String,
    outbound: mpsc::Sender<Vec<u8>>,
    connections: Arc<Mutex<HashMap<u32, mpsc::Sender<UpstreamCommand>>>>,
    max_connections: usize,
}

impl WsProxy {
    /// `outbound` carries encoded frames back toward the client endpoint.
    pub fn new(base_url: &str, outbound: mpsc::Sender<Vec<u8>>, max_connections: usize) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            outbound,
            connections: Arc::new(Mutex::new(HashMap::new())),
            max_connections,
        }
    }

    /// Handle WS_CONNECT: open the upstream socket and start relaying.
    pub async fn handle_connect(&self, frame: WsConnectFrame) {
        let connection_id = frame.connection_id;

        {
            let connections = self.connections.lock().await;
            if connections.len() >= self.max_connections {
                warn!(connection_id, "Sub-connection cap reached");
                self.send_close(connection_id, CLOSE_TRY_AGAIN_LATER, "too many sub-connections")
                    .await;
                return;
            }
        }

        // Rewrite the requested URL against the local base, keeping
        // path and query.
        let target = format!(
            "{}{}",
            http_to_ws(&self.base_url),
            path_and_query(&frame.url)
        );
        info!(connection_id, target = %target, "WebSocket sub-connection connecting");

        let mut request = match target.clone().into_client_request() {
            Ok(request) => request,
            Err(e) => {
                self.send_close(connection_id, CLOSE_ABNORMAL, &format!("Bad URL: {e}"))
                    .await;
                return;
            }
        };
        for (name, value) in &frame.headers {
            if RESERVED_HEADERS.contains(&name.to_ascii_lowercase().as_str()) {
                continue;
            }
            if let (Ok(name), Ok(value)) =
                (name.parse::<HeaderName>(), value.parse::<HeaderValue>())
            {
                request.headers_mut().insert(name, value);
            }
        }

        let socket = match connect_async(request).await {
            Ok((socket, _)) => socket,
            Err(e) => {
                warn!(connection_id, error = %e, "Sub-connection failed to connect");
                self.send_close(
                    connection_id,
                    CLOSE_ABNORMAL,
                    &format!("Connection failed: {e}"),
                )
                .await;
                return;
            }
        };

        let (command_tx, command_rx) = mpsc::channel::<UpstreamCommand>(64);
        self.connections
            .lock()
            .await
            .insert(connection_id, command_tx);

        let outbound = self.outbound.clone();
        let connections = Arc::clone(&self.connections);
        tokio::spawn(run_sub_connection(
            connection_id,
            socket,
            command_rx,
            outbound,
            connections,
        ));

        info!(connection_id, "WebSocket sub-connection established");
    }

    /// Handle WS_DATA: forward the payload upstream by opcode.
    pub async fn handle_data(&self, frame: WsDataFrame) {
        let connection_id = frame.connection_id;
        let sender = {
            let connections = self.connections.lock().await;
            connections.get(&connection_id).cloned()
        };
        let Some(sender) = sender else {
            warn!(connection_id, "WS_DATA for unknown sub-connection");
            return;
        };

        let message = match frame.opcode {
            WsOpcode::Text => match String::from_utf8(frame.payload) {
                Ok(text) => Message::Text(text),
                Err(_) => {
                    warn!(connection_id, "Dropping text frame with invalid UTF-8");
                    return;
                }
            },
            WsOpcode::Binary => Message::Binary(frame.payload),
            WsOpcode::Ping => Message::Ping(frame.payload),
            WsOpcode::Pong => Message::Pong(frame.payload),
            WsOpcode::Close | WsOpcode::Continuation => {
                debug!(connection_id, opcode = ?frame.opcode, "Ignoring control opcode in WS_DATA");
                return;
            }
        };

        if sender.send(UpstreamCommand::Send(message)).await.is_err() {
            warn!(connection_id, "Sub-connection task gone");
        }
    }

    /// Handle WS_CLOSE: close the upstream socket and drop the entry.
    pub async fn handle_close(&self, frame: WsCloseFrame) {
        let connection_id = frame.connection_id;
        info!(
            connection_id,
            code = frame.close_code,
            reason = %frame.reason,
            "WebSocket sub-connection close requested"
        );

        let sender = self.connections.lock().await.remove(&connection_id);
        if let Some(sender) = sender {
            let _ = sender
                .send(UpstreamCommand::Close {
                    code: frame.close_code,
                    reason: frame.reason,
                })
                .await;
        }
    }

    /// Close every sub-connection; used when the transport goes down so no
    /// zombies survive reconnection.
    pub async fn close_all(&self) {
        let mut connections = self.connections.lock().await;
        if !connections.is_empty() {
            info!(count = connections.len(), "Closing all sub-connections");
        }
        // Dropping the senders makes each task close its upstream socket.
        connections.clear();
    }

    /// Number of live sub-connections.
    pub async fn connection_count(&self) -> usize {
        self.connections.lock().await.len()
    }

    async fn send_close(&self, connection_id: u32, close_code: u16, reason: &str) {
        let frame = Frame::WsClose(WsCloseFrame {
            connection_id,
            close_code,
            reason: reason.to_string(),
        });
        match frame.encode() {
            Ok(encoded) => {
                let _ = self.outbound.send(encoded).await;
            }
            Err(e) => warn!(connection_id, error = %e, "Failed to encode WS_CLOSE"),
        }
    }
}

async fn run_sub_connection(
    connection_id: u32,
    socket: tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
    mut commands: mpsc::Receiver<UpstreamCommand>,
    outbound: mpsc::Sender<Vec<u8>>,
    connections: Arc<Mutex<HashMap<u32, mpsc::Sender<UpstreamCommand>>>>,
) {
    let (mut sink, mut stream) = socket.split();

    loop {
        tokio::select! {
            command = commands.recv() => {
                match command {
                    Some(UpstreamCommand::Send(message)) => {
                        if sink.send(message).await.is_err() {
                            send_ws_close(&outbound, connection_id, CLOSE_ABNORMAL, "upstream send failed").await;
                            break;
                        }
                    }
                    Some(UpstreamCommand::Close { code, reason }) => {
                        let _ = sink
                            .send(Message::Close(Some(CloseFrame {
                                code: CloseCode::from(code),
                                reason: reason.into(),
                            })))
                            .await;
                        break;
                    }
                    // Proxy dropped this connection (transport death).
                    None => {
                        let _ = sink.send(Message::Close(None)).await;
                        break;
                    }
                }
            }
            msg = stream.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        send_ws_data(&outbound, connection_id, WsOpcode::Text, text.into_bytes()).await;
                    }
                    Some(Ok(Message::Binary(payload))) => {
                        send_ws_data(&outbound, connection_id, WsOpcode::Binary, payload).await;
                    }
                    Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => {}
                    Some(Ok(Message::Close(frame))) => {
                        let (code, reason) = match frame {
                            Some(frame) => (u16::from(frame.code), frame.reason.to_string()),
                            None => (1000, String::new()),
                        };
                        send_ws_close(&outbound, connection_id, code, &reason).await;
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(connection_id, error = %e, "Sub-connection upstream error");
                        send_ws_close(&outbound, connection_id, CLOSE_ABNORMAL, "abnormal").await;
                        break;
                    }
                    None => {
                        send_ws_close(&outbound, connection_id, CLOSE_ABNORMAL, "abnormal").await;
                        break;
                    }
                }
            }
        }
    }

    connections.lock().await.remove(&connection_id);
    debug!(connection_id, "Sub-connection task finished");
}

async fn send_ws_data(
    outbound: &mpsc::Sender<Vec<u8>>,
    connection_id: u32,
    opcode: WsOpcode,
    payload: Vec<u8>,
) {
    let frame = Frame::WsData(WsDataFrame {
        connection_id,
        opcode,
        payload,
    });
    match frame.encode() {
        Ok(encoded) => {
            let _ = outbound.send(encoded).await;
        }
        Err(e) => warn!(connection_id, error = %e, "Failed to encode WS_DATA"),
    }
}

async fn send_ws_close(
    outbound: &mpsc::Sender<Vec<u8>>,
    connection_id: u32,
    close_code: u16,
    reason: &str,
) {
    let frame = Frame::WsClose(WsCloseFrame {
        connection_id,
        close_code,
        reason: reason.to_string(),
    });
    match frame.encode() {
        Ok(encoded) => {
            let _ = outbound.send(encoded).await;
        }
        Err(e) => warn!(connection_id, error = %e, "Failed to encode WS_CLOSE"),
    }
}

/// Path plus query of a URL, defaulting to `/`.
fn path_and_query(url: &str) -> &str {
    let without_scheme = url
        .split_once("://")
        .map_or(url, |(_, rest)| rest);
    match without_scheme.find('/') {
        Some(index) => &without_scheme[index..],
        None => "/",
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use axum::extract::ws::{Message as AxMessage, WebSocket, WebSocketUpgrade};
    use axum::routing::get;
    use axum::Router;
    use std::collections::BTreeMap;
    use std::time::Duration;

    async fn echo_socket(mut socket: WebSocket) {
        while let Some(Ok(msg)) = socket.recv().await {
            let reply = match msg {
                AxMessage::Text(text) => AxMessage::Text(format!("echo:{text}")),
                AxMessage::Binary(data) => AxMessage::Binary(data),
                AxMessage::Close(_) => break,
                _ => continue,
            };
            if socket.send(reply).await.is_err() {
                break;
            }
        }
    }

    async fn spawn_echo_service() -> std::net::SocketAddr {
        let app = Router::new().route(
            "/ws",
            get(|ws: WebSocketUpgrade| async move { ws.on_upgrade(echo_socket) }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }

    async fn next_frame(outbound: &mut mpsc::Receiver<Vec<u8>>) -> Frame {
        let encoded = tokio::time::timeout(Duration::from_secs(5), outbound.recv())
            .await
            .expect("timed out waiting for frame")
            .expect("outbound closed");
        Frame::decode(&encoded).unwrap()
    }

    fn connect_frame(connection_id: u32, addr: std::net::SocketAddr) -> WsConnectFrame {
        WsConnectFrame {
            connection_id,
            url: format!("ws://{addr}/ws"),
            headers: BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn connect_forward_and_receive() {
        let addr = spawn_echo_service().await;
        let (tx, mut outbound) = mpsc::channel(64);
        let proxy = WsProxy::new(&format!("http://{addr}"), tx, 8);

        proxy.handle_connect(connect_frame(1, addr)).await;
        assert_eq!(proxy.connection_count().await, 1);

        proxy
            .handle_data(WsDataFrame {
                connection_id: 1,
                opcode: WsOpcode::Text,
                payload: b"hi".to_vec(),
            })
            .await;

        match next_frame(&mut outbound).await {
            Frame::WsData(frame) => {
                assert_eq!(frame.connection_id, 1);
                assert_eq!(frame.opcode, WsOpcode::Text);
                assert_eq!(frame.payload, b"echo:hi");
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[tokio::test]
    async fn close_removes_connection() {
        let addr = spawn_echo_service().await;
        let (tx, _outbound) = mpsc::channel(64);
        let proxy = WsProxy::new(&format!("http://{addr}"), tx, 8);

        proxy.handle_connect(connect_frame(2, addr)).await;
        assert_eq!(proxy.connection_count().await, 1);

        proxy
            .handle_close(WsCloseFrame {
                connection_id: 2,
                close_code: 1000,
                reason: "done".into(),
            })
            .await;
        assert_eq!(proxy.connection_count().await, 0);
    }

    #[tokio::test]
    async fn failed_connect_reports_1006() {
        let (tx, mut outbound) = mpsc::channel(64);
        // Nothing listens on port 1.
        let proxy = WsProxy::new("http://127.0.0.1:1", tx, 8);

        proxy
            .handle_connect(WsConnectFrame {
                connection_id: 3,
                url: "ws://127.0.0.1:1/ws".into(),
                headers: BTreeMap::new(),
            })
            .await;

        match next_frame(&mut outbound).await {
            Frame::WsClose(frame) => {
                assert_eq!(frame.connection_id, 3);
                assert_eq!(frame.close_code, 1006);
            }
            other => panic!("unexpected frame: {other:?}"),
        }
        assert_eq!(proxy.connection_count().await, 0);
    }

    #[tokio::test]
    async fn connection_cap_enforced() {
        let addr = spawn_echo_service().await;
        let (tx, mut outbound) = mpsc::channel(64);
        let proxy = WsProxy::new(&format!("http://{addr}"), tx, 1);

        proxy.handle_connect(connect_frame(1, addr)).await;
        proxy.handle_connect(connect_frame(2, addr)).await;

        match next_frame(&mut outbound).await {
            Frame::WsClose(frame) => {
                assert_eq!(frame.connection_id, 2);
                assert_eq!(frame.close_code, 1013);
            }
            other => panic!("unexpected frame: {other:?}"),
        }
        assert_eq!(proxy.connection_count().await, 1);
    }

    #[tokio::test]
    async fn data_for_unknown_connection_ignored() {
        let (tx, _outbound) = mpsc::channel(64);
        let proxy = WsProxy::new("http://127.0.0.1:1", tx, 8);

        proxy
            .handle_data(WsDataFrame {
                connection_id: 99,
                opcode: WsOpcode::Binary,
                payload: vec![1],
            })
            .await;
    }

    #[tokio::test]
    async fn close_all_clears_connections() {
        let addr = spawn_echo_service().await;
        let (tx, _outbound) = mpsc::channel(64);
        let proxy = WsProxy::new(&format!("http://{addr}"), tx, 8);

        proxy.handle_connect(connect_frame(1, addr)).await;
        proxy.handle_connect(connect_frame(2, addr)).await;
        assert_eq!(proxy.connection_count().await, 2);

        proxy.close_all().await;
        assert_eq!(proxy.connection_count().await, 0);
    }

    #[test]
    fn path_and_query_extraction() {
        assert_eq!(path_and_query("ws://h:3000/ws?room=1"), "/ws?room=1");
        assert_eq!(path_and_query("http://h/api/chat"), "/api/chat");
        assert_eq!(path_and_query("ws://host"), "/");
    }
}
