//! End-to-end relay fallback: signaling service, relay service, host agent,
//! and client endpoint wired together over real sockets. The client has no
//! peer-connection capability, so establishment goes connect-request →
//! connect-ack → relay pair, and HTTP/WebSocket traffic flows through the
//! relay tunnel.

use std::net::SocketAddr;
use std::time::Duration;

use homeport_agent::{AgentConfig, TunnelAgent};
use homeport_client::{
    ClientSocket, Connector, ConnectorConfig, ConnectorState, FetchError, ProxyRequest,
};
use homeport_core::auth::JwtManager;
use homeport_relay::config::RelayConfig;

const SECRET: &[u8] = b"e2e-shared-secret";
const EMAIL: &str = "owner@example.com";
const PASSWORD: &str = "hunter2hunter2";

async fn spawn_local_service() -> SocketAddr {
    use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
    use axum::routing::get;
    use axum::Router;

    async fn echo(mut socket: WebSocket) {
        while let Some(Ok(msg)) = socket.recv().await {
            let reply = match msg {
                Message::Text(text) => Message::Text(format!("echo:{text}")),
                Message::Binary(data) => Message::Binary(data),
                Message::Close(_) => break,
                _ => continue,
            };
            if socket.send(reply).await.is_err() {
                break;
            }
        }
    }

    let app = Router::new()
        .route(
            "/v1/health",
            get(|| async { axum::Json(serde_json::json!({ "status": "ok" })) }),
        )
        .route(
            "/slow",
            get(|| async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                "late"
            }),
        )
        .route(
            "/ws",
            get(|ws: WebSocketUpgrade| async move { ws.on_upgrade(echo) }),
        );

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

struct Stack {
    signaling_addr: SocketAddr,
    relay_addr: SocketAddr,
    local_addr: SocketAddr,
    signaling_state: homeport_signaling::AppState,
    token: String,
    _agent_shutdown: tokio::sync::watch::Sender<bool>,
}

async fn spawn_stack() -> Stack {
    let local_addr = spawn_local_service().await;

    // Relay first so signaling can advertise it.
    let relay_state =
        homeport_relay::AppState::new(JwtManager::new(SECRET, 3600), RelayConfig::default());
    let relay_listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let relay_addr = relay_listener.local_addr().unwrap();
    let relay_app = homeport_relay::router(relay_state);
    tokio::spawn(async move {
        axum::serve(relay_listener, relay_app).await.unwrap();
    });

    let db = homeport_signaling::storage::SignalingDatabase::open_in_memory()
        .await
        .unwrap();
    let signaling_state = homeport_signaling::AppState::new(
        db,
        JwtManager::new(SECRET, 3600),
        homeport_signaling::ServiceConfig {
            relay_url: Some(format!("ws://{relay_addr}")),
            cors_origins: Vec::new(),
        },
    );
    let signaling_listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let signaling_addr = signaling_listener.local_addr().unwrap();
    let signaling_app = homeport_signaling::router(signaling_state.clone());
    tokio::spawn(async move {
        axum::serve(signaling_listener, signaling_app).await.unwrap();
    });

    // One account owns every device in this test.
    let client = reqwest::Client::new();
    let resp = client
        .post(format!("http://{signaling_addr}/auth/register"))
        .json(&serde_json::json!({ "email": EMAIL, "password": PASSWORD }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: serde_json::Value = resp.json().await.unwrap();
    let token = body["access_token"].as_str().unwrap().to_string();

    for device_id in ["browser-A", "browser-C"] {
        let resp = client
            .post(format!("http://{signaling_addr}/devices/register"))
            .bearer_auth(&token)
            .json(&serde_json::json!({ "device_id": device_id, "pubkey": "pk" }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
    }

    // The agent authenticates and registers its own device.
    let mut agent_config = AgentConfig::new(
        format!("http://{signaling_addr}"),
        EMAIL.into(),
        PASSWORD.into(),
        "host-B".into(),
    );
    agent_config.local_base_url = format!("http://{local_addr}");

    let agent = TunnelAgent::new(agent_config);
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    tokio::spawn(async move {
        agent.run(shutdown_rx).await;
    });

    // Wait for the agent's signaling session.
    tokio::time::timeout(Duration::from_secs(10), async {
        while signaling_state.sessions.get("host-B").await.is_none() {
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    })
    .await
    .expect("agent never connected to signaling");

    Stack {
        signaling_addr,
        relay_addr,
        local_addr,
        signaling_state,
        token,
        _agent_shutdown: shutdown_tx,
    }
}

fn connector_config(stack: &Stack) -> ConnectorConfig {
    let mut config = ConnectorConfig::new(
        format!("ws://{}/signal", stack.signaling_addr),
        "browser-A".into(),
        "host-B".into(),
        stack.token.clone(),
    );
    config.relay_url = Some(format!("ws://{}", stack.relay_addr));
    // This platform advertises no peer-connection capability: straight to
    // the fallback edge.
    config.webrtc_available = false;
    config
}

#[tokio::test]
async fn relay_fallback_health_probe() {
    let stack = spawn_stack().await;
    let connector = Connector::new(connector_config(&stack));

    let tunnel = tokio::time::timeout(Duration::from_secs(15), connector.connect())
        .await
        .expect("connect timed out")
        .expect("connect failed");

    assert_eq!(tunnel.mode(), homeport_client::connector::TunnelMode::Relay);
    assert_eq!(*connector.state().borrow(), ConnectorState::RelayOpen);

    let response = tunnel
        .fetch(ProxyRequest::get("/v1/health"))
        .await
        .expect("fetch failed");
    assert_eq!(response.status, 200);
    let body: serde_json::Value = serde_json::from_str(&response.body).unwrap();
    assert_eq!(body["status"], "ok");

    // The pending table drained.
    assert_eq!(tunnel.mux().pending_count().await, 0);

    tunnel.close().await;
}

#[tokio::test]
async fn websocket_subconnection_echo() {
    let stack = spawn_stack().await;
    let connector = Connector::new(connector_config(&stack));
    let tunnel = tokio::time::timeout(Duration::from_secs(15), connector.connect())
        .await
        .unwrap()
        .unwrap();

    let factory = tunnel.websockets();
    let socket = factory
        .connect(&format!("ws://{}/ws", stack.local_addr))
        .await
        .unwrap();

    let mut socket = match socket {
        ClientSocket::Tunneled(socket) => socket,
        ClientSocket::Direct(_) => panic!("service URL must be tunneled"),
    };

    socket.send_text("ping").await.unwrap();
    match tokio::time::timeout(Duration::from_secs(5), socket.next_event())
        .await
        .expect("timed out waiting for echo")
    {
        Some(homeport_client::websocket::SocketEvent::Text(text)) => {
            assert_eq!(text, "echo:ping");
        }
        other => panic!("unexpected event: {other:?}"),
    }

    socket.send_binary(vec![1, 2, 3]).await.unwrap();
    match tokio::time::timeout(Duration::from_secs(5), socket.next_event())
        .await
        .unwrap()
    {
        Some(homeport_client::websocket::SocketEvent::Binary(data)) => {
            assert_eq!(data, vec![1, 2, 3]);
        }
        other => panic!("unexpected event: {other:?}"),
    }

    socket.close(1000, "done").await.unwrap();
    tunnel.close().await;
}

#[tokio::test]
async fn control_channel_not_tunneled() {
    let stack = spawn_stack().await;
    let connector = Connector::new(connector_config(&stack));
    let tunnel = tokio::time::timeout(Duration::from_secs(15), connector.connect())
        .await
        .unwrap()
        .unwrap();

    // A /signal URL gets a native socket, not a sub-connection. Use a
    // distinct registered device id so the connector's own session is not
    // superseded.
    let factory = tunnel.websockets();
    let url = format!(
        "ws://{}/signal?token={}&device_id=browser-C",
        stack.signaling_addr, stack.token
    );
    let socket = factory.connect(&url).await.unwrap();
    assert!(matches!(socket, ClientSocket::Direct(_)));

    // No sub-connection was created for it.
    assert_eq!(tunnel.mux().socket_count().await, 0);

    tunnel.close().await;
}

#[tokio::test]
async fn pending_request_fails_when_tunnel_closes() {
    let stack = spawn_stack().await;
    let connector = Connector::new(connector_config(&stack));
    let tunnel = tokio::time::timeout(Duration::from_secs(15), connector.connect())
        .await
        .unwrap()
        .unwrap();

    let mux = std::sync::Arc::clone(tunnel.mux());
    let pending = tokio::spawn(async move { mux.fetch(ProxyRequest::get("/slow")).await });

    // Let the request frame reach the host before tearing the tunnel down.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(tunnel.mux().pending_count().await, 1);

    tunnel.close().await;

    let result = tokio::time::timeout(Duration::from_secs(5), pending)
        .await
        .expect("pending request did not settle after close")
        .unwrap();
    assert!(matches!(result, Err(FetchError::ConnectionClosed)));
    assert_eq!(tunnel.mux().pending_count().await, 0);
}

#[tokio::test]
async fn relay_session_uses_deterministic_id() {
    let stack = spawn_stack().await;
    let config = connector_config(&stack);
    assert_eq!(config.relay_session_id(), "browser-A-host-B");

    let connector = Connector::new(config);
    let tunnel = tokio::time::timeout(Duration::from_secs(15), connector.connect())
        .await
        .unwrap()
        .unwrap();

    // Both endpoints landed in the same relay session; a third endpoint is
    // refused (the pair slots are taken).
    let url = format!(
        "ws://{}/relay/browser-A-host-B?token={}",
        stack.relay_addr, stack.token
    );
    assert!(tokio_tungstenite_connect(&url).await.is_err());

    // The signaling map still has both endpoint sessions.
    assert!(stack.signaling_state.sessions.get("host-B").await.is_some());
    assert!(stack
        .signaling_state
        .sessions
        .get("browser-A")
        .await
        .is_some());

    tunnel.close().await;
}

async fn tokio_tungstenite_connect(
    url: &str,
) -> Result<(), tokio_tungstenite::tungstenite::Error> {
    tokio_tungstenite::connect_async(url).await.map(|_| ())
}
