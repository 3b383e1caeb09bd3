//! WebSocket signaling endpoint.
//!
//! `GET /signal?token=<T>&device_id=<D>` upgrades to a persistent signaling
//! session. Routed messages are delivered to the target device's live
//! session after the ownership check, rewritten so the receiver sees the
//! sender's identity; the sender gets an `ack` or `error` reply per message.

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use homeport_proto::{SignalMessage, SIGNAL_MESSAGE_MAX_BYTES};

use crate::session::Outbound;
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct SignalQuery {
    pub token: String,
    pub device_id: String,
}

/// `GET /signal` — authenticate, then upgrade to a signaling session.
pub async fn signal_ws(
    State(state): State<AppState>,
    Query(query): Query<SignalQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    // Token must be valid and the device must belong to the token's user;
    // any failure refuses the upgrade.
    let claims = match state.jwt.validate(&query.token) {
        Ok(claims) => claims,
        Err(_) => {
            warn!(device_id = %query.device_id, "Signaling auth failed: invalid token");
            return StatusCode::UNAUTHORIZED.into_response();
        }
    };

    let device = match state.db.get_device(&query.device_id).await {
        Ok(Some(device)) => device,
        Ok(None) => {
            warn!(device_id = %query.device_id, "Signaling auth failed: unknown device");
            return StatusCode::FORBIDDEN.into_response();
        }
        Err(e) => {
            warn!(error = %e, "Signaling auth failed: database error");
            return StatusCode::SERVICE_UNAVAILABLE.into_response();
        }
    };

    if device.user_id != claims.user_id {
        warn!(
            device_id = %query.device_id,
            user_id = claims.user_id,
            "Signaling auth failed: device owned by another user"
        );
        return StatusCode::FORBIDDEN.into_response();
    }

    let device_id = query.device_id;
    let user_id = claims.user_id;
    ws.on_upgrade(move |socket| handle_socket(state, socket, device_id, user_id))
}

async fn handle_socket(state: AppState, socket: WebSocket, device_id: String, user_id: i64) {
    let (mut sink, mut stream) = socket.split();
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<Outbound>(64);

    // Insert (superseding any prior session) before the connected frame so
    // the map invariant holds from the first observable moment.
    let token = state
        .sessions
        .insert(&device_id, user_id, outbound_tx.clone())
        .await;

    let connected = SignalMessage::Connected {
        device_id: device_id.clone(),
        message: "Connected to signaling service".into(),
    };
    if outbound_tx
        .send(Outbound::Message(connected))
        .await
        .is_err()
    {
        state.sessions.remove_if(&device_id, token).await;
        return;
    }

    // Writer task: drains the outbound queue into the socket. A `Close`
    // event (supersession) sends the close frame and stops the task.
    let writer_device_id = device_id.clone();
    let writer = tokio::spawn(async move {
        while let Some(event) = outbound_rx.recv().await {
            match event {
                Outbound::Message(msg) => {
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
                Outbound::Close { code, reason } => {
                    debug!(device_id = %writer_device_id, reason, "Closing signaling socket");
                    let _ = sink
                        .send(Message::Close(Some(CloseFrame {
                            code,
                            reason: reason.into(),
                        })))
                        .await;
                    break;
                }
            }
        }
    });

    // Read loop: text JSON frames only.
    while let Some(Ok(msg)) = stream.next().await {
        match msg {
            Message::Text(text) => {
                if text.len() > SIGNAL_MESSAGE_MAX_BYTES {
                    warn!(device_id = %device_id, len = text.len(), "Oversize signaling message");
                    break;
                }

                let reply = match serde_json::from_str::<SignalMessage>(&text) {
                    Ok(incoming) => route_message(&state, &device_id, user_id, incoming).await,
                    Err(e) => SignalMessage::Error {
                        message: format!("Invalid message format: {e}"),
                    },
                };

                if outbound_tx.send(Outbound::Message(reply)).await.is_err() {
                    break;
                }
            }
            Message::Binary(_) => {
                warn!(device_id = %device_id, "Ignoring binary frame on signaling socket");
            }
            Message::Close(_) => break,
            Message::Ping(_) | Message::Pong(_) => {}
        }
    }

    // Compare-and-swap removal: a superseded session must not evict its
    // successor.
    state.sessions.remove_if(&device_id, token).await;
    drop(outbound_tx);
    let _ = writer.await;
    info!(device_id = %device_id, "Signaling socket closed");
}

/// Route one client message; returns the reply for the sender.
async fn route_message(
    state: &AppState,
    sender_device_id: &str,
    sender_user_id: i64,
    msg: SignalMessage,
) -> SignalMessage {
    let Some(target) = msg.routed_target().map(str::to_string) else {
        return SignalMessage::Error {
            message: "Invalid message format: missing target_device_id".into(),
        };
    };

    let Some(session) = state.sessions.get(&target).await else {
        debug!(target = %target, "Routing failed: target not connected");
        return SignalMessage::Error {
            message: format!("Target device {target} not connected"),
        };
    };

    // Routing never crosses user boundaries.
    if session.user_id != sender_user_id {
        warn!(
            sender = %sender_device_id,
            target = %target,
            "Routing refused: target owned by another user"
        );
        return SignalMessage::Error {
            message: format!("Target device {target} not authorized"),
        };
    }

    let msg_type = signal_type_name(&msg);
    let relayed = msg.into_relayed(sender_device_id, state.config.relay_url.as_deref());

    if session
        .outbound
        .send(Outbound::Message(relayed))
        .await
        .is_err()
    {
        warn!(target = %target, "Routing failed: delivery error");
        return SignalMessage::Error {
            message: format!("Failed to deliver to {target}"),
        };
    }

    info!(
        msg_type,
        sender = %sender_device_id,
        target = %target,
        "Routed signaling message"
    );
    SignalMessage::Ack {
        message: format!("Message delivered to {target}"),
    }
}

fn signal_type_name(msg: &SignalMessage) -> &'static str {
    match msg {
        SignalMessage::Connected { .. } => "connected",
        SignalMessage::Offer { .. } => "offer",
        SignalMessage::Answer { .. } => "answer",
        SignalMessage::IceCandidate { .. } => "ice-candidate",
        SignalMessage::ConnectRequest { .. } => "connect-request",
        SignalMessage::ConnectRequestReceived { .. } => "connect-request-received",
        SignalMessage::ConnectAck { .. } => "connect-ack",
        SignalMessage::ConnectAckReceived { .. } => "connect-ack-received",
        SignalMessage::Ack { .. } => "ack",
        SignalMessage::Error { .. } => "error",
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::storage::SignalingDatabase;
    use crate::ServiceConfig;
    use homeport_core::auth::JwtManager;
    use homeport_proto::{SdpPayload, TransportKind};

    async fn test_state() -> AppState {
        let db = SignalingDatabase::open_in_memory().await.unwrap();
        AppState::new(
            db,
            JwtManager::new(b"test-secret", 3600),
            ServiceConfig {
                relay_url: Some("wss://relay.example".into()),
                cors_origins: Vec::new(),
            },
        )
    }

    fn offer(target: &str) -> SignalMessage {
        SignalMessage::Offer {
            target_device_id: Some(target.into()),
            sender_device_id: None,
            payload: SdpPayload {
                sdp: "v=0".into(),
                sdp_type: "offer".into(),
            },
        }
    }

    #[tokio::test]
    async fn routes_to_same_owner_target() {
        let state = test_state().await;
        let (tx, mut rx) = mpsc::channel(8);
        state.sessions.insert("host-b", 1, tx).await;

        let reply = route_message(&state, "browser-a", 1, offer("host-b")).await;
        assert!(matches!(reply, SignalMessage::Ack { .. }));

        match rx.recv().await.unwrap() {
            Outbound::Message(SignalMessage::Offer {
                sender_device_id,
                target_device_id,
                ..
            }) => {
                assert_eq!(sender_device_id.as_deref(), Some("browser-a"));
                assert_eq!(target_device_id, None);
            }
            other => panic!("unexpected delivery: {other:?}"),
        }
    }

    #[tokio::test]
    async fn cross_user_routing_refused() {
        let state = test_state().await;
        let (tx, mut rx) = mpsc::channel(8);
        // d2 is connected but owned by user 2.
        state.sessions.insert("d2", 2, tx).await;

        let reply = route_message(&state, "d1", 1, offer("d2")).await;
        assert!(matches!(reply, SignalMessage::Error { .. }));

        // Nothing was delivered to d2.
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn unconnected_target_errors() {
        let state = test_state().await;
        let reply = route_message(&state, "d1", 1, offer("d-missing")).await;
        match reply {
            SignalMessage::Error { message } => assert!(message.contains("not connected")),
            other => panic!("unexpected reply: {other:?}"),
        }
    }

    #[tokio::test]
    async fn connect_request_carries_relay_url() {
        let state = test_state().await;
        let (tx, mut rx) = mpsc::channel(8);
        state.sessions.insert("host-b", 1, tx).await;

        let reply = route_message(
            &state,
            "browser-a",
            1,
            SignalMessage::ConnectRequest {
                target_device_id: "host-b".into(),
                preferred_transport: TransportKind::Relay,
                relay_session_id: Some("browser-a-host-b".into()),
            },
        )
        .await;
        assert!(matches!(reply, SignalMessage::Ack { .. }));

        match rx.recv().await.unwrap() {
            Outbound::Message(SignalMessage::ConnectRequestReceived {
                from_device_id,
                relay_url,
                relay_session_id,
                ..
            }) => {
                assert_eq!(from_device_id, "browser-a");
                assert_eq!(relay_url.as_deref(), Some("wss://relay.example"));
                assert_eq!(relay_session_id.as_deref(), Some("browser-a-host-b"));
            }
            other => panic!("unexpected delivery: {other:?}"),
        }
    }

    #[tokio::test]
    async fn non_routed_client_message_errors() {
        let state = test_state().await;
        let reply = route_message(
            &state,
            "d1",
            1,
            SignalMessage::Ack {
                message: "spoofed".into(),
            },
        )
        .await;
        assert!(matches!(reply, SignalMessage::Error { .. }));
    }
}
