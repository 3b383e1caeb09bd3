//! WebSocket relay endpoint.
//!
//! `GET /relay/{session_id}?token=<T>` joins the named session. The first
//! party waits half-open for its peer (bounded by the session timeout); once
//! paired, binary frames are forwarded verbatim in both directions. Close of
//! either side closes the other and evicts the session.

use std::time::Instant;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::session::{AdmitError, PartySlot};
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct RelayQuery {
    pub token: String,
}

/// `GET /relay/{session_id}` — authenticate, reserve a slot, then upgrade.
pub async fn relay_ws(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Query(query): Query<RelayQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    // The relay validates the token but not device ownership; the session id
    // is opaque and owner-chosen.
    let claims = match state.jwt.validate(&query.token) {
        Ok(claims) => claims,
        Err(_) => {
            warn!(session_id, "Relay auth failed: invalid token");
            return StatusCode::UNAUTHORIZED.into_response();
        }
    };

    // Slot reservation is atomic with respect to concurrent admits; a full
    // session refuses the third endpoint before the upgrade happens.
    let slot = match state.manager.reserve(&session_id) {
        Ok(slot) => slot,
        Err(AdmitError::SessionFull) => {
            warn!(session_id, "Relay session full, refusing third endpoint");
            return StatusCode::CONFLICT.into_response();
        }
        Err(AdmitError::AtCapacity) => {
            return StatusCode::SERVICE_UNAVAILABLE.into_response();
        }
    };

    info!(
        session_id,
        user_id = claims.user_id,
        party = slot.index(),
        "Relay connection accepted"
    );

    ws.on_upgrade(move |socket| run_party(state, slot, socket))
}

async fn run_party(state: AppState, mut slot: PartySlot, socket: WebSocket) {
    let session = std::sync::Arc::clone(slot.session());
    let session_id = session.session_id.clone();
    let index = slot.index();
    let config = std::sync::Arc::clone(&state.config);

    let mut outbound = slot.bind(config.forward_queue_depth);
    let (mut sink, mut stream) = socket.split();

    // Half-open phase: the first party waits for its peer. `wait_for`
    // checks the current value first, so a peer that bound between our own
    // bind and this point is not missed.
    let mut paired = session.paired();
    let mut half_open_closed = session.closed();
    if !*paired.borrow() {
        // Equivalent to a single `wait_for` per watch, but written as
        // `changed()` + `borrow()` so no `watch::Ref` (which wraps a
        // non-`Send` `RwLockReadGuard`) is ever alive across the `.await`
        // points in this select, which `run_party`'s `Send` future bound
        // requires.
        let sleep = tokio::time::sleep(config.session_timeout);
        tokio::pin!(sleep);
        loop {
            tokio::select! {
                changed = paired.changed() => {
                    if changed.is_err() {
                        state.manager.remove(&session_id);
                        return;
                    }
                    if *paired.borrow() {
                        break;
                    }
                }
                changed = half_open_closed.changed() => {
                    if changed.is_ok() && *half_open_closed.borrow() {
                        let _ = sink.send(Message::Close(None)).await;
                        return;
                    }
                }
                () = &mut sleep => {
                    info!(session_id, "Half-open session timed out waiting for peer");
                    let _ = sink.send(Message::Close(None)).await;
                    state.manager.remove(&session_id);
                    return;
                }
                msg = stream.next() => {
                    // The lone endpoint went away (or broke protocol) before a
                    // peer arrived.
                    match msg {
                        Some(Ok(Message::Close(_))) | Some(Err(_)) | None => {
                            info!(session_id, "Lone endpoint left half-open session");
                            state.manager.remove(&session_id);
                            return;
                        }
                        Some(Ok(other)) => {
                            warn!(session_id, ?other, "Frame before pairing, closing");
                            state.manager.remove(&session_id);
                            return;
                        }
                    }
                }
            }
        }
    }

    // Open phase: forward until either side goes away.
    let mut heartbeat = tokio::time::interval(config.heartbeat_interval);
    heartbeat.tick().await; // Skip first immediate tick
    let mut last_pong = Instant::now();
    let mut closed = session.closed();

    loop {
        tokio::select! {
            frame = outbound.recv() => {
                match frame {
                    Some(data) => {
                        if sink.send(Message::Binary(data)).await.is_err() {
                            break;
                        }
                    }
                    // Peer task dropped its sender: session is over.
                    None => break,
                }
            }
            msg = stream.next() => {
                match msg {
                    Some(Ok(Message::Binary(data))) => {
                        if data.len() > config.max_frame_bytes {
                            warn!(
                                session_id,
                                len = data.len(),
                                "Oversize relay frame, closing session"
                            );
                            break;
                        }
                        // Saturated peer queues block here instead of
                        // buffering without bound.
                        if !session.forward(index, data).await {
                            break;
                        }
                    }
                    Some(Ok(Message::Text(_))) => {
                        debug!(session_id, "Ignoring text frame on relay socket");
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        if sink.send(Message::Pong(payload)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {
                        last_pong = Instant::now();
                    }
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                }
            }
            _ = heartbeat.tick() => {
                if last_pong.elapsed() > config.heartbeat_interval + config.heartbeat_timeout {
                    warn!(session_id, "Heartbeat timed out, closing session");
                    break;
                }
                if sink.send(Message::Ping(b"hp".to_vec())).await.is_err() {
                    break;
                }
            }
            _ = closed.changed() => {
                // Peer exit path closed the session.
                break;
            }
        }
    }

    let _ = sink.send(Message::Close(None)).await;
    state.manager.remove(&session_id);
    info!(session_id, party = index, "Relay party disconnected");
}
