//! The tunnel agent: host-side endpoint lifecycle.
//!
//! Authenticates with the signaling service, registers its device, then
//! holds the signaling session as the answering peer. Offers from the
//! client endpoint produce WebRTC answers; a relay `connect-request` makes
//! the agent dial the relay itself and acknowledge. The agent never counts
//! failures and never chooses fallback; it follows the client.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio::time::sleep;
use tracing::{debug, info, warn};

use homeport_proto::ids;
use homeport_proto::{ConnectAckStatus, SignalMessage, TransportKind};
use homeport_tunnel::p2p::{PeerEvents, PeerTransport};
use homeport_tunnel::relay_ws::RelayTransport;
use homeport_tunnel::signaling::SignalingClient;
use homeport_tunnel::Transport;

use crate::config::AgentConfig;
use crate::dispatch::FrameDispatcher;
use crate::http_proxy::HttpProxy;
use crate::ws_proxy::WsProxy;

/// Default timeout for proxied HTTP requests.
const HTTP_PROXY_TIMEOUT: Duration = Duration::from_secs(30);

/// Agent-side transport mode, reported in status snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportMode {
    P2pDirect,
    Relay,
    Offline,
}

/// Errors from the agent connection lifecycle.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("Registration error: {0}")]
    Registration(String),

    #[error("Signaling error: {0}")]
    Signaling(String),
}

/// The active transport, tagged so a stale pump cannot clear its successor.
struct ActiveTransport {
    generation: u64,
    transport: Arc<dyn Transport>,
}

/// Host-side tunnel endpoint.
pub struct TunnelAgent {
    config: AgentConfig,
    dispatcher: Arc<FrameDispatcher>,
    /// Frames produced by the WebSocket proxy, pumped into the transport.
    proxy_outbound: Mutex<Option<mpsc::Receiver<Vec<u8>>>>,
    current: Arc<Mutex<Option<ActiveTransport>>>,
    next_generation: std::sync::atomic::AtomicU64,
    mode: Arc<RwLock<TransportMode>>,
}

impl TunnelAgent {
    pub fn new(config: AgentConfig) -> Self {
        let (proxy_tx, proxy_rx) = mpsc::channel::<Vec<u8>>(128);
        let http = HttpProxy::new(&config.local_base_url, HTTP_PROXY_TIMEOUT);
        let ws = WsProxy::new(&config.local_base_url, proxy_tx, config.max_ws_connections);
        Self {
            config,
            dispatcher: Arc::new(FrameDispatcher::new(http, ws)),
            proxy_outbound: Mutex::new(Some(proxy_rx)),
            current: Arc::new(Mutex::new(None)),
            next_generation: std::sync::atomic::AtomicU64::new(0),
            mode: Arc::new(RwLock::new(TransportMode::Offline)),
        }
    }

    /// Current transport mode snapshot.
    pub async fn mode(&self) -> TransportMode {
        *self.mode.read().await
    }

    /// Run the agent with automatic signaling reconnection.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut proxy_rx = match self.proxy_outbound.lock().await.take() {
            Some(rx) => rx,
            None => {
                warn!("Agent already running");
                return;
            }
        };

        let mut attempt: u32 = 0;
        loop {
            if *shutdown.borrow() {
                info!("Agent shutting down");
                return;
            }

            match self.connect_and_run(&mut shutdown, &mut proxy_rx).await {
                Ok(()) => {
                    info!("Agent session closed cleanly");
                    self.teardown().await;
                    return;
                }
                Err(e) => {
                    self.teardown().await;

                    if !self.config.reconnect.should_retry(attempt) {
                        warn!(error = %e, attempt, "Max reconnect attempts reached");
                        return;
                    }

                    let delay = self.config.reconnect.delay_for_attempt(attempt);
                    warn!(error = %e, attempt, delay_ms = delay.as_millis(), "Reconnecting");

                    tokio::select! {
                        _ = sleep(delay) => {}
                        _ = shutdown.changed() => {
                            info!("Agent shutting down during reconnect wait");
                            return;
                        }
                    }

                    attempt = attempt.saturating_add(1);
                }
            }
        }
    }

    /// Authenticate, register, and hold one signaling session.
    async fn connect_and_run(
        &self,
        shutdown: &mut watch::Receiver<bool>,
        proxy_rx: &mut mpsc::Receiver<Vec<u8>>,
    ) -> Result<(), AgentError> {
        let token = self.authenticate().await?;
        self.register_device(&token).await?;

        let (signaling, mut inbound) = SignalingClient::connect(
            &self.config.signal_ws_url(),
            &self.config.device_id,
            &token,
        )
        .await
        .map_err(|e| AgentError::Signaling(e.to_string()))?;
        let signaling = Arc::new(signaling);

        info!(device_id = %self.config.device_id, "Agent connected to signaling");

        // The answering peer connection, kept for trickled ICE candidates.
        let mut peer: Option<Arc<PeerTransport>> = None;

        loop {
            tokio::select! {
                msg = inbound.recv() => {
                    match msg {
                        Some(msg) => {
                            self.handle_signal(&signaling, &token, msg, &mut peer).await;
                        }
                        None => {
                            return Err(AgentError::Signaling("Signaling session ended".into()));
                        }
                    }
                }
                frame = proxy_rx.recv() => {
                    // WebSocket proxy traffic toward the client endpoint.
                    if let Some(frame) = frame {
                        let transport = self
                            .current
                            .lock()
                            .await
                            .as_ref()
                            .map(|active| Arc::clone(&active.transport));
                        match transport {
                            Some(transport) => {
                                if let Err(e) = transport.send(frame).await {
                                    warn!(error = %e, "Dropped proxy frame: transport closed");
                                }
                            }
                            None => debug!("Dropped proxy frame: no active transport"),
                        }
                    }
                }
                _ = shutdown.changed() => {
                    signaling.close().await;
                    return Ok(());
                }
            }
        }
    }

    async fn handle_signal(
        &self,
        signaling: &Arc<SignalingClient>,
        token: &str,
        msg: SignalMessage,
        peer: &mut Option<Arc<PeerTransport>>,
    ) {
        match msg {
            SignalMessage::Offer {
                sender_device_id: Some(from),
                payload,
                ..
            } => {
                info!(from = %from, "Received SDP offer");

                // A new offer replaces whatever transport was active.
                self.teardown().await;

                let (transport, events, answer_sdp) =
                    match PeerTransport::answer(&self.config.peer, &payload.sdp).await {
                        Ok(parts) => parts,
                        Err(e) => {
                            warn!(error = %e, "Failed to answer offer");
                            return;
                        }
                    };

                let answer = SignalMessage::Answer {
                    target_device_id: Some(from.clone()),
                    sender_device_id: None,
                    payload: homeport_proto::SdpPayload {
                        sdp: answer_sdp,
                        sdp_type: "answer".into(),
                    },
                };
                if let Err(e) = signaling.send(answer).await {
                    warn!(error = %e, "Failed to send answer");
                    return;
                }

                self.install_peer(Arc::clone(&transport), events, signaling, &from)
                    .await;
                *peer = Some(transport);
            }
            SignalMessage::IceCandidate {
                sender_device_id,
                payload,
                ..
            } => {
                debug!(from = ?sender_device_id, "Received ICE candidate");
                match peer {
                    Some(peer) => {
                        if let Err(e) = peer.add_remote_candidate(payload).await {
                            warn!(error = %e, "Failed to add remote ICE candidate");
                        }
                    }
                    None => debug!("ICE candidate without a peer connection"),
                }
            }
            SignalMessage::ConnectRequestReceived {
                from_device_id,
                preferred_transport,
                relay_session_id,
                relay_url,
            } => {
                if preferred_transport != TransportKind::Relay {
                    // The client will follow up with an offer; nothing to do.
                    debug!(from = %from_device_id, "Connect request without relay preference");
                    return;
                }

                // Relay fallback chosen: the peer connection is done for.
                self.teardown().await;
                *peer = None;

                let session_id = relay_session_id.unwrap_or_else(|| {
                    ids::relay_session_id(&from_device_id, &self.config.device_id)
                });
                let relay_base = relay_url.or_else(|| self.config.relay_url.clone());

                let status = match relay_base {
                    Some(relay_base) => {
                        match self.open_relay(&relay_base, &session_id, token).await {
                            Ok(()) => ConnectAckStatus::Connected,
                            Err(e) => {
                                warn!(error = %e, "Relay fallback failed");
                                ConnectAckStatus::Failed
                            }
                        }
                    }
                    None => {
                        warn!("No relay URL advertised or configured");
                        ConnectAckStatus::Failed
                    }
                };

                let ack = SignalMessage::ConnectAck {
                    target_device_id: from_device_id,
                    transport: TransportKind::Relay,
                    relay_session_id: Some(session_id),
                    status,
                };
                if let Err(e) = signaling.send(ack).await {
                    warn!(error = %e, "Failed to send connect-ack");
                }
            }
            SignalMessage::Error { message } => {
                warn!(message = %message, "Signaling error");
            }
            SignalMessage::Ack { message } => {
                debug!(message = %message, "Signaling ack");
            }
            other => {
                debug!(msg = ?other, "Ignoring signaling message");
            }
        }
    }

    /// Wire an answered peer transport: forward local ICE candidates, pump
    /// inbound frames into the dispatcher, track mode via the channel state.
    async fn install_peer(
        &self,
        transport: Arc<PeerTransport>,
        events: PeerEvents,
        signaling: &Arc<SignalingClient>,
        peer_device_id: &str,
    ) {
        let PeerEvents {
            mut inbound,
            mut local_candidates,
            mut state,
            mut channel_open,
        } = events;

        // Trickle local candidates to the offering side.
        let candidate_signaling = Arc::clone(signaling);
        let target = peer_device_id.to_string();
        tokio::spawn(async move {
            while let Some(payload) = local_candidates.recv().await {
                let msg = SignalMessage::IceCandidate {
                    target_device_id: Some(target.clone()),
                    sender_device_id: None,
                    payload,
                };
                if candidate_signaling.send(msg).await.is_err() {
                    break;
                }
            }
        });

        let generation = self
            .next_generation
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        *self.current.lock().await = Some(ActiveTransport {
            generation,
            transport: transport.clone() as Arc<dyn Transport>,
        });

        let dispatcher = Arc::clone(&self.dispatcher);
        let current = Arc::clone(&self.current);
        let mode = Arc::clone(&self.mode);
        let pump_transport: Arc<dyn Transport> = transport;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    frame = inbound.recv() => {
                        match frame {
                            Some(data) => {
                                if let Some(response) = dispatcher.dispatch(&data).await {
                                    if let Err(e) = pump_transport.send(response).await {
                                        warn!(error = %e, "Failed to send response frame");
                                    }
                                }
                            }
                            None => break,
                        }
                    }
                    changed = channel_open.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        if *channel_open.borrow() {
                            info!("Data channel open, tunnel active (p2p-direct)");
                            *mode.write().await = TransportMode::P2pDirect;
                        } else {
                            info!("Data channel closed");
                            break;
                        }
                    }
                    changed = state.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let s = *state.borrow();
                        if matches!(
                            s,
                            homeport_tunnel::p2p::PeerState::Failed
                                | homeport_tunnel::p2p::PeerState::Closed
                        ) {
                            info!(state = ?s, "Peer connection ended");
                            break;
                        }
                    }
                }
            }

            // Only clear state if this transport is still the active one.
            let mut current = current.lock().await;
            if current.as_ref().map(|active| active.generation) == Some(generation) {
                *current = None;
                *mode.write().await = TransportMode::Offline;
            }
            drop(current);
            dispatcher.shutdown().await;
            pump_transport.close().await;
        });
    }

    /// Dial the relay and install it as the active transport.
    async fn open_relay(
        &self,
        relay_base: &str,
        session_id: &str,
        token: &str,
    ) -> Result<(), AgentError> {
        let (transport, mut inbound) = RelayTransport::connect(relay_base, session_id, token)
            .await
            .map_err(|e| AgentError::Connection(e.to_string()))?;

        let generation = self
            .next_generation
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        *self.current.lock().await = Some(ActiveTransport {
            generation,
            transport: transport.clone() as Arc<dyn Transport>,
        });
        *self.mode.write().await = TransportMode::Relay;
        info!(session_id, "Tunnel active (relay)");

        let dispatcher = Arc::clone(&self.dispatcher);
        let current = Arc::clone(&self.current);
        let mode = Arc::clone(&self.mode);
        let pump_transport: Arc<dyn Transport> = transport;
        tokio::spawn(async move {
            while let Some(data) = inbound.recv().await {
                if let Some(response) = dispatcher.dispatch(&data).await {
                    if let Err(e) = pump_transport.send(response).await {
                        warn!(error = %e, "Failed to send response frame");
                    }
                }
            }

            let mut current = current.lock().await;
            if current.as_ref().map(|active| active.generation) == Some(generation) {
                *current = None;
                *mode.write().await = TransportMode::Offline;
            }
            drop(current);
            dispatcher.shutdown().await;
            pump_transport.close().await;
        });

        Ok(())
    }

    /// Close the active transport (if any) and cancel its sub-connections.
    async fn teardown(&self) {
        let active = self.current.lock().await.take();
        if let Some(active) = active {
            active.transport.close().await;
        }
        self.dispatcher.shutdown().await;
        *self.mode.write().await = TransportMode::Offline;
    }

    /// Log in with the configured credentials and return an access token.
    async fn authenticate(&self) -> Result<String, AgentError> {
        let client = reqwest::Client::new();
        let response = client
            .post(format!("{}/auth/login", self.config.signaling_url))
            .json(&serde_json::json!({
                "email": self.config.email,
                "password": self.config.password,
            }))
            .send()
            .await
            .map_err(|e| AgentError::Connection(e.to_string()))?;

        if !response.status().is_success() {
            return Err(AgentError::Auth(format!(
                "Login failed: {}",
                response.status()
            )));
        }

        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| AgentError::Auth(e.to_string()))?;
        let token = body["access_token"]
            .as_str()
            .ok_or_else(|| AgentError::Auth("Login response missing access_token".into()))?;

        info!(email = %self.config.email, "Authenticated with signaling service");
        Ok(token.to_string())
    }

    /// Register (or refresh) this device with the signaling service.
    async fn register_device(&self, token: &str) -> Result<(), AgentError> {
        let client = reqwest::Client::new();
        let response = client
            .post(format!("{}/devices/register", self.config.signaling_url))
            .bearer_auth(token)
            .json(&serde_json::json!({
                "device_id": self.config.device_id,
                "pubkey": self.config.pubkey,
            }))
            .send()
            .await
            .map_err(|e| AgentError::Connection(e.to_string()))?;

        if !response.status().is_success() {
            return Err(AgentError::Registration(format!(
                "Device registration failed: {}",
                response.status()
            )));
        }

        info!(device_id = %self.config.device_id, "Device registered");
        Ok(())
    }
}
