//! Transport establishment with relay fallback.
//!
//! The connector drives the client endpoint's state machine:
//!
//! `idle → signaling → wb_connecting → wb_open`
//! with `wb_connecting/wb_open → wb_failed` on failure, up to three
//! attempts with doubling backoff, then
//! `wb_failed → relay_connecting → relay_open` via the
//! connect-request/connect-ack handshake. A platform without WebRTC skips
//! straight to the fallback edge. Offers are only ever sent while the
//! chosen transport is still WebRTC.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::sleep;
use tracing::{debug, info, warn};

use homeport_proto::ids;
use homeport_proto::{ConnectAckStatus, SdpPayload, SignalMessage, TransportKind};
use homeport_tunnel::p2p::{PeerConfig, PeerEvents, PeerState, PeerTransport};
use homeport_tunnel::relay_ws::RelayTransport;
use homeport_tunnel::signaling::SignalingClient;
use homeport_tunnel::{ReconnectPolicy, Transport};

use crate::error::{ConnectError, FetchError};
use crate::mux::{Multiplexer, ProxyRequest, ProxyResponse, DEFAULT_FETCH_TIMEOUT};
use crate::websocket::WsFactory;

/// States of the fallback machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectorState {
    Idle,
    Signaling,
    WbConnecting,
    WbOpen,
    WbFailed,
    RelayConnecting,
    RelayOpen,
    Closed,
}

/// Which transport a tunnel ended up on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelMode {
    P2pDirect,
    Relay,
}

/// Connector configuration.
#[derive(Debug, Clone)]
pub struct ConnectorConfig {
    /// Signaling `/signal` WebSocket URL.
    pub signal_url: String,
    /// Relay base URL for the fallback path.
    pub relay_url: Option<String>,
    /// This endpoint's device id (browser class).
    pub device_id: String,
    /// The host device to connect to.
    pub target_device_id: String,
    /// Bearer token for signaling and relay.
    pub token: String,
    /// STUN configuration for the peer connection.
    pub peer: PeerConfig,
    /// Whether the platform supports peer connections at all.
    pub webrtc_available: bool,
    /// Deadline for the connect-ack after a relay connect-request.
    pub connect_ack_timeout: Duration,
    /// Watchdog on peer-connection establishment.
    pub p2p_watchdog: Duration,
    /// Retry policy for peer-connection attempts.
    pub retry: ReconnectPolicy,
    /// Default deadline for tunneled requests.
    pub fetch_timeout: Duration,
}

impl ConnectorConfig {
    pub fn new(
        signal_url: String,
        device_id: String,
        target_device_id: String,
        token: String,
    ) -> Self {
        Self {
            signal_url,
            relay_url: None,
            device_id,
            target_device_id,
            token,
            peer: PeerConfig::default(),
            webrtc_available: true,
            connect_ack_timeout: Duration::from_secs(30),
            p2p_watchdog: Duration::from_secs(15),
            retry: ReconnectPolicy::p2p_establishment(),
            fetch_timeout: DEFAULT_FETCH_TIMEOUT,
        }
    }

    /// The deterministic relay session id for this endpoint pair.
    pub fn relay_session_id(&self) -> String {
        ids::relay_session_id(&self.device_id, &self.target_device_id)
    }
}

/// Drives transport establishment for one client endpoint.
pub struct Connector {
    config: ConnectorConfig,
    state_tx: watch::Sender<ConnectorState>,
    state_rx: watch::Receiver<ConnectorState>,
}

impl Connector {
    pub fn new(config: ConnectorConfig) -> Self {
        let (state_tx, state_rx) = watch::channel(ConnectorState::Idle);
        Self {
            config,
            state_tx,
            state_rx,
        }
    }

    /// Observe state transitions.
    pub fn state(&self) -> watch::Receiver<ConnectorState> {
        self.state_rx.clone()
    }

    fn set_state(&self, state: ConnectorState) {
        debug!(state = ?state, "Connector state");
        let _ = self.state_tx.send(state);
    }

    /// Establish a tunnel to the target device.
    pub async fn connect(&self) -> Result<Tunnel, ConnectError> {
        self.set_state(ConnectorState::Signaling);

        let (signaling, mut inbound) = SignalingClient::connect(
            &self.config.signal_url,
            &self.config.device_id,
            &self.config.token,
        )
        .await
        .map_err(|e| {
            self.set_state(ConnectorState::Closed);
            ConnectError::Signaling(e.to_string())
        })?;
        let signaling = Arc::new(signaling);

        if self.config.webrtc_available {
            let mut failures: u32 = 0;
            while self.config.retry.should_retry(failures) {
                self.set_state(ConnectorState::WbConnecting);

                match self.attempt_p2p(&signaling, &mut inbound).await {
                    Ok((transport, events)) => {
                        self.set_state(ConnectorState::WbOpen);
                        info!("Tunnel established (p2p-direct)");
                        return Ok(self.finish_p2p(signaling, inbound, transport, events));
                    }
                    Err(e) => {
                        failures += 1;
                        warn!(error = %e, failures, "Peer connection attempt failed");
                        self.set_state(ConnectorState::WbFailed);

                        if self.config.retry.should_retry(failures) {
                            // The signaling socket stays open across retries.
                            let delay = self.config.retry.delay_for_attempt(failures - 1);
                            sleep(delay).await;
                        }
                    }
                }
            }
            info!("Peer connection attempts exhausted, falling back to relay");
        } else {
            info!("No peer-connection capability, using relay");
        }

        self.fallback_to_relay(signaling, inbound).await
    }

    /// One peer-connection attempt under the establishment watchdog.
    async fn attempt_p2p(
        &self,
        signaling: &Arc<SignalingClient>,
        inbound: &mut mpsc::Receiver<SignalMessage>,
    ) -> Result<(Arc<PeerTransport>, PeerEvents), ConnectError> {
        let (transport, mut events, offer_sdp) = PeerTransport::offer(&self.config.peer)
            .await
            .map_err(|e| ConnectError::Signaling(e.to_string()))?;

        match self
            .drive_p2p(signaling, inbound, &transport, &mut events, offer_sdp)
            .await
        {
            Ok(()) => Ok((transport, events)),
            Err(e) => {
                // Tear down this attempt's WebRTC objects before retrying.
                transport.close().await;
                Err(e)
            }
        }
    }

    async fn drive_p2p(
        &self,
        signaling: &Arc<SignalingClient>,
        inbound: &mut mpsc::Receiver<SignalMessage>,
        transport: &Arc<PeerTransport>,
        events: &mut PeerEvents,
        offer_sdp: String,
    ) -> Result<(), ConnectError> {
        signaling
            .send(SignalMessage::Offer {
                target_device_id: Some(self.config.target_device_id.clone()),
                sender_device_id: None,
                payload: SdpPayload {
                    sdp: offer_sdp,
                    sdp_type: "offer".into(),
                },
            })
            .await
            .map_err(|e| ConnectError::Signaling(e.to_string()))?;

        let watchdog = sleep(self.config.p2p_watchdog);
        tokio::pin!(watchdog);

        let mut peer_connected = false;
        let mut channel_open = false;

        loop {
            // Open means both the connection and the data channel are up.
            if peer_connected && channel_open {
                return Ok(());
            }

            tokio::select! {
                _ = &mut watchdog => {
                    return Err(ConnectError::Signaling("Establishment watchdog expired".into()));
                }
                candidate = events.local_candidates.recv() => {
                    if let Some(payload) = candidate {
                        let msg = SignalMessage::IceCandidate {
                            target_device_id: Some(self.config.target_device_id.clone()),
                            sender_device_id: None,
                            payload,
                        };
                        if let Err(e) = signaling.send(msg).await {
                            return Err(ConnectError::Signaling(e.to_string()));
                        }
                    }
                }
                msg = inbound.recv() => {
                    match msg {
                        Some(SignalMessage::Answer { payload, .. }) => {
                            transport
                                .apply_answer(&payload.sdp)
                                .await
                                .map_err(|e| ConnectError::Signaling(e.to_string()))?;
                        }
                        Some(SignalMessage::IceCandidate { payload, .. }) => {
                            if let Err(e) = transport.add_remote_candidate(payload).await {
                                warn!(error = %e, "Failed to add remote candidate");
                            }
                        }
                        Some(SignalMessage::Error { message }) => {
                            return Err(ConnectError::Signaling(message));
                        }
                        Some(other) => {
                            debug!(msg = ?other, "Ignoring signaling message during establishment");
                        }
                        None => return Err(ConnectError::Closed),
                    }
                }
                changed = events.state.changed() => {
                    if changed.is_err() {
                        return Err(ConnectError::Closed);
                    }
                    match *events.state.borrow() {
                        PeerState::Connected => peer_connected = true,
                        PeerState::Failed | PeerState::Closed => {
                            return Err(ConnectError::Signaling("Peer connection failed".into()));
                        }
                        PeerState::Connecting => {}
                    }
                }
                changed = events.channel_open.changed() => {
                    if changed.is_err() {
                        return Err(ConnectError::Closed);
                    }
                    channel_open = *events.channel_open.borrow();
                }
            }
        }
    }

    /// Wrap an established peer transport in a tunnel: the multiplexer takes
    /// the frame stream, and a background task keeps trickling candidates.
    fn finish_p2p(
        &self,
        signaling: Arc<SignalingClient>,
        mut inbound: mpsc::Receiver<SignalMessage>,
        transport: Arc<PeerTransport>,
        events: PeerEvents,
    ) -> Tunnel {
        let PeerEvents {
            inbound: frames,
            mut local_candidates,
            state: _,
            mut channel_open,
        } = events;

        let mux = Multiplexer::new(
            Arc::clone(&transport) as Arc<dyn Transport>,
            frames,
            self.config.fetch_timeout,
        );

        // Late ICE candidates keep flowing both ways after establishment;
        // the channel-open watch doubles as a death notice.
        let peer = Arc::clone(&transport);
        let candidate_signaling = Arc::clone(&signaling);
        let target = self.config.target_device_id.clone();
        let state_tx = self.state_tx.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    candidate = local_candidates.recv() => {
                        match candidate {
                            Some(payload) => {
                                let msg = SignalMessage::IceCandidate {
                                    target_device_id: Some(target.clone()),
                                    sender_device_id: None,
                                    payload,
                                };
                                if candidate_signaling.send(msg).await.is_err() {
                                    break;
                                }
                            }
                            None => break,
                        }
                    }
                    msg = inbound.recv() => {
                        match msg {
                            Some(SignalMessage::IceCandidate { payload, .. }) => {
                                if let Err(e) = peer.add_remote_candidate(payload).await {
                                    warn!(error = %e, "Failed to add late candidate");
                                }
                            }
                            Some(other) => {
                                debug!(msg = ?other, "Ignoring signaling message");
                            }
                            None => break,
                        }
                    }
                    changed = channel_open.changed() => {
                        if changed.is_err() || !*channel_open.borrow() {
                            info!("Data channel closed, tunnel down");
                            let _ = state_tx.send(ConnectorState::WbFailed);
                            peer.close().await;
                            break;
                        }
                    }
                }
            }
        });

        let factory = WsFactory::new(Arc::clone(&mux));
        Tunnel {
            mux,
            factory,
            signaling,
            transport,
            mode: TunnelMode::P2pDirect,
            state_rx: self.state_rx.clone(),
        }
    }

    /// The fallback edge: connect-request, await the ack, dial the relay.
    async fn fallback_to_relay(
        &self,
        signaling: Arc<SignalingClient>,
        mut inbound: mpsc::Receiver<SignalMessage>,
    ) -> Result<Tunnel, ConnectError> {
        let Some(relay_url) = self.config.relay_url.clone() else {
            self.set_state(ConnectorState::Closed);
            return Err(ConnectError::RelayUnavailable);
        };

        let session_id = self.config.relay_session_id();
        signaling
            .send(SignalMessage::ConnectRequest {
                target_device_id: self.config.target_device_id.clone(),
                preferred_transport: TransportKind::Relay,
                relay_session_id: Some(session_id.clone()),
            })
            .await
            .map_err(|e| {
                self.set_state(ConnectorState::Closed);
                ConnectError::Signaling(e.to_string())
            })?;

        // The host must acknowledge before we dial.
        let ack = tokio::time::timeout(self.config.connect_ack_timeout, async {
            loop {
                match inbound.recv().await {
                    Some(SignalMessage::ConnectAckReceived { status, .. }) => {
                        return Ok(status);
                    }
                    Some(SignalMessage::Error { message }) => {
                        // Routing failed; no ack is coming.
                        return Err(ConnectError::Signaling(message));
                    }
                    Some(other) => {
                        debug!(msg = ?other, "Ignoring signaling message while awaiting ack");
                    }
                    None => return Err(ConnectError::Closed),
                }
            }
        })
        .await;

        let status = match ack {
            Ok(Ok(status)) => status,
            Ok(Err(e)) => {
                self.set_state(ConnectorState::Closed);
                return Err(e);
            }
            Err(_) => {
                self.set_state(ConnectorState::Closed);
                return Err(ConnectError::ConnectAckTimeout);
            }
        };

        match status {
            ConnectAckStatus::Connecting | ConnectAckStatus::Connected => {}
            ConnectAckStatus::Failed => {
                self.set_state(ConnectorState::Closed);
                return Err(ConnectError::FallbackRefused);
            }
        }

        self.set_state(ConnectorState::RelayConnecting);
        let (transport, frames) =
            RelayTransport::connect(&relay_url, &session_id, &self.config.token)
                .await
                .map_err(|e| {
                    self.set_state(ConnectorState::Closed);
                    ConnectError::RelayFailed(e.to_string())
                })?;

        self.set_state(ConnectorState::RelayOpen);
        info!(session_id, "Tunnel established (relay)");

        let mux = Multiplexer::new(
            Arc::clone(&transport) as Arc<dyn Transport>,
            frames,
            self.config.fetch_timeout,
        );

        // Keep draining signaling so acks and errors are not left queued.
        tokio::spawn(async move {
            while let Some(msg) = inbound.recv().await {
                debug!(msg = ?msg, "Signaling message on relay tunnel");
            }
        });

        let factory = WsFactory::new(Arc::clone(&mux));
        Ok(Tunnel {
            mux,
            factory,
            signaling,
            transport,
            mode: TunnelMode::Relay,
            state_rx: self.state_rx.clone(),
        })
    }
}

/// An established tunnel: the application-facing surface.
pub struct Tunnel {
    mux: Arc<Multiplexer>,
    factory: WsFactory,
    signaling: Arc<SignalingClient>,
    transport: Arc<dyn Transport>,
    mode: TunnelMode,
    state_rx: watch::Receiver<ConnectorState>,
}

impl Tunnel {
    /// Issue a tunneled HTTP request.
    pub async fn fetch(&self, request: ProxyRequest) -> Result<ProxyResponse, FetchError> {
        self.mux.fetch(request).await
    }

    /// The multiplexer, for direct use.
    pub fn mux(&self) -> &Arc<Multiplexer> {
        &self.mux
    }

    /// The WebSocket factory bound to this tunnel.
    pub fn websockets(&self) -> WsFactory {
        self.factory.clone()
    }

    /// Which transport carried this tunnel.
    pub fn mode(&self) -> TunnelMode {
        self.mode
    }

    /// Observe connector state (reflects post-establishment death too).
    pub fn state(&self) -> watch::Receiver<ConnectorState> {
        self.state_rx.clone()
    }

    pub fn is_open(&self) -> bool {
        self.transport.is_open()
    }

    /// Close the tunnel; all pending operations fail with
    /// `ConnectionClosed`. Re-issuing requests requires a new connect.
    pub async fn close(&self) {
        self.transport.close().await;
        self.signaling.close().await;
    }
}
