//! Peer-to-peer transport: a WebRTC data channel.
//!
//! One bidirectional data channel (label `"http-proxy"`) over an
//! `RTCPeerConnection`. The client endpoint offers and creates the channel;
//! the host endpoint answers and receives it. ICE candidates trickle out
//! through a channel the caller forwards over signaling.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, info, warn};

use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

use homeport_proto::{IcePayload, DATA_CHANNEL_LABEL};

use crate::error::TunnelError;
use crate::transport::Transport;

/// Coarse peer-connection state for the fallback machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Connecting,
    Connected,
    Failed,
    Closed,
}

/// STUN/TURN configuration for peer connections.
#[derive(Debug, Clone)]
pub struct PeerConfig {
    /// STUN server URLs (e.g. `stun:stun.l.google.com:19302`).
    pub stun_servers: Vec<String>,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            stun_servers: vec![
                "stun:stun.l.google.com:19302".into(),
                "stun:stun1.l.google.com:19302".into(),
            ],
        }
    }
}

/// Event streams surfaced by a peer transport.
pub struct PeerEvents {
    /// Frames received on the data channel.
    pub inbound: mpsc::Receiver<Vec<u8>>,
    /// Local ICE candidates to forward over signaling.
    pub local_candidates: mpsc::Receiver<IcePayload>,
    /// Peer-connection state transitions.
    pub state: watch::Receiver<PeerState>,
    /// Flips to `true` when the data channel opens, back to `false` when it
    /// closes.
    pub channel_open: watch::Receiver<bool>,
}

/// Sender halves the data-channel callbacks feed.
#[derive(Clone)]
struct ChannelSenders {
    inbound_tx: mpsc::Sender<Vec<u8>>,
    channel_open_tx: watch::Sender<bool>,
}

/// Transport over a WebRTC data channel.
pub struct PeerTransport {
    pc: Arc<RTCPeerConnection>,
    channel: Arc<Mutex<Option<Arc<RTCDataChannel>>>>,
    open: Arc<AtomicBool>,
}

impl PeerTransport {
    /// Offering side (client endpoint): create the peer connection and the
    /// data channel, produce the SDP offer.
    pub async fn offer(
        config: &PeerConfig,
    ) -> Result<(Arc<Self>, PeerEvents, String), TunnelError> {
        let (transport, senders, events) = Self::new(config).await?;

        let channel = transport
            .pc
            .create_data_channel(DATA_CHANNEL_LABEL, None)
            .await
            .map_err(|e| TunnelError::Connection(e.to_string()))?;
        wire_data_channel(&channel, &transport.open, &senders);
        *transport.channel.lock().await = Some(channel);

        let offer = transport
            .pc
            .create_offer(None)
            .await
            .map_err(|e| TunnelError::Connection(e.to_string()))?;
        let sdp = offer.sdp.clone();
        transport
            .pc
            .set_local_description(offer)
            .await
            .map_err(|e| TunnelError::Connection(e.to_string()))?;

        info!("Created SDP offer (trickle ICE)");
        Ok((transport, events, sdp))
    }

    /// Answering side (host endpoint): accept the remote offer, produce the
    /// SDP answer. The data channel arrives from the offerer.
    pub async fn answer(
        config: &PeerConfig,
        offer_sdp: &str,
    ) -> Result<(Arc<Self>, PeerEvents, String), TunnelError> {
        let (transport, senders, events) = Self::new(config).await?;

        // The offerer creates the channel; capture it when it shows up.
        let channel_slot = Arc::clone(&transport.channel);
        let open_flag = Arc::clone(&transport.open);
        transport
            .pc
            .on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
                let channel_slot = Arc::clone(&channel_slot);
                let open_flag = Arc::clone(&open_flag);
                let senders = senders.clone();
                Box::pin(async move {
                    info!(label = %dc.label(), "Data channel received");
                    wire_data_channel(&dc, &open_flag, &senders);
                    *channel_slot.lock().await = Some(dc);
                })
            }));

        let offer = RTCSessionDescription::offer(offer_sdp.to_string())
            .map_err(|e| TunnelError::Connection(format!("Invalid SDP offer: {e}")))?;
        transport
            .pc
            .set_remote_description(offer)
            .await
            .map_err(|e| TunnelError::Connection(e.to_string()))?;

        let answer = transport
            .pc
            .create_answer(None)
            .await
            .map_err(|e| TunnelError::Connection(e.to_string()))?;
        let sdp = answer.sdp.clone();
        transport
            .pc
            .set_local_description(answer)
            .await
            .map_err(|e| TunnelError::Connection(e.to_string()))?;

        info!("Created SDP answer (trickle ICE)");
        Ok((transport, events, sdp))
    }

    /// Apply the remote SDP answer (offering side).
    pub async fn apply_answer(&self, answer_sdp: &str) -> Result<(), TunnelError> {
        let answer = RTCSessionDescription::answer(answer_sdp.to_string())
            .map_err(|e| TunnelError::Connection(format!("Invalid SDP answer: {e}")))?;
        self.pc
            .set_remote_description(answer)
            .await
            .map_err(|e| TunnelError::Connection(e.to_string()))
    }

    /// Add a remote ICE candidate received over signaling.
    pub async fn add_remote_candidate(&self, payload: IcePayload) -> Result<(), TunnelError> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: payload.candidate,
                sdp_mid: payload.sdp_mid,
                sdp_mline_index: payload.sdp_mline_index,
                username_fragment: None,
            })
            .await
            .map_err(|e| TunnelError::Connection(format!("Failed to add ICE candidate: {e}")))
    }

    async fn new(
        config: &PeerConfig,
    ) -> Result<(Arc<Self>, ChannelSenders, PeerEvents), TunnelError> {
        let mut media_engine = MediaEngine::default();
        media_engine
            .register_default_codecs()
            .map_err(|e| TunnelError::Connection(e.to_string()))?;

        let registry = register_default_interceptors(
            webrtc::interceptor::registry::Registry::new(),
            &mut media_engine,
        )
        .map_err(|e| TunnelError::Connection(e.to_string()))?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let rtc_config = RTCConfiguration {
            ice_servers: config
                .stun_servers
                .iter()
                .map(|url| RTCIceServer {
                    urls: vec![url.clone()],
                    ..Default::default()
                })
                .collect(),
            ..Default::default()
        };

        let pc = Arc::new(
            api.new_peer_connection(rtc_config)
                .await
                .map_err(|e| TunnelError::Connection(e.to_string()))?,
        );

        let (inbound_tx, inbound_rx) = mpsc::channel::<Vec<u8>>(64);
        let (candidate_tx, candidate_rx) = mpsc::channel::<IcePayload>(64);
        let (state_tx, state_rx) = watch::channel(PeerState::Connecting);
        let (channel_open_tx, channel_open_rx) = watch::channel(false);

        // Trickle ICE: surface each local candidate for the signaling layer.
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let candidate_tx = candidate_tx.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    debug!("ICE gathering complete");
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => {
                        let _ = candidate_tx
                            .send(IcePayload {
                                candidate: init.candidate,
                                sdp_mid: init.sdp_mid,
                                sdp_mline_index: init.sdp_mline_index,
                            })
                            .await;
                    }
                    Err(e) => warn!(error = %e, "Failed to serialize ICE candidate"),
                }
            })
        }));

        let open = Arc::new(AtomicBool::new(false));
        let state_open = Arc::clone(&open);
        pc.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
            info!(state = ?s, "Peer connection state changed");
            let mapped = map_state(s);
            if matches!(mapped, PeerState::Failed | PeerState::Closed) {
                state_open.store(false, Ordering::SeqCst);
            }
            let _ = state_tx.send(mapped);
            Box::pin(async {})
        }));

        let transport = Arc::new(Self {
            pc,
            channel: Arc::new(Mutex::new(None)),
            open,
        });

        let senders = ChannelSenders {
            inbound_tx,
            channel_open_tx,
        };
        let events = PeerEvents {
            inbound: inbound_rx,
            local_candidates: candidate_rx,
            state: state_rx,
            channel_open: channel_open_rx,
        };

        Ok((transport, senders, events))
    }
}

fn wire_data_channel(dc: &Arc<RTCDataChannel>, open: &Arc<AtomicBool>, senders: &ChannelSenders) {
    let on_open_flag = Arc::clone(open);
    let on_open_watch = senders.channel_open_tx.clone();
    let label = dc.label().to_string();
    dc.on_open(Box::new(move || {
        info!(label = %label, "Data channel opened");
        on_open_flag.store(true, Ordering::SeqCst);
        let _ = on_open_watch.send(true);
        Box::pin(async {})
    }));

    let on_close_flag = Arc::clone(open);
    let on_close_watch = senders.channel_open_tx.clone();
    dc.on_close(Box::new(move || {
        info!("Data channel closed");
        on_close_flag.store(false, Ordering::SeqCst);
        let _ = on_close_watch.send(false);
        Box::pin(async {})
    }));

    let inbound_tx = senders.inbound_tx.clone();
    dc.on_message(Box::new(move |msg: DataChannelMessage| {
        let inbound_tx = inbound_tx.clone();
        Box::pin(async move {
            let _ = inbound_tx.send(msg.data.to_vec()).await;
        })
    }));
}

fn map_state(state: RTCPeerConnectionState) -> PeerState {
    match state {
        RTCPeerConnectionState::New
        | RTCPeerConnectionState::Connecting
        | RTCPeerConnectionState::Unspecified => PeerState::Connecting,
        RTCPeerConnectionState::Connected => PeerState::Connected,
        RTCPeerConnectionState::Disconnected | RTCPeerConnectionState::Failed => PeerState::Failed,
        RTCPeerConnectionState::Closed => PeerState::Closed,
    }
}

#[async_trait]
impl Transport for PeerTransport {
    async fn send(&self, frame: Vec<u8>) -> Result<(), TunnelError> {
        if !self.is_open() {
            return Err(TunnelError::ConnectionClosed);
        }
        let channel = self.channel.lock().await;
        let Some(channel) = channel.as_ref() else {
            return Err(TunnelError::ConnectionClosed);
        };
        channel
            .send(&Bytes::from(frame))
            .await
            .map(|_| ())
            .map_err(|e| TunnelError::TransportFailed(e.to_string()))
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
        if let Some(channel) = self.channel.lock().await.take() {
            let _ = channel.close().await;
        }
        if let Err(e) = self.pc.close().await {
            warn!(error = %e, "Error closing peer connection");
        }
    }
}
