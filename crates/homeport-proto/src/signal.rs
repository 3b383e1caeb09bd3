//! Signaling message alphabet.
//!
//! Text JSON frames exchanged over the `/signal` WebSocket, tagged by
//! `type`. Client→server routed messages name a `target_device_id`; the
//! service rewrites them before delivery so the receiver sees who sent the
//! message instead (`sender_device_id` / `from_device_id`).

use serde::{Deserialize, Serialize};

/// SDP payload for `offer`/`answer` messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SdpPayload {
    pub sdp: String,
    /// "offer" or "answer".
    #[serde(rename = "type")]
    pub sdp_type: String,
}

/// ICE candidate payload, field names matching `RTCIceCandidateInit`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IcePayload {
    pub candidate: String,
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        rename = "sdpMLineIndex",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,
}

/// Transport preference in a connect-request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    Webrtc,
    Relay,
    Auto,
}

/// Status reported in a connect-ack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectAckStatus {
    Connecting,
    Connected,
    Failed,
}

/// A signaling frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SignalMessage {
    /// Server→client confirmation after a successful upgrade.
    Connected { device_id: String, message: String },

    /// SDP offer. Client→server with `target_device_id`; relayed form
    /// carries `sender_device_id` instead.
    Offer {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target_device_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sender_device_id: Option<String>,
        payload: SdpPayload,
    },

    /// SDP answer; same routing shape as `offer`.
    Answer {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target_device_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sender_device_id: Option<String>,
        payload: SdpPayload,
    },

    /// Trickle ICE candidate; same routing shape as `offer`.
    IceCandidate {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target_device_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sender_device_id: Option<String>,
        payload: IcePayload,
    },

    /// Client→server: ask the target to prepare a transport.
    ConnectRequest {
        target_device_id: String,
        preferred_transport: TransportKind,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        relay_session_id: Option<String>,
    },

    /// Server→client rewrite of `connect-request`.
    ConnectRequestReceived {
        from_device_id: String,
        preferred_transport: TransportKind,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        relay_session_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        relay_url: Option<String>,
    },

    /// Client→server: acknowledge a connect-request.
    ConnectAck {
        target_device_id: String,
        transport: TransportKind,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        relay_session_id: Option<String>,
        status: ConnectAckStatus,
    },

    /// Server→client rewrite of `connect-ack`.
    ConnectAckReceived {
        from_device_id: String,
        transport: TransportKind,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        relay_session_id: Option<String>,
        status: ConnectAckStatus,
    },

    /// Server→sender: routed message was delivered.
    Ack { message: String },

    /// Server→sender: routing or protocol error; the session stays open.
    Error { message: String },
}

impl SignalMessage {
    /// For client→server routed messages, the target device id.
    ///
    /// `None` for server-originated types and for already-relayed forms.
    pub fn routed_target(&self) -> Option<&str> {
        match self {
            Self::Offer {
                target_device_id, ..
            }
            | Self::Answer {
                target_device_id, ..
            }
            | Self::IceCandidate {
                target_device_id, ..
            } => target_device_id.as_deref(),
            Self::ConnectRequest {
                target_device_id, ..
            }
            | Self::ConnectAck {
                target_device_id, ..
            } => Some(target_device_id),
            _ => None,
        }
    }

    /// Rewrite a routed client→server message into its server→client
    /// delivery form: the target field is dropped and the sender identity is
    /// attached. `relay_url` is advertised on connect-requests so the
    /// receiver knows where to dial.
    pub fn into_relayed(self, sender_device_id: &str, relay_url: Option<&str>) -> Self {
        match self {
            Self::Offer { payload, .. } => Self::Offer {
                target_device_id: None,
                sender_device_id: Some(sender_device_id.to_string()),
                payload,
            },
            Self::Answer { payload, .. } => Self::Answer {
                target_device_id: None,
                sender_device_id: Some(sender_device_id.to_string()),
                payload,
            },
            Self::IceCandidate { payload, .. } => Self::IceCandidate {
                target_device_id: None,
                sender_device_id: Some(sender_device_id.to_string()),
                payload,
            },
            Self::ConnectRequest {
                preferred_transport,
                relay_session_id,
                ..
            } => Self::ConnectRequestReceived {
                from_device_id: sender_device_id.to_string(),
                preferred_transport,
                relay_session_id,
                relay_url: relay_url.map(str::to_string),
            },
            Self::ConnectAck {
                transport,
                relay_session_id,
                status,
                ..
            } => Self::ConnectAckReceived {
                from_device_id: sender_device_id.to_string(),
                transport,
                relay_session_id,
                status,
            },
            other => other,
        }
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn offer_wire_format() {
        let msg = SignalMessage::Offer {
            target_device_id: Some("host-b".into()),
            sender_device_id: None,
            payload: SdpPayload {
                sdp: "v=0...".into(),
                sdp_type: "offer".into(),
            },
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains(r#""type":"offer""#));
        assert!(json.contains(r#""target_device_id":"host-b""#));
        assert!(!json.contains("sender_device_id"));

        let parsed: SignalMessage = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, msg);
    }

    #[test]
    fn ice_candidate_field_names() {
        let msg = SignalMessage::IceCandidate {
            target_device_id: Some("host-b".into()),
            sender_device_id: None,
            payload: IcePayload {
                candidate: "candidate:1 1 udp 2130706431 192.0.2.1 54400 typ host".into(),
                sdp_mid: Some("0".into()),
                sdp_mline_index: Some(0),
            },
        };
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains(r#""type":"ice-candidate""#));
        assert!(json.contains(r#""sdpMid":"0""#));
        assert!(json.contains(r#""sdpMLineIndex":0"#));
    }

    #[test]
    fn connect_request_rewrites_to_received() {
        let msg = SignalMessage::ConnectRequest {
            target_device_id: "host-b".into(),
            preferred_transport: TransportKind::Relay,
            relay_session_id: Some("browser-a-host-b".into()),
        };
        assert_eq!(msg.routed_target(), Some("host-b"));

        let relayed = msg.into_relayed("browser-a", Some("wss://relay.example"));
        match relayed {
            SignalMessage::ConnectRequestReceived {
                from_device_id,
                preferred_transport,
                relay_session_id,
                relay_url,
            } => {
                assert_eq!(from_device_id, "browser-a");
                assert_eq!(preferred_transport, TransportKind::Relay);
                assert_eq!(relay_session_id.as_deref(), Some("browser-a-host-b"));
                assert_eq!(relay_url.as_deref(), Some("wss://relay.example"));
            }
            other => panic!("unexpected rewrite: {other:?}"),
        }
    }

    #[test]
    fn connect_ack_rewrites_to_received() {
        let msg = SignalMessage::ConnectAck {
            target_device_id: "browser-a".into(),
            transport: TransportKind::Relay,
            relay_session_id: Some("browser-a-host-b".into()),
            status: ConnectAckStatus::Connecting,
        };
        let relayed = msg.into_relayed("host-b", None);
        match relayed {
            SignalMessage::ConnectAckReceived {
                from_device_id,
                status,
                ..
            } => {
                assert_eq!(from_device_id, "host-b");
                assert_eq!(status, ConnectAckStatus::Connecting);
            }
            other => panic!("unexpected rewrite: {other:?}"),
        }
    }

    #[test]
    fn offer_rewrite_attaches_sender() {
        let msg = SignalMessage::Offer {
            target_device_id: Some("host-b".into()),
            sender_device_id: None,
            payload: SdpPayload {
                sdp: "v=0".into(),
                sdp_type: "offer".into(),
            },
        };
        let relayed = msg.into_relayed("browser-a", None);
        match relayed {
            SignalMessage::Offer {
                target_device_id,
                sender_device_id,
                ..
            } => {
                assert_eq!(target_device_id, None);
                assert_eq!(sender_device_id.as_deref(), Some("browser-a"));
            }
            other => panic!("unexpected rewrite: {other:?}"),
        }
    }

    #[test]
    fn non_routed_types_have_no_target() {
        let ack = SignalMessage::Ack {
            message: "delivered".into(),
        };
        assert_eq!(ack.routed_target(), None);

        let err = SignalMessage::Error {
            message: "nope".into(),
        };
        assert_eq!(err.routed_target(), None);
    }

    #[test]
    fn transport_kind_wire_values() {
        assert_eq!(
            serde_json::to_string(&TransportKind::Webrtc).unwrap(),
            r#""webrtc""#
        );
        assert_eq!(
            serde_json::to_string(&TransportKind::Relay).unwrap(),
            r#""relay""#
        );
        assert_eq!(
            serde_json::to_string(&ConnectAckStatus::Failed).unwrap(),
            r#""failed""#
        );
    }
}
