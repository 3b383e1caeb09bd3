//! Homeport wire types.
//!
//! Two protocols live here:
//! - The binary tunnel frame format carried over a data channel or relay
//!   socket ([`frame`]): HTTP request/response transactions and WebSocket
//!   sub-connections, multiplexed by request id / connection id.
//! - The JSON signaling message alphabet exchanged over the `/signal`
//!   WebSocket ([`signal`]): SDP offers/answers, ICE candidates, and the
//!   connect-request/connect-ack relay handshake.

pub mod frame;
pub mod ids;
pub mod signal;

pub use frame::{
    Frame, FrameError, FrameType, HttpRequestFrame, HttpResponseFrame, WsCloseFrame,
    WsConnectFrame, WsDataFrame, WsOpcode,
};
pub use signal::{ConnectAckStatus, IcePayload, SdpPayload, SignalMessage, TransportKind};

/// Label of the single bidirectional data channel used for tunneling.
pub const DATA_CHANNEL_LABEL: &str = "http-proxy";

/// Maximum size of a signaling text message.
pub const SIGNAL_MESSAGE_MAX_BYTES: usize = 64 * 1024;

/// Maximum size of a binary frame accepted by the relay.
pub const RELAY_FRAME_MAX_BYTES: usize = 16 * 1024 * 1024;
