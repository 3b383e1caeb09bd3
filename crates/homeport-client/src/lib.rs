//! Homeport Client Endpoint Library
//!
//! The client side of the tunnel:
//! - [`connector::Connector`]: establishes a transport to a host device,
//!   preferring a peer-to-peer data channel and falling back to the relay
//!   after repeated failure
//! - [`mux::Multiplexer`]: correlates tunneled HTTP requests with responses
//!   and routes WebSocket sub-connection frames
//! - [`websocket::WsFactory`]: hands out WebSocket-shaped objects, tunneling
//!   everything except the signaling control channel

pub mod connector;
pub mod error;
pub mod mux;
pub mod websocket;

#[cfg(test)]
pub(crate) mod test_util;

pub use connector::{Connector, ConnectorConfig, ConnectorState, Tunnel, TunnelMode};
pub use error::{ConnectError, FetchError};
pub use mux::{Multiplexer, ProxyRequest, ProxyResponse};
pub use websocket::{
    ClientSocket, SocketEvent, SocketRoute, SocketState, TunnelWebSocket, WsFactory,
};
