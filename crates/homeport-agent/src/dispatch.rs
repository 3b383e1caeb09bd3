//! Frame dispatcher: routes inbound tunnel frames by type.
//!
//! HTTP_REQUEST goes to the HTTP proxy and yields a response frame;
//! WS_CONNECT/WS_DATA/WS_CLOSE drive the WebSocket proxy; anything else is
//! logged and discarded.

use tracing::warn;

use homeport_proto::{Frame, FrameError};

use crate::http_proxy::HttpProxy;
use crate::ws_proxy::WsProxy;

/// Dispatches decoded frames to the HTTP and WebSocket proxies.
pub struct FrameDispatcher {
    http: HttpProxy,
    ws: WsProxy,
}

impl FrameDispatcher {
    pub fn new(http: HttpProxy, ws: WsProxy) -> Self {
        Self { http, ws }
    }

    /// Handle one inbound frame. HTTP requests return the encoded response
    /// to write back; WebSocket frames reply through the proxy's outbound
    /// queue instead.
    pub async fn dispatch(&self, data: &[u8]) -> Option<Vec<u8>> {
        let frame = match Frame::decode(data) {
            Ok(frame) => frame,
            Err(FrameError::UnknownFrameType(byte)) => {
                warn!(frame_type = format!("0x{byte:02x}"), "Unknown frame type, discarding");
                return None;
            }
            Err(e) => {
                warn!(error = %e, "Undecodable frame, discarding");
                return None;
            }
        };

        match frame {
            Frame::HttpRequest(request) => {
                let response = self.http.handle_request(request).await;
                match homeport_proto::Frame::HttpResponse(response).encode() {
                    Ok(encoded) => Some(encoded),
                    Err(e) => {
                        warn!(error = %e, "Failed to encode HTTP response");
                        None
                    }
                }
            }
            Frame::HttpResponse(response) => {
                warn!(
                    request_id = response.request_id,
                    "Unexpected HTTP_RESPONSE from peer, discarding"
                );
                None
            }
            Frame::WsConnect(connect) => {
                self.ws.handle_connect(connect).await;
                None
            }
            Frame::WsData(data) => {
                self.ws.handle_data(data).await;
                None
            }
            Frame::WsClose(close) => {
                self.ws.handle_close(close).await;
                None
            }
        }
    }

    /// Close all WebSocket sub-connections (transport death).
    pub async fn shutdown(&self) {
        self.ws.close_all().await;
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::time::Duration;
    use tokio::sync::mpsc;

    use homeport_proto::{HttpRequestFrame, HttpResponseFrame};

    fn dispatcher() -> FrameDispatcher {
        let (tx, _rx) = mpsc::channel(8);
        FrameDispatcher::new(
            HttpProxy::new("http://127.0.0.1:1", Duration::from_secs(1)),
            WsProxy::new("http://127.0.0.1:1", tx, 8),
        )
    }

    #[tokio::test]
    async fn unknown_frame_type_discarded() {
        let dispatcher = dispatcher();
        assert!(dispatcher.dispatch(&[0x7F, 0, 0, 0]).await.is_none());
        assert!(dispatcher.dispatch(&[]).await.is_none());
    }

    #[tokio::test]
    async fn http_response_from_peer_discarded() {
        let dispatcher = dispatcher();
        let frame = Frame::HttpResponse(HttpResponseFrame {
            request_id: 1,
            status_code: 200,
            headers: BTreeMap::new(),
            body: String::new(),
        });
        assert!(dispatcher.dispatch(&frame.encode().unwrap()).await.is_none());
    }

    #[tokio::test]
    async fn http_request_yields_correlated_response() {
        // No upstream listens, so the proxy answers 502, but the response
        // keeps the request id.
        let dispatcher = dispatcher();
        let frame = Frame::HttpRequest(HttpRequestFrame {
            request_id: 41,
            method: "GET".into(),
            path: "/x".into(),
            headers: BTreeMap::new(),
            body: String::new(),
        });

        let encoded = dispatcher
            .dispatch(&frame.encode().unwrap())
            .await
            .expect("http request produces a response");

        match Frame::decode(&encoded).unwrap() {
            Frame::HttpResponse(response) => {
                assert_eq!(response.request_id, 41);
                assert_eq!(response.status_code, 502);
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }
}
