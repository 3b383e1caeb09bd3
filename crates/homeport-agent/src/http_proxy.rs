//! HTTP proxy: dispatches HTTP_REQUEST frames to the local service.
//!
//! The full response is buffered and returned as a single HTTP_RESPONSE
//! frame. Upstream client errors map to 502, anything else to 500, always
//! correlated to the originating request id.

use std::collections::BTreeMap;
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use tracing::{info, warn};

use homeport_proto::{HttpRequestFrame, HttpResponseFrame};

/// Forwards tunneled HTTP requests to the configured local base URL.
pub struct HttpProxy {
    base_url: String,
    client: reqwest::Client,
}

impl HttpProxy {
    pub fn new(base_url: &str, request_timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .unwrap_or_default();
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client,
        }
    }

    /// Dispatch one request frame and produce the response frame.
    pub async fn handle_request(&self, frame: HttpRequestFrame) -> HttpResponseFrame {
        let request_id = frame.request_id;
        info!(
            request_id,
            method = %frame.method,
            path = %frame.path,
            "Proxying HTTP request"
        );

        let response = match self.forward(frame).await {
            Ok(response) => response,
            Err(ProxyError::Upstream(message)) => error_response(request_id, 502, &message),
            Err(ProxyError::Internal(message)) => error_response(request_id, 500, &message),
        };

        info!(request_id, status = response.status_code, "HTTP response ready");
        response
    }

    async fn forward(&self, frame: HttpRequestFrame) -> Result<HttpResponseFrame, ProxyError> {
        let method = reqwest::Method::from_bytes(frame.method.as_bytes())
            .map_err(|_| ProxyError::Internal(format!("Invalid method: {}", frame.method)))?;

        let url = format!("{}{}", self.base_url, frame.path);

        let mut headers = HeaderMap::new();
        for (name, value) in &frame.headers {
            match (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                (Ok(name), Ok(value)) => {
                    headers.insert(name, value);
                }
                _ => warn!(header = %name, "Dropping unrepresentable header"),
            }
        }

        let mut request = self.client.request(method, &url).headers(headers);
        if !frame.body.is_empty() {
            request = request.body(frame.body);
        }

        let response = request
            .send()
            .await
            .map_err(|e| ProxyError::Upstream(format!("Bad Gateway: {e}")))?;

        let status_code = response.status().as_u16();
        let mut response_headers = BTreeMap::new();
        for (name, value) in response.headers() {
            if let Ok(value) = value.to_str() {
                response_headers.insert(name.as_str().to_string(), value.to_string());
            }
        }

        let body = response
            .text()
            .await
            .map_err(|e| ProxyError::Upstream(format!("Bad Gateway: {e}")))?;

        Ok(HttpResponseFrame {
            request_id: frame.request_id,
            status_code,
            headers: response_headers,
            body,
        })
    }
}

enum ProxyError {
    Upstream(String),
    Internal(String),
}

fn error_response(request_id: u32, status_code: u16, message: &str) -> HttpResponseFrame {
    warn!(request_id, status_code, message, "HTTP proxy error");
    let mut headers = BTreeMap::new();
    headers.insert("content-type".to_string(), "application/json".to_string());
    HttpResponseFrame {
        request_id,
        status_code,
        headers,
        body: serde_json::json!({ "error": message }).to_string(),
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use axum::routing::{get, post};
    use axum::Router;

    async fn spawn_local_service() -> std::net::SocketAddr {
        let app = Router::new()
            .route(
                "/v1/health",
                get(|| async { axum::Json(serde_json::json!({ "status": "ok" })) }),
            )
            .route(
                "/echo",
                post(|body: String| async move { format!("echo:{body}") }),
            );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        addr
    }

    #[tokio::test]
    async fn health_request_roundtrip() {
        let addr = spawn_local_service().await;
        let proxy = HttpProxy::new(&format!("http://{addr}"), Duration::from_secs(5));

        let response = proxy
            .handle_request(HttpRequestFrame {
                request_id: 1,
                method: "GET".into(),
                path: "/v1/health".into(),
                headers: BTreeMap::new(),
                body: String::new(),
            })
            .await;

        assert_eq!(response.request_id, 1);
        assert_eq!(response.status_code, 200);
        let body: serde_json::Value = serde_json::from_str(&response.body).unwrap();
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn request_body_and_headers_forwarded() {
        let addr = spawn_local_service().await;
        let proxy = HttpProxy::new(&format!("http://{addr}"), Duration::from_secs(5));

        let mut headers = BTreeMap::new();
        headers.insert("content-type".into(), "text/plain".into());

        let response = proxy
            .handle_request(HttpRequestFrame {
                request_id: 7,
                method: "POST".into(),
                path: "/echo".into(),
                headers,
                body: "hello".into(),
            })
            .await;

        assert_eq!(response.status_code, 200);
        assert_eq!(response.body, "echo:hello");
    }

    #[tokio::test]
    async fn unreachable_upstream_maps_to_502() {
        // Nothing listens on port 1.
        let proxy = HttpProxy::new("http://127.0.0.1:1", Duration::from_secs(1));

        let response = proxy
            .handle_request(HttpRequestFrame {
                request_id: 9,
                method: "GET".into(),
                path: "/v1/health".into(),
                headers: BTreeMap::new(),
                body: String::new(),
            })
            .await;

        assert_eq!(response.request_id, 9);
        assert_eq!(response.status_code, 502);
    }

    #[tokio::test]
    async fn invalid_method_maps_to_500() {
        let proxy = HttpProxy::new("http://127.0.0.1:1", Duration::from_secs(1));

        let response = proxy
            .handle_request(HttpRequestFrame {
                request_id: 3,
                method: "NOT A METHOD".into(),
                path: "/".into(),
                headers: BTreeMap::new(),
                body: String::new(),
            })
            .await;

        assert_eq!(response.status_code, 500);
    }
}
