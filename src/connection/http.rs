//! HTTP transport to a deployed MCP server.
//!
//! One JSON-RPC request/response per call, `application/json`, over a shared
//! pooled `reqwest` client with keep-alive per endpoint. Connection-establish
//! failures map to `ConnectionClosed` (safe to retry); anything after the
//! request body has been transmitted maps to `Protocol` or `Timeout`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde_json::Value;

use crate::error::StevedoreError;
use crate::protocol::{JsonRpcRequest, JsonRpcResponse};

/// Default per-call timeout.
pub const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(30);

pub struct HttpConnection {
    /// Context label for errors (instance or template id).
    label: String,
    endpoint: String,
    client: reqwest::Client,
    timeout: Duration,
    next_id: AtomicU64,
}

impl HttpConnection {
    pub fn new(
        label: impl Into<String>,
        endpoint: impl Into<String>,
        client: reqwest::Client,
        timeout: Duration,
    ) -> Self {
        Self {
            label: label.into(),
            endpoint: endpoint.into(),
            client,
            timeout,
            next_id: AtomicU64::new(1),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Issue one JSON-RPC call and return its result payload.
    pub async fn request(&self, method: &str, params: Option<Value>) -> crate::Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = JsonRpcRequest::new(id, method, params);

        let response = self
            .client
            .post(&self.endpoint)
            .timeout(self.timeout)
            .json(&request)
            .send()
            .await
            .map_err(|e| self.classify(e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(StevedoreError::Protocol(
                self.label.clone(),
                format!("endpoint returned HTTP {}", status.as_u16()),
            ));
        }

        let rpc: JsonRpcResponse = response.json().await.map_err(|e| self.classify(e))?;
        if let Some(error) = rpc.error {
            return Err(StevedoreError::Protocol(
                self.label.clone(),
                format!("rpc error {}: {}", error.code, error.message),
            ));
        }
        if rpc.request_id() != Some(id) {
            return Err(StevedoreError::Protocol(
                self.label.clone(),
                format!("response id {:?} does not match request id {}", rpc.id, id),
            ));
        }
        Ok(rpc.result.unwrap_or(Value::Null))
    }

    fn classify(&self, error: reqwest::Error) -> StevedoreError {
        if error.is_timeout() {
            StevedoreError::Timeout(self.label.clone())
        } else if error.is_connect() {
            // Nothing was transmitted; retrying is safe.
            StevedoreError::ConnectionClosed(self.label.clone())
        } else {
            StevedoreError::Protocol(self.label.clone(), error.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::routing::post;
    use axum::{Json, Router};

    /// Serve a canned JSON-RPC responder on an ephemeral port.
    async fn serve(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}/mcp", addr)
    }

    fn echo_router() -> Router {
        Router::new().route(
            "/mcp",
            post(|Json(request): Json<Value>| async move {
                Json(serde_json::json!({
                    "jsonrpc": "2.0",
                    "id": request["id"],
                    "result": {"echo": request["method"]},
                }))
            }),
        )
    }

    #[tokio::test]
    async fn test_request_round_trip() {
        let endpoint = serve(echo_router()).await;
        let conn = HttpConnection::new(
            "test",
            endpoint,
            reqwest::Client::new(),
            Duration::from_secs(5),
        );
        let result = conn.request("tools/list", None).await.unwrap();
        assert_eq!(result["echo"], "tools/list");
    }

    #[tokio::test]
    async fn test_request_ids_increment_and_match() {
        let endpoint = serve(echo_router()).await;
        let conn = HttpConnection::new(
            "test",
            endpoint,
            reqwest::Client::new(),
            Duration::from_secs(5),
        );
        conn.request("initialize", None).await.unwrap();
        conn.request("tools/list", None).await.unwrap();
        assert_eq!(conn.next_id.load(Ordering::Relaxed), 3);
    }

    #[tokio::test]
    async fn test_rpc_error_maps_to_protocol() {
        let app = Router::new().route(
            "/mcp",
            post(|Json(request): Json<Value>| async move {
                Json(serde_json::json!({
                    "jsonrpc": "2.0",
                    "id": request["id"],
                    "error": {"code": -32601, "message": "method not found"},
                }))
            }),
        );
        let endpoint = serve(app).await;
        let conn = HttpConnection::new(
            "test",
            endpoint,
            reqwest::Client::new(),
            Duration::from_secs(5),
        );
        let result = conn.request("nope", None).await;
        assert!(
            matches!(result, Err(StevedoreError::Protocol(label, msg))
                if label == "test" && msg.contains("method not found"))
        );
    }

    #[tokio::test]
    async fn test_mismatched_id_rejected() {
        let app = Router::new().route(
            "/mcp",
            post(|| async {
                Json(serde_json::json!({
                    "jsonrpc": "2.0",
                    "id": 9999,
                    "result": {},
                }))
            }),
        );
        let endpoint = serve(app).await;
        let conn = HttpConnection::new(
            "test",
            endpoint,
            reqwest::Client::new(),
            Duration::from_secs(5),
        );
        let result = conn.request("tools/list", None).await;
        assert!(
            matches!(result, Err(StevedoreError::Protocol(_, msg)) if msg.contains("does not match"))
        );
    }

    #[tokio::test]
    async fn test_connect_failure_is_connection_closed() {
        // Nothing listens on this port.
        let conn = HttpConnection::new(
            "test",
            "http://127.0.0.1:1/mcp",
            reqwest::Client::new(),
            Duration::from_secs(5),
        );
        let result = conn.request("tools/list", None).await;
        assert!(matches!(result, Err(StevedoreError::ConnectionClosed(_))));
    }

    #[tokio::test]
    async fn test_non_2xx_is_protocol_error() {
        let app = Router::new().route(
            "/mcp",
            post(|| async { (axum::http::StatusCode::BAD_GATEWAY, "upstream broken") }),
        );
        let endpoint = serve(app).await;
        let conn = HttpConnection::new(
            "test",
            endpoint,
            reqwest::Client::new(),
            Duration::from_secs(5),
        );
        let result = conn.request("tools/list", None).await;
        assert!(matches!(result, Err(StevedoreError::Protocol(_, msg)) if msg.contains("502")));
    }
}
