//! Connection layer — sessions to deployed MCP servers over stdio or HTTP.
//!
//! Upper layers speak one surface: `initialize`, `list_tools`, `call_tool`,
//! `list_resources`, `read_resource`, `close`. Tool-call payloads are
//! forwarded verbatim; the only interpretation applied is the JSON-RPC
//! envelope and the `isError` marker on tool results.

pub mod http;
pub mod stdio;

use std::time::Duration;

use serde_json::Value;

use crate::backend::ExecSpec;
use crate::error::StevedoreError;
use crate::protocol::{
    initialize_params, is_tool_error, tools_from_result, McpTool, METHOD_INITIALIZE,
    METHOD_RESOURCES_LIST, METHOD_RESOURCES_READ, METHOD_TOOLS_CALL, METHOD_TOOLS_LIST,
};

pub use http::{HttpConnection, DEFAULT_HTTP_TIMEOUT};
pub use stdio::{StdioConnection, DEFAULT_STDIO_TIMEOUT};

/// A session to one deployed MCP server.
pub enum Connection {
    Http(HttpConnection),
    Stdio(StdioConnection),
}

impl Connection {
    /// Open an HTTP session against an endpoint URL.
    pub fn http(
        label: impl Into<String>,
        endpoint: impl Into<String>,
        client: reqwest::Client,
        timeout: Duration,
    ) -> Self {
        Connection::Http(HttpConnection::new(label, endpoint, client, timeout))
    }

    /// Spawn a stdio session from an exec spec.
    pub fn stdio(
        label: impl Into<String>,
        spec: &ExecSpec,
        timeout: Duration,
    ) -> crate::Result<Self> {
        Ok(Connection::Stdio(StdioConnection::spawn(
            label, spec, timeout,
        )?))
    }

    async fn request(&self, method: &str, params: Option<Value>) -> crate::Result<Value> {
        match self {
            Connection::Http(c) => c.request(method, params).await,
            Connection::Stdio(c) => c.request(method, params).await,
        }
    }

    /// Perform the MCP handshake.
    pub async fn initialize(&self) -> crate::Result<Value> {
        self.request(METHOD_INITIALIZE, Some(initialize_params()))
            .await
    }

    /// Enumerate the server's tools.
    pub async fn list_tools(&self) -> crate::Result<Vec<McpTool>> {
        let result = self.request(METHOD_TOOLS_LIST, None).await?;
        tools_from_result(&result).ok_or_else(|| {
            StevedoreError::Protocol(
                self.label().to_string(),
                "tools/list result carried no tool array".to_string(),
            )
        })
    }

    /// Invoke a tool and return the raw result payload verbatim.
    ///
    /// A structured negative result (`isError: true`) becomes
    /// `ToolExecutionError` — it is a server-level answer, never retried.
    pub async fn call_tool(&self, name: &str, arguments: Option<Value>) -> crate::Result<Value> {
        let params = serde_json::json!({
            "name": name,
            "arguments": arguments.unwrap_or_else(|| Value::Object(Default::default())),
        });
        let result = self.request(METHOD_TOOLS_CALL, Some(params)).await?;
        if is_tool_error(&result) {
            return Err(StevedoreError::ToolExecution(
                name.to_string(),
                tool_error_text(&result),
            ));
        }
        Ok(result)
    }

    /// Enumerate the server's resources.
    pub async fn list_resources(&self) -> crate::Result<Value> {
        self.request(METHOD_RESOURCES_LIST, None).await
    }

    /// Read one resource by URI.
    pub async fn read_resource(&self, uri: &str) -> crate::Result<Value> {
        self.request(METHOD_RESOURCES_READ, Some(serde_json::json!({"uri": uri})))
            .await
    }

    /// Close the session. Outstanding stdio calls are cancelled; the child
    /// receives a terminate signal then a hard kill after the grace period.
    pub async fn close(self) {
        match self {
            Connection::Http(_) => {}
            Connection::Stdio(c) => c.close().await,
        }
    }

    fn label(&self) -> &str {
        match self {
            Connection::Http(c) => c.endpoint(),
            Connection::Stdio(_) => "stdio",
        }
    }
}

/// Best-effort human text out of a tool error payload.
fn tool_error_text(result: &Value) -> String {
    result
        .get("content")
        .and_then(Value::as_array)
        .and_then(|items| items.first())
        .and_then(|item| item.get("text"))
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| result.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::routing::post;
    use axum::{Json, Router};

    async fn serve(app: Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}/mcp", addr)
    }

    fn mcp_router() -> Router {
        Router::new().route(
            "/mcp",
            post(|Json(request): Json<Value>| async move {
                let id = request["id"].clone();
                let result = match request["method"].as_str().unwrap_or("") {
                    "initialize" => serde_json::json!({"serverInfo": {"name": "demo"}}),
                    "tools/list" => serde_json::json!({
                        "tools": [{"name": "say_hello"}, {"name": "echo"}]
                    }),
                    "tools/call" => {
                        let name = request["params"]["name"].as_str().unwrap_or("");
                        if name == "broken" {
                            serde_json::json!({
                                "isError": true,
                                "content": [{"type": "text", "text": "tool exploded"}]
                            })
                        } else {
                            serde_json::json!({
                                "content": [{"type": "text", "text": "hello"}]
                            })
                        }
                    }
                    _ => Value::Null,
                };
                Json(serde_json::json!({"jsonrpc": "2.0", "id": id, "result": result}))
            }),
        )
    }

    #[tokio::test]
    async fn test_http_session_surface() {
        let endpoint = serve(mcp_router()).await;
        let conn = Connection::http(
            "demo",
            endpoint,
            reqwest::Client::new(),
            Duration::from_secs(5),
        );

        let init = conn.initialize().await.unwrap();
        assert_eq!(init["serverInfo"]["name"], "demo");

        let tools = conn.list_tools().await.unwrap();
        assert_eq!(tools.len(), 2);
        assert_eq!(tools[0].name, "say_hello");

        let result = conn.call_tool("say_hello", None).await.unwrap();
        assert_eq!(result["content"][0]["text"], "hello");
        conn.close().await;
    }

    #[tokio::test]
    async fn test_tool_error_is_never_a_transport_error() {
        let endpoint = serve(mcp_router()).await;
        let conn = Connection::http(
            "demo",
            endpoint,
            reqwest::Client::new(),
            Duration::from_secs(5),
        );
        let result = conn.call_tool("broken", None).await;
        match result {
            Err(StevedoreError::ToolExecution(name, message)) => {
                assert_eq!(name, "broken");
                assert_eq!(message, "tool exploded");
            }
            other => panic!("expected ToolExecution, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_tool_error_text_fallback() {
        let payload = serde_json::json!({"isError": true, "code": 7});
        assert!(tool_error_text(&payload).contains("\"code\":7"));
    }
}
