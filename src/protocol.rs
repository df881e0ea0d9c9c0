//! Line-delimited JSON-RPC 2.0 envelope types for talking to MCP servers.
//!
//! The platform proxies MCP rather than implementing it: requests are built
//! here, forwarded over stdio or HTTP by the connection layer, and responses
//! are returned verbatim to the caller. Only the envelope (id matching,
//! error objects) and the tool-list payload are interpreted.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// MCP method names the platform issues itself.
pub const METHOD_INITIALIZE: &str = "initialize";
pub const METHOD_TOOLS_LIST: &str = "tools/list";
pub const METHOD_TOOLS_CALL: &str = "tools/call";
pub const METHOD_RESOURCES_LIST: &str = "resources/list";
pub const METHOD_RESOURCES_READ: &str = "resources/read";

/// Protocol version sent in the `initialize` handshake.
pub const PROTOCOL_VERSION: &str = "2024-11-05";

/// Outgoing JSON-RPC 2.0 request.
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: &'static str,
    pub id: u64,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    pub fn new(id: u64, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: "2.0",
            id,
            method: method.into(),
            params,
        }
    }

    /// The `initialize` request with the platform's client info.
    pub fn initialize(id: u64) -> Self {
        Self::new(id, METHOD_INITIALIZE, Some(initialize_params()))
    }
}

/// Parameters of the `initialize` handshake.
pub fn initialize_params() -> Value {
    serde_json::json!({
        "protocolVersion": PROTOCOL_VERSION,
        "capabilities": {},
        "clientInfo": {
            "name": "stevedore",
            "version": env!("CARGO_PKG_VERSION"),
        },
    })
}

/// Incoming JSON-RPC 2.0 response.
#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcResponse {
    #[serde(default)]
    pub id: Option<Value>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<RpcError>,
}

impl JsonRpcResponse {
    /// Numeric request id, if the server echoed one back.
    pub fn request_id(&self) -> Option<u64> {
        self.id.as_ref().and_then(Value::as_u64)
    }
}

/// JSON-RPC error object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// A tool exposed by an MCP server. Belongs to a template, not a deployment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct McpTool {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(
        default = "default_input_schema",
        rename = "inputSchema",
        alias = "input_schema"
    )]
    pub input_schema: Value,
}

fn default_input_schema() -> Value {
    serde_json::json!({"type": "object", "properties": {}})
}

/// Parse the tool array out of a `tools/list` result payload.
pub fn tools_from_result(result: &Value) -> Option<Vec<McpTool>> {
    let raw = result.get("tools")?;
    serde_json::from_value(raw.clone()).ok()
}

/// True when a `tools/call` result is a structured negative result
/// (`isError: true`) rather than a transport failure.
pub fn is_tool_error(result: &Value) -> bool {
    result
        .get("isError")
        .and_then(Value::as_bool)
        .unwrap_or(false)
}
