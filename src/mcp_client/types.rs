//! Shared types for the backend links.
//!
//! JSON-RPC 2.0 message types and MCP protocol structures.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Protocol revision announced to backends and to gateway clients.
pub const PROTOCOL_VERSION: &str = "2024-11-05";

// ─── JSON-RPC 2.0 ───────────────────────────────────────────────────────────

/// JSON-RPC 2.0 request message.
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcRequest {
    pub jsonrpc: String,
    pub id: u64,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl JsonRpcRequest {
    /// Create a new JSON-RPC request.
    pub fn new(id: u64, method: &str, params: Option<serde_json::Value>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            id,
            method: method.to_string(),
            params,
        }
    }
}

/// JSON-RPC 2.0 notification (no `id`, no reply expected).
#[derive(Debug, Clone, Serialize)]
pub struct JsonRpcNotification {
    pub jsonrpc: String,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

impl JsonRpcNotification {
    pub fn new(method: &str, params: Option<serde_json::Value>) -> Self {
        Self {
            jsonrpc: "2.0".to_string(),
            method: method.to_string(),
            params,
        }
    }
}

/// JSON-RPC 2.0 response message (success or error).
#[derive(Debug, Clone, Deserialize)]
pub struct JsonRpcResponse {
    #[allow(dead_code)]
    #[serde(default)]
    pub jsonrpc: String,
    pub id: u64,
    #[serde(default)]
    pub result: Option<serde_json::Value>,
    #[serde(default)]
    pub error: Option<JsonRpcError>,
}

impl JsonRpcResponse {
    /// Try to read a parsed stdout object as a response to one of our requests.
    ///
    /// Returns `None` for server-initiated requests and notifications, and for
    /// responses whose `id` is not one we could have issued.
    pub fn from_value(value: serde_json::Value) -> Option<Self> {
        let obj = value.as_object()?;
        if obj.contains_key("method") {
            return None;
        }
        if !obj.contains_key("result") && !obj.contains_key("error") {
            return None;
        }
        serde_json::from_value(value).ok()
    }
}

/// JSON-RPC 2.0 error object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JsonRpcError {
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

// ─── MCP Protocol Types ──────────────────────────────────────────────────────

/// Tool descriptor as advertised by a backend's `tools/list`.
///
/// Fields the gateway does not interpret are carried through untouched so
/// clients see the descriptor the backend produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct McpToolDefinition {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default = "default_input_schema", rename = "inputSchema")]
    pub input_schema: serde_json::Value,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

fn default_input_schema() -> serde_json::Value {
    serde_json::json!({"type": "object", "properties": {}})
}

impl McpToolDefinition {
    /// Minimal descriptor, mostly useful in tests.
    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            description: None,
            input_schema: default_input_schema(),
            extra: serde_json::Map::new(),
        }
    }
}

/// Launch configuration for one backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// Working directory for the child process.
    #[serde(default)]
    pub cwd: Option<String>,
    /// Optional Python virtual environment. When set, `command` is resolved
    /// to `{venv}/bin/{command}` and `VIRTUAL_ENV` + `PATH` are injected.
    #[serde(default)]
    pub venv: Option<String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Inverse flag accepted for compatibility with `mcpServers`-style files.
    #[serde(default)]
    pub disabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            command: String::new(),
            args: Vec::new(),
            env: HashMap::new(),
            cwd: None,
            venv: None,
            enabled: default_enabled(),
            disabled: false,
        }
    }
}

impl ServerConfig {
    /// Whether this provider should get a link in new sessions.
    pub fn is_enabled(&self) -> bool {
        self.enabled && !self.disabled
    }
}

/// `initialize` response payload from a backend.
#[derive(Debug, Clone, Deserialize)]
pub struct InitializeResult {
    #[serde(default, rename = "protocolVersion")]
    pub protocol_version: Option<String>,
    #[serde(default)]
    #[allow(dead_code)]
    pub capabilities: serde_json::Value,
    #[serde(default, rename = "serverInfo")]
    pub server_info: Option<ServerInfo>,
}

/// Server info returned in the initialize response.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerInfo {
    pub name: Option<String>,
    pub version: Option<String>,
}

/// `tools/list` response payload.
#[derive(Debug, Clone, Deserialize)]
pub struct ToolsListResult {
    #[serde(default)]
    pub tools: Vec<McpToolDefinition>,
}

// ─── Standard MCP Error Codes ────────────────────────────────────────────────

/// Well-known JSON-RPC codes plus the gateway's own range.
pub mod error_codes {
    /// Invalid JSON was received.
    pub const PARSE_ERROR: i32 = -32700;
    /// The JSON sent is not a valid Request object.
    pub const INVALID_REQUEST: i32 = -32600;
    /// The method does not exist or is not available.
    pub const METHOD_NOT_FOUND: i32 = -32601;
    /// Invalid method parameters.
    pub const INVALID_PARAMS: i32 = -32602;
    /// Internal JSON-RPC error.
    pub const INTERNAL_ERROR: i32 = -32603;
    /// No session with the addressed identifier.
    pub const SESSION_NOT_FOUND: i32 = -32001;
    /// Tool name not present in the session catalog.
    pub const TOOL_NOT_FOUND: i32 = -32002;
    /// Catalog points at a provider the session has no link for.
    pub const PROVIDER_MISSING: i32 = -32003;
    /// Backend did not answer before the request deadline.
    pub const TIMEOUT: i32 = -32004;
    /// No provider enabled / bad configuration.
    pub const CONFIGURATION: i32 = -32005;
}

// ─── Tests ───────────────────────────────────────────────────────────────────
