//! Gateway error types and their JSON-RPC mapping.

use serde_json::{json, Value};
use thiserror::Error;

use crate::mcp_client::types::error_codes;
use crate::mcp_client::McpError;

/// Errors surfaced at the session boundary.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// No provider enabled, or the configuration could not be used.
    #[error("configuration error: {reason}")]
    Configuration { reason: String },

    /// Tool name not present in the session catalog.
    #[error("tool not found: '{name}'")]
    ToolNotFound { name: String },

    /// Catalog resolved to a provider the session holds no link for.
    #[error("provider '{provider}' for tool '{tool}' is not available")]
    ProviderMissing { provider: String, tool: String },

    /// Unknown session identifier.
    #[error("session not found: '{session_id}'")]
    SessionNotFound { session_id: String },

    /// Inbound body was not valid JSON.
    #[error("parse error: {reason}")]
    ParseError { reason: String },

    /// Valid JSON, but not a JSON-RPC object.
    #[error("invalid request: {reason}")]
    InvalidRequest { reason: String },

    /// Method not handled at the session boundary.
    #[error("method not found: '{method}'")]
    MethodNotFound { method: String },

    /// Missing or ill-typed request parameters.
    #[error("invalid params: {reason}")]
    InvalidParams { reason: String },

    /// Failure inside a backend link.
    #[error(transparent)]
    Backend(#[from] McpError),

    /// Anything else; detail is logged, never sent to clients.
    #[error("internal error: {reason}")]
    Internal { reason: String },
}

impl GatewayError {
    /// Numeric JSON-RPC error code for this error.
    pub fn code(&self) -> i32 {
        match self {
            GatewayError::Configuration { .. } => error_codes::CONFIGURATION,
            GatewayError::ToolNotFound { .. } => error_codes::TOOL_NOT_FOUND,
            GatewayError::ProviderMissing { .. } => error_codes::PROVIDER_MISSING,
            GatewayError::SessionNotFound { .. } => error_codes::SESSION_NOT_FOUND,
            GatewayError::ParseError { .. } => error_codes::PARSE_ERROR,
            GatewayError::InvalidRequest { .. } => error_codes::INVALID_REQUEST,
            GatewayError::MethodNotFound { .. } => error_codes::METHOD_NOT_FOUND,
            GatewayError::InvalidParams { .. } => error_codes::INVALID_PARAMS,
            GatewayError::Backend(McpError::ServerError { code, .. }) => *code,
            GatewayError::Backend(McpError::Timeout { .. }) => error_codes::TIMEOUT,
            GatewayError::Backend(_) | GatewayError::Internal { .. } => {
                error_codes::INTERNAL_ERROR
            }
        }
    }

    /// JSON-RPC `error` member for this error.
    pub fn error_object(&self) -> Value {
        match self {
            GatewayError::Backend(McpError::ServerError {
                code,
                message,
                data,
            }) => {
                let mut obj = json!({ "code": code, "message": message });
                if let Some(data) = data {
                    obj["data"] = data.clone();
                }
                obj
            }
            GatewayError::Backend(McpError::Timeout { .. }) => {
                json!({ "code": self.code(), "message": self.to_string() })
            }
            GatewayError::Backend(_) | GatewayError::Internal { .. } => {
                json!({ "code": self.code(), "message": "Internal error" })
            }
            _ => json!({ "code": self.code(), "message": self.to_string() }),
        }
    }

    /// Full JSON-RPC error response addressed to `id`.
    pub fn to_json_rpc(&self, id: Value) -> Value {
        json!({
            "jsonrpc": "2.0",
            "id": id,
            "error": self.error_object(),
        })
    }
}

/// Full JSON-RPC success response addressed to `id`.
pub fn json_rpc_result(id: Value, result: Value) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "result": result,
    })
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_boundary_codes() {
        let err = GatewayError::SessionNotFound {
            session_id: "nope".into(),
        };
        let resp = err.to_json_rpc(Value::Null);
        assert_eq!(resp["error"]["code"], error_codes::SESSION_NOT_FOUND);
        assert!(resp["error"]["message"].as_str().unwrap().contains("nope"));

        let err = GatewayError::MethodNotFound {
            method: "resources/list".into(),
        };
        assert_eq!(err.code(), error_codes::METHOD_NOT_FOUND);
        let err = GatewayError::ParseError {
            reason: "eof".into(),
        };
        assert_eq!(err.code(), error_codes::PARSE_ERROR);
        let err = GatewayError::InvalidRequest {
            reason: "batch".into(),
        };
        assert_eq!(err.code(), error_codes::INVALID_REQUEST);
    }

    #[test]
    fn test_backend_error_is_relayed() {
        let err = GatewayError::from(McpError::ServerError {
            code: -32602,
            message: "Unknown tool: foo".into(),
            data: Some(json!({"hint": "bar"})),
        });
        let resp = err.to_json_rpc(json!(7));
        assert_eq!(resp["id"], 7);
        assert_eq!(resp["error"]["code"], -32602);
        assert_eq!(resp["error"]["message"], "Unknown tool: foo");
        assert_eq!(resp["error"]["data"]["hint"], "bar");
    }

    #[test]
    fn test_internal_detail_is_not_leaked() {
        let err = GatewayError::from(McpError::Transport {
            server: "fs".into(),
            reason: "failed to write to stdin: broken pipe at /secret/path".into(),
        });
        let obj = err.error_object();
        assert_eq!(obj["code"], error_codes::INTERNAL_ERROR);
        assert_eq!(obj["message"], "Internal error");
    }

    #[test]
    fn test_timeout_has_own_code() {
        let err = GatewayError::from(McpError::Timeout {
            method: "tools/call".into(),
            timeout_ms: 90_000,
        });
        assert_eq!(err.code(), error_codes::TIMEOUT);
        assert!(err.error_object()["message"]
            .as_str()
            .unwrap()
            .contains("timed out"));
    }

    #[test]
    fn test_result_envelope() {
        let resp = json_rpc_result(json!("abc"), json!({}));
        assert_eq!(resp["jsonrpc"], "2.0");
        assert_eq!(resp["id"], "abc");
        assert!(resp["result"].is_object());
    }
}
