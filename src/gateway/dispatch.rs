//! JSON-RPC dispatch at the session boundary.
//!
//! Supported methods:
//! - `initialize`: gateway capabilities + server info
//! - `notifications/initialized`: client ack (no-op)
//! - `tools/list`: aggregated catalog of every ready backend
//! - `tools/call`: routed to the backend that owns the tool
//! - `ping`: empty result
//!
//! Anything else is `MethodNotFound`. Messages without an `id` are
//! notifications and never get a reply.

use serde_json::{json, Value};

use super::errors::{json_rpc_result, GatewayError};
use super::session::Session;
use crate::mcp_client::types::PROTOCOL_VERSION;

const SERVER_NAME: &str = "stdio-gateway";

/// Handle one inbound message and broadcast the reply, if any, to every
/// endpoint attached to the session.
pub async fn process(session: &Session, message: Value) {
    if let Some(reply) = handle(session, &message).await {
        session.broadcast(&reply);
    }
}

/// Handle one inbound message. Returns the full JSON-RPC response, or `None`
/// for notifications.
pub async fn handle(session: &Session, message: &Value) -> Option<Value> {
    let method = message.get("method").and_then(Value::as_str);
    let id = message.get("id").cloned();

    tracing::debug!(
        session = %session.id(),
        method = method.unwrap_or(""),
        "inbound message"
    );

    let Some(method) = method else {
        // Responses from the client (e.g. to server requests) are not routed.
        tracing::debug!(session = %session.id(), "dropping message without method");
        return None;
    };

    let outcome = match method {
        "initialize" => handle_initialize(session).await,
        "notifications/initialized" => Ok(Value::Null),
        "ping" => Ok(json!({})),
        "tools/list" => Ok(json!({ "tools": session.list_tools().await })),
        "tools/call" => handle_tools_call(session, message.get("params")).await,
        other => Err(GatewayError::MethodNotFound {
            method: other.to_string(),
        }),
    };

    let id = id?;
    Some(match outcome {
        Ok(result) => json_rpc_result(id, result),
        Err(e) => {
            tracing::warn!(session = %session.id(), method, error = %e, "request failed");
            e.to_json_rpc(id)
        }
    })
}

// ── initialize ──────────────────────────────────────────────────────────────

async fn handle_initialize(session: &Session) -> Result<Value, GatewayError> {
    if !session.wait_links(session.options().tools_list_wait).await {
        return Err(GatewayError::Internal {
            reason: format!("session '{}' did not start its backends", session.id()),
        });
    }
    Ok(json!({
        "protocolVersion": PROTOCOL_VERSION,
        "capabilities": {
            "tools": { "listChanged": false }
        },
        "serverInfo": {
            "name": SERVER_NAME,
            "version": env!("CARGO_PKG_VERSION")
        }
    }))
}

// ── tools/call ──────────────────────────────────────────────────────────────

async fn handle_tools_call(session: &Session, params: Option<&Value>) -> Result<Value, GatewayError> {
    let params = params.ok_or_else(|| GatewayError::InvalidParams {
        reason: "missing params".into(),
    })?;
    let name = params
        .get("name")
        .and_then(Value::as_str)
        .ok_or_else(|| GatewayError::InvalidParams {
            reason: "missing 'name' in params".into(),
        })?;
    let arguments = params.get("arguments").cloned().unwrap_or_else(|| json!({}));

    session.call_tool(name, arguments).await
}

// ─── Tests ───────────────────────────────────────────────────────────────────
