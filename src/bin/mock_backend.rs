//! Minimal line-delimited JSON-RPC tool server.
//!
//! Speaks just enough of the protocol for the gateway to link to it:
//! `initialize`, `tools/list` and `tools/call` with a single `echo` tool.
//! Used by the integration tests and for manual smoke runs.

use anyhow::Result;
use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    eprintln!("mock backend started");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();

    while let Some(line) = lines.next_line().await? {
        let Ok(message) = serde_json::from_str::<Value>(line.trim()) else {
            eprintln!("ignoring malformed line");
            continue;
        };
        let Some(id) = message.get("id").cloned() else {
            continue;
        };
        let method = message.get("method").and_then(Value::as_str).unwrap_or("");
        let reply = match handle(method, message.get("params")) {
            Ok(result) => json!({"jsonrpc": "2.0", "id": id, "result": result}),
            Err((code, msg)) => json!({"jsonrpc": "2.0", "id": id, "error": {"code": code, "message": msg}}),
        };
        stdout.write_all(format!("{reply}\n").as_bytes()).await?;
        stdout.flush().await?;
    }
    Ok(())
}

fn handle(method: &str, params: Option<&Value>) -> Result<Value, (i32, String)> {
    match method {
        "initialize" => Ok(json!({
            "protocolVersion": "2024-11-05",
            "capabilities": {"tools": {}},
            "serverInfo": {"name": "mock-backend", "version": env!("CARGO_PKG_VERSION")}
        })),
        "tools/list" => Ok(json!({
            "tools": [{
                "name": "echo",
                "description": "Return the given text",
                "inputSchema": {
                    "type": "object",
                    "properties": {"text": {"type": "string"}},
                    "required": ["text"]
                }
            }]
        })),
        "tools/call" => {
            let name = params
                .and_then(|p| p.get("name"))
                .and_then(Value::as_str)
                .unwrap_or("");
            if name != "echo" {
                return Err((-32602, format!("Unknown tool: {name}")));
            }
            let text = params
                .and_then(|p| p.pointer("/arguments/text"))
                .and_then(Value::as_str)
                .unwrap_or("");
            Ok(json!({"content": [{"type": "text", "text": text}]}))
        }
        "ping" => Ok(json!({})),
        other => Err((-32601, format!("Method not found: {other}"))),
    }
}
