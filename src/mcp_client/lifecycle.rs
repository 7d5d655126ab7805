//! Backend link lifecycle.
//!
//! A `BackendLink` exclusively owns one backend child process: it spawns it,
//! performs the MCP handshake, records the advertised tools, forwards
//! requests, and kills the process on teardown.
//!
//! State machine:
//!
//! ```text
//! Spawning ──start()──▶ AwaitingHandshake ──initialize()──▶ Ready
//!    │
//!    └──spawn error──▶ Failed
//!
//! any state ──stdout EOF / stop()──▶ Closed
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, PoisonError, RwLock};
use std::time::Duration;

use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::{Child, Command};
use tokio::sync::{watch, Mutex};

use super::errors::McpError;
use super::launcher;
use super::transport::{self, StdioTransport, DEFAULT_REQUEST_TIMEOUT};
use super::types::{InitializeResult, McpToolDefinition, ServerConfig, ToolsListResult, PROTOCOL_VERSION};

/// Client identity sent in the `initialize` handshake.
const CLIENT_NAME: &str = "stdio-gateway";

/// Lifecycle state of a backend link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkState {
    Spawning,
    AwaitingHandshake,
    Ready,
    Failed,
    Closed,
}

// ─── BackendLink ─────────────────────────────────────────────────────────────

/// Supervisor of one backend process and its JSON-RPC transport.
pub struct BackendLink {
    /// Provider name from configuration (e.g., "filesystem").
    name: String,
    config: ServerConfig,
    request_timeout: Duration,
    state: Arc<watch::Sender<LinkState>>,
    transport: OnceLock<StdioTransport>,
    /// The child process handle; `None` before start and after stop.
    process: Mutex<Option<Child>>,
    /// Tool definitions received during initialization.
    tools: RwLock<Vec<McpToolDefinition>>,
    /// Set by `stop()`; a stopped link never launches a process again.
    stopped: AtomicBool,
}

impl BackendLink {
    /// Create a link in the `Spawning` state. Nothing is launched yet.
    pub fn new(name: &str, config: ServerConfig) -> Self {
        Self::with_timeout(name, config, DEFAULT_REQUEST_TIMEOUT)
    }

    /// Create a link with a non-default per-request deadline.
    pub fn with_timeout(name: &str, config: ServerConfig, request_timeout: Duration) -> Self {
        let (state, _) = watch::channel(LinkState::Spawning);
        Self {
            name: name.to_string(),
            config,
            request_timeout,
            state: Arc::new(state),
            transport: OnceLock::new(),
            process: Mutex::new(None),
            tools: RwLock::new(Vec::new()),
            stopped: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> LinkState {
        *self.state.borrow()
    }

    /// Tools advertised by the backend after a successful handshake.
    pub fn tools(&self) -> Vec<McpToolDefinition> {
        self.tools
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Requests still awaiting a response.
    pub fn pending_count(&self) -> usize {
        self.transport.get().map_or(0, StdioTransport::pending_count)
    }

    // ─── Spawning ────────────────────────────────────────────────────────

    /// Launch the backend process and start consuming its output streams.
    ///
    /// On failure the link moves to `Failed` and stays there.
    pub async fn start(&self) -> Result<(), McpError> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(self.spawn_failed("link was stopped".into()));
        }
        let spec = launcher::resolve(&self.config);

        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args);
        cmd.envs(&spec.env);
        if let Some(dir) = &spec.cwd {
            cmd.current_dir(dir);
        }

        // Windows: prevent console window from appearing for child processes
        #[cfg(target_os = "windows")]
        {
            const CREATE_NO_WINDOW: u32 = 0x08000000;
            cmd.creation_flags(CREATE_NO_WINDOW);
        }

        // Wire stdio for JSON-RPC
        cmd.stdin(std::process::Stdio::piped());
        cmd.stdout(std::process::Stdio::piped());
        cmd.stderr(std::process::Stdio::piped());
        cmd.kill_on_drop(true);

        tracing::info!(
            server = %self.name,
            program = %spec.program,
            args = ?spec.args,
            "spawning backend"
        );

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => return Err(self.spawn_failed(format!("{e}"))),
        };

        let Some(stdin) = child.stdin.take() else {
            return Err(self.spawn_failed("failed to capture stdin".into()));
        };
        let Some(stdout) = child.stdout.take() else {
            return Err(self.spawn_failed("failed to capture stdout".into()));
        };
        if let Some(stderr) = child.stderr.take() {
            transport::spawn_stderr_logger(&self.name, stderr);
        }

        {
            let mut slot = self.process.lock().await;
            if self.stopped.load(Ordering::SeqCst) {
                drop(slot);
                let _ = child.kill().await;
                return Err(self.spawn_failed("link was stopped during spawn".into()));
            }
            *slot = Some(child);
        }
        self.attach_streams(stdin, stdout)
    }

    /// Attach already-open pipes instead of spawning a process.
    ///
    /// `start()` goes through here; tests use it with in-memory pipes.
    pub fn attach_streams<W, R>(&self, writer: W, reader: R) -> Result<(), McpError>
    where
        W: AsyncWrite + Send + Unpin + 'static,
        R: AsyncRead + Send + Unpin + 'static,
    {
        let transport = StdioTransport::new(&self.name, writer, reader, self.request_timeout);
        let mut closed = transport.closed();

        if self.transport.set(transport).is_err() {
            return Err(McpError::Transport {
                server: self.name.clone(),
                reason: "link already started".into(),
            });
        }
        self.state.send_replace(LinkState::AwaitingHandshake);

        let state = Arc::clone(&self.state);
        let name = self.name.clone();
        tokio::spawn(async move {
            if closed.wait_for(|c| *c).await.is_ok() {
                tracing::info!(server = %name, "backend output closed");
                state.send_replace(LinkState::Closed);
            }
        });

        Ok(())
    }

    fn spawn_failed(&self, reason: String) -> McpError {
        self.state.send_replace(LinkState::Failed);
        tracing::error!(server = %self.name, reason = %reason, "backend failed to start");
        McpError::SpawnFailed {
            name: self.name.clone(),
            reason,
        }
    }

    // ─── Handshake ───────────────────────────────────────────────────────

    /// Perform the MCP handshake and discover tools.
    ///
    /// `initialize` → `notifications/initialized` → `tools/list`. The link
    /// becomes `Ready` as soon as `initialize` succeeds; a later failure in
    /// the tool listing still surfaces as `HandshakeFailed`.
    pub async fn initialize(&self) -> Result<(), McpError> {
        let params = serde_json::json!({
            "protocolVersion": PROTOCOL_VERSION,
            "capabilities": {},
            "clientInfo": {
                "name": CLIENT_NAME,
                "version": env!("CARGO_PKG_VERSION"),
            },
        });

        let result = self
            .request("initialize", Some(params))
            .await
            .map_err(|e| self.handshake_failed(e))?;

        match serde_json::from_value::<InitializeResult>(result) {
            Ok(init) => {
                let info = init.server_info.as_ref();
                tracing::debug!(
                    server = %self.name,
                    protocol_version = init.protocol_version.as_deref().unwrap_or("unknown"),
                    backend_name = info.and_then(|i| i.name.as_deref()).unwrap_or("unknown"),
                    backend_version = info.and_then(|i| i.version.as_deref()).unwrap_or("unknown"),
                    "backend initialized"
                );
            }
            Err(e) => {
                tracing::debug!(server = %self.name, error = %e, "unrecognized initialize result");
            }
        }

        self.state.send_if_modified(|s| {
            if *s == LinkState::AwaitingHandshake {
                *s = LinkState::Ready;
                true
            } else {
                false
            }
        });

        self.notify("notifications/initialized", None)
            .await
            .map_err(|e| self.handshake_failed(e))?;

        let listed = self
            .request("tools/list", None)
            .await
            .map_err(|e| self.handshake_failed(e))?;
        let listed: ToolsListResult =
            serde_json::from_value(listed).map_err(|e| McpError::HandshakeFailed {
                name: self.name.clone(),
                reason: format!("failed to parse tools/list response: {e}"),
            })?;

        tracing::info!(
            server = %self.name,
            tool_count = listed.tools.len(),
            "backend ready"
        );
        *self.tools.write().unwrap_or_else(PoisonError::into_inner) = listed.tools;
        Ok(())
    }

    fn handshake_failed(&self, error: McpError) -> McpError {
        McpError::HandshakeFailed {
            name: self.name.clone(),
            reason: error.to_string(),
        }
    }

    // ─── Requests ────────────────────────────────────────────────────────

    fn transport(&self) -> Result<&StdioTransport, McpError> {
        self.transport.get().ok_or_else(|| McpError::NotStarted {
            name: self.name.clone(),
        })
    }

    /// Send a request and return its `result`, or the backend's error.
    pub async fn request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<serde_json::Value, McpError> {
        let response = self.transport()?.request(method, params).await?;
        transport::extract_result(response)
    }

    /// Fire-and-forget notification.
    pub async fn notify(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<(), McpError> {
        self.transport()?.notify(method, params).await
    }

    /// Invoke a tool on this backend and return its result unchanged.
    pub async fn call_tool(
        &self,
        name: &str,
        arguments: serde_json::Value,
    ) -> Result<serde_json::Value, McpError> {
        let params = serde_json::json!({
            "name": name,
            "arguments": arguments,
        });
        self.request("tools/call", Some(params)).await
    }

    // ─── Teardown ────────────────────────────────────────────────────────

    /// Kill the backend process. Safe to call repeatedly; never fails.
    pub async fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        let child = self.process.lock().await.take();
        if let Some(mut child) = child {
            match child.kill().await {
                Ok(()) => tracing::info!(server = %self.name, "backend stopped"),
                Err(e) => tracing::debug!(server = %self.name, error = %e, "kill failed (already exited?)"),
            }
        }
        self.state.send_if_modified(|s| {
            if *s == LinkState::Failed || *s == LinkState::Closed {
                false
            } else {
                *s = LinkState::Closed;
                true
            }
        });
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncBufReadExt, AsyncWriteExt, BufReader};

    /// Spawn a scripted in-memory backend that answers the handshake and
    /// echoes `tools/call` arguments back.
    fn scripted_link(timeout: Duration, fail_initialize: bool) -> Arc<BackendLink> {
        let link = Arc::new(BackendLink::with_timeout(
            "scripted",
            ServerConfig::default(),
            timeout,
        ));
        let (our_stdin, their_stdin) = duplex(64 * 1024);
        let (mut their_stdout, our_stdout) = duplex(64 * 1024);
        link.attach_streams(our_stdin, our_stdout).unwrap();

        tokio::spawn(async move {
            let mut lines = BufReader::new(their_stdin).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let msg: serde_json::Value = serde_json::from_str(&line).unwrap();
                let Some(id) = msg.get("id").cloned() else {
                    continue;
                };
                let reply = match msg["method"].as_str().unwrap_or("") {
                    "initialize" if fail_initialize => serde_json::json!({
                        "jsonrpc": "2.0", "id": id,
                        "error": {"code": -32603, "message": "boom"}
                    }),
                    "initialize" => serde_json::json!({
                        "jsonrpc": "2.0", "id": id,
                        "result": {"protocolVersion": PROTOCOL_VERSION, "capabilities": {},
                                   "serverInfo": {"name": "scripted", "version": "1"}}
                    }),
                    "tools/list" => serde_json::json!({
                        "jsonrpc": "2.0", "id": id,
                        "result": {"tools": [{"name": "echo", "inputSchema": {"type": "object"}}]}
                    }),
                    "tools/call" => serde_json::json!({
                        "jsonrpc": "2.0", "id": id,
                        "result": {"content": [{"type": "text",
                                    "text": msg["params"]["arguments"]["text"]}]}
                    }),
                    // Anything else is left unanswered.
                    _ => continue,
                };
                let out = format!("{reply}\n");
                if their_stdout.write_all(out.as_bytes()).await.is_err() {
                    break;
                }
            }
        });

        link
    }

    #[tokio::test]
    async fn test_new_link_is_spawning() {
        let link = BackendLink::new("idle", ServerConfig::default());
        assert_eq!(link.state(), LinkState::Spawning);
        assert!(link.tools().is_empty());
        assert_eq!(link.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_request_before_start_fails() {
        let link = BackendLink::new("idle", ServerConfig::default());
        let err = link.request("ping", None).await.unwrap_err();
        assert!(matches!(err, McpError::NotStarted { .. }));
    }

    #[tokio::test]
    async fn test_initialize_reaches_ready_and_lists_tools() {
        let link = scripted_link(Duration::from_secs(5), false);
        assert_eq!(link.state(), LinkState::AwaitingHandshake);

        link.initialize().await.unwrap();
        assert_eq!(link.state(), LinkState::Ready);
        let tools = link.tools();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name, "echo");
    }

    #[tokio::test]
    async fn test_initialize_error_is_handshake_failure() {
        let link = scripted_link(Duration::from_secs(5), true);
        let err = link.initialize().await.unwrap_err();
        assert!(matches!(err, McpError::HandshakeFailed { .. }));
        assert_eq!(link.state(), LinkState::AwaitingHandshake);
        assert!(link.tools().is_empty());
    }

    #[tokio::test]
    async fn test_call_tool_returns_backend_result() {
        let link = scripted_link(Duration::from_secs(5), false);
        link.initialize().await.unwrap();

        let result = link
            .call_tool("echo", serde_json::json!({"text": "hi"}))
            .await
            .unwrap();
        assert_eq!(result["content"][0]["text"], "hi");
    }

    #[tokio::test]
    async fn test_concurrent_calls_on_one_link() {
        let link = scripted_link(Duration::from_secs(5), false);
        link.initialize().await.unwrap();

        let calls = (0..10).map(|i| {
            let link = Arc::clone(&link);
            async move {
                link.call_tool("echo", serde_json::json!({"text": format!("m{i}")}))
                    .await
                    .unwrap()
            }
        });
        let results = futures::future::join_all(calls).await;
        for (i, result) in results.iter().enumerate() {
            assert_eq!(result["content"][0]["text"], format!("m{i}"));
        }
        assert_eq!(link.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_unanswered_request_times_out() {
        let link = scripted_link(Duration::from_millis(50), false);
        let err = link.request("never/answered", None).await.unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(link.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_start_with_missing_binary_fails() {
        let link = BackendLink::new(
            "ghost",
            ServerConfig {
                command: "definitely-not-a-real-binary-4f1c".into(),
                ..ServerConfig::default()
            },
        );
        let err = link.start().await.unwrap_err();
        assert!(matches!(err, McpError::SpawnFailed { .. }));
        assert_eq!(link.state(), LinkState::Failed);
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let link = scripted_link(Duration::from_secs(5), false);
        link.stop().await;
        link.stop().await;
        assert_eq!(link.state(), LinkState::Closed);

        let never_started = BackendLink::new("idle", ServerConfig::default());
        never_started.stop().await;
        never_started.stop().await;
    }
}
