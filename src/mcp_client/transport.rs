//! JSON-RPC over stdio transport.
//!
//! Handles low-level communication with one backend child process:
//! - Writing JSON-RPC requests and notifications to stdin
//! - A reader task that frames stdout and completes pending requests by `id`
//! - A stderr task that forwards diagnostic lines to the log
//!
//! Requests are correlated through a pending table keyed by a link-scoped,
//! monotonically increasing id. Each entry holds the sending half of a
//! oneshot channel; it is removed exactly once, either by the reader when the
//! matching response arrives or by the caller when its deadline passes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, LazyLock, PoisonError};
use std::time::Duration;

use regex::Regex;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::{oneshot, watch, Mutex};
use tokio::task::JoinHandle;

use super::errors::McpError;
use super::framing::LineFramer;
use super::types::{JsonRpcNotification, JsonRpcRequest, JsonRpcResponse};

// ─── Constants ───────────────────────────────────────────────────────────────

/// Default per-request deadline.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(90);

/// Read size for stdout chunks.
const READ_CHUNK: usize = 8 * 1024;

/// Progress and download chatter that package runners print on stderr.
///
/// Every alternative is anchored to the whole line, so a diagnostic that only
/// mentions a percentage or an install word still reaches the log.
static STDERR_NOISE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?ix)
        ^npm\s+(warn|notice|http|timing)\b
        | ^\s*(downloading|downloaded|installing|installed|resolved|prepared|audited|uninstalled)\s+
            (\d+\s+packages?\b | \S+\s+\(\d+(\.\d+)?\s?[kmg]i?b\)\s*$)
        | ^\s*(\[[\#=>.\s-]*\]\s*)?\d{1,3}(\.\d+)?\s?%\s*$
        | ^\s*[\x{2800}-\x{28FF}]
        | ^\s*[|/\\-]\s*$
        ",
    )
    .expect("stderr noise pattern is valid")
});

/// Whether a stderr line is progress noise that should not reach the log.
pub fn is_stderr_noise(line: &str) -> bool {
    STDERR_NOISE.is_match(line)
}

/// Level a stderr line is logged at, or `None` for blank lines.
fn stderr_level(line: &str) -> Option<tracing::Level> {
    if line.trim().is_empty() {
        None
    } else if is_stderr_noise(line) {
        Some(tracing::Level::TRACE)
    } else {
        Some(tracing::Level::WARN)
    }
}

type PendingTable = std::sync::Mutex<HashMap<u64, oneshot::Sender<JsonRpcResponse>>>;

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

// ─── Transport ───────────────────────────────────────────────────────────────

/// Bi-directional JSON-RPC transport over a child process's stdio.
pub struct StdioTransport {
    server_name: String,
    writer: Mutex<BoxedWriter>,
    pending: Arc<PendingTable>,
    next_id: AtomicU64,
    request_timeout: Duration,
    closed: watch::Receiver<bool>,
    reader_task: JoinHandle<()>,
}

impl StdioTransport {
    /// Wire a transport onto a process's stdin/stdout (or any byte pipes).
    ///
    /// Starts consuming `reader` immediately on a background task.
    pub fn new<W, R>(server_name: &str, writer: W, reader: R, request_timeout: Duration) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
        R: AsyncRead + Send + Unpin + 'static,
    {
        let pending: Arc<PendingTable> = Arc::new(std::sync::Mutex::new(HashMap::new()));
        let (closed_tx, closed_rx) = watch::channel(false);

        let reader_task = tokio::spawn(read_loop(
            server_name.to_string(),
            reader,
            Arc::clone(&pending),
            closed_tx,
        ));

        Self {
            server_name: server_name.to_string(),
            writer: Mutex::new(Box::new(writer)),
            pending,
            next_id: AtomicU64::new(1),
            request_timeout,
            closed: closed_rx,
            reader_task,
        }
    }

    /// Send a JSON-RPC request and wait for the response with the same id.
    ///
    /// Fails with `McpError::Timeout` if nothing arrives within the deadline.
    /// The backend is not told to stop; a late reply is dropped as unmatched.
    pub async fn request(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<JsonRpcResponse, McpError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        lock_pending(&self.pending).insert(id, tx);
        let _guard = PendingGuard {
            pending: &self.pending,
            id,
        };

        let req = JsonRpcRequest::new(id, method, params);
        let json = serde_json::to_string(&req).map_err(|e| McpError::Transport {
            server: self.server_name.clone(),
            reason: format!("failed to serialize request: {e}"),
        })?;
        self.write_line(json).await?;

        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(McpError::Transport {
                server: self.server_name.clone(),
                reason: "response channel dropped".into(),
            }),
            Err(_) => {
                tracing::warn!(
                    server = %self.server_name,
                    method,
                    id,
                    timeout_ms = self.request_timeout.as_millis() as u64,
                    "request timed out"
                );
                Err(McpError::Timeout {
                    method: method.to_string(),
                    timeout_ms: self.request_timeout.as_millis() as u64,
                })
            }
        }
    }

    /// Send a JSON-RPC notification (no response expected).
    pub async fn notify(
        &self,
        method: &str,
        params: Option<serde_json::Value>,
    ) -> Result<(), McpError> {
        let notification = JsonRpcNotification::new(method, params);
        let json = serde_json::to_string(&notification).map_err(|e| McpError::Transport {
            server: self.server_name.clone(),
            reason: format!("failed to serialize notification: {e}"),
        })?;
        self.write_line(json).await
    }

    /// Number of requests still waiting for a response.
    pub fn pending_count(&self) -> usize {
        lock_pending(&self.pending).len()
    }

    /// Whether the stdout stream has ended.
    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    /// A receiver that flips to `true` once stdout reaches EOF.
    pub fn closed(&self) -> watch::Receiver<bool> {
        self.closed.clone()
    }

    async fn write_line(&self, mut json: String) -> Result<(), McpError> {
        json.push('\n');

        let mut writer = self.writer.lock().await;
        writer
            .write_all(json.as_bytes())
            .await
            .map_err(|e| McpError::Transport {
                server: self.server_name.clone(),
                reason: format!("failed to write to stdin: {e}"),
            })?;
        writer.flush().await.map_err(|e| McpError::Transport {
            server: self.server_name.clone(),
            reason: format!("failed to flush stdin: {e}"),
        })
    }
}

impl Drop for StdioTransport {
    fn drop(&mut self) {
        self.reader_task.abort();
    }
}

/// Removes a pending entry when the waiting caller goes away, whatever the
/// reason (response, deadline, or the caller's future being dropped).
struct PendingGuard<'a> {
    pending: &'a PendingTable,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        lock_pending(self.pending).remove(&self.id);
    }
}

fn lock_pending(
    pending: &PendingTable,
) -> std::sync::MutexGuard<'_, HashMap<u64, oneshot::Sender<JsonRpcResponse>>> {
    pending.lock().unwrap_or_else(PoisonError::into_inner)
}

// ─── Background Tasks ────────────────────────────────────────────────────────

async fn read_loop<R>(
    server_name: String,
    mut reader: R,
    pending: Arc<PendingTable>,
    closed_tx: watch::Sender<bool>,
) where
    R: AsyncRead + Send + Unpin,
{
    let mut framer = LineFramer::new();
    let mut buf = vec![0u8; READ_CHUNK];

    loop {
        match reader.read(&mut buf).await {
            Ok(0) => {
                tracing::debug!(server = %server_name, "stdout closed");
                break;
            }
            Ok(n) => {
                for message in framer.push(&buf[..n]) {
                    dispatch(&server_name, &pending, message);
                }
            }
            Err(e) => {
                tracing::warn!(server = %server_name, error = %e, "failed to read stdout");
                break;
            }
        }
    }

    closed_tx.send_replace(true);
}

/// Route one parsed stdout object to the request waiting for it.
fn dispatch(server_name: &str, pending: &PendingTable, message: serde_json::Value) {
    let Some(response) = JsonRpcResponse::from_value(message.clone()) else {
        tracing::debug!(
            server = %server_name,
            method = message.get("method").and_then(|m| m.as_str()).unwrap_or(""),
            "ignoring backend-initiated message"
        );
        return;
    };

    let slot = lock_pending(pending).remove(&response.id);
    match slot {
        Some(tx) => {
            // Receiver may have timed out in the meantime; nothing to do then.
            let _ = tx.send(response);
        }
        None => {
            tracing::debug!(
                server = %server_name,
                id = response.id,
                "dropping response with no pending request"
            );
        }
    }
}

/// Forward a backend's stderr to the log, one line at a time.
///
/// Stderr is diagnostic text only and is never parsed as protocol traffic.
pub fn spawn_stderr_logger<R>(server_name: &str, stderr: R) -> JoinHandle<()>
where
    R: AsyncRead + Send + Unpin + 'static,
{
    let server_name = server_name.to_string();
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    let line = line.trim_end();
                    match stderr_level(line) {
                        Some(tracing::Level::TRACE) => tracing::trace!(server = %server_name, "{line}"),
                        Some(_) => tracing::warn!(server = %server_name, "{line}"),
                        None => {}
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::debug!(server = %server_name, error = %e, "stderr read failed");
                    break;
                }
            }
        }
    })
}

// ─── Response Helpers ────────────────────────────────────────────────────────

/// Extract the result from a JSON-RPC response, converting errors to `McpError`.
pub fn extract_result(response: JsonRpcResponse) -> Result<serde_json::Value, McpError> {
    if let Some(err) = response.error {
        return Err(McpError::ServerError {
            code: err.code,
            message: err.message,
            data: err.data,
        });
    }

    response.result.ok_or(McpError::ServerError {
        code: -32603,
        message: "response missing both result and error".into(),
        data: None,
    })
}

// ─── Tests ───────────────────────────────────────────────────────────────────
