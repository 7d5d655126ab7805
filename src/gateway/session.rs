//! Sessions: one client conversation fanned out over several backends.
//!
//! A session owns one `BackendLink` per enabled provider and exposes them as a
//! single tool surface. It also tracks the streaming endpoints attached to it:
//! every response is broadcast to all of them, and once the last endpoint
//! detaches a teardown timer starts. If nothing re-attaches within the grace
//! period the session destroys itself.
//!
//! Links are spawned and initialized in the background, so a session is
//! addressable before its backends are up. Callers that need the catalog
//! await the readiness gate (`wait_ready`) instead of polling.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError, RwLock, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::errors::GatewayError;
use super::registry::SessionRegistry;
use crate::config::GatewaySettings;
use crate::mcp_client::transport::DEFAULT_REQUEST_TIMEOUT;
use crate::mcp_client::{BackendLink, LinkState, ServerConfig, ToolCatalog};

/// Outbound channel of one attached endpoint.
pub type EndpointSender = mpsc::UnboundedSender<Value>;

// ─── Options & Status ────────────────────────────────────────────────────────

/// Timing knobs shared by every session of a registry.
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub request_timeout: Duration,
    pub grace_period: Duration,
    pub tools_list_wait: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            grace_period: Duration::from_secs(30),
            tools_list_wait: Duration::from_secs(30),
        }
    }
}

impl From<&GatewaySettings> for SessionOptions {
    fn from(settings: &GatewaySettings) -> Self {
        Self {
            request_timeout: settings.request_timeout(),
            grace_period: settings.session_grace(),
            tools_list_wait: settings.tools_list_wait(),
        }
    }
}

/// Where a session is in its startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionPhase {
    /// Created, links not built yet.
    Created,
    /// Links exist and are starting.
    Initializing,
    /// Every link has finished (successfully or not); catalog is built.
    Ready,
    /// Initialization could not begin (no providers).
    Failed,
}

impl SessionPhase {
    fn is_settled(self) -> bool {
        matches!(self, SessionPhase::Ready | SessionPhase::Failed)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LinkStatus {
    pub name: String,
    pub state: LinkState,
    pub tool_count: usize,
}

/// Point-in-time view of a session, for status endpoints and logs.
#[derive(Debug, Clone, Serialize)]
pub struct SessionStatus {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub phase: SessionPhase,
    pub endpoints: usize,
    pub tool_count: usize,
    pub links: Vec<LinkStatus>,
}

// ─── Session ─────────────────────────────────────────────────────────────────

pub struct Session {
    id: String,
    created_at: DateTime<Utc>,
    /// Enabled providers, in catalog registration order.
    servers: Vec<(String, ServerConfig)>,
    options: SessionOptions,
    /// Fixed once initialization begins.
    links: OnceLock<BTreeMap<String, Arc<BackendLink>>>,
    catalog: RwLock<ToolCatalog>,
    phase: watch::Sender<SessionPhase>,
    endpoints: Mutex<HashMap<Uuid, EndpointSender>>,
    teardown: Mutex<Option<JoinHandle<()>>>,
    /// Bumped on every arm and attach; a timer only fires for its own epoch.
    teardown_epoch: AtomicU64,
    destroyed: AtomicBool,
    registry: Weak<SessionRegistry>,
    this: Weak<Session>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("created_at", &self.created_at)
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Create a session. Nothing is spawned until `initialize()`.
    pub fn new(
        id: String,
        servers: Vec<(String, ServerConfig)>,
        options: SessionOptions,
        registry: Weak<SessionRegistry>,
    ) -> Arc<Self> {
        let (phase, _) = watch::channel(SessionPhase::Created);
        Arc::new_cyclic(|this| Self {
            id,
            created_at: Utc::now(),
            servers,
            options,
            links: OnceLock::new(),
            catalog: RwLock::new(ToolCatalog::new()),
            phase,
            endpoints: Mutex::new(HashMap::new()),
            teardown: Mutex::new(None),
            teardown_epoch: AtomicU64::new(0),
            destroyed: AtomicBool::new(false),
            registry,
            this: this.clone(),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    pub fn phase(&self) -> SessionPhase {
        *self.phase.borrow()
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::SeqCst)
    }

    /// Link for a provider, once initialization has begun.
    pub fn link(&self, provider: &str) -> Option<Arc<BackendLink>> {
        self.links.get().and_then(|links| links.get(provider).cloned())
    }

    // ─── Initialization ──────────────────────────────────────────────────

    /// Spawn one link per enabled provider and initialize them concurrently.
    ///
    /// Per-link failures are logged and only shrink the catalog. Fails with
    /// `Configuration` when no provider is enabled.
    pub async fn initialize(&self) -> Result<(), GatewayError> {
        if self.servers.is_empty() {
            self.phase.send_replace(SessionPhase::Failed);
            tracing::warn!(session = %self.id, "no providers enabled");
            return Err(GatewayError::Configuration {
                reason: "no providers are enabled".into(),
            });
        }

        let links = self
            .servers
            .iter()
            .map(|(name, cfg)| {
                Arc::new(BackendLink::with_timeout(
                    name,
                    cfg.clone(),
                    self.options.request_timeout,
                ))
            })
            .collect();
        self.initialize_links(links).await
    }

    /// Initialize with pre-built links.
    ///
    /// Links still in `Spawning` are started first; links that already have
    /// streams attached go straight to the handshake.
    pub async fn initialize_links(&self, links: Vec<Arc<BackendLink>>) -> Result<(), GatewayError> {
        let map: BTreeMap<String, Arc<BackendLink>> = links
            .into_iter()
            .map(|link| (link.name().to_string(), link))
            .collect();
        if self.links.set(map).is_err() {
            return Err(GatewayError::Internal {
                reason: format!("session '{}' initialized twice", self.id),
            });
        }
        let links: Vec<Arc<BackendLink>> = self
            .links
            .get()
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default();

        if self.is_destroyed() {
            self.phase.send_replace(SessionPhase::Failed);
            for link in &links {
                link.stop().await;
            }
            return Ok(());
        }
        self.phase.send_replace(SessionPhase::Initializing);

        tracing::info!(
            session = %self.id,
            providers = links.len(),
            "initializing backends"
        );

        let session_id = self.id.as_str();
        futures::future::join_all(links.iter().map(|link| {
            async move {
                if link.state() == LinkState::Spawning {
                    if let Err(e) = link.start().await {
                        tracing::warn!(session = %session_id, server = %link.name(), error = %e, "backend failed to start");
                        return;
                    }
                }
                if let Err(e) = link.initialize().await {
                    tracing::warn!(session = %session_id, server = %link.name(), error = %e, "backend handshake failed");
                }
            }
        }))
        .await;

        let tool_count = {
            let mut catalog = self.write_catalog();
            catalog.rebuild(links.iter().map(Arc::as_ref));
            catalog.len()
        };
        self.phase.send_replace(SessionPhase::Ready);

        let ready = links
            .iter()
            .filter(|l| l.state() == LinkState::Ready)
            .count();
        tracing::info!(
            session = %self.id,
            ready_links = ready,
            total_links = links.len(),
            tool_count,
            "session ready"
        );
        Ok(())
    }

    /// Wait until links exist (initialization has begun or failed).
    pub async fn wait_links(&self, timeout: Duration) -> bool {
        self.wait_phase(timeout, |p| *p != SessionPhase::Created).await
    }

    /// Wait until every link has finished initializing, up to `timeout`.
    pub async fn wait_ready(&self, timeout: Duration) -> bool {
        self.wait_phase(timeout, |p| p.is_settled()).await
    }

    async fn wait_phase(&self, timeout: Duration, pred: impl FnMut(&SessionPhase) -> bool) -> bool {
        let mut rx = self.phase.subscribe();
        let reached = tokio::time::timeout(timeout, rx.wait_for(pred))
            .await
            .is_ok_and(|changed| changed.is_ok());
        reached
    }

    // ─── Tools ───────────────────────────────────────────────────────────

    /// Aggregated tool descriptors, waiting for backends up to the
    /// configured bound.
    pub async fn list_tools(&self) -> Vec<Value> {
        if !self.wait_ready(self.options.tools_list_wait).await {
            tracing::warn!(session = %self.id, "tools/list answered before all backends finished");
        }
        self.read_catalog().tool_descriptors()
    }

    /// Route a tool call to the link that owns the tool.
    ///
    /// A call that arrives while backends are still starting waits on the
    /// same gate as `list_tools`.
    pub async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value, GatewayError> {
        if !self.phase().is_settled() {
            self.wait_ready(self.options.tools_list_wait).await;
        }
        let provider = self
            .read_catalog()
            .resolve(name)
            .map(|(server, _)| server.to_string())
            .ok_or_else(|| GatewayError::ToolNotFound {
                name: name.to_string(),
            })?;

        let link = self
            .link(&provider)
            .ok_or_else(|| GatewayError::ProviderMissing {
                provider: provider.clone(),
                tool: name.to_string(),
            })?;

        tracing::debug!(session = %self.id, server = %provider, tool = name, "routing tool call");
        Ok(link.call_tool(name, arguments).await?)
    }

    fn read_catalog(&self) -> std::sync::RwLockReadGuard<'_, ToolCatalog> {
        self.catalog.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_catalog(&self) -> std::sync::RwLockWriteGuard<'_, ToolCatalog> {
        self.catalog.write().unwrap_or_else(PoisonError::into_inner)
    }

    // ─── Endpoints ───────────────────────────────────────────────────────

    /// Attach a streaming endpoint. Cancels a pending teardown.
    pub fn attach(&self, endpoint: Uuid, sender: EndpointSender) {
        let count = {
            let mut endpoints = self.lock_endpoints();
            endpoints.insert(endpoint, sender);
            endpoints.len()
        };
        let cancelled = {
            let mut slot = self.lock_teardown();
            self.teardown_epoch.fetch_add(1, Ordering::SeqCst);
            slot.take()
        };
        if let Some(timer) = cancelled {
            timer.abort();
            tracing::debug!(session = %self.id, "teardown cancelled");
        }
        tracing::debug!(session = %self.id, %endpoint, endpoints = count, "endpoint attached");
    }

    /// Detach an endpoint. Arms the teardown timer when none remain.
    pub fn detach(&self, endpoint: Uuid) {
        let remaining = {
            let mut endpoints = self.lock_endpoints();
            endpoints.remove(&endpoint);
            endpoints.len()
        };
        tracing::debug!(session = %self.id, %endpoint, endpoints = remaining, "endpoint detached");
        if remaining == 0 && !self.is_destroyed() {
            self.arm_teardown();
        }
    }

    pub fn endpoint_count(&self) -> usize {
        self.lock_endpoints().len()
    }

    /// Whether a teardown timer is currently armed.
    pub fn teardown_armed(&self) -> bool {
        self.lock_teardown().is_some()
    }

    /// Send a message to every attached endpoint.
    pub fn broadcast(&self, message: &Value) {
        for sender in self.lock_endpoints().values() {
            // A closed endpoint is about to detach; skipping it is enough.
            let _ = sender.send(message.clone());
        }
    }

    fn arm_teardown(&self) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            tracing::warn!(session = %self.id, "no runtime to arm teardown timer");
            return;
        };
        let this = self.this.clone();
        let grace = self.options.grace_period;

        // The slot stays locked until the handle is stored, so the timer
        // cannot look at it early even with a zero grace period.
        let mut slot = self.lock_teardown();
        let epoch = self.teardown_epoch.fetch_add(1, Ordering::SeqCst) + 1;
        let timer = runtime.spawn(async move {
            tokio::time::sleep(grace).await;
            let Some(session) = this.upgrade() else {
                return;
            };
            {
                let mut slot = session.lock_teardown();
                if session.teardown_epoch.load(Ordering::SeqCst) != epoch {
                    return;
                }
                // Our own handle; taking it keeps destroy() from aborting us.
                slot.take();
            }
            if session.endpoint_count() == 0 {
                tracing::info!(session = %session.id, "grace period expired");
                session.destroy().await;
            }
        });
        if let Some(previous) = slot.replace(timer) {
            previous.abort();
        }
        drop(slot);
        tracing::debug!(session = %self.id, grace_ms = grace.as_millis() as u64, "teardown armed");
    }

    fn lock_endpoints(&self) -> MutexGuard<'_, HashMap<Uuid, EndpointSender>> {
        self.endpoints.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_teardown(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.teardown.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ─── Teardown ────────────────────────────────────────────────────────

    /// Stop every link, drop every endpoint and leave the registry.
    /// Idempotent.
    pub async fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(timer) = self.lock_teardown().take() {
            timer.abort();
        }

        if let Some(links) = self.links.get() {
            futures::future::join_all(links.values().map(|link| link.stop())).await;
        }
        self.lock_endpoints().clear();

        if let Some(registry) = self.registry.upgrade() {
            registry.forget(&self.id).await;
        }
        tracing::info!(session = %self.id, "session destroyed");
    }

    pub fn status(&self) -> SessionStatus {
        let catalog = self.read_catalog();
        let links = self
            .links
            .get()
            .map(|links| {
                links
                    .values()
                    .map(|link| LinkStatus {
                        name: link.name().to_string(),
                        state: link.state(),
                        tool_count: catalog.tools_for_server(link.name()),
                    })
                    .collect()
            })
            .unwrap_or_default();

        SessionStatus {
            id: self.id.clone(),
            created_at: self.created_at,
            phase: self.phase(),
            endpoints: self.endpoint_count(),
            tool_count: catalog.len(),
            links,
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncBufReadExt, AsyncWriteExt, BufReader};

    fn options(grace_ms: u64) -> SessionOptions {
        SessionOptions {
            request_timeout: Duration::from_secs(5),
            grace_period: Duration::from_millis(grace_ms),
            tools_list_wait: Duration::from_secs(5),
        }
    }

    fn session_with(servers: Vec<(String, ServerConfig)>, grace_ms: u64) -> Arc<Session> {
        Session::new("test".into(), servers, options(grace_ms), Weak::new())
    }

    /// In-memory backend exposing the given tools; `tools/call` echoes the
    /// provider name and arguments.
    fn fake_link(name: &str, tools: &[&str]) -> Arc<BackendLink> {
        let link = Arc::new(BackendLink::with_timeout(
            name,
            ServerConfig::default(),
            Duration::from_secs(5),
        ));
        let (our_stdin, their_stdin) = duplex(64 * 1024);
        let (mut their_stdout, our_stdout) = duplex(64 * 1024);
        link.attach_streams(our_stdin, our_stdout).unwrap();

        let provider = name.to_string();
        let tools: Vec<Value> = tools
            .iter()
            .map(|t| serde_json::json!({"name": t, "inputSchema": {"type": "object"}}))
            .collect();
        tokio::spawn(async move {
            let mut lines = BufReader::new(their_stdin).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let msg: Value = serde_json::from_str(&line).unwrap();
                let Some(id) = msg.get("id").cloned() else {
                    continue;
                };
                let result = match msg["method"].as_str().unwrap_or("") {
                    "initialize" => serde_json::json!({"protocolVersion": "2024-11-05"}),
                    "tools/list" => serde_json::json!({"tools": tools}),
                    "tools/call" => serde_json::json!({
                        "provider": provider,
                        "arguments": msg["params"]["arguments"],
                    }),
                    _ => continue,
                };
                let reply = serde_json::json!({"jsonrpc": "2.0", "id": id, "result": result});
                if their_stdout
                    .write_all(format!("{reply}\n").as_bytes())
                    .await
                    .is_err()
                {
                    break;
                }
            }
        });
        link
    }

    #[tokio::test]
    async fn test_zero_providers_is_configuration_error() {
        let session = session_with(vec![], 1_000);
        let err = session.initialize().await.unwrap_err();
        assert!(matches!(err, GatewayError::Configuration { .. }));
        assert_eq!(session.phase(), SessionPhase::Failed);
        assert_ne!(session.phase(), SessionPhase::Ready);
    }

    #[tokio::test]
    async fn test_calls_route_to_owning_link() {
        let session = session_with(vec![], 1_000);
        session
            .initialize_links(vec![fake_link("l1", &["a", "b"]), fake_link("l2", &["c"])])
            .await
            .unwrap();
        assert_eq!(session.phase(), SessionPhase::Ready);

        let result = session
            .call_tool("b", serde_json::json!({"x": 1}))
            .await
            .unwrap();
        assert_eq!(result["provider"], "l1");
        assert_eq!(result["arguments"]["x"], 1);

        let result = session.call_tool("c", serde_json::json!({})).await.unwrap();
        assert_eq!(result["provider"], "l2");

        let err = session.call_tool("z", serde_json::json!({})).await.unwrap_err();
        assert!(matches!(err, GatewayError::ToolNotFound { .. }));
    }

    #[tokio::test]
    async fn test_failed_link_does_not_abort_siblings() {
        let session = session_with(vec![], 1_000);
        let broken = Arc::new(BackendLink::new(
            "broken",
            ServerConfig {
                command: "definitely-not-a-real-binary-4f1c".into(),
                ..ServerConfig::default()
            },
        ));
        session
            .initialize_links(vec![broken, fake_link("good", &["echo"])])
            .await
            .unwrap();

        let tools = session.list_tools().await;
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0]["name"], "echo");

        let status = session.status();
        let broken = status.links.iter().find(|l| l.name == "broken").unwrap();
        assert_eq!(broken.state, LinkState::Failed);
    }

    #[tokio::test]
    async fn test_list_tools_waits_for_initialization() {
        let session = session_with(vec![], 1_000);
        let s = Arc::clone(&session);
        let lister = tokio::spawn(async move { s.list_tools().await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        session
            .initialize_links(vec![fake_link("l1", &["a"])])
            .await
            .unwrap();

        let tools = lister.await.unwrap();
        assert_eq!(tools.len(), 1);
    }

    #[tokio::test]
    async fn test_broadcast_reaches_every_endpoint() {
        let session = session_with(vec![], 1_000);
        let (tx1, mut rx1) = mpsc::unbounded_channel();
        let (tx2, mut rx2) = mpsc::unbounded_channel();
        session.attach(Uuid::new_v4(), tx1);
        session.attach(Uuid::new_v4(), tx2);

        session.broadcast(&serde_json::json!({"id": 1, "result": {}}));
        assert_eq!(rx1.recv().await.unwrap()["id"], 1);
        assert_eq!(rx2.recv().await.unwrap()["id"], 1);
    }

    #[tokio::test]
    async fn test_reattach_cancels_teardown() {
        let session = session_with(vec![], 50);
        let first = Uuid::new_v4();
        let (tx, _rx) = mpsc::unbounded_channel();
        session.attach(first, tx);
        session.detach(first);
        assert!(session.teardown_armed());

        let (tx, _rx2) = mpsc::unbounded_channel();
        session.attach(Uuid::new_v4(), tx);
        assert!(!session.teardown_armed());

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(!session.is_destroyed());
    }

    #[tokio::test]
    async fn test_teardown_fires_after_grace() {
        let session = session_with(vec![], 30);
        let endpoint = Uuid::new_v4();
        let (tx, _rx) = mpsc::unbounded_channel();
        session.attach(endpoint, tx);
        session.detach(endpoint);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(session.is_destroyed());
        assert!(!session.teardown_armed());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_zero_grace_teardown_always_fires() {
        let sessions: Vec<Arc<Session>> = (0..300)
            .map(|i| Session::new(format!("zero-{i}"), vec![], options(0), Weak::new()))
            .collect();
        for session in &sessions {
            let endpoint = Uuid::new_v4();
            let (tx, _rx) = mpsc::unbounded_channel();
            session.attach(endpoint, tx);
            session.detach(endpoint);
        }

        tokio::time::sleep(Duration::from_millis(500)).await;
        let leaked = sessions.iter().filter(|s| !s.is_destroyed()).count();
        assert_eq!(leaked, 0, "sessions left alive after a zero grace period");
        assert!(sessions.iter().all(|s| !s.teardown_armed()));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_stale_timer_does_not_fire_after_rearm() {
        let session = session_with(vec![], 200);
        let first = Uuid::new_v4();
        let (tx, _rx) = mpsc::unbounded_channel();
        session.attach(first, tx);
        session.detach(first);

        tokio::time::sleep(Duration::from_millis(120)).await;
        let second = Uuid::new_v4();
        let (tx, _rx2) = mpsc::unbounded_channel();
        session.attach(second, tx);
        session.detach(second);

        // The first timer's deadline has passed; the second one's has not.
        tokio::time::sleep(Duration::from_millis(140)).await;
        assert!(!session.is_destroyed());
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(session.is_destroyed());
    }

    #[tokio::test]
    async fn test_wait_ready_times_out_without_initialization() {
        let session = session_with(vec![], 1_000);
        assert!(!session.wait_ready(Duration::from_millis(30)).await);
        assert!(!session.wait_links(Duration::from_millis(30)).await);

        session
            .initialize_links(vec![fake_link("l1", &["a"])])
            .await
            .unwrap();
        assert!(session.wait_links(Duration::from_millis(30)).await);
        assert!(session.wait_ready(Duration::from_millis(30)).await);
    }

    #[tokio::test]
    async fn test_destroy_stops_links_and_is_idempotent() {
        let session = session_with(vec![], 1_000);
        let link = fake_link("l1", &["a"]);
        session
            .initialize_links(vec![Arc::clone(&link)])
            .await
            .unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        session.attach(Uuid::new_v4(), tx);

        session.destroy().await;
        session.destroy().await;
        assert!(session.is_destroyed());
        assert_eq!(link.state(), LinkState::Closed);
        assert_eq!(session.endpoint_count(), 0);
        // Endpoint channel is closed once the session drops its sender.
        assert!(rx.recv().await.is_none());
    }
}
