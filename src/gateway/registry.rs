//! Session registry: maps session ids to live sessions.
//!
//! Sessions register on creation and leave on destroy. The registry never
//! holds its lock across a session's teardown, since `Session::destroy`
//! calls back into `forget`.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use super::errors::GatewayError;
use super::session::{Session, SessionOptions, SessionStatus};
use crate::config::GatewayConfig;
use crate::mcp_client::ServerConfig;

pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    /// Enabled providers, copied into every new session.
    servers: Vec<(String, ServerConfig)>,
    options: SessionOptions,
}

impl SessionRegistry {
    pub fn new(config: &GatewayConfig) -> Arc<Self> {
        Self::with_servers(
            config.enabled_servers(),
            SessionOptions::from(&config.gateway),
        )
    }

    pub fn with_servers(servers: Vec<(String, ServerConfig)>, options: SessionOptions) -> Arc<Self> {
        Arc::new(Self {
            sessions: RwLock::new(HashMap::new()),
            servers,
            options,
        })
    }

    /// Create and register a session, then initialize it in the background.
    ///
    /// The session is returned before its backends are up.
    pub async fn create(self: &Arc<Self>) -> Result<Arc<Session>, GatewayError> {
        if self.servers.is_empty() {
            return Err(GatewayError::Configuration {
                reason: "no providers are enabled".into(),
            });
        }

        let id = uuid::Uuid::new_v4().to_string();
        let session = Session::new(
            id.clone(),
            self.servers.clone(),
            self.options.clone(),
            Arc::downgrade(self),
        );
        self.sessions
            .write()
            .await
            .insert(id.clone(), Arc::clone(&session));
        tracing::info!(session = %id, providers = self.servers.len(), "session created");

        let init = Arc::clone(&session);
        tokio::spawn(async move {
            if let Err(e) = init.initialize().await {
                tracing::error!(session = %init.id(), error = %e, "session initialization failed");
            }
        });

        Ok(session)
    }

    pub async fn get(&self, id: &str) -> Result<Arc<Session>, GatewayError> {
        self.sessions
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| GatewayError::SessionNotFound {
                session_id: id.to_string(),
            })
    }

    /// Destroy and unregister a session.
    pub async fn remove(&self, id: &str) -> Result<(), GatewayError> {
        let session = self.sessions.write().await.remove(id);
        match session {
            Some(session) => {
                session.destroy().await;
                Ok(())
            }
            None => Err(GatewayError::SessionNotFound {
                session_id: id.to_string(),
            }),
        }
    }

    /// Drop the registry's handle without destroying. Called by the
    /// session itself on teardown.
    pub(crate) async fn forget(&self, id: &str) {
        if self.sessions.write().await.remove(id).is_some() {
            tracing::debug!(session = %id, "session unregistered");
        }
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    pub async fn snapshot(&self) -> Vec<SessionStatus> {
        let mut statuses: Vec<SessionStatus> = self
            .sessions
            .read()
            .await
            .values()
            .map(|s| s.status())
            .collect();
        statuses.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        statuses
    }

    /// Destroy every session. Used on shutdown.
    pub async fn shutdown_all(&self) {
        let sessions: Vec<Arc<Session>> = self.sessions.write().await.drain().map(|(_, s)| s).collect();
        let count = sessions.len();
        futures::future::join_all(sessions.iter().map(|s| s.destroy())).await;
        tracing::info!(sessions = count, "all sessions shut down");
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn broken_server() -> (String, ServerConfig) {
        (
            "broken".into(),
            ServerConfig {
                command: "definitely-not-a-real-binary-4f1c".into(),
                ..ServerConfig::default()
            },
        )
    }

    fn registry(grace_ms: u64) -> Arc<SessionRegistry> {
        SessionRegistry::with_servers(
            vec![broken_server()],
            SessionOptions {
                request_timeout: Duration::from_secs(2),
                grace_period: Duration::from_millis(grace_ms),
                tools_list_wait: Duration::from_secs(2),
            },
        )
    }

    #[tokio::test]
    async fn test_create_then_get() {
        let reg = registry(1_000);
        let session = reg.create().await.unwrap();
        let found = reg.get(session.id()).await.unwrap();
        assert!(Arc::ptr_eq(&session, &found));
        assert_eq!(reg.len().await, 1);
    }

    #[tokio::test]
    async fn test_ids_are_unique() {
        let reg = registry(1_000);
        let a = reg.create().await.unwrap();
        let b = reg.create().await.unwrap();
        assert_ne!(a.id(), b.id());
        assert_eq!(reg.len().await, 2);
    }

    #[tokio::test]
    async fn test_unknown_id_is_session_not_found() {
        let reg = registry(1_000);
        assert!(matches!(
            reg.get("missing").await,
            Err(GatewayError::SessionNotFound { .. })
        ));
        assert!(matches!(
            reg.remove("missing").await,
            Err(GatewayError::SessionNotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_no_enabled_providers_is_configuration_error() {
        let reg = SessionRegistry::with_servers(vec![], SessionOptions::default());
        assert!(matches!(
            reg.create().await,
            Err(GatewayError::Configuration { .. })
        ));
        assert!(reg.is_empty().await);
    }

    #[tokio::test]
    async fn test_remove_destroys_session() {
        let reg = registry(1_000);
        let session = reg.create().await.unwrap();
        reg.remove(session.id()).await.unwrap();
        assert!(session.is_destroyed());
        assert!(reg.is_empty().await);
    }

    #[tokio::test]
    async fn test_grace_expiry_unregisters() {
        let reg = registry(30);
        let session = reg.create().await.unwrap();
        let endpoint = uuid::Uuid::new_v4();
        let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
        session.attach(endpoint, tx);
        session.detach(endpoint);

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(session.is_destroyed());
        assert!(reg.get(session.id()).await.is_err());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_create_remove_and_expiry() {
        use futures::future::join_all;

        let reg = registry(0);
        let spawn_create = |reg: &Arc<SessionRegistry>| {
            let reg = Arc::clone(reg);
            tokio::spawn(async move { reg.create().await.unwrap() })
        };

        let first: Vec<Arc<Session>> = join_all((0..64).map(|_| spawn_create(&reg)))
            .await
            .into_iter()
            .map(Result::unwrap)
            .collect();
        assert_eq!(reg.len().await, 64);

        // Even sessions are removed, odd ones expire with a zero grace
        // period, and every fourth one also races an explicit remove
        // against its own expiry. Fresh sessions are created meanwhile.
        let churn: Vec<_> = first
            .iter()
            .enumerate()
            .map(|(i, session)| {
                let reg = Arc::clone(&reg);
                let session = Arc::clone(session);
                tokio::spawn(async move {
                    if i % 2 == 0 {
                        reg.remove(session.id()).await.unwrap();
                        return;
                    }
                    let endpoint = uuid::Uuid::new_v4();
                    let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
                    session.attach(endpoint, tx);
                    session.detach(endpoint);
                    if i % 4 == 3 {
                        let _ = reg.remove(session.id()).await;
                    }
                })
            })
            .collect();
        let second = join_all((0..16).map(|_| spawn_create(&reg)));
        let (churn, second) = tokio::join!(join_all(churn), second);
        for outcome in churn {
            outcome.unwrap();
        }
        let second: Vec<Arc<Session>> = second.into_iter().map(Result::unwrap).collect();

        tokio::time::sleep(Duration::from_millis(300)).await;

        assert!(first.iter().all(|s| s.is_destroyed()));
        assert!(second.iter().all(|s| !s.is_destroyed()));
        assert_eq!(reg.len().await, second.len());
        assert_eq!(reg.snapshot().await.len(), second.len());
        for session in &first {
            assert!(reg.get(session.id()).await.is_err());
        }
        for session in &second {
            assert!(reg.get(session.id()).await.is_ok());
        }
    }

    #[tokio::test]
    async fn test_shutdown_all() {
        let reg = registry(1_000);
        let a = reg.create().await.unwrap();
        let b = reg.create().await.unwrap();
        reg.shutdown_all().await;
        assert!(a.is_destroyed() && b.is_destroyed());
        assert!(reg.snapshot().await.is_empty());
    }
}
