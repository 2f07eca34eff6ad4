//! Session lifecycle: creation, lookup, idle GC, orderly shutdown.

use crate::backend::BackendStatus;
use crate::registry::ServiceRegistry;
use crate::session::ProxySession;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

const SUBSCRIBE_RETRIES: u32 = 2;
const SUBSCRIBE_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Owns every proxy session. Sessions hold only a creation-time snapshot of
/// the registry: backends added later are not observed by existing sessions.
pub struct SessionManager {
    sessions: RwLock<HashMap<String, Arc<ProxySession>>>,
    registry: Arc<ServiceRegistry>,
    gc_interval: Duration,
    idle_timeout: Duration,
    http: reqwest::Client,
    shutdown_token: CancellationToken,
}

impl SessionManager {
    pub fn new(
        registry: Arc<ServiceRegistry>,
        gc_interval: Duration,
        idle_timeout: Duration,
        http: reqwest::Client,
    ) -> Arc<Self> {
        Arc::new(Self {
            sessions: RwLock::new(HashMap::new()),
            registry,
            gc_interval,
            idle_timeout,
            http,
            shutdown_token: CancellationToken::new(),
        })
    }

    pub fn registry(&self) -> &Arc<ServiceRegistry> {
        &self.registry
    }

    /// Create a session and subscribe it to every running backend. Does not
    /// wait for readiness; callers poll `is_ready`.
    pub async fn create(&self, workspace: &str) -> Arc<ProxySession> {
        let session = ProxySession::new(
            Uuid::new_v4().to_string(),
            workspace.to_string(),
            self.http.clone(),
        );

        for backend in self.registry.snapshot() {
            let mut attempt = 0;
            loop {
                match backend.status() {
                    BackendStatus::Running => {
                        session.subscribe(backend.name(), &backend.sse_url());
                        break;
                    }
                    BackendStatus::Starting if attempt < SUBSCRIBE_RETRIES => {
                        attempt += 1;
                        tracing::info!(
                            backend = %backend.name(),
                            attempt,
                            "backend still starting, retrying subscription"
                        );
                        tokio::time::sleep(SUBSCRIBE_RETRY_DELAY).await;
                    }
                    status => {
                        tracing::warn!(
                            backend = %backend.name(),
                            %status,
                            "skipping backend for new session"
                        );
                        break;
                    }
                }
            }
        }

        self.sessions
            .write()
            .insert(session.id().to_string(), Arc::clone(&session));
        tracing::info!(session = %session.id(), workspace, "proxy session created");
        session
    }

    pub fn get(&self, id: &str) -> Option<Arc<ProxySession>> {
        self.sessions.read().get(id).cloned()
    }

    /// Close and remove one session. Idempotent.
    pub async fn close(&self, id: &str) {
        let session = self.sessions.write().remove(id);
        if let Some(session) = session {
            session.close().await;
        }
    }

    /// Periodically collect sessions idle for longer than the timeout.
    pub fn spawn_gc_loop(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(manager.gc_interval);
            tick.tick().await;
            loop {
                tokio::select! {
                    () = manager.shutdown_token.cancelled() => return,
                    _ = tick.tick() => {}
                }
                manager.collect_idle().await;
            }
        });
    }

    async fn collect_idle(&self) {
        // Check and remove under one critical section; the (possibly slow)
        // close happens outside the lock.
        let expired: Vec<Arc<ProxySession>> = {
            let mut sessions = self.sessions.write();
            let ids: Vec<String> = sessions
                .iter()
                .filter(|(_, session)| session.idle_for() > self.idle_timeout)
                .map(|(id, _)| id.clone())
                .collect();
            ids.iter().filter_map(|id| sessions.remove(id)).collect()
        };
        for session in expired {
            tracing::info!(session = %session.id(), "collecting idle session");
            session.close().await;
        }
    }

    /// Close every session, then stop every backend.
    pub async fn shutdown(&self) {
        self.shutdown_token.cancel();
        tracing::info!("closing all proxy sessions");
        let sessions: Vec<Arc<ProxySession>> = {
            let mut map = self.sessions.write();
            map.drain().map(|(_, session)| session).collect()
        };
        for session in sessions {
            session.close().await;
        }
        self.registry.shutdown();
        tracing::info!("session manager closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GatewaySettings;

    fn manager(dir: &std::path::Path, gc: Duration, idle: Duration) -> Arc<SessionManager> {
        let http = reqwest::Client::new();
        let registry = ServiceRegistry::new(
            GatewaySettings {
                config_dir: dir.to_path_buf(),
                shim_command: "supergateway".to_string(),
                max_retries: 3,
                gc_interval: gc,
                idle_timeout: idle,
            },
            http.clone(),
        );
        SessionManager::new(registry, gc, idle, http)
    }

    #[tokio::test]
    async fn create_get_close_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(
            dir.path(),
            Duration::from_secs(300),
            Duration::from_secs(600),
        );
        let session = manager.create("default").await;
        let id = session.id().to_string();
        assert!(manager.get(&id).is_some());

        manager.close(&id).await;
        assert!(manager.get(&id).is_none());
        assert!(session.is_closed());
        // Idempotent.
        manager.close(&id).await;
    }

    #[tokio::test]
    async fn idle_sessions_are_collected_within_one_interval() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(
            dir.path(),
            Duration::from_millis(50),
            Duration::from_millis(100),
        );
        manager.spawn_gc_loop();

        let session = manager.create("default").await;
        let id = session.id().to_string();
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(manager.get(&id).is_none(), "idle session must be collected");
        assert!(session.is_closed());
    }

    #[tokio::test]
    async fn shutdown_closes_sessions_and_backends() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(
            dir.path(),
            Duration::from_secs(300),
            Duration::from_secs(600),
        );
        manager
            .registry()
            .deploy(
                "a",
                crate::config::McpServerConfig {
                    url: Some("http://localhost:9001".to_string()),
                    ..Default::default()
                },
            )
            .unwrap();
        let session = manager.create("default").await;

        manager.shutdown().await;
        assert!(manager.get(session.id()).is_none());
        assert!(manager.registry().get("a").is_none());
    }
}
