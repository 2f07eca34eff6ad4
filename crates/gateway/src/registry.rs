//! Keyed set of backend supervisors with persisted declarations.

use crate::backend::{BackendInfo, McpBackend};
use crate::config::{self, GatewaySettings, McpServerConfig};
use crate::error::{GatewayError, Result};
use crate::ports::PortAllocator;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// Owns every backend. All mutations go through the single writer lock
/// around the map; after each one the declared `name → config` set is
/// persisted atomically (persistence failure is logged, never fatal).
pub struct ServiceRegistry {
    backends: RwLock<HashMap<String, Arc<McpBackend>>>,
    ports: Arc<PortAllocator>,
    settings: GatewaySettings,
    http: reqwest::Client,
}

impl ServiceRegistry {
    pub fn new(settings: GatewaySettings, http: reqwest::Client) -> Arc<Self> {
        Arc::new(Self {
            backends: RwLock::new(HashMap::new()),
            ports: Arc::new(PortAllocator::new()),
            settings,
            http,
        })
    }

    /// Redeploy every backend persisted by a previous run. Individual
    /// failures are logged and skipped so one broken declaration does not
    /// keep the gateway down.
    pub fn load_persisted(self: &Arc<Self>) {
        let path = self.settings.mcp_config_path();
        let persisted = match config::load_persisted(&path) {
            Ok(persisted) => persisted,
            Err(e) => {
                tracing::warn!(path = ?path, error = %e, "failed to load persisted config");
                return;
            }
        };
        for (name, server_config) in persisted {
            tracing::info!(backend = %name, "redeploying persisted backend");
            if let Err(e) = self.deploy(&name, server_config) {
                tracing::error!(backend = %name, error = %e, "failed to redeploy backend");
            }
        }
    }

    /// Register or replace one backend. An existing backend keeps its entry
    /// and is restarted under the new config; a new one is inserted only when
    /// its first start succeeds.
    pub fn deploy(self: &Arc<Self>, name: &str, mut server_config: McpServerConfig) -> Result<()> {
        server_config.validate()?;
        server_config.normalize();

        {
            let mut backends = self.backends.write();
            if let Some(existing) = backends.get(name) {
                tracing::info!(backend = %name, "backend already deployed, reconfiguring");
                existing.stop();
                existing.set_config(server_config);
                if !existing.is_remote() {
                    existing.start()?;
                }
            } else {
                let backend = McpBackend::new(
                    name,
                    server_config,
                    Arc::clone(&self.ports),
                    self.settings.clone(),
                    self.http.clone(),
                );
                if !backend.is_remote() {
                    backend.start()?;
                }
                backends.insert(name.to_string(), backend);
            }
        }

        self.persist();
        Ok(())
    }

    /// Stop and forget one backend.
    pub fn delete(&self, name: &str) -> Result<()> {
        let backend = self
            .backends
            .write()
            .remove(name)
            .ok_or_else(|| GatewayError::NotFound(format!("backend '{name}'")))?;
        backend.stop();
        self.persist();
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<McpBackend>> {
        self.backends.read().get(name).cloned()
    }

    /// Snapshot of the declared configs.
    pub fn list(&self) -> HashMap<String, McpServerConfig> {
        self.backends
            .read()
            .iter()
            .map(|(name, backend)| (name.clone(), backend.config()))
            .collect()
    }

    /// Immutable view of every backend, for iteration outside the lock.
    pub fn snapshot(&self) -> Vec<Arc<McpBackend>> {
        self.backends.read().values().cloned().collect()
    }

    pub fn infos(&self) -> Vec<BackendInfo> {
        let mut infos: Vec<BackendInfo> = self
            .backends
            .read()
            .values()
            .map(|backend| backend.info())
            .collect();
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        infos
    }

    /// Stop every backend and drop the map.
    pub fn shutdown(&self) {
        tracing::info!("stopping all backends");
        let backends: Vec<Arc<McpBackend>> = self.backends.write().drain().map(|(_, b)| b).collect();
        for backend in backends {
            backend.stop();
        }
    }

    fn persist(&self) {
        let path = self.settings.mcp_config_path();
        if let Err(e) = config::persist_atomic(&path, &self.list()) {
            tracing::warn!(path = ?path, error = %e, "failed to persist backend config");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BackendStatus;
    use std::time::Duration;

    fn registry(dir: &std::path::Path) -> Arc<ServiceRegistry> {
        ServiceRegistry::new(
            GatewaySettings {
                config_dir: dir.to_path_buf(),
                shim_command: "supergateway".to_string(),
                max_retries: 3,
                gc_interval: Duration::from_secs(300),
                idle_timeout: Duration::from_secs(600),
            },
            reqwest::Client::new(),
        )
    }

    fn remote_config(url: &str) -> McpServerConfig {
        McpServerConfig {
            url: Some(url.to_string()),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn deploy_get_list_delete_remote_backend() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path());

        registry.deploy("a", remote_config("http://localhost:9001")).unwrap();
        let backend = registry.get("a").expect("deployed backend");
        assert_eq!(backend.status(), BackendStatus::Running);
        assert_eq!(registry.list()["a"].url.as_deref(), Some("http://localhost:9001"));

        registry.delete("a").unwrap();
        assert!(registry.get("a").is_none());
        assert!(matches!(
            registry.delete("a"),
            Err(GatewayError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn deploy_rejects_invalid_config() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path());
        let err = registry
            .deploy("a", McpServerConfig::default())
            .unwrap_err();
        assert!(matches!(err, GatewayError::InvalidConfig(_)));
        assert!(registry.get("a").is_none());
    }

    #[tokio::test]
    async fn redeploy_replaces_the_config() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path());

        registry.deploy("a", remote_config("http://localhost:9001")).unwrap();
        registry.deploy("a", remote_config("http://localhost:9002")).unwrap();

        let backend = registry.get("a").unwrap();
        assert_eq!(backend.url(), "http://localhost:9002");
        assert_eq!(registry.snapshot().len(), 1);
    }

    #[tokio::test]
    async fn mutations_persist_the_declared_set() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry(dir.path());

        registry.deploy("a", remote_config("http://localhost:9001")).unwrap();
        let path = registry.settings.mcp_config_path();
        let persisted = config::load_persisted(&path).unwrap();
        assert_eq!(
            persisted["a"].url.as_deref(),
            Some("http://localhost:9001")
        );

        registry.delete("a").unwrap();
        assert!(config::load_persisted(&path).unwrap().is_empty());
    }

    #[tokio::test]
    async fn persisted_backends_are_redeployed_on_startup() {
        let dir = tempfile::tempdir().unwrap();
        {
            let registry = registry(dir.path());
            registry.deploy("a", remote_config("http://localhost:9001")).unwrap();
        }
        let reloaded = registry(dir.path());
        reloaded.load_persisted();
        assert_eq!(reloaded.get("a").unwrap().url(), "http://localhost:9001");
    }
}
