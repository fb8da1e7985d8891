//! Provider lifecycle and capability registry.
//!
//! The manager resolves each provider's engine specifier into a runnable
//! command, spawns the protocol client (which performs the handshake),
//! queries `provider_capabilities`, and answers "which provider realizes
//! resources of this kind" for the orchestrator.

pub mod client;
pub mod engine;
mod error;

pub use client::{
    OperationError, OperationResult, ProtocolClient, ProviderCapabilities, ResourceCapability,
};
pub use engine::{resolve_engine, RUN_LOCAL_ENV};
pub use error::{Error, Result};

use crate::spec::{ProviderConfig, ResourceKind};
use log::{info, warn};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderStatus {
    Running,
    Stopped,
    Failed,
}

struct ManagedProvider {
    #[allow(dead_code)]
    config: ProviderConfig,
    client: Arc<ProtocolClient>,
    capabilities: ProviderCapabilities,
    status: ProviderStatus,
}

/// Registry of named providers and their live clients.
#[derive(Default)]
pub struct ProviderManager {
    providers: RwLock<HashMap<String, ManagedProvider>>,
}

impl ProviderManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts a provider: resolve its engine, spawn the client, fetch
    /// capabilities. A provider may not be restarted while running.
    pub async fn start(&self, config: &ProviderConfig) -> Result<()> {
        {
            let providers = self.providers.read().await;
            if let Some(existing) = providers.get(&config.name) {
                if existing.status == ProviderStatus::Running {
                    return error::AlreadyRunningSnafu { name: &config.name }.fail();
                }
            }
        }

        let command = engine::resolve_engine(&config.engine)?;
        let client = Arc::new(ProtocolClient::spawn(&config.name, &command).await?);
        let capabilities = match client.capabilities().await {
            Ok(capabilities) => capabilities,
            Err(e) => {
                let _ = client.close().await;
                return Err(e);
            }
        };
        info!(
            "Provider '{}' is running ({} resource kinds)",
            config.name,
            capabilities.resources.len()
        );

        let mut providers = self.providers.write().await;
        providers.insert(
            config.name.clone(),
            ManagedProvider {
                config: config.clone(),
                client,
                capabilities,
                status: ProviderStatus::Running,
            },
        );
        Ok(())
    }

    /// The live client for a running provider.
    pub async fn client(&self, name: &str) -> Result<Arc<ProtocolClient>> {
        let providers = self.providers.read().await;
        let provider = providers
            .get(name)
            .ok_or_else(|| Error::UnknownProvider { name: name.to_string() })?;
        if provider.status != ProviderStatus::Running {
            return error::NotRunningSnafu { name }.fail();
        }
        Ok(Arc::clone(&provider.client))
    }

    pub async fn status(&self, name: &str) -> Option<ProviderStatus> {
        let providers = self.providers.read().await;
        providers.get(name).map(|p| p.status)
    }

    /// True iff the provider declared the given resource kind.
    pub async fn supports_resource(&self, name: &str, kind: ResourceKind) -> bool {
        let providers = self.providers.read().await;
        providers
            .get(name)
            .map(|provider| {
                provider
                    .capabilities
                    .resources
                    .iter()
                    .any(|r| r.kind == kind.to_string())
            })
            .unwrap_or(false)
    }

    /// True iff the provider declared the kind and listed the operation.
    pub async fn supports_operation(&self, name: &str, kind: ResourceKind, operation: &str) -> bool {
        let providers = self.providers.read().await;
        providers
            .get(name)
            .map(|provider| {
                provider
                    .capabilities
                    .resources
                    .iter()
                    .any(|r| r.kind == kind.to_string() && r.operations.iter().any(|o| o == operation))
            })
            .unwrap_or(false)
    }

    /// Picks a provider for a resource kind: the first candidate declaring
    /// support, else the default if it is among the candidates, else none.
    pub async fn provider_for_resource(
        &self,
        kind: ResourceKind,
        candidates: &[String],
        default: Option<&str>,
    ) -> Option<String> {
        for candidate in candidates {
            if self.supports_resource(candidate, kind).await {
                return Some(candidate.clone());
            }
        }
        if let Some(default) = default {
            if candidates.iter().any(|c| c == default) {
                return Some(default.to_string());
            }
        }
        None
    }

    /// Stops one provider, closing its client.
    pub async fn stop(&self, name: &str) -> Result<()> {
        let client = {
            let mut providers = self.providers.write().await;
            let provider = providers
                .get_mut(name)
                .ok_or_else(|| Error::UnknownProvider { name: name.to_string() })?;
            if provider.status != ProviderStatus::Running {
                return Ok(());
            }
            provider.status = ProviderStatus::Stopped;
            Arc::clone(&provider.client)
        };
        client.close().await
    }

    /// Stops every provider, accumulating errors rather than short-circuiting.
    pub async fn stop_all(&self) -> Result<()> {
        let names: Vec<String> = {
            let providers = self.providers.read().await;
            providers.keys().cloned().collect()
        };

        let mut failures = Vec::new();
        for name in names {
            if let Err(e) = self.stop(&name).await {
                warn!("Failed to stop provider '{}': {}", name, e);
                failures.push(format!("{}: {}", name, e));
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            error::StopAllSnafu {
                errors: failures.join("; "),
            }
            .fail()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::unix::fs::PermissionsExt;

    /// Writes a provider script that completes the handshake and answers the
    /// capability query with the given resource kinds, then idles.
    fn scripted_provider(dir: &std::path::Path, kinds: &[(&str, &[&str])]) -> String {
        let resources: Vec<serde_json::Value> = kinds
            .iter()
            .map(|(kind, operations)| {
                serde_json::json!({ "kind": kind, "operations": operations })
            })
            .collect();
        let capabilities = serde_json::json!({
            "providerName": "scripted",
            "version": "0.0.1",
            "resources": resources,
        });
        let payload = serde_json::json!({
            "content": [{
                "type": "text",
                "text": serde_json::json!({
                    "success": true,
                    "resource": capabilities,
                })
                .to_string(),
            }],
            "isError": false,
        });
        let response = serde_json::json!({ "jsonrpc": "2.0", "id": 2, "result": payload });

        let path = dir.join("provider.sh");
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "#!/bin/sh").unwrap();
        writeln!(f, "read _initialize").unwrap();
        writeln!(
            f,
            r#"printf '%s\n' '{{"jsonrpc":"2.0","id":1,"result":{{}}}}'"#
        )
        .unwrap();
        writeln!(f, "read _initialized").unwrap();
        writeln!(f, "read _capabilities").unwrap();
        writeln!(f, "printf '%s\\n' '{}'", response).unwrap();
        writeln!(f, "exec >&-").unwrap();
        writeln!(f, "cat > /dev/null").unwrap();
        drop(f);
        let mut permissions = std::fs::metadata(&path).unwrap().permissions();
        permissions.set_mode(0o755);
        std::fs::set_permissions(&path, permissions).unwrap();
        path.display().to_string()
    }

    fn config(name: &str, engine: &str) -> ProviderConfig {
        ProviderConfig {
            name: name.to_string(),
            engine: engine.to_string(),
            default: false,
        }
    }

    #[tokio::test]
    async fn start_registers_capabilities() {
        let dir = tempfile::tempdir().unwrap();
        let engine = scripted_provider(
            dir.path(),
            &[("network", &["create", "delete"]), ("vm", &["create", "delete"])],
        );
        let manager = ProviderManager::new();
        manager.start(&config("libvirt", &engine)).await.unwrap();

        assert_eq!(
            manager.status("libvirt").await,
            Some(ProviderStatus::Running)
        );
        assert!(manager.supports_resource("libvirt", ResourceKind::Vm).await);
        assert!(
            manager
                .supports_operation("libvirt", ResourceKind::Vm, "create")
                .await
        );
        assert!(
            !manager
                .supports_operation("libvirt", ResourceKind::Vm, "resize")
                .await
        );
        assert!(
            !manager
                .supports_resource("libvirt", ResourceKind::Key)
                .await
        );

        manager.stop_all().await.unwrap();
        assert_eq!(
            manager.status("libvirt").await,
            Some(ProviderStatus::Stopped)
        );
    }

    #[tokio::test]
    async fn running_provider_cannot_be_restarted() {
        let dir = tempfile::tempdir().unwrap();
        let engine = scripted_provider(dir.path(), &[("key", &["create", "delete"])]);
        let manager = ProviderManager::new();
        let config = config("keys", &engine);
        manager.start(&config).await.unwrap();

        let err = manager.start(&config).await.unwrap_err();
        assert!(err.to_string().contains("already running"));
        manager.stop_all().await.unwrap();
    }

    #[tokio::test]
    async fn provider_selection_prefers_declared_support() {
        let dir = tempfile::tempdir().unwrap();
        let engine = scripted_provider(dir.path(), &[("vm", &["create", "delete"])]);
        let manager = ProviderManager::new();
        manager.start(&config("vms-only", &engine)).await.unwrap();

        let candidates = vec!["vms-only".to_string(), "other".to_string()];
        assert_eq!(
            manager
                .provider_for_resource(ResourceKind::Vm, &candidates, Some("other"))
                .await,
            Some("vms-only".to_string())
        );
        // No candidate declares keys; fall back to the default if listed.
        assert_eq!(
            manager
                .provider_for_resource(ResourceKind::Key, &candidates, Some("other"))
                .await,
            Some("other".to_string())
        );
        assert_eq!(
            manager
                .provider_for_resource(ResourceKind::Key, &candidates, Some("absent"))
                .await,
            None
        );
        manager.stop_all().await.unwrap();
    }

    #[tokio::test]
    async fn unknown_provider_is_an_error() {
        let manager = ProviderManager::new();
        let err = manager.client("ghost").await.unwrap_err();
        assert!(err.to_string().contains("not registered"));
    }

    #[tokio::test]
    async fn bad_engine_path_fails_start() {
        let manager = ProviderManager::new();
        let err = manager
            .start(&config("ghost", "/nonexistent/provider"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("/nonexistent/provider"));
    }
}
