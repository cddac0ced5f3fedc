//! Workspace lifecycle on behalf of authenticated users.
//!
//! Finds or creates the caller's Workspace resource, optionally blocks until
//! the reconciler reports it `Running`, and stamps activity timestamps the
//! idle-eviction check reads.

use std::time::Duration;

use chrono::Utc;
use devplane_api::{
    AiConfig, PersistenceConfig, UserInfo, Workspace, WorkspacePhase, WorkspaceResources,
    WorkspaceSpec,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::api::{Patch, PatchParams, PostParams};
use kube::{Api, Client, ResourceExt};
use serde_json::json;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::auth::Claims;

/// How long the blocking path waits for a workspace to become serviceable.
pub const READY_TIMEOUT: Duration = Duration::from_secs(60);

/// Poll interval while waiting.
pub const READY_POLL: Duration = Duration::from_secs(2);

#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("kubernetes api: {0}")]
    Kube(#[from] kube::Error),
    /// The reconciler settled the workspace to `Failed`.
    #[error("workspace {name:?} provisioning failed: {message}")]
    ProvisioningFailed { name: String, message: String },
    /// The workspace did not reach `Running` within the deadline.
    #[error("workspace {0:?} not ready after {1:?}")]
    NotReady(String, Duration),
}

/// Spec defaults applied to Workspaces the gateway creates.
#[derive(Debug, Clone)]
pub struct WorkspaceDefaults {
    pub cpu: String,
    pub memory: String,
    pub storage: String,
    pub providers: Vec<devplane_api::AiProvider>,
}

impl Default for WorkspaceDefaults {
    fn default() -> Self {
        Self {
            cpu: "2".to_string(),
            memory: "4Gi".to_string(),
            storage: "20Gi".to_string(),
            providers: Vec::new(),
        }
    }
}

/// Capability seam for workspace provisioning, so handlers can run against
/// a double.
#[async_trait::async_trait]
pub trait WorkspaceLifecycle: Send + Sync {
    /// Get-or-create, then block until the workspace is serviceable.
    async fn ensure_workspace(
        &self,
        namespace: &str,
        claims: &Claims,
    ) -> Result<Workspace, LifecycleError>;

    /// Get-or-create without waiting, resurrecting a `Stopped` workspace.
    async fn ensure_exists(
        &self,
        namespace: &str,
        claims: &Claims,
    ) -> Result<Workspace, LifecycleError>;

    /// Best-effort `lastAccessed` stamp.
    async fn touch_last_accessed(&self, workspace: &Workspace);
}

/// Creates and retrieves Workspace resources for validated callers.
#[derive(Clone)]
pub struct LifecycleManager {
    client: Client,
    defaults: WorkspaceDefaults,
}

#[async_trait::async_trait]
impl WorkspaceLifecycle for LifecycleManager {
    /// Gets or creates the caller's Workspace, waits until it is `Running`,
    /// then stamps `lastAccessed` and returns it. Activity is only recorded
    /// once the workspace actually became serviceable.
    async fn ensure_workspace(
        &self,
        namespace: &str,
        claims: &Claims,
    ) -> Result<Workspace, LifecycleError> {
        self.get_or_create(namespace, claims).await?;
        let workspace = self.wait_for_running(namespace, &claims.user_id).await?;
        self.touch_last_accessed(&workspace).await;
        Ok(workspace)
    }

    /// Gets or creates the caller's Workspace without waiting. A `Stopped`
    /// workspace has its phase cleared so the reconciler resurrects it.
    async fn ensure_exists(
        &self,
        namespace: &str,
        claims: &Claims,
    ) -> Result<Workspace, LifecycleError> {
        let workspace = self.get_or_create(namespace, claims).await?;
        if workspace.phase() == WorkspacePhase::Stopped {
            let api: Api<Workspace> = Api::namespaced(self.client.clone(), namespace);
            self.clear_stopped(&api, &claims.user_id).await?;
        }
        Ok(workspace)
    }

    /// Best-effort update of `lastAccessed` to now. Failures are logged and
    /// swallowed; losing one activity stamp never blocks a connection.
    async fn touch_last_accessed(&self, workspace: &Workspace) {
        let Some(namespace) = workspace.namespace() else {
            return;
        };
        let api: Api<Workspace> = Api::namespaced(self.client.clone(), &namespace);
        let patch = json!({ "status": { "lastAccessed": Time(Utc::now()) } });
        if let Err(error) = api
            .patch_status(
                &workspace.name_any(),
                &PatchParams::default(),
                &Patch::Merge(&patch),
            )
            .await
        {
            warn!(workspace = %workspace.name_any(), %error, "Failed to update lastAccessed");
        }
    }
}

impl LifecycleManager {
    pub fn new(client: Client, defaults: WorkspaceDefaults) -> Self {
        Self { client, defaults }
    }

    async fn get_or_create(
        &self,
        namespace: &str,
        claims: &Claims,
    ) -> Result<Workspace, LifecycleError> {
        let api: Api<Workspace> = Api::namespaced(self.client.clone(), namespace);
        if let Some(existing) = api.get_opt(&claims.user_id).await? {
            return Ok(existing);
        }

        let workspace = Workspace::new(
            &claims.user_id,
            WorkspaceSpec {
                user: UserInfo {
                    id: claims.user_id.clone(),
                    email: claims.email.clone(),
                },
                resources: WorkspaceResources {
                    cpu: self.defaults.cpu.clone(),
                    memory: self.defaults.memory.clone(),
                    storage: self.defaults.storage.clone(),
                },
                ai_config: AiConfig {
                    providers: self.defaults.providers.clone(),
                    egress_namespaces: Vec::new(),
                    egress_ports: Vec::new(),
                },
                persistence: PersistenceConfig::default(),
                tls: None,
            },
        );

        info!(user = %claims.user_id, namespace, "Creating Workspace");
        match api.create(&PostParams::default(), &workspace).await {
            Ok(created) => Ok(created),
            // Another request won the race; use theirs.
            Err(kube::Error::Api(e)) if e.code == 409 => Ok(api.get(&claims.user_id).await?),
            Err(error) => Err(error.into()),
        }
    }

    /// Polls until the workspace reaches `Running` or the deadline passes.
    /// A `Stopped` workspace observed mid-poll is resurrected by clearing
    /// its phase (the self-service recovery path) and polling continues.
    async fn wait_for_running(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Workspace, LifecycleError> {
        let api: Api<Workspace> = Api::namespaced(self.client.clone(), namespace);
        let deadline = tokio::time::Instant::now() + READY_TIMEOUT;

        while tokio::time::Instant::now() < deadline {
            let workspace = api.get(name).await?;
            match workspace.phase() {
                WorkspacePhase::Running => return Ok(workspace),
                WorkspacePhase::Failed => {
                    let message = workspace
                        .status
                        .as_ref()
                        .and_then(|s| s.message.clone())
                        .unwrap_or_default();
                    return Err(LifecycleError::ProvisioningFailed {
                        name: name.to_string(),
                        message,
                    });
                }
                WorkspacePhase::Stopped => {
                    info!(workspace = name, "Restarting stopped workspace");
                    self.clear_stopped(&api, name).await?;
                }
                phase => {
                    debug!(workspace = name, %phase, "Waiting for workspace");
                }
            }
            tokio::time::sleep(READY_POLL).await;
        }

        Err(LifecycleError::NotReady(name.to_string(), READY_TIMEOUT))
    }

    /// Clears `phase`, `podName`, and `message` so the reconciler treats the
    /// workspace as pending again and re-creates the pod.
    async fn clear_stopped(&self, api: &Api<Workspace>, name: &str) -> Result<(), LifecycleError> {
        let patch = json!({
            "status": { "phase": null, "podName": null, "message": null }
        });
        api.patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_gateway_provisioning() {
        let defaults = WorkspaceDefaults::default();
        assert_eq!(defaults.cpu, "2");
        assert_eq!(defaults.memory, "4Gi");
        assert_eq!(defaults.storage, "20Gi");
    }

    #[test]
    fn test_ready_budget() {
        // The poll must get a chance to observe several phase transitions
        // within the deadline.
        assert!(READY_TIMEOUT.as_secs() / READY_POLL.as_secs() >= 10);
    }
}
