//! Workspace API types
//!
//! The `Workspace` custom resource is the desired-state record for one
//! user's sandbox. The operator converges cluster objects to it; the gateway
//! creates it on behalf of authenticated users and reads its status back.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub mod names;
mod validate;

pub use validate::{is_quantity, validate_spec, InvalidSpec};

/// API group for the Workspace kind.
pub const GROUP: &str = "workspace.devplane.io";

/// Finalizer that gates Workspace deletion until the operator has observed it.
pub const FINALIZER: &str = "workspace.devplane.io/finalizer";

/// Desired state of a user workspace.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[kube(
    group = "workspace.devplane.io",
    version = "v1alpha1",
    kind = "Workspace",
    namespaced,
    status = "WorkspaceStatus",
    shortname = "ws",
    printcolumn = r#"{"name":"Phase", "type":"string", "jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"User", "type":"string", "jsonPath":".spec.user.email"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceSpec {
    /// Owner identity, as sanitized from the OIDC token.
    pub user: UserInfo,
    /// CPU, memory, and storage for the workspace pod.
    pub resources: WorkspaceResources,
    /// AI coding assistant backends reachable from the workspace.
    pub ai_config: AiConfig,
    /// Persistent storage options.
    #[serde(default)]
    pub persistence: PersistenceConfig,
    /// Custom TLS trust for the workspace.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls: Option<TlsConfig>,
}

/// Sanitized user identity from OIDC.
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
pub struct UserInfo {
    /// DNS-label-safe identifier, used as a prefix of every owned resource name.
    pub id: String,
    /// The user's email from the token claims. Informational.
    pub email: String,
}

/// Resource quantities for the workspace pod and claim.
///
/// Each field is a Kubernetes quantity string (e.g. `"2"`, `"4Gi"`); they are
/// parsed eagerly during validation so builders never see malformed input.
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
pub struct WorkspaceResources {
    pub cpu: String,
    pub memory: String,
    pub storage: String,
}

/// AI assistant configuration.
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AiConfig {
    /// OpenAI-compatible provider backends. At least one is required.
    pub providers: Vec<AiProvider>,
    /// Namespaces hosting LLM services; egress to all pods there is allowed.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub egress_namespaces: Vec<String>,
    /// TCP ports allowed for egress to external IPs. Empty means the
    /// operator default (or the built-in default list) applies.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub egress_ports: Vec<i32>,
}

/// One AI provider backend (vLLM, Ollama, and the like).
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq, Eq)]
pub struct AiProvider {
    /// Provider key used by the in-workspace assistant configuration.
    pub name: String,
    /// Base URL of the OpenAI-compatible endpoint.
    pub endpoint: String,
    /// Model identifiers served by this provider.
    pub models: Vec<String>,
}

/// Persistent storage options for the workspace claim.
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PersistenceConfig {
    /// StorageClass for the claim; the cluster default applies when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_class: Option<String>,
}

/// Custom TLS trust configuration.
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TlsConfig {
    /// ConfigMap whose keys are CA certificates to mount into the pod.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_ca_bundle: Option<CaBundleRef>,
}

/// Reference to a ConfigMap holding CA certificates.
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
pub struct CaBundleRef {
    pub name: String,
}

/// Observed state of a Workspace.
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct WorkspaceStatus {
    /// Lifecycle phase. Absent is equivalent to `Pending`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<WorkspacePhase>,
    /// Name of the workspace pod once created.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod_name: Option<String>,
    /// In-cluster DNS name of the headless service.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_endpoint: Option<String>,
    /// Human-readable error or progress information.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// When the user last interacted with the workspace.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_accessed: Option<Time>,
}

/// Lifecycle position of a Workspace.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, JsonSchema, PartialEq, Eq)]
pub enum WorkspacePhase {
    #[default]
    Pending,
    Creating,
    Running,
    Failed,
    Stopped,
}

impl std::fmt::Display for WorkspacePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            WorkspacePhase::Pending => "Pending",
            WorkspacePhase::Creating => "Creating",
            WorkspacePhase::Running => "Running",
            WorkspacePhase::Failed => "Failed",
            WorkspacePhase::Stopped => "Stopped",
        };
        f.write_str(s)
    }
}

impl Workspace {
    /// The observed phase, treating a missing status as `Pending`.
    pub fn phase(&self) -> WorkspacePhase {
        self.status
            .as_ref()
            .and_then(|s| s.phase)
            .unwrap_or_default()
    }
}
