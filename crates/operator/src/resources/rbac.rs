//! Per-user RBAC builders: ServiceAccount, Role, RoleBinding.
//!
//! The workspace pod runs under its own ServiceAccount with a read-only Role
//! so kubectl and k9s work from the terminal without exposing write
//! operations. Secrets are deliberately never granted.

use devplane_api::{names, Workspace, GROUP};
use k8s_openapi::api::core::v1::ServiceAccount;
use k8s_openapi::api::rbac::v1::{PolicyRule, Role, RoleBinding, RoleRef, Subject};

use super::owned_metadata;

/// Builds the per-user ServiceAccount the workspace pod runs under.
pub fn build_service_account(workspace: &Workspace) -> ServiceAccount {
    ServiceAccount {
        metadata: owned_metadata(workspace, names::rbac(&workspace.spec.user.id)),
        ..Default::default()
    }
}

/// Builds the read-only Role bound to the workspace ServiceAccount.
pub fn build_role(workspace: &Workspace) -> Role {
    Role {
        metadata: owned_metadata(workspace, names::rbac(&workspace.spec.user.id)),
        rules: Some(role_rules()),
    }
}

/// The single source of desired Role rules, so in-place updates converge to
/// exactly this set.
pub fn role_rules() -> Vec<PolicyRule> {
    vec![
        // Common workload resources. Secrets are intentionally excluded.
        PolicyRule {
            api_groups: Some(vec![String::new()]),
            resources: Some(
                ["pods", "services", "configmaps", "events", "endpoints"]
                    .map(String::from)
                    .to_vec(),
            ),
            verbs: ["get", "list", "watch"].map(String::from).to_vec(),
            ..Default::default()
        },
        PolicyRule {
            api_groups: Some(vec![String::new()]),
            resources: Some(vec!["pods/log".to_string()]),
            verbs: ["get", "list"].map(String::from).to_vec(),
            ..Default::default()
        },
        PolicyRule {
            api_groups: Some(vec!["apps".to_string()]),
            resources: Some(
                ["deployments", "replicasets", "statefulsets", "daemonsets"]
                    .map(String::from)
                    .to_vec(),
            ),
            verbs: ["get", "list", "watch"].map(String::from).to_vec(),
            ..Default::default()
        },
        // The terminal can inspect its own Workspace status.
        PolicyRule {
            api_groups: Some(vec![GROUP.to_string()]),
            resources: Some(vec!["workspaces".to_string()]),
            verbs: vec!["get".to_string()],
            ..Default::default()
        },
    ]
}

/// Builds the RoleBinding from the per-user Role to the per-user ServiceAccount.
pub fn build_role_binding(workspace: &Workspace) -> RoleBinding {
    let name = names::rbac(&workspace.spec.user.id);
    RoleBinding {
        metadata: owned_metadata(workspace, name.clone()),
        subjects: Some(vec![Subject {
            kind: "ServiceAccount".to_string(),
            name: name.clone(),
            namespace: workspace.metadata.namespace.clone(),
            ..Default::default()
        }]),
        role_ref: RoleRef {
            api_group: "rbac.authorization.k8s.io".to_string(),
            kind: "Role".to_string(),
            name,
        },
    }
}
