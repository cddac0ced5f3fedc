//! Builders for workspace-owned cluster objects.
//!
//! Every builder is a pure function from a `Workspace` to a desired object:
//! no I/O, deterministic output, owner reference and common labels always
//! stamped so the platform's garbage collector cascades deletion.

pub mod netpol;
pub mod pod;
pub mod pvc;
pub mod rbac;
pub mod service;

use devplane_api::{names, InvalidSpec, Workspace};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::{Resource, ResourceExt};

/// Metadata shared by all owned objects: name, namespace, common labels, and
/// a controller owner reference back to the Workspace.
pub(crate) fn owned_metadata(workspace: &Workspace, name: String) -> ObjectMeta {
    ObjectMeta {
        name: Some(name),
        namespace: workspace.namespace(),
        labels: Some(names::labels(&workspace.spec.user.id)),
        owner_references: workspace.controller_owner_ref(&()).map(|r| vec![r]),
        ..Default::default()
    }
}

/// Parses a quantity string eagerly so malformed specs fail validation
/// instead of being rejected by the API server later.
pub(crate) fn quantity(field: &str, value: &str) -> Result<Quantity, InvalidSpec> {
    if !devplane_api::is_quantity(value) {
        return Err(InvalidSpec(format!(
            "spec.resources.{field} invalid: {value:?} is not a quantity"
        )));
    }
    Ok(Quantity(value.to_string()))
}

#[cfg(test)]
pub(crate) mod test_fixtures {
    use devplane_api::{
        AiConfig, AiProvider, PersistenceConfig, UserInfo, Workspace, WorkspaceResources,
        WorkspaceSpec,
    };

    /// A valid Workspace as the gateway would create it, with the metadata a
    /// fetched object carries.
    pub(crate) fn workspace(user: &str) -> Workspace {
        let mut ws = Workspace::new(
            user,
            WorkspaceSpec {
                user: UserInfo {
                    id: user.to_string(),
                    email: format!("{user}@example.com"),
                },
                resources: WorkspaceResources {
                    cpu: "2".to_string(),
                    memory: "4Gi".to_string(),
                    storage: "20Gi".to_string(),
                },
                ai_config: AiConfig {
                    providers: vec![AiProvider {
                        name: "local".to_string(),
                        endpoint: "http://vllm.ai-system.svc:8000".to_string(),
                        models: vec!["deepseek-coder-33b-instruct".to_string()],
                    }],
                    egress_namespaces: Vec::new(),
                    egress_ports: Vec::new(),
                },
                persistence: PersistenceConfig::default(),
                tls: None,
            },
        );
        ws.metadata.namespace = Some("default".to_string());
        ws.metadata.uid = Some("9e2cf1f5-5c93-4fb0-b2d5-3f2d2ab4a0a1".to_string());
        ws
    }
}
