//! Headless service builder.

use devplane_api::{names, Workspace};
use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec};

use super::owned_metadata;

/// Builds the headless service that resolves directly to the workspace pod.
/// The gateway dials `{name}.{namespace}.svc.cluster.local:7681`.
pub fn build_service(workspace: &Workspace) -> Service {
    let user_id = &workspace.spec.user.id;
    Service {
        metadata: owned_metadata(workspace, names::service(user_id)),
        spec: Some(ServiceSpec {
            cluster_ip: Some("None".to_string()),
            selector: Some(names::labels(user_id)),
            ports: Some(vec![ServicePort {
                name: Some("ttyd".to_string()),
                port: names::TTYD_PORT,
                protocol: Some("TCP".to_string()),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::test_fixtures::workspace;

    #[test]
    fn test_service_is_headless_and_selects_workspace_pod() {
        let ws = workspace("alice");
        let svc = build_service(&ws);

        assert_eq!(svc.metadata.name.as_deref(), Some("alice-workspace-svc"));
        let spec = svc.spec.unwrap();
        assert_eq!(spec.cluster_ip.as_deref(), Some("None"));

        let selector = spec.selector.unwrap();
        assert_eq!(selector["app"], "workspace");
        assert_eq!(selector["user"], "alice");

        let ports = spec.ports.unwrap();
        assert_eq!(ports.len(), 1);
        assert_eq!(ports[0].port, 7681);
        assert_eq!(ports[0].protocol.as_deref(), Some("TCP"));
    }
}
