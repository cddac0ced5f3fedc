//! Persistent claim builder.

use std::collections::BTreeMap;

use devplane_api::{names, InvalidSpec, Workspace};
use k8s_openapi::api::core::v1::{
    PersistentVolumeClaim, PersistentVolumeClaimSpec, VolumeResourceRequirements,
};

use super::{owned_metadata, quantity};

/// Builds the user's persistent claim. Exclusive-writer access; the claim is
/// created once and never resized or recreated by the operator.
pub fn build_pvc(workspace: &Workspace) -> Result<PersistentVolumeClaim, InvalidSpec> {
    let storage = quantity("storage", &workspace.spec.resources.storage)?;

    Ok(PersistentVolumeClaim {
        metadata: owned_metadata(workspace, names::pvc(&workspace.spec.user.id)),
        spec: Some(PersistentVolumeClaimSpec {
            access_modes: Some(vec!["ReadWriteOnce".to_string()]),
            resources: Some(VolumeResourceRequirements {
                requests: Some(BTreeMap::from([("storage".to_string(), storage)])),
                ..Default::default()
            }),
            storage_class_name: workspace.spec.persistence.storage_class.clone(),
            ..Default::default()
        }),
        ..Default::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::test_fixtures::workspace;

    #[test]
    fn test_pvc_shape() {
        let ws = workspace("john");
        let pvc = build_pvc(&ws).unwrap();

        assert_eq!(pvc.metadata.name.as_deref(), Some("john-workspace-pvc"));
        assert_eq!(pvc.metadata.namespace.as_deref(), Some("default"));
        let spec = pvc.spec.unwrap();
        assert_eq!(spec.access_modes.unwrap(), vec!["ReadWriteOnce"]);
        let requests = spec.resources.unwrap().requests.unwrap();
        assert_eq!(requests["storage"].0, "20Gi");
        assert_eq!(spec.storage_class_name, None);
    }

    #[test]
    fn test_pvc_storage_class_passthrough() {
        let mut ws = workspace("john");
        ws.spec.persistence.storage_class = Some("fast-ssd".to_string());
        let pvc = build_pvc(&ws).unwrap();
        assert_eq!(
            pvc.spec.unwrap().storage_class_name.as_deref(),
            Some("fast-ssd")
        );
    }

    #[test]
    fn test_pvc_rejects_bad_quantity() {
        let mut ws = workspace("john");
        ws.spec.resources.storage = "not-a-size".to_string();
        assert!(build_pvc(&ws).is_err());
    }

    #[test]
    fn test_pvc_owner_and_labels() {
        let ws = workspace("john");
        let pvc = build_pvc(&ws).unwrap();

        let owners = pvc.metadata.owner_references.unwrap();
        assert_eq!(owners.len(), 1);
        assert_eq!(owners[0].kind, "Workspace");
        assert_eq!(owners[0].name, "john");
        assert_eq!(owners[0].controller, Some(true));

        let labels = pvc.metadata.labels.unwrap();
        assert_eq!(labels["app"], "workspace");
        assert_eq!(labels["user"], "john");
        assert_eq!(labels["managed-by"], "devplane");
    }
}
