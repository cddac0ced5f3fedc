//! Workspace pod builder.
//!
//! The pod runs the terminal image under a fixed security profile: non-root
//! uid 1000, default seccomp, read-only root filesystem, no privilege
//! escalation, all capabilities dropped. Writable paths are the user's claim
//! at `/workspace` and a scratch volume at `/tmp`.

use std::collections::BTreeMap;

use devplane_api::{names, InvalidSpec, Workspace};
use k8s_openapi::api::core::v1::{
    Capabilities, ConfigMapVolumeSource, Container, ContainerPort, EmptyDirVolumeSource, EnvVar,
    PersistentVolumeClaimVolumeSource, Pod, PodSecurityContext, PodSpec, Probe,
    ResourceRequirements, SeccompProfile, SecurityContext, TCPSocketAction, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;

use super::{owned_metadata, quantity};

/// Builds the workspace pod for `image`, mounting the user's claim.
pub fn build_pod(workspace: &Workspace, image: &str) -> Result<Pod, InvalidSpec> {
    let user_id = &workspace.spec.user.id;
    let cpu = quantity("cpu", &workspace.spec.resources.cpu)?;
    let memory = quantity("memory", &workspace.spec.resources.memory)?;

    // Requests equal limits so the pod lands in the Guaranteed QoS class.
    let resource_list = BTreeMap::from([
        ("cpu".to_string(), cpu),
        ("memory".to_string(), memory),
    ]);

    let mut volume_mounts = vec![
        VolumeMount {
            name: "workspace-data".to_string(),
            mount_path: names::WORKSPACE_MOUNT_PATH.to_string(),
            ..Default::default()
        },
        VolumeMount {
            name: "tmp".to_string(),
            mount_path: "/tmp".to_string(),
            ..Default::default()
        },
    ];
    let mut volumes = vec![
        Volume {
            name: "workspace-data".to_string(),
            persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                claim_name: names::pvc(user_id),
                ..Default::default()
            }),
            ..Default::default()
        },
        Volume {
            name: "tmp".to_string(),
            empty_dir: Some(EmptyDirVolumeSource::default()),
            ..Default::default()
        },
    ];
    let mut env = build_env(workspace);

    let ca_bundle = workspace
        .spec
        .tls
        .as_ref()
        .and_then(|tls| tls.custom_ca_bundle.as_ref())
        .filter(|bundle| !bundle.name.is_empty());
    if let Some(bundle) = ca_bundle {
        volumes.push(Volume {
            name: "custom-ca-certs".to_string(),
            config_map: Some(ConfigMapVolumeSource {
                name: Some(bundle.name.clone()),
                ..Default::default()
            }),
            ..Default::default()
        });
        volume_mounts.push(VolumeMount {
            name: "custom-ca-certs".to_string(),
            mount_path: names::CA_BUNDLE_MOUNT_PATH.to_string(),
            read_only: Some(true),
            ..Default::default()
        });
        env.push(EnvVar {
            name: "CUSTOM_CA_MOUNTED".to_string(),
            value: Some("true".to_string()),
            ..Default::default()
        });
    }

    Ok(Pod {
        metadata: owned_metadata(workspace, names::pod(user_id)),
        spec: Some(PodSpec {
            service_account_name: Some(names::rbac(user_id)),
            security_context: Some(PodSecurityContext {
                run_as_non_root: Some(true),
                run_as_user: Some(1000),
                seccomp_profile: Some(SeccompProfile {
                    type_: "RuntimeDefault".to_string(),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            containers: vec![Container {
                name: "workspace".to_string(),
                image: Some(image.to_string()),
                security_context: Some(SecurityContext {
                    read_only_root_filesystem: Some(true),
                    allow_privilege_escalation: Some(false),
                    capabilities: Some(Capabilities {
                        drop: Some(vec!["ALL".to_string()]),
                        ..Default::default()
                    }),
                    ..Default::default()
                }),
                resources: Some(ResourceRequirements {
                    requests: Some(resource_list.clone()),
                    limits: Some(resource_list),
                    ..Default::default()
                }),
                ports: Some(vec![ContainerPort {
                    name: Some("ttyd".to_string()),
                    container_port: names::TTYD_PORT,
                    protocol: Some("TCP".to_string()),
                    ..Default::default()
                }]),
                readiness_probe: Some(Probe {
                    tcp_socket: Some(TCPSocketAction {
                        port: IntOrString::Int(names::TTYD_PORT),
                        ..Default::default()
                    }),
                    initial_delay_seconds: Some(5),
                    period_seconds: Some(5),
                    ..Default::default()
                }),
                volume_mounts: Some(volume_mounts),
                env: Some(env),
                ..Default::default()
            }],
            volumes: Some(volumes),
            ..Default::default()
        }),
        ..Default::default()
    })
}

/// Container environment. The provider list is serialized to JSON so the
/// entrypoint script can configure the assistant without a template engine.
fn build_env(workspace: &Workspace) -> Vec<EnvVar> {
    let providers_json =
        serde_json::to_string(&workspace.spec.ai_config.providers).unwrap_or_default();
    vec![
        EnvVar {
            name: "AI_PROVIDERS_JSON".to_string(),
            value: Some(providers_json),
            ..Default::default()
        },
        EnvVar {
            name: "USER_EMAIL".to_string(),
            value: Some(workspace.spec.user.email.clone()),
            ..Default::default()
        },
        EnvVar {
            name: "USER_ID".to_string(),
            value: Some(workspace.spec.user.id.clone()),
            ..Default::default()
        },
    ]
}
