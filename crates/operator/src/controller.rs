//! The Workspace reconciler.
//!
//! Converges observed cluster state to a Workspace's desired state: RBAC,
//! network policies, the persistent claim, the pod, and the headless
//! service, in that order. Pod state is projected back onto the Workspace
//! status, and a configured idle timeout evicts inactive workspaces to
//! `Stopped`. The `Stopped` phase is cleared externally by the gateway when
//! the user reconnects.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use devplane_api::{names, validate_spec, Workspace, WorkspacePhase, FINALIZER};
use futures::StreamExt;
use k8s_openapi::api::core::v1::{PersistentVolumeClaim, Pod, Service, ServiceAccount};
use k8s_openapi::api::networking::v1::NetworkPolicy;
use k8s_openapi::api::rbac::v1::{Role, RoleBinding};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::api::{DeleteParams, Patch, PatchParams, PostParams};
use kube::runtime::controller::{Action, Controller};
use kube::runtime::watcher;
use kube::{Api, Client, Resource, ResourceExt};
use serde_json::json;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::OperatorConfig;
use crate::resources::{netpol, pod, pvc, rbac, service};

/// Requeue delay after creating an object whose effect we need to observe.
const CREATE_REQUEUE: Duration = Duration::from_secs(2);

/// Requeue delay while the pod is coming up.
const STARTING_REQUEUE: Duration = Duration::from_secs(5);

/// Errors that abort a reconcile and cause a backoff re-queue.
///
/// Spec-level problems (`InvalidSpec`, a rejected create) never surface here;
/// they settle the Workspace to `Failed` and the reconcile returns cleanly.
#[derive(Debug, Error)]
pub enum Error {
    #[error("kubernetes api: {0}")]
    Kube(#[from] kube::Error),
    #[error("workspace {0:?} has no namespace")]
    MissingNamespace(String),
}

/// Shared reconciler state: a client and the startup-immutable configuration.
pub struct Context {
    pub client: Client,
    pub config: OperatorConfig,
}

/// Runs the controller until a termination signal arrives.
///
/// Owned-object watches make any change to a workspace's pod, claim, service,
/// RBAC, or network policies trigger a reconcile of the owning Workspace.
pub async fn run(client: Client, config: OperatorConfig) -> anyhow::Result<()> {
    let workspaces = Api::<Workspace>::all(client.clone());
    let context = Arc::new(Context {
        client: client.clone(),
        config,
    });

    Controller::new(workspaces, watcher::Config::default())
        .owns(Api::<Pod>::all(client.clone()), watcher::Config::default())
        .owns(
            Api::<PersistentVolumeClaim>::all(client.clone()),
            watcher::Config::default(),
        )
        .owns(Api::<Service>::all(client.clone()), watcher::Config::default())
        .owns(
            Api::<ServiceAccount>::all(client.clone()),
            watcher::Config::default(),
        )
        .owns(Api::<Role>::all(client.clone()), watcher::Config::default())
        .owns(
            Api::<RoleBinding>::all(client.clone()),
            watcher::Config::default(),
        )
        .owns(
            Api::<NetworkPolicy>::all(client.clone()),
            watcher::Config::default(),
        )
        .shutdown_on_signal()
        .run(reconcile, error_policy, context)
        .for_each(|result| async move {
            match result {
                Ok((workspace, _)) => debug!(workspace = %workspace.name, "Reconciled"),
                Err(error) => warn!(%error, "Reconcile stream error"),
            }
        })
        .await;

    Ok(())
}

/// One reconcile of a single Workspace.
pub async fn reconcile(workspace: Arc<Workspace>, ctx: Arc<Context>) -> Result<Action, Error> {
    let name = workspace.name_any();
    let namespace = workspace
        .namespace()
        .ok_or_else(|| Error::MissingNamespace(name.clone()))?;
    let workspaces: Api<Workspace> = Api::namespaced(ctx.client.clone(), &namespace);

    // Deletion: release the finalizer and let cascade deletion collect the
    // owned objects.
    if workspace.meta().deletion_timestamp.is_some() {
        if workspace.finalizers().iter().any(|f| f == FINALIZER) {
            remove_finalizer(&workspaces, &workspace).await?;
            info!(workspace = %name, "Released finalizer for deletion");
        }
        return Ok(Action::await_change());
    }

    if let Err(invalid) = validate_spec(&workspace.spec) {
        warn!(workspace = %name, error = %invalid, "Invalid workspace spec");
        update_status(
            &workspaces,
            &workspace,
            WorkspacePhase::Failed,
            None,
            None,
            Some(invalid.to_string()),
        )
        .await?;
        return Ok(Action::await_change());
    }

    // The finalizer must be in place before anything is created so the
    // deletion branch always runs first.
    if !workspace.finalizers().iter().any(|f| f == FINALIZER) {
        add_finalizer(&workspaces, &workspace).await?;
        return Ok(Action::requeue(Duration::ZERO));
    }

    // Stopped is terminal for the reconciler; the gateway clears it when the
    // user comes back.
    if workspace.phase() == WorkspacePhase::Stopped {
        return Ok(Action::await_change());
    }

    let user_id = workspace.spec.user.id.clone();

    ensure_rbac(&ctx, &workspace, &namespace).await?;
    ensure_network_policies(&ctx, &workspace, &namespace).await?;

    // Persistent claim: created once, never updated. A Lost claim is terminal.
    let pvcs: Api<PersistentVolumeClaim> = Api::namespaced(ctx.client.clone(), &namespace);
    match pvcs.get_opt(&names::pvc(&user_id)).await? {
        None => {
            let claim = match pvc::build_pvc(&workspace) {
                Ok(claim) => claim,
                Err(invalid) => {
                    return settle_failed(&workspaces, &workspace, invalid.to_string()).await;
                }
            };
            match pvcs.create(&PostParams::default(), &claim).await {
                Ok(_) => {
                    info!(workspace = %name, pvc = %names::pvc(&user_id), "Created PVC");
                    return Ok(Action::requeue(CREATE_REQUEUE));
                }
                Err(error) if is_fatal(&error) => {
                    return settle_failed(&workspaces, &workspace, error.to_string()).await;
                }
                Err(error) => return Err(error.into()),
            }
        }
        Some(claim) => {
            let phase = claim.status.and_then(|s| s.phase).unwrap_or_default();
            if phase == "Lost" {
                warn!(workspace = %name, "Persistent claim lost");
                return settle_failed(
                    &workspaces,
                    &workspace,
                    "Persistent volume claim lost".to_string(),
                )
                .await;
            }
            // Pending is fine: with WaitForFirstConsumer binding the claim
            // binds only once the pod schedules.
        }
    }

    // Pod: create if missing; roll by deletion when the image changes.
    let pods: Api<Pod> = Api::namespaced(ctx.client.clone(), &namespace);
    let pod_name = names::pod(&user_id);
    let desired_image = ctx.config.workspace_image.as_str();
    let existing_pod = match pods.get_opt(&pod_name).await? {
        None => {
            let pod = match pod::build_pod(&workspace, desired_image) {
                Ok(pod) => pod,
                Err(invalid) => {
                    return settle_failed(&workspaces, &workspace, invalid.to_string()).await;
                }
            };
            match pods.create(&PostParams::default(), &pod).await {
                Ok(_) => {
                    info!(workspace = %name, pod = %pod_name, image = desired_image, "Created pod");
                    return Ok(Action::requeue(CREATE_REQUEUE));
                }
                Err(error) if is_fatal(&error) => {
                    return settle_failed(&workspaces, &workspace, error.to_string()).await;
                }
                Err(error) => return Err(error.into()),
            }
        }
        Some(pod) => pod,
    };

    let running_image = existing_pod
        .spec
        .as_ref()
        .and_then(|spec| spec.containers.first())
        .and_then(|container| container.image.as_deref());
    if existing_pod.metadata.deletion_timestamp.is_none()
        && running_image != Some(desired_image)
    {
        info!(
            workspace = %name,
            current = running_image.unwrap_or(""),
            desired = desired_image,
            "Deleting pod for image rollout"
        );
        pods.delete(&pod_name, &DeleteParams::default()).await?;
        return Ok(Action::requeue(CREATE_REQUEUE));
    }

    ensure_service(&ctx, &workspace, &namespace).await?;

    // Idle eviction: a ready pod whose owner has been away longer than the
    // timeout is stopped until the user returns.
    if let Some(timeout) = ctx.config.idle_timeout {
        let last_accessed = workspace
            .status
            .as_ref()
            .and_then(|status| status.last_accessed.as_ref());
        if let Some(last) = last_accessed {
            if pod_ready(&existing_pod) && idle_deadline_exceeded(last, Utc::now(), timeout) {
                info!(workspace = %name, "Stopping idle workspace");
                pods.delete(&pod_name, &DeleteParams::default()).await?;
                update_status(
                    &workspaces,
                    &workspace,
                    WorkspacePhase::Stopped,
                    None,
                    None,
                    Some("Workspace stopped due to inactivity".to_string()),
                )
                .await?;
                return Ok(Action::await_change());
            }
        }
    }

    // Project pod state onto the Workspace status.
    let endpoint = names::service_endpoint(&user_id, &namespace);
    match project_pod(&existing_pod) {
        PodProjection::Ready => {
            update_status(
                &workspaces,
                &workspace,
                WorkspacePhase::Running,
                Some(pod_name),
                Some(endpoint),
                None,
            )
            .await?;
            match ctx.config.idle_timeout {
                // Re-check inactivity a few times per timeout window.
                Some(timeout) => Ok(Action::requeue(timeout / 4)),
                None => Ok(Action::await_change()),
            }
        }
        PodProjection::Failed(message) => {
            update_status(
                &workspaces,
                &workspace,
                WorkspacePhase::Failed,
                Some(pod_name),
                None,
                Some(message),
            )
            .await?;
            Ok(Action::await_change())
        }
        PodProjection::Starting(message) => {
            update_status(
                &workspaces,
                &workspace,
                WorkspacePhase::Creating,
                Some(pod_name),
                Some(endpoint),
                Some(message),
            )
            .await?;
            Ok(Action::requeue(STARTING_REQUEUE))
        }
    }
}

/// Backoff policy for errors escaping `reconcile`.
pub fn error_policy(workspace: Arc<Workspace>, error: &Error, _ctx: Arc<Context>) -> Action {
    warn!(workspace = %workspace.name_any(), %error, "Reconcile failed; requeueing");
    Action::requeue(Duration::from_secs(5))
}

/// What a pod's state means for the owning Workspace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum PodProjection {
    Ready,
    Failed(String),
    Starting(String),
}

/// Projects pod phase, readiness, and container waiting states.
pub(crate) fn project_pod(pod: &Pod) -> PodProjection {
    let status = pod.status.clone().unwrap_or_default();
    let phase = status.phase.clone().unwrap_or_default();

    if phase == "Failed" {
        let message = status
            .reason
            .or(status.message)
            .unwrap_or_else(|| "Pod failed".to_string());
        return PodProjection::Failed(message);
    }

    for container in status.container_statuses.iter().flatten() {
        let waiting = container.state.as_ref().and_then(|s| s.waiting.as_ref());
        if let Some(waiting) = waiting {
            if matches!(
                waiting.reason.as_deref(),
                Some("CrashLoopBackOff" | "ImagePullBackOff" | "ErrImagePull" | "InvalidImageName")
            ) {
                let message = waiting.message.clone().unwrap_or_else(|| {
                    format!("Container waiting: {}", waiting.reason.clone().unwrap_or_default())
                });
                return PodProjection::Failed(message);
            }
        }
    }

    if phase == "Running" && pod_ready(pod) {
        return PodProjection::Ready;
    }

    if phase.is_empty() {
        PodProjection::Starting("Pod starting".to_string())
    } else {
        PodProjection::Starting(format!("Pod phase: {phase}"))
    }
}

/// Whether the pod has a true Ready condition.
pub(crate) fn pod_ready(pod: &Pod) -> bool {
    pod.status
        .as_ref()
        .and_then(|status| status.conditions.as_ref())
        .is_some_and(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
}

/// Whether `now - last` exceeds the idle timeout.
pub(crate) fn idle_deadline_exceeded(last: &Time, now: DateTime<Utc>, timeout: Duration) -> bool {
    let timeout = chrono::TimeDelta::from_std(timeout).unwrap_or(chrono::TimeDelta::MAX);
    now.signed_duration_since(last.0) > timeout
}

/// Egress namespaces: spec, then operator config, then the built-in default.
pub(crate) fn resolved_egress_namespaces(
    workspace: &Workspace,
    config: &OperatorConfig,
) -> Vec<String> {
    if !workspace.spec.ai_config.egress_namespaces.is_empty() {
        workspace.spec.ai_config.egress_namespaces.clone()
    } else if !config.llm_namespaces.is_empty() {
        config.llm_namespaces.clone()
    } else {
        vec!["ai-system".to_string()]
    }
}

/// Egress ports: spec, then operator config, then the built-in default list.
pub(crate) fn resolved_egress_ports(workspace: &Workspace, config: &OperatorConfig) -> Vec<i32> {
    if !workspace.spec.ai_config.egress_ports.is_empty() {
        workspace.spec.ai_config.egress_ports.clone()
    } else if !config.egress_ports.is_empty() {
        config.egress_ports.clone()
    } else {
        netpol::DEFAULT_EGRESS_PORTS.to_vec()
    }
}

/// Creates the ServiceAccount, Role, and RoleBinding, converging Role rules
/// and RoleBinding subjects in place when they drift.
async fn ensure_rbac(ctx: &Context, workspace: &Workspace, namespace: &str) -> Result<(), Error> {
    let name = names::rbac(&workspace.spec.user.id);

    let accounts: Api<ServiceAccount> = Api::namespaced(ctx.client.clone(), namespace);
    if accounts.get_opt(&name).await?.is_none() {
        accounts
            .create(&PostParams::default(), &rbac::build_service_account(workspace))
            .await?;
        info!(service_account = %name, "Created ServiceAccount");
    }

    let roles: Api<Role> = Api::namespaced(ctx.client.clone(), namespace);
    let desired_role = rbac::build_role(workspace);
    match roles.get_opt(&name).await? {
        None => {
            roles.create(&PostParams::default(), &desired_role).await?;
            info!(role = %name, "Created Role");
        }
        Some(existing) => {
            if existing.rules != desired_role.rules {
                roles
                    .patch(
                        &name,
                        &PatchParams::default(),
                        &Patch::Merge(&json!({ "rules": desired_role.rules })),
                    )
                    .await?;
                info!(role = %name, "Converged Role rules");
            }
        }
    }

    let bindings: Api<RoleBinding> = Api::namespaced(ctx.client.clone(), namespace);
    let desired_binding = rbac::build_role_binding(workspace);
    match bindings.get_opt(&name).await? {
        None => {
            bindings
                .create(&PostParams::default(), &desired_binding)
                .await?;
            info!(role_binding = %name, "Created RoleBinding");
        }
        Some(existing) => {
            if existing.subjects != desired_binding.subjects {
                bindings
                    .patch(
                        &name,
                        &PatchParams::default(),
                        &Patch::Merge(&json!({ "subjects": desired_binding.subjects })),
                    )
                    .await?;
                info!(role_binding = %name, "Converged RoleBinding subjects");
            }
        }
    }

    Ok(())
}

/// Creates or converges the three network policies. The egress policy is
/// dynamic, so port and namespace changes must apply in place.
async fn ensure_network_policies(
    ctx: &Context,
    workspace: &Workspace,
    namespace: &str,
) -> Result<(), Error> {
    let policies: Api<NetworkPolicy> = Api::namespaced(ctx.client.clone(), namespace);

    let llm_namespaces = resolved_egress_namespaces(workspace, &ctx.config);
    let egress_ports = resolved_egress_ports(workspace, &ctx.config);

    let desired = [
        netpol::build_deny_all(workspace),
        netpol::build_egress(workspace, &llm_namespaces, &egress_ports),
        netpol::build_ingress_from_gateway(workspace),
    ];

    for policy in desired {
        let name = policy.metadata.name.clone().unwrap_or_default();
        match policies.get_opt(&name).await? {
            None => {
                policies.create(&PostParams::default(), &policy).await?;
                info!(network_policy = %name, "Created NetworkPolicy");
            }
            Some(existing) => {
                if existing.spec != policy.spec {
                    policies
                        .patch(
                            &name,
                            &PatchParams::default(),
                            &Patch::Merge(&json!({ "spec": policy.spec })),
                        )
                        .await?;
                    info!(network_policy = %name, "Converged NetworkPolicy");
                }
            }
        }
    }

    Ok(())
}

/// Creates or converges the headless service (selector and ports only; the
/// API server owns the rest of the spec).
async fn ensure_service(ctx: &Context, workspace: &Workspace, namespace: &str) -> Result<(), Error> {
    let services: Api<Service> = Api::namespaced(ctx.client.clone(), namespace);
    let desired = service::build_service(workspace);
    let name = desired.metadata.name.clone().unwrap_or_default();

    match services.get_opt(&name).await? {
        None => {
            services.create(&PostParams::default(), &desired).await?;
            info!(service = %name, "Created Service");
        }
        Some(existing) => {
            let desired_spec = desired.spec.as_ref();
            let existing_selector = existing.spec.as_ref().and_then(|s| s.selector.as_ref());
            let existing_ports = existing.spec.as_ref().and_then(|s| s.ports.as_ref());
            let drifted = existing_selector != desired_spec.and_then(|s| s.selector.as_ref())
                || existing_ports != desired_spec.and_then(|s| s.ports.as_ref());
            if drifted {
                services
                    .patch(
                        &name,
                        &PatchParams::default(),
                        &Patch::Merge(&json!({
                            "spec": {
                                "selector": desired_spec.and_then(|s| s.selector.clone()),
                                "ports": desired_spec.and_then(|s| s.ports.clone()),
                            }
                        })),
                    )
                    .await?;
                info!(service = %name, "Converged Service");
            }
        }
    }

    Ok(())
}

/// Sets phase `Failed` with a message and ends the reconcile without error;
/// the state has settled and retrying will not help.
async fn settle_failed(
    workspaces: &Api<Workspace>,
    workspace: &Workspace,
    message: String,
) -> Result<Action, Error> {
    update_status(
        workspaces,
        workspace,
        WorkspacePhase::Failed,
        None,
        None,
        Some(message),
    )
    .await?;
    Ok(Action::await_change())
}

/// Writes the projected status through the status subresource, skipping the
/// write entirely when nothing changed so repeated reconciles of an
/// unchanged Workspace are read-only.
async fn update_status(
    workspaces: &Api<Workspace>,
    workspace: &Workspace,
    phase: WorkspacePhase,
    pod_name: Option<String>,
    service_endpoint: Option<String>,
    message: Option<String>,
) -> Result<(), Error> {
    if status_up_to_date(
        workspace.status.as_ref(),
        phase,
        &pod_name,
        &service_endpoint,
        &message,
    ) {
        return Ok(());
    }

    // A merge patch touches only these fields; lastAccessed stays intact.
    let status = json!({
        "status": {
            "phase": phase,
            "podName": pod_name,
            "serviceEndpoint": service_endpoint,
            "message": message,
        }
    });
    workspaces
        .patch_status(
            &workspace.name_any(),
            &PatchParams::default(),
            &Patch::Merge(&status),
        )
        .await?;
    Ok(())
}

/// Whether the stored status already matches the projection, in which case
/// the reconcile pass is write-free.
fn status_up_to_date(
    current: Option<&devplane_api::WorkspaceStatus>,
    phase: WorkspacePhase,
    pod_name: &Option<String>,
    service_endpoint: &Option<String>,
    message: &Option<String>,
) -> bool {
    let Some(current) = current else {
        return false;
    };
    current.phase == Some(phase)
        && current.pod_name == *pod_name
        && current.service_endpoint == *service_endpoint
        && current.message == *message
}

async fn add_finalizer(workspaces: &Api<Workspace>, workspace: &Workspace) -> Result<(), Error> {
    let mut finalizers = workspace.finalizers().to_vec();
    finalizers.push(FINALIZER.to_string());
    patch_finalizers(workspaces, workspace, finalizers).await
}

async fn remove_finalizer(workspaces: &Api<Workspace>, workspace: &Workspace) -> Result<(), Error> {
    let finalizers: Vec<String> = workspace
        .finalizers()
        .iter()
        .filter(|f| *f != FINALIZER)
        .cloned()
        .collect();
    patch_finalizers(workspaces, workspace, finalizers).await
}

async fn patch_finalizers(
    workspaces: &Api<Workspace>,
    workspace: &Workspace,
    finalizers: Vec<String>,
) -> Result<(), Error> {
    let patch = json!({ "metadata": { "finalizers": finalizers } });
    workspaces
        .patch(
            &workspace.name_any(),
            &PatchParams::default(),
            &Patch::Merge(&patch),
        )
        .await?;
    Ok(())
}

/// Whether a rejected write is permanent (bad request, forbidden,
/// unprocessable) rather than transient. Conflicts and server errors retry.
fn is_fatal(error: &kube::Error) -> bool {
    matches!(error, kube::Error::Api(response) if matches!(response.code, 400 | 403 | 422))
}
