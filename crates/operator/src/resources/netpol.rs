//! Network policy builders.
//!
//! Three policies per workspace: a deny-all baseline for both directions, a
//! dynamic egress policy (DNS, LLM namespaces, external ports), and an
//! ingress policy admitting only gateway pods on the terminal port.

use std::collections::BTreeMap;

use devplane_api::{names, Workspace};
use k8s_openapi::api::networking::v1::{
    IPBlock, NetworkPolicy, NetworkPolicyEgressRule, NetworkPolicyIngressRule, NetworkPolicyPeer,
    NetworkPolicyPort, NetworkPolicySpec,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use tracing::debug;

use super::owned_metadata;

/// Built-in external egress ports, used when neither the Workspace spec nor
/// the operator configuration provides a list:
///
///   - 22    — Git over SSH
///   - 80    — HTTP
///   - 443   — HTTPS
///   - 5000  — self-hosted container registry
///   - 8000  — vLLM default
///   - 8080  — generic HTTP alternative
///   - 8081  — Nexus / Artifactory
///   - 11434 — Ollama default
pub const DEFAULT_EGRESS_PORTS: [i32; 8] = [22, 80, 443, 5000, 8000, 8080, 8081, 11434];

/// Namespace hosting the cluster DNS service.
const DNS_NAMESPACE: &str = "kube-system";

/// Selects the workspace pods of one user.
fn workspace_pod_selector(user_id: &str) -> LabelSelector {
    LabelSelector {
        match_labels: Some(BTreeMap::from([
            ("app".to_string(), "workspace".to_string()),
            ("user".to_string(), user_id.to_string()),
        ])),
        ..Default::default()
    }
}

/// Selects a namespace by its automatic `kubernetes.io/metadata.name` label.
fn namespace_peer(name: &str) -> NetworkPolicyPeer {
    NetworkPolicyPeer {
        namespace_selector: Some(LabelSelector {
            match_labels: Some(BTreeMap::from([(
                "kubernetes.io/metadata.name".to_string(),
                name.to_string(),
            )])),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn tcp_port(port: i32) -> NetworkPolicyPort {
    NetworkPolicyPort {
        protocol: Some("TCP".to_string()),
        port: Some(IntOrString::Int(port)),
        ..Default::default()
    }
}

/// Denies all ingress and egress for the user's workspace pods. The other
/// policies selectively re-open required traffic.
pub fn build_deny_all(workspace: &Workspace) -> NetworkPolicy {
    let user_id = &workspace.spec.user.id;
    NetworkPolicy {
        metadata: owned_metadata(workspace, names::netpol(user_id, "deny-all")),
        spec: Some(NetworkPolicySpec {
            pod_selector: workspace_pod_selector(user_id),
            policy_types: Some(vec!["Ingress".to_string(), "Egress".to_string()]),
            // Empty rule lists mean nothing is allowed.
            ingress: Some(Vec::new()),
            egress: Some(Vec::new()),
        }),
    }
}

/// Allows the workspace pods to reach DNS, all pods in the LLM namespaces,
/// and external IPs on the given TCP ports. Ports outside `1..=65535` are
/// dropped.
pub fn build_egress(
    workspace: &Workspace,
    llm_namespaces: &[String],
    egress_ports: &[i32],
) -> NetworkPolicy {
    let user_id = &workspace.spec.user.id;

    let mut egress_rules = vec![
        // DNS needs both UDP and TCP 53 (TCP for large responses).
        NetworkPolicyEgressRule {
            ports: Some(vec![
                NetworkPolicyPort {
                    protocol: Some("UDP".to_string()),
                    port: Some(IntOrString::Int(53)),
                    ..Default::default()
                },
                tcp_port(53),
            ]),
            to: Some(vec![namespace_peer(DNS_NAMESPACE)]),
        },
    ];

    // LLM services: all pods in the configured namespaces, any port.
    if !llm_namespaces.is_empty() {
        egress_rules.push(NetworkPolicyEgressRule {
            to: Some(llm_namespaces.iter().map(|ns| namespace_peer(ns)).collect()),
            ..Default::default()
        });
    }

    let mut seen = std::collections::BTreeSet::new();
    let internet_ports: Vec<NetworkPolicyPort> = egress_ports
        .iter()
        .filter(|&&port| {
            if !(1..=65535).contains(&port) {
                debug!(port, "Skipping invalid egress port");
                return false;
            }
            seen.insert(port)
        })
        .map(|&port| tcp_port(port))
        .collect();
    egress_rules.push(NetworkPolicyEgressRule {
        ports: Some(internet_ports),
        to: Some(vec![NetworkPolicyPeer {
            ip_block: Some(IPBlock {
                cidr: "0.0.0.0/0".to_string(),
                ..Default::default()
            }),
            ..Default::default()
        }]),
    });

    NetworkPolicy {
        metadata: owned_metadata(workspace, names::netpol(user_id, "egress")),
        spec: Some(NetworkPolicySpec {
            pod_selector: workspace_pod_selector(user_id),
            policy_types: Some(vec!["Egress".to_string()]),
            egress: Some(egress_rules),
            ..Default::default()
        }),
    }
}

/// Allows gateway pods (labelled `app=workspace-gateway`) to reach the
/// workspace pod on the terminal port.
pub fn build_ingress_from_gateway(workspace: &Workspace) -> NetworkPolicy {
    let user_id = &workspace.spec.user.id;
    NetworkPolicy {
        metadata: owned_metadata(workspace, names::netpol(user_id, "ingress-gateway")),
        spec: Some(NetworkPolicySpec {
            pod_selector: workspace_pod_selector(user_id),
            policy_types: Some(vec!["Ingress".to_string()]),
            ingress: Some(vec![NetworkPolicyIngressRule {
                ports: Some(vec![tcp_port(names::TTYD_PORT)]),
                from: Some(vec![NetworkPolicyPeer {
                    pod_selector: Some(LabelSelector {
                        match_labels: Some(BTreeMap::from([(
                            "app".to_string(),
                            names::GATEWAY_APP_LABEL.to_string(),
                        )])),
                        ..Default::default()
                    }),
                    ..Default::default()
                }]),
            }]),
            ..Default::default()
        }),
    }
}
