//! Naming and labelling conventions for workspace-owned objects.
//!
//! Every object derived from a Workspace is named `{userID}-workspace-{suffix}`
//! and carries the common label set, so the gateway, the operator, and humans
//! running `kubectl` all agree on what belongs to whom.

use std::collections::BTreeMap;

/// Port the in-pod terminal server listens on.
pub const TTYD_PORT: i32 = 7681;

/// Mount path of the user's persistent volume inside the pod.
pub const WORKSPACE_MOUNT_PATH: &str = "/workspace";

/// Mount path of the optional custom CA bundle.
pub const CA_BUNDLE_MOUNT_PATH: &str = "/etc/ssl/certs/custom";

/// `app` label carried by gateway pods; the ingress policy selects on it.
pub const GATEWAY_APP_LABEL: &str = "workspace-gateway";

/// Maximum user id length. Suffixed resource names (`-workspace-pod`) must
/// still fit the 63-character limit on pod and service names.
pub const MAX_USER_ID_LEN: usize = 49;

/// Name of the workspace pod for a user id.
pub fn pod(user_id: &str) -> String {
    format!("{user_id}-workspace-pod")
}

/// Name of the persistent claim for a user id.
pub fn pvc(user_id: &str) -> String {
    format!("{user_id}-workspace-pvc")
}

/// Name of the headless service for a user id.
pub fn service(user_id: &str) -> String {
    format!("{user_id}-workspace-svc")
}

/// Shared name of the per-user ServiceAccount, Role, and RoleBinding.
pub fn rbac(user_id: &str) -> String {
    format!("{user_id}-workspace")
}

/// Name of a network policy for a user id and policy suffix.
pub fn netpol(user_id: &str, suffix: &str) -> String {
    format!("{user_id}-workspace-{suffix}")
}

/// In-cluster DNS name of the workspace's headless service.
pub fn service_endpoint(user_id: &str, namespace: &str) -> String {
    format!("{}.{namespace}.svc.cluster.local", service(user_id))
}

/// Common labels stamped on every workspace-owned object.
pub fn labels(user_id: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("app".to_string(), "workspace".to_string()),
        ("user".to_string(), user_id.to_string()),
        ("managed-by".to_string(), "devplane".to_string()),
    ])
}

/// Whether `s` is a valid lowercase RFC 1123 DNS label.
pub fn is_dns_label(s: &str) -> bool {
    let bytes = s.as_bytes();
    if bytes.is_empty() || bytes.len() > 63 {
        return false;
    }
    let alnum = |b: u8| b.is_ascii_lowercase() || b.is_ascii_digit();
    alnum(bytes[0])
        && alnum(bytes[bytes.len() - 1])
        && bytes.iter().all(|&b| alnum(b) || b == b'-')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_object_names() {
        assert_eq!(pod("john"), "john-workspace-pod");
        assert_eq!(pvc("john"), "john-workspace-pvc");
        assert_eq!(service("john"), "john-workspace-svc");
        assert_eq!(rbac("john"), "john-workspace");
        assert_eq!(netpol("john", "deny-all"), "john-workspace-deny-all");
        assert_eq!(netpol("john", "egress"), "john-workspace-egress");
        assert_eq!(
            netpol("john", "ingress-gateway"),
            "john-workspace-ingress-gateway"
        );
    }

    #[test]
    fn test_longest_user_id_still_fits_pod_name() {
        let user_id = "a".repeat(MAX_USER_ID_LEN);
        assert!(pod(&user_id).len() <= 63);
        assert!(service(&user_id).len() <= 63);
        assert!(pvc(&user_id).len() <= 63);
    }

    #[test]
    fn test_service_endpoint() {
        assert_eq!(
            service_endpoint("alice", "default"),
            "alice-workspace-svc.default.svc.cluster.local"
        );
    }

    #[test]
    fn test_labels() {
        let labels = labels("bob");
        assert_eq!(labels["app"], "workspace");
        assert_eq!(labels["user"], "bob");
        assert_eq!(labels["managed-by"], "devplane");
    }

    #[test]
    fn test_dns_label() {
        assert!(is_dns_label("john"));
        assert!(is_dns_label("auth0-12345"));
        assert!(is_dns_label("u-12345678-abcd"));
        assert!(!is_dns_label(""));
        assert!(!is_dns_label("-leading"));
        assert!(!is_dns_label("trailing-"));
        assert!(!is_dns_label("UpperCase"));
        assert!(!is_dns_label("dot.ted"));
        assert!(!is_dns_label(&"a".repeat(64)));
    }
}
