//! Workspace spec validation.
//!
//! Runs at the head of every reconcile so that malformed specs settle to the
//! `Failed` phase with a precise message instead of erroring deep inside a
//! builder or the API server.

use thiserror::Error;

use crate::names;
use crate::WorkspaceSpec;

/// A workspace spec that can never be realized. Not retryable.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("{0}")]
pub struct InvalidSpec(pub String);

/// Validates required fields, the user-id DNS-label format, resource quantity
/// syntax, and provider completeness.
pub fn validate_spec(spec: &WorkspaceSpec) -> Result<(), InvalidSpec> {
    if spec.user.id.is_empty() {
        return Err(InvalidSpec("spec.user.id is required".to_string()));
    }
    if spec.user.id.len() > names::MAX_USER_ID_LEN {
        return Err(InvalidSpec(format!(
            "spec.user.id must be {} characters or fewer (got {})",
            names::MAX_USER_ID_LEN,
            spec.user.id.len()
        )));
    }
    // The user id prefixes every owned resource name.
    if !names::is_dns_label(&spec.user.id) {
        return Err(InvalidSpec(
            "spec.user.id must be a valid DNS label: lowercase alphanumeric and \
             hyphens only, must start and end with alphanumeric"
                .to_string(),
        ));
    }
    if spec.user.email.is_empty() {
        return Err(InvalidSpec("spec.user.email is required".to_string()));
    }

    for (field, value) in [
        ("cpu", &spec.resources.cpu),
        ("memory", &spec.resources.memory),
        ("storage", &spec.resources.storage),
    ] {
        if value.is_empty() {
            return Err(InvalidSpec(format!("spec.resources.{field} is required")));
        }
        if !is_quantity(value) {
            return Err(InvalidSpec(format!(
                "spec.resources.{field} invalid: {value:?} is not a quantity"
            )));
        }
    }

    if spec.ai_config.providers.is_empty() {
        return Err(InvalidSpec(
            "spec.aiConfig.providers must have at least one entry".to_string(),
        ));
    }
    for (i, provider) in spec.ai_config.providers.iter().enumerate() {
        if provider.name.is_empty() {
            return Err(InvalidSpec(format!(
                "spec.aiConfig.providers[{i}].name is required"
            )));
        }
        if provider.endpoint.is_empty() {
            return Err(InvalidSpec(format!(
                "spec.aiConfig.providers[{i}].endpoint is required"
            )));
        }
        if provider.models.is_empty() {
            return Err(InvalidSpec(format!(
                "spec.aiConfig.providers[{i}].models must have at least one entry"
            )));
        }
    }

    Ok(())
}

/// Whether `s` parses as a Kubernetes quantity: a decimal number followed by
/// an optional binary/SI suffix or decimal exponent.
pub fn is_quantity(s: &str) -> bool {
    let s = s.strip_prefix('+').unwrap_or(s);
    let split = s
        .find(|c: char| !c.is_ascii_digit() && c != '.')
        .unwrap_or(s.len());
    let (number, suffix) = s.split_at(split);
    if number.is_empty() || number.parse::<f64>().is_err() {
        return false;
    }
    match suffix {
        "" | "n" | "u" | "m" | "k" | "M" | "G" | "T" | "P" | "E" => true,
        "Ki" | "Mi" | "Gi" | "Ti" | "Pi" | "Ei" => true,
        _ => {
            // Decimal exponent form, e.g. "1e3".
            let Some(exp) = suffix.strip_prefix(['e', 'E']) else {
                return false;
            };
            !exp.is_empty() && exp.parse::<i32>().is_ok()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{AiConfig, AiProvider, PersistenceConfig, UserInfo, WorkspaceResources};

    fn valid_spec() -> WorkspaceSpec {
        WorkspaceSpec {
            user: UserInfo {
                id: "john".to_string(),
                email: "john@example.com".to_string(),
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
        }
    }

    #[test]
    fn test_valid_spec_passes() {
        assert!(validate_spec(&valid_spec()).is_ok());
    }

    #[test]
    fn test_empty_user_id_rejected() {
        let mut spec = valid_spec();
        spec.user.id = String::new();
        let err = validate_spec(&spec).unwrap_err();
        assert_eq!(err.0, "spec.user.id is required");
    }

    #[test]
    fn test_user_id_must_be_dns_label() {
        let mut spec = valid_spec();
        spec.user.id = "John Doe".to_string();
        assert!(validate_spec(&spec).is_err());

        spec.user.id = "-john".to_string();
        assert!(validate_spec(&spec).is_err());
    }

    #[test]
    fn test_over_long_user_id_rejected() {
        let mut spec = valid_spec();
        spec.user.id = "a".repeat(50);
        let err = validate_spec(&spec).unwrap_err();
        assert!(err.0.contains("49 characters or fewer"));
    }

    #[test]
    fn test_bad_quantity_rejected() {
        let mut spec = valid_spec();
        spec.resources.memory = "4GiB".to_string();
        let err = validate_spec(&spec).unwrap_err();
        assert!(err.0.contains("spec.resources.memory"));
    }

    #[test]
    fn test_empty_providers_rejected() {
        let mut spec = valid_spec();
        spec.ai_config.providers.clear();
        let err = validate_spec(&spec).unwrap_err();
        assert!(err.0.contains("providers must have at least one entry"));
    }

    #[test]
    fn test_incomplete_provider_rejected() {
        let mut spec = valid_spec();
        spec.ai_config.providers[0].endpoint = String::new();
        let err = validate_spec(&spec).unwrap_err();
        assert_eq!(err.0, "spec.aiConfig.providers[0].endpoint is required");

        let mut spec = valid_spec();
        spec.ai_config.providers[0].models.clear();
        let err = validate_spec(&spec).unwrap_err();
        assert!(err.0.contains("providers[0].models"));
    }

    #[test]
    fn test_quantity_grammar() {
        for ok in ["2", "100m", "4Gi", "20Gi", "1.5", "500", "1e3", "128974848"] {
            assert!(is_quantity(ok), "{ok} should parse");
        }
        for bad in ["", "Gi", "4GiB", "two", "4 Gi", "-", "1e"] {
            assert!(!is_quantity(bad), "{bad} should not parse");
        }
    }
}
