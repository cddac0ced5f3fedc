//! Gateway configuration, read once from the environment at startup.

use anyhow::{anyhow, Context as _, Result};
use devplane_api::AiProvider;

/// Provider list used when `AI_PROVIDERS_JSON` is unset.
const DEFAULT_PROVIDERS_JSON: &str =
    r#"[{"name":"local","endpoint":"http://vllm.ai-system.svc:8000","models":["deepseek-coder-33b-instruct"]}]"#;

/// Immutable gateway settings.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// OIDC issuer base URL.
    pub issuer_url: String,
    /// OAuth client credentials and redirect.
    pub client_id: String,
    pub client_secret: String,
    pub redirect_url: String,
    /// Namespace Workspace resources are placed in.
    pub namespace: String,
    /// HTTP listen port.
    pub port: u16,
    /// Default AI providers for newly created Workspaces.
    pub default_providers: Vec<AiProvider>,
}

impl GatewayConfig {
    /// Reads the environment. The four `OIDC_*` variables are required;
    /// everything else has a default.
    pub fn from_env() -> Result<Self> {
        let issuer_url = required("OIDC_ISSUER_URL")?;
        let client_id = required("OIDC_CLIENT_ID")?;
        let client_secret = required("OIDC_CLIENT_SECRET")?;
        let redirect_url = required("OIDC_REDIRECT_URL")?;

        let namespace = env_or("NAMESPACE", "default");
        let port = env_or("PORT", "8080")
            .parse::<u16>()
            .context("parse PORT")?;

        let providers_json = env_or("AI_PROVIDERS_JSON", DEFAULT_PROVIDERS_JSON);
        let default_providers: Vec<AiProvider> =
            serde_json::from_str(&providers_json).context("parse AI_PROVIDERS_JSON")?;

        Ok(Self {
            issuer_url,
            client_id,
            client_secret,
            redirect_url,
            namespace,
            port,
            default_providers,
        })
    }

    /// Cookies are marked `Secure` exactly when the login flow runs on HTTPS.
    pub fn cookie_secure(&self) -> bool {
        self.redirect_url.starts_with("https://")
    }
}

fn required(key: &str) -> Result<String> {
    std::env::var(key)
        .ok()
        .filter(|value| !value.is_empty())
        .ok_or_else(|| anyhow!("required env var {key:?} is not set"))
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key)
        .ok()
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| default.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_providers_json_parses() {
        let providers: Vec<AiProvider> = serde_json::from_str(DEFAULT_PROVIDERS_JSON).unwrap();
        assert_eq!(providers.len(), 1);
        assert_eq!(providers[0].name, "local");
        assert_eq!(providers[0].endpoint, "http://vllm.ai-system.svc:8000");
        assert_eq!(providers[0].models, vec!["deepseek-coder-33b-instruct"]);
    }

    #[test]
    fn test_cookie_secure_follows_redirect_scheme() {
        let mut config = GatewayConfig {
            issuer_url: "https://idp.example.com".to_string(),
            client_id: "devplane".to_string(),
            client_secret: "secret".to_string(),
            redirect_url: "https://devplane.example.com/callback".to_string(),
            namespace: "default".to_string(),
            port: 8080,
            default_providers: Vec::new(),
        };
        assert!(config.cookie_secure());

        config.redirect_url = "http://localhost:8080/callback".to_string();
        assert!(!config.cookie_secure());
    }
}
