//! OIDC authorization-code flow for the browser login path.
//!
//! Discovery and code exchange run against the same issuer the token
//! validator uses; the CSRF `state` round-trips through a cookie rather
//! than server-side session storage.

use openidconnect::core::{CoreAuthenticationFlow, CoreClient, CoreProviderMetadata};
use openidconnect::reqwest::async_http_client;
use openidconnect::{
    AuthorizationCode, ClientId, ClientSecret, CsrfToken, IssuerUrl, Nonce, OAuth2TokenResponse,
    RedirectUrl, Scope, TokenResponse,
};
use std::time::Duration;
use thiserror::Error;

use crate::config::GatewayConfig;

#[derive(Debug, Error)]
pub enum OidcError {
    #[error("OIDC provider discovery failed: {0}")]
    DiscoveryFailed(String),
    #[error("token exchange failed: {0}")]
    ExchangeFailed(String),
    #[error("token response is missing an id_token")]
    MissingIdToken,
}

/// Capability seam for the authorization-code flow, so the login handlers
/// can run against a double.
#[async_trait::async_trait]
pub trait AuthCodeFlow: Send + Sync {
    /// Builds the provider authorization URL carrying `state` for CSRF
    /// protection.
    fn authorize_url(&self, state: String) -> String;

    /// Exchanges an authorization code for the raw ID token and the access
    /// token lifetime, when the provider reports one.
    async fn exchange_code(&self, code: String) -> Result<(String, Option<Duration>), OidcError>;
}

/// OAuth2/OIDC client for `/login` and `/callback`.
pub struct OidcClient {
    client: CoreClient,
}

impl OidcClient {
    /// Discovers the provider and configures the confidential client.
    pub async fn discover(config: &GatewayConfig) -> Result<Self, OidcError> {
        let issuer = IssuerUrl::new(config.issuer_url.clone())
            .map_err(|e| OidcError::DiscoveryFailed(e.to_string()))?;
        let redirect = RedirectUrl::new(config.redirect_url.clone())
            .map_err(|e| OidcError::DiscoveryFailed(e.to_string()))?;
        let metadata = CoreProviderMetadata::discover_async(issuer, async_http_client)
            .await
            .map_err(|e| OidcError::DiscoveryFailed(e.to_string()))?;

        let client = CoreClient::from_provider_metadata(
            metadata,
            ClientId::new(config.client_id.clone()),
            Some(ClientSecret::new(config.client_secret.clone())),
        )
        .set_redirect_uri(redirect);

        Ok(Self { client })
    }
}

#[async_trait::async_trait]
impl AuthCodeFlow for OidcClient {
    fn authorize_url(&self, state: String) -> String {
        let (url, _state, _nonce) = self
            .client
            .authorize_url(
                CoreAuthenticationFlow::AuthorizationCode,
                move || CsrfToken::new(state),
                Nonce::new_random,
            )
            .add_scope(Scope::new("email".to_string()))
            .add_scope(Scope::new("profile".to_string()))
            .url();
        url.to_string()
    }

    async fn exchange_code(&self, code: String) -> Result<(String, Option<Duration>), OidcError> {
        let response = self
            .client
            .exchange_code(AuthorizationCode::new(code))
            .request_async(async_http_client)
            .await
            .map_err(|e| OidcError::ExchangeFailed(e.to_string()))?;

        let id_token = response.id_token().ok_or(OidcError::MissingIdToken)?;
        Ok((id_token.to_string(), response.expires_in()))
    }
}
