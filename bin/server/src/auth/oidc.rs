//! OIDC client implementation using the openidconnect crate.

use async_trait::async_trait;
use openidconnect::core::{CoreAuthenticationFlow, CoreClient, CoreProviderMetadata};
use openidconnect::{
    AuthorizationCode, ClientId, ClientSecret, CsrfToken, IssuerUrl, Nonce, RedirectUrl, Scope,
    TokenResponse,
};
use rootcause::prelude::Report;
use sso_relay_coordination::{CodeExchanger, CollaboratorError, ResolvedIdentity};
use sso_relay_core::StateId;
use tracing::instrument;

use crate::config::OidcConfig;

/// Builds the identity provider URL a login redirects to.
pub trait AuthorizationUrl: Send + Sync {
    /// Authorization URL carrying `state` as the OAuth `state` parameter.
    fn authorization_url(&self, state: &StateId) -> String;
}

/// OIDC client for authenticating users.
pub struct OidcClient {
    provider_metadata: CoreProviderMetadata,
    client_id: ClientId,
    client_secret: ClientSecret,
    redirect_url: RedirectUrl,
    http_client: reqwest::Client,
    config: OidcConfig,
}

impl OidcClient {
    /// Creates a new OIDC client by discovering the provider metadata.
    pub async fn discover(config: OidcConfig) -> Result<Self, OidcError> {
        let issuer_url = IssuerUrl::new(config.issuer_url().to_string())
            .map_err(|e| OidcError::Configuration(format!("invalid issuer URL: {}", e)))?;

        let http_client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| {
                OidcError::Configuration(format!("failed to create HTTP client: {}", e))
            })?;

        let provider_metadata = CoreProviderMetadata::discover_async(issuer_url, &http_client)
            .await
            .map_err(|e| OidcError::Discovery(format!("failed to discover provider: {}", e)))?;

        let redirect_url = RedirectUrl::new(config.redirect_uri().to_string())
            .map_err(|e| OidcError::Configuration(format!("invalid redirect URI: {}", e)))?;

        let client_id = ClientId::new(config.client_id().to_string());
        let client_secret = ClientSecret::new(config.client_secret().to_string());

        Ok(Self {
            provider_metadata,
            client_id,
            client_secret,
            redirect_url,
            http_client,
            config,
        })
    }

    /// Returns the configuration.
    pub fn config(&self) -> &OidcConfig {
        &self.config
    }
}

impl AuthorizationUrl for OidcClient {
    fn authorization_url(&self, state: &StateId) -> String {
        let client = CoreClient::from_provider_metadata(
            self.provider_metadata.clone(),
            self.client_id.clone(),
            Some(self.client_secret.clone()),
        )
        .set_redirect_uri(self.redirect_url.clone());

        let state = state.to_string();
        let mut auth_request = client.authorize_url(
            CoreAuthenticationFlow::AuthorizationCode,
            move || CsrfToken::new(state),
            Nonce::new_random,
        );

        for scope in self.config.scopes() {
            auth_request = auth_request.add_scope(Scope::new(scope.to_string()));
        }

        let (auth_url, _csrf_token, _nonce) = auth_request.url();
        auth_url.to_string()
    }
}

#[async_trait]
impl CodeExchanger for OidcClient {
    #[instrument(skip_all)]
    async fn exchange(&self, code: &str) -> Result<ResolvedIdentity, Report<CollaboratorError>> {
        let client = CoreClient::from_provider_metadata(
            self.provider_metadata.clone(),
            self.client_id.clone(),
            Some(self.client_secret.clone()),
        )
        .set_redirect_uri(self.redirect_url.clone());

        let token_response = client
            .exchange_code(AuthorizationCode::new(code.to_string()))
            .map_err(|e| CollaboratorError::CodeExchange {
                reason: format!("token endpoint error: {e}"),
            })?
            .request_async(&self.http_client)
            .await
            .map_err(|e| CollaboratorError::CodeExchange {
                reason: format!("token exchange failed: {e}"),
            })?;

        let id_token = token_response
            .id_token()
            .ok_or_else(|| CollaboratorError::CodeExchange {
                reason: "no ID token in response".to_string(),
            })?;

        // The state token is the request binding; no nonce is stored per login.
        let claims = id_token
            .claims(
                &client.id_token_verifier(),
                |_: Option<&Nonce>| -> Result<(), String> { Ok(()) },
            )
            .map_err(|e| CollaboratorError::CodeExchange {
                reason: format!("ID token validation failed: {e}"),
            })?;

        let identity = identity_from_claims(ClaimValues {
            subject: claims.subject().to_string(),
            email: claims.email().map(|e| e.as_str().to_string()),
            preferred_username: claims.preferred_username().map(|u| u.as_str().to_string()),
            name: claims
                .name()
                .and_then(|n| n.get(None))
                .map(|n| n.as_str().to_string()),
            given_name: claims
                .given_name()
                .and_then(|n| n.get(None))
                .map(|n| n.as_str().to_string()),
            family_name: claims
                .family_name()
                .and_then(|n| n.get(None))
                .map(|n| n.as_str().to_string()),
        })?;

        tracing::debug!(identity = %identity.email, "ID token verified");
        Ok(identity)
    }
}

/// Standard claims read from a verified ID token.
#[derive(Debug, Default)]
struct ClaimValues {
    subject: String,
    email: Option<String>,
    preferred_username: Option<String>,
    name: Option<String>,
    given_name: Option<String>,
    family_name: Option<String>,
}

/// Maps verified claims to an identity; email falls back to `preferred_username`.
fn identity_from_claims(claims: ClaimValues) -> Result<ResolvedIdentity, CollaboratorError> {
    let email = claims
        .email
        .filter(|email| !email.is_empty())
        .or(claims.preferred_username.filter(|name| !name.is_empty()))
        .ok_or_else(|| CollaboratorError::MissingIdentity {
            claim: "email".to_string(),
        })?;

    Ok(ResolvedIdentity::new(email)
        .with_subject(Some(claims.subject))
        .with_names(claims.name, claims.given_name, claims.family_name))
}

/// OIDC-related errors.
#[derive(Debug)]
pub enum OidcError {
    /// Configuration error (invalid URLs, etc.)
    Configuration(String),
    /// Failed to discover provider metadata.
    Discovery(String),
}

impl std::fmt::Display for OidcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Configuration(msg) => write!(f, "OIDC configuration error: {}", msg),
            Self::Discovery(msg) => write!(f, "OIDC discovery error: {}", msg),
        }
    }
}

impl std::error::Error for OidcError {}
