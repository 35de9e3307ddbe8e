//! Centralized server configuration.
//!
//! This module provides strongly-typed configuration for the server,
//! loaded via the `config` crate from environment variables, e.g.
//! `OIDC__ISSUER_URL` or `COORDINATION__STATE_TTL_SECONDS`.

use serde::Deserialize;
use sso_relay_coordination::CoordinationConfig;
use url::Url;

/// Server configuration composed from library configs.
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    /// Address to listen on.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Where failed logins are sent, with a `flash` query parameter.
    pub default_redirect_url: Url,

    /// Forces the form hand-off, for local setups where the downstream
    /// cookie domain cannot be set from the relay.
    #[serde(default)]
    pub debug: bool,

    /// OIDC provider configuration.
    pub oidc: OidcConfig,

    /// Downstream application configuration.
    pub downstream: DownstreamConfig,

    /// Coordination store tunables.
    #[serde(default)]
    pub coordination: CoordinationConfig,
}

fn default_bind_addr() -> String {
    "0.0.0.0:8000".to_string()
}

/// Configuration for the OIDC identity provider.
#[derive(Debug, Clone, Deserialize)]
pub struct OidcConfig {
    /// Issuer URL, used for discovery.
    issuer_url: String,
    /// OAuth2 client ID registered with the provider.
    client_id: String,
    /// OAuth2 client secret.
    client_secret: String,
    /// Redirect URI for the callback (e.g., "https://relay.example.com/auth/callback").
    redirect_uri: String,
    /// Scopes to request as a comma-separated string.
    /// Default: "openid,email,profile"
    #[serde(default = "default_scopes")]
    scopes: String,
}

fn default_scopes() -> String {
    "openid,email,profile".to_string()
}

impl OidcConfig {
    /// Creates a configuration with the default scopes.
    #[must_use]
    pub fn new(
        issuer_url: String,
        client_id: String,
        client_secret: String,
        redirect_uri: String,
    ) -> Self {
        Self {
            issuer_url,
            client_id,
            client_secret,
            redirect_uri,
            scopes: default_scopes(),
        }
    }

    /// Returns the issuer URL.
    #[must_use]
    pub fn issuer_url(&self) -> &str {
        &self.issuer_url
    }

    /// Returns the OAuth2 client ID.
    #[must_use]
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Returns the OAuth2 client secret.
    #[must_use]
    pub fn client_secret(&self) -> &str {
        &self.client_secret
    }

    /// Returns the redirect URI.
    #[must_use]
    pub fn redirect_uri(&self) -> &str {
        &self.redirect_uri
    }

    /// Returns the scopes to request, excluding `openid` which is always sent.
    #[must_use]
    pub fn scopes(&self) -> Vec<&str> {
        self.scopes
            .split(',')
            .map(str::trim)
            .filter(|scope| !scope.is_empty() && *scope != "openid")
            .collect()
    }
}

/// Configuration for the downstream application and its account store.
#[derive(Debug, Clone, Deserialize)]
pub struct DownstreamConfig {
    /// Public base URL of the downstream application.
    pub base_url: Url,

    /// PostgreSQL URL of the downstream application's database.
    pub database_url: String,

    /// Global role assigned to newly created users.
    #[serde(default = "default_global_role")]
    pub global_role: String,

    /// Role on the personal project assigned to newly created users.
    #[serde(default = "default_project_role")]
    pub project_role: String,

    /// Name of the downstream session cookie.
    #[serde(default = "default_cookie_name")]
    pub cookie_name: String,

    /// Max age of the downstream session cookie, in days.
    #[serde(default = "default_cookie_max_age_days")]
    pub cookie_max_age_days: i64,

    /// Timeout for downstream HTTP requests, in seconds.
    #[serde(default = "default_request_timeout_seconds")]
    pub request_timeout_seconds: u64,
}

fn default_global_role() -> String {
    "global:member".to_string()
}

fn default_project_role() -> String {
    "project:personalOwner".to_string()
}

fn default_cookie_name() -> String {
    "n8n-auth".to_string()
}

fn default_cookie_max_age_days() -> i64 {
    7
}

fn default_request_timeout_seconds() -> u64 {
    10
}

impl DownstreamConfig {
    /// Creates a configuration with defaults for optional fields.
    #[must_use]
    pub fn new(base_url: Url, database_url: String) -> Self {
        Self {
            base_url,
            database_url,
            global_role: default_global_role(),
            project_role: default_project_role(),
            cookie_name: default_cookie_name(),
            cookie_max_age_days: default_cookie_max_age_days(),
            request_timeout_seconds: default_request_timeout_seconds(),
        }
    }

    /// Downstream login endpoint.
    #[must_use]
    pub fn login_url(&self) -> String {
        self.join("rest/login")
    }

    /// Page the browser lands on after the hand-off.
    #[must_use]
    pub fn landing_url(&self) -> String {
        self.join("home/workflows")
    }

    /// Domain for the downstream session cookie.
    #[must_use]
    pub fn cookie_domain(&self) -> Option<&str> {
        self.base_url.host_str()
    }

    /// Whether the downstream cookie must be marked `Secure`.
    #[must_use]
    pub fn secure_cookies(&self) -> bool {
        self.base_url.scheme() == "https"
    }

    /// Downstream request timeout.
    #[must_use]
    pub fn request_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.request_timeout_seconds)
    }

    fn join(&self, path: &str) -> String {
        format!("{}/{path}", self.base_url.as_str().trim_end_matches('/'))
    }
}

impl ServerConfig {
    /// Loads configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if required configuration is missing or invalid.
    pub fn from_env() -> Result<Self, config::ConfigError> {
        let config: Self = config::Config::builder()
            .add_source(
                config::Environment::default()
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects settings that deserialize but cannot be used.
    fn validate(&self) -> Result<(), config::ConfigError> {
        self.coordination
            .validate()
            .map_err(|e| config::ConfigError::Message(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn downstream(base: &str) -> DownstreamConfig {
        DownstreamConfig::new(
            Url::parse(base).expect("valid url"),
            "postgres://n8n@localhost/n8n".to_string(),
        )
    }

    #[test]
    fn downstream_config_has_correct_defaults() {
        let config = downstream("https://n8n.example.com");
        assert_eq!(config.cookie_name, "n8n-auth");
        assert_eq!(config.cookie_max_age_days, 7);
        assert_eq!(config.global_role, "global:member");
        assert_eq!(config.project_role, "project:personalOwner");
        assert_eq!(config.request_timeout(), std::time::Duration::from_secs(10));
    }

    #[test]
    fn downstream_urls_ignore_trailing_slash() {
        let config = downstream("https://n8n.example.com/");
        assert_eq!(config.login_url(), "https://n8n.example.com/rest/login");
        assert_eq!(config.landing_url(), "https://n8n.example.com/home/workflows");
    }

    #[test]
    fn cookie_attributes_follow_base_url() {
        let secure = downstream("https://n8n.example.com");
        assert_eq!(secure.cookie_domain(), Some("n8n.example.com"));
        assert!(secure.secure_cookies());

        let local = downstream("http://localhost:5678");
        assert_eq!(local.cookie_domain(), Some("localhost"));
        assert!(!local.secure_cookies());
    }

    #[test]
    fn unusable_coordination_settings_fail_validation() {
        let mut config = ServerConfig {
            bind_addr: default_bind_addr(),
            default_redirect_url: Url::parse("https://relay.example.com/").expect("valid url"),
            debug: false,
            oidc: OidcConfig::new(
                "https://idp.example.com".to_string(),
                "relay".to_string(),
                "secret".to_string(),
                "https://relay.example.com/auth/callback".to_string(),
            ),
            downstream: downstream("https://n8n.example.com"),
            coordination: CoordinationConfig::default(),
        };
        assert!(config.validate().is_ok());

        config.coordination.sweep_interval_seconds = 0;
        let error = config.validate().expect_err("zero sweep interval");
        assert!(error.to_string().contains("sweep_interval_seconds"));
    }

    #[test]
    fn scopes_are_trimmed_and_skip_openid() {
        let config = OidcConfig::new(
            "https://idp.example.com".to_string(),
            "relay".to_string(),
            "secret".to_string(),
            "https://relay.example.com/auth/callback".to_string(),
        );
        assert_eq!(config.scopes(), vec!["email", "profile"]);
    }
}
