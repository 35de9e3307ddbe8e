//! Minimal downstream REST client for session login.

use async_trait::async_trait;
use reqwest::header::{ACCEPT, HeaderValue, SET_COOKIE};
use rootcause::prelude::Report;
use serde::Serialize;
use sso_relay_coordination::{
    CollaboratorError, DownstreamCredentials, DownstreamLogin, DownstreamToken,
};
use tracing::instrument;

use crate::config::DownstreamConfig;

/// Characters of an error response body kept for logs.
const ERROR_BODY_LIMIT: usize = 500;

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct LoginRequest<'a> {
    email_or_ldap_login_id: &'a str,
    password: &'a str,
}

/// Logs users into the downstream application over HTTP.
pub struct DownstreamClient {
    http_client: reqwest::Client,
    login_url: String,
    cookie_name: String,
}

impl DownstreamClient {
    /// Creates a client for the configured downstream application.
    pub fn new(config: &DownstreamConfig) -> Result<Self, reqwest::Error> {
        let http_client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .timeout(config.request_timeout())
            .build()?;

        Ok(Self {
            http_client,
            login_url: config.login_url(),
            cookie_name: config.cookie_name.clone(),
        })
    }
}

#[async_trait]
impl DownstreamLogin for DownstreamClient {
    #[instrument(skip_all, fields(identity = %credentials.email))]
    async fn login(
        &self,
        credentials: &DownstreamCredentials,
    ) -> Result<Option<DownstreamToken>, Report<CollaboratorError>> {
        let response = self
            .http_client
            .post(&self.login_url)
            .header(ACCEPT, "application/json")
            .json(&LoginRequest {
                email_or_ldap_login_id: &credentials.email,
                password: &credentials.password,
            })
            .send()
            .await
            .map_err(|e| CollaboratorError::DownstreamLogin {
                status: None,
                reason: e.to_string(),
            })?;

        let status = response.status();
        if status.is_client_error() || status.is_server_error() {
            let body = response.text().await.unwrap_or_default();
            return Err(CollaboratorError::DownstreamLogin {
                status: Some(status.as_u16()),
                reason: body.chars().take(ERROR_BODY_LIMIT).collect(),
            }
            .into());
        }

        let token = extract_cookie(response.headers().get_all(SET_COOKIE), &self.cookie_name);
        tracing::info!(
            status = status.as_u16(),
            has_auth_cookie = token.is_some(),
            cookie_length = token.as_ref().map_or(0, DownstreamToken::len),
            "Downstream login completed"
        );
        Ok(token)
    }
}

/// Skips the server-side login so the browser always logs in via the form.
///
/// Used when the relay cannot set cookies on the downstream domain.
#[derive(Debug, Default)]
pub struct FormOnlyLogin;

#[async_trait]
impl DownstreamLogin for FormOnlyLogin {
    async fn login(
        &self,
        _credentials: &DownstreamCredentials,
    ) -> Result<Option<DownstreamToken>, Report<CollaboratorError>> {
        Ok(None)
    }
}

/// Finds the value of cookie `name` among `Set-Cookie` header values.
fn extract_cookie<'a>(
    headers: impl IntoIterator<Item = &'a HeaderValue>,
    name: &str,
) -> Option<DownstreamToken> {
    headers
        .into_iter()
        .filter_map(|value| value.to_str().ok())
        .filter_map(|cookie| cookie.split(';').next())
        .filter_map(|pair| pair.split_once('='))
        .find(|(key, value)| key.trim() == name && !value.trim().is_empty())
        .map(|(_, value)| DownstreamToken::new(value.trim().to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn values(raw: &[&'static str]) -> Vec<HeaderValue> {
        raw.iter().map(|v| HeaderValue::from_static(v)).collect()
    }

    #[test]
    fn finds_named_cookie_among_several() {
        let headers = values(&[
            "rl_session=abc; Path=/",
            "n8n-auth=eyJhbGciOi.payload.sig; Path=/; HttpOnly; SameSite=Lax",
        ]);
        let token = extract_cookie(&headers, "n8n-auth").expect("cookie");
        assert_eq!(token.expose(), "eyJhbGciOi.payload.sig");
    }

    #[test]
    fn ignores_cookies_with_similar_names() {
        let headers = values(&["x-n8n-auth=nope; Path=/"]);
        assert!(extract_cookie(&headers, "n8n-auth").is_none());
    }

    #[test]
    fn ignores_cleared_cookie() {
        let headers = values(&["n8n-auth=; Max-Age=0"]);
        assert!(extract_cookie(&headers, "n8n-auth").is_none());
    }

    #[test]
    fn login_request_uses_downstream_field_names() {
        let body = serde_json::to_value(LoginRequest {
            email_or_ldap_login_id: "ada@example.com",
            password: "secret",
        })
        .expect("serialize");
        assert_eq!(
            body,
            serde_json::json!({"emailOrLdapLoginId": "ada@example.com", "password": "secret"})
        );
    }

    #[tokio::test]
    async fn form_only_login_never_returns_token() {
        let credentials = DownstreamCredentials {
            email: "ada@example.com".to_string(),
            password: "secret".to_string(),
        };
        assert!(FormOnlyLogin.login(&credentials).await.expect("login").is_none());
    }
}
