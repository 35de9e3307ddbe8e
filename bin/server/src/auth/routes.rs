//! Authentication routes for login, callback, logout webhook, and health.
//!
//! Redirects are `302 Found`, which is what browsers and the identity
//! provider's tooling expect from the relay.

use axum::{
    Json,
    extract::{Query, State},
    http::{StatusCode, header},
    response::{Html, IntoResponse, Response},
};
use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use serde::Deserialize;
use serde_json::{Value, json};
use sso_relay_coordination::{
    CallbackOutcome, CallbackRequest, DownstreamRevocation, DownstreamToken, Handoff,
};
use std::sync::Arc;
use time::Duration as TimeDuration;
use url::Url;

use super::{AppState, ClientInfo};
use crate::config::DownstreamConfig;
use crate::handoff::form_login_page;

/// Flash shown when the provider redirects back without a code or state.
const INCOMPLETE_CALLBACK_MESSAGE: &str = "Login was cancelled or incomplete. Please try again.";

/// Query parameters for the OIDC callback.
#[derive(Debug, Deserialize)]
pub struct CallbackQuery {
    code: Option<String>,
    state: Option<String>,
}

/// Identity-provider webhook event.
#[derive(Debug, Deserialize)]
pub struct WebhookPayload {
    /// Event ID, echoed back in the response.
    #[serde(default)]
    id: Option<Value>,
    /// Event action, e.g. `logout`.
    #[serde(default)]
    action: Option<String>,
    /// User details attached to the event.
    #[serde(default, rename = "extendedUser")]
    extended_user: Option<WebhookUser>,
    /// The event's subject object, which carries the email on some events.
    #[serde(default)]
    object: Option<Value>,
}

/// User attached to a webhook event.
#[derive(Debug, Deserialize)]
pub struct WebhookUser {
    #[serde(default)]
    email: Option<String>,
}

impl WebhookPayload {
    fn is_logout(&self) -> bool {
        self.action.as_deref() == Some("logout")
    }

    /// Email of the affected user, from `extendedUser` or else `object`.
    fn user_email(&self) -> Option<&str> {
        self.extended_user
            .as_ref()
            .and_then(|user| user.email.as_deref())
            .or_else(|| {
                self.object
                    .as_ref()
                    .and_then(|object| object.get("email"))
                    .and_then(Value::as_str)
            })
            .filter(|email| !email.is_empty())
    }
}

/// Initiates the OIDC login flow by redirecting to the identity provider.
pub async fn login(State(state): State<Arc<AppState>>, client: ClientInfo) -> Response {
    let start =
        state
            .orchestrator
            .begin_login(&client.ip, &client.user_agent, &state.callback_url);

    tracing::info!(
        state_id = %start.state_id,
        correlation_id = %start.correlation_id,
        origin_ip = %client.ip,
        "Starting login"
    );

    found(&state.authorizer.authorization_url(&start.state_id))
}

/// Handles the OIDC callback after the user authenticates with the identity provider.
pub async fn callback(
    State(state): State<Arc<AppState>>,
    Query(query): Query<CallbackQuery>,
    client: ClientInfo,
    jar: CookieJar,
) -> Response {
    let code = query.code.filter(|code| !code.is_empty());
    let oauth_state = query.state.filter(|state| !state.is_empty());
    let (Some(code), Some(oauth_state)) = (code, oauth_state) else {
        tracing::warn!(origin_ip = %client.ip, "Callback missing code or state");
        return failure_redirect(&state.default_redirect_url, INCOMPLETE_CALLBACK_MESSAGE);
    };

    let request = CallbackRequest {
        code,
        state: oauth_state,
        origin_ip: client.ip,
        user_agent: client.user_agent,
    };

    match state.orchestrator.handle(&request).await {
        CallbackOutcome::Completed(login) => match login.handoff {
            Handoff::Cookie { token } => {
                tracing::info!(
                    correlation_id = %login.correlation_id,
                    identity = %login.identity,
                    cookie_domain = state.downstream.cookie_domain().unwrap_or_default(),
                    "Setting downstream cookie"
                );
                let cookie = downstream_cookie(&state.downstream, &token);
                (jar.add(cookie), found(&state.downstream.landing_url())).into_response()
            }
            Handoff::FormLogin { credentials } => {
                tracing::info!(
                    correlation_id = %login.correlation_id,
                    identity = %login.identity,
                    "Handing off via login form"
                );
                Html(form_login_page(
                    &state.downstream.login_url(),
                    &state.downstream.landing_url(),
                    &credentials,
                ))
                .into_response()
            }
        },
        CallbackOutcome::SafeFailure(failure) => {
            failure_redirect(&state.default_redirect_url, failure.flash_message())
        }
    }
}

/// Receives identity-provider webhooks and acts on logout events.
///
/// A logout drops the user's local session and invalidates their downstream
/// sessions. Other actions are acknowledged and ignored.
pub async fn webhook(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<WebhookPayload>,
) -> Response {
    let webhook_id = payload.id.clone().unwrap_or(Value::Null);

    if !payload.is_logout() {
        tracing::info!(webhook_id = %webhook_id, action = ?payload.action, "Ignoring non-logout webhook event");
        return Json(json!({
            "status": "ignored",
            "reason": "not_logout_event",
            "webhook_id": webhook_id,
        }))
        .into_response();
    }

    let Some(email) = payload.user_email() else {
        tracing::warn!(webhook_id = %webhook_id, "Logout webhook missing user email");
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({
                "status": "error",
                "reason": "missing_user_email",
                "webhook_id": webhook_id,
            })),
        )
            .into_response();
    };

    match state.orchestrator.logout(email).await {
        Ok(outcome) => {
            let (status, label) = match outcome.downstream {
                DownstreamRevocation::Failed => (StatusCode::BAD_GATEWAY, "partial_failure"),
                DownstreamRevocation::Revoked | DownstreamRevocation::NoAccount => {
                    (StatusCode::OK, "success")
                }
            };
            (
                status,
                Json(json!({
                    "status": label,
                    "user_email": email,
                    "session_removed": outcome.session_removed,
                    "downstream": outcome.downstream.as_str(),
                    "webhook_id": webhook_id,
                })),
            )
                .into_response()
        }
        Err(e) => {
            tracing::warn!(webhook_id = %webhook_id, error = %e, "Logout could not be processed");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(json!({
                    "status": "error",
                    "reason": "session_busy",
                    "webhook_id": webhook_id,
                })),
            )
                .into_response()
        }
    }
}

/// Liveness check.
pub async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

fn downstream_cookie(config: &DownstreamConfig, token: &DownstreamToken) -> Cookie<'static> {
    let mut cookie = Cookie::build((config.cookie_name.clone(), token.expose().to_string()))
        .path("/")
        .http_only(true)
        .secure(config.secure_cookies())
        .same_site(SameSite::Lax)
        .max_age(TimeDuration::days(config.cookie_max_age_days));

    if let Some(domain) = config.cookie_domain() {
        cookie = cookie.domain(domain.to_string());
    }

    cookie.build()
}

fn failure_redirect(base: &Url, message: &str) -> Response {
    let mut url = base.clone();
    url.query_pairs_mut().append_pair("flash", message);
    found(url.as_str())
}

fn found(location: &str) -> Response {
    (StatusCode::FOUND, [(header::LOCATION, location.to_string())]).into_response()
}
