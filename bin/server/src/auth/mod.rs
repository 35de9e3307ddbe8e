//! Authentication relay for the sso-relay server.
//!
//! This module provides:
//! - OIDC login against the external identity provider
//! - The callback endpoint that runs the coordination core and hands the
//!   browser over to the downstream application
//! - The identity-provider webhook that turns a logout into local and
//!   downstream session invalidation
//! - Request extractors for client address and user agent
//!
//! The relay keeps no session cookie of its own. All state lives in the
//! coordination stores for the lifetime of the process.

pub mod middleware;
pub mod oidc;
pub mod routes;

use sso_relay_coordination::CallbackOrchestrator;
use std::sync::Arc;
use url::Url;

use crate::config::DownstreamConfig;

pub use middleware::ClientInfo;
pub use oidc::{AuthorizationUrl, OidcClient, OidcError};
pub use routes::{callback, health, login, webhook};

/// Shared application state.
pub struct AppState {
    /// Callback decision procedure and the stores behind it.
    pub orchestrator: CallbackOrchestrator,
    /// Builds identity provider redirects.
    pub authorizer: Arc<dyn AuthorizationUrl>,
    /// Relay callback URL recorded with each issued state.
    pub callback_url: String,
    /// Downstream application settings.
    pub downstream: DownstreamConfig,
    /// Target of failed-login redirects.
    pub default_redirect_url: Url,
}

impl AppState {
    /// Creates a new application state.
    pub fn new(
        orchestrator: CallbackOrchestrator,
        authorizer: Arc<dyn AuthorizationUrl>,
        callback_url: String,
        downstream: DownstreamConfig,
        default_redirect_url: Url,
    ) -> Self {
        Self {
            orchestrator,
            authorizer,
            callback_url,
            downstream,
            default_redirect_url,
        }
    }
}
