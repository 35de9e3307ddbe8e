//! External collaborators invoked by the callback orchestrator.
//!
//! The orchestrator treats these as opaque: it hands the admitted code or
//! the resolved identity over and acts only on success or failure.

use async_trait::async_trait;
use rootcause::Report;
use std::fmt;

use crate::error::CollaboratorError;
use crate::session::DownstreamToken;

/// Identity resolved from a verified identity-provider response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedIdentity {
    /// Verified email; the key into the session store.
    pub email: String,
    /// Provider subject, when known.
    pub subject: Option<String>,
    /// Given name.
    pub first_name: Option<String>,
    /// Family name.
    pub last_name: Option<String>,
    /// Display name as provided.
    pub display_name: Option<String>,
}

impl ResolvedIdentity {
    /// Creates an identity with only an email.
    #[must_use]
    pub fn new(email: String) -> Self {
        Self {
            email,
            subject: None,
            first_name: None,
            last_name: None,
            display_name: None,
        }
    }

    /// Sets the provider subject.
    #[must_use]
    pub fn with_subject(mut self, subject: Option<String>) -> Self {
        self.subject = subject;
        self
    }

    /// Sets the names.
    ///
    /// When no given name is supplied the display name is split on its first
    /// space into given and family names.
    #[must_use]
    pub fn with_names(
        mut self,
        display_name: Option<String>,
        first_name: Option<String>,
        last_name: Option<String>,
    ) -> Self {
        let display_name = display_name.filter(|name| !name.is_empty());
        let (first_name, last_name) = match (first_name, &display_name) {
            (Some(first), _) => (Some(first), last_name),
            (None, Some(name)) => match name.split_once(' ') {
                Some((first, last)) => (Some(first.to_string()), Some(last.to_string())),
                None => (Some(name.clone()), Some(String::new())),
            },
            (None, None) => (None, last_name),
        };
        self.first_name = first_name;
        self.last_name = last_name;
        self.display_name = display_name;
        self
    }

    /// Given name for downstream account creation, falling back to the
    /// display name and then the email's local part.
    #[must_use]
    pub fn downstream_first_name(&self) -> &str {
        self.first_name
            .as_deref()
            .or(self.display_name.as_deref())
            .unwrap_or_else(|| self.email.split('@').next().unwrap_or(&self.email))
    }
}

/// Credentials for logging an identity into the downstream application.
#[derive(Clone, PartialEq, Eq)]
pub struct DownstreamCredentials {
    /// Downstream login name.
    pub email: String,
    /// One-time password set during provisioning.
    pub password: String,
}

impl fmt::Debug for DownstreamCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DownstreamCredentials")
            .field("email", &self.email)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Redeems an authorization code at the identity provider.
#[async_trait]
pub trait CodeExchanger: Send + Sync {
    /// Exchanges `code` and returns the verified identity.
    async fn exchange(&self, code: &str) -> Result<ResolvedIdentity, Report<CollaboratorError>>;
}

/// Manages the downstream account behind an identity.
#[async_trait]
pub trait AccountProvisioner: Send + Sync {
    /// Provisions `identity` and returns credentials valid for one login.
    async fn provision(
        &self,
        identity: &ResolvedIdentity,
    ) -> Result<DownstreamCredentials, Report<CollaboratorError>>;

    /// Invalidates every downstream session of `identity`.
    ///
    /// Returns `false` when no downstream account exists.
    async fn invalidate_sessions(&self, identity: &str) -> Result<bool, Report<CollaboratorError>>;
}

/// Logs into the downstream application.
#[async_trait]
pub trait DownstreamLogin: Send + Sync {
    /// Logs in with `credentials`.
    ///
    /// `Ok(None)` means the login succeeded but yielded no usable session
    /// token; the caller falls back to a browser-side form login.
    async fn login(
        &self,
        credentials: &DownstreamCredentials,
    ) -> Result<Option<DownstreamToken>, Report<CollaboratorError>>;
}
