//! Error types for the coordination crate.
//!
//! Errors are designed for layered context using rootcause:
//! - `CoordinationError`: Failures of the coordination stores themselves
//! - `CollaboratorError`: Failures reported by the external collaborators
//!   (code exchange, account provisioning, downstream login)
//! - `InvalidConfig`: A tunable outside its usable range

use std::fmt;

/// Errors from the coordination stores.
///
/// None of these are retried internally. The orchestrator maps them onto
/// [`FailureKind`](crate::orchestrator::FailureKind).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoordinationError {
    /// CSRF state token is unknown, expired, or already consumed.
    InvalidState { state_id: String },
    /// Authorization code has already been redeemed.
    CodeAlreadyRedeemed { fingerprint: String },
    /// Timed out waiting for another holder of a lock.
    LockTimeout { resource: String, timeout_ms: u64 },
    /// Session ID is unknown (usually already swept).
    SessionNotFound { session_id: String },
}

impl CoordinationError {
    /// Builds a [`LockTimeout`](Self::LockTimeout) for a wait of `timeout`.
    pub(crate) fn lock_timeout(resource: String, timeout: std::time::Duration) -> Self {
        Self::LockTimeout {
            resource,
            timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
        }
    }
}

impl fmt::Display for CoordinationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidState { state_id } => {
                write!(f, "invalid or expired state: {state_id}")
            }
            Self::CodeAlreadyRedeemed { fingerprint } => {
                write!(f, "authorization code already redeemed: {fingerprint}")
            }
            Self::LockTimeout {
                resource,
                timeout_ms,
            } => {
                write!(f, "timed out after {timeout_ms}ms waiting for {resource}")
            }
            Self::SessionNotFound { session_id } => {
                write!(f, "session not found: {session_id}")
            }
        }
    }
}

impl std::error::Error for CoordinationError {}

/// A configuration value outside its usable range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvalidConfig {
    /// Name of the offending field.
    pub field: &'static str,
    /// What the field must satisfy.
    pub requirement: &'static str,
}

impl fmt::Display for InvalidConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid coordination setting {}: {}", self.field, self.requirement)
    }
}

impl std::error::Error for InvalidConfig {}

/// Errors reported by external collaborators.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CollaboratorError {
    /// Token exchange with the identity provider failed.
    CodeExchange { reason: String },
    /// Verified claims lack a usable identity.
    MissingIdentity { claim: String },
    /// Downstream account provisioning failed.
    Provisioning { reason: String },
    /// Downstream login request failed.
    DownstreamLogin { status: Option<u16>, reason: String },
    /// Downstream sessions could not be invalidated.
    Revocation { reason: String },
}

impl fmt::Display for CollaboratorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CodeExchange { reason } => {
                write!(f, "code exchange failed: {reason}")
            }
            Self::MissingIdentity { claim } => {
                write!(f, "identity claim missing: {claim}")
            }
            Self::Provisioning { reason } => {
                write!(f, "account provisioning failed: {reason}")
            }
            Self::DownstreamLogin { status, reason } => match status {
                Some(status) => write!(f, "downstream login failed ({status}): {reason}"),
                None => write!(f, "downstream login failed: {reason}"),
            },
            Self::Revocation { reason } => {
                write!(f, "downstream session revocation failed: {reason}")
            }
        }
    }
}

impl std::error::Error for CollaboratorError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_state_display() {
        let err = CoordinationError::InvalidState {
            state_id: "st_123".to_string(),
        };
        assert!(err.to_string().contains("invalid or expired state"));
        assert!(err.to_string().contains("st_123"));
    }

    #[test]
    fn lock_timeout_display_names_resource() {
        let err = CoordinationError::lock_timeout(
            "code abcd".to_string(),
            std::time::Duration::from_secs(30),
        );
        assert_eq!(
            err,
            CoordinationError::LockTimeout {
                resource: "code abcd".to_string(),
                timeout_ms: 30_000,
            }
        );
        assert_eq!(err.to_string(), "timed out after 30000ms waiting for code abcd");
    }

    #[test]
    fn invalid_config_display() {
        let err = InvalidConfig {
            field: "sweep_interval_seconds",
            requirement: "must be at least 1",
        };
        assert_eq!(
            err.to_string(),
            "invalid coordination setting sweep_interval_seconds: must be at least 1"
        );
    }

    #[test]
    fn downstream_login_display_with_status() {
        let err = CollaboratorError::DownstreamLogin {
            status: Some(401),
            reason: "wrong password".to_string(),
        };
        assert!(err.to_string().contains("401"));
        assert!(err.to_string().contains("wrong password"));
    }
}
