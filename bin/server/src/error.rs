//! Startup error types for the server.
//!
//! Request handling never fails outward: callback failures become redirects.
//! These errors only cover bringing the process up and shutting it down.

use std::fmt;

/// Errors that stop the server.
#[derive(Debug)]
pub enum ServerError {
    /// Configuration is missing or invalid.
    Config { details: String },
    /// The downstream database could not be reached.
    Database { details: String },
    /// The identity provider could not be discovered.
    Oidc { details: String },
    /// An HTTP client could not be built.
    HttpClient { details: String },
    /// The listener could not bind or the server failed.
    Serve { details: String },
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config { details } => write!(f, "configuration error: {}", details),
            Self::Database { details } => write!(f, "database error: {}", details),
            Self::Oidc { details } => write!(f, "OIDC setup failed: {}", details),
            Self::HttpClient { details } => {
                write!(f, "failed to create HTTP client: {}", details)
            }
            Self::Serve { details } => write!(f, "server error: {}", details),
        }
    }
}

impl std::error::Error for ServerError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_details() {
        let err = ServerError::Config {
            details: "missing field `oidc`".to_string(),
        };
        assert_eq!(err.to_string(), "configuration error: missing field `oidc`");
    }
}
