//! Callback coordination core for the sso-relay gateway.
//!
//! The gateway sits between a browser, an OpenID Connect provider and a
//! downstream application. This crate owns the process-wide state that makes
//! the callback safe under duplicates and retries:
//!
//! - [`StateRegistry`]: single-use CSRF state tokens with a TTL
//! - [`RedemptionCoordinator`]: at-most-one redemption per authorization code
//! - [`SessionStore`]: per-identity session records, the reuse decision, and
//!   the per-identity lock held while a session is refreshed
//! - [`Janitor`]: periodic expiry sweeps over all three
//!
//! [`CallbackOrchestrator`] composes them with the external collaborators
//! into the callback procedure and the logout procedure.

pub mod collaborator;
pub mod config;
pub mod error;
pub mod janitor;
pub mod orchestrator;
pub mod redemption;
pub mod session;
pub mod state;
pub mod stores;

pub use collaborator::{
    AccountProvisioner, CodeExchanger, DownstreamCredentials, DownstreamLogin, ResolvedIdentity,
};
pub use config::CoordinationConfig;
pub use error::{CollaboratorError, CoordinationError, InvalidConfig};
pub use janitor::{Janitor, JanitorHandle, JanitorReport, Sweep, SweepResult};
pub use orchestrator::{
    CallbackOrchestrator, CallbackOutcome, CallbackRequest, CallbackStage, CompletedLogin,
    DownstreamRevocation, FailureKind, Handoff, LoginStart, LogoutOutcome, SafeFailure,
};
pub use redemption::{Admission, AdmissionOutcome, Fingerprint, RedemptionCoordinator};
pub use session::{
    DownstreamToken, IdentityGuard, RefreshReason, SessionDecision, SessionRecord, SessionStore,
};
pub use state::{CsrfState, StateRegistry};
pub use stores::CoordinationStores;
