//! The callback decision procedure.
//!
//! A callback moves through
//! `ReceivedCallback → StateValidated → CodeAdmitted → IdentityResolved →
//! SessionDecided → Completed`, and may leave at any step for a terminal
//! safe failure. Nothing here returns an error to the HTTP layer: every
//! failure becomes a [`SafeFailure`] the route turns into a redirect.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use sso_relay_core::{Clock, CorrelationId, SessionId, StateId};

use crate::collaborator::{
    AccountProvisioner, CodeExchanger, DownstreamCredentials, DownstreamLogin, ResolvedIdentity,
};
use crate::error::CoordinationError;
use crate::redemption::{AdmissionOutcome, Fingerprint, RedemptionCoordinator};
use crate::session::{DownstreamToken, SessionDecision, SessionStore};
use crate::state::StateRegistry;
use crate::stores::CoordinationStores;

/// An inbound identity-provider callback.
#[derive(Debug, Clone)]
pub struct CallbackRequest {
    /// The authorization code.
    pub code: String,
    /// The OAuth `state` parameter.
    pub state: String,
    /// Client address of the callback request.
    pub origin_ip: String,
    /// Client user agent of the callback request.
    pub user_agent: String,
}

/// Steps of the callback state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackStage {
    ReceivedCallback,
    StateValidated,
    CodeAdmitted,
    IdentityResolved,
    SessionDecided,
    Completed,
}

/// Why a callback ended in a safe failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// State token unknown, expired, or consumed.
    InvalidState,
    /// Code already redeemed.
    CodeAlreadyRedeemed,
    /// Gave up waiting for a concurrent callback with the same code.
    LockTimeout,
    /// Code exchange or identity extraction failed.
    IdentityResolution,
    /// Downstream account could not be provisioned.
    Provisioning,
}

impl FailureKind {
    /// Stable name for logs.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidState => "invalid_state",
            Self::CodeAlreadyRedeemed => "code_already_redeemed",
            Self::LockTimeout => "lock_timeout",
            Self::IdentityResolution => "identity_resolution",
            Self::Provisioning => "provisioning",
        }
    }
}

impl From<&CoordinationError> for FailureKind {
    fn from(error: &CoordinationError) -> Self {
        match error {
            CoordinationError::InvalidState { .. } => Self::InvalidState,
            CoordinationError::CodeAlreadyRedeemed { .. } => Self::CodeAlreadyRedeemed,
            CoordinationError::LockTimeout { .. } => Self::LockTimeout,
            CoordinationError::SessionNotFound { .. } => Self::Provisioning,
        }
    }
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal failure of a callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SafeFailure {
    /// What went wrong.
    pub kind: FailureKind,
    /// The last stage the callback reached.
    pub stage: CallbackStage,
    /// Correlation ID, once the state was validated.
    pub correlation_id: Option<CorrelationId>,
}

impl SafeFailure {
    /// Message suitable for showing to the user.
    #[must_use]
    pub fn flash_message(&self) -> &'static str {
        match self.kind {
            FailureKind::InvalidState | FailureKind::CodeAlreadyRedeemed => {
                "Your login link has expired. Please sign in again."
            }
            FailureKind::LockTimeout => "Your login is still being processed. Please try again.",
            FailureKind::IdentityResolution => "We could not verify your identity.",
            FailureKind::Provisioning => "We could not prepare your workspace. Please try again.",
        }
    }

    /// Returns true if the user may simply retry.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind,
            FailureKind::LockTimeout | FailureKind::IdentityResolution | FailureKind::Provisioning
        )
    }
}

/// How the browser is handed over to the downstream application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Handoff {
    /// Set the downstream session cookie and redirect.
    Cookie { token: DownstreamToken },
    /// Let the browser submit a login form with one-time credentials.
    FormLogin { credentials: DownstreamCredentials },
}

/// A successfully completed callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedLogin {
    /// The verified identity.
    pub identity: String,
    /// The local session used.
    pub session_id: SessionId,
    /// How to hand the browser over.
    pub handoff: Handoff,
    /// Whether a very recent session was reused without a downstream login.
    pub reused: bool,
    /// Correlation ID from the login that issued the state.
    pub correlation_id: CorrelationId,
    /// Callback URL recorded when the state was issued.
    pub callback_url: String,
}

/// Result of [`CallbackOrchestrator::handle`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallbackOutcome {
    Completed(CompletedLogin),
    SafeFailure(SafeFailure),
}

/// What happened to the downstream account on logout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownstreamRevocation {
    /// Existing downstream sessions were invalidated.
    Revoked,
    /// No downstream account exists for the identity.
    NoAccount,
    /// The downstream store could not be updated.
    Failed,
}

impl DownstreamRevocation {
    /// Stable name for logs and webhook responses.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Revoked => "revoked",
            Self::NoAccount => "no_account",
            Self::Failed => "failed",
        }
    }
}

/// Result of [`CallbackOrchestrator::logout`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogoutOutcome {
    /// Whether a local session record was removed.
    pub session_removed: bool,
    /// Downstream side of the logout.
    pub downstream: DownstreamRevocation,
}

/// A freshly initiated login.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoginStart {
    /// Value for the OAuth `state` parameter.
    pub state_id: StateId,
    /// Correlation ID for this login attempt.
    pub correlation_id: CorrelationId,
}

/// Composes the coordination stores and collaborators into one procedure.
pub struct CallbackOrchestrator {
    states: Arc<StateRegistry>,
    redemptions: RedemptionCoordinator,
    sessions: Arc<SessionStore>,
    exchanger: Arc<dyn CodeExchanger>,
    provisioner: Arc<dyn AccountProvisioner>,
    downstream: Arc<dyn DownstreamLogin>,
    admission_timeout: Duration,
    clock: Arc<dyn Clock>,
}

impl CallbackOrchestrator {
    /// Creates an orchestrator over shared stores.
    #[must_use]
    pub fn new(
        stores: &CoordinationStores,
        exchanger: Arc<dyn CodeExchanger>,
        provisioner: Arc<dyn AccountProvisioner>,
        downstream: Arc<dyn DownstreamLogin>,
        admission_timeout: Duration,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            states: Arc::clone(&stores.states),
            redemptions: stores.redemptions.clone(),
            sessions: Arc::clone(&stores.sessions),
            exchanger,
            provisioner,
            downstream,
            admission_timeout,
            clock,
        }
    }

    /// Issues the state for a new login.
    pub fn begin_login(&self, origin_ip: &str, user_agent: &str, callback_url: &str) -> LoginStart {
        let correlation_id = CorrelationId::new();
        let state_id = self
            .states
            .issue(origin_ip, user_agent, callback_url, correlation_id);
        LoginStart {
            state_id,
            correlation_id,
        }
    }

    /// Runs a callback to completion or safe failure.
    #[tracing::instrument(skip_all, fields(state_id = %request.state, origin_ip = %request.origin_ip))]
    pub async fn handle(&self, request: &CallbackRequest) -> CallbackOutcome {
        let state =
            match self
                .states
                .validate(&request.state, &request.origin_ip, &request.user_agent)
            {
                Ok(state) => state,
                Err(e) => return reject(&e, CallbackStage::ReceivedCallback, None),
            };
        let correlation_id = Some(state.correlation_id);

        let admission = match self
            .redemptions
            .try_admit(&request.code, self.admission_timeout)
            .await
        {
            AdmissionOutcome::Admitted(admission) => admission,
            AdmissionOutcome::AlreadyRedeemed => {
                let error = CoordinationError::CodeAlreadyRedeemed {
                    fingerprint: Fingerprint::of(&request.code).to_string(),
                };
                return reject(&error, CallbackStage::StateValidated, correlation_id);
            }
            AdmissionOutcome::TimedOut => {
                let error = CoordinationError::lock_timeout(
                    format!("code {}", Fingerprint::of(&request.code)),
                    self.admission_timeout,
                );
                return reject(&error, CallbackStage::StateValidated, correlation_id);
            }
        };

        let identity = match self.exchanger.exchange(&request.code).await {
            Ok(identity) => identity,
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    correlation_id = %state.correlation_id,
                    fingerprint = %admission.fingerprint(),
                    "Code exchange failed"
                );
                // Not consumed upstream, so a retry may be admitted.
                admission.release(false);
                return fail(
                    FailureKind::IdentityResolution,
                    CallbackStage::CodeAdmitted,
                    correlation_id,
                );
            }
        };
        tracing::info!(
            correlation_id = %state.correlation_id,
            identity = %identity.email,
            "Identity resolved"
        );

        // The provider has consumed the code; it is spent whatever happens next.
        let outcome = self.establish_session(&identity).await;
        admission.release(true);

        match outcome {
            Ok((session_id, handoff, reused)) => {
                tracing::info!(
                    correlation_id = %state.correlation_id,
                    identity = %identity.email,
                    session_id = %session_id,
                    reused,
                    cookie_handoff = matches!(handoff, Handoff::Cookie { .. }),
                    "Callback completed"
                );
                CallbackOutcome::Completed(CompletedLogin {
                    identity: identity.email,
                    session_id,
                    handoff,
                    reused,
                    correlation_id: state.correlation_id,
                    callback_url: state.callback_url,
                })
            }
            Err((kind, stage)) => fail(kind, stage, correlation_id),
        }
    }

    /// Handles an identity-provider logout for `identity`.
    ///
    /// Removes the local session record so the next callback cannot reuse
    /// it, then invalidates the identity's downstream sessions. Waits for any
    /// in-flight callback for the same identity to finish first.
    ///
    /// # Errors
    ///
    /// Returns [`CoordinationError::LockTimeout`] if an in-flight callback
    /// held the identity past the admission timeout.
    #[tracing::instrument(skip(self))]
    pub async fn logout(&self, identity: &str) -> Result<LogoutOutcome, CoordinationError> {
        let _held = self
            .sessions
            .lock_identity(identity, self.admission_timeout)
            .await?;

        let session_removed = self.sessions.remove(identity).is_some();
        let downstream = match self.provisioner.invalidate_sessions(identity).await {
            Ok(true) => DownstreamRevocation::Revoked,
            Ok(false) => DownstreamRevocation::NoAccount,
            Err(e) => {
                tracing::error!(error = %e, "Downstream session revocation failed");
                DownstreamRevocation::Failed
            }
        };

        tracing::info!(
            session_removed,
            downstream = downstream.as_str(),
            "Logout processed"
        );
        Ok(LogoutOutcome {
            session_removed,
            downstream,
        })
    }

    /// Decides reuse versus refresh and, when refreshing, logs in downstream.
    ///
    /// Runs under the identity's lock from the decision until the new token
    /// is attached. On failure returns the failure kind and last stage.
    async fn establish_session(
        &self,
        identity: &ResolvedIdentity,
    ) -> Result<(SessionId, Handoff, bool), (FailureKind, CallbackStage)> {
        let _held = self
            .sessions
            .lock_identity(&identity.email, self.admission_timeout)
            .await
            .map_err(|e| {
                tracing::warn!(error = %e, "Session lock unavailable");
                (FailureKind::from(&e), CallbackStage::IdentityResolved)
            })?;

        let decision = self.sessions.decide_reuse(&identity.email, self.clock.now());

        let session_id = match decision {
            SessionDecision::Reuse { session_id, token } => {
                return Ok((session_id, Handoff::Cookie { token }, true));
            }
            SessionDecision::Refresh { session_id, reason } => {
                tracing::info!(
                    identity = %identity.email,
                    session_id = %session_id,
                    reason = %reason,
                    "Refreshing downstream session"
                );
                session_id
            }
        };

        let credentials = self.provisioner.provision(identity).await.map_err(|e| {
            tracing::error!(error = %e, identity = %identity.email, "Provisioning failed");
            (FailureKind::Provisioning, CallbackStage::SessionDecided)
        })?;

        let token = match self.downstream.login(&credentials).await {
            Ok(token) => token,
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    identity = %identity.email,
                    "Downstream login failed, falling back to form login"
                );
                None
            }
        };

        let Some(token) = token else {
            return Ok((session_id, Handoff::FormLogin { credentials }, false));
        };

        if let Err(e) = self
            .sessions
            .attach_downstream_token(&session_id, token.clone())
        {
            // The record was swept mid-flight; the token is still good for the browser.
            tracing::warn!(error = %e, identity = %identity.email, "Could not record downstream token");
        }
        Ok((session_id, Handoff::Cookie { token }, false))
    }
}

fn reject(
    error: &CoordinationError,
    stage: CallbackStage,
    correlation_id: Option<CorrelationId>,
) -> CallbackOutcome {
    tracing::warn!(error = %error, "Rejecting callback");
    fail(FailureKind::from(error), stage, correlation_id)
}

fn fail(
    kind: FailureKind,
    stage: CallbackStage,
    correlation_id: Option<CorrelationId>,
) -> CallbackOutcome {
    tracing::warn!(kind = %kind, stage = ?stage, "Callback ended in safe failure");
    CallbackOutcome::SafeFailure(SafeFailure {
        kind,
        stage,
        correlation_id,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CoordinationConfig;
    use crate::error::CollaboratorError;
    use async_trait::async_trait;
    use chrono::Duration as ChronoDuration;
    use rootcause::Report;
    use sso_relay_core::ManualClock;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    const ALICE: &str = "alice@example.com";
    const IP: &str = "1.2.3.4";
    const UA: &str = "Mozilla/5.0";

    #[derive(Default)]
    struct MockExchanger {
        calls: AtomicUsize,
        delay: Duration,
        fail: AtomicBool,
    }

    #[async_trait]
    impl CodeExchanger for MockExchanger {
        async fn exchange(
            &self,
            _code: &str,
        ) -> Result<ResolvedIdentity, Report<CollaboratorError>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if self.fail.load(Ordering::SeqCst) {
                return Err(CollaboratorError::CodeExchange {
                    reason: "connection reset".to_string(),
                }
                .into());
            }
            Ok(ResolvedIdentity::new(ALICE.to_string()))
        }
    }

    #[derive(Default)]
    struct MockProvisioner {
        calls: AtomicUsize,
        fail: AtomicBool,
        invalidations: AtomicUsize,
    }

    #[async_trait]
    impl AccountProvisioner for MockProvisioner {
        async fn provision(
            &self,
            identity: &ResolvedIdentity,
        ) -> Result<DownstreamCredentials, Report<CollaboratorError>> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail.load(Ordering::SeqCst) {
                return Err(CollaboratorError::Provisioning {
                    reason: "database unavailable".to_string(),
                }
                .into());
            }
            Ok(DownstreamCredentials {
                email: identity.email.clone(),
                password: format!("password-{call}"),
            })
        }

        async fn invalidate_sessions(
            &self,
            _identity: &str,
        ) -> Result<bool, Report<CollaboratorError>> {
            self.invalidations.fetch_add(1, Ordering::SeqCst);
            if self.fail.load(Ordering::SeqCst) {
                return Err(CollaboratorError::Revocation {
                    reason: "database unavailable".to_string(),
                }
                .into());
            }
            Ok(true)
        }
    }

    /// Downstream account whose password every provisioning rotates, and
    /// whose login only accepts the current password.
    #[derive(Default)]
    struct RotatingAccount {
        password: std::sync::Mutex<String>,
        rotations: AtomicUsize,
    }

    #[async_trait]
    impl AccountProvisioner for RotatingAccount {
        async fn provision(
            &self,
            identity: &ResolvedIdentity,
        ) -> Result<DownstreamCredentials, Report<CollaboratorError>> {
            let rotation = self.rotations.fetch_add(1, Ordering::SeqCst);
            let password = format!("rotated-{rotation}");
            *self.password.lock().expect("password lock") = password.clone();
            Ok(DownstreamCredentials {
                email: identity.email.clone(),
                password,
            })
        }

        async fn invalidate_sessions(
            &self,
            _identity: &str,
        ) -> Result<bool, Report<CollaboratorError>> {
            Ok(true)
        }
    }

    #[async_trait]
    impl DownstreamLogin for RotatingAccount {
        async fn login(
            &self,
            credentials: &DownstreamCredentials,
        ) -> Result<Option<DownstreamToken>, Report<CollaboratorError>> {
            tokio::time::sleep(Duration::from_millis(50)).await;
            let current = self.password.lock().expect("password lock").clone();
            if current != credentials.password {
                return Err(CollaboratorError::DownstreamLogin {
                    status: Some(401),
                    reason: "stale password".to_string(),
                }
                .into());
            }
            Ok(Some(DownstreamToken::new(format!(
                "cookie-for-{}",
                credentials.password
            ))))
        }
    }

    /// 0 = cookie, 1 = no cookie, 2 = error.
    #[derive(Default)]
    struct MockDownstream {
        mode: AtomicUsize,
    }

    #[async_trait]
    impl DownstreamLogin for MockDownstream {
        async fn login(
            &self,
            credentials: &DownstreamCredentials,
        ) -> Result<Option<DownstreamToken>, Report<CollaboratorError>> {
            match self.mode.load(Ordering::SeqCst) {
                0 => Ok(Some(DownstreamToken::new(format!(
                    "cookie-for-{}",
                    credentials.password
                )))),
                1 => Ok(None),
                _ => Err(CollaboratorError::DownstreamLogin {
                    status: Some(401),
                    reason: "wrong password".to_string(),
                }
                .into()),
            }
        }
    }

    struct Harness {
        orchestrator: CallbackOrchestrator,
        stores: CoordinationStores,
        clock: ManualClock,
        exchanger: Arc<MockExchanger>,
        provisioner: Arc<MockProvisioner>,
        downstream: Arc<MockDownstream>,
    }

    impl Harness {
        fn new() -> Self {
            Self::with_exchanger(MockExchanger::default())
        }

        fn with_exchanger(exchanger: MockExchanger) -> Self {
            let clock = ManualClock::starting_now();
            let shared: Arc<dyn Clock> = Arc::new(clock.clone());
            let stores =
                CoordinationStores::from_config(&CoordinationConfig::default(), Arc::clone(&shared));
            let exchanger = Arc::new(exchanger);
            let provisioner = Arc::new(MockProvisioner::default());
            let downstream = Arc::new(MockDownstream::default());
            let orchestrator = CallbackOrchestrator::new(
                &stores,
                Arc::clone(&exchanger) as Arc<dyn CodeExchanger>,
                Arc::clone(&provisioner) as Arc<dyn AccountProvisioner>,
                Arc::clone(&downstream) as Arc<dyn DownstreamLogin>,
                Duration::from_secs(5),
                shared,
            );
            Self {
                orchestrator,
                stores,
                clock,
                exchanger,
                provisioner,
                downstream,
            }
        }

        fn request(&self, code: &str) -> CallbackRequest {
            let start = self
                .orchestrator
                .begin_login(IP, UA, "https://relay.example.com/auth/callback");
            CallbackRequest {
                code: code.to_string(),
                state: start.state_id.to_string(),
                origin_ip: IP.to_string(),
                user_agent: UA.to_string(),
            }
        }
    }

    fn completed(outcome: CallbackOutcome) -> CompletedLogin {
        match outcome {
            CallbackOutcome::Completed(login) => login,
            CallbackOutcome::SafeFailure(failure) => panic!("expected completion, got {failure:?}"),
        }
    }

    fn failure(outcome: CallbackOutcome) -> SafeFailure {
        match outcome {
            CallbackOutcome::SafeFailure(failure) => failure,
            CallbackOutcome::Completed(login) => panic!("expected failure, got {login:?}"),
        }
    }

    #[tokio::test]
    async fn first_login_refreshes_and_hands_off_cookie() {
        let harness = Harness::new();
        let login = completed(harness.orchestrator.handle(&harness.request("code-1")).await);

        assert_eq!(login.identity, ALICE);
        assert!(!login.reused);
        assert_eq!(
            login.handoff,
            Handoff::Cookie {
                token: DownstreamToken::new("cookie-for-password-0".to_string())
            }
        );
        assert_eq!(login.callback_url, "https://relay.example.com/auth/callback");

        let record = harness.stores.sessions.get(ALICE).expect("session recorded");
        assert_eq!(record.session_id, login.session_id);
        assert!(record.is_persistent);
        assert!(harness.stores.redemptions.is_redeemed("code-1"));
    }

    #[tokio::test]
    async fn invalid_state_fails_before_exchange() {
        let harness = Harness::new();
        let mut request = harness.request("code-1");
        request.state = StateId::new().to_string();

        let failure = failure(harness.orchestrator.handle(&request).await);
        assert_eq!(failure.kind, FailureKind::InvalidState);
        assert_eq!(failure.stage, CallbackStage::ReceivedCallback);
        assert!(failure.correlation_id.is_none());
        assert_eq!(harness.exchanger.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn replayed_state_is_rejected() {
        let harness = Harness::new();
        let request = harness.request("code-1");
        completed(harness.orchestrator.handle(&request).await);

        let mut replay = request.clone();
        replay.code = "code-2".to_string();
        let failure = failure(harness.orchestrator.handle(&replay).await);
        assert_eq!(failure.kind, FailureKind::InvalidState);
    }

    #[tokio::test]
    async fn redeemed_code_is_rejected_with_fresh_state() {
        let harness = Harness::new();
        completed(harness.orchestrator.handle(&harness.request("code-1")).await);

        let failure = failure(harness.orchestrator.handle(&harness.request("code-1")).await);
        assert_eq!(failure.kind, FailureKind::CodeAlreadyRedeemed);
        assert!(!failure.is_retryable());
        assert_eq!(harness.exchanger.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exchange_failure_leaves_code_retryable() {
        let harness = Harness::new();
        harness.exchanger.fail.store(true, Ordering::SeqCst);

        let failure = failure(harness.orchestrator.handle(&harness.request("code-1")).await);
        assert_eq!(failure.kind, FailureKind::IdentityResolution);
        assert_eq!(failure.stage, CallbackStage::CodeAdmitted);
        assert!(!harness.stores.redemptions.is_redeemed("code-1"));

        harness.exchanger.fail.store(false, Ordering::SeqCst);
        completed(harness.orchestrator.handle(&harness.request("code-1")).await);
    }

    #[tokio::test]
    async fn provisioning_failure_spends_code() {
        let harness = Harness::new();
        harness.provisioner.fail.store(true, Ordering::SeqCst);

        let failure = failure(harness.orchestrator.handle(&harness.request("code-1")).await);
        assert_eq!(failure.kind, FailureKind::Provisioning);
        assert_eq!(failure.stage, CallbackStage::SessionDecided);
        assert!(failure.correlation_id.is_some());
        assert!(harness.stores.redemptions.is_redeemed("code-1"));
    }

    #[tokio::test]
    async fn missing_downstream_cookie_falls_back_to_form() {
        let harness = Harness::new();
        harness.downstream.mode.store(1, Ordering::SeqCst);

        let login = completed(harness.orchestrator.handle(&harness.request("code-1")).await);
        let Handoff::FormLogin { credentials } = login.handoff else {
            panic!("expected form handoff");
        };
        assert_eq!(credentials.email, ALICE);
        assert!(!harness.stores.sessions.get(ALICE).expect("record").is_persistent);
    }

    #[tokio::test]
    async fn downstream_error_falls_back_to_form() {
        let harness = Harness::new();
        harness.downstream.mode.store(2, Ordering::SeqCst);

        let login = completed(harness.orchestrator.handle(&harness.request("code-1")).await);
        assert!(matches!(login.handoff, Handoff::FormLogin { .. }));
    }

    #[tokio::test]
    async fn very_recent_session_is_reused() {
        let harness = Harness::new();
        let first = completed(harness.orchestrator.handle(&harness.request("code-1")).await);

        harness.clock.advance(ChronoDuration::seconds(20));
        let second = completed(harness.orchestrator.handle(&harness.request("code-2")).await);

        assert!(second.reused);
        assert_eq!(second.session_id, first.session_id);
        assert_eq!(second.handoff, first.handoff);
        assert_eq!(harness.provisioner.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn older_session_is_refreshed_in_place() {
        let harness = Harness::new();
        let first = completed(harness.orchestrator.handle(&harness.request("code-1")).await);

        harness.clock.advance(ChronoDuration::seconds(60));
        let second = completed(harness.orchestrator.handle(&harness.request("code-2")).await);

        assert!(!second.reused);
        assert_eq!(second.session_id, first.session_id);
        assert_eq!(
            second.handoff,
            Handoff::Cookie {
                token: DownstreamToken::new("cookie-for-password-1".to_string())
            }
        );
        assert_eq!(harness.stores.sessions.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_duplicate_callbacks_exchange_once() {
        let harness = Arc::new(Harness::with_exchanger(MockExchanger {
            delay: Duration::from_millis(200),
            ..MockExchanger::default()
        }));

        let tasks: Vec<_> = (0..4)
            .map(|_| {
                let harness = Arc::clone(&harness);
                let request = harness.request("ABC123");
                tokio::spawn(async move { harness.orchestrator.handle(&request).await })
            })
            .collect();

        let mut completions = 0;
        for task in tasks {
            match task.await.expect("task panicked") {
                CallbackOutcome::Completed(_) => completions += 1,
                CallbackOutcome::SafeFailure(failure) => {
                    assert_eq!(failure.kind, FailureKind::CodeAlreadyRedeemed);
                }
            }
        }
        assert_eq!(completions, 1);
        assert_eq!(harness.exchanger.calls.load(Ordering::SeqCst), 1);
        assert_eq!(harness.stores.redemptions.lock_count(), 0);
    }

    #[tokio::test]
    async fn concurrent_logins_for_one_identity_provision_once() {
        let shared: Arc<dyn Clock> = Arc::new(ManualClock::starting_now());
        let stores =
            CoordinationStores::from_config(&CoordinationConfig::default(), Arc::clone(&shared));
        let account = Arc::new(RotatingAccount::default());
        let orchestrator = CallbackOrchestrator::new(
            &stores,
            Arc::new(MockExchanger::default()),
            Arc::clone(&account) as Arc<dyn AccountProvisioner>,
            Arc::clone(&account) as Arc<dyn DownstreamLogin>,
            Duration::from_secs(5),
            shared,
        );
        let request = |code: &str| {
            let start = orchestrator.begin_login(IP, UA, "https://relay.example.com/auth/callback");
            CallbackRequest {
                code: code.to_string(),
                state: start.state_id.to_string(),
                origin_ip: IP.to_string(),
                user_agent: UA.to_string(),
            }
        };
        let (first, second) = (request("code-a"), request("code-b"));

        let (a, b) = tokio::join!(orchestrator.handle(&first), orchestrator.handle(&second));
        let (a, b) = (completed(a), completed(b));

        assert_eq!(account.rotations.load(Ordering::SeqCst), 1);
        assert_ne!(a.reused, b.reused);
        assert_eq!(a.session_id, b.session_id);
        let expected = Handoff::Cookie {
            token: DownstreamToken::new("cookie-for-rotated-0".to_string()),
        };
        assert_eq!(a.handoff, expected);
        assert_eq!(b.handoff, expected);
    }

    #[tokio::test]
    async fn logout_removes_session_and_forces_fresh_login() {
        let harness = Harness::new();
        let first = completed(harness.orchestrator.handle(&harness.request("code-1")).await);

        let outcome = harness.orchestrator.logout(ALICE).await.expect("logout");
        assert_eq!(
            outcome,
            LogoutOutcome {
                session_removed: true,
                downstream: DownstreamRevocation::Revoked,
            }
        );
        assert!(harness.stores.sessions.get(ALICE).is_none());
        assert_eq!(harness.provisioner.invalidations.load(Ordering::SeqCst), 1);

        // Well inside the reuse window, yet nothing is reused.
        harness.clock.advance(ChronoDuration::seconds(5));
        let second = completed(harness.orchestrator.handle(&harness.request("code-2")).await);
        assert!(!second.reused);
        assert_ne!(second.session_id, first.session_id);
        assert_eq!(harness.provisioner.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn logout_without_session_still_revokes_downstream() {
        let harness = Harness::new();
        let outcome = harness.orchestrator.logout(ALICE).await.expect("logout");
        assert!(!outcome.session_removed);
        assert_eq!(outcome.downstream, DownstreamRevocation::Revoked);
    }

    #[tokio::test]
    async fn failed_revocation_is_reported_after_local_removal() {
        let harness = Harness::new();
        completed(harness.orchestrator.handle(&harness.request("code-1")).await);
        harness.provisioner.fail.store(true, Ordering::SeqCst);

        let outcome = harness.orchestrator.logout(ALICE).await.expect("logout");
        assert!(outcome.session_removed);
        assert_eq!(outcome.downstream, DownstreamRevocation::Failed);
        assert_eq!(outcome.downstream.as_str(), "failed");
    }

    #[tokio::test]
    async fn logout_times_out_behind_held_identity() {
        let harness = Harness::new();
        let _held = harness
            .stores
            .sessions
            .lock_identity(ALICE, Duration::from_secs(1))
            .await
            .expect("lock");

        let orchestrator = CallbackOrchestrator::new(
            &harness.stores,
            Arc::clone(&harness.exchanger) as Arc<dyn CodeExchanger>,
            Arc::clone(&harness.provisioner) as Arc<dyn AccountProvisioner>,
            Arc::clone(&harness.downstream) as Arc<dyn DownstreamLogin>,
            Duration::from_millis(20),
            Arc::new(harness.clock.clone()),
        );
        let err = orchestrator.logout(ALICE).await.expect_err("identity held");
        assert!(matches!(err, CoordinationError::LockTimeout { .. }));
        assert_eq!(harness.provisioner.invalidations.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn store_errors_map_to_failure_kinds() {
        let timeout = CoordinationError::lock_timeout(
            "code abcd".to_string(),
            Duration::from_secs(30),
        );
        assert_eq!(FailureKind::from(&timeout), FailureKind::LockTimeout);
        let redeemed = CoordinationError::CodeAlreadyRedeemed {
            fingerprint: "abcd".to_string(),
        };
        assert_eq!(FailureKind::from(&redeemed), FailureKind::CodeAlreadyRedeemed);
        let state = CoordinationError::InvalidState {
            state_id: "st_1".to_string(),
        };
        assert_eq!(FailureKind::from(&state), FailureKind::InvalidState);
    }
}
