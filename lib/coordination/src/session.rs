//! Local session records and the reuse-or-refresh decision.
//!
//! The store keeps at most one record per identity. A record becomes
//! persistent once a downstream token is attached, and from then on a new
//! callback for the same identity updates it in place rather than replacing
//! it. [`SessionStore::decide_reuse`] is the freshness policy: a persistent
//! record younger than the reuse window is reused as-is, anything else must
//! log in downstream again.
//!
//! Callers that decide, log in downstream, and attach a token hold the
//! identity's [`IdentityGuard`] across all three steps, so two logins for
//! the same identity never rotate its downstream credentials concurrently.

use chrono::{DateTime, Duration, Utc};
use sso_relay_core::{Clock, SessionId};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::error::CoordinationError;

/// Opaque downstream session credential (for n8n, the auth cookie value).
///
/// Never printed by `Debug`.
#[derive(Clone, PartialEq, Eq)]
pub struct DownstreamToken(String);

impl DownstreamToken {
    /// Wraps a token value.
    #[must_use]
    pub fn new(value: String) -> Self {
        Self(value)
    }

    /// Returns the raw token value.
    #[must_use]
    pub fn expose(&self) -> &str {
        &self.0
    }

    /// Length of the token, for logging.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns true for an empty token.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Debug for DownstreamToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DownstreamToken(<{} bytes>)", self.0.len())
    }
}

impl From<String> for DownstreamToken {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// A local session for one identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRecord {
    /// Opaque session identifier.
    pub session_id: SessionId,
    /// The identity the record belongs to (verified email).
    pub identity: String,
    /// When the record was created.
    pub created_at: DateTime<Utc>,
    /// Downstream credential, once a downstream login succeeded.
    pub downstream_token: Option<DownstreamToken>,
    /// Set together with the first attached token.
    pub is_persistent: bool,
}

impl SessionRecord {
    fn new(identity: &str, now: DateTime<Utc>) -> Self {
        Self {
            session_id: SessionId::new(),
            identity: identity.to_string(),
            created_at: now,
            downstream_token: None,
            is_persistent: false,
        }
    }

    /// Age of the record at `now`.
    #[must_use]
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        now - self.created_at
    }
}

/// Why a callback must perform a fresh downstream login.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshReason {
    /// No record existed; one was created.
    NoExistingSession,
    /// The record is at least as old as the reuse window.
    SessionTooOld,
    /// The record has no downstream token yet.
    NoDownstreamToken,
    /// The record has not been marked persistent.
    NotPersistent,
}

impl RefreshReason {
    /// Stable name for logs.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NoExistingSession => "no_existing_session",
            Self::SessionTooOld => "session_too_old",
            Self::NoDownstreamToken => "no_downstream_token",
            Self::NotPersistent => "not_persistent",
        }
    }
}

impl fmt::Display for RefreshReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of [`SessionStore::decide_reuse`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionDecision {
    /// Skip the downstream login and hand out the cached token.
    Reuse {
        session_id: SessionId,
        token: DownstreamToken,
    },
    /// Log in downstream, then attach the new token to `session_id`.
    Refresh {
        session_id: SessionId,
        reason: RefreshReason,
    },
}

impl SessionDecision {
    /// The session the caller should continue with.
    #[must_use]
    pub fn session_id(&self) -> SessionId {
        match self {
            Self::Reuse { session_id, .. } | Self::Refresh { session_id, .. } => *session_id,
        }
    }
}

#[derive(Debug, Default)]
struct Sessions {
    by_identity: HashMap<String, SessionRecord>,
    identity_by_id: HashMap<SessionId, String>,
}

impl Sessions {
    fn insert(&mut self, record: SessionRecord) -> SessionId {
        let session_id = record.session_id;
        self.identity_by_id
            .insert(session_id, record.identity.clone());
        if let Some(replaced) = self.by_identity.insert(record.identity.clone(), record) {
            self.identity_by_id.remove(&replaced.session_id);
        }
        session_id
    }

    fn get_by_id_mut(&mut self, session_id: &SessionId) -> Option<&mut SessionRecord> {
        let identity = self.identity_by_id.get(session_id)?;
        self.by_identity.get_mut(identity)
    }
}

type IdentitySlots = Arc<Mutex<HashMap<String, Arc<AsyncMutex<()>>>>>;

fn lock_slots(slots: &IdentitySlots) -> MutexGuard<'_, HashMap<String, Arc<AsyncMutex<()>>>> {
    slots.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Drops the identity's slot if nobody holds or waits on it.
fn prune_slot(slots: &IdentitySlots, identity: &str) {
    let mut slots = lock_slots(slots);
    if slots
        .get(identity)
        .is_some_and(|slot| Arc::strong_count(slot) == 1)
    {
        slots.remove(identity);
    }
}

/// Exclusive hold on one identity's session, released on drop.
pub struct IdentityGuard {
    identity: String,
    guard: Option<OwnedMutexGuard<()>>,
    slots: IdentitySlots,
}

impl IdentityGuard {
    /// The identity held.
    #[must_use]
    pub fn identity(&self) -> &str {
        &self.identity
    }
}

impl fmt::Debug for IdentityGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdentityGuard")
            .field("identity", &self.identity)
            .finish()
    }
}

impl Drop for IdentityGuard {
    fn drop(&mut self) {
        drop(self.guard.take());
        prune_slot(&self.slots, &self.identity);
    }
}

/// Store of local session records, one per identity.
#[derive(Debug)]
pub struct SessionStore {
    reuse_window: Duration,
    max_age: Duration,
    clock: Arc<dyn Clock>,
    sessions: Mutex<Sessions>,
    identity_slots: IdentitySlots,
}

impl SessionStore {
    /// Creates an empty store.
    ///
    /// `reuse_window` bounds [`decide_reuse`](Self::decide_reuse); `max_age`
    /// is the lifetime used by the janitor's sweep.
    #[must_use]
    pub fn new(reuse_window: Duration, max_age: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            reuse_window,
            max_age,
            clock,
            sessions: Mutex::new(Sessions::default()),
            identity_slots: Arc::default(),
        }
    }

    /// Waits up to `timeout` for exclusive use of `identity`'s session.
    ///
    /// Dropping the returned future while it waits abandons the wait.
    ///
    /// # Errors
    ///
    /// Returns [`CoordinationError::LockTimeout`] if another holder kept the
    /// identity past `timeout`.
    pub async fn lock_identity(
        &self,
        identity: &str,
        timeout: std::time::Duration,
    ) -> Result<IdentityGuard, CoordinationError> {
        let slot = Arc::clone(
            lock_slots(&self.identity_slots)
                .entry(identity.to_string())
                .or_default(),
        );

        match tokio::time::timeout(timeout, slot.lock_owned()).await {
            Ok(guard) => Ok(IdentityGuard {
                identity: identity.to_string(),
                guard: Some(guard),
                slots: Arc::clone(&self.identity_slots),
            }),
            Err(_) => {
                prune_slot(&self.identity_slots, identity);
                tracing::warn!(identity, "Timed out waiting for session lock");
                Err(CoordinationError::lock_timeout(
                    format!("session of {identity}"),
                    timeout,
                ))
            }
        }
    }

    /// Drops identity lock slots left behind by abandoned waits.
    pub fn sweep_idle_identity_locks(&self) -> usize {
        let mut slots = lock_slots(&self.identity_slots);
        let before = slots.len();
        slots.retain(|_, slot| Arc::strong_count(slot) > 1);
        before - slots.len()
    }

    fn sessions(&self) -> MutexGuard<'_, Sessions> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the record for `identity`, if any.
    #[must_use]
    pub fn get(&self, identity: &str) -> Option<SessionRecord> {
        self.sessions().by_identity.get(identity).cloned()
    }

    /// Returns the ID of a session for `identity`, creating one if needed.
    ///
    /// A persistent record is never replaced: its ID is returned unchanged.
    /// A non-persistent record is superseded by a fresh one.
    pub fn create_if_absent(&self, identity: &str) -> SessionId {
        let now = self.clock.now();
        let mut sessions = self.sessions();

        if let Some(existing) = sessions
            .by_identity
            .get(identity)
            .filter(|record| record.is_persistent)
        {
            tracing::warn!(
                identity,
                existing_session_id = %existing.session_id,
                "Identity already has a persistent session, keeping it"
            );
            return existing.session_id;
        }

        let session_id = sessions.insert(SessionRecord::new(identity, now));
        tracing::info!(identity, session_id = %session_id, "Session created");
        session_id
    }

    /// Removes the record for `identity`, returning it if there was one.
    pub fn remove(&self, identity: &str) -> Option<SessionRecord> {
        let mut sessions = self.sessions();
        let record = sessions.by_identity.remove(identity)?;
        sessions.identity_by_id.remove(&record.session_id);
        tracing::info!(identity, session_id = %record.session_id, "Session removed");
        Some(record)
    }

    /// Attaches a downstream token to a session and marks it persistent.
    pub fn attach_downstream_token(
        &self,
        session_id: &SessionId,
        token: DownstreamToken,
    ) -> Result<(), CoordinationError> {
        let mut sessions = self.sessions();
        let Some(record) = sessions.get_by_id_mut(session_id) else {
            tracing::warn!(session_id = %session_id, "Session not found for token update");
            return Err(CoordinationError::SessionNotFound {
                session_id: session_id.to_string(),
            });
        };

        let token_length = token.len();
        record.downstream_token = Some(token);
        record.is_persistent = true;

        tracing::info!(
            session_id = %session_id,
            identity = %record.identity,
            token_length,
            "Session downstream token updated"
        );
        Ok(())
    }

    /// Decides whether a callback for `identity` at `now` may reuse the
    /// existing downstream session.
    ///
    /// Reuse requires a persistent record with a token whose age is strictly
    /// below the reuse window: a record exactly as old as the window is
    /// refreshed. With no record, one is created under the same lock.
    pub fn decide_reuse(&self, identity: &str, now: DateTime<Utc>) -> SessionDecision {
        let mut sessions = self.sessions();

        let Some(record) = sessions.by_identity.get(identity) else {
            let session_id = sessions.insert(SessionRecord::new(identity, now));
            tracing::debug!(
                identity,
                session_id = %session_id,
                reason = %RefreshReason::NoExistingSession,
                "Session refresh required"
            );
            return SessionDecision::Refresh {
                session_id,
                reason: RefreshReason::NoExistingSession,
            };
        };

        let age = record.age(now);
        let reusable = match (&record.downstream_token, record.is_persistent) {
            _ if age >= self.reuse_window => Err(RefreshReason::SessionTooOld),
            (None, _) => Err(RefreshReason::NoDownstreamToken),
            (Some(_), false) => Err(RefreshReason::NotPersistent),
            (Some(token), true) => Ok(token.clone()),
        };

        match reusable {
            Ok(token) => {
                tracing::info!(
                    identity,
                    session_id = %record.session_id,
                    age_ms = age.num_milliseconds(),
                    "Reusing very recent persistent session"
                );
                SessionDecision::Reuse {
                    session_id: record.session_id,
                    token,
                }
            }
            Err(reason) => {
                tracing::debug!(
                    identity,
                    session_id = %record.session_id,
                    age_ms = age.num_milliseconds(),
                    has_token = record.downstream_token.is_some(),
                    is_persistent = record.is_persistent,
                    reason = %reason,
                    "Session refresh required"
                );
                SessionDecision::Refresh {
                    session_id: record.session_id,
                    reason,
                }
            }
        }
    }

    /// Removes every record older than `max_age`, persistent or not.
    pub fn sweep_expired(&self, max_age: Duration) -> usize {
        let now = self.clock.now();
        let mut sessions = self.sessions();
        let expired: Vec<(String, SessionId)> = sessions
            .by_identity
            .values()
            .filter(|record| record.age(now) > max_age)
            .map(|record| (record.identity.clone(), record.session_id))
            .collect();

        for (identity, session_id) in &expired {
            sessions.by_identity.remove(identity);
            sessions.identity_by_id.remove(session_id);
        }

        if !expired.is_empty() {
            tracing::info!(
                expired_count = expired.len(),
                remaining_count = sessions.by_identity.len(),
                "Cleaned up expired sessions"
            );
        }
        expired.len()
    }

    /// The lifetime the janitor sweeps with.
    #[must_use]
    pub fn max_age(&self) -> Duration {
        self.max_age
    }

    /// Number of records held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions().by_identity.len()
    }

    /// Returns true if no records are held.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions().by_identity.is_empty()
    }
}
