//! CSRF state issuance and single-use validation.
//!
//! A login request is given an opaque [`StateId`] that travels through the
//! identity provider as the OAuth `state` parameter. The callback presents it
//! back and [`StateRegistry::validate`] consumes it. Lookup, expiry check and
//! consumption happen under one lock, so two concurrent validations of the
//! same token can never both succeed.

use chrono::{DateTime, Duration, Utc};
use sso_relay_core::{Clock, CorrelationId, StateId};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::error::CoordinationError;

/// A CSRF state issued for one login attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CsrfState {
    /// The opaque token.
    pub id: StateId,
    /// Client address seen when the login started.
    pub origin_ip: String,
    /// Client user agent seen when the login started.
    pub user_agent: String,
    /// Where the identity provider was told to send the user back.
    pub callback_url: String,
    /// Correlates log lines across login and callback.
    pub correlation_id: CorrelationId,
    /// When the state was issued.
    pub created_at: DateTime<Utc>,
    /// Whether a validation has already succeeded.
    pub consumed: bool,
}

impl CsrfState {
    fn age(&self, now: DateTime<Utc>) -> Duration {
        now - self.created_at
    }
}

/// Registry of outstanding CSRF states.
#[derive(Debug)]
pub struct StateRegistry {
    ttl: Duration,
    clock: Arc<dyn Clock>,
    states: Mutex<HashMap<StateId, CsrfState>>,
}

impl StateRegistry {
    /// Creates an empty registry whose states live for `ttl`.
    #[must_use]
    pub fn new(ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            ttl,
            clock,
            states: Mutex::new(HashMap::new()),
        }
    }

    fn states(&self) -> MutexGuard<'_, HashMap<StateId, CsrfState>> {
        self.states.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Issues a new state for a login initiated from `origin_ip`.
    pub fn issue(
        &self,
        origin_ip: &str,
        user_agent: &str,
        callback_url: &str,
        correlation_id: CorrelationId,
    ) -> StateId {
        let id = StateId::new();
        let state = CsrfState {
            id,
            origin_ip: origin_ip.to_string(),
            user_agent: user_agent.to_string(),
            callback_url: callback_url.to_string(),
            correlation_id,
            created_at: self.clock.now(),
            consumed: false,
        };
        self.states().insert(id, state);

        tracing::info!(
            state_id = %id,
            correlation_id = %correlation_id,
            origin_ip,
            callback_url,
            "OAuth state issued"
        );
        id
    }

    /// Validates and consumes a state presented on callback.
    ///
    /// Fails when the token is unknown, already consumed, or older than the
    /// TTL. A differing origin IP or user agent is logged but tolerated.
    pub fn validate(
        &self,
        state_id: &str,
        origin_ip: &str,
        user_agent: &str,
    ) -> Result<CsrfState, CoordinationError> {
        let invalid = || CoordinationError::InvalidState {
            state_id: state_id.to_string(),
        };

        let Ok(id) = state_id.parse::<StateId>() else {
            tracing::warn!(state_id, "Malformed OAuth state");
            return Err(invalid());
        };

        let now = self.clock.now();
        let mut states = self.states();

        let Some(state) = states.get_mut(&id) else {
            tracing::warn!(
                state_id,
                outstanding_states = states.len(),
                "Unknown OAuth state"
            );
            return Err(invalid());
        };

        let age = state.age(now);
        if age > self.ttl {
            tracing::warn!(
                state_id,
                age_seconds = age.num_seconds(),
                ttl_seconds = self.ttl.num_seconds(),
                "Expired OAuth state"
            );
            states.remove(&id);
            return Err(invalid());
        }

        if state.consumed {
            tracing::warn!(
                state_id,
                correlation_id = %state.correlation_id,
                "OAuth state already consumed"
            );
            return Err(invalid());
        }

        if state.origin_ip != origin_ip {
            tracing::warn!(
                state_id,
                expected_ip = %state.origin_ip,
                actual_ip = origin_ip,
                "OAuth state IP mismatch, continuing"
            );
        }
        if state.user_agent != user_agent {
            tracing::debug!(state_id, "OAuth state user agent changed");
        }

        state.consumed = true;

        tracing::info!(
            state_id,
            correlation_id = %state.correlation_id,
            age_ms = age.num_milliseconds(),
            "OAuth state validated"
        );
        Ok(state.clone())
    }

    /// Removes every state older than the TTL, returning how many were removed.
    pub fn sweep_expired(&self) -> usize {
        let now = self.clock.now();
        let mut states = self.states();
        let before = states.len();
        states.retain(|_, state| state.age(now) <= self.ttl);
        let removed = before - states.len();

        if removed > 0 {
            tracing::info!(
                expired_count = removed,
                remaining_count = states.len(),
                "Cleaned up expired OAuth states"
            );
        }
        removed
    }

    /// Number of states currently held, consumed or not.
    #[must_use]
    pub fn len(&self) -> usize {
        self.states().len()
    }

    /// Returns true if no states are held.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.states().is_empty()
    }
}
