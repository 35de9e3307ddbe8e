//! Construction of the process-wide coordination stores.

use sso_relay_core::Clock;
use std::sync::Arc;

use crate::config::CoordinationConfig;
use crate::janitor::Janitor;
use crate::redemption::RedemptionCoordinator;
use crate::session::SessionStore;
use crate::state::StateRegistry;

/// The three coordination stores, built once at startup and shared by handle.
#[derive(Debug, Clone)]
pub struct CoordinationStores {
    /// CSRF state registry.
    pub states: Arc<StateRegistry>,
    /// Authorization code redemption coordinator.
    pub redemptions: RedemptionCoordinator,
    /// Local session records.
    pub sessions: Arc<SessionStore>,
}

impl CoordinationStores {
    /// Builds all stores from configuration.
    #[must_use]
    pub fn from_config(config: &CoordinationConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            states: Arc::new(StateRegistry::new(config.state_ttl(), Arc::clone(&clock))),
            redemptions: RedemptionCoordinator::new(
                config.redeemed_high_water,
                config.redeemed_evict_count,
                Arc::clone(&clock),
            ),
            sessions: Arc::new(SessionStore::new(
                config.reuse_window(),
                config.session_max_age(),
                clock,
            )),
        }
    }

    /// Builds a janitor sweeping these stores every `config.sweep_interval()`.
    #[must_use]
    pub fn janitor(&self, config: &CoordinationConfig, clock: Arc<dyn Clock>) -> Janitor {
        Janitor::for_stores(
            config.sweep_interval(),
            clock,
            Arc::clone(&self.states),
            self.redemptions.clone(),
            Arc::clone(&self.sessions),
        )
    }
}
