//! Periodic expiry sweeps over the coordination stores.
//!
//! The janitor runs each registered [`Sweep`] on a fixed interval. A sweep
//! that panics is caught and logged, and the remaining sweeps still run.

use chrono::{DateTime, Utc};
use sso_relay_core::Clock;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::redemption::RedemptionCoordinator;
use crate::session::SessionStore;
use crate::state::StateRegistry;

/// A store that can drop its stale entries.
pub trait Sweep: Send + Sync {
    /// Name used in logs and reports.
    fn name(&self) -> &'static str;

    /// Removes stale entries and returns how many were removed.
    fn sweep(&self) -> usize;
}

impl Sweep for StateRegistry {
    fn name(&self) -> &'static str {
        "oauth_states"
    }

    fn sweep(&self) -> usize {
        self.sweep_expired()
    }
}

impl Sweep for RedemptionCoordinator {
    fn name(&self) -> &'static str {
        "redeemed_codes"
    }

    fn sweep(&self) -> usize {
        self.evict_redeemed() + self.sweep_idle_locks()
    }
}

impl Sweep for SessionStore {
    fn name(&self) -> &'static str {
        "sessions"
    }

    fn sweep(&self) -> usize {
        self.sweep_expired(self.max_age()) + self.sweep_idle_identity_locks()
    }
}

/// Result of one sweep.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SweepResult {
    /// Name of the swept store.
    pub store: &'static str,
    /// Number of entries removed, or the panic message.
    pub outcome: Result<usize, String>,
}

/// Results of one janitor pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JanitorReport {
    /// One entry per registered store, in registration order.
    pub results: Vec<SweepResult>,
}

impl JanitorReport {
    /// Total entries removed across stores that swept successfully.
    #[must_use]
    pub fn removed(&self) -> usize {
        self.results
            .iter()
            .filter_map(|result| result.outcome.as_ref().ok())
            .sum()
    }

    /// Names of stores whose sweep failed.
    #[must_use]
    pub fn failures(&self) -> Vec<&'static str> {
        self.results
            .iter()
            .filter(|result| result.outcome.is_err())
            .map(|result| result.store)
            .collect()
    }
}

/// Shortest interval the loop will tick at.
const MIN_INTERVAL: Duration = Duration::from_secs(1);

/// Drives the periodic sweeps.
pub struct Janitor {
    stores: Vec<Arc<dyn Sweep>>,
    interval: Duration,
    clock: Arc<dyn Clock>,
    last_run: Mutex<Option<DateTime<Utc>>>,
}

impl Janitor {
    /// Creates a janitor with no stores.
    ///
    /// Intervals shorter than one second are raised to one second.
    #[must_use]
    pub fn new(interval: Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            stores: Vec::new(),
            interval: interval.max(MIN_INTERVAL),
            clock,
            last_run: Mutex::new(None),
        }
    }

    /// Creates a janitor over the three coordination stores.
    #[must_use]
    pub fn for_stores(
        interval: Duration,
        clock: Arc<dyn Clock>,
        states: Arc<StateRegistry>,
        redemptions: RedemptionCoordinator,
        sessions: Arc<SessionStore>,
    ) -> Self {
        Self::new(interval, clock)
            .with_store(states)
            .with_store(Arc::new(redemptions))
            .with_store(sessions)
    }

    /// Registers another store.
    #[must_use]
    pub fn with_store(mut self, store: Arc<dyn Sweep>) -> Self {
        self.stores.push(store);
        self
    }

    /// When the last pass finished.
    #[must_use]
    pub fn last_run(&self) -> Option<DateTime<Utc>> {
        *self.last_run.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Runs every sweep once.
    pub fn run_once(&self) -> JanitorReport {
        tracing::debug!("Starting OAuth data cleanup");

        let results = self
            .stores
            .iter()
            .map(|store| {
                let outcome = catch_unwind(AssertUnwindSafe(|| store.sweep()))
                    .map_err(|payload| panic_message(payload.as_ref()));
                if let Err(message) = &outcome {
                    tracing::error!(store = store.name(), error = %message, "Sweep failed");
                }
                SweepResult {
                    store: store.name(),
                    outcome,
                }
            })
            .collect();

        let report = JanitorReport { results };
        *self.last_run.lock().unwrap_or_else(PoisonError::into_inner) = Some(self.clock.now());

        tracing::debug!(
            removed = report.removed(),
            failed = report.failures().len(),
            "OAuth data cleanup completed"
        );
        report
    }

    /// Spawns the sweep loop on the tokio runtime.
    ///
    /// The first pass runs one interval after spawning.
    #[must_use]
    pub fn spawn(self: Arc<Self>) -> JanitorHandle {
        let (shutdown, mut stop) = oneshot::channel();
        let task = tokio::spawn(async move {
            let start = tokio::time::Instant::now() + self.interval;
            let mut interval = tokio::time::interval_at(start, self.interval);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        self.run_once();
                    }
                    _ = &mut stop => {
                        tracing::info!("Janitor stopped");
                        break;
                    }
                }
            }
        });
        JanitorHandle { shutdown, task }
    }
}

/// Handle to a running janitor loop.
pub struct JanitorHandle {
    shutdown: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl JanitorHandle {
    /// Stops the loop and waits for it to exit.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(());
        if let Err(e) = self.task.await {
            tracing::warn!(error = %e, "Janitor task did not exit cleanly");
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "sweep panicked".to_string())
}
