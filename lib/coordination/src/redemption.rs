//! One-time authorization code redemption.
//!
//! Each code is reduced to a [`Fingerprint`] and guarded by its own async
//! mutex. Duplicate callbacks for the same code queue on that mutex instead
//! of each calling the identity provider; whoever wins gets an [`Admission`]
//! and every later caller observes the redeemed mark once the winner
//! releases with success.
//!
//! Invariants:
//! - at most one live `Admission` per fingerprint;
//! - once a fingerprint is in the redeemed set it is never admitted again
//!   (until size-based eviction drops it);
//! - the redeemed set is always checked again after the mutex is acquired.

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use sso_relay_core::Clock;
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Hex characters kept from the SHA-256 digest.
const FINGERPRINT_LEN: usize = 16;

/// Fixed-length one-way digest of an authorization code.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Computes the fingerprint of `code`.
    #[must_use]
    pub fn of(code: &str) -> Self {
        let digest = Sha256::digest(code.as_bytes());
        let mut hex = format!("{digest:x}");
        hex.truncate(FINGERPRINT_LEN);
        Self(hex)
    }

    /// Returns the fingerprint as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Per-fingerprint exclusion slot.
type Slot = Arc<AsyncMutex<()>>;

/// Redeemed fingerprints in insertion order.
#[derive(Debug, Default)]
struct RedeemedSet {
    members: HashSet<Fingerprint>,
    order: VecDeque<Fingerprint>,
}

impl RedeemedSet {
    fn insert(&mut self, fingerprint: Fingerprint) {
        if self.members.insert(fingerprint.clone()) {
            self.order.push_back(fingerprint);
        }
    }

    fn contains(&self, fingerprint: &Fingerprint) -> bool {
        self.members.contains(fingerprint)
    }

    fn len(&self) -> usize {
        self.members.len()
    }

    fn evict_oldest(&mut self, count: usize) -> usize {
        let mut evicted = 0;
        while evicted < count {
            let Some(oldest) = self.order.pop_front() else {
                break;
            };
            self.members.remove(&oldest);
            evicted += 1;
        }
        evicted
    }
}

#[derive(Debug)]
struct Inner {
    clock: Arc<dyn Clock>,
    slots: Mutex<HashMap<Fingerprint, Slot>>,
    redeemed: Mutex<RedeemedSet>,
    high_water: usize,
    evict_count: usize,
}

impl Inner {
    fn slots(&self) -> MutexGuard<'_, HashMap<Fingerprint, Slot>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn redeemed(&self) -> MutexGuard<'_, RedeemedSet> {
        self.redeemed.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the slot for `fingerprint`, creating it if needed.
    fn slot(&self, fingerprint: &Fingerprint) -> Slot {
        Arc::clone(self.slots().entry(fingerprint.clone()).or_default())
    }

    /// Drops the slot if nobody holds or waits on it.
    ///
    /// Holders and waiters each own a clone of the slot, and clones are only
    /// taken under the map lock, so a strong count of one means idle.
    fn prune(&self, fingerprint: &Fingerprint) {
        let mut slots = self.slots();
        if slots
            .get(fingerprint)
            .is_some_and(|slot| Arc::strong_count(slot) == 1)
        {
            slots.remove(fingerprint);
        }
    }

    fn finish(
        &self,
        fingerprint: &Fingerprint,
        held_since: DateTime<Utc>,
        guard: OwnedMutexGuard<()>,
        mark_redeemed: bool,
    ) {
        // Mark before unlocking so a waiter's re-check cannot miss it.
        if mark_redeemed {
            self.redeemed().insert(fingerprint.clone());
        }

        let held_ms = (self.clock.now() - held_since).num_milliseconds();
        drop(guard);
        self.prune(fingerprint);

        tracing::info!(
            fingerprint = %fingerprint,
            marked_redeemed = mark_redeemed,
            held_ms,
            "Redemption lock released"
        );
    }
}

/// Result of an admission attempt.
#[derive(Debug)]
pub enum AdmissionOutcome {
    /// The caller holds exclusive rights to redeem the code.
    Admitted(Admission),
    /// The code was already redeemed, possibly while this caller waited.
    AlreadyRedeemed,
    /// Another holder kept the code past the timeout.
    TimedOut,
}

/// Exclusive right to redeem one authorization code.
///
/// Release it with [`Admission::release`]. Dropping it without releasing
/// (an early return, a panic, a cancelled task) releases the lock and leaves
/// the code eligible for another attempt.
pub struct Admission {
    fingerprint: Fingerprint,
    held_since: DateTime<Utc>,
    guard: Option<OwnedMutexGuard<()>>,
    inner: Arc<Inner>,
}

impl Admission {
    /// Fingerprint of the admitted code.
    #[must_use]
    pub fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }

    /// Releases the lock.
    ///
    /// With `mark_redeemed` the code becomes permanently unredeemable;
    /// without it a later attempt may be admitted.
    pub fn release(mut self, mark_redeemed: bool) {
        if let Some(guard) = self.guard.take() {
            self.inner
                .finish(&self.fingerprint, self.held_since, guard, mark_redeemed);
        }
    }
}

impl fmt::Debug for Admission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Admission")
            .field("fingerprint", &self.fingerprint)
            .field("held_since", &self.held_since)
            .field("released", &self.guard.is_none())
            .finish()
    }
}

impl Drop for Admission {
    fn drop(&mut self) {
        if let Some(guard) = self.guard.take() {
            tracing::warn!(
                fingerprint = %self.fingerprint,
                "Admission dropped without release, releasing as not redeemed"
            );
            self.inner
                .finish(&self.fingerprint, self.held_since, guard, false);
        }
    }
}

/// Coordinates one-time redemption of authorization codes.
///
/// Cheap to clone; clones share state.
#[derive(Debug, Clone)]
pub struct RedemptionCoordinator {
    inner: Arc<Inner>,
}

impl RedemptionCoordinator {
    /// Creates a coordinator whose redeemed set is trimmed by `evict_count`
    /// entries whenever it grows beyond `high_water`.
    #[must_use]
    pub fn new(high_water: usize, evict_count: usize, clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Arc::new(Inner {
                clock,
                slots: Mutex::new(HashMap::new()),
                redeemed: Mutex::new(RedeemedSet::default()),
                high_water,
                evict_count,
            }),
        }
    }

    /// Tries to win exclusive rights to redeem `code`, waiting up to `timeout`.
    ///
    /// Dropping the returned future while it waits abandons the wait without
    /// acquiring the lock.
    pub async fn try_admit(&self, code: &str, timeout: Duration) -> AdmissionOutcome {
        let fingerprint = Fingerprint::of(code);

        if self.inner.redeemed().contains(&fingerprint) {
            tracing::warn!(fingerprint = %fingerprint, "Code already redeemed");
            return AdmissionOutcome::AlreadyRedeemed;
        }

        let slot = self.inner.slot(&fingerprint);
        let acquired = tokio::time::timeout(timeout, slot.lock_owned()).await;
        let guard = match acquired {
            Ok(guard) => guard,
            Err(_) => {
                self.inner.prune(&fingerprint);
                tracing::error!(
                    fingerprint = %fingerprint,
                    timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                    "Timed out waiting for redemption lock"
                );
                return AdmissionOutcome::TimedOut;
            }
        };

        if self.inner.redeemed().contains(&fingerprint) {
            drop(guard);
            self.inner.prune(&fingerprint);
            tracing::warn!(
                fingerprint = %fingerprint,
                "Code redeemed while waiting for lock"
            );
            return AdmissionOutcome::AlreadyRedeemed;
        }

        let held_since = self.inner.clock.now();

        tracing::info!(fingerprint = %fingerprint, "Redemption lock acquired");
        AdmissionOutcome::Admitted(Admission {
            fingerprint,
            held_since,
            guard: Some(guard),
            inner: Arc::clone(&self.inner),
        })
    }

    /// Releases an admission obtained from this coordinator.
    ///
    /// Releasing an admission that belongs to a different coordinator is a
    /// programming error: it asserts in debug builds and otherwise falls back
    /// to releasing it, unmarked, on its own coordinator.
    pub fn release(&self, admission: Admission, mark_redeemed: bool) {
        let own = Arc::ptr_eq(&self.inner, &admission.inner);
        debug_assert!(own, "admission released on a foreign coordinator");
        if !own {
            tracing::error!(
                fingerprint = %admission.fingerprint,
                "Admission released on a foreign coordinator"
            );
            return;
        }
        admission.release(mark_redeemed);
    }

    /// Returns true if `code` has been redeemed.
    #[must_use]
    pub fn is_redeemed(&self, code: &str) -> bool {
        self.inner.redeemed().contains(&Fingerprint::of(code))
    }

    /// Evicts the oldest redeemed fingerprints once the set exceeds its
    /// high-water mark. Returns how many were evicted.
    ///
    /// Eviction is a memory safety valve only; the identity provider rejects
    /// genuinely reused codes on its own.
    pub fn evict_redeemed(&self) -> usize {
        let mut redeemed = self.inner.redeemed();
        if redeemed.len() <= self.inner.high_water {
            return 0;
        }
        let evicted = redeemed.evict_oldest(self.inner.evict_count);
        tracing::info!(
            removed_count = evicted,
            remaining_count = redeemed.len(),
            "Evicted redeemed codes"
        );
        evicted
    }

    /// Drops lock slots left behind by abandoned waits.
    pub fn sweep_idle_locks(&self) -> usize {
        let mut slots = self.inner.slots();
        let before = slots.len();
        slots.retain(|_, slot| Arc::strong_count(slot) > 1);
        before - slots.len()
    }

    #[cfg(test)]
    pub(crate) fn redeemed_count(&self) -> usize {
        self.inner.redeemed().len()
    }

    #[cfg(test)]
    pub(crate) fn lock_count(&self) -> usize {
        self.inner.slots().len()
    }
}
