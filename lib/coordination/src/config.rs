//! Configuration for the coordination core.
//!
//! All values have defaults so an empty configuration source yields a
//! working single-instance setup.

use serde::Deserialize;

use crate::error::InvalidConfig;

/// Upper bound for every `*_seconds` setting: one year.
const MAX_SECONDS: u64 = 365 * 24 * 60 * 60;

/// Shortest janitor interval.
const MIN_SWEEP_INTERVAL: std::time::Duration = std::time::Duration::from_secs(1);

/// Tunables for the state, redemption, and session stores and the janitor.
#[derive(Debug, Clone, Deserialize)]
pub struct CoordinationConfig {
    /// How long an issued CSRF state stays valid, in seconds.
    #[serde(default = "default_state_ttl_seconds")]
    pub state_ttl_seconds: i64,

    /// How long a callback waits for another holder of the same code, in seconds.
    #[serde(default = "default_admission_timeout_seconds")]
    pub admission_timeout_seconds: u64,

    /// Age below which a persistent session's downstream token is reused, in seconds.
    #[serde(default = "default_reuse_window_seconds")]
    pub reuse_window_seconds: i64,

    /// Age after which session records are swept, in seconds.
    #[serde(default = "default_session_max_age_seconds")]
    pub session_max_age_seconds: i64,

    /// Redeemed-code count above which the janitor evicts.
    #[serde(default = "default_redeemed_high_water")]
    pub redeemed_high_water: usize,

    /// Number of oldest redeemed codes evicted per sweep once over the mark.
    #[serde(default = "default_redeemed_evict_count")]
    pub redeemed_evict_count: usize,

    /// Interval between janitor sweeps, in seconds.
    #[serde(default = "default_sweep_interval_seconds")]
    pub sweep_interval_seconds: u64,
}

fn default_state_ttl_seconds() -> i64 {
    600
}

fn default_admission_timeout_seconds() -> u64 {
    30
}

fn default_reuse_window_seconds() -> i64 {
    60
}

fn default_session_max_age_seconds() -> i64 {
    3600
}

fn default_redeemed_high_water() -> usize {
    10_000
}

fn default_redeemed_evict_count() -> usize {
    5_000
}

fn default_sweep_interval_seconds() -> u64 {
    300
}

impl Default for CoordinationConfig {
    fn default() -> Self {
        Self {
            state_ttl_seconds: default_state_ttl_seconds(),
            admission_timeout_seconds: default_admission_timeout_seconds(),
            reuse_window_seconds: default_reuse_window_seconds(),
            session_max_age_seconds: default_session_max_age_seconds(),
            redeemed_high_water: default_redeemed_high_water(),
            redeemed_evict_count: default_redeemed_evict_count(),
            sweep_interval_seconds: default_sweep_interval_seconds(),
        }
    }
}

impl CoordinationConfig {
    /// Checks every setting against its usable range.
    ///
    /// # Errors
    ///
    /// Returns the first setting that is out of range.
    pub fn validate(&self) -> Result<(), InvalidConfig> {
        let checks: [(&'static str, i128, i128); 6] = [
            ("state_ttl_seconds", self.state_ttl_seconds.into(), 1),
            (
                "admission_timeout_seconds",
                self.admission_timeout_seconds.into(),
                1,
            ),
            ("reuse_window_seconds", self.reuse_window_seconds.into(), 0),
            (
                "session_max_age_seconds",
                self.session_max_age_seconds.into(),
                1,
            ),
            ("sweep_interval_seconds", self.sweep_interval_seconds.into(), 1),
            (
                "redeemed_evict_count",
                i128::try_from(self.redeemed_evict_count).unwrap_or(i128::MAX),
                1,
            ),
        ];

        for (field, value, min) in checks {
            if value < min {
                return Err(InvalidConfig {
                    field,
                    requirement: if min == 0 {
                        "must not be negative"
                    } else {
                        "must be at least 1"
                    },
                });
            }
            if field.ends_with("_seconds") && value > i128::from(MAX_SECONDS) {
                return Err(InvalidConfig {
                    field,
                    requirement: "must not exceed one year",
                });
            }
        }
        Ok(())
    }

    /// CSRF state lifetime.
    #[must_use]
    pub fn state_ttl(&self) -> chrono::Duration {
        seconds(self.state_ttl_seconds)
    }

    /// Maximum wait for a code's admission lock.
    #[must_use]
    pub fn admission_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.admission_timeout_seconds.min(MAX_SECONDS))
    }

    /// Session reuse window.
    #[must_use]
    pub fn reuse_window(&self) -> chrono::Duration {
        seconds(self.reuse_window_seconds)
    }

    /// Session record lifetime.
    #[must_use]
    pub fn session_max_age(&self) -> chrono::Duration {
        seconds(self.session_max_age_seconds)
    }

    /// Janitor sweep interval, never shorter than one second.
    #[must_use]
    pub fn sweep_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.sweep_interval_seconds.min(MAX_SECONDS))
            .max(MIN_SWEEP_INTERVAL)
    }
}

fn seconds(value: i64) -> chrono::Duration {
    chrono::Duration::try_seconds(value).unwrap_or(chrono::Duration::MAX)
}
