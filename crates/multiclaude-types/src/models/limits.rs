//! Per-(account, model) limit state and pool-wide settings.

use serde::{Deserialize, Serialize};

/// Rate-limit and soft-quota bookkeeping for one (account, model) pair.
///
/// An account is available for a model when `is_rate_limited` is false or
/// `reset_time` has passed. Soft-limit fields are preserved when hard limits
/// clear.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LimitState {
    /// Provider-signalled cooldown is active.
    #[serde(default)]
    pub is_rate_limited: bool,
    /// Unix ms when the cooldown expires; 0 when unset.
    #[serde(default)]
    pub reset_time: i64,
    /// Self-imposed drain-avoidance state.
    #[serde(default)]
    pub is_soft_limited: bool,
    /// Observed remaining quota fraction in [0, 1].
    #[serde(default = "default_quota_remaining")]
    pub quota_remaining: f64,
}

fn default_quota_remaining() -> f64 {
    1.0
}

impl Default for LimitState {
    fn default() -> Self {
        Self {
            is_rate_limited: false,
            reset_time: 0,
            is_soft_limited: false,
            quota_remaining: 1.0,
        }
    }
}

impl LimitState {
    /// True when the hard limit is active at `now_ms`.
    pub fn is_active(&self, now_ms: i64) -> bool {
        self.is_rate_limited && self.reset_time > now_ms
    }

    /// Clear the hard limit, keeping soft-quota fields intact.
    pub fn clear_hard_limit(&mut self) {
        self.is_rate_limited = false;
        self.reset_time = 0;
    }
}

/// Pool-wide tunables, persisted alongside the accounts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Settings {
    /// Fallback cooldown applied when a 429 carries no reset time.
    #[serde(default = "default_cooldown_ms")]
    pub cooldown_duration_ms: i64,
    /// Whether soft limits influence account selection.
    #[serde(default = "default_soft_limit_enabled")]
    pub soft_limit_enabled: bool,
    /// Remaining-quota fraction at or below which an account is soft-limited.
    #[serde(default = "default_soft_limit_threshold")]
    pub soft_limit_threshold: f64,
}

fn default_cooldown_ms() -> i64 {
    10_000
}

fn default_soft_limit_enabled() -> bool {
    true
}

fn default_soft_limit_threshold() -> f64 {
    0.20
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            cooldown_duration_ms: default_cooldown_ms(),
            soft_limit_enabled: default_soft_limit_enabled(),
            soft_limit_threshold: default_soft_limit_threshold(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clear_hard_limit_preserves_soft_fields() {
        let mut state = LimitState {
            is_rate_limited: true,
            reset_time: 12345,
            is_soft_limited: true,
            quota_remaining: 0.1,
        };
        state.clear_hard_limit();
        assert!(!state.is_rate_limited);
        assert_eq!(state.reset_time, 0);
        assert!(state.is_soft_limited);
        assert_eq!(state.quota_remaining, 0.1);
    }

    #[test]
    fn settings_defaults() {
        let settings: Settings = serde_json::from_str("{}").unwrap();
        assert_eq!(settings.cooldown_duration_ms, 10_000);
        assert!(settings.soft_limit_enabled);
        assert_eq!(settings.soft_limit_threshold, 0.20);
    }
}
