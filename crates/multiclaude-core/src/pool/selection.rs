//! Round-robin account selection with soft-limit preference.

use super::{now_ms, AccountPool, PoolInner};
use multiclaude_types::{Account, Provider};

impl AccountPool {
    /// Pick the next available account of `provider` for `model`.
    ///
    /// Expired hard limits are cleared first, then the provider cursor is
    /// repaired if it points outside the pool or at a foreign account. Two
    /// circular scans follow: the preferred pass skips soft-limited accounts
    /// (only when soft limits are enabled), the fallback pass accepts them.
    /// Invalid and hard-limited accounts never match.
    pub fn pick_next(&self, provider: Provider, model: &str) -> Option<Account> {
        let now = now_ms();
        let picked = {
            let mut inner = self.inner.write();
            let cleared = inner.clear_expired_limits_locked(now);
            if cleared > 0 {
                tracing::debug!("pick_next cleared {} expired limits", cleared);
            }

            let positions: Vec<usize> = inner
                .accounts
                .iter()
                .enumerate()
                .filter(|(_, a)| a.provider == provider)
                .map(|(i, _)| i)
                .collect();
            if positions.is_empty() {
                return None;
            }

            let cursor = repair_cursor(&inner, provider, &positions);
            let start = positions
                .iter()
                .position(|&p| p == cursor)
                .map(|i| (i + 1) % positions.len())
                .unwrap_or(0);

            let soft_limits_enabled = inner.settings.soft_limit_enabled;
            let mut chosen: Option<usize> = None;

            if soft_limits_enabled {
                for k in 0..positions.len() {
                    let pos = positions[(start + k) % positions.len()];
                    let account = &inner.accounts[pos];
                    if account.is_invalid
                        || account.is_hard_limited(model, now)
                        || account.is_soft_limited(model)
                    {
                        continue;
                    }
                    chosen = Some(pos);
                    break;
                }
            }

            if chosen.is_none() {
                for k in 0..positions.len() {
                    let pos = positions[(start + k) % positions.len()];
                    let account = &inner.accounts[pos];
                    if account.is_invalid || account.is_hard_limited(model, now) {
                        continue;
                    }
                    chosen = Some(pos);
                    break;
                }
            }

            let pos = chosen?;
            inner.provider_indices.insert(provider, pos);
            if provider == Provider::Antigravity {
                inner.active_index = pos;
            }
            inner.accounts[pos].touch();
            inner.accounts[pos].clone()
        };

        self.schedule_save();
        Some(picked)
    }

    /// True only when `model` is non-empty, the provider has accounts, and
    /// every non-invalid account holds an active hard limit for the model.
    pub fn is_all_rate_limited(&self, provider: Provider, model: &str) -> bool {
        if model.is_empty() {
            return false;
        }
        let now = now_ms();
        let inner = self.inner.read();
        let mut total = 0usize;
        let mut usable = 0usize;
        let mut limited = 0usize;
        for account in inner.accounts.iter().filter(|a| a.provider == provider) {
            total += 1;
            if account.is_invalid {
                continue;
            }
            usable += 1;
            if account.is_hard_limited(model, now) {
                limited += 1;
            }
        }
        total > 0 && usable > 0 && usable == limited
    }

    /// Minimum remaining wait among the provider's active limits for
    /// `model`, clamped to >= 0. Falls back to the configured cooldown when
    /// no concrete reset time is known.
    pub fn get_min_wait_ms(&self, provider: Provider, model: &str) -> i64 {
        let now = now_ms();
        let inner = self.inner.read();
        let min_reset = inner
            .accounts
            .iter()
            .filter(|a| a.provider == provider && !a.is_invalid)
            .filter_map(|a| a.limit_for(model))
            .filter(|l| l.is_active(now))
            .map(|l| l.reset_time)
            .min();
        match min_reset {
            Some(reset) => (reset - now).max(0),
            None => inner.settings.cooldown_duration_ms,
        }
    }
}

/// Repair the provider cursor: it must point at an existing slot of the
/// right provider, otherwise fall back to the provider's first slot.
fn repair_cursor(inner: &PoolInner, provider: Provider, positions: &[usize]) -> usize {
    let cursor = inner.provider_indices.get(&provider).copied().unwrap_or_else(|| {
        if provider == Provider::Antigravity {
            inner.active_index
        } else {
            positions[0]
        }
    });
    if cursor >= inner.accounts.len() || inner.accounts[cursor].provider != provider {
        return positions[0];
    }
    cursor
}
