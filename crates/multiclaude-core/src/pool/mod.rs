//! Thread-safe multi-account pool.
//!
//! One exclusive lock guards all mutations; reads deep-copy outgoing data so
//! nothing escaping the lock can alias internal state. Upstream calls never
//! happen while the lock is held.

mod project;
mod selection;
mod token;

#[cfg(test)]
mod tests;

pub use token::CachedAccessToken;

use dashmap::DashMap;
use multiclaude_types::{
    Account, AccountError, ConfigDocument, Provider, Settings, MAX_ACCOUNTS,
};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

pub(crate) struct PoolInner {
    pub(crate) accounts: Vec<Account>,
    pub(crate) settings: Settings,
    /// Legacy antigravity index from older documents.
    pub(crate) active_index: usize,
    /// Per-provider round-robin cursors (pool slot indices).
    pub(crate) provider_indices: HashMap<Provider, usize>,
}

/// In-memory account pool backed by the persisted document.
pub struct AccountPool {
    pub(crate) inner: RwLock<PoolInner>,
    path: PathBuf,
    pub(crate) http: reqwest::Client,
    pub(crate) access_tokens: DashMap<String, CachedAccessToken>,
    pub(crate) projects: DashMap<String, String>,
}

impl AccountPool {
    /// Load the pool from the document at `path`.
    pub fn load(path: PathBuf, http: reqwest::Client) -> Self {
        let doc = crate::store::load(&path);
        Self::from_document(doc, path, http)
    }

    pub(crate) fn from_document(doc: ConfigDocument, path: PathBuf, http: reqwest::Client) -> Self {
        let mut provider_indices = HashMap::new();
        if doc.active_index < doc.accounts.len() {
            provider_indices.insert(Provider::Antigravity, doc.active_index);
        }
        Self {
            inner: RwLock::new(PoolInner {
                accounts: doc.accounts,
                settings: doc.settings,
                active_index: doc.active_index,
                provider_indices,
            }),
            path,
            http,
            access_tokens: DashMap::new(),
            projects: DashMap::new(),
        }
    }

    /// Apply a startup threshold override from the environment.
    pub fn apply_threshold_override(&self, threshold: Option<f64>) {
        if let Some(value) = threshold {
            self.inner.write().settings.soft_limit_threshold = value;
        }
    }

    /// Copy of the pool settings.
    pub fn settings(&self) -> Settings {
        self.inner.read().settings.clone()
    }

    /// Number of accounts belonging to `provider`.
    pub fn account_count(&self, provider: Provider) -> usize {
        self.inner.read().accounts.iter().filter(|a| a.provider == provider).count()
    }

    /// Deep copies of all accounts, in pool order.
    pub fn list_accounts(&self) -> Vec<Account> {
        self.inner.read().accounts.clone()
    }

    /// Deep copy of one account by email.
    pub fn get_account(&self, email: &str) -> Option<Account> {
        self.inner
            .read()
            .accounts
            .iter()
            .find(|a| a.email.eq_ignore_ascii_case(email))
            .cloned()
    }

    /// Add an account. Synchronous persistence: CLI paths must not race
    /// process exit with an in-flight async save.
    pub fn add_account(&self, account: Account) -> Result<(), AccountError> {
        {
            let mut inner = self.inner.write();
            if inner
                .accounts
                .iter()
                .any(|a| a.email.eq_ignore_ascii_case(&account.email))
            {
                return Err(AccountError::Duplicate { email: account.email });
            }
            if inner.accounts.len() >= MAX_ACCOUNTS {
                return Err(AccountError::MaxAccounts { limit: MAX_ACCOUNTS });
            }
            inner.accounts.push(account);
        }
        self.save_now()
    }

    /// Remove an account by email, shifting every provider cursor so the
    /// remaining indices still point at the accounts they pointed at.
    pub fn remove_account(&self, email: &str) -> Result<Account, AccountError> {
        let removed = {
            let mut inner = self.inner.write();
            let idx = inner
                .accounts
                .iter()
                .position(|a| a.email.eq_ignore_ascii_case(email))
                .ok_or_else(|| AccountError::NotFound { email: email.to_string() })?;
            let removed = inner.accounts.remove(idx);

            inner.provider_indices.retain(|_, slot| *slot != idx);
            for slot in inner.provider_indices.values_mut() {
                if *slot > idx {
                    *slot -= 1;
                }
            }
            if inner.active_index > idx {
                inner.active_index -= 1;
            } else if inner.active_index == idx {
                inner.active_index = 0;
            }
            removed
        };
        self.access_tokens.remove(email);
        self.projects.remove(email);
        self.save_now()?;
        Ok(removed)
    }

    /// Mark an account rate-limited for `model` until `reset_time_ms`
    /// (unix ms). A zero reset substitutes the configured cooldown.
    /// Soft-limit fields are preserved.
    pub fn mark_rate_limited(&self, email: &str, reset_time_ms: i64, model: &str) {
        let now = now_ms();
        {
            let mut inner = self.inner.write();
            let cooldown = inner.settings.cooldown_duration_ms;
            let Some(account) =
                inner.accounts.iter_mut().find(|a| a.email.eq_ignore_ascii_case(email))
            else {
                return;
            };
            let limit = account.limit_mut(model);
            limit.is_rate_limited = true;
            limit.reset_time = if reset_time_ms == 0 { now + cooldown } else { reset_time_ms };
            tracing::info!(
                "Account {} rate limited for {} until {}",
                email,
                model,
                limit.reset_time
            );
        }
        self.schedule_save();
    }

    /// Mark an account's credential unusable. Selection skips it until a
    /// successful token refresh clears the flag.
    pub fn mark_invalid(&self, email: &str, reason: &str) {
        {
            let mut inner = self.inner.write();
            let Some(account) =
                inner.accounts.iter_mut().find(|a| a.email.eq_ignore_ascii_case(email))
            else {
                return;
            };
            account.mark_invalid(reason);
            tracing::warn!("Account {} marked invalid: {}", email, reason);
        }
        self.schedule_save();
    }

    /// Clear the invalid flag after a successful refresh.
    pub fn clear_invalid(&self, email: &str) {
        let mut changed = false;
        {
            let mut inner = self.inner.write();
            if let Some(account) =
                inner.accounts.iter_mut().find(|a| a.email.eq_ignore_ascii_case(email))
            {
                if account.is_invalid {
                    account.clear_invalid();
                    changed = true;
                }
            }
        }
        if changed {
            self.schedule_save();
        }
    }

    /// Clear every expired hard limit, preserving soft-limit fields.
    /// Returns the number of (account, model) entries cleared.
    pub fn clear_expired_limits(&self) -> usize {
        let now = now_ms();
        let cleared = {
            let mut inner = self.inner.write();
            inner.clear_expired_limits_locked(now)
        };
        if cleared > 0 {
            tracing::debug!("Cleared {} expired rate limits", cleared);
            self.schedule_save();
        }
        cleared
    }

    /// Optimistic reset: drop all hard limits (for one provider, or all)
    /// after a full wait produced no candidate. Soft fields preserved.
    pub fn reset_all_rate_limits(&self, provider: Option<Provider>) {
        {
            let mut inner = self.inner.write();
            for account in &mut inner.accounts {
                if provider.map(|p| account.provider == p).unwrap_or(true) {
                    for limit in account.model_rate_limits.values_mut() {
                        limit.clear_hard_limit();
                    }
                }
            }
        }
        tracing::info!(
            "Optimistically reset rate limits for {}",
            provider.map(|p| p.to_string()).unwrap_or_else(|| "all providers".to_string())
        );
        self.schedule_save();
    }

    /// Update the observed remaining-quota fraction for (account, model).
    ///
    /// NaN and negative inputs clamp to 0, values above 1 clamp to 1. The
    /// soft-limit flag flips when remaining is at/below zero or under the
    /// threshold. Persists only on a state transition and only when
    /// `persist` is set; the read-only health path passes `false`.
    pub fn update_soft_limit(&self, email: &str, model: &str, remaining: f64, persist: bool) {
        let clamped = if remaining.is_nan() {
            0.0
        } else {
            remaining.clamp(0.0, 1.0)
        };

        let transitioned = {
            let mut inner = self.inner.write();
            let threshold = inner.settings.soft_limit_threshold;
            let Some(account) =
                inner.accounts.iter_mut().find(|a| a.email.eq_ignore_ascii_case(email))
            else {
                return;
            };
            let limit = account.limit_mut(model);
            let was_soft = limit.is_soft_limited;
            limit.quota_remaining = clamped;
            limit.is_soft_limited = clamped <= 0.0 || clamped < threshold;
            limit.is_soft_limited != was_soft
        };

        if transitioned && persist {
            tracing::info!(
                "Account {} soft limit for {} now {} (remaining {:.2})",
                email,
                model,
                if clamped <= 0.0 { "exhausted" } else { "active" },
                clamped
            );
            self.schedule_save();
        }
    }

    /// Drop cached access token and project id for an account. Used when an
    /// upstream 401 suggests the cached credential went stale.
    pub fn invalidate_auth(&self, email: &str) {
        self.access_tokens.remove(email);
        self.projects.remove(email);
        tracing::debug!("Cleared cached token/project for {}", email);
    }

    /// Persist synchronously. CLI mutations use this.
    pub fn save_now(&self) -> Result<(), AccountError> {
        let doc = self.snapshot_document();
        crate::store::save(&self.path, &doc)
    }

    /// Persist on a background task. Dispatch-path mutations use this so the
    /// request is never blocked on disk.
    pub(crate) fn schedule_save(&self) {
        let doc = self.snapshot_document();
        let path = self.path.clone();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn_blocking(move || {
                if let Err(e) = crate::store::save(&path, &doc) {
                    tracing::error!("Async account store save failed: {}", e);
                }
            });
        } else if let Err(e) = crate::store::save(&path, &doc) {
            tracing::error!("Account store save failed: {}", e);
        }
    }

    fn snapshot_document(&self) -> ConfigDocument {
        let inner = self.inner.read();
        ConfigDocument {
            accounts: inner.accounts.clone(),
            settings: inner.settings.clone(),
            active_index: inner.active_index,
        }
    }
}

impl PoolInner {
    pub(crate) fn clear_expired_limits_locked(&mut self, now: i64) -> usize {
        let mut cleared = 0;
        for account in &mut self.accounts {
            for limit in account.model_rate_limits.values_mut() {
                if limit.is_rate_limited && limit.reset_time <= now {
                    limit.clear_hard_limit();
                    cleared += 1;
                }
            }
        }
        cleared
    }
}

/// Shared pool handle.
pub type SharedPool = Arc<AccountPool>;

pub(crate) fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
