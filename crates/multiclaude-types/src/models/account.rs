//! Account model and related types.

use super::limits::LimitState;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Hard cap on the number of accounts the pool will hold.
pub const MAX_ACCOUNTS: usize = 100;

/// Upstream backend that owns an account.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    /// Google Cloud Code based Antigravity service.
    #[default]
    Antigravity,
    /// Z.AI Anthropic-compatible API.
    Zai,
    /// GitHub Copilot.
    Copilot,
}

impl Provider {
    pub const ALL: [Provider; 3] = [Provider::Antigravity, Provider::Zai, Provider::Copilot];

    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Antigravity => "antigravity",
            Provider::Zai => "zai",
            Provider::Copilot => "copilot",
        }
    }
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Provider {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "antigravity" => Ok(Provider::Antigravity),
            "zai" | "z.ai" => Ok(Provider::Zai),
            "copilot" => Ok(Provider::Copilot),
            other => Err(format!("Unknown provider: {}", other)),
        }
    }
}

/// How the account's credential was obtained.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum AccountSource {
    /// Enrolled through an OAuth flow; carries a refresh token.
    #[default]
    Oauth,
    /// Added with a raw API key.
    Manual,
}

/// A credentialed identity at a specific provider.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Account {
    /// Email address identifying the account.
    pub email: String,
    /// Backend provider; older documents omit this field.
    #[serde(default)]
    pub provider: Provider,
    /// Credential origin.
    #[serde(default)]
    pub source: AccountSource,
    /// OAuth refresh token (oauth accounts only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    /// Raw API key (manual accounts only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    /// Copilot subscription tier, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub copilot_tier: Option<String>,
    /// Google Cloud project backing this account.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    /// Timestamp (unix ms) when the account was added.
    #[serde(default)]
    pub added_at: i64,
    /// Timestamp (unix ms) of the last selection.
    #[serde(default)]
    pub last_used: i64,
    /// Timestamp (unix ms) when the account was marked invalid.
    #[serde(default)]
    pub invalid_at: i64,
    /// Whether the credential is known to be unusable.
    #[serde(default)]
    pub is_invalid: bool,
    /// Human-readable reason for invalidation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invalid_reason: Option<String>,
    /// Per-model rate-limit and soft-quota state.
    #[serde(default)]
    pub model_rate_limits: HashMap<String, LimitState>,
}

impl Account {
    /// Create a new account with the given identity.
    pub fn new(email: impl Into<String>, provider: Provider, source: AccountSource) -> Self {
        let now = chrono::Utc::now().timestamp_millis();
        Self {
            email: email.into(),
            provider,
            source,
            refresh_token: None,
            api_key: None,
            copilot_tier: None,
            project_id: None,
            added_at: now,
            last_used: 0,
            invalid_at: 0,
            is_invalid: false,
            invalid_reason: None,
            model_rate_limits: HashMap::new(),
        }
    }

    /// Update the last used timestamp to now.
    pub fn touch(&mut self) {
        self.last_used = chrono::Utc::now().timestamp_millis();
    }

    /// Limit state for a model, if any has been recorded.
    pub fn limit_for(&self, model: &str) -> Option<&LimitState> {
        self.model_rate_limits.get(model)
    }

    /// Mutable limit state for a model, created on first access.
    pub fn limit_mut(&mut self, model: &str) -> &mut LimitState {
        self.model_rate_limits.entry(model.to_string()).or_default()
    }

    /// Whether the account holds an active hard limit for `model` at `now_ms`.
    pub fn is_hard_limited(&self, model: &str, now_ms: i64) -> bool {
        self.limit_for(model)
            .map(|l| l.is_rate_limited && l.reset_time > now_ms)
            .unwrap_or(false)
    }

    /// Whether the account is soft-limited for `model`.
    pub fn is_soft_limited(&self, model: &str) -> bool {
        self.limit_for(model).map(|l| l.is_soft_limited).unwrap_or(false)
    }

    /// Mark the credential unusable with a reason.
    pub fn mark_invalid(&mut self, reason: impl Into<String>) {
        self.is_invalid = true;
        self.invalid_at = chrono::Utc::now().timestamp_millis();
        self.invalid_reason = Some(reason.into());
    }

    /// Clear the invalid flag (e.g. after a successful token refresh).
    pub fn clear_invalid(&mut self) {
        self.is_invalid = false;
        self.invalid_at = 0;
        self.invalid_reason = None;
    }

    /// Copy of the account with credentials stripped down to the fields
    /// matching its source, for persistence.
    pub fn to_disk_form(&self) -> Self {
        let mut copy = self.clone();
        match copy.source {
            AccountSource::Oauth => copy.api_key = None,
            AccountSource::Manual => copy.refresh_token = None,
        }
        copy
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_defaults_to_antigravity_when_missing() {
        let account: Account = serde_json::from_str(r#"{"email":"a@b.c"}"#).unwrap();
        assert_eq!(account.provider, Provider::Antigravity);
        assert_eq!(account.source, AccountSource::Oauth);
    }

    #[test]
    fn null_is_accepted_for_nullable_strings() {
        let account: Account =
            serde_json::from_str(r#"{"email":"a@b.c","project_id":null,"invalid_reason":null}"#)
                .unwrap();
        assert!(account.project_id.is_none());
    }

    #[test]
    fn disk_form_strips_mismatched_credentials() {
        let mut account = Account::new("a@b.c", Provider::Antigravity, AccountSource::Oauth);
        account.refresh_token = Some("rt".into());
        account.api_key = Some("stale".into());
        let disk = account.to_disk_form();
        assert_eq!(disk.refresh_token.as_deref(), Some("rt"));
        assert!(disk.api_key.is_none());
    }

    #[test]
    fn hard_limit_requires_future_reset() {
        let mut account = Account::new("a@b.c", Provider::Zai, AccountSource::Manual);
        let limit = account.limit_mut("glm-4.6");
        limit.is_rate_limited = true;
        limit.reset_time = 1_000;
        assert!(account.is_hard_limited("glm-4.6", 500));
        assert!(!account.is_hard_limited("glm-4.6", 1_000));
        assert!(!account.is_hard_limited("other-model", 500));
    }
}
