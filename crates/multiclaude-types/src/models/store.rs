//! Persisted configuration document (accounts.json).

use super::{Account, Provider, Settings};
use serde::{Deserialize, Serialize};

/// The single JSON document persisted to disk.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ConfigDocument {
    /// Ordered list of accounts.
    #[serde(default)]
    pub accounts: Vec<Account>,
    /// Pool-wide settings.
    #[serde(default)]
    pub settings: Settings,
    /// Legacy antigravity round-robin index, kept for compatibility with
    /// documents written by earlier releases.
    #[serde(rename = "activeIndex", default)]
    pub active_index: usize,
}

impl ConfigDocument {
    /// Normalize a freshly-loaded document: invalid flags do not survive a
    /// restart, and accounts from older documents get a default provider.
    pub fn normalize_on_load(&mut self) {
        for account in &mut self.accounts {
            account.clear_invalid();
        }
        if self.active_index >= self.accounts.len() {
            self.active_index = 0;
        }
    }

    /// Accounts belonging to one provider, in pool order.
    pub fn accounts_for(&self, provider: Provider) -> impl Iterator<Item = &Account> {
        self.accounts.iter().filter(move |a| a.provider == provider)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::AccountSource;

    #[test]
    fn normalize_clears_invalid_flags() {
        let mut doc = ConfigDocument::default();
        let mut account = Account::new("a@b.c", Provider::Antigravity, AccountSource::Oauth);
        account.mark_invalid("expired");
        doc.accounts.push(account);
        doc.active_index = 7;

        doc.normalize_on_load();
        assert!(!doc.accounts[0].is_invalid);
        assert!(doc.accounts[0].invalid_reason.is_none());
        assert_eq!(doc.active_index, 0);
    }

    #[test]
    fn empty_document_parses() {
        let doc: ConfigDocument = serde_json::from_str("{}").unwrap();
        assert!(doc.accounts.is_empty());
        assert_eq!(doc.active_index, 0);
    }
}
