//! Process-scoped thoughtSignature caches.
//!
//! Two layers: tool_use id → signature (so signatures stripped by clients
//! can be recovered on the next turn) and signature → model family (so
//! Claude signatures never end up on Gemini requests). Entries expire lazily
//! after the TTL; reads never remove them.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::OnceLock;
use std::time::{Duration, SystemTime};

const SIGNATURE_TTL: Duration = Duration::from_secs(2 * 60 * 60);
const MIN_SIGNATURE_LENGTH: usize = 50;

/// Cache entry with timestamp for TTL.
#[derive(Clone, Debug)]
struct CacheEntry<T> {
    data: T,
    timestamp: SystemTime,
}

impl<T> CacheEntry<T> {
    fn new(data: T) -> Self {
        Self { data, timestamp: SystemTime::now() }
    }

    fn is_expired(&self) -> bool {
        self.timestamp.elapsed().unwrap_or(Duration::ZERO) > SIGNATURE_TTL
    }
}

/// Signature cache shared by all providers within one process.
pub struct SignatureCache {
    tool_signatures: RwLock<HashMap<String, CacheEntry<String>>>,
    thinking_families: RwLock<HashMap<String, CacheEntry<String>>>,
}

impl SignatureCache {
    fn new() -> Self {
        Self {
            tool_signatures: RwLock::new(HashMap::new()),
            thinking_families: RwLock::new(HashMap::new()),
        }
    }

    /// Global singleton instance.
    pub fn global() -> &'static SignatureCache {
        static INSTANCE: OnceLock<SignatureCache> = OnceLock::new();
        INSTANCE.get_or_init(SignatureCache::new)
    }

    /// Store a signature keyed by tool_use id. Short signatures are rejected.
    pub fn cache_tool_signature(&self, tool_use_id: &str, signature: String) {
        if signature.len() < MIN_SIGNATURE_LENGTH {
            return;
        }
        tracing::debug!("[SignatureCache] Caching tool signature for id: {}", tool_use_id);
        self.tool_signatures
            .write()
            .insert(tool_use_id.to_string(), CacheEntry::new(signature));
    }

    /// Signature for a tool_use id, if present and fresh.
    pub fn get_tool_signature(&self, tool_use_id: &str) -> Option<String> {
        let cache = self.tool_signatures.read();
        cache
            .get(tool_use_id)
            .filter(|entry| !entry.is_expired())
            .map(|entry| entry.data.clone())
    }

    /// Record which model family produced a signature.
    pub fn cache_thinking_family(&self, signature: String, family: String) {
        if signature.len() < MIN_SIGNATURE_LENGTH {
            return;
        }
        self.thinking_families.write().insert(signature, CacheEntry::new(family));
    }

    /// Model family a signature belongs to, if known and fresh.
    pub fn get_signature_family(&self, signature: &str) -> Option<String> {
        let cache = self.thinking_families.read();
        cache
            .get(signature)
            .filter(|entry| !entry.is_expired())
            .map(|entry| entry.data.clone())
    }

    /// Drop expired entries. Returns how many were removed.
    pub fn cleanup(&self) -> usize {
        let mut removed = 0;
        {
            let mut cache = self.tool_signatures.write();
            let before = cache.len();
            cache.retain(|_, v| !v.is_expired());
            removed += before - cache.len();
        }
        {
            let mut cache = self.thinking_families.write();
            let before = cache.len();
            cache.retain(|_, v| !v.is_expired());
            removed += before - cache.len();
        }
        if removed > 0 {
            tracing::debug!("[SignatureCache] Cleanup removed {} expired entries", removed);
        }
        removed
    }

    /// Clear everything. Test teardown and shutdown only.
    pub fn clear(&self) {
        self.tool_signatures.write().clear();
        self.thinking_families.write().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn long_sig(tag: &str) -> String {
        format!("{}{}", tag, "x".repeat(MIN_SIGNATURE_LENGTH))
    }

    #[test]
    fn short_signatures_are_rejected() {
        let cache = SignatureCache::new();
        cache.cache_tool_signature("toolu_1", "short".to_string());
        assert!(cache.get_tool_signature("toolu_1").is_none());
    }

    #[test]
    fn round_trip_by_tool_id() {
        let cache = SignatureCache::new();
        let sig = long_sig("sig-");
        cache.cache_tool_signature("toolu_1", sig.clone());
        assert_eq!(cache.get_tool_signature("toolu_1"), Some(sig));
        assert!(cache.get_tool_signature("toolu_2").is_none());
    }

    #[test]
    fn family_lookup() {
        let cache = SignatureCache::new();
        let sig = long_sig("fam-");
        cache.cache_thinking_family(sig.clone(), "gemini".to_string());
        assert_eq!(cache.get_signature_family(&sig), Some("gemini".to_string()));
    }

    #[test]
    fn expired_entries_survive_until_cleanup() {
        let cache = SignatureCache::new();
        let sig = long_sig("old-");
        cache.tool_signatures.write().insert(
            "toolu_old".to_string(),
            CacheEntry {
                data: sig,
                timestamp: SystemTime::now() - SIGNATURE_TTL - Duration::from_secs(1),
            },
        );

        assert!(cache.get_tool_signature("toolu_old").is_none());
        assert_eq!(cache.tool_signatures.read().len(), 1);
        assert_eq!(cache.cleanup(), 1);
        assert!(cache.tool_signatures.read().is_empty());
    }
}
