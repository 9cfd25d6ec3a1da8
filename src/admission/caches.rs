//! TTL caches for cluster lookups used by the admission checks.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::hash::Hash;
use std::time::{Duration, Instant};

const MAX_ENTRIES: usize = 512;

/// A small read-through cache with per-entry expiry and explicit
/// invalidation.
pub struct TtlCache<K, V> {
    entries: RwLock<HashMap<K, (V, Instant)>>,
    ttl: Duration,
}

impl<K: Eq + Hash + Clone, V: Clone> TtlCache<K, V> {
    /// New cache whose entries expire after `ttl`
    pub fn new(ttl: Duration) -> Self {
        Self { entries: RwLock::new(HashMap::new()), ttl }
    }

    /// Fresh value for a key, if present
    pub fn get(&self, key: &K) -> Option<V> {
        let entries = self.entries.read();
        match entries.get(key) {
            Some((value, inserted)) if inserted.elapsed() < self.ttl => Some(value.clone()),
            _ => None,
        }
    }

    /// Insert or refresh a value
    pub fn insert(&self, key: K, value: V) {
        let mut entries = self.entries.write();
        entries.insert(key, (value, Instant::now()));
        if entries.len() > MAX_ENTRIES {
            let ttl = self.ttl;
            entries.retain(|_, (_, inserted)| inserted.elapsed() < ttl);
        }
    }

    /// Drop one entry
    pub fn invalidate(&self, key: &K) {
        self.entries.write().remove(key);
    }

    /// Drop everything
    pub fn invalidate_all(&self) {
        self.entries.write().clear();
    }

    /// Number of entries, including expired ones not yet evicted
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Whether the cache holds no entries
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_insert_invalidate() {
        let cache: TtlCache<String, u64> = TtlCache::new(Duration::from_secs(60));
        assert!(cache.get(&"a".to_string()).is_none());
        cache.insert("a".into(), 1);
        assert_eq!(cache.get(&"a".to_string()), Some(1));
        cache.invalidate(&"a".to_string());
        assert!(cache.get(&"a".to_string()).is_none());
    }

    #[test]
    fn entries_expire() {
        let cache: TtlCache<String, u64> = TtlCache::new(Duration::from_millis(10));
        cache.insert("a".into(), 1);
        std::thread::sleep(Duration::from_millis(20));
        assert!(cache.get(&"a".to_string()).is_none());
    }
}
