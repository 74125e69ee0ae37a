//! TTL Response Cache
//!
//! Short-lived store for upstream REST responses. Entries carry an
//! absolute expiry and optional tags so related keys (everything about
//! one symbol, say) can be evicted together.
//!
//! The cache never fetches. Callers implement read-through: `get`, on a
//! miss call upstream, then `set`. Concurrent misses for the same key are
//! not coalesced; both callers fetch.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

#[derive(Debug, Clone)]
struct CacheEntry<V> {
    value: V,
    expires_at: Instant,
    tags: Vec<String>,
}

#[derive(Debug)]
struct CacheState<V> {
    entries: HashMap<String, CacheEntry<V>>,
    tags: HashMap<String, HashSet<String>>,
}

impl<V> Default for CacheState<V> {
    fn default() -> Self {
        Self {
            entries: HashMap::new(),
            tags: HashMap::new(),
        }
    }
}

impl<V> CacheState<V> {
    fn remove(&mut self, key: &str) -> Option<CacheEntry<V>> {
        let entry = self.entries.remove(key)?;
        for tag in &entry.tags {
            if let Some(keys) = self.tags.get_mut(tag) {
                keys.remove(key);
                if keys.is_empty() {
                    self.tags.remove(tag);
                }
            }
        }
        Some(entry)
    }
}

/// Thread-safe TTL cache keyed by string.
#[derive(Debug)]
pub struct ResponseCache<V> {
    state: Mutex<CacheState<V>>,
}

impl<V> Default for ResponseCache<V> {
    fn default() -> Self {
        Self {
            state: Mutex::new(CacheState::default()),
        }
    }
}

impl<V: Clone> ResponseCache<V> {
    /// Create an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a key now.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<V> {
        self.get_at(key, Instant::now())
    }

    /// Look up a key at an explicit instant.
    ///
    /// An entry whose expiry has passed is purged and reported as a miss.
    #[must_use]
    pub fn get_at(&self, key: &str, now: Instant) -> Option<V> {
        let mut state = self.state.lock();
        let expired = match state.entries.get(key) {
            Some(entry) if now < entry.expires_at => return Some(entry.value.clone()),
            Some(_) => true,
            None => false,
        };
        if expired {
            state.remove(key);
        }
        None
    }

    /// Store a value for `ttl`.
    pub fn set(&self, key: impl Into<String>, value: V, ttl: Duration) {
        self.set_at(key, value, ttl, Vec::new(), Instant::now());
    }

    /// Store a value for `ttl`, indexed under each tag.
    pub fn set_with_tags(
        &self,
        key: impl Into<String>,
        value: V,
        ttl: Duration,
        tags: impl IntoIterator<Item = String>,
    ) {
        self.set_at(key, value, ttl, tags.into_iter().collect(), Instant::now());
    }

    /// Store a value at an explicit instant.
    pub fn set_at(
        &self,
        key: impl Into<String>,
        value: V,
        ttl: Duration,
        tags: Vec<String>,
        now: Instant,
    ) {
        let key = key.into();
        let expires_at = now.checked_add(ttl).unwrap_or(now);
        let mut state = self.state.lock();

        // Replacing an entry must drop its old tag links first.
        state.remove(&key);
        for tag in &tags {
            state.tags.entry(tag.clone()).or_default().insert(key.clone());
        }
        state.entries.insert(
            key,
            CacheEntry {
                value,
                expires_at,
                tags,
            },
        );
    }

    /// Evict one key. Returns true if it was present.
    pub fn invalidate(&self, key: &str) -> bool {
        self.state.lock().remove(key).is_some()
    }

    /// Evict every key stored under `tag`. Returns the number evicted.
    pub fn invalidate_by_tag(&self, tag: &str) -> usize {
        let mut state = self.state.lock();
        let Some(keys) = state.tags.remove(tag) else {
            return 0;
        };
        keys.iter().filter(|k| state.remove(k).is_some()).count()
    }

    /// Drop every expired entry. Returns the number removed.
    pub fn purge_expired(&self) -> usize {
        self.purge_expired_at(Instant::now())
    }

    /// Drop every entry expired at `now`.
    pub fn purge_expired_at(&self, now: Instant) -> usize {
        let mut state = self.state.lock();
        let expired: Vec<String> = state
            .entries
            .iter()
            .filter(|(_, e)| now >= e.expires_at)
            .map(|(k, _)| k.clone())
            .collect();
        for key in &expired {
            state.remove(key);
        }
        expired.len()
    }

    /// Number of stored entries, including expired ones not yet purged.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().entries.len()
    }

    /// Whether the cache holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tags(list: &[&str]) -> Vec<String> {
        list.iter().map(|t| (*t).to_string()).collect()
    }

    #[test]
    fn hit_then_miss_after_expiry() {
        let cache = ResponseCache::new();
        let start = Instant::now();
        cache.set_at("k", 1, Duration::from_millis(100), vec![], start);

        assert_eq!(cache.get_at("k", start), Some(1));
        assert_eq!(cache.get_at("k", start + Duration::from_millis(150)), None);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn expires_in_real_time() {
        let cache = ResponseCache::new();
        cache.set("k", "v".to_string(), Duration::from_millis(100));

        assert_eq!(cache.get("k").as_deref(), Some("v"));
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(cache.get("k"), None);
    }

    #[test]
    fn expiry_boundary_is_a_miss() {
        let cache = ResponseCache::new();
        let start = Instant::now();
        cache.set_at("k", 1, Duration::from_secs(1), vec![], start);

        assert_eq!(cache.get_at("k", start + Duration::from_secs(1)), None);
    }

    #[test]
    fn set_overwrites_value_and_ttl() {
        let cache = ResponseCache::new();
        let start = Instant::now();
        cache.set_at("k", 1, Duration::from_secs(1), vec![], start);
        cache.set_at("k", 2, Duration::from_secs(10), vec![], start);

        assert_eq!(cache.get_at("k", start + Duration::from_secs(5)), Some(2));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn invalidate_single_key() {
        let cache = ResponseCache::new();
        cache.set("a", 1, Duration::from_secs(60));
        cache.set("b", 2, Duration::from_secs(60));

        assert!(cache.invalidate("a"));
        assert!(!cache.invalidate("a"));
        assert_eq!(cache.get("a"), None);
        assert_eq!(cache.get("b"), Some(2));
    }

    #[test]
    fn invalidate_by_tag_evicts_related_keys() {
        let cache = ResponseCache::new();
        cache.set_with_tags("snap:AAPL", 1, Duration::from_secs(60), tags(&["symbol:AAPL"]));
        cache.set_with_tags("prev:AAPL", 2, Duration::from_secs(60), tags(&["symbol:AAPL"]));
        cache.set_with_tags("snap:MSFT", 3, Duration::from_secs(60), tags(&["symbol:MSFT"]));

        assert_eq!(cache.invalidate_by_tag("symbol:AAPL"), 2);
        assert_eq!(cache.get("snap:AAPL"), None);
        assert_eq!(cache.get("prev:AAPL"), None);
        assert_eq!(cache.get("snap:MSFT"), Some(3));
        assert_eq!(cache.invalidate_by_tag("symbol:AAPL"), 0);
    }

    #[test]
    fn overwrite_drops_stale_tag_links() {
        let cache = ResponseCache::new();
        cache.set_with_tags("k", 1, Duration::from_secs(60), tags(&["old"]));
        cache.set_with_tags("k", 2, Duration::from_secs(60), tags(&["new"]));

        assert_eq!(cache.invalidate_by_tag("old"), 0);
        assert_eq!(cache.get("k"), Some(2));
        assert_eq!(cache.invalidate_by_tag("new"), 1);
    }

    #[test]
    fn purge_expired_keeps_live_entries() {
        let cache = ResponseCache::new();
        let start = Instant::now();
        cache.set_at("short", 1, Duration::from_secs(1), tags(&["t"]), start);
        cache.set_at("long", 2, Duration::from_secs(60), tags(&["t"]), start);

        assert_eq!(cache.purge_expired_at(start + Duration::from_secs(2)), 1);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.invalidate_by_tag("t"), 1);
    }
}
