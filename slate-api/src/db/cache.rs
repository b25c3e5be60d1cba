use std::collections::HashMap;
use std::sync::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

struct CacheEntry<V> {
    value: V,
    expires: Instant,
}

/// A TTL-bounded read cache keyed by string.
///
/// Entries expire after the configured TTL and are also dropped by explicit
/// invalidation after writes. The cache is bounded in time, not in entry
/// count. Hit and miss counters feed the statistics endpoint.
pub struct TtlCache<V> {
    ttl: Duration,
    entries: RwLock<HashMap<String, CacheEntry<V>>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl<V: Clone> TtlCache<V> {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: RwLock::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Returns the cached value if present and not expired.
    pub fn get(&self, key: &str) -> Option<V> {
        let entries = self.entries.read().unwrap();
        match entries.get(key) {
            Some(entry) if entry.expires > Instant::now() => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(entry.value.clone())
            }
            _ => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Inserts or refreshes an entry, restarting its TTL.
    pub fn insert(&self, key: &str, value: V) {
        let mut entries = self.entries.write().unwrap();
        entries.insert(
            key.to_string(),
            CacheEntry {
                value,
                expires: Instant::now() + self.ttl,
            },
        );
    }

    /// Drops an entry regardless of its remaining TTL.
    pub fn invalidate(&self, key: &str) {
        let mut entries = self.entries.write().unwrap();
        entries.remove(key);
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hit_within_ttl_miss_after_expiry() {
        let cache = TtlCache::new(Duration::from_millis(50));
        cache.insert("key", 7u32);
        assert_eq!(cache.get("key"), Some(7));
        std::thread::sleep(Duration::from_millis(60));
        assert_eq!(cache.get("key"), None);
    }

    #[test]
    fn invalidate_drops_entry_immediately() {
        let cache = TtlCache::new(Duration::from_secs(60));
        cache.insert("key", "value".to_string());
        cache.invalidate("key");
        assert_eq!(cache.get("key"), None);
    }

    #[test]
    fn counters_track_hits_and_misses() {
        let cache = TtlCache::new(Duration::from_secs(60));
        cache.insert("key", 1u8);
        let _ = cache.get("key");
        let _ = cache.get("absent");
        assert_eq!(cache.hits(), 1);
        assert_eq!(cache.misses(), 1);
    }

    #[test]
    fn insert_refreshes_ttl() {
        let cache = TtlCache::new(Duration::from_millis(80));
        cache.insert("key", 1u8);
        std::thread::sleep(Duration::from_millis(50));
        cache.insert("key", 2u8);
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(cache.get("key"), Some(2));
    }
}
