// # Query Caching
//
// LRU + TTL caches keyed by query fingerprints. The plan cache is keyed by
// the structural fingerprint (predicate shape and field set, no literals);
// the result cache adds literal values to the key. Both track the fields a
// cached entry depends on and drop entries whose field set intersects a
// mutation.

use std::collections::BTreeSet;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};

use crate::buffer::lru::LruCache;

pub const DEFAULT_CAPACITY: usize = 256;
pub const DEFAULT_TTL_SECS: u64 = 60;

#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub capacity: usize,
    pub ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
            ttl: Duration::from_secs(DEFAULT_TTL_SECS),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub invalidations: u64,
}

struct TimedEntry<T> {
    value: T,
    fields: BTreeSet<String>,
    created_at: Instant,
}

/// Fingerprint-keyed cache with TTL expiry and field-set invalidation.
pub struct FingerprintCache<T: Clone> {
    inner: Mutex<LruCache<u64, TimedEntry<T>>>,
    ttl: Duration,
    stats: RwLock<CacheStats>,
}

impl<T: Clone> FingerprintCache<T> {
    pub fn new(config: &CacheConfig) -> Self {
        Self {
            inner: Mutex::new(LruCache::new(config.capacity)),
            ttl: config.ttl,
            stats: RwLock::new(CacheStats::default()),
        }
    }

    pub fn get(&self, fingerprint: u64) -> Option<T> {
        let mut inner = self.inner.lock();
        let expired = match inner.peek(&fingerprint) {
            None => {
                self.stats.write().misses += 1;
                return None;
            }
            Some(entry) => entry.created_at.elapsed() > self.ttl,
        };
        if expired {
            inner.remove(&fingerprint);
            self.stats.write().misses += 1;
            return None;
        }
        let value = inner.get(&fingerprint).map(|e| e.value.clone());
        self.stats.write().hits += 1;
        value
    }

    pub fn put(&self, fingerprint: u64, fields: BTreeSet<String>, value: T) {
        self.inner.lock().put(
            fingerprint,
            TimedEntry {
                value,
                fields,
                created_at: Instant::now(),
            },
        );
    }

    /// Drop every entry that depends on one of the touched fields.
    /// `touched` carries top-level field names; an entry referencing a
    /// nested path is stale when its head segment is touched.
    pub fn invalidate_fields(&self, touched: &BTreeSet<String>) {
        let mut inner = self.inner.lock();
        // An entry with no field dependencies (match-everything queries)
        // depends on every write.
        let stale = inner.keys_where(|_, entry| {
            entry.fields.is_empty()
                || entry.fields.iter().any(|field| {
                    let head = field.split('.').next().unwrap_or(field);
                    touched.contains(head)
                })
        });
        if stale.is_empty() {
            return;
        }
        self.stats.write().invalidations += stale.len() as u64;
        for key in stale {
            inner.remove(&key);
        }
    }

    pub fn clear(&self) {
        self.inner.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    pub fn stats(&self) -> CacheStats {
        *self.stats.read()
    }
}

impl<T: Clone> std::fmt::Debug for FingerprintCache<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FingerprintCache")
            .field("len", &self.len())
            .field("ttl", &self.ttl)
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_hit_and_miss() {
        let cache = FingerprintCache::new(&CacheConfig::default());
        assert_eq!(cache.get(1), None);
        cache.put(1, fields(&["price"]), vec!["a".to_string()]);
        assert_eq!(cache.get(1), Some(vec!["a".to_string()]));

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[test]
    fn test_field_invalidation() {
        let cache = FingerprintCache::new(&CacheConfig::default());
        cache.put(1, fields(&["price"]), 10);
        cache.put(2, fields(&["name"]), 20);

        cache.invalidate_fields(&fields(&["price", "stock"]));
        assert_eq!(cache.get(1), None);
        assert_eq!(cache.get(2), Some(20));
        assert_eq!(cache.stats().invalidations, 1);
    }

    #[test]
    fn test_nested_paths_invalidated_by_head_segment() {
        let cache = FingerprintCache::new(&CacheConfig::default());
        cache.put(1, fields(&["spec.color"]), 10);
        cache.invalidate_fields(&fields(&["spec"]));
        assert_eq!(cache.get(1), None);
    }

    #[test]
    fn test_entries_without_dependencies_always_invalidate() {
        let cache = FingerprintCache::new(&CacheConfig::default());
        cache.put(1, BTreeSet::new(), 10);
        cache.invalidate_fields(&fields(&["anything"]));
        assert_eq!(cache.get(1), None);
    }

    #[test]
    fn test_ttl_expiry() {
        let config = CacheConfig {
            capacity: 4,
            ttl: Duration::from_millis(0),
        };
        let cache = FingerprintCache::new(&config);
        cache.put(1, fields(&["a"]), 1);
        std::thread::sleep(Duration::from_millis(2));
        assert_eq!(cache.get(1), None);
    }

    #[test]
    fn test_capacity_eviction() {
        let config = CacheConfig {
            capacity: 2,
            ttl: Duration::from_secs(60),
        };
        let cache = FingerprintCache::new(&config);
        cache.put(1, fields(&[]), 1);
        cache.put(2, fields(&[]), 2);
        cache.put(3, fields(&[]), 3);
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get(1), None);
    }
}
