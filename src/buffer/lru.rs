// # LRU Cache
//
// Generic access-ordered bounded map. Recency lives in a vector with the
// most recently used key at the front; eviction pops from the back. An
// optional callback observes entries removed by capacity pressure or by the
// evict_* operations, but not by plain `remove`.
//
// Not thread-safe; callers serialize access.

use std::collections::HashMap;
use std::hash::Hash;

type EvictCallback<K, V> = Box<dyn FnMut(&K, &V) + Send>;

pub struct LruCache<K: Eq + Hash + Clone, V> {
    capacity: usize,
    map: HashMap<K, V>,
    order: Vec<K>,
    on_evict: Option<EvictCallback<K, V>>,
}

impl<K: Eq + Hash + Clone, V> LruCache<K, V> {
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "LRU capacity must be positive");
        Self {
            capacity,
            map: HashMap::with_capacity(capacity.min(1024)),
            order: Vec::new(),
            on_evict: None,
        }
    }

    pub fn with_on_evict(capacity: usize, on_evict: EvictCallback<K, V>) -> Self {
        let mut cache = Self::new(capacity);
        cache.on_evict = Some(on_evict);
        cache
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn contains(&self, key: &K) -> bool {
        self.map.contains_key(key)
    }

    fn touch(&mut self, key: &K) {
        self.order.retain(|k| k != key);
        self.order.insert(0, key.clone());
    }

    /// Look up a value and mark it most recently used.
    pub fn get(&mut self, key: &K) -> Option<&V> {
        if !self.map.contains_key(key) {
            return None;
        }
        self.touch(key);
        self.map.get(key)
    }

    /// Look up a value mutably and mark it most recently used.
    pub fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        if !self.map.contains_key(key) {
            return None;
        }
        self.touch(key);
        self.map.get_mut(key)
    }

    /// Look up a value without disturbing the recency order.
    pub fn peek(&self, key: &K) -> Option<&V> {
        self.map.get(key)
    }

    pub fn peek_mut(&mut self, key: &K) -> Option<&mut V> {
        self.map.get_mut(key)
    }

    /// Insert or update. A new key at capacity evicts the least recently
    /// used entry first. Returns the previous value on update.
    pub fn put(&mut self, key: K, value: V) -> Option<V> {
        if self.map.contains_key(&key) {
            self.touch(&key);
            return self.map.insert(key, value);
        }
        if self.map.len() >= self.capacity {
            self.evict_lru();
        }
        self.order.insert(0, key.clone());
        self.map.insert(key, value);
        None
    }

    /// Remove an entry without invoking the eviction callback.
    pub fn remove(&mut self, key: &K) -> Option<V> {
        let value = self.map.remove(key)?;
        self.order.retain(|k| k != key);
        Some(value)
    }

    /// Evict the least recently used entry, invoking the callback.
    pub fn evict_lru(&mut self) -> Option<(K, V)> {
        let key = self.order.pop()?;
        let value = self.map.remove(&key)?;
        if let Some(cb) = &mut self.on_evict {
            cb(&key, &value);
        }
        Some((key, value))
    }

    /// Evict LRU entries until at most `target_len` remain.
    pub fn evict_until(&mut self, target_len: usize) {
        while self.map.len() > target_len {
            if self.evict_lru().is_none() {
                break;
            }
        }
    }

    /// Visit every entry, most recently used first.
    pub fn for_each(&self, mut f: impl FnMut(&K, &V)) {
        for key in &self.order {
            if let Some(value) = self.map.get(key) {
                f(key, value);
            }
        }
    }

    /// Keys matching a predicate, least recently used first.
    pub fn keys_where(&self, mut pred: impl FnMut(&K, &V) -> bool) -> Vec<K> {
        self.order
            .iter()
            .rev()
            .filter(|k| self.map.get(k).map(|v| pred(k, v)).unwrap_or(false))
            .cloned()
            .collect()
    }

    pub fn clear(&mut self) {
        self.map.clear();
        self.order.clear();
    }
}

impl<K: Eq + Hash + Clone + std::fmt::Debug, V> std::fmt::Debug for LruCache<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LruCache")
            .field("capacity", &self.capacity)
            .field("len", &self.map.len())
            .field("order", &self.order)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_put_get_and_order() {
        let mut cache = LruCache::new(2);
        cache.put("a", 1);
        cache.put("b", 2);
        assert_eq!(cache.get(&"a"), Some(&1));

        // "b" is now LRU and gets evicted.
        cache.put("c", 3);
        assert!(!cache.contains(&"b"));
        assert!(cache.contains(&"a"));
        assert!(cache.contains(&"c"));
    }

    #[test]
    fn test_peek_does_not_touch() {
        let mut cache = LruCache::new(2);
        cache.put("a", 1);
        cache.put("b", 2);
        assert_eq!(cache.peek(&"a"), Some(&1));

        // "a" stays LRU despite the peek.
        cache.put("c", 3);
        assert!(!cache.contains(&"a"));
    }

    #[test]
    fn test_update_does_not_evict() {
        let mut cache = LruCache::new(2);
        cache.put("a", 1);
        cache.put("b", 2);
        assert_eq!(cache.put("a", 10), Some(1));
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get(&"a"), Some(&10));
    }

    #[test]
    fn test_on_evict_callback() {
        let evicted = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&evicted);
        let mut cache: LruCache<&str, i32> =
            LruCache::with_on_evict(2, Box::new(move |_, _| {
                counter.fetch_add(1, Ordering::SeqCst);
            }));

        cache.put("a", 1);
        cache.put("b", 2);
        cache.put("c", 3); // capacity eviction
        assert_eq!(evicted.load(Ordering::SeqCst), 1);

        cache.remove(&"b"); // plain remove: no callback
        assert_eq!(evicted.load(Ordering::SeqCst), 1);

        cache.evict_lru(); // explicit eviction
        assert_eq!(evicted.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_evict_until() {
        let mut cache = LruCache::new(8);
        for i in 0..8 {
            cache.put(i, i);
        }
        cache.evict_until(3);
        assert_eq!(cache.len(), 3);
        // Most recent survive.
        assert!(cache.contains(&7) && cache.contains(&6) && cache.contains(&5));
    }

    #[test]
    fn test_for_each_visits_mru_first() {
        let mut cache = LruCache::new(4);
        cache.put("a", 1);
        cache.put("b", 2);
        cache.get(&"a");

        let mut seen = Vec::new();
        cache.for_each(|k, v| seen.push((*k, *v)));
        assert_eq!(seen, vec![("a", 1), ("b", 2)]);
    }

    #[test]
    fn test_keys_where_lru_first() {
        let mut cache = LruCache::new(4);
        for i in 0..4 {
            cache.put(i, i * 10);
        }
        cache.get(&0); // 0 becomes MRU
        let evens = cache.keys_where(|k, _| k % 2 == 0);
        assert_eq!(evens, vec![2, 0]);
    }
}
