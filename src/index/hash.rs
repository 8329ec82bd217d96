// # Hash Index
//
// Bucketed equality-only index: keys land in `hash(key) mod bucket_count`
// buckets, each bucket chaining its keys in a map. O(1) expected lookup,
// no ordered iteration.

use std::collections::hash_map::DefaultHasher;
use std::collections::{BTreeSet, HashMap};
use std::hash::{Hash, Hasher};

use parking_lot::RwLock;

use crate::error::{DbError, Result};
use crate::index::{FieldIndex, IndexKey, IndexKind};

const DEFAULT_BUCKET_COUNT: usize = 64;

pub struct HashIndex {
    buckets: Vec<RwLock<HashMap<IndexKey, BTreeSet<String>>>>,
}

impl HashIndex {
    pub fn new() -> Self {
        Self::with_buckets(DEFAULT_BUCKET_COUNT)
    }

    pub fn with_buckets(bucket_count: usize) -> Self {
        assert!(bucket_count > 0);
        Self {
            buckets: (0..bucket_count).map(|_| RwLock::new(HashMap::new())).collect(),
        }
    }

    fn bucket_of(&self, key: &IndexKey) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() as usize) % self.buckets.len()
    }
}

impl Default for HashIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl FieldIndex for HashIndex {
    fn kind(&self) -> IndexKind {
        IndexKind::Hash
    }

    fn insert(&self, key: IndexKey, id: &str) {
        let bucket = self.bucket_of(&key);
        self.buckets[bucket]
            .write()
            .entry(key)
            .or_default()
            .insert(id.to_string());
    }

    fn remove(&self, key: &IndexKey, id: &str) {
        let bucket = self.bucket_of(key);
        let mut chain = self.buckets[bucket].write();
        if let Some(ids) = chain.get_mut(key) {
            ids.remove(id);
            if ids.is_empty() {
                chain.remove(key);
            }
        }
    }

    fn equals(&self, key: &IndexKey) -> Vec<String> {
        let bucket = self.bucket_of(key);
        self.buckets[bucket]
            .read()
            .get(key)
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn range(
        &self,
        _low: Option<&IndexKey>,
        _high: Option<&IndexKey>,
        _incl_low: bool,
        _incl_high: bool,
    ) -> Result<Vec<String>> {
        Err(DbError::InvalidOperation(
            "hash index does not support range scans".to_string(),
        ))
    }

    fn prefix(&self, _prefix: &str) -> Result<Vec<String>> {
        Err(DbError::InvalidOperation(
            "hash index does not support prefix scans".to_string(),
        ))
    }

    fn keys_in(&self, keys: &[IndexKey]) -> Vec<String> {
        let mut out = BTreeSet::new();
        for key in keys {
            out.extend(self.equals(key));
        }
        out.into_iter().collect()
    }

    fn cardinality(&self) -> usize {
        self.buckets.iter().map(|b| b.read().len()).sum()
    }

    fn total(&self) -> usize {
        self.buckets
            .iter()
            .map(|b| b.read().values().map(BTreeSet::len).sum::<usize>())
            .sum()
    }

    fn clear(&self) {
        for bucket in &self.buckets {
            bucket.write().clear();
        }
    }

    fn snapshot(&self) -> Vec<(IndexKey, Vec<String>)> {
        let mut out = Vec::new();
        for bucket in &self.buckets {
            for (key, ids) in bucket.read().iter() {
                out.push((key.clone(), ids.iter().cloned().collect()));
            }
        }
        out.sort_by(|(a, _), (b, _)| a.cmp(b));
        out
    }

    fn load(&self, entries: Vec<(IndexKey, Vec<String>)>) {
        self.clear();
        for (key, ids) in entries {
            for id in ids {
                self.insert(key.clone(), &id);
            }
        }
    }
}

impl std::fmt::Debug for HashIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HashIndex")
            .field("buckets", &self.buckets.len())
            .field("cardinality", &self.cardinality())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_equals_lookup() {
        let index = HashIndex::new();
        index.insert(IndexKey::String("x".to_string()), "1");
        index.insert(IndexKey::String("x".to_string()), "2");
        index.insert(IndexKey::String("y".to_string()), "3");

        let mut ids = index.equals(&IndexKey::String("x".to_string()));
        ids.sort();
        assert_eq!(ids, vec!["1", "2"]);
        assert_eq!(index.cardinality(), 2);
        assert_eq!(index.total(), 3);
    }

    #[test]
    fn test_range_is_rejected() {
        let index = HashIndex::new();
        assert!(index.range(None, None, true, true).is_err());
    }

    #[test]
    fn test_remove() {
        let index = HashIndex::new();
        index.insert(IndexKey::from_i64(1), "a");
        index.remove(&IndexKey::from_i64(1), "a");
        assert!(index.equals(&IndexKey::from_i64(1)).is_empty());
        assert_eq!(index.cardinality(), 0);
    }

    #[test]
    fn test_many_keys_spread_over_buckets() {
        let index = HashIndex::with_buckets(8);
        for i in 0..200 {
            index.insert(IndexKey::from_i64(i), &format!("id{i}"));
        }
        assert_eq!(index.total(), 200);
        assert_eq!(index.equals(&IndexKey::from_i64(77)), vec!["id77"]);
    }

    #[test]
    fn test_snapshot_load_round_trip() {
        let index = HashIndex::new();
        index.insert(IndexKey::from_i64(1), "a");
        index.insert(IndexKey::from_i64(2), "b");

        let fresh = HashIndex::new();
        fresh.load(index.snapshot());
        assert_eq!(fresh.equals(&IndexKey::from_i64(2)), vec!["b"]);
        assert_eq!(fresh.total(), 2);
    }
}
