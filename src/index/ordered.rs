// # Ordered Index
//
// In-memory sorted multimap (key -> set of entity ids) with range scans in
// ascending key order. Persisted as a compact snapshot by the index
// manager; reconstructed wholesale on load.

use std::collections::{BTreeMap, BTreeSet};
use std::ops::Bound;

use parking_lot::RwLock;

use crate::error::Result;
use crate::index::{FieldIndex, IndexKey, IndexKind};

#[derive(Default)]
pub struct OrderedIndex {
    map: RwLock<BTreeMap<IndexKey, BTreeSet<String>>>,
}

impl OrderedIndex {
    pub fn new() -> Self {
        Self::default()
    }
}

impl FieldIndex for OrderedIndex {
    fn kind(&self) -> IndexKind {
        IndexKind::Ordered
    }

    fn insert(&self, key: IndexKey, id: &str) {
        self.map
            .write()
            .entry(key)
            .or_default()
            .insert(id.to_string());
    }

    fn remove(&self, key: &IndexKey, id: &str) {
        let mut map = self.map.write();
        if let Some(ids) = map.get_mut(key) {
            ids.remove(id);
            if ids.is_empty() {
                map.remove(key);
            }
        }
    }

    fn equals(&self, key: &IndexKey) -> Vec<String> {
        self.map
            .read()
            .get(key)
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn range(
        &self,
        low: Option<&IndexKey>,
        high: Option<&IndexKey>,
        incl_low: bool,
        incl_high: bool,
    ) -> Result<Vec<String>> {
        let lower = match low {
            Some(k) if incl_low => Bound::Included(k.clone()),
            Some(k) => Bound::Excluded(k.clone()),
            None => Bound::Unbounded,
        };
        let upper = match high {
            Some(k) if incl_high => Bound::Included(k.clone()),
            Some(k) => Bound::Excluded(k.clone()),
            None => Bound::Unbounded,
        };

        let map = self.map.read();
        let mut out = Vec::new();
        for (_, ids) in map.range((lower, upper)) {
            out.extend(ids.iter().cloned());
        }
        Ok(out)
    }

    fn prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let start = IndexKey::String(prefix.to_string());
        let map = self.map.read();
        let mut out = Vec::new();
        for (key, ids) in map.range(start..) {
            match key {
                IndexKey::String(s) if s.starts_with(prefix) => {
                    out.extend(ids.iter().cloned());
                }
                // Keys are sorted; the first non-matching string ends the
                // scan.
                _ => break,
            }
        }
        Ok(out)
    }

    fn keys_in(&self, keys: &[IndexKey]) -> Vec<String> {
        let map = self.map.read();
        let mut out = BTreeSet::new();
        for key in keys {
            if let Some(ids) = map.get(key) {
                out.extend(ids.iter().cloned());
            }
        }
        out.into_iter().collect()
    }

    fn cardinality(&self) -> usize {
        self.map.read().len()
    }

    fn total(&self) -> usize {
        self.map.read().values().map(BTreeSet::len).sum()
    }

    fn clear(&self) {
        self.map.write().clear();
    }

    fn snapshot(&self) -> Vec<(IndexKey, Vec<String>)> {
        self.map
            .read()
            .iter()
            .map(|(k, ids)| (k.clone(), ids.iter().cloned().collect()))
            .collect()
    }

    fn load(&self, entries: Vec<(IndexKey, Vec<String>)>) {
        let mut map = self.map.write();
        map.clear();
        for (key, ids) in entries {
            map.insert(key, ids.into_iter().collect());
        }
    }
}

impl std::fmt::Debug for OrderedIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrderedIndex")
            .field("cardinality", &self.cardinality())
            .field("total", &self.total())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn index_with(values: &[(i64, &str)]) -> OrderedIndex {
        let index = OrderedIndex::new();
        for (n, id) in values {
            index.insert(IndexKey::from_i64(*n), id);
        }
        index
    }

    #[test]
    fn test_equals_and_duplicates() {
        let index = index_with(&[(5, "a"), (5, "b"), (7, "c")]);
        let mut ids = index.equals(&IndexKey::from_i64(5));
        ids.sort();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(index.cardinality(), 2);
        assert_eq!(index.total(), 3);
    }

    #[test]
    fn test_range_ascending_with_bounds() {
        let index = index_with(&[(5, "a"), (10, "b"), (15, "c"), (20, "d"), (25, "e")]);
        let ids = index
            .range(
                Some(&IndexKey::from_i64(10)),
                Some(&IndexKey::from_i64(20)),
                false,
                true,
            )
            .unwrap();
        assert_eq!(ids, vec!["c", "d"]);
    }

    #[test]
    fn test_unbounded_range() {
        let index = index_with(&[(1, "a"), (2, "b"), (3, "c")]);
        let ids = index
            .range(Some(&IndexKey::from_i64(2)), None, true, true)
            .unwrap();
        assert_eq!(ids, vec!["b", "c"]);
    }

    #[test]
    fn test_remove_drops_empty_keys() {
        let index = index_with(&[(5, "a")]);
        index.remove(&IndexKey::from_i64(5), "a");
        assert_eq!(index.cardinality(), 0);
        assert!(index.equals(&IndexKey::from_i64(5)).is_empty());
    }

    #[test]
    fn test_prefix_scan() {
        let index = OrderedIndex::new();
        for (name, id) in [("apple", "1"), ("applet", "2"), ("banana", "3")] {
            index.insert(IndexKey::String(name.to_string()), id);
        }
        let ids = index.prefix("app").unwrap();
        assert_eq!(ids, vec!["1", "2"]);
    }

    #[test]
    fn test_float_ordering_across_signs() {
        let index = OrderedIndex::new();
        for (v, id) in [(-2.5, "neg"), (0.0, "zero"), (3.5, "pos")] {
            index.insert(IndexKey::from_f64(v), id);
        }
        let ids = index
            .range(Some(&IndexKey::from_f64(-10.0)), None, true, true)
            .unwrap();
        assert_eq!(ids, vec!["neg", "zero", "pos"]);
    }

    #[test]
    fn test_snapshot_load_round_trip() {
        let index = index_with(&[(5, "a"), (10, "b")]);
        let snap = index.snapshot();

        let fresh = OrderedIndex::new();
        fresh.load(snap);
        assert_eq!(fresh.total(), 2);
        assert_eq!(fresh.equals(&IndexKey::from_i64(10)), vec!["b"]);
    }
}
