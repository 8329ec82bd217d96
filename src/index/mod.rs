// # Secondary Indexes
//
// Ordered and hash indexes over entity fields, owned per collection by an
// `IndexManager` keyed on dotted field paths. Index contents are advisory:
// lookups are always probed against the primary locator map before ids are
// surfaced, and stale entries are purged on write.
//
// Persistence: each index serializes to a `{collection}.{field}.idx`
// sidecar stamped with the heap LSN it reflects. On open a sidecar whose
// LSN trails the heap is discarded and the index is rebuilt from a scan.

pub mod hash;
pub mod ordered;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{DbError, Result};
use crate::index::hash::HashIndex;
use crate::index::ordered::OrderedIndex;
use crate::value::{Entity, Value};
use crate::wal::Lsn;

const INDEX_FILE_MAGIC: u32 = 0x4449_5831; // "DIX1"

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IndexKind {
    Ordered,
    Hash,
}

/// Indexable key with a total order. Numbers are normalized to an
/// order-preserving transform of their f64 bits so integers and floats on
/// the same field sort together.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum IndexKey {
    Null,
    Bool(bool),
    Number(u64),
    String(String),
    Bytes(Vec<u8>),
}

/// Map f64 bits so that unsigned comparison matches numeric order.
fn ordered_f64_bits(f: f64) -> u64 {
    let bits = f.to_bits();
    if bits >> 63 == 1 {
        !bits
    } else {
        bits | (1 << 63)
    }
}

impl IndexKey {
    pub fn from_i64(i: i64) -> Self {
        IndexKey::Number(ordered_f64_bits(i as f64))
    }

    pub fn from_f64(f: f64) -> Self {
        IndexKey::Number(ordered_f64_bits(f))
    }

    /// Key for a field value; lists, maps and custom values are not
    /// indexable.
    pub fn from_value(value: &Value) -> Option<Self> {
        Some(match value {
            Value::Null => IndexKey::Null,
            Value::Bool(b) => IndexKey::Bool(*b),
            Value::Int(i) => IndexKey::from_i64(*i),
            Value::Float(f) => IndexKey::from_f64(*f),
            Value::String(s) => IndexKey::String(s.clone()),
            Value::Bytes(b) => IndexKey::Bytes(b.clone()),
            Value::List(_) | Value::Map(_) | Value::Custom { .. } => return None,
        })
    }
}

/// One secondary index over a single field path. Duplicate keys map to a
/// set of ids. Implementations are internally synchronized.
pub trait FieldIndex: Send + Sync {
    fn kind(&self) -> IndexKind;

    fn insert(&self, key: IndexKey, id: &str);

    fn remove(&self, key: &IndexKey, id: &str);

    fn equals(&self, key: &IndexKey) -> Vec<String>;

    /// Ids for keys in [low, high] with per-bound inclusivity, ascending by
    /// key. Hash indexes refuse.
    fn range(
        &self,
        low: Option<&IndexKey>,
        high: Option<&IndexKey>,
        incl_low: bool,
        incl_high: bool,
    ) -> Result<Vec<String>>;

    fn prefix(&self, prefix: &str) -> Result<Vec<String>>;

    fn keys_in(&self, keys: &[IndexKey]) -> Vec<String>;

    /// Number of distinct keys.
    fn cardinality(&self) -> usize;

    /// Number of (key, id) entries.
    fn total(&self) -> usize;

    fn clear(&self);

    fn snapshot(&self) -> Vec<(IndexKey, Vec<String>)>;

    fn load(&self, entries: Vec<(IndexKey, Vec<String>)>);
}

pub fn make_index(kind: IndexKind) -> Arc<dyn FieldIndex> {
    match kind {
        IndexKind::Ordered => Arc::new(OrderedIndex::new()),
        IndexKind::Hash => Arc::new(HashIndex::new()),
    }
}

#[derive(Serialize, Deserialize)]
struct IndexSnapshotFile {
    magic: u32,
    field: String,
    kind: IndexKind,
    last_applied_lsn: Lsn,
    entries: Vec<(IndexKey, Vec<String>)>,
}

/// Per-collection index registry: `field_path -> index`, sidecar
/// persistence, and (remove old, insert new) maintenance on writes.
pub struct IndexManager {
    dir: PathBuf,
    collection: String,
    indexes: RwLock<HashMap<String, Arc<dyn FieldIndex>>>,
}

impl IndexManager {
    pub fn new(dir: impl Into<PathBuf>, collection: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            collection: collection.into(),
            indexes: RwLock::new(HashMap::new()),
        }
    }

    fn sidecar_path(&self, field: &str) -> PathBuf {
        self.dir.join(format!("{}.{}.idx", self.collection, field))
    }

    /// Register an index on a field path. An existing index of the same
    /// kind is kept; a different kind is replaced (the caller rebuilds).
    pub fn create(&self, field: &str, kind: IndexKind) -> Arc<dyn FieldIndex> {
        let mut indexes = self.indexes.write();
        if let Some(existing) = indexes.get(field) {
            if existing.kind() == kind {
                return Arc::clone(existing);
            }
        }
        let index = make_index(kind);
        indexes.insert(field.to_string(), Arc::clone(&index));
        index
    }

    pub fn drop_index(&self, field: &str) -> Result<()> {
        let removed = self.indexes.write().remove(field);
        if removed.is_none() {
            return Err(DbError::IndexNotFound(field.to_string()));
        }
        let path = self.sidecar_path(field);
        if path.exists() {
            std::fs::remove_file(&path)?;
        }
        Ok(())
    }

    pub fn get(&self, field: &str) -> Option<Arc<dyn FieldIndex>> {
        self.indexes.read().get(field).cloned()
    }

    pub fn specs(&self) -> Vec<(String, IndexKind)> {
        self.indexes
            .read()
            .iter()
            .map(|(f, i)| (f.clone(), i.kind()))
            .collect()
    }

    pub fn fields(&self) -> Vec<String> {
        self.indexes.read().keys().cloned().collect()
    }

    /// Index maintenance for a committed write: remove the old key, insert
    /// the new one, per indexed field. Writes purge stale entries as a side
    /// effect: a delete's old key is removed even if reads tolerated it.
    pub fn apply(&self, id: &str, old: Option<&Entity>, new: Option<&Entity>) {
        let indexes = self.indexes.read();
        for (field, index) in indexes.iter() {
            let old_key = old.and_then(|e| e.field(field)).and_then(IndexKey::from_value);
            let new_key = new.and_then(|e| e.field(field)).and_then(IndexKey::from_value);
            if old_key == new_key {
                continue;
            }
            if let Some(key) = old_key {
                index.remove(&key, id);
            }
            if let Some(key) = new_key {
                index.insert(key, id);
            }
        }
    }

    /// Write every index to its sidecar, stamped with the heap LSN.
    pub fn persist(&self, last_applied_lsn: Lsn) -> Result<()> {
        let indexes = self.indexes.read();
        for (field, index) in indexes.iter() {
            let file = IndexSnapshotFile {
                magic: INDEX_FILE_MAGIC,
                field: field.clone(),
                kind: index.kind(),
                last_applied_lsn,
                entries: index.snapshot(),
            };
            let bytes = bincode::serde::encode_to_vec(&file, bincode::config::standard())?;
            std::fs::write(self.sidecar_path(field), bytes)?;
        }
        Ok(())
    }

    /// Instantiate registered indexes from their sidecars. Returns the
    /// fields whose sidecar was missing, unreadable or stale; the caller
    /// rebuilds those from the heap.
    pub fn load(&self, specs: &[(String, IndexKind)], heap_lsn: Lsn) -> Vec<String> {
        let mut needs_rebuild = Vec::new();
        for (field, kind) in specs {
            let index = self.create(field, *kind);
            match self.read_sidecar(field, *kind, heap_lsn) {
                Ok(entries) => index.load(entries),
                Err(reason) => {
                    debug!(
                        collection = %self.collection,
                        field = %field,
                        %reason,
                        "index sidecar unusable; scheduling rebuild"
                    );
                    needs_rebuild.push(field.clone());
                }
            }
        }
        needs_rebuild
    }

    fn read_sidecar(
        &self,
        field: &str,
        kind: IndexKind,
        heap_lsn: Lsn,
    ) -> std::result::Result<Vec<(IndexKey, Vec<String>)>, String> {
        let path = self.sidecar_path(field);
        let bytes = std::fs::read(&path).map_err(|e| format!("read failed: {e}"))?;
        let (file, _): (IndexSnapshotFile, usize) =
            bincode::serde::decode_from_slice(&bytes, bincode::config::standard())
                .map_err(|e| format!("decode failed: {e}"))?;
        if file.magic != INDEX_FILE_MAGIC {
            return Err("bad magic".to_string());
        }
        if file.kind != kind || file.field != field {
            return Err("kind or field mismatch".to_string());
        }
        if file.last_applied_lsn != heap_lsn {
            return Err(format!(
                "stale: sidecar lsn {} vs heap lsn {heap_lsn}",
                file.last_applied_lsn
            ));
        }
        Ok(file.entries)
    }

}

impl std::fmt::Debug for IndexManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexManager")
            .field("collection", &self.collection)
            .field("fields", &self.fields())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    #[test]
    fn test_index_key_numeric_normalization() {
        assert_eq!(IndexKey::from_i64(3), IndexKey::from_f64(3.0));
        assert!(IndexKey::from_i64(-5) < IndexKey::from_i64(2));
        assert!(IndexKey::from_f64(2.5) < IndexKey::from_i64(3));
    }

    #[test]
    fn test_apply_moves_entries_between_keys() {
        let dir = tempdir().unwrap();
        let mgr = IndexManager::new(dir.path(), "items");
        mgr.create("price", IndexKind::Ordered);

        let old = Entity::from_json(json!({"id": "a", "price": 5})).unwrap();
        let new = Entity::from_json(json!({"id": "a", "price": 9})).unwrap();

        mgr.apply("a", None, Some(&old));
        assert_eq!(mgr.get("price").unwrap().equals(&IndexKey::from_i64(5)), vec!["a"]);

        mgr.apply("a", Some(&old), Some(&new));
        assert!(mgr.get("price").unwrap().equals(&IndexKey::from_i64(5)).is_empty());
        assert_eq!(mgr.get("price").unwrap().equals(&IndexKey::from_i64(9)), vec!["a"]);

        mgr.apply("a", Some(&new), None);
        assert_eq!(mgr.get("price").unwrap().total(), 0);
    }

    #[test]
    fn test_nested_field_path_indexing() {
        let dir = tempdir().unwrap();
        let mgr = IndexManager::new(dir.path(), "items");
        mgr.create("spec.color", IndexKind::Hash);

        let e = Entity::from_json(json!({"id": "a", "spec": {"color": "red"}})).unwrap();
        mgr.apply("a", None, Some(&e));
        assert_eq!(
            mgr.get("spec.color")
                .unwrap()
                .equals(&IndexKey::String("red".to_string())),
            vec!["a"]
        );
    }

    #[test]
    fn test_persist_and_load_fresh_sidecar() {
        let dir = tempdir().unwrap();
        let mgr = IndexManager::new(dir.path(), "items");
        mgr.create("price", IndexKind::Ordered);
        let e = Entity::from_json(json!({"id": "a", "price": 5})).unwrap();
        mgr.apply("a", None, Some(&e));
        mgr.persist(17).unwrap();

        let fresh = IndexManager::new(dir.path(), "items");
        let rebuilds = fresh.load(&[("price".to_string(), IndexKind::Ordered)], 17);
        assert!(rebuilds.is_empty());
        assert_eq!(fresh.get("price").unwrap().total(), 1);
    }

    #[test]
    fn test_stale_sidecar_requests_rebuild() {
        let dir = tempdir().unwrap();
        let mgr = IndexManager::new(dir.path(), "items");
        mgr.create("price", IndexKind::Ordered);
        mgr.persist(5).unwrap();

        let fresh = IndexManager::new(dir.path(), "items");
        let rebuilds = fresh.load(&[("price".to_string(), IndexKind::Ordered)], 9);
        assert_eq!(rebuilds, vec!["price".to_string()]);
    }

    #[test]
    fn test_drop_index_removes_sidecar() {
        let dir = tempdir().unwrap();
        let mgr = IndexManager::new(dir.path(), "items");
        mgr.create("price", IndexKind::Ordered);
        mgr.persist(1).unwrap();

        let path = dir.path().join("items.price.idx");
        assert!(path.exists());
        mgr.drop_index("price").unwrap();
        assert!(!path.exists());
        assert!(matches!(
            mgr.drop_index("price"),
            Err(DbError::IndexNotFound(_))
        ));
    }
}
