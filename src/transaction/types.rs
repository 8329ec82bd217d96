// Core transaction types.
//
// A transaction stages every write in its write set; the heap is untouched
// until commit. Reads record what each isolation level needs: a snapshot of
// first reads for RepeatableRead and stronger, plus the observed version of
// every read for Serializable's commit-time validation.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::value::Entity;
use crate::wal::TxnId;

/// Isolation level, weakest to strongest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum IsolationLevel {
    /// Reads see the current base state without snapshotting.
    ReadUncommitted,
    /// Only committed data is visible. Staged writes of other transactions
    /// never reach the heap, so this is the natural behavior of reads.
    #[default]
    ReadCommitted,
    /// First read of an entity is snapshotted; repeats return the snapshot.
    RepeatableRead,
    /// RepeatableRead plus commit-time read-set validation.
    Serializable,
}

impl fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IsolationLevel::ReadUncommitted => write!(f, "READ UNCOMMITTED"),
            IsolationLevel::ReadCommitted => write!(f, "READ COMMITTED"),
            IsolationLevel::RepeatableRead => write!(f, "REPEATABLE READ"),
            IsolationLevel::Serializable => write!(f, "SERIALIZABLE"),
        }
    }
}

/// Transaction lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Active,
    Committing,
    Committed,
    Aborted,
}

impl TransactionState {
    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(self, TransactionState::Committed | TransactionState::Aborted)
    }
}

/// A staged write. `record` carries the encoded post-image exactly as the
/// heap and the WAL will store it.
#[derive(Debug, Clone)]
pub enum WriteOp {
    Insert {
        collection: String,
        id: String,
        entity: Entity,
        record: Vec<u8>,
    },
    Update {
        collection: String,
        id: String,
        expected_version: u64,
        entity: Entity,
        record: Vec<u8>,
    },
    Delete {
        collection: String,
        id: String,
    },
}

impl WriteOp {
    pub fn collection(&self) -> &str {
        match self {
            WriteOp::Insert { collection, .. }
            | WriteOp::Update { collection, .. }
            | WriteOp::Delete { collection, .. } => collection,
        }
    }

    pub fn id(&self) -> &str {
        match self {
            WriteOp::Insert { id, .. } | WriteOp::Update { id, .. } | WriteOp::Delete { id, .. } => {
                id
            }
        }
    }
}

/// In-memory transaction state. Owned by the transaction manager; accessed
/// under its per-transaction mutex.
#[derive(Debug)]
pub struct Transaction {
    pub id: TxnId,
    pub isolation: IsolationLevel,
    pub state: TransactionState,
    /// Set once the BEGIN record has been appended to the WAL.
    pub wal_begun: bool,
    /// (collection, id) -> version observed on first read (Serializable).
    read_versions: HashMap<(String, String), u64>,
    /// (collection, id) -> entity (or absence) captured on first read
    /// (RepeatableRead and Serializable).
    snapshot: HashMap<(String, String), Option<Entity>>,
    /// Staged writes in program order.
    write_set: Vec<WriteOp>,
}

impl Transaction {
    pub fn new(id: TxnId, isolation: IsolationLevel) -> Self {
        Self {
            id,
            isolation,
            state: TransactionState::Active,
            wal_begun: false,
            read_versions: HashMap::new(),
            snapshot: HashMap::new(),
            write_set: Vec::new(),
        }
    }

    pub fn is_active(&self) -> bool {
        self.state == TransactionState::Active
    }

    pub fn stage(&mut self, op: WriteOp) {
        self.write_set.push(op);
    }

    pub fn write_set(&self) -> &[WriteOp] {
        &self.write_set
    }

    pub fn take_write_set(&mut self) -> Vec<WriteOp> {
        std::mem::take(&mut self.write_set)
    }

    /// Latest staged state of an entity within this transaction:
    /// `Some(Some(_))` written, `Some(None)` deleted, `None` untouched.
    pub fn own_write(&self, collection: &str, id: &str) -> Option<Option<Entity>> {
        self.write_set
            .iter()
            .rev()
            .find(|op| op.collection() == collection && op.id() == id)
            .map(|op| match op {
                WriteOp::Insert { entity, .. } | WriteOp::Update { entity, .. } => {
                    Some(entity.clone())
                }
                WriteOp::Delete { .. } => None,
            })
    }

    /// Record the version seen by a read (Serializable only). The first
    /// observation wins; later reads of the same entity are already pinned
    /// by the snapshot.
    pub fn record_read(&mut self, collection: &str, id: &str, version: u64) {
        if self.isolation != IsolationLevel::Serializable {
            return;
        }
        self.read_versions
            .entry((collection.to_string(), id.to_string()))
            .or_insert(version);
    }

    pub fn read_versions(&self) -> impl Iterator<Item = (&(String, String), &u64)> {
        self.read_versions.iter()
    }

    pub fn snapshot_get(&self, collection: &str, id: &str) -> Option<&Option<Entity>> {
        self.snapshot
            .get(&(collection.to_string(), id.to_string()))
    }

    pub fn snapshot_put(&mut self, collection: &str, id: &str, entity: Option<Entity>) {
        self.snapshot
            .entry((collection.to_string(), id.to_string()))
            .or_insert(entity);
    }

    pub fn uses_snapshot(&self) -> bool {
        matches!(
            self.isolation,
            IsolationLevel::RepeatableRead | IsolationLevel::Serializable
        )
    }

    /// Release per-transaction memory on terminal transition.
    pub fn clear(&mut self) {
        self.read_versions.clear();
        self.snapshot.clear();
        self.write_set.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn entity(id: &str) -> Entity {
        Entity::from_json(json!({"id": id, "n": 1})).unwrap()
    }

    #[test]
    fn test_own_write_overlay() {
        let mut txn = Transaction::new(1, IsolationLevel::ReadCommitted);
        assert!(txn.own_write("c", "a").is_none());

        txn.stage(WriteOp::Insert {
            collection: "c".to_string(),
            id: "a".to_string(),
            entity: entity("a"),
            record: vec![],
        });
        assert!(matches!(txn.own_write("c", "a"), Some(Some(_))));

        txn.stage(WriteOp::Delete {
            collection: "c".to_string(),
            id: "a".to_string(),
        });
        assert!(matches!(txn.own_write("c", "a"), Some(None)));
    }

    #[test]
    fn test_read_versions_only_for_serializable() {
        let mut rc = Transaction::new(1, IsolationLevel::ReadCommitted);
        rc.record_read("c", "a", 3);
        assert_eq!(rc.read_versions().count(), 0);

        let mut ser = Transaction::new(2, IsolationLevel::Serializable);
        ser.record_read("c", "a", 3);
        ser.record_read("c", "a", 9); // first observation wins
        let versions: Vec<_> = ser.read_versions().collect();
        assert_eq!(versions.len(), 1);
        assert_eq!(*versions[0].1, 3);
    }

    #[test]
    fn test_snapshot_first_read_wins() {
        let mut txn = Transaction::new(1, IsolationLevel::RepeatableRead);
        txn.snapshot_put("c", "a", Some(entity("a")));
        txn.snapshot_put("c", "a", None);
        assert!(matches!(txn.snapshot_get("c", "a"), Some(Some(_))));
    }
}
