// Transaction manager: id assignment and lifecycle bookkeeping.
//
// The manager owns the table of active transactions and the global
// commit-serialization mutex. The commit pipeline itself lives with the
// database, which can reach the collections a write set touches; the
// manager only hands out transactions and retires them.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::error::{DbError, Result};
use crate::transaction::types::{IsolationLevel, Transaction};
use crate::wal::TxnId;

pub struct TransactionManager {
    next_txn_id: AtomicU64,
    active: RwLock<HashMap<TxnId, Arc<Mutex<Transaction>>>>,
    commit_lock: Mutex<()>,
    default_isolation: IsolationLevel,
}

impl TransactionManager {
    pub fn new(default_isolation: IsolationLevel) -> Self {
        Self {
            next_txn_id: AtomicU64::new(1),
            active: RwLock::new(HashMap::new()),
            commit_lock: Mutex::new(()),
            default_isolation,
        }
    }

    pub fn default_isolation(&self) -> IsolationLevel {
        self.default_isolation
    }

    /// Start a transaction; ids are monotonically increasing.
    pub fn begin(&self, isolation: Option<IsolationLevel>) -> TxnId {
        let id = self.next_txn_id.fetch_add(1, Ordering::SeqCst);
        let txn = Transaction::new(id, isolation.unwrap_or(self.default_isolation));
        self.active.write().insert(id, Arc::new(Mutex::new(txn)));
        id
    }

    pub fn get(&self, txn_id: TxnId) -> Result<Arc<Mutex<Transaction>>> {
        self.active
            .read()
            .get(&txn_id)
            .cloned()
            .ok_or(DbError::TransactionNotFound(txn_id))
    }

    /// Retire a transaction after its terminal transition.
    pub fn retire(&self, txn_id: TxnId) {
        if let Some(txn) = self.active.write().remove(&txn_id) {
            txn.lock().clear();
        }
    }

    /// The commit-serialization mutex; held only for the commit sequence.
    pub fn commit_lock(&self) -> &Mutex<()> {
        &self.commit_lock
    }

    pub fn is_active(&self, txn_id: TxnId) -> bool {
        self.active.read().contains_key(&txn_id)
    }

    pub fn active_count(&self) -> usize {
        self.active.read().len()
    }

    pub fn active_ids(&self) -> Vec<TxnId> {
        let mut ids: Vec<_> = self.active.read().keys().copied().collect();
        ids.sort_unstable();
        ids
    }
}

impl std::fmt::Debug for TransactionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionManager")
            .field("active_count", &self.active_count())
            .field("default_isolation", &self.default_isolation)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_begin_assigns_monotonic_ids() {
        let tm = TransactionManager::new(IsolationLevel::ReadCommitted);
        let a = tm.begin(None);
        let b = tm.begin(Some(IsolationLevel::Serializable));
        assert!(b > a);
        assert_eq!(tm.active_count(), 2);
    }

    #[test]
    fn test_isolation_defaults_and_overrides() {
        let tm = TransactionManager::new(IsolationLevel::RepeatableRead);
        let a = tm.begin(None);
        let b = tm.begin(Some(IsolationLevel::ReadUncommitted));
        assert_eq!(
            tm.get(a).unwrap().lock().isolation,
            IsolationLevel::RepeatableRead
        );
        assert_eq!(
            tm.get(b).unwrap().lock().isolation,
            IsolationLevel::ReadUncommitted
        );
    }

    #[test]
    fn test_retire_removes_transaction() {
        let tm = TransactionManager::new(IsolationLevel::ReadCommitted);
        let id = tm.begin(None);
        assert!(tm.is_active(id));
        tm.retire(id);
        assert!(!tm.is_active(id));
        assert!(matches!(
            tm.get(id),
            Err(DbError::TransactionNotFound(_))
        ));
    }
}
