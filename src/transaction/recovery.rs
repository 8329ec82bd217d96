// Redo planning for crash recovery.
//
// Two passes over the verified WAL entries past the latest checkpoint:
// the first collects the transactions that reached COMMIT, the second
// yields their operations in log order. Uncommitted and rolled-back
// transactions contribute nothing. The plan is pure data; the database
// applies it idempotently against each collection's heap and locator map.

use std::collections::HashSet;

use crate::wal::{Lsn, TxnId, WalEntry, WalRecord};

#[derive(Debug, Clone, PartialEq)]
pub enum RedoKind {
    /// Insert or update: apply the post-image bytes wholesale.
    Upsert(Vec<u8>),
    Delete,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RedoOp {
    pub lsn: Lsn,
    pub txn_id: TxnId,
    pub collection: String,
    pub id: String,
    pub kind: RedoKind,
}

#[derive(Debug, Default)]
pub struct RedoPlan {
    pub committed: HashSet<TxnId>,
    pub ops: Vec<RedoOp>,
    /// LSN of the checkpoint the scan started from, if any.
    pub checkpoint_lsn: Option<Lsn>,
    /// Highest LSN seen in the log.
    pub last_lsn: Lsn,
}

/// Build the redo plan from the full verified log.
pub fn plan_redo(entries: &[WalEntry]) -> RedoPlan {
    let mut plan = RedoPlan::default();
    plan.last_lsn = entries.last().map(|e| e.lsn).unwrap_or(0);

    // Scan starts at the latest checkpoint; everything before it is
    // already durable in the heap files.
    let start = entries
        .iter()
        .rposition(|e| matches!(e.record, WalRecord::Checkpoint { .. }))
        .map(|i| {
            plan.checkpoint_lsn = Some(entries[i].lsn);
            i + 1
        })
        .unwrap_or(0);
    let tail = &entries[start..];

    for entry in tail {
        match entry.record {
            WalRecord::Commit => {
                plan.committed.insert(entry.txn_id);
            }
            WalRecord::Rollback => {
                plan.committed.remove(&entry.txn_id);
            }
            _ => {}
        }
    }

    for entry in tail {
        if !plan.committed.contains(&entry.txn_id) {
            continue;
        }
        match &entry.record {
            WalRecord::Insert {
                collection,
                id,
                record,
            }
            | WalRecord::Update {
                collection,
                id,
                record,
                ..
            } => plan.ops.push(RedoOp {
                lsn: entry.lsn,
                txn_id: entry.txn_id,
                collection: collection.clone(),
                id: id.clone(),
                kind: RedoKind::Upsert(record.clone()),
            }),
            WalRecord::Delete { collection, id } => plan.ops.push(RedoOp {
                lsn: entry.lsn,
                txn_id: entry.txn_id,
                collection: collection.clone(),
                id: id.clone(),
                kind: RedoKind::Delete,
            }),
            _ => {}
        }
    }

    plan
}

#[cfg(test)]
mod tests {
    use super::*;

    fn insert(txn_id: TxnId, lsn: Lsn, id: &str) -> WalEntry {
        WalEntry {
            lsn,
            txn_id,
            record: WalRecord::Insert {
                collection: "c".to_string(),
                id: id.to_string(),
                record: vec![lsn as u8],
            },
        }
    }

    fn marker(txn_id: TxnId, lsn: Lsn, record: WalRecord) -> WalEntry {
        WalEntry {
            lsn,
            txn_id,
            record,
        }
    }

    #[test]
    fn test_only_committed_transactions_replay() {
        let entries = vec![
            marker(1, 1, WalRecord::Begin),
            insert(1, 2, "a"),
            marker(2, 3, WalRecord::Begin),
            insert(2, 4, "b"),
            marker(1, 5, WalRecord::Commit),
        ];
        let plan = plan_redo(&entries);
        assert_eq!(plan.committed, HashSet::from([1]));
        assert_eq!(plan.ops.len(), 1);
        assert_eq!(plan.ops[0].id, "a");
        assert_eq!(plan.last_lsn, 5);
    }

    #[test]
    fn test_rolled_back_transaction_is_ignored() {
        let entries = vec![
            marker(1, 1, WalRecord::Begin),
            insert(1, 2, "a"),
            marker(1, 3, WalRecord::Rollback),
        ];
        let plan = plan_redo(&entries);
        assert!(plan.ops.is_empty());
    }

    #[test]
    fn test_scan_starts_after_latest_checkpoint() {
        let entries = vec![
            marker(1, 1, WalRecord::Begin),
            insert(1, 2, "pre"),
            marker(1, 3, WalRecord::Commit),
            marker(
                0,
                4,
                WalRecord::Checkpoint {
                    lsn: 4,
                    live_txns: vec![],
                    durable_pages: vec![],
                },
            ),
            marker(2, 5, WalRecord::Begin),
            insert(2, 6, "post"),
            marker(2, 7, WalRecord::Commit),
        ];
        let plan = plan_redo(&entries);
        assert_eq!(plan.checkpoint_lsn, Some(4));
        assert_eq!(plan.ops.len(), 1);
        assert_eq!(plan.ops[0].id, "post");
    }

    #[test]
    fn test_ops_preserve_log_order() {
        let entries = vec![
            marker(1, 1, WalRecord::Begin),
            insert(1, 2, "a"),
            marker(
                1,
                3,
                WalRecord::Delete {
                    collection: "c".to_string(),
                    id: "a".to_string(),
                },
            ),
            insert(1, 4, "a"),
            marker(1, 5, WalRecord::Commit),
        ];
        let plan = plan_redo(&entries);
        let kinds: Vec<_> = plan.ops.iter().map(|o| o.lsn).collect();
        assert_eq!(kinds, vec![2, 3, 4]);
        assert!(matches!(plan.ops[1].kind, RedoKind::Delete));
    }
}
