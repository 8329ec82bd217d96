// Crash-recovery and durability tests. A crash is simulated by dropping
// the database without `close`: committed transactions are durable in the
// WAL, but nothing guarantees the buffer pool ever reached the heap files.

use serde_json::json;
use tempfile::TempDir;

use docdb::{
    Database, DbConfig, DbError, Entity, EncryptionService, IndexKind, Query, QueryOptions,
    Value,
};
use std::sync::Arc;

fn entity(json: serde_json::Value) -> Entity {
    Entity::from_json(json).unwrap()
}

#[test]
fn test_committed_transaction_survives_crash_before_flush() {
    let dir = TempDir::new().unwrap();

    {
        let db = Database::open(dir.path(), DbConfig::default()).unwrap();
        let items = db.collection("items").unwrap();

        let batch: Vec<Entity> = (0..100)
            .map(|i| entity(json!({"id": format!("e{i:03}"), "n": i, "name": format!("item-{i}")})))
            .collect();
        items.insert_many(batch).unwrap();
        assert_eq!(items.count().unwrap(), 100);
        // Simulated kill: no close, no flush.
        drop(db);
    }

    let db = Database::open(dir.path(), DbConfig::default()).unwrap();
    let items = db.collection("items").unwrap();
    assert_eq!(items.count().unwrap(), 100);

    for i in [0usize, 42, 99] {
        let e = items
            .get(&format!("e{i:03}"))
            .unwrap()
            .expect("recovered entity");
        assert_eq!(e.field("n"), Some(&Value::Int(i as i64)));
        assert_eq!(
            e.field("name"),
            Some(&Value::String(format!("item-{i}")))
        );
        assert_eq!(e.version, 1);
    }
}

#[test]
fn test_uncommitted_and_rolled_back_transactions_leave_no_trace() {
    let dir = TempDir::new().unwrap();

    {
        let db = Database::open(dir.path(), DbConfig::default()).unwrap();
        let items = db.collection("items").unwrap();
        items.insert(entity(json!({"id": "keep", "n": 1}))).unwrap();

        let rolled_back = db.begin().unwrap();
        items
            .insert_in(rolled_back, entity(json!({"id": "rb", "n": 2})))
            .unwrap();
        db.rollback(rolled_back).unwrap();

        let in_flight = db.begin().unwrap();
        items
            .insert_in(in_flight, entity(json!({"id": "if", "n": 3})))
            .unwrap();
        // Crash with the transaction still open.
        drop(db);
    }

    let db = Database::open(dir.path(), DbConfig::default()).unwrap();
    let items = db.collection("items").unwrap();
    assert_eq!(items.count().unwrap(), 1);
    assert!(items.get("keep").unwrap().is_some());
    assert!(items.get("rb").unwrap().is_none());
    assert!(items.get("if").unwrap().is_none());
}

#[test]
fn test_replay_is_idempotent_across_repeated_crashes() {
    let dir = TempDir::new().unwrap();

    {
        let db = Database::open(dir.path(), DbConfig::default()).unwrap();
        let items = db.collection("items").unwrap();
        items.insert(entity(json!({"id": "a", "n": 1}))).unwrap();
        items
            .update("a", entity(json!({"n": 2})).fields, 1)
            .unwrap();
        items.insert(entity(json!({"id": "b", "n": 9}))).unwrap();
        items.delete("b").unwrap();
        drop(db);
    }

    let snapshot = |db: &Database| -> (usize, u64, Option<Value>) {
        let items = db.collection("items").unwrap();
        let a = items.get("a").unwrap().unwrap();
        (
            items.count().unwrap(),
            a.version,
            a.field("n").cloned(),
        )
    };

    // First recovery, then crash again without writing anything.
    let first = {
        let db = Database::open(dir.path(), DbConfig::default()).unwrap();
        let state = snapshot(&db);
        drop(db);
        state
    };
    let second = {
        let db = Database::open(dir.path(), DbConfig::default()).unwrap();
        snapshot(&db)
    };

    assert_eq!(first, second);
    assert_eq!(first.0, 1);
    assert_eq!(first.1, 2);
    assert_eq!(first.2, Some(Value::Int(2)));
}

#[test]
fn test_updates_and_deletes_replay_in_order() {
    let dir = TempDir::new().unwrap();

    {
        let db = Database::open(dir.path(), DbConfig::default()).unwrap();
        let items = db.collection("items").unwrap();
        items.insert(entity(json!({"id": "a", "n": 0}))).unwrap();
        for version in 1..=5 {
            items
                .update("a", entity(json!({"n": version})).fields, version)
                .unwrap();
        }
        items.insert(entity(json!({"id": "gone", "n": 0}))).unwrap();
        items.delete("gone").unwrap();
        drop(db);
    }

    let db = Database::open(dir.path(), DbConfig::default()).unwrap();
    let items = db.collection("items").unwrap();
    let a = items.get("a").unwrap().unwrap();
    assert_eq!(a.version, 6);
    assert_eq!(a.field("n"), Some(&Value::Int(5)));
    assert!(items.get("gone").unwrap().is_none());
}

#[test]
fn test_clean_close_truncates_wal_and_preserves_state() {
    let dir = TempDir::new().unwrap();

    {
        let db = Database::open(dir.path(), DbConfig::default()).unwrap();
        let items = db.collection("items").unwrap();
        for i in 0..20 {
            items
                .insert(entity(json!({"id": format!("e{i}"), "n": i})))
                .unwrap();
        }
        db.close().unwrap();
    }

    // After a clean close the log holds only the final checkpoint.
    let wal_len = std::fs::metadata(dir.path().join("wal.log")).unwrap().len();
    assert!(wal_len < 256, "wal should be truncated, got {wal_len} bytes");

    let db = Database::open(dir.path(), DbConfig::default()).unwrap();
    let items = db.collection("items").unwrap();
    assert_eq!(items.count().unwrap(), 20);
    assert_eq!(
        items.get("e7").unwrap().unwrap().field("n"),
        Some(&Value::Int(7))
    );
}

#[test]
fn test_indexes_rebuilt_after_crash_and_reused_after_clean_close() {
    let dir = TempDir::new().unwrap();

    {
        let db = Database::open(dir.path(), DbConfig::default()).unwrap();
        let products = db.collection("products").unwrap();
        for (i, price) in [5, 10, 15, 20, 25].iter().enumerate() {
            products
                .insert(entity(json!({"id": format!("p{i}"), "price": price})))
                .unwrap();
        }
        products.create_index("price", IndexKind::Ordered).unwrap();
        db.persist_index_specs("products").unwrap();
        // Crash: index sidecars were never persisted.
        drop(db);
    }

    {
        let db = Database::open(dir.path(), DbConfig::default()).unwrap();
        let products = db.collection("products").unwrap();
        let query = Query::and(vec![
            Query::gt("price", Value::Int(10)),
            Query::lte("price", Value::Int(20)),
        ]);
        let prices: Vec<i64> = products
            .find(&query, &QueryOptions::default())
            .unwrap()
            .iter()
            .map(|e| e.field("price").and_then(Value::as_int).unwrap())
            .collect();
        assert_eq!(prices, vec![15, 20]);
        db.close().unwrap();
        assert!(dir.path().join("products.price.idx").exists());
    }

    // Clean close persisted the sidecar; reopen loads it and serves the
    // same results.
    let db = Database::open(dir.path(), DbConfig::default()).unwrap();
    let products = db.collection("products").unwrap();
    let results = products
        .find(&Query::eq("price", Value::Int(15)), &QueryOptions::default())
        .unwrap();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].id, "p2");
}

#[test]
fn test_corrupted_page_is_isolated_to_its_records() {
    let dir = TempDir::new().unwrap();
    let page_size = 4096u64;

    {
        let db = Database::open(dir.path(), DbConfig::default()).unwrap();
        let items = db.collection("items").unwrap();
        // Two records big enough that each lands on its own data page.
        items
            .insert(entity(json!({"id": "a", "blob": "a".repeat(3000)})))
            .unwrap();
        items
            .insert(entity(json!({"id": "b", "blob": "b".repeat(3000)})))
            .unwrap();
        db.close().unwrap();
    }

    // Flip one byte in the record area of the first data page (page 1;
    // page 0 is the collection's META page).
    let path = dir.path().join("items.db");
    let mut raw = std::fs::read(&path).unwrap();
    let target = (2 * page_size - 100) as usize;
    raw[target] ^= 0xFF;
    std::fs::write(&path, raw).unwrap();

    let db = Database::open(dir.path(), DbConfig::default()).unwrap();
    let items = db.collection("items").unwrap();

    let results: Vec<_> = ["a", "b"].iter().map(|id| items.get(id)).collect();
    let failures = results
        .iter()
        .filter(|r| matches!(r, Err(DbError::ChecksumMismatch { .. })))
        .count();
    let successes = results
        .iter()
        .filter(|r| matches!(r, Ok(Some(_))))
        .count();
    assert_eq!(failures, 1, "exactly one record sits on the bad page");
    assert_eq!(successes, 1, "the other page is unaffected");
}

#[test]
fn test_encrypted_compressed_collection_survives_reopen() {
    let dir = TempDir::new().unwrap();
    let key = [42u8; 32];
    let config = || DbConfig {
        compression_level: Some(6),
        encryption: Some(Arc::new(EncryptionService::new(&key).unwrap())),
        ..Default::default()
    };

    {
        let db = Database::open(dir.path(), config()).unwrap();
        let items = db.collection("items").unwrap();
        items
            .insert(entity(json!({
                "id": "secret",
                "text": "classified ".repeat(40),
            })))
            .unwrap();
        db.close().unwrap();
    }

    let db = Database::open(dir.path(), config()).unwrap();
    let items = db.collection("items").unwrap();
    let e = items.get("secret").unwrap().unwrap();
    assert_eq!(
        e.field("text"),
        Some(&Value::String("classified ".repeat(40)))
    );
}

#[test]
fn test_torn_wal_tail_truncated_with_prior_commits_intact() {
    let dir = TempDir::new().unwrap();

    {
        let db = Database::open(dir.path(), DbConfig::default()).unwrap();
        let items = db.collection("items").unwrap();
        items.insert(entity(json!({"id": "a", "n": 1}))).unwrap();
        drop(db);
    }

    // Torn write at the tail of the log.
    let wal_path = dir.path().join("wal.log");
    let mut raw = std::fs::read(&wal_path).unwrap();
    raw.extend_from_slice(&[0x7F; 13]);
    std::fs::write(&wal_path, raw).unwrap();

    let db = Database::open(dir.path(), DbConfig::default()).unwrap();
    let items = db.collection("items").unwrap();
    assert_eq!(items.count().unwrap(), 1);
    assert!(items.get("a").unwrap().is_some());
}
