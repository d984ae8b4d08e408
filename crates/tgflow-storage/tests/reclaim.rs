use serde_json::json;
use std::time::{SystemTime, UNIX_EPOCH};
use tgflow_storage::{BatchOp, Query, StorageConfig, StorageManager, StoreSchema};

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock after epoch")
        .as_millis() as i64
}

fn stores() -> Vec<StoreSchema> {
    vec![
        StoreSchema::new("score_cache").ephemeral(),
        StoreSchema::new("members"),
    ]
}

#[test]
fn reclaim_only_purges_expired_entries_of_ephemeral_stores() {
    let manager = StorageManager::in_memory(StorageConfig::default());
    let db = manager.open("crm", 1, &stores()).expect("open");

    let past = now_ms() - 60_000;
    let future = now_ms() + 3_600_000;
    db.batch(&[
        BatchOp::put("score_cache", "stale", json!(1)).expires_at(past),
        BatchOp::put("score_cache", "fresh", json!(2)).expires_at(future),
        BatchOp::put("score_cache", "forever", json!(3)),
        BatchOp::put("members", "old", json!(4)).expires_at(past),
    ])
    .expect("seed");

    assert_eq!(db.reclaim().expect("reclaim"), 1);
    assert_eq!(db.reclaim().expect("second reclaim"), 0);

    assert_eq!(db.get("score_cache", "stale").expect("get"), None);
    assert_eq!(db.get("score_cache", "fresh").expect("get"), Some(json!(2)));
    assert_eq!(db.get("score_cache", "forever").expect("get"), Some(json!(3)));
    // Non-ephemeral stores ignore expiry entirely.
    assert_eq!(db.get("members", "old").expect("get"), Some(json!(4)));
    assert_eq!(db.query("members", &Query::all()).expect("dump").len(), 1);
}

#[test]
fn expired_ephemeral_entries_read_as_absent_before_reclaim() {
    let manager = StorageManager::in_memory(StorageConfig::default());
    let db = manager.open("crm", 1, &stores()).expect("open");

    db.batch(&[BatchOp::put("score_cache", "stale", json!(1)).expires_at(now_ms() - 1_000)])
        .expect("seed");

    // Served from the write-through cache.
    assert_eq!(db.get("score_cache", "stale").expect("get"), None);
    db.clear_cache();
    // Served from the store.
    assert_eq!(db.get("score_cache", "stale").expect("get"), None);
    assert!(db
        .query("score_cache", &Query::all())
        .expect("query")
        .is_empty());
}
