use serde_json::json;
use std::sync::{Arc, Barrier};
use std::thread;
use tgflow_storage::{
    BatchOp, IndexSchema, Key, KeyRange, Query, StorageConfig, StorageError, StorageManager,
    StoreSchema,
};

fn member_stores() -> Vec<StoreSchema> {
    vec![
        StoreSchema::new("members")
            .key_path("id")
            .index(IndexSchema::new("by_username", "username").unique())
            .index(IndexSchema::new("by_score", "score")),
        StoreSchema::new("exports"),
    ]
}

fn dump(db: &tgflow_storage::Database, store: &str) -> Vec<serde_json::Value> {
    db.query(store, &Query::all()).expect("dump store")
}

#[test]
fn read_after_write_sees_batch_results() {
    let manager = StorageManager::in_memory(StorageConfig::default());
    let db = manager.open("crm", 1, &member_stores()).expect("open");

    db.batch(&[BatchOp::put("exports", "run-1", json!({"rows": 10}))])
        .expect("put");
    assert_eq!(
        db.get("exports", "run-1").expect("get"),
        Some(json!({"rows": 10}))
    );

    // Overwrite through the cache: the refreshed value must be visible.
    db.batch(&[BatchOp::put("exports", "run-1", json!({"rows": 11}))])
        .expect("overwrite");
    assert_eq!(
        db.get("exports", "run-1").expect("get"),
        Some(json!({"rows": 11}))
    );

    db.batch(&[BatchOp::delete("exports", "run-1")]).expect("delete");
    assert_eq!(db.get("exports", "run-1").expect("get"), None);
}

#[test]
fn failing_batch_leaves_store_untouched() {
    let manager = StorageManager::in_memory(StorageConfig::default());
    let db = manager.open("crm", 1, &member_stores()).expect("open");

    db.batch(&[
        BatchOp::put_inline("members", json!({"id": 1, "username": "alice", "score": 3})),
        BatchOp::put_inline("members", json!({"id": 2, "username": "bob", "score": 5})),
    ])
    .expect("seed");
    // Warm the cache so a leaked cache write would be observable.
    assert!(db.get("members", 1).expect("get").is_some());
    let before = dump(&db, "members");

    let err = db
        .batch(&[
            BatchOp::put_inline("members", json!({"id": 1, "username": "alice", "score": 99})),
            BatchOp::delete("members", 2),
            BatchOp::put_inline("members", json!({"id": 3, "username": "carol", "score": 1})),
            // Violates the unique username index.
            BatchOp::put_inline("members", json!({"id": 4, "username": "alice", "score": 0})),
        ])
        .expect_err("unique violation must abort the batch");
    assert!(
        matches!(err, StorageError::TransactionAborted { index: 3, .. }),
        "unexpected error: {err:?}"
    );

    assert_eq!(dump(&db, "members"), before);
    assert_eq!(
        db.get("members", 1).expect("get"),
        Some(json!({"id": 1, "username": "alice", "score": 3}))
    );
    assert!(db.get("members", 2).expect("get").is_some());
    assert_eq!(db.get("members", 3).expect("get"), None);
}

#[test]
fn batch_with_unknown_store_is_rejected_before_writing() {
    let manager = StorageManager::in_memory(StorageConfig::default());
    let db = manager.open("crm", 1, &member_stores()).expect("open");

    let err = db
        .batch(&[
            BatchOp::put("exports", "a", json!(1)),
            BatchOp::put("nope", "b", json!(2)),
        ])
        .expect_err("unknown store");
    assert!(matches!(err, StorageError::UnknownStore(ref s) if s == "nope"));
    assert_eq!(db.get("exports", "a").expect("get"), None);
}

#[test]
fn inline_keys_require_a_key_at_the_key_path() {
    let manager = StorageManager::in_memory(StorageConfig::default());
    let db = manager.open("crm", 1, &member_stores()).expect("open");

    let err = db
        .batch(&[BatchOp::put_inline("members", json!({"username": "no-id"}))])
        .expect_err("missing key");
    assert!(matches!(err, StorageError::InvalidKey { .. }));
}

#[test]
fn explicit_keys_must_agree_with_inline_keys() {
    let manager = StorageManager::in_memory(StorageConfig::default());
    let db = manager.open("crm", 1, &member_stores()).expect("open");

    let err = db
        .batch(&[BatchOp::put("members", 2, json!({"id": 1, "username": "alice"}))])
        .expect_err("mismatched key");
    assert!(matches!(err, StorageError::InvalidKey { ref key_path, .. } if key_path == "id"));
    assert_eq!(db.get("members", 1).expect("get"), None);
    assert_eq!(db.get("members", 2).expect("get"), None);

    let err = db
        .batch(&[BatchOp::put("members", 3, json!({"username": "no-id"}))])
        .expect_err("missing inline key");
    assert!(matches!(err, StorageError::InvalidKey { .. }));

    db.batch(&[BatchOp::put("members", 1, json!({"id": 1, "username": "alice"}))])
        .expect("matching explicit key");
    assert_eq!(
        db.get("members", 1).expect("get"),
        Some(json!({"id": 1, "username": "alice"}))
    );
}

#[test]
fn query_reads_ranges_over_keys_and_indices() {
    let manager = StorageManager::in_memory(StorageConfig::default());
    let db = manager.open("crm", 1, &member_stores()).expect("open");

    let ops: Vec<BatchOp> = (1..=10)
        .map(|i| {
            BatchOp::put_inline(
                "members",
                json!({"id": i, "username": format!("user{i:02}"), "score": (i * 7) % 10}),
            )
        })
        .collect();
    db.batch(&ops).expect("seed");

    let by_key = db
        .query("members", &Query::all().range(KeyRange::bound(3, 6, false, true)))
        .expect("key range");
    let ids: Vec<i64> = by_key.iter().map(|v| v["id"].as_i64().unwrap()).collect();
    assert_eq!(ids, vec![3, 4, 5]);

    let top = db
        .query(
            "members",
            &Query::all()
                .index("by_score")
                .range(KeyRange::lower_bound(7, false))
                .limit(2),
        )
        .expect("index range");
    let scores: Vec<i64> = top.iter().map(|v| v["score"].as_i64().unwrap()).collect();
    assert_eq!(scores, vec![7, 8]);

    let exact = db
        .query(
            "members",
            &Query::all().index("by_username").range(KeyRange::only("user04")),
        )
        .expect("exact");
    assert_eq!(exact.len(), 1);
    assert_eq!(exact[0]["id"], json!(4));

    let err = db
        .query("members", &Query::all().index("missing"))
        .expect_err("unknown index");
    assert!(matches!(err, StorageError::UnknownIndex { .. }));
}

#[test]
fn query_never_serves_from_cache() {
    let manager = StorageManager::in_memory(StorageConfig::default());
    let db = manager.open("crm", 1, &member_stores()).expect("open");
    db.batch(&[BatchOp::put("exports", "a", json!(1))]).expect("put");
    db.get("exports", "a").expect("warm cache");

    let hits_before = db.cache_metrics().stats.hits;
    let rows = db.query("exports", &Query::all()).expect("query");
    assert_eq!(rows, vec![json!(1)]);
    assert_eq!(db.cache_metrics().stats.hits, hits_before);
}

#[test]
fn cache_serves_repeat_reads_and_is_bounded() {
    let config = StorageConfig {
        cache_capacity: 4,
        ..StorageConfig::default()
    };
    let manager = StorageManager::in_memory(config);
    let db = manager.open("crm", 1, &member_stores()).expect("open");

    let ops: Vec<BatchOp> = (0..10)
        .map(|i| BatchOp::put("exports", i, json!(i)))
        .collect();
    db.batch(&ops).expect("seed");
    let metrics = db.cache_metrics();
    assert_eq!(metrics.entries, 4);
    assert!(metrics.stats.evictions >= 6);

    db.clear_cache();
    assert_eq!(db.get("exports", 1).expect("get"), Some(json!(1)));
    assert_eq!(db.get("exports", 1).expect("get"), Some(json!(1)));
    let stats = db.cache_metrics().stats;
    assert_eq!(stats.misses, 1);
    assert_eq!(stats.hits, 1);

    // Evicted entries are still in the store.
    for i in 0..10 {
        assert_eq!(db.get("exports", i).expect("get"), Some(json!(i)));
    }
}

#[test]
fn concurrent_opens_share_one_connection() {
    let manager = Arc::new(StorageManager::in_memory(StorageConfig::default()));
    let barrier = Arc::new(Barrier::new(8));
    let handles: Vec<_> = (0..8)
        .map(|_| {
            let manager = Arc::clone(&manager);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                manager.open("shared", 1, &member_stores()).expect("open")
            })
        })
        .collect();
    let dbs: Vec<_> = handles
        .into_iter()
        .map(|h| h.join().expect("join"))
        .collect();

    dbs[0]
        .batch(&[BatchOp::put("exports", "k", json!("v"))])
        .expect("put");
    for db in &dbs {
        assert_eq!(db.get("exports", "k").expect("get"), Some(json!("v")));
        assert_eq!(db.open_report().version, 1);
    }
}

#[test]
fn on_disk_database_survives_reopen() {
    let dir = tempfile::tempdir().expect("tempdir");
    {
        let manager = StorageManager::with_root(dir.path(), StorageConfig::default());
        let db = manager.open("crm", 1, &member_stores()).expect("open");
        db.batch(&[BatchOp::put_inline(
            "members",
            json!({"id": 42, "username": "persisted", "score": 1}),
        )])
        .expect("put");
    }

    let manager = StorageManager::with_root(dir.path(), StorageConfig::default());
    let db = manager.open("crm", 1, &member_stores()).expect("reopen");
    assert!(!db.open_report().upgraded);
    assert_eq!(
        db.get("members", Key::Int(42)).expect("get"),
        Some(json!({"id": 42, "username": "persisted", "score": 1}))
    );
}

#[test]
fn writes_past_the_size_limit_fail_with_quota_exceeded() {
    let config = StorageConfig {
        max_size_bytes: Some(64 * 1024),
        ..StorageConfig::default()
    };
    let manager = StorageManager::in_memory(config);
    let db = manager.open("crm", 1, &member_stores()).expect("open");

    let big = "x".repeat(1024 * 1024);
    let err = db
        .batch(&[BatchOp::put("exports", "big", json!(big))])
        .expect_err("quota");
    assert!(matches!(err, StorageError::QuotaExceeded(_)), "got {err:?}");
    assert_eq!(db.get("exports", "big").expect("get"), None);
}
