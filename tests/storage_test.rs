// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Storage integration tests: database open/create, buffer flushes into
//! shards, restart recovery and buffer migration.
//!
//! Run with: `cargo test`

use std::path::Path;
use std::sync::Arc;

use tempfile::TempDir;

use tidepool::db::{Database, DbOptions};
use tidepool::points::Value;
use tidepool::storage::fcache::FileCache;
use tidepool::time::Precision;

fn tmp_dir() -> TempDir {
    tempfile::tempdir().expect("create tempdir")
}

fn create_db(dir: &Path, buffer_size: usize) -> Arc<Database> {
    Database::create(
        dir,
        "dbtest",
        Precision::Seconds,
        buffer_size,
        604_800,
        86_400,
        DbOptions::default(),
        "127.0.0.1",
        9010,
        Arc::new(FileCache::new(64)),
    )
    .expect("create database")
}

fn open_db(dir: &Path, options: DbOptions) -> Arc<Database> {
    Database::open(dir, options, "127.0.0.1", 9010, Arc::new(FileCache::new(64)))
        .expect("open database")
}

#[test]
fn test_insert_and_read_back() {
    let dir = tmp_dir();
    let db = create_db(dir.path(), 512);

    for (ts, v) in [(10u64, 1i64), (20, 2), (30, 3)] {
        db.insert_point("cpu", ts, Value::Int(v)).expect("insert");
    }
    let id = db.series_id("cpu").expect("series exists");
    let points = db.get_points(id, 0, u64::MAX).expect("read");
    let got: Vec<(u64, i64)> = points.iter().map(|p| (p.ts, p.val.as_int())).collect();
    assert_eq!(got, vec![(10, 1), (20, 2), (30, 3)]);
}

#[test]
fn test_buffer_flushes_one_chunk_per_fill() {
    let dir = tmp_dir();
    let db = create_db(dir.path(), 512);
    let cap = db.store.lock().buffer.len;

    let total = 10_000usize;
    for i in 0..total {
        db.insert_point("cpu", 1_000 + i as u64, Value::Int(i as i64))
            .expect("insert");
    }

    let store = db.store.lock();
    let id = store.trie.get(b"cpu").copied().unwrap();
    let series = store.series.get(id).unwrap();

    // One codec chunk per buffer fill; the remainder stays live.
    assert_eq!(series.idx.len(), total / cap);
    assert_eq!(series.buffer.len(), total % cap);
    assert_eq!(series.length, total);
    assert_eq!(series.start, 1_000);
    assert_eq!(series.end, 1_000 + total as u64 - 1);

    // Chunks landed in shard files on disk.
    let shards_dir = dir.path().join("shards");
    let sdb_files = std::fs::read_dir(&shards_dir)
        .unwrap()
        .filter(|e| {
            e.as_ref()
                .unwrap()
                .file_name()
                .to_string_lossy()
                .ends_with(".sdb")
        })
        .count();
    assert!(sdb_files >= 1);
}

#[test]
fn test_restart_recovers_buffer_and_shards() {
    let dir = tmp_dir();
    let cap;
    {
        let db = create_db(dir.path(), 512);
        cap = db.store.lock().buffer.len;
        // Two full buffer fills plus three live points.
        for i in 0..(2 * cap + 3) {
            db.insert_point("cpu", 100 + i as u64, Value::Int(i as i64))
                .expect("insert");
        }
        db.shutdown().expect("shutdown");
    }
    {
        let db = open_db(dir.path(), DbOptions::default());
        let id = db.series_id("cpu").expect("series survives restart");
        let points = db.get_points(id, 0, u64::MAX).expect("read");
        assert_eq!(points.len(), 2 * cap + 3);
        let ts: Vec<u64> = points.iter().map(|p| p.ts).collect();
        let expect: Vec<u64> = (0..(2 * cap + 3)).map(|i| 100 + i as u64).collect();
        assert_eq!(ts, expect);
    }
}

#[test]
fn test_unclean_restart_recovers_buffered_points() {
    let dir = tmp_dir();
    {
        let db = create_db(dir.path(), 512);
        db.insert_point("cpu", 10, Value::Int(1)).expect("insert");
        db.insert_point("cpu", 20, Value::Int(2)).expect("insert");
        db.sync_buffer().expect("fsync");
        db.save_series().expect("save series");
        // No shutdown: points live only in the buffer file.
    }
    {
        let db = open_db(dir.path(), DbOptions::default());
        let id = db.series_id("cpu").expect("series recovered");
        let points = db.get_points(id, 0, u64::MAX).expect("read");
        assert_eq!(points.len(), 2);
    }
}

#[test]
fn test_buffer_migration_grows_slot_size() {
    let dir = tmp_dir();
    {
        let db = create_db(dir.path(), 512);
        for i in 0..10u64 {
            db.insert_point("cpu", 100 + i, Value::Int(i as i64))
                .expect("insert");
        }
        db.shutdown().expect("shutdown");
    }
    {
        let db = open_db(
            dir.path(),
            DbOptions {
                buffer_size: Some(1024),
                ..DbOptions::default()
            },
        );
        assert_eq!(db.meta.lock().buffer_size, 1024);
        assert_eq!(db.store.lock().buffer.size, 1024);
        let id = db.series_id("cpu").expect("series survives migration");
        let points = db.get_points(id, 0, u64::MAX).expect("read");
        assert_eq!(points.len(), 10);
        db.shutdown().expect("shutdown");
    }
    // And the migrated size sticks on the next open.
    {
        let db = open_db(dir.path(), DbOptions::default());
        assert_eq!(db.store.lock().buffer.size, 1024);
        let id = db.series_id("cpu").unwrap();
        assert_eq!(db.get_points(id, 0, u64::MAX).unwrap().len(), 10);
    }
}

#[test]
fn test_buffer_migration_shrink_flushes_overflow() {
    let dir = tmp_dir();
    let big_cap;
    {
        let db = create_db(dir.path(), 1024);
        big_cap = db.store.lock().buffer.len;
        // Fill most of the big slot so it cannot fit a 512-byte one.
        for i in 0..(big_cap - 1) {
            db.insert_point("cpu", 100 + i as u64, Value::Int(i as i64))
                .expect("insert");
        }
        db.shutdown().expect("shutdown");
    }
    {
        let db = open_db(
            dir.path(),
            DbOptions {
                buffer_size: Some(512),
                ..DbOptions::default()
            },
        );
        let id = db.series_id("cpu").expect("series survives migration");
        // Pre-migration points all survive, overflow now lives in shards.
        let points = db.get_points(id, 0, u64::MAX).expect("read");
        assert_eq!(points.len(), big_cap - 1);
        let store = db.store.lock();
        let series = store.series.get(id).unwrap();
        assert!(!series.idx.is_empty(), "overflow must be in shards");
        assert!(series.buffer.len() < store.buffer.len);
    }
}

#[test]
fn test_drop_series_two_phase() {
    let dir = tmp_dir();
    let db = create_db(dir.path(), 512);
    db.insert_point("cpu", 10, Value::Int(1)).expect("insert");
    db.insert_point("mem", 10, Value::Int(1)).expect("insert");

    let id = db.series_id("cpu").unwrap();
    {
        let mut store = db.store.lock();
        db.drop_prepare(&mut store, id).expect("prepare");
        db.sync_dropped(&mut store).expect("sync");
        db.drop_commit(&mut store, id).expect("commit");
    }
    assert!(db.series_id("cpu").is_none());
    assert!(db.series_id("mem").is_some());

    // The name is free for a new series with a fresh id.
    db.insert_point("cpu", 99, Value::Int(9)).expect("reinsert");
    let new_id = db.series_id("cpu").unwrap();
    assert_ne!(new_id, id);
    let points = db.get_points(new_id, 0, u64::MAX).unwrap();
    assert_eq!(points.len(), 1);
}

#[test]
fn test_mixed_value_types() {
    let dir = tmp_dir();
    let db = create_db(dir.path(), 512);
    db.insert_point("ints", 10, Value::Int(-5)).expect("int");
    db.insert_point("floats", 10, Value::Double(2.5)).expect("double");
    db.insert_point("logs", 10, Value::Log(b"boot".to_vec()))
        .expect("log");
    db.flush_log().expect("log write-through");

    let id = db.series_id("floats").unwrap();
    let points = db.get_points(id, 0, u64::MAX).unwrap();
    assert_eq!(points.get(0).unwrap().val, Value::Double(2.5));

    let id = db.series_id("logs").unwrap();
    let points = db.get_points(id, 0, u64::MAX).unwrap();
    assert_eq!(points.get(0).unwrap().val, Value::Log(b"boot".to_vec()));

    // A type clash on an existing series is an insert error.
    assert!(db.insert_point("ints", 20, Value::Double(1.0)).is_err());
}

#[test]
fn test_seconds_precision_rejects_wide_ts() {
    let dir = tmp_dir();
    let db = create_db(dir.path(), 512);
    assert!(db.insert_point("cpu", 1u64 << 32, Value::Int(1)).is_err());
    assert!(db.insert_point("cpu", u32::MAX as u64, Value::Int(1)).is_ok());
}

#[test]
fn test_optimize_rewrites_dropped_series_chunks() {
    let dir = tmp_dir();
    let db = create_db(dir.path(), 512);
    let cap = db.store.lock().buffer.len;

    // Two series, both flushed into the same shard.
    for i in 0..cap {
        db.insert_point("keep", 100 + i as u64, Value::Int(1)).unwrap();
        db.insert_point("gone", 100 + i as u64, Value::Int(2)).unwrap();
    }
    let gone = db.series_id("gone").unwrap();
    {
        let mut store = db.store.lock();
        db.drop_prepare(&mut store, gone).unwrap();
        db.sync_dropped(&mut store).unwrap();
        db.drop_commit(&mut store, gone).unwrap();
    }

    let victims = db.shards_to_optimize();
    assert!(!victims.is_empty(), "dropped series flags the shard");
    for (tp, id) in victims {
        db.optimize_shard(tp, id).expect("optimize");
    }
    assert!(db.shards_to_optimize().is_empty());

    // The surviving series still reads correctly after the rewrite.
    let keep = db.series_id("keep").unwrap();
    let points = db.get_points(keep, 0, u64::MAX).unwrap();
    assert_eq!(points.len(), cap);
}

#[test]
fn test_leftover_tmp_buffer_refuses_start() {
    let dir = tmp_dir();
    {
        let db = create_db(dir.path(), 512);
        db.insert_point("cpu", 10, Value::Int(1)).unwrap();
        db.shutdown().unwrap();
    }
    std::fs::write(dir.path().join("buffer.dat.tmp"), b"junk").unwrap();

    let refused = Database::open(
        dir.path(),
        DbOptions::default(),
        "127.0.0.1",
        9010,
        Arc::new(FileCache::new(8)),
    );
    assert!(refused.is_err(), "must fail-safe on a leftover tmp buffer");

    let db = open_db(
        dir.path(),
        DbOptions {
            ignore_broken_data: true,
            ..DbOptions::default()
        },
    );
    assert!(db.series_id("cpu").is_some());
}
