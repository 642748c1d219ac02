// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Query engine integration tests: select, list, count, drop, user and
//! group management through the full parse/walk/execute path.

use std::path::Path;
use std::sync::Arc;

use tempfile::TempDir;

use tidepool::db::access::{PROFILE_FULL, PROFILE_READ};
use tidepool::db::users::DEFAULT_USER;
use tidepool::db::{Database, DbOptions};
use tidepool::points::Value;
use tidepool::query::{execute, QpVal};
use tidepool::storage::fcache::FileCache;
use tidepool::time::Precision;

fn tmp_dir() -> TempDir {
    tempfile::tempdir().expect("create tempdir")
}

fn create_db(dir: &Path) -> Arc<Database> {
    Database::create(
        dir,
        "dbtest",
        Precision::Seconds,
        512,
        604_800,
        86_400,
        DbOptions::default(),
        "127.0.0.1",
        9010,
        Arc::new(FileCache::new(64)),
    )
    .expect("create database")
}

async fn run(db: &Arc<Database>, q: &str) -> QpVal {
    execute(db, q, DEFAULT_USER, PROFILE_FULL).await.expect(q)
}

fn map_get<'a>(val: &'a QpVal, key: &str) -> &'a QpVal {
    match val {
        QpVal::Map(entries) => entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v)
            .unwrap_or_else(|| panic!("missing key '{key}' in {val:?}")),
        other => panic!("expected map, got {other:?}"),
    }
}

#[tokio::test]
async fn test_select_star_returns_inserted_points() {
    let dir = tmp_dir();
    let db = create_db(dir.path());
    for (ts, v) in [(10u64, 1i64), (20, 2), (30, 3)] {
        db.insert_point("cpu", ts, Value::Int(v)).unwrap();
    }

    let result = run(&db, "select * from \"cpu\"").await;
    let points = map_get(&result, "cpu");
    assert_eq!(
        *points,
        QpVal::Arr(vec![
            QpVal::Arr(vec![QpVal::Int(10), QpVal::Int(1)]),
            QpVal::Arr(vec![QpVal::Int(20), QpVal::Int(2)]),
            QpVal::Arr(vec![QpVal::Int(30), QpVal::Int(3)]),
        ])
    );
}

#[tokio::test]
async fn test_select_between_filters_range() {
    let dir = tmp_dir();
    let db = create_db(dir.path());
    for ts in [10u64, 20, 30, 40] {
        db.insert_point("cpu", ts, Value::Int(ts as i64)).unwrap();
    }
    let result = run(&db, "select * from \"cpu\" between 15 and 35").await;
    let QpVal::Arr(points) = map_get(&result, "cpu") else {
        panic!("expected points array")
    };
    assert_eq!(points.len(), 2);
}

#[tokio::test]
async fn test_select_aggregate_mean() {
    let dir = tmp_dir();
    let db = create_db(dir.path());
    // Two windows of one hour.
    for (ts, v) in [(100u64, 10i64), (200, 20), (3700, 30), (3800, 50)] {
        db.insert_point("cpu", ts, Value::Int(v)).unwrap();
    }
    let result = run(&db, "select mean(1h) from \"cpu\"").await;
    let QpVal::Arr(points) = map_get(&result, "cpu") else {
        panic!("expected points array")
    };
    assert_eq!(points.len(), 2);
    assert_eq!(
        points[0],
        QpVal::Arr(vec![QpVal::Int(3600), QpVal::Double(15.0)])
    );
    assert_eq!(
        points[1],
        QpVal::Arr(vec![QpVal::Int(7200), QpVal::Double(40.0)])
    );
}

#[tokio::test]
async fn test_select_regex_and_where() {
    let dir = tmp_dir();
    let db = create_db(dir.path());
    db.insert_point("cpu.load", 10, Value::Int(1)).unwrap();
    db.insert_point("cpu.temp", 10, Value::Int(1)).unwrap();
    db.insert_point("mem.free", 10, Value::Int(1)).unwrap();

    let result = run(&db, "select * from /^cpu/").await;
    let QpVal::Map(entries) = &result else { panic!() };
    assert_eq!(entries.len(), 2);

    let result = run(&db, "list series where name ~ \"^mem\"").await;
    let QpVal::Arr(rows) = map_get(&result, "series") else { panic!() };
    assert_eq!(rows.len(), 1);
}

#[tokio::test]
async fn test_list_and_count_series() {
    let dir = tmp_dir();
    let db = create_db(dir.path());
    for name in ["a", "b", "c"] {
        db.insert_point(name, 10, Value::Int(1)).unwrap();
    }

    let result = run(&db, "list series").await;
    let QpVal::Arr(rows) = map_get(&result, "series") else { panic!() };
    assert_eq!(rows.len(), 3);

    let result = run(&db, "count series").await;
    assert_eq!(*map_get(&result, "series"), QpVal::Int(3));

    let result = run(&db, "count series where length > 0").await;
    assert_eq!(*map_get(&result, "series"), QpVal::Int(3));

    let result = run(&db, "list series limit 2").await;
    let QpVal::Arr(rows) = map_get(&result, "series") else { panic!() };
    assert_eq!(rows.len(), 2);
}

#[tokio::test]
async fn test_drop_series_respects_threshold() {
    let dir = tmp_dir();
    let db = create_db(dir.path());
    for i in 0..10 {
        db.insert_point(&format!("s{i}"), 10, Value::Int(1)).unwrap();
    }
    // Lower the threshold so a full wipe is refused.
    run(&db, "alter database set drop_threshold 0.5").await;
    let err = execute(&db, "drop series /.*/", DEFAULT_USER, PROFILE_FULL).await;
    assert!(err.is_err());

    // Partial drops below the threshold pass.
    let result = run(&db, "drop series \"s0\", \"s1\"").await;
    let QpVal::Str(msg) = map_get(&result, "success_msg") else { panic!() };
    assert!(msg.contains("2 series"));

    // Forced wipe with the override.
    run(&db, "drop series /.*/ set ignore_threshold true").await;
    let result = run(&db, "count series").await;
    assert_eq!(*map_get(&result, "series"), QpVal::Int(0));
}

#[tokio::test]
async fn test_user_lifecycle_and_access() {
    let dir = tmp_dir();
    let db = create_db(dir.path());
    db.insert_point("cpu", 10, Value::Int(1)).unwrap();

    run(&db, "create user \"alice\" set password \"wonder\"").await;
    run(&db, "grant read to \"alice\"").await;

    let access = db.users.lock().get("alice").unwrap().access;
    assert_eq!(access, PROFILE_READ);

    // Read works, insert-requiring operations fail.
    let result = execute(&db, "select * from \"cpu\"", "alice", access).await;
    assert!(result.is_ok());
    let denied =
        tidepool::db::access::check_access(access, tidepool::db::access::ACCESS_INSERT);
    match denied {
        Err(e) => assert!(e.to_string().contains("insert")),
        Ok(()) => panic!("read-only user must not insert"),
    }

    // Scenario: grant insert, then the check passes.
    run(&db, "grant insert to \"alice\"").await;
    let access = db.users.lock().get("alice").unwrap().access;
    assert!(tidepool::db::access::check_access(
        access,
        tidepool::db::access::ACCESS_INSERT
    )
    .is_ok());

    run(&db, "revoke insert from \"alice\"").await;
    let access = db.users.lock().get("alice").unwrap().access;
    assert!(tidepool::db::access::check_access(
        access,
        tidepool::db::access::ACCESS_INSERT
    )
    .is_err());

    run(&db, "drop user \"alice\"").await;
    assert!(db.users.lock().get("alice").is_none());
}

#[tokio::test]
async fn test_access_denied_for_query_kind() {
    let dir = tmp_dir();
    let db = create_db(dir.path());
    db.insert_point("cpu", 10, Value::Int(1)).unwrap();

    // A user with read access cannot drop.
    let err = execute(&db, "drop series \"cpu\"", "alice", PROFILE_READ).await;
    match err {
        Err(e) => assert!(e.to_string().contains("drop")),
        Ok(_) => panic!("drop must require the drop bit"),
    }
}

#[tokio::test]
async fn test_group_lifecycle() {
    let dir = tmp_dir();
    let db = create_db(dir.path());
    db.insert_point("cpu.load", 10, Value::Int(1)).unwrap();
    db.insert_point("mem.free", 10, Value::Int(1)).unwrap();

    run(&db, "create group \"cpu\" for /^cpu/").await;
    // Run one assignment round the way the background task does.
    {
        let all: Vec<(u32, String)> = {
            let store = db.store.lock();
            let mut all = Vec::new();
            store.series.walk(|id, s| all.push((id, s.name.clone())));
            all
        };
        db.groups.lock().work(move || all);
    }

    let result = run(&db, "select * from `cpu`").await;
    let QpVal::Map(entries) = &result else { panic!() };
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].0, "cpu.load");

    let result = run(&db, "count groups").await;
    assert_eq!(*map_get(&result, "groups"), QpVal::Int(1));

    run(&db, "drop group \"cpu\"").await;
    let result = run(&db, "count groups").await;
    assert_eq!(*map_get(&result, "groups"), QpVal::Int(0));
}

#[tokio::test]
async fn test_show_and_alter_database() {
    let dir = tmp_dir();
    let db = create_db(dir.path());

    let result = run(&db, "show dbname, time_precision").await;
    let QpVal::Arr(data) = map_get(&result, "data") else { panic!() };
    assert_eq!(data.len(), 2);
    assert_eq!(*map_get(&data[0], "value"), QpVal::Str("dbtest".into()));
    assert_eq!(*map_get(&data[1], "value"), QpVal::Str("s".into()));

    run(&db, "alter database set list_limit 123").await;
    assert_eq!(db.meta.lock().list_limit, 123);

    run(&db, "alter database set expiration_num 4w").await;
    assert_eq!(db.meta.lock().expiration_num, 4 * 604_800);

    let err = execute(
        &db,
        "alter database set drop_threshold 7.5",
        DEFAULT_USER,
        PROFILE_FULL,
    )
    .await;
    assert!(err.is_err(), "drop_threshold above 1.0 must be rejected");
}

#[tokio::test]
async fn test_select_set_operations() {
    let dir = tmp_dir();
    let db = create_db(dir.path());
    for name in ["cpu.a", "cpu.b", "mem.a"] {
        db.insert_point(name, 10, Value::Int(1)).unwrap();
    }

    let result = run(&db, "select * from /^cpu/ - \"cpu.b\"").await;
    let QpVal::Map(entries) = &result else { panic!() };
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].0, "cpu.a");

    let result = run(&db, "select * from /a$/ & /^cpu/").await;
    let QpVal::Map(entries) = &result else { panic!() };
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].0, "cpu.a");
}

#[tokio::test]
async fn test_unknown_series_select_is_empty() {
    let dir = tmp_dir();
    let db = create_db(dir.path());
    let result = run(&db, "select * from \"ghost\"").await;
    assert_eq!(result, QpVal::Map(vec![]));
}
