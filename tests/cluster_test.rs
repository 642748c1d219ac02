// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Cluster-facing tests: pool lookup distribution, insert partitioning,
//! pool-offline failures and the replication idempotence contract.

use std::path::Path;
use std::sync::Arc;

use tempfile::TempDir;

use tidepool::cluster::lookup::{name_sum, Lookup, LOOKUP_SZ};
use tidepool::cluster::pool::Pools;
use tidepool::db::{Database, DbOptions};
use tidepool::insert;
use tidepool::points::Value;
use tidepool::qpack::Packer;
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

fn payload(series: &[(&str, &[(u64, i64)])]) -> Vec<u8> {
    let mut p = Packer::new();
    p.open_map();
    for (name, points) in series {
        p.add_string(name);
        p.open_array();
        for (ts, v) in points.iter() {
            p.fixed_array(2);
            p.add_int(*ts as i64);
            p.add_int(*v);
        }
        p.close_array();
    }
    p.close_map();
    p.into_bytes()
}

#[test]
fn test_lookup_growth_moves_expected_share() {
    // Growing from k to k+1 pools reassigns ~1/(k+1) of the slots and
    // every moved slot goes to the new pool.
    for k in 1u16..=7 {
        let old = Lookup::new(k);
        let new = Lookup::new(k + 1);
        let mut moved = 0usize;
        for i in 0..LOOKUP_SZ {
            if old.slot(i) != new.slot(i) {
                assert_eq!(new.slot(i), k);
                moved += 1;
            }
        }
        let expect = LOOKUP_SZ / (k as usize + 1);
        assert!(moved.abs_diff(expect) <= 1, "k={k}: moved {moved} vs {expect}");
    }
}

#[test]
fn test_two_pool_partition_covers_all_series() {
    // 256 distinct series spread over two pools; both sides non-empty.
    let lookup = Lookup::new(2);
    let names: Vec<String> = (0..256).map(|i| format!("series-{i:03}")).collect();
    let mut counts = [0usize; 2];
    for name in &names {
        counts[lookup.pool_for(name.as_bytes()) as usize] += 1;
    }
    assert_eq!(counts[0] + counts[1], 256);
    assert!(counts[0] > 0 && counts[1] > 0);
}

#[tokio::test]
async fn test_insert_fails_when_remote_pool_offline() {
    let dir = tmp_dir();
    let db = create_db(dir.path());
    // Pretend the cluster has two pools; pool 1 has no reachable server.
    *db.pools.lock() = Pools::new(2, 0);

    // Find a series name owned by the remote pool.
    let lookup = Lookup::new(2);
    let remote = (0..999)
        .map(|i| format!("s{i}"))
        .find(|n| lookup.pool_for(n.as_bytes()) == 1)
        .unwrap();

    let data = payload(&[(remote.as_str(), &[(10, 1)])]);
    let err = insert::insert(&db, &data).await.unwrap_err();
    assert!(err
        .to_string()
        .contains("At least one pool has no server available to process the request"));
}

#[tokio::test]
async fn test_local_insert_through_pipeline() {
    let dir = tmp_dir();
    let db = create_db(dir.path());
    let data = payload(&[("cpu", &[(10, 1), (20, 2), (30, 3)])]);
    let n = insert::insert(&db, &data).await.expect("insert");
    assert_eq!(n, 3);

    let id = db.series_id("cpu").unwrap();
    let points = db.get_points(id, 0, u64::MAX).unwrap();
    let got: Vec<(u64, i64)> = points.iter().map(|p| (p.ts, p.val.as_int())).collect();
    assert_eq!(got, vec![(10, 1), (20, 2), (30, 3)]);
}

#[test]
fn test_duplicate_delivery_preserves_points_and_flags_overlap() {
    // The replication path is at-least-once; a re-delivered insert packet
    // must never corrupt series state. Duplicates are kept and the
    // container reports them.
    let dir = tmp_dir();
    let db = create_db(dir.path());
    let data = payload(&[("cpu", &[(10, 1), (20, 2)])]);

    insert::insert_local(&db, &data).expect("first delivery");
    insert::insert_local(&db, &data).expect("second delivery");

    let id = db.series_id("cpu").unwrap();
    let points = db.get_points(id, 0, u64::MAX).unwrap();
    assert_eq!(points.len(), 4);
    assert!(points.has_duplicates());
    let ts: Vec<u64> = points.iter().map(|p| p.ts).collect();
    assert_eq!(ts, vec![10, 10, 20, 20]);
}

#[test]
fn test_name_sum_is_8_bit() {
    assert_eq!(name_sum(b"abc"), name_sum(b"cba"));
    let long: Vec<u8> = std::iter::repeat(255u8).take(512).collect();
    let _ = name_sum(&long);
}
