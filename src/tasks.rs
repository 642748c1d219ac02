// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Periodic background tasks: heartbeat, shard optimize, buffer sync and
//! group assignment. Every loop observes the engine's cancel flag at its
//! next tick; optimize additionally pauses while a database is in backup
//! mode.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::interval;
use tracing::{debug, error, info};

use crate::db::engine::Engine;
use crate::net::protocol;
use crate::qpack::Packer;

/// Heartbeat: exchange status flags with every connected peer so
/// available/accessible stays fresh on both ends.
pub async fn heartbeat(engine: Arc<Engine>, interval_s: u64) {
    let mut tick = interval(Duration::from_secs(interval_s.max(3)));
    loop {
        tick.tick().await;
        if engine.is_cancelled() {
            break;
        }
        for db in engine.databases() {
            // Snapshot under the servers mutex, then talk to the network
            // without holding it.
            let peers: Vec<_> = {
                let servers = db.servers.lock();
                servers
                    .iter()
                    .filter(|s| s.uuid != db.server.uuid)
                    .cloned()
                    .collect()
            };
            let flags = db.server.flags();
            for peer in peers {
                let mut p = Packer::new();
                p.add_string(&db.server.uuid.to_string());
                p.add_int(flags as i64);
                if let Err(e) =
                    peer.send_unacked(protocol::BPROTO_FLAGS_UPDATE, p.into_bytes())
                {
                    debug!(peer = %peer.name(), error = %e, "Heartbeat skipped");
                }
            }
        }
        debug!("Heartbeat tick");
    }
    info!("Heartbeat task stopped");
}

/// Optimize: rewrite shards flagged for compaction and drop expired ones.
pub async fn optimize(engine: Arc<Engine>, interval_s: u64) {
    if interval_s == 0 {
        info!("Optimize task disabled");
        return;
    }
    let mut tick = interval(Duration::from_secs(interval_s));
    loop {
        tick.tick().await;
        if engine.is_cancelled() {
            break;
        }
        for db in engine.databases() {
            if db.in_backup_mode() {
                debug!(db = db.name(), "Optimize paused for backup mode");
                continue;
            }
            match db.expire_shards() {
                Ok(0) => {}
                Ok(n) => info!(db = db.name(), count = n, "Expired shards removed"),
                Err(e) => error!(db = db.name(), error = %e, "Shard expiration failed"),
            }
            for (tp, shard_id) in db.shards_to_optimize() {
                if engine.is_cancelled() || db.in_backup_mode() {
                    break;
                }
                let db = db.clone();
                // Shard rewrites are blocking I/O; keep them off the
                // event loop.
                let done = tokio::task::spawn_blocking(move || {
                    db.optimize_shard(tp, shard_id)
                })
                .await;
                match done {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => error!(shard = shard_id, error = %e, "Optimize failed"),
                    Err(e) => error!(shard = shard_id, error = %e, "Optimize task panicked"),
                }
            }
        }
    }
    info!("Optimize task stopped");
}

/// Buffer sync: periodic fsync of every database's buffer file.
pub async fn buffersync(engine: Arc<Engine>, interval_ms: u64) {
    if interval_ms == 0 {
        info!("Buffer sync disabled");
        return;
    }
    let mut tick = interval(Duration::from_millis(interval_ms));
    loop {
        tick.tick().await;
        if engine.is_cancelled() {
            break;
        }
        for db in engine.databases() {
            if db.in_backup_mode() {
                continue;
            }
            if let Err(e) = db.sync_buffer() {
                error!(db = db.name(), error = %e, "Buffer sync failed");
            }
        }
    }
    info!("Buffer sync task stopped");
}

/// Group assignment: match new series against groups and new groups
/// against every series; compact dropped entries once in a while.
pub async fn groups(engine: Arc<Engine>, interval_ms: u64) {
    let mut tick = interval(Duration::from_millis(interval_ms.max(200)));
    let mut rounds = 0u64;
    loop {
        tick.tick().await;
        if engine.is_cancelled() {
            break;
        }
        rounds += 1;
        for db in engine.databases() {
            // Snapshot before taking the groups lock; the insert path
            // acquires them in store-then-groups order.
            let all: Vec<(u32, String)> = {
                let store = db.store.lock();
                let mut all = Vec::with_capacity(store.series.len());
                store.series.walk(|id, s| {
                    if !s.is_dropped() {
                        all.push((id, s.name.clone()));
                    }
                });
                all
            };
            db.groups.lock().work(move || all);
            // Cleanup is cheap but pointless every round.
            if rounds % 64 == 0 {
                let live: std::collections::HashSet<u32> = {
                    let store = db.store.lock();
                    store.series.to_list().into_iter().collect()
                };
                db.groups.lock().cleanup(|id| live.contains(&id));
            }
        }
    }
    for db in engine.databases() {
        db.groups.lock().status = crate::groups::Status::Closed;
    }
    info!("Groups task stopped");
}
