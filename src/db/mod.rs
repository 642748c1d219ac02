// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Database — one directory owning a time model, series store, buffer,
//! shards, users, groups, pools and an optional replica queue.
//!
//! ## Directory layout
//!
//! ```text
//! <dbpath>/
//!   database.dat         # packed metadata, schema-prefixed
//!   series.dat           # packed series catalog
//!   users.dat            # packed users
//!   servers.dat          # packed cluster members
//!   groups.dat           # packed saved groups
//!   buffer.dat           # fixed-slot point buffer
//!   .dropped             # append-only stream of dropped series ids
//!   shards/<id>.sdb      # shard data (+ <id>.idx)
//!   .<replica-uuid>/     # replica fifo directory
//! ```

pub mod access;
pub mod engine;
pub mod users;

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use parking_lot::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cluster::fifo::Fifo;
use crate::cluster::pool::Pools;
use crate::cluster::replicate::Replicate;
use crate::cluster::server::{Server, FLAG_BACKUP_MODE, FLAG_RUNNING};
use crate::error::{Result, TdbError};
use crate::groups::Groups;
use crate::index::imap::IMap;
use crate::index::trie::{AddResult, Trie};
use crate::points::{PointType, Points, Value};
use crate::qpack::{Packer, Unpacker};
use crate::storage::buffer::{Buffer, BUFFER_TMP_FN};
use crate::storage::fcache::FileCache;
use crate::storage::series::{Series, FLAG_DROPPED};
use crate::storage::shard::{Shard, ShardType, FLAG_HAS_DROPPED_SERIES, FLAG_IS_CORRUPT};
use crate::time::{Precision, TimeModel};
use users::Users;

pub const DB_FN: &str = "database.dat";
pub const SERIES_FN: &str = "series.dat";
pub const DROPPED_FN: &str = ".dropped";
pub const SHARDS_DIR: &str = "shards";
pub const DB_SCHEMA: i64 = 1;
pub const SERIES_SCHEMA: i64 = 1;

pub const DEFAULT_BUFFER_SIZE: usize = 1024;
pub const DEFAULT_DROP_THRESHOLD: f64 = 1.0;
pub const DEFAULT_SELECT_POINTS_LIMIT: usize = 1_000_000;
pub const DEFAULT_LIST_LIMIT: usize = 10_000;
/// One week of numeric data per shard, one day for log data (seconds;
/// scaled by the database precision).
pub const DEFAULT_DURATION_NUM_SECS: u64 = 604_800;
pub const DEFAULT_DURATION_LOG_SECS: u64 = 86_400;

/// Mutable database header, persisted in `database.dat`.
#[derive(Debug, Clone)]
pub struct DbMeta {
    pub name: String,
    pub uuid: Uuid,
    pub precision: Precision,
    pub buffer_size: usize,
    pub duration_num: u64,
    pub duration_log: u64,
    pub tz: String,
    pub drop_threshold: f64,
    pub select_points_limit: usize,
    pub list_limit: usize,
    /// Expiration horizons in database time units; 0 disables.
    pub expiration_num: u64,
    pub expiration_log: u64,
}

/// Options controlling how a database is opened.
#[derive(Debug, Clone)]
pub struct DbOptions {
    /// Requested buffer slot size; differing from the stored size starts
    /// a migration.
    pub buffer_size: Option<usize>,
    pub compression: bool,
    pub ignore_broken_data: bool,
}

impl Default for DbOptions {
    fn default() -> Self {
        DbOptions {
            buffer_size: None,
            compression: true,
            ignore_broken_data: false,
        }
    }
}

/// Everything guarded by the series-map mutex: name trie, id map, buffer,
/// shards and the drop log.
pub struct Store {
    pub trie: Trie<u32>,
    pub series: IMap<Series>,
    pub shards: HashMap<(ShardType, u64), Shard>,
    pub buffer: Buffer,
    pub next_series_id: u32,
    pub compression: bool,
    dropped_file: Option<File>,
    series_dirty: bool,
    series_path: PathBuf,
}

pub struct Database {
    pub path: PathBuf,
    pub meta: Mutex<DbMeta>,
    pub time: TimeModel,
    pub store: Mutex<Store>,
    pub users: Mutex<Users>,
    pub groups: Mutex<Groups>,
    pub pools: Mutex<Pools>,
    pub servers: Mutex<Vec<Arc<Server>>>,
    /// This process' own cluster identity.
    pub server: Arc<Server>,
    pub fifo: Option<Arc<Mutex<Fifo>>>,
    pub replicate: Arc<Mutex<Replicate>>,
    pub fcache: Arc<FileCache>,
}

impl Database {
    // ─────────────────────────── create / open ──────────────────────────────

    /// Create a fresh database directory and open it.
    pub fn create(
        path: &Path,
        name: &str,
        precision: Precision,
        buffer_size: usize,
        duration_num_secs: u64,
        duration_log_secs: u64,
        options: DbOptions,
        self_address: &str,
        self_port: u16,
        fcache: Arc<FileCache>,
    ) -> Result<Arc<Database>> {
        if path.join(DB_FN).exists() {
            return Err(TdbError::Config(format!(
                "database already exists at {path:?}"
            )));
        }
        if !crate::storage::buffer::is_valid_size(buffer_size) {
            return Err(TdbError::Config(format!(
                "invalid buffer size {buffer_size}"
            )));
        }
        validate_db_name(name)?;
        std::fs::create_dir_all(path)?;

        let time = TimeModel::new(precision);
        let meta = DbMeta {
            name: name.to_string(),
            uuid: Uuid::new_v4(),
            precision,
            buffer_size,
            duration_num: duration_num_secs * time.factor,
            duration_log: duration_log_secs * time.factor,
            tz: "UTC".to_string(),
            drop_threshold: DEFAULT_DROP_THRESHOLD,
            select_points_limit: DEFAULT_SELECT_POINTS_LIMIT,
            list_limit: DEFAULT_LIST_LIMIT,
            expiration_num: 0,
            expiration_log: 0,
        };
        save_meta(path, &meta)?;
        info!(db = name, precision = precision.as_str(), "Database created");
        Self::open(path, options, self_address, self_port, fcache)
    }

    /// Open an existing database directory.
    pub fn open(
        path: &Path,
        options: DbOptions,
        self_address: &str,
        self_port: u16,
        fcache: Arc<FileCache>,
    ) -> Result<Arc<Database>> {
        let mut meta = load_meta(path)?;
        let time = TimeModel::new(meta.precision);

        let users = Users::load(path)?;
        let groups = Groups::load(path)?;

        // Cluster members; a fresh database registers itself as the only
        // server of pool 0.
        let (servers, self_server) =
            load_servers(path, meta.uuid, self_address, self_port)?;
        let num_pools = servers.iter().map(|s| s.pool).max().unwrap_or(0) + 1;
        let mut pools = Pools::new(num_pools, self_server.pool);
        for server in &servers {
            pools.pools[server.pool as usize].add_server(server.clone());
        }
        self_server.set_flag(FLAG_RUNNING);

        // Leftover temporary buffer from an interrupted migration.
        let tmp_buffer = path.join(BUFFER_TMP_FN);
        if tmp_buffer.exists() {
            if options.ignore_broken_data {
                warn!("Removing leftover temporary buffer file");
                std::fs::remove_file(&tmp_buffer)?;
            } else {
                return Err(TdbError::Corrupt(
                    "found a leftover temporary buffer file; refusing to start \
                     (set ignore_broken_data to override)"
                        .into(),
                ));
            }
        }

        let mut store = Store {
            trie: Trie::new(),
            series: IMap::new(),
            shards: HashMap::new(),
            buffer: Buffer::open(path, meta.buffer_size)?,
            next_series_id: 1,
            compression: options.compression,
            dropped_file: None,
            series_dirty: false,
            series_path: path.join(SERIES_FN),
        };

        load_series(&mut store)?;
        apply_dropped(path, &mut store)?;
        load_shards(path, &mut store)?;
        load_buffer(&mut store)?;

        // A crash between a flush and its slot reset can leave a slot
        // exactly full; flush those now so the next write fits.
        let full: Vec<u32> = {
            let cap = store.buffer.len;
            let mut ids = Vec::new();
            store.series.walk(|id, s| {
                if s.buffer.len() >= cap {
                    ids.push(id);
                }
            });
            ids
        };
        {
            let ts_sz = if meta.precision == Precision::Seconds { 4 } else { 8 };
            for id in full {
                let (duration, is_log, offset) = {
                    let s = store.series.get(id).unwrap();
                    let duration = if s.tp == PointType::Log {
                        meta.duration_log
                    } else {
                        meta.duration_num
                    };
                    (duration, s.tp == PointType::Log, s.bf_offset)
                };
                flush_for_migration(&mut store, path, &fcache, id, duration, ts_sz)?;
                if !is_log && offset != u64::MAX {
                    store.buffer.write_empty(id, offset)?;
                }
            }
        }

        // One-shot migration when the configured slot size changed.
        if let Some(new_size) = options.buffer_size {
            if new_size != meta.buffer_size {
                migrate_buffer(path, &mut store, &mut meta, new_size, &fcache)?;
                save_meta(path, &meta)?;
            }
        }

        store.dropped_file = Some(
            OpenOptions::new()
                .append(true)
                .create(true)
                .open(path.join(DROPPED_FN))?,
        );

        let mut lengths = 0usize;
        {
            let mut ids = Vec::new();
            store.series.walk(|id, _| ids.push(id));
            for id in ids {
                let s = store.series.get_mut(id).unwrap();
                s.update_props();
                lengths += s.length;
            }
        }

        info!(
            db = meta.name,
            series = store.series.len(),
            shards = store.shards.len(),
            points = lengths,
            "Database opened"
        );

        // A two-server pool replicates to its peer through a fifo.
        let replica = pools.replica_of(self_server.pool, self_server.uuid);
        let fifo = match replica {
            Some(replica) => {
                let dir = path.join(format!(".{}", replica.uuid));
                Some(Arc::new(Mutex::new(Fifo::open(&dir)?)))
            }
            None => None,
        };

        Ok(Arc::new(Database {
            path: path.to_path_buf(),
            meta: Mutex::new(meta),
            time,
            store: Mutex::new(store),
            users: Mutex::new(users),
            groups: Mutex::new(groups),
            pools: Mutex::new(pools),
            servers: Mutex::new(servers),
            server: self_server,
            fifo,
            replicate: Arc::new(Mutex::new(Replicate::new())),
            fcache,
        }))
    }

    pub fn name(&self) -> String {
        self.meta.lock().name.clone()
    }

    /// Duration for a shard type in database time units.
    pub fn duration(&self, tp: ShardType) -> u64 {
        let meta = self.meta.lock();
        match tp {
            ShardType::Num => meta.duration_num,
            ShardType::Log => meta.duration_log,
        }
    }

    pub fn save_meta(&self) -> Result<()> {
        save_meta(&self.path, &self.meta.lock())
    }

    // ─────────────────────────── insert path ────────────────────────────────

    /// Append one point to a series, creating the series on first use.
    /// Flushes the buffer slot into a shard when it fills up.
    pub fn insert_point(&self, name: &str, ts: u64, val: Value) -> Result<()> {
        if !self.time.valid_ts(ts) {
            return Err(TdbError::Insert(format!(
                "timestamp {ts} out of range for this database precision"
            )));
        }
        let mut store = self.store.lock();
        let id = self.get_or_create_series(&mut store, name, val.tp())?;
        self.series_add_point(&mut store, id, ts, val)
    }

    fn get_or_create_series(
        &self,
        store: &mut Store,
        name: &str,
        tp: PointType,
    ) -> Result<u32> {
        if let Some(&id) = store.trie.get(name.as_bytes()) {
            return Ok(id);
        }
        if name.is_empty() || name.len() > 65_535 {
            return Err(TdbError::Insert("invalid series name".into()));
        }
        let id = store.next_series_id;
        store.next_series_id += 1;

        let pool = self.pools.lock().pool_for(name.as_bytes());
        let ts32 = self.time.precision == Precision::Seconds;
        let mut series = Series::new(id, pool, name.to_string(), tp, ts32);
        series.buffer = Points::new(store.buffer.len, tp);
        series.bf_offset = u64::MAX;
        if tp != PointType::Log {
            series.bf_offset = store.buffer.new_series(id)?;
        }

        let added = store.trie.add(name.as_bytes(), id);
        debug_assert_eq!(added, AddResult::Ok);
        store
            .series
            .add(id, series, false)
            .map_err(|_| TdbError::Insert(format!("duplicate series id {id}")))?;
        store.series_dirty = true;

        self.groups.lock().add_series(id, name);
        debug!(series = name, id, pool, "Series created");
        Ok(id)
    }

    fn series_add_point(&self, store: &mut Store, id: u32, ts: u64, val: Value) -> Result<()> {
        let buffer_cap = store.buffer.len;
        let bits = value_bits(&val);
        let is_log = val.tp() == PointType::Log;
        let (count, offset) = {
            let series = store
                .series
                .get_mut(id)
                .ok_or_else(|| TdbError::Insert(format!("unknown series id {id}")))?;
            if series.is_dropped() {
                return Ok(());
            }
            series.add_point_mem(ts, val)?;
            (series.buffer.len(), series.bf_offset)
        };

        if !is_log {
            // Persist at the append position; timestamp order is restored
            // when the buffer is loaded.
            let offset = if offset == u64::MAX {
                let offset = store.buffer.new_series(id)?;
                store.series.get_mut(id).unwrap().bf_offset = offset;
                offset
            } else {
                offset
            };
            store.buffer.write_point(offset, count - 1, ts, bits)?;
        }

        if count >= buffer_cap.max(1) {
            self.flush_series(store, id)?;
        }
        Ok(())
    }

    /// Flush a series' live points into shards, one chunk per duration
    /// window, then reset the buffer slot.
    pub fn flush_series(&self, store: &mut Store, id: u32) -> Result<()> {
        let (points, tp, offset) = {
            let series = store
                .series
                .get_mut(id)
                .ok_or_else(|| TdbError::Storage(format!("unknown series id {id}")))?;
            if series.buffer.is_empty() {
                return Ok(());
            }
            let cap = series.buffer.capacity().max(store.buffer.len);
            let points = std::mem::replace(&mut series.buffer, Points::new(cap, series.tp));
            (points, series.tp, series.bf_offset)
        };

        let shard_tp = ShardType::from_point_type(tp);
        let duration = self.duration(shard_tp).max(1);
        let compression = store.compression;
        let shards_dir = self.path.join(SHARDS_DIR);
        let ts_sz = self.time.ts_sz;

        let slice = points.as_slice();
        let mut a = 0;
        while a < slice.len() {
            let shard_id = slice[a].ts / duration;
            let mut b = a + 1;
            while b < slice.len() && slice[b].ts / duration == shard_id {
                b += 1;
            }

            let shard = match store.shards.entry((shard_tp, shard_id)) {
                std::collections::hash_map::Entry::Occupied(e) => e.into_mut(),
                std::collections::hash_map::Entry::Vacant(e) => e.insert(Shard::create(
                    &shards_dir,
                    shard_id,
                    duration,
                    shard_tp,
                    ts_sz,
                    compression,
                    None,
                )?),
            };
            let entry = shard.write_points(&self.fcache, id, &points, a, b)?;
            store.series.get_mut(id).unwrap().idx_insert(entry);
            a = b;
        }

        if tp != PointType::Log {
            store.buffer.write_empty(id, offset)?;
        }
        Ok(())
    }

    /// Flush every series whose buffer holds points; used by shutdown and
    /// by the log write-through path.
    pub fn flush_all(&self) -> Result<()> {
        let mut store = self.store.lock();
        let ids: Vec<u32> = {
            let mut ids = Vec::new();
            store.series.walk(|id, s| {
                if !s.buffer.is_empty() {
                    ids.push(id);
                }
            });
            ids
        };
        for id in ids {
            self.flush_series(&mut store, id)?;
        }
        store.buffer.fsync()?;
        Ok(())
    }

    /// Write-through for log series: their variable-length values never
    /// enter the fixed-slot buffer file, so they go to shards at the end
    /// of every insert batch.
    pub fn flush_log(&self) -> Result<()> {
        let mut store = self.store.lock();
        let ids: Vec<u32> = {
            let mut ids = Vec::new();
            store.series.walk(|id, s| {
                if s.tp == PointType::Log && !s.buffer.is_empty() {
                    ids.push(id);
                }
            });
            ids
        };
        for id in ids {
            self.flush_series(&mut store, id)?;
        }
        Ok(())
    }

    // ─────────────────────────── read path ──────────────────────────────────

    /// Points of one series in `[start_ts, end_ts]`.
    pub fn get_points(&self, id: u32, start_ts: u64, end_ts: u64) -> Result<Points> {
        let mut store = self.store.lock();
        let result = {
            let series = store
                .series
                .get(id)
                .ok_or_else(|| TdbError::Query(format!("unknown series id {id}")))?;
            series.get_points(&store.shards, &self.fcache, start_ts, end_ts)?
        };
        for key in &result.corrupt_shards {
            if let Some(shard) = store.shards.get_mut(key) {
                shard.flags |= FLAG_IS_CORRUPT;
            }
        }
        if result.partial {
            warn!(series = id, "Partial result: unreadable chunks were skipped");
        }
        Ok(result.points)
    }

    pub fn series_id(&self, name: &str) -> Option<u32> {
        self.store.lock().trie.get(name.as_bytes()).copied()
    }

    // ─────────────────────────── drop path ──────────────────────────────────

    /// Phase one: flag the series and write its id to the drop log.
    pub fn drop_prepare(&self, store: &mut Store, id: u32) -> Result<()> {
        let entries: Vec<(ShardType, u64)> = {
            let series = store
                .series
                .get_mut(id)
                .ok_or_else(|| TdbError::Query(format!("unknown series id {id}")))?;
            series.flags |= FLAG_DROPPED;
            series.idx.iter().map(|e| (e.tp, e.shard_id)).collect()
        };
        for key in entries {
            if let Some(shard) = store.shards.get_mut(&key) {
                shard.flags |= FLAG_HAS_DROPPED_SERIES;
            }
        }
        if let Some(f) = store.dropped_file.as_mut() {
            f.write_u32::<LittleEndian>(id)?;
        }
        Ok(())
    }

    /// Phase two: remove the series from the maps and free its slot.
    pub fn drop_commit(&self, store: &mut Store, id: u32) -> Result<()> {
        let Some(series) = store.series.pop(id) else {
            return Ok(());
        };
        store.trie.pop(series.name.as_bytes());
        if series.tp != PointType::Log && series.bf_offset != u64::MAX {
            store.buffer.release_slot(series.bf_offset)?;
        }
        store.series_dirty = true;
        debug!(series = series.name, id, "Series dropped");
        Ok(())
    }

    /// Fsync the buffer file; driven by the buffersync timer.
    pub fn sync_buffer(&self) -> Result<()> {
        self.store.lock().buffer.fsync()
    }

    /// Fsync the drop log after a batch of prepares.
    pub fn sync_dropped(&self, store: &mut Store) -> Result<()> {
        if let Some(f) = store.dropped_file.as_mut() {
            f.flush()?;
            f.sync_data()?;
        }
        Ok(())
    }

    // ─────────────────────────── optimize ───────────────────────────────────

    /// Shards currently eligible for a rewrite.
    pub fn shards_to_optimize(&self) -> Vec<(ShardType, u64)> {
        let store = self.store.lock();
        store
            .shards
            .iter()
            .filter(|(_, s)| s.needs_optimize())
            .map(|(k, _)| *k)
            .collect()
    }

    /// Rewrite one shard: drop chunks of dropped series, collapse
    /// overlapping chunks, recover what is readable from corrupt ones.
    pub fn optimize_shard(&self, tp: ShardType, shard_id: u64) -> Result<()> {
        let mut store = self.store.lock();
        let store = &mut *store;
        let Some(old) = store.shards.get(&(tp, shard_id)) else {
            return Ok(());
        };
        let duration = old.duration;
        let ts_sz = old.ts_sz;
        let compression = store.compression;

        // Collect surviving points per series.
        let mut rewrites: Vec<(u32, Points)> = Vec::new();
        {
            let old = store.shards.get(&(tp, shard_id)).unwrap();
            let mut ids = Vec::new();
            store.series.walk(|id, s| {
                if s.idx.iter().any(|e| e.tp == tp && e.shard_id == shard_id) {
                    ids.push(id);
                }
            });
            for id in ids {
                let series = store.series.get(id).unwrap();
                if series.is_dropped() {
                    continue;
                }
                let mut points = Points::new(series.length, series.tp);
                for entry in series
                    .idx
                    .iter()
                    .filter(|e| e.tp == tp && e.shard_id == shard_id)
                {
                    // Unreadable chunks are skipped; optimize recovers the
                    // rest of the shard.
                    let _ = old.get_points(
                        &mut points,
                        &self.fcache,
                        entry,
                        series.tp,
                        0,
                        u64::MAX,
                        true,
                    )?;
                }
                if !points.is_empty() {
                    rewrites.push((id, points));
                }
            }
        }

        let tmp_dir = self.path.join(SHARDS_DIR).join(".optimize");
        let _ = std::fs::remove_dir_all(&tmp_dir);
        let mut fresh = Shard::create(&tmp_dir, shard_id, duration, tp, ts_sz, compression, Some(shard_id))?;

        let mut new_entries: Vec<(u32, crate::storage::shard::IdxEntry)> = Vec::new();
        for (id, points) in &rewrites {
            let mut a = 0;
            while a < points.len() {
                let b = points.len().min(a + u16::MAX as usize);
                let entry = fresh.write_points(&self.fcache, *id, points, a, b)?;
                new_entries.push((*id, entry));
                a = b;
            }
        }

        // Swap files into place and republish the shard.
        let old = store.shards.remove(&(tp, shard_id)).unwrap();
        self.fcache.evict(&old.path);
        self.fcache.evict(&fresh.path);
        std::fs::rename(&fresh.path, &old.path)?;
        std::fs::rename(&fresh.idx_path, &old.idx_path)?;
        let _ = std::fs::remove_dir_all(&tmp_dir);

        fresh.path = old.path.clone();
        fresh.idx_path = old.idx_path.clone();
        fresh.replacing = None;

        let mut ids = Vec::new();
        store.series.walk(|id, s| {
            if s.idx.iter().any(|e| e.tp == tp && e.shard_id == shard_id) {
                ids.push(id);
            }
        });
        for id in ids {
            let series = store.series.get_mut(id).unwrap();
            series.idx_remove_shard(tp, shard_id);
        }
        for (id, entry) in new_entries {
            store.series.get_mut(id).unwrap().idx_insert(entry);
        }
        {
            let mut ids = Vec::new();
            store.series.walk(|id, _| ids.push(id));
            for id in ids {
                store.series.get_mut(id).unwrap().update_props();
            }
        }
        store.shards.insert((tp, shard_id), fresh);

        info!(shard = shard_id, chunks = rewrites.len(), "Shard optimized");
        Ok(())
    }

    /// Drop shards whose whole window is past the expiration horizon.
    pub fn expire_shards(&self) -> Result<usize> {
        let (expiration_num, expiration_log) = {
            let meta = self.meta.lock();
            (meta.expiration_num, meta.expiration_log)
        };
        if expiration_num == 0 && expiration_log == 0 {
            return Ok(0);
        }
        let now = self.time.now();
        let mut store = self.store.lock();
        let store = &mut *store;
        let mut victims = Vec::new();
        for (&(tp, id), shard) in store.shards.iter() {
            let horizon = match tp {
                ShardType::Num => expiration_num,
                ShardType::Log => expiration_log,
            };
            if horizon == 0 {
                continue;
            }
            let window_end = (id + 1) * shard.duration;
            if window_end < now.saturating_sub(horizon) {
                victims.push((tp, id));
            }
        }
        for key in &victims {
            if let Some(mut shard) = store.shards.remove(key) {
                shard.mark_removed();
                shard.remove_files(&self.fcache);
            }
            let mut ids = Vec::new();
            store.series.walk(|id, s| {
                if s.idx.iter().any(|e| (e.tp, e.shard_id) == *key) {
                    ids.push(id);
                }
            });
            for id in ids {
                let series = store.series.get_mut(id).unwrap();
                series.idx_remove_shard(key.0, key.1);
                series.update_props();
            }
            info!(shard = key.1, "Expired shard removed");
        }
        Ok(victims.len())
    }

    // ─────────────────────────── persistence ────────────────────────────────

    /// Write the series catalog when it changed.
    pub fn save_series(&self) -> Result<()> {
        let mut store = self.store.lock();
        if !store.series_dirty {
            return Ok(());
        }
        save_series(&store)?;
        store.series_dirty = false;
        Ok(())
    }

    /// Orderly shutdown: flush buffers, persist catalogs.
    pub fn shutdown(&self) -> Result<()> {
        self.flush_all()?;
        self.save_series()?;
        let mut store = self.store.lock();
        self.sync_dropped(&mut store)?;
        store.buffer.fsync()?;
        info!(db = self.meta.lock().name, "Database shut down");
        Ok(())
    }

    /// True while backup mode holds file handles closed.
    pub fn in_backup_mode(&self) -> bool {
        self.server.flags() & FLAG_BACKUP_MODE != 0
    }

    /// Release every file handle for backup mode: buffer, drop log, shard
    /// handles and the fifo. Memory-resident state stays live.
    pub fn close_files(&self) -> Result<()> {
        let mut store = self.store.lock();
        store.buffer.fsync()?;
        store.buffer.close()?;
        if let Some(mut f) = store.dropped_file.take() {
            f.flush()?;
        }
        drop(store);
        self.fcache.clear();
        if let Some(fifo) = &self.fifo {
            fifo.lock().close()?;
        }
        Ok(())
    }

    /// Undo [`Database::close_files`] when backup mode ends.
    pub fn reopen_files(&self) -> Result<()> {
        let mut store = self.store.lock();
        store.buffer.reopen()?;
        store.dropped_file = Some(
            OpenOptions::new()
                .append(true)
                .create(true)
                .open(self.path.join(DROPPED_FN))?,
        );
        drop(store);
        if let Some(fifo) = &self.fifo {
            fifo.lock().reopen()?;
        }
        Ok(())
    }
}

fn value_bits(val: &Value) -> u64 {
    match val {
        Value::Int(v) => *v as u64,
        Value::Double(v) => v.to_bits(),
        Value::Log(_) => 0,
    }
}

fn validate_db_name(name: &str) -> Result<()> {
    let ok = !name.is_empty()
        && name.len() <= 20
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_')
        && name.chars().next().is_some_and(|c| c.is_ascii_lowercase());
    if ok {
        Ok(())
    } else {
        Err(TdbError::Config(format!("invalid database name: '{name}'")))
    }
}

// ─────────────────────────── metadata files ─────────────────────────────────

fn save_meta(path: &Path, meta: &DbMeta) -> Result<()> {
    let mut p = Packer::new();
    p.add_int(DB_SCHEMA);
    p.add_string(&meta.name);
    p.add_string(&meta.uuid.to_string());
    p.add_string(meta.precision.as_str());
    p.add_int(meta.buffer_size as i64);
    p.add_int(meta.duration_num as i64);
    p.add_int(meta.duration_log as i64);
    p.add_string(&meta.tz);
    p.add_double(meta.drop_threshold);
    p.add_int(meta.select_points_limit as i64);
    p.add_int(meta.list_limit as i64);
    p.add_int(meta.expiration_num as i64);
    p.add_int(meta.expiration_log as i64);
    std::fs::write(path.join(DB_FN), p.as_slice())?;
    Ok(())
}

fn load_meta(path: &Path) -> Result<DbMeta> {
    let data = std::fs::read(path.join(DB_FN))
        .map_err(|e| TdbError::Config(format!("cannot read database header: {e}")))?;
    let mut up = Unpacker::new(&data);
    let schema = up.expect_int()?;
    if schema != DB_SCHEMA {
        return Err(TdbError::Corrupt(format!(
            "unsupported database schema {schema}"
        )));
    }
    let name = up.expect_str()?.to_string();
    let uuid = up
        .expect_str()?
        .parse()
        .map_err(|_| TdbError::Corrupt("invalid database uuid".into()))?;
    let precision = Precision::from_str(up.expect_str()?)
        .ok_or_else(|| TdbError::Corrupt("invalid time precision".into()))?;
    let buffer_size = up.expect_int()? as usize;
    let duration_num = up.expect_int()? as u64;
    let duration_log = up.expect_int()? as u64;
    let tz = up.expect_str()?.to_string();
    let drop_threshold = match up.next_obj()? {
        crate::qpack::Obj::Double(v) => v,
        crate::qpack::Obj::Int(v) => v as f64,
        _ => return Err(TdbError::Corrupt("invalid drop threshold".into())),
    };
    let select_points_limit = up.expect_int()? as usize;
    let list_limit = up.expect_int()? as usize;
    let expiration_num = up.expect_int()? as u64;
    let expiration_log = up.expect_int()? as u64;
    Ok(DbMeta {
        name,
        uuid,
        precision,
        buffer_size,
        duration_num,
        duration_log,
        tz,
        drop_threshold,
        select_points_limit,
        list_limit,
        expiration_num,
        expiration_log,
    })
}

fn save_series(store: &Store) -> Result<()> {
    let mut p = Packer::new();
    p.add_int(SERIES_SCHEMA);
    store.series.walk(|id, s| {
        p.add_string(&s.name);
        p.add_int(id as i64);
        p.add_int(match s.tp {
            PointType::Int => 0,
            PointType::Double => 1,
            PointType::Log => 2,
        });
        p.add_int(s.flags as i64);
        p.add_int(s.pool as i64);
    });
    std::fs::write(&store.series_path, p.as_slice())?;
    Ok(())
}

fn load_series(store: &mut Store) -> Result<()> {
    if !store.series_path.exists() {
        return Ok(());
    }
    let data = std::fs::read(&store.series_path)?;
    let mut up = Unpacker::new(&data);
    let schema = up.expect_int()?;
    if schema != SERIES_SCHEMA {
        return Err(TdbError::Corrupt(format!(
            "unsupported series schema {schema}"
        )));
    }
    while !up.at_end() {
        let name = up.expect_str()?.to_string();
        let id = up.expect_int()? as u32;
        let tp = match up.expect_int()? {
            0 => PointType::Int,
            1 => PointType::Double,
            2 => PointType::Log,
            other => {
                return Err(TdbError::Corrupt(format!("invalid series type {other}")))
            }
        };
        let flags = up.expect_int()? as u8;
        let pool = up.expect_int()? as u16;

        let mut series = Series::new(id, pool, name.clone(), tp, false);
        series.flags = flags;
        series.bf_offset = u64::MAX;
        store.trie.add(name.as_bytes(), id);
        store
            .series
            .add(id, series, false)
            .map_err(|_| TdbError::Corrupt(format!("duplicate series id {id}")))?;
        store.next_series_id = store.next_series_id.max(id + 1);
    }
    Ok(())
}

/// Apply the drop log: series flagged before the last shutdown are purged
/// from the catalog, then the log is reset.
fn apply_dropped(path: &Path, store: &mut Store) -> Result<()> {
    let dropped_path = path.join(DROPPED_FN);
    if !dropped_path.exists() {
        return Ok(());
    }
    let mut f = File::open(&dropped_path)?;
    let len = f.metadata()?.len();
    let mut count = 0;
    for _ in 0..len / 4 {
        let id = f.read_u32::<LittleEndian>()?;
        if let Some(series) = store.series.pop(id) {
            store.trie.pop(series.name.as_bytes());
            store.series_dirty = true;
            count += 1;
        }
    }
    if count > 0 {
        info!(count, "Dropped series purged from catalog");
        save_series(store)?;
        store.series_dirty = false;
    }
    std::fs::write(&dropped_path, b"")?;
    Ok(())
}

fn load_shards(path: &Path, store: &mut Store) -> Result<()> {
    let dir = path.join(SHARDS_DIR);
    if !dir.exists() {
        return Ok(());
    }
    for entry in std::fs::read_dir(&dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        let Some(stem) = name.strip_suffix(".sdb") else { continue };
        let (tp, id_str) = match stem.strip_suffix("_log") {
            Some(id) => (ShardType::Log, id),
            None => (ShardType::Num, stem),
        };
        let Ok(id) = id_str.parse::<u64>() else { continue };

        let (mut shard, loaded) = Shard::load(&dir, id, tp)?;
        for li in loaded {
            match store.series.get_mut(li.series_id) {
                Some(series) => series.idx_insert(li.entry),
                None => {
                    // Chunk of a series dropped earlier; optimize will
                    // reclaim it.
                    shard.flags |= FLAG_HAS_DROPPED_SERIES;
                }
            }
        }
        store.shards.insert((tp, id), shard);
    }
    Ok(())
}

fn load_buffer(store: &mut Store) -> Result<()> {
    let loaded = store.buffer.load()?;
    let mut orphans = Vec::new();
    for slot in loaded {
        match store.series.get_mut(slot.series_id) {
            Some(series) => {
                let cap = store.buffer.len;
                let mut points = Points::new(cap, series.tp);
                for (ts, bits) in &slot.points {
                    let val = match series.tp {
                        PointType::Int => Value::Int(*bits as i64),
                        PointType::Double => Value::Double(f64::from_bits(*bits)),
                        PointType::Log => continue,
                    };
                    points.add_point(*ts, val)?;
                }
                series.buffer = points;
                series.bf_offset = slot.offset;
            }
            None => orphans.push(slot.offset),
        }
    }
    for offset in orphans {
        store.buffer.release_slot(offset)?;
    }
    // Series without a slot get one lazily on their next write.
    Ok(())
}

/// Rewrite the buffer file with a new slot size. Series whose points no
/// longer fit are flushed into shards first; the swap is atomic via a
/// temporary file.
fn migrate_buffer(
    path: &Path,
    store: &mut Store,
    meta: &mut DbMeta,
    new_size: usize,
    fcache: &Arc<FileCache>,
) -> Result<()> {
    info!(
        old_size = meta.buffer_size,
        new_size, "Migrating buffer to new slot size"
    );
    let tmp_path = path.join(BUFFER_TMP_FN);
    let mut fresh = Buffer::open_file(tmp_path.clone(), new_size)?;

    // Flush series that overflow the new capacity. This needs the shard
    // machinery, so it runs through a plain flush into the store.
    let overflow: Vec<u32> = {
        let mut ids = Vec::new();
        store.series.walk(|id, s| {
            if s.tp != PointType::Log && s.buffer.len() >= fresh.len {
                ids.push(id);
            }
        });
        ids
    };
    let ts_sz = if meta.precision == Precision::Seconds { 4 } else { 8 };
    for id in &overflow {
        flush_for_migration(store, path, fcache, *id, meta.duration_num, ts_sz)?;
    }

    let mut ids = Vec::new();
    store.series.walk(|id, s| {
        if s.tp != PointType::Log {
            ids.push(id);
        }
    });
    for id in ids {
        let offset = fresh.new_series(id)?;
        let series = store.series.get_mut(id).unwrap();
        let points: Vec<(u64, u64)> = series
            .buffer
            .iter()
            .map(|p| (p.ts, value_bits(&p.val)))
            .collect();
        fresh.write_slot(id, offset, &points)?;
        series.bf_offset = offset;
    }
    fresh.fsync()?;
    drop(fresh);

    std::fs::rename(&tmp_path, path.join(crate::storage::buffer::BUFFER_FN))?;
    store.buffer = Buffer::open(path, new_size)?;
    // Rebuild the free-slot stack from the migrated file.
    let _ = store.buffer.load()?;
    meta.buffer_size = new_size;
    info!("Buffer migration complete");
    Ok(())
}

/// Buffer-flush used during migration, before the Database value exists.
fn flush_for_migration(
    store: &mut Store,
    path: &Path,
    fcache: &Arc<FileCache>,
    id: u32,
    duration: u64,
    ts_sz: usize,
) -> Result<()> {
    let (points, tp) = {
        let series = store.series.get_mut(id).unwrap();
        let points = std::mem::replace(&mut series.buffer, Points::new(0, series.tp));
        (points, series.tp)
    };
    if points.is_empty() {
        return Ok(());
    }
    let shard_tp = ShardType::from_point_type(tp);
    let duration = duration.max(1);
    let compression = store.compression;
    let shards_dir = path.join(SHARDS_DIR);

    let slice = points.as_slice();
    let mut a = 0;
    while a < slice.len() {
        let shard_id = slice[a].ts / duration;
        let mut b = a + 1;
        while b < slice.len() && slice[b].ts / duration == shard_id {
            b += 1;
        }
        let shard = match store.shards.entry((shard_tp, shard_id)) {
            std::collections::hash_map::Entry::Occupied(e) => e.into_mut(),
            std::collections::hash_map::Entry::Vacant(e) => e.insert(Shard::create(
                &shards_dir,
                shard_id,
                duration,
                shard_tp,
                ts_sz,
                compression,
                None,
            )?),
        };
        let entry = shard.write_points(fcache, id, &points, a, b)?;
        store.series.get_mut(id).unwrap().idx_insert(entry);
        a = b;
    }
    Ok(())
}

// ─────────────────────────── servers file ───────────────────────────────────

pub const SERVERS_FN: &str = "servers.dat";
pub const SERVERS_SCHEMA: i64 = 1;

fn load_servers(
    path: &Path,
    self_uuid: Uuid,
    self_address: &str,
    self_port: u16,
) -> Result<(Vec<Arc<Server>>, Arc<Server>)> {
    let file = path.join(SERVERS_FN);
    if !file.exists() {
        let server = Arc::new(Server::new(
            self_uuid,
            self_address.to_string(),
            self_port,
            0,
        ));
        let servers = vec![server.clone()];
        save_servers(path, &servers)?;
        return Ok((servers, server));
    }

    let data = std::fs::read(&file)?;
    let mut up = Unpacker::new(&data);
    let schema = up.expect_int()?;
    if schema != SERVERS_SCHEMA {
        return Err(TdbError::Corrupt(format!(
            "unsupported servers schema {schema}"
        )));
    }
    let mut servers = Vec::new();
    while !up.at_end() {
        let uuid: Uuid = up
            .expect_str()?
            .parse()
            .map_err(|_| TdbError::Corrupt("invalid server uuid".into()))?;
        let address = up.expect_str()?.to_string();
        let port = up.expect_int()? as u16;
        let pool = up.expect_int()? as u16;
        servers.push(Arc::new(Server::new(uuid, address, port, pool)));
    }
    let self_server = servers
        .iter()
        .find(|s| s.uuid == self_uuid)
        .cloned()
        .ok_or_else(|| {
            TdbError::Corrupt("servers file does not contain this server".into())
        })?;
    Ok((servers, self_server))
}

pub fn save_servers(path: &Path, servers: &[Arc<Server>]) -> Result<()> {
    let mut p = Packer::new();
    p.add_int(SERVERS_SCHEMA);
    for s in servers {
        p.add_string(&s.uuid.to_string());
        p.add_string(&s.address);
        p.add_int(s.port as i64);
        p.add_int(s.pool as i64);
    }
    std::fs::write(path.join(SERVERS_FN), p.as_slice())?;
    Ok(())
}
