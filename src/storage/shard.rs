// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Shard files.
//!
//! A shard holds every chunk of every series whose timestamps fall inside
//! one fixed-duration window: `id = floor(ts / duration)`. Next to the data
//! file lives a companion `.idx` file so series chunk indices can be
//! attached without scanning; when the idx file is missing or short the
//! data file is scanned sequentially, exactly like a restart recovery.
//!
//! ## File layout
//!
//! ```text
//! [ShardHeader : 20 bytes]
//!   magic     : [u8;8]  = b"TDPSHARD"
//!   schema    : u8      = 1
//!   tp        : u8      (0 = numeric, 1 = log)
//!   flags     : u8      (persisted subset: is-compressed)
//!   ts_sz     : u8      (4 or 8)
//!   duration  : u64     (LE)
//!
//! [ChunkHeader: 28 bytes per chunk]
//!   series_id : u32     (LE)
//!   len       : u16     (point count)
//!   cinfo     : u16     (codec info; 0 for raw chunks)
//!   size      : u32     (data bytes that follow)
//!   start_ts  : u64
//!   end_ts    : u64
//!
//! [chunk data : size bytes]
//! ```
//!
//! Idx entries are 36 bytes: the chunk header fields plus the absolute
//! byte position of the chunk data.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use tracing::{debug, warn};

use crate::error::{Result, TdbError};
use crate::points::{PointType, Points};
use crate::storage::codec;
use crate::storage::fcache::FileCache;

pub const SHARD_MAGIC: &[u8; 8] = b"TDPSHARD";
pub const SHARD_SCHEMA: u8 = 1;
pub const SHARD_HEADER_SIZE: u64 = 20;
pub const CHUNK_HEADER_SIZE: u64 = 28;
pub const IDX_ENTRY_SIZE: u64 = 36;

// Shard status flags.
pub const FLAG_HAS_INDEX: u8 = 1 << 0;
pub const FLAG_HAS_OVERLAP: u8 = 1 << 1;
pub const FLAG_HAS_NEW_VALUES: u8 = 1 << 2;
pub const FLAG_HAS_DROPPED_SERIES: u8 = 1 << 3;
pub const FLAG_IS_REMOVED: u8 = 1 << 4;
pub const FLAG_IS_LOADING: u8 = 1 << 5;
pub const FLAG_IS_CORRUPT: u8 = 1 << 6;
pub const FLAG_IS_COMPRESSED: u8 = 1 << 7;

/// Value category of a shard; one shard never mixes numeric and log series.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShardType {
    Num,
    Log,
}

impl ShardType {
    pub fn from_point_type(tp: PointType) -> Self {
        match tp {
            PointType::Log => ShardType::Log,
            _ => ShardType::Num,
        }
    }
}

/// One chunk index entry as stored in a series' idx list.
#[derive(Debug, Clone, PartialEq)]
pub struct IdxEntry {
    pub shard_id: u64,
    pub tp: ShardType,
    /// Absolute byte position of the chunk data in the shard file.
    pub pos: u64,
    /// Point count.
    pub len: u16,
    pub cinfo: u16,
    /// Byte length of the chunk data on disk.
    pub size: u32,
    pub start_ts: u64,
    pub end_ts: u64,
}

/// An idx entry paired with the owning series, as recovered at load time.
#[derive(Debug, Clone)]
pub struct LoadedIdx {
    pub series_id: u32,
    pub entry: IdxEntry,
}

pub struct Shard {
    pub id: u64,
    pub tp: ShardType,
    pub duration: u64,
    pub ts_sz: usize,
    pub flags: u8,
    pub path: PathBuf,
    pub idx_path: PathBuf,
    /// Id of the shard this one replaces during an optimize rewrite. Held
    /// until the replacement is complete, then cleared.
    pub replacing: Option<u64>,
    /// Highest end_ts written so far; drives the overlap/new-values flags.
    max_end_ts: u64,
}

impl Shard {
    pub fn data_path(dir: &Path, id: u64, tp: ShardType) -> PathBuf {
        match tp {
            ShardType::Num => dir.join(format!("{id}.sdb")),
            ShardType::Log => dir.join(format!("{id}_log.sdb")),
        }
    }

    pub fn index_path(dir: &Path, id: u64, tp: ShardType) -> PathBuf {
        match tp {
            ShardType::Num => dir.join(format!("{id}.idx")),
            ShardType::Log => dir.join(format!("{id}_log.idx")),
        }
    }

    /// Create a new shard file, optionally as the successor of `replacing`.
    pub fn create(
        dir: &Path,
        id: u64,
        duration: u64,
        tp: ShardType,
        ts_sz: usize,
        compressed: bool,
        replacing: Option<u64>,
    ) -> Result<Self> {
        std::fs::create_dir_all(dir)
            .map_err(|e| TdbError::Storage(format!("create shard dir {dir:?}: {e}")))?;
        let path = Self::data_path(dir, id, tp);
        let idx_path = Self::index_path(dir, id, tp);
        let flags = if compressed { FLAG_IS_COMPRESSED } else { 0 } | FLAG_HAS_INDEX;

        let mut f = File::create(&path)
            .map_err(|e| TdbError::Storage(format!("create shard {path:?}: {e}")))?;
        f.write_all(SHARD_MAGIC)?;
        f.write_u8(SHARD_SCHEMA)?;
        f.write_u8(matches!(tp, ShardType::Log) as u8)?;
        f.write_u8(flags & FLAG_IS_COMPRESSED)?;
        f.write_u8(ts_sz as u8)?;
        f.write_u64::<LittleEndian>(duration)?;
        f.flush()?;
        File::create(&idx_path)?;

        debug!(shard = id, compressed, "Shard created");
        Ok(Shard {
            id,
            tp,
            duration,
            ts_sz,
            flags,
            path,
            idx_path,
            replacing,
            max_end_ts: 0,
        })
    }

    /// Open an existing shard and recover its chunk indices, preferring
    /// the idx file and falling back to a sequential data scan.
    pub fn load(dir: &Path, id: u64, tp: ShardType) -> Result<(Self, Vec<LoadedIdx>)> {
        let path = Self::data_path(dir, id, tp);
        let idx_path = Self::index_path(dir, id, tp);

        let mut f = File::open(&path)
            .map_err(|e| TdbError::Storage(format!("open shard {path:?}: {e}")))?;
        let mut magic = [0u8; 8];
        f.read_exact(&mut magic)?;
        if &magic != SHARD_MAGIC {
            return Err(TdbError::Corrupt(format!("bad shard magic in {path:?}")));
        }
        let schema = f.read_u8()?;
        if schema != SHARD_SCHEMA {
            return Err(TdbError::Corrupt(format!(
                "unsupported shard schema {schema} in {path:?}"
            )));
        }
        let tp_byte = f.read_u8()?;
        if (tp_byte == 1) != matches!(tp, ShardType::Log) {
            return Err(TdbError::Corrupt(format!("shard type mismatch in {path:?}")));
        }
        let persisted = f.read_u8()?;
        let ts_sz = f.read_u8()? as usize;
        let duration = f.read_u64::<LittleEndian>()?;

        let mut shard = Shard {
            id,
            tp,
            duration,
            ts_sz,
            flags: (persisted & FLAG_IS_COMPRESSED) | FLAG_IS_LOADING,
            path,
            idx_path,
            replacing: None,
            max_end_ts: 0,
        };

        let data_len = f.metadata()?.len();
        let entries = match shard.load_idx_file(data_len) {
            Ok(entries) => {
                shard.flags |= FLAG_HAS_INDEX;
                entries
            }
            Err(e) => {
                warn!(shard = id, error = %e, "Idx file unusable, scanning shard");
                shard.scan_data(&mut f, data_len)?
            }
        };

        for le in &entries {
            if le.entry.start_ts < shard.max_end_ts {
                shard.flags |= FLAG_HAS_OVERLAP;
            }
            shard.max_end_ts = shard.max_end_ts.max(le.entry.end_ts);
        }

        shard.flags &= !FLAG_IS_LOADING;
        debug!(shard = id, chunks = entries.len(), "Shard loaded");
        Ok((shard, entries))
    }

    fn load_idx_file(&self, data_len: u64) -> Result<Vec<LoadedIdx>> {
        let mut f = File::open(&self.idx_path)
            .map_err(|e| TdbError::Storage(format!("open idx {:?}: {e}", self.idx_path)))?;
        let idx_len = f.metadata()?.len();
        if idx_len % IDX_ENTRY_SIZE != 0 {
            return Err(TdbError::Corrupt("idx file length not a whole entry".into()));
        }
        let mut entries = Vec::with_capacity((idx_len / IDX_ENTRY_SIZE) as usize);
        for _ in 0..idx_len / IDX_ENTRY_SIZE {
            let series_id = f.read_u32::<LittleEndian>()?;
            let pos = f.read_u64::<LittleEndian>()?;
            let len = f.read_u16::<LittleEndian>()?;
            let cinfo = f.read_u16::<LittleEndian>()?;
            let size = f.read_u32::<LittleEndian>()?;
            let start_ts = f.read_u64::<LittleEndian>()?;
            let end_ts = f.read_u64::<LittleEndian>()?;
            if pos + size as u64 > data_len {
                return Err(TdbError::Corrupt("idx entry beyond shard end".into()));
            }
            entries.push(LoadedIdx {
                series_id,
                entry: IdxEntry {
                    shard_id: self.id,
                    tp: self.tp,
                    pos,
                    len,
                    cinfo,
                    size,
                    start_ts,
                    end_ts,
                },
            });
        }
        Ok(entries)
    }

    /// Sequentially scan chunk headers; used when the idx file is lost.
    /// A malformed header stops the scan and marks the shard corrupt so
    /// later chunks are not invented from garbage.
    fn scan_data(&mut self, f: &mut File, data_len: u64) -> Result<Vec<LoadedIdx>> {
        let mut entries = Vec::new();
        let mut offset = SHARD_HEADER_SIZE;
        f.seek(SeekFrom::Start(offset))?;

        while offset + CHUNK_HEADER_SIZE <= data_len {
            let series_id = f.read_u32::<LittleEndian>()?;
            let len = f.read_u16::<LittleEndian>()?;
            let cinfo = f.read_u16::<LittleEndian>()?;
            let size = f.read_u32::<LittleEndian>()?;
            let start_ts = f.read_u64::<LittleEndian>()?;
            let end_ts = f.read_u64::<LittleEndian>()?;

            let pos = offset + CHUNK_HEADER_SIZE;
            if len == 0 || pos + size as u64 > data_len || start_ts > end_ts {
                warn!(shard = self.id, offset, "Partial chunk found, truncating scan");
                self.flags |= FLAG_IS_CORRUPT;
                break;
            }
            entries.push(LoadedIdx {
                series_id,
                entry: IdxEntry {
                    shard_id: self.id,
                    tp: self.tp,
                    pos,
                    len,
                    cinfo,
                    size,
                    start_ts,
                    end_ts,
                },
            });
            offset = pos + size as u64;
            f.seek(SeekFrom::Start(offset))?;
        }

        // Rebuild the idx file from the scan.
        self.rewrite_idx(&entries)?;
        self.flags |= FLAG_HAS_INDEX;
        Ok(entries)
    }

    fn rewrite_idx(&self, entries: &[LoadedIdx]) -> Result<()> {
        let mut f = File::create(&self.idx_path)?;
        for le in entries {
            Self::write_idx_entry(&mut f, le.series_id, &le.entry)?;
        }
        f.flush()?;
        Ok(())
    }

    fn write_idx_entry(f: &mut File, series_id: u32, entry: &IdxEntry) -> Result<()> {
        f.write_u32::<LittleEndian>(series_id)?;
        f.write_u64::<LittleEndian>(entry.pos)?;
        f.write_u16::<LittleEndian>(entry.len)?;
        f.write_u16::<LittleEndian>(entry.cinfo)?;
        f.write_u32::<LittleEndian>(entry.size)?;
        f.write_u64::<LittleEndian>(entry.start_ts)?;
        f.write_u64::<LittleEndian>(entry.end_ts)?;
        Ok(())
    }

    /// Whether new writes may land in this shard.
    pub fn is_writable(&self) -> bool {
        self.flags & (FLAG_IS_REMOVED | FLAG_IS_CORRUPT) == 0
    }

    /// Whether the optimize pass should rewrite this shard.
    pub fn needs_optimize(&self) -> bool {
        self.flags
            & (FLAG_HAS_OVERLAP
                | FLAG_HAS_NEW_VALUES
                | FLAG_HAS_DROPPED_SERIES
                | FLAG_IS_CORRUPT)
            != 0
            && self.flags & FLAG_IS_REMOVED == 0
    }

    /// Append one codec chunk for `points[start..end]` of `series_id`.
    /// Returns the idx entry for the series' chunk list.
    pub fn write_points(
        &mut self,
        fcache: &FileCache,
        series_id: u32,
        points: &Points,
        start: usize,
        end: usize,
    ) -> Result<IdxEntry> {
        if !self.is_writable() {
            return Err(TdbError::Storage(format!(
                "shard {} is not writable",
                self.id
            )));
        }
        let (cinfo, data) = if self.flags & FLAG_IS_COMPRESSED != 0 {
            codec::zip(points, start, end)
        } else {
            let raw = match points.tp() {
                PointType::Log => codec::pack_raw_log(points.as_slice(), start, end, self.ts_sz),
                _ => codec::pack_raw_num(points.as_slice(), start, end, self.ts_sz),
            };
            (0u16, raw)
        };
        let start_ts = points.get(start).map(|p| p.ts).unwrap_or(0);
        let end_ts = points.get(end - 1).map(|p| p.ts).unwrap_or(0);

        let shared = fcache.open(&self.path)?;
        let mut f = shared.lock();
        let pos = f.seek(SeekFrom::End(0))? + CHUNK_HEADER_SIZE;
        f.write_u32::<LittleEndian>(series_id)?;
        f.write_u16::<LittleEndian>((end - start) as u16)?;
        f.write_u16::<LittleEndian>(cinfo)?;
        f.write_u32::<LittleEndian>(data.len() as u32)?;
        f.write_u64::<LittleEndian>(start_ts)?;
        f.write_u64::<LittleEndian>(end_ts)?;
        f.write_all(&data)?;
        f.flush()?;
        drop(f);

        let entry = IdxEntry {
            shard_id: self.id,
            tp: self.tp,
            pos,
            len: (end - start) as u16,
            cinfo,
            size: data.len() as u32,
            start_ts,
            end_ts,
        };

        let mut idx_f = OpenOptions::new().append(true).open(&self.idx_path)?;
        Self::write_idx_entry(&mut idx_f, series_id, &entry)?;
        idx_f.flush()?;

        if start_ts < self.max_end_ts {
            self.flags |= FLAG_HAS_OVERLAP;
        }
        if end_ts < self.max_end_ts {
            self.flags |= FLAG_HAS_NEW_VALUES;
        }
        self.max_end_ts = self.max_end_ts.max(end_ts);

        debug!(
            shard = self.id,
            series = series_id,
            points = end - start,
            bytes = data.len(),
            "Chunk written"
        );
        Ok(entry)
    }

    /// Read one chunk, filter it to `[start_ts, end_ts]` and merge or
    /// append into `out`. Returns false when the chunk is unreadable, in
    /// which case the result is partial and the caller marks this shard
    /// corrupt.
    pub fn get_points(
        &self,
        out: &mut Points,
        fcache: &FileCache,
        entry: &IdxEntry,
        tp: PointType,
        start_ts: u64,
        end_ts: u64,
        has_overlap: bool,
    ) -> Result<bool> {
        let shared = fcache.open(&self.path)?;
        let mut buf = vec![0u8; entry.size as usize];
        {
            let mut f = shared.lock();
            f.seek(SeekFrom::Start(entry.pos))?;
            if f.read_exact(&mut buf).is_err() {
                return Ok(false);
            }
        }
        let reader = self.reader(tp);
        let chunk = match reader(&buf, entry.len as usize, entry.cinfo, self.ts_sz, tp) {
            Ok(chunk) => chunk,
            Err(e) => {
                warn!(shard = self.id, pos = entry.pos, error = %e, "Unreadable chunk");
                return Ok(false);
            }
        };
        if has_overlap {
            let mut in_range = Points::new(chunk.len(), tp);
            in_range.extend_in_range(&chunk, start_ts, end_ts);
            out.merge(in_range);
        } else {
            out.extend_in_range(&chunk, start_ts, end_ts);
        }
        Ok(true)
    }

    /// Select one of the eight specialized chunk readers, keyed on
    /// {value type, timestamp width, compression}.
    fn reader(&self, _tp: PointType) -> ChunkReader {
        let compressed = self.flags & FLAG_IS_COMPRESSED != 0;
        match (self.tp, self.ts_sz, compressed) {
            (ShardType::Num, 4, false) => get_points_num32,
            (ShardType::Num, _, false) => get_points_num64,
            (ShardType::Log, 4, false) => get_points_log32,
            (ShardType::Log, _, false) => get_points_log64,
            (ShardType::Num, 4, true) => get_points_num32_compressed,
            (ShardType::Num, _, true) => get_points_num64_compressed,
            (ShardType::Log, 4, true) => get_points_log32_compressed,
            (ShardType::Log, _, true) => get_points_log64_compressed,
        }
    }

    /// Mark removed; file removal happens once the owner drops the shard.
    pub fn mark_removed(&mut self) {
        self.flags |= FLAG_IS_REMOVED;
    }

    /// Unlink data and idx files, dropping cache handles first.
    pub fn remove_files(&self, fcache: &FileCache) {
        fcache.evict(&self.path);
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!(shard = self.id, error = %e, "Cannot remove shard file");
        }
        if let Err(e) = std::fs::remove_file(&self.idx_path) {
            warn!(shard = self.id, error = %e, "Cannot remove shard idx file");
        }
    }
}

type ChunkReader = fn(&[u8], usize, u16, usize, PointType) -> Result<Points>;

fn get_points_num32(b: &[u8], len: usize, _cinfo: u16, _ts: usize, tp: PointType) -> Result<Points> {
    codec::unpack_raw_num(b, len, 4, tp)
}

fn get_points_num64(b: &[u8], len: usize, _cinfo: u16, _ts: usize, tp: PointType) -> Result<Points> {
    codec::unpack_raw_num(b, len, 8, tp)
}

fn get_points_log32(b: &[u8], len: usize, _cinfo: u16, _ts: usize, _tp: PointType) -> Result<Points> {
    codec::unpack_raw_log(b, len, 4)
}

fn get_points_log64(b: &[u8], len: usize, _cinfo: u16, _ts: usize, _tp: PointType) -> Result<Points> {
    codec::unpack_raw_log(b, len, 8)
}

fn get_points_num32_compressed(
    b: &[u8],
    len: usize,
    cinfo: u16,
    _ts: usize,
    tp: PointType,
) -> Result<Points> {
    codec::unzip(b, len, cinfo, tp)
}

fn get_points_num64_compressed(
    b: &[u8],
    len: usize,
    cinfo: u16,
    _ts: usize,
    tp: PointType,
) -> Result<Points> {
    codec::unzip(b, len, cinfo, tp)
}

fn get_points_log32_compressed(
    b: &[u8],
    len: usize,
    cinfo: u16,
    _ts: usize,
    _tp: PointType,
) -> Result<Points> {
    codec::unzip_log(b, len, cinfo)
}

fn get_points_log64_compressed(
    b: &[u8],
    len: usize,
    cinfo: u16,
    _ts: usize,
    _tp: PointType,
) -> Result<Points> {
    codec::unzip_log(b, len, cinfo)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::points::Value;

    fn sample_points(n: usize) -> Points {
        let mut p = Points::new(n, PointType::Int);
        for i in 0..n {
            p.add_point(100 + i as u64 * 10, Value::Int(i as i64)).unwrap();
        }
        p
    }

    #[test]
    fn test_write_then_read_chunk() {
        let dir = tempfile::tempdir().unwrap();
        let fcache = FileCache::new(8);
        let mut shard =
            Shard::create(dir.path(), 7, 3600, ShardType::Num, 8, true, None).unwrap();
        let points = sample_points(16);

        let entry = shard.write_points(&fcache, 1, &points, 0, 16).unwrap();
        assert_eq!(entry.len, 16);
        assert_eq!(entry.start_ts, 100);
        assert_eq!(entry.end_ts, 250);

        let mut out = Points::new(16, PointType::Int);
        let ok = shard
            .get_points(&mut out, &fcache, &entry, PointType::Int, 0, u64::MAX, false)
            .unwrap();
        assert!(ok);
        assert_eq!(out.as_slice(), points.as_slice());
    }

    #[test]
    fn test_read_filters_by_range() {
        let dir = tempfile::tempdir().unwrap();
        let fcache = FileCache::new(8);
        let mut shard =
            Shard::create(dir.path(), 7, 3600, ShardType::Num, 8, true, None).unwrap();
        let points = sample_points(10);
        let entry = shard.write_points(&fcache, 1, &points, 0, 10).unwrap();

        let mut out = Points::new(4, PointType::Int);
        shard
            .get_points(&mut out, &fcache, &entry, PointType::Int, 120, 150, false)
            .unwrap();
        let ts: Vec<u64> = out.iter().map(|p| p.ts).collect();
        assert_eq!(ts, vec![120, 130, 140, 150]);
    }

    #[test]
    fn test_load_from_idx_file() {
        let dir = tempfile::tempdir().unwrap();
        let fcache = FileCache::new(8);
        let points = sample_points(8);
        {
            let mut shard =
                Shard::create(dir.path(), 3, 3600, ShardType::Num, 8, true, None).unwrap();
            shard.write_points(&fcache, 11, &points, 0, 8).unwrap();
            shard.write_points(&fcache, 12, &points, 0, 4).unwrap();
        }
        let (shard, entries) = Shard::load(dir.path(), 3, ShardType::Num).unwrap();
        assert!(shard.flags & FLAG_HAS_INDEX != 0);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].series_id, 11);
        assert_eq!(entries[1].series_id, 12);
    }

    #[test]
    fn test_load_scans_when_idx_missing() {
        let dir = tempfile::tempdir().unwrap();
        let fcache = FileCache::new(8);
        let points = sample_points(8);
        {
            let mut shard =
                Shard::create(dir.path(), 3, 3600, ShardType::Num, 8, false, None).unwrap();
            shard.write_points(&fcache, 11, &points, 0, 8).unwrap();
        }
        std::fs::remove_file(Shard::index_path(dir.path(), 3, ShardType::Num)).unwrap();
        let (shard, entries) = Shard::load(dir.path(), 3, ShardType::Num).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].entry.len, 8);
        assert!(shard.flags & FLAG_IS_CORRUPT == 0);

        // And the scan rebuilt the idx file.
        let (_, entries2) = Shard::load(dir.path(), 3, ShardType::Num).unwrap();
        assert_eq!(entries2.len(), 1);
    }

    #[test]
    fn test_overlap_flags_on_out_of_order_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let fcache = FileCache::new(8);
        let mut shard =
            Shard::create(dir.path(), 3, 3600, ShardType::Num, 8, true, None).unwrap();
        let late = sample_points(8); // ts 100..170
        let mut early = Points::new(4, PointType::Int);
        for i in 0..4 {
            early.add_point(10 + i, Value::Int(0)).unwrap();
        }
        shard.write_points(&fcache, 1, &late, 0, 8).unwrap();
        assert!(!shard.needs_optimize());
        shard.write_points(&fcache, 2, &early, 0, 4).unwrap();
        assert!(shard.flags & FLAG_HAS_OVERLAP != 0);
        assert!(shard.needs_optimize());
    }
}
