// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Series metadata and point access.
//!
//! A series owns its live (buffered) points plus an ordered list of chunk
//! index entries pointing into shard files. Reads concatenate in-range
//! chunks with the live buffer and fall back to a sort-merge when entries
//! overlap.

use std::collections::HashMap;

use tracing::warn;

use crate::error::Result;
use crate::points::{PointType, Points, Value};
use crate::storage::fcache::FileCache;
use crate::storage::shard::{IdxEntry, Shard, ShardType};

// Series flags.
pub const FLAG_DROPPED: u8 = 1 << 0;
pub const FLAG_INIT_REPLICATE: u8 = 1 << 1;
/// Which server of the pool owns the series' primary copy (0 or 1).
pub const FLAG_SERVER_ID: u8 = 1 << 2;
pub const FLAG_TS32: u8 = 1 << 3;
pub const FLAG_LOG: u8 = 1 << 4;

/// Result of a series read; `partial` is set when a corrupt chunk was
/// skipped, listing the shards involved.
pub struct ReadResult {
    pub points: Points,
    pub partial: bool,
    pub corrupt_shards: Vec<(ShardType, u64)>,
}

pub struct Series {
    pub id: u32,
    pub pool: u16,
    /// Shard-group bitmask derived from the name hash.
    pub mask: u16,
    pub flags: u8,
    pub name: String,
    pub tp: PointType,
    /// Lowest timestamp across buffer and shards; u64::MAX while empty.
    pub start: u64,
    /// Highest timestamp across buffer and shards; 0 while empty.
    pub end: u64,
    /// Total point count across buffer and shards.
    pub length: usize,
    /// Chunk index entries, ordered by start_ts.
    pub idx: Vec<IdxEntry>,
    /// Live, not-yet-flushed points.
    pub buffer: Points,
    /// Byte offset of the reserved buffer slot.
    pub bf_offset: u64,
}

/// 8-bit byte sum of a series name, shared with the pool lookup.
pub fn name_mask(name: &str) -> u16 {
    name.bytes().fold(0u8, |acc, b| acc.wrapping_add(b)) as u16
}

impl Series {
    pub fn new(id: u32, pool: u16, name: String, tp: PointType, ts32: bool) -> Self {
        let mut flags = 0;
        if ts32 {
            flags |= FLAG_TS32;
        }
        if tp == PointType::Log {
            flags |= FLAG_LOG;
        }
        let mask = name_mask(&name);
        Series {
            id,
            pool,
            mask,
            flags,
            name,
            tp,
            start: u64::MAX,
            end: 0,
            length: 0,
            idx: Vec::new(),
            buffer: Points::new(0, tp),
            bf_offset: 0,
        }
    }

    pub fn is_dropped(&self) -> bool {
        self.flags & FLAG_DROPPED != 0
    }

    pub fn shard_type(&self) -> ShardType {
        ShardType::from_point_type(self.tp)
    }

    /// Append a point to the live buffer, maintaining the start/end/length
    /// invariants. The caller persists the point in the buffer file and
    /// flushes the slot when full.
    pub fn add_point_mem(&mut self, ts: u64, val: Value) -> Result<()> {
        self.buffer.add_point(ts, val)?;
        self.length += 1;
        if ts < self.start {
            self.start = ts;
        }
        if ts > self.end {
            self.end = ts;
        }
        Ok(())
    }

    /// Insert a chunk index entry at its start_ts position.
    pub fn idx_insert(&mut self, entry: IdxEntry) {
        let at = self
            .idx
            .partition_point(|e| e.start_ts <= entry.start_ts);
        self.idx.insert(at, entry);
    }

    /// Remove every idx entry that lives in the given shard. Returns the
    /// number of points dropped from the index.
    pub fn idx_remove_shard(&mut self, tp: ShardType, shard_id: u64) -> usize {
        let before: usize = self.idx.iter().map(|e| e.len as usize).sum();
        self.idx.retain(|e| !(e.tp == tp && e.shard_id == shard_id));
        let after: usize = self.idx.iter().map(|e| e.len as usize).sum();
        before - after
    }

    /// Whether any pair of idx entries overlaps in time.
    pub fn idx_has_overlap(&self) -> bool {
        let mut max_end = 0u64;
        for e in &self.idx {
            if e.start_ts < max_end {
                return true;
            }
            max_end = max_end.max(e.end_ts);
        }
        false
    }

    /// Collect every point of this series in `[start_ts, end_ts]`,
    /// concatenating in-range chunks with the live buffer. When idx
    /// entries overlap the result is built with a sort-merge instead of a
    /// plain append.
    pub fn get_points(
        &self,
        shards: &HashMap<(ShardType, u64), Shard>,
        fcache: &FileCache,
        start_ts: u64,
        end_ts: u64,
    ) -> Result<ReadResult> {
        let mut out = Points::new(self.length, self.tp);
        let has_overlap = self.idx_has_overlap();
        let mut partial = false;
        let mut corrupt_shards = Vec::new();

        for entry in &self.idx {
            if entry.end_ts < start_ts || entry.start_ts > end_ts {
                continue;
            }
            let Some(shard) = shards.get(&(entry.tp, entry.shard_id)) else {
                warn!(series = self.id, shard = entry.shard_id, "Idx entry without shard");
                partial = true;
                continue;
            };
            let ok = shard.get_points(
                &mut out,
                fcache,
                entry,
                self.tp,
                start_ts,
                end_ts,
                has_overlap,
            )?;
            if !ok {
                partial = true;
                corrupt_shards.push((entry.tp, entry.shard_id));
            }
        }

        // Live buffer points come last; they can still overlap flushed
        // chunks when old timestamps were inserted after a flush.
        let buffer_overlaps = self
            .buffer
            .first()
            .zip(out.last().map(|p| p.ts))
            .is_some_and(|(first, out_end)| first.ts < out_end);
        if buffer_overlaps {
            let mut in_range = Points::new(self.buffer.len(), self.tp);
            in_range.extend_in_range(&self.buffer, start_ts, end_ts);
            out.merge(in_range);
        } else {
            out.extend_in_range(&self.buffer, start_ts, end_ts);
        }

        Ok(ReadResult {
            points: out,
            partial,
            corrupt_shards,
        })
    }

    /// Recompute length, start and end from the idx list plus buffer.
    pub fn update_props(&mut self) {
        let mut length = self.buffer.len();
        let mut start = self.buffer.first().map(|p| p.ts).unwrap_or(u64::MAX);
        let mut end = self.buffer.last().map(|p| p.ts).unwrap_or(0);
        for e in &self.idx {
            length += e.len as usize;
            start = start.min(e.start_ts);
            end = end.max(e.end_ts);
        }
        self.length = length;
        self.start = start;
        self.end = end;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(shard_id: u64, start_ts: u64, end_ts: u64, len: u16) -> IdxEntry {
        IdxEntry {
            shard_id,
            tp: ShardType::Num,
            pos: 0,
            len,
            cinfo: 0,
            size: 0,
            start_ts,
            end_ts,
        }
    }

    #[test]
    fn test_add_point_updates_bounds() {
        let mut s = Series::new(1, 0, "cpu".into(), PointType::Int, false);
        s.add_point_mem(20, Value::Int(2)).unwrap();
        s.add_point_mem(10, Value::Int(1)).unwrap();
        assert_eq!(s.start, 10);
        assert_eq!(s.end, 20);
        assert_eq!(s.length, 2);
    }

    #[test]
    fn test_idx_insert_ordered() {
        let mut s = Series::new(1, 0, "cpu".into(), PointType::Int, false);
        s.idx_insert(entry(2, 100, 200, 5));
        s.idx_insert(entry(1, 0, 90, 5));
        s.idx_insert(entry(3, 150, 300, 5));
        let starts: Vec<u64> = s.idx.iter().map(|e| e.start_ts).collect();
        assert_eq!(starts, vec![0, 100, 150]);
        assert!(s.idx_has_overlap());
    }

    #[test]
    fn test_idx_no_overlap_when_disjoint() {
        let mut s = Series::new(1, 0, "cpu".into(), PointType::Int, false);
        s.idx_insert(entry(1, 0, 90, 5));
        s.idx_insert(entry(2, 100, 200, 5));
        assert!(!s.idx_has_overlap());
    }

    #[test]
    fn test_update_props_counts_idx_and_buffer() {
        let mut s = Series::new(1, 0, "cpu".into(), PointType::Int, false);
        s.idx_insert(entry(1, 50, 90, 8));
        s.add_point_mem(100, Value::Int(1)).unwrap();
        s.update_props();
        assert_eq!(s.length, 9);
        assert_eq!(s.start, 50);
        assert_eq!(s.end, 100);
    }

    #[test]
    fn test_name_mask_is_byte_sum() {
        assert_eq!(name_mask(""), 0);
        assert_eq!(name_mask("a"), 97);
        // Wraps at 8 bits.
        let long: String = std::iter::repeat('z').take(100).collect();
        assert_eq!(name_mask(&long), ((122u64 * 100) % 256) as u16);
    }
}
