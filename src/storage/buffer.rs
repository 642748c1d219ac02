// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Write-ahead point buffer.
//!
//! One preallocated file per database, divided into fixed-size slots; every
//! numeric series owns exactly one slot holding its not-yet-flushed points.
//!
//! ## Slot layout
//!
//! ```text
//! [start sentinel : u32 = 0x00000000]
//! [series id      : u32]  (0 marks a free slot)
//! [point          : ts u64 + value 8 bytes]  × up to (size - 8) / 16
//! [0xFF.. sentinel fill for unused point slots]
//! ```
//!
//! Free slots are kept on a stack; when it runs dry the file grows by
//! [`BUFFER_BATCH`] template slots at once. The slot size is configurable
//! (multiple of 512, at most [`MAX_BUFFER_SZ`]); opening a buffer written
//! with a different slot size triggers a one-shot migration, driven by the
//! database which owns both the series map and the shard store.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};
use tracing::{debug, info};

use crate::error::{Result, TdbError};

pub const BUFFER_FN: &str = "buffer.dat";
pub const BUFFER_TMP_FN: &str = "buffer.dat.tmp";
pub const MAX_BUFFER_SZ: usize = 1024 * 1024;
/// Slots appended per growth step.
pub const BUFFER_BATCH: usize = 64;

const TS_SENTINEL: u64 = u64::MAX;

/// A rehydrated slot as found on disk; values are raw 8-byte images, the
/// database decodes them with the owning series' value type.
#[derive(Debug)]
pub struct LoadedSlot {
    pub series_id: u32,
    pub offset: u64,
    pub points: Vec<(u64, u64)>,
}

pub struct Buffer {
    path: PathBuf,
    /// Slot byte size.
    pub size: usize,
    /// Point capacity per slot.
    pub len: usize,
    file: Option<File>,
    empty: Vec<u64>,
    slots: u64,
    template: Vec<u8>,
}

pub fn is_valid_size(size: usize) -> bool {
    size >= 512 && size % 512 == 0 && size <= MAX_BUFFER_SZ
}

impl Buffer {
    /// Open (or create) the buffer file under `dir` with the given slot
    /// size. Call [`Buffer::load`] before any writes.
    pub fn open(dir: &Path, size: usize) -> Result<Self> {
        Self::open_file(dir.join(BUFFER_FN), size)
    }

    pub fn open_file(path: PathBuf, size: usize) -> Result<Self> {
        if !is_valid_size(size) {
            return Err(TdbError::Buffer(format!(
                "invalid buffer slot size {size}; must be a multiple of 512, at most {MAX_BUFFER_SZ}"
            )));
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| TdbError::Buffer(format!("open {path:?}: {e}")))?;
        let file_len = file.metadata()?.len();
        if file_len % size as u64 != 0 {
            return Err(TdbError::Buffer(format!(
                "buffer file length {file_len} is not a whole number of {size}-byte slots"
            )));
        }

        let mut template = vec![0xffu8; size];
        template[..8].fill(0);

        Ok(Buffer {
            path,
            size,
            len: (size - 8) / 16,
            file: Some(file),
            empty: Vec::new(),
            slots: file_len / size as u64,
            template,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn slot_count(&self) -> u64 {
        self.slots
    }

    fn file(&mut self) -> Result<&mut File> {
        self.file
            .as_mut()
            .ok_or_else(|| TdbError::Buffer("buffer file is closed".into()))
    }

    /// Walk every slot and return the occupied ones; free slots feed the
    /// empty stack. Slots whose series turns out to be unknown must be
    /// handed back through [`Buffer::release_slot`].
    pub fn load(&mut self) -> Result<Vec<LoadedSlot>> {
        let size = self.size;
        let cap = self.len;
        let slots = self.slots;
        let file = self.file()?;
        file.seek(SeekFrom::Start(0))?;

        let mut loaded = Vec::new();
        let mut empty = Vec::new();
        let mut slot_buf = vec![0u8; size];

        for i in 0..slots {
            let offset = i * size as u64;
            file.read_exact(&mut slot_buf)?;

            let start = LittleEndian::read_u32(&slot_buf[..4]);
            if start != 0 {
                return Err(TdbError::Corrupt(format!(
                    "buffer slot at {offset} has no start sentinel"
                )));
            }
            let series_id = LittleEndian::read_u32(&slot_buf[4..8]);
            if series_id == 0 {
                empty.push(offset);
                continue;
            }
            let mut points = Vec::new();
            for p in 0..cap {
                let at = 8 + p * 16;
                let ts = LittleEndian::read_u64(&slot_buf[at..at + 8]);
                if ts == TS_SENTINEL {
                    break;
                }
                let bits = LittleEndian::read_u64(&slot_buf[at + 8..at + 16]);
                points.push((ts, bits));
            }
            loaded.push(LoadedSlot {
                series_id,
                offset,
                points,
            });
        }
        // Stack with the lowest offsets on top so they are reused first.
        empty.reverse();
        self.empty = empty;

        info!(
            slots = self.slots,
            occupied = loaded.len(),
            free = self.empty.len(),
            "Buffer loaded"
        );
        Ok(loaded)
    }

    /// Reserve a slot for a new series and write its empty image.
    pub fn new_series(&mut self, series_id: u32) -> Result<u64> {
        let offset = match self.empty.pop() {
            Some(offset) => offset,
            None => self.grow()?,
        };
        self.write_empty(series_id, offset)?;
        Ok(offset)
    }

    fn grow(&mut self) -> Result<u64> {
        let size = self.size as u64;
        let base = self.slots * size;
        let template = self.template.clone();
        let file = self.file()?;
        file.seek(SeekFrom::Start(base))?;
        for _ in 0..BUFFER_BATCH {
            file.write_all(&template)?;
        }
        file.flush()?;
        self.slots += BUFFER_BATCH as u64;
        for i in (1..BUFFER_BATCH as u64).rev() {
            self.empty.push(base + i * size);
        }
        debug!(slots = self.slots, "Buffer grown");
        Ok(base)
    }

    /// Write the n-th point of a slot. The caller tracks `idx` and checks
    /// capacity before calling.
    pub fn write_point(&mut self, offset: u64, idx: usize, ts: u64, bits: u64) -> Result<()> {
        debug_assert!(idx < self.len);
        let file = self.file()?;
        file.seek(SeekFrom::Start(offset + 8 + 16 * idx as u64))?;
        file.write_u64::<LittleEndian>(ts)?;
        file.write_u64::<LittleEndian>(bits)?;
        Ok(())
    }

    /// Reset a slot to the empty image for `series_id` (id 0 frees it).
    pub fn write_empty(&mut self, series_id: u32, offset: u64) -> Result<()> {
        let mut slot = self.template.clone();
        LittleEndian::write_u32(&mut slot[4..8], series_id);
        let file = self.file()?;
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(&slot)?;
        Ok(())
    }

    /// Write a whole run of points into a slot, used by migration.
    pub fn write_slot(
        &mut self,
        series_id: u32,
        offset: u64,
        points: &[(u64, u64)],
    ) -> Result<()> {
        debug_assert!(points.len() <= self.len);
        let mut slot = self.template.clone();
        LittleEndian::write_u32(&mut slot[4..8], series_id);
        for (i, &(ts, bits)) in points.iter().enumerate() {
            let at = 8 + i * 16;
            LittleEndian::write_u64(&mut slot[at..at + 8], ts);
            LittleEndian::write_u64(&mut slot[at + 8..at + 16], bits);
        }
        let file = self.file()?;
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(&slot)?;
        Ok(())
    }

    /// Hand a slot back to the free stack.
    pub fn release_slot(&mut self, offset: u64) -> Result<()> {
        self.write_empty(0, offset)?;
        self.empty.push(offset);
        Ok(())
    }

    pub fn fsync(&mut self) -> Result<()> {
        if let Some(file) = self.file.as_mut() {
            file.flush()?;
            file.sync_data()?;
        }
        Ok(())
    }

    /// Close the file handle (backup mode); state stays in memory.
    pub fn close(&mut self) -> Result<()> {
        if let Some(mut file) = self.file.take() {
            file.flush()?;
            file.sync_data()?;
        }
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        self.file.is_some()
    }

    /// Reopen after backup mode.
    pub fn reopen(&mut self) -> Result<()> {
        if self.file.is_none() {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .open(&self.path)
                .map_err(|e| TdbError::Buffer(format!("reopen {:?}: {e}", self.path)))?;
            self.file = Some(file);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_series_grows_in_batches() {
        let dir = tempfile::tempdir().unwrap();
        let mut buffer = Buffer::open(dir.path(), 512).unwrap();
        assert_eq!(buffer.slot_count(), 0);

        let o1 = buffer.new_series(1).unwrap();
        assert_eq!(o1, 0);
        assert_eq!(buffer.slot_count(), BUFFER_BATCH as u64);

        let o2 = buffer.new_series(2).unwrap();
        assert_eq!(o2, 512);
    }

    #[test]
    fn test_write_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let mut buffer = Buffer::open(dir.path(), 512).unwrap();
        let offset = buffer.new_series(42).unwrap();
        buffer.write_point(offset, 0, 10, 100).unwrap();
        buffer.write_point(offset, 1, 20, 200).unwrap();
        buffer.fsync().unwrap();
        drop(buffer);

        let mut buffer = Buffer::open(dir.path(), 512).unwrap();
        let loaded = buffer.load().unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].series_id, 42);
        assert_eq!(loaded[0].offset, offset);
        assert_eq!(loaded[0].points, vec![(10, 100), (20, 200)]);
        // The other 63 batch slots are free again.
        assert_eq!(buffer.slot_count(), BUFFER_BATCH as u64);
    }

    #[test]
    fn test_release_slot_reused() {
        let dir = tempfile::tempdir().unwrap();
        let mut buffer = Buffer::open(dir.path(), 512).unwrap();
        let o1 = buffer.new_series(1).unwrap();
        buffer.release_slot(o1).unwrap();
        let o2 = buffer.new_series(2).unwrap();
        assert_eq!(o1, o2);
    }

    #[test]
    fn test_invalid_slot_size_rejected() {
        let dir = tempfile::tempdir().unwrap();
        assert!(Buffer::open(dir.path(), 100).is_err());
        assert!(Buffer::open(dir.path(), 513).is_err());
        assert!(Buffer::open(dir.path(), MAX_BUFFER_SZ + 512).is_err());
    }

    #[test]
    fn test_write_empty_clears_points() {
        let dir = tempfile::tempdir().unwrap();
        let mut buffer = Buffer::open(dir.path(), 512).unwrap();
        let offset = buffer.new_series(7).unwrap();
        buffer.write_point(offset, 0, 10, 1).unwrap();
        buffer.write_empty(7, offset).unwrap();
        let loaded = buffer.load().unwrap();
        assert_eq!(loaded.len(), 1);
        assert!(loaded[0].points.is_empty());
    }
}
