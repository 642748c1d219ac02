// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Shard file handle cache.
//!
//! A fixed-size ring of open file handles. Opening a file that is already
//! cached returns the existing handle; otherwise the cursor rotates, the
//! evicted slot is closed and the new file takes its place. Handles are
//! `Arc`-counted so an evicted file stays usable for readers that still
//! hold it; the descriptor closes when the last reference drops.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{Result, TdbError};

/// A cached open file, shared between readers.
pub type SharedFile = Arc<Mutex<File>>;

struct Slot {
    path: PathBuf,
    file: SharedFile,
}

pub struct FileCache {
    slots: Mutex<CacheInner>,
}

struct CacheInner {
    ring: Vec<Option<Slot>>,
    cursor: usize,
}

impl FileCache {
    /// Create a cache with `size` slots. Bounded well below the OS file
    /// descriptor limit by the caller.
    pub fn new(size: usize) -> Self {
        let mut ring = Vec::with_capacity(size);
        ring.resize_with(size, || None);
        FileCache {
            slots: Mutex::new(CacheInner { ring, cursor: 0 }),
        }
    }

    /// Return an open read/write handle for `path`, opening and caching it
    /// on a miss.
    pub fn open(&self, path: &Path) -> Result<SharedFile> {
        let mut inner = self.slots.lock();
        for slot in inner.ring.iter().flatten() {
            if slot.path == path {
                return Ok(slot.file.clone());
            }
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| TdbError::Storage(format!("open {path:?}: {e}")))?;
        let shared: SharedFile = Arc::new(Mutex::new(file));
        let cursor = inner.cursor;
        inner.cursor = (cursor + 1) % inner.ring.len();
        // Dropping the evicted slot closes its descriptor once readers
        // holding the Arc are done.
        inner.ring[cursor] = Some(Slot {
            path: path.to_path_buf(),
            file: shared.clone(),
        });
        Ok(shared)
    }

    /// Drop the cached handle for `path`, if any. Used when a shard file
    /// is unlinked or backup mode closes all handles.
    pub fn evict(&self, path: &Path) {
        let mut inner = self.slots.lock();
        for slot in inner.ring.iter_mut() {
            if slot.as_ref().is_some_and(|s| s.path == path) {
                *slot = None;
            }
        }
    }

    /// Close every cached handle.
    pub fn clear(&self) {
        let mut inner = self.slots.lock();
        for slot in inner.ring.iter_mut() {
            *slot = None;
        }
        inner.cursor = 0;
    }

    pub fn len(&self) -> usize {
        self.slots.lock().ring.iter().flatten().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_hit_returns_same_handle() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.sdb");
        File::create(&path).unwrap().write_all(b"x").unwrap();

        let cache = FileCache::new(4);
        let f1 = cache.open(&path).unwrap();
        let f2 = cache.open(&path).unwrap();
        assert!(Arc::ptr_eq(&f1, &f2));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_ring_evicts_oldest() {
        let dir = tempfile::tempdir().unwrap();
        let mut paths = Vec::new();
        for i in 0..3 {
            let p = dir.path().join(format!("{i}.sdb"));
            File::create(&p).unwrap();
            paths.push(p);
        }
        let cache = FileCache::new(2);
        cache.open(&paths[0]).unwrap();
        cache.open(&paths[1]).unwrap();
        cache.open(&paths[2]).unwrap();
        assert_eq!(cache.len(), 2);
        // First file was evicted; reopening caches it again.
        cache.open(&paths[0]).unwrap();
        assert_eq!(cache.len(), 2);
    }
}
