// This software is provided for non-commercial use only.
// Commercial use is strictly prohibited.
// If you use, modify, or redistribute this software, you must provide proper attribution to the original author.
// (c) 2026 Onur Tuna. All rights reserved.

//! Replica FIFO — durable queue of forwarded writes.
//!
//! A queue is a directory of numbered `NNNN.fifo` files. Frames are laid
//! out from the end of a file toward the start: each append seeks to a
//! lower offset and writes `[frame | frame_len: u32]`, so the oldest frame
//! sits at the file end with its length in the trailing four bytes. The
//! reader pops from the tail without touching the file; only `commit`
//! truncates, which is what makes delivery at-least-once: a crash between
//! pop and commit re-delivers the frame after restart.
//!
//! The writer appends to the newest file ("in") until its budgeted space
//! runs out, then rolls over to a fresh file. The reader consumes the
//! oldest file ("out") and unlinks it once drained.

use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use tracing::{info, warn};

use crate::error::{Result, TdbError};

/// Space budget per fifo file; a single larger frame gets a file to itself.
pub const FFILE_DEFAULT_SIZE: u64 = 100 * 1024 * 1024;

#[derive(Debug, PartialEq, Eq)]
enum Append {
    Success,
    NoFreeSpace,
}

struct FFile {
    id: u64,
    path: PathBuf,
    file: Option<File>,
    /// Byte length of the frame at the file end; 0 when drained.
    next_size: u32,
    /// Remaining append budget; 0 for reopened files.
    free_space: u64,
}

impl FFile {
    fn file_name(id: u64) -> String {
        format!("{id:04}.fifo")
    }

    /// Create a fresh writable fifo file, sized for at least one frame.
    fn create(id: u64, dir: &Path, first_frame: Option<&[u8]>) -> Result<FFile> {
        let path = dir.join(Self::file_name(id));
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|e| TdbError::Storage(format!("create fifo {path:?}: {e}")))?;
        let needed = first_frame.map(|f| f.len() as u64 + 8).unwrap_or(0);
        let mut ffile = FFile {
            id,
            path,
            file: Some(file),
            next_size: 0,
            free_space: FFILE_DEFAULT_SIZE.max(needed),
        };
        if let Some(frame) = first_frame {
            if ffile.append(frame)? != Append::Success {
                return Err(TdbError::Storage("fresh fifo rejected first frame".into()));
            }
        }
        Ok(ffile)
    }

    /// Open an existing fifo file; empty or drained files are unlinked
    /// and reported as None.
    fn open_existing(id: u64, path: PathBuf) -> Result<Option<FFile>> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| TdbError::Storage(format!("open fifo {path:?}: {e}")))?;
        let len = file.metadata()?.len();
        if len < 4 {
            warn!(path = ?path, "Empty fifo file found, removing");
            drop(file);
            std::fs::remove_file(&path)?;
            return Ok(None);
        }
        file.seek(SeekFrom::End(-4))?;
        let next_size = file.read_u32::<LittleEndian>()?;
        if next_size == 0 {
            // Fully committed before the unlink landed.
            drop(file);
            std::fs::remove_file(&path)?;
            return Ok(None);
        }
        Ok(Some(FFile {
            id,
            path,
            file: Some(file),
            next_size,
            free_space: 0,
        }))
    }

    fn file(&mut self) -> Result<&mut File> {
        self.file
            .as_mut()
            .ok_or_else(|| TdbError::Storage("fifo file is closed".into()))
    }

    fn ensure_open(&mut self) -> Result<()> {
        if self.file.is_none() {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .open(&self.path)
                .map_err(|e| TdbError::Storage(format!("reopen fifo {:?}: {e}", self.path)))?;
            self.file = Some(file);
        }
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if let Some(mut f) = self.file.take() {
            f.flush()?;
        }
        Ok(())
    }

    fn append(&mut self, frame: &[u8]) -> Result<Append> {
        let size = frame.len() as u64;
        if self.free_space < size + 8 {
            self.free_space = 0;
            return Ok(Append::NoFreeSpace);
        }
        if self.next_size == 0 {
            self.next_size = size as u32;
        }
        self.free_space -= size + 4;
        let at = self.free_space;
        let file = self.file()?;
        file.seek(SeekFrom::Start(at))?;
        file.write_all(frame)?;
        file.write_u32::<LittleEndian>(size as u32)?;
        file.flush()?;
        Ok(Append::Success)
    }

    /// Read the tail frame without consuming it.
    fn pop(&mut self) -> Result<Vec<u8>> {
        debug_assert!(self.next_size > 0);
        let size = self.next_size as usize;
        let file = self.file()?;
        file.seek(SeekFrom::End(-(size as i64) - 4))?;
        let mut frame = vec![0u8; size];
        file.read_exact(&mut frame)?;
        Ok(frame)
    }

    /// Truncate the popped frame away and load the next frame length.
    fn pop_commit(&mut self) -> Result<()> {
        debug_assert!(self.next_size > 0);
        let size = self.next_size as i64;
        let file = self.file()?;
        let at = file.seek(SeekFrom::End(-size - 8))?;
        let next_size = file.read_u32::<LittleEndian>()?;
        file.set_len(at + 4)?;
        file.flush()?;
        self.next_size = next_size;
        Ok(())
    }

    fn unlink(mut self) {
        let _ = self.close();
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!(path = ?self.path, error = %e, "Cannot remove fifo file");
        }
    }
}

pub struct Fifo {
    dir: PathBuf,
    /// Front is the "out" file, back is the "in" file; they may be the
    /// same element.
    files: VecDeque<FFile>,
    max_id: u64,
}

impl Fifo {
    /// Open the queue directory, recover existing files in id order and
    /// start a fresh in-file.
    pub fn open(dir: &Path) -> Result<Fifo> {
        std::fs::create_dir_all(dir)
            .map_err(|e| TdbError::Storage(format!("create fifo dir {dir:?}: {e}")))?;

        let mut found: Vec<(u64, PathBuf)> = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(stem) = name.strip_suffix(".fifo") else { continue };
            let Ok(id) = stem.parse::<u64>() else { continue };
            found.push((id, entry.path()));
        }
        found.sort();

        let mut files = VecDeque::new();
        let mut max_id = 0u64;
        for (id, path) in found {
            max_id = max_id.max(id);
            if let Some(ffile) = FFile::open_existing(id, path)? {
                files.push_back(ffile);
            }
        }

        let in_id = max_id + 1;
        files.push_back(FFile::create(in_id, dir, None)?);

        info!(path = ?dir, files = files.len(), "Fifo opened");
        Ok(Fifo {
            dir: dir.to_path_buf(),
            files,
            max_id: in_id,
        })
    }

    /// Whether a pop would yield a frame.
    pub fn has_data(&self) -> bool {
        self.files.front().is_some_and(|f| f.next_size > 0)
    }

    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    /// Enqueue one frame at the head.
    pub fn append(&mut self, frame: &[u8]) -> Result<()> {
        let in_file = self.files.back_mut().expect("fifo always has an in-file");
        if in_file.append(frame)? == Append::Success {
            return Ok(());
        }

        // Roll over to a fresh in-file.
        if self.files.len() > 1 {
            self.files.back_mut().unwrap().close()?;
        }
        self.max_id += 1;
        let new_in = FFile::create(self.max_id, &self.dir, Some(frame))?;

        // A drained single file serves no reader; replace it outright.
        if self.files.len() == 1 && self.files[0].next_size == 0 {
            let old = self.files.pop_front().unwrap();
            old.unlink();
        }
        self.files.push_back(new_in);
        Ok(())
    }

    /// Read the oldest frame without consuming it. Check
    /// [`Fifo::has_data`] first.
    pub fn pop(&mut self) -> Result<Vec<u8>> {
        let out = self
            .files
            .front_mut()
            .ok_or_else(|| TdbError::Storage("pop on empty fifo".into()))?;
        out.ensure_open()?;
        out.pop()
    }

    /// Drop the popped frame for good. A committed frame is never popped
    /// again.
    pub fn commit(&mut self) -> Result<()> {
        let out = self
            .files
            .front_mut()
            .ok_or_else(|| TdbError::Storage("commit on empty fifo".into()))?;
        out.ensure_open()?;
        out.pop_commit()?;

        if out.next_size == 0 && self.files.len() > 1 {
            let old = self.files.pop_front().unwrap();
            old.unlink();
            self.files.front_mut().unwrap().ensure_open()?;
        }
        Ok(())
    }

    /// Like commit, but for a frame the caller gave up on; the skip is
    /// logged so operators can spot losses.
    pub fn commit_err(&mut self) -> Result<()> {
        warn!("Skipping fifo frame after delivery failure");
        self.commit()
    }

    /// Close all file handles (backup mode); the queue stays intact.
    pub fn close(&mut self) -> Result<()> {
        for f in self.files.iter_mut() {
            f.close()?;
        }
        Ok(())
    }

    /// Reopen after backup mode.
    pub fn reopen(&mut self) -> Result<()> {
        for f in self.files.iter_mut() {
            f.ensure_open()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(n: u8, len: usize) -> Vec<u8> {
        vec![n; len]
    }

    #[test]
    fn test_append_pop_commit_order() {
        let dir = tempfile::tempdir().unwrap();
        let mut fifo = Fifo::open(dir.path()).unwrap();
        assert!(!fifo.has_data());

        fifo.append(&frame(1, 10)).unwrap();
        fifo.append(&frame(2, 20)).unwrap();
        fifo.append(&frame(3, 30)).unwrap();
        assert!(fifo.has_data());

        assert_eq!(fifo.pop().unwrap(), frame(1, 10));
        fifo.commit().unwrap();
        assert_eq!(fifo.pop().unwrap(), frame(2, 20));
        fifo.commit().unwrap();
        assert_eq!(fifo.pop().unwrap(), frame(3, 30));
        fifo.commit().unwrap();
        assert!(!fifo.has_data());
    }

    #[test]
    fn test_pop_without_commit_redelivers() {
        let dir = tempfile::tempdir().unwrap();
        let mut fifo = Fifo::open(dir.path()).unwrap();
        fifo.append(&frame(7, 16)).unwrap();
        assert_eq!(fifo.pop().unwrap(), frame(7, 16));
        assert_eq!(fifo.pop().unwrap(), frame(7, 16));
        fifo.commit().unwrap();
        assert!(!fifo.has_data());
    }

    #[test]
    fn test_survives_reopen_between_pop_and_commit() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut fifo = Fifo::open(dir.path()).unwrap();
            for i in 1..=3u8 {
                fifo.append(&frame(i, 12)).unwrap();
            }
            assert_eq!(fifo.pop().unwrap(), frame(1, 12));
            fifo.commit().unwrap();
            assert_eq!(fifo.pop().unwrap(), frame(2, 12));
            // Crash here: frame 2 popped but not committed.
        }
        let mut fifo = Fifo::open(dir.path()).unwrap();
        assert!(fifo.has_data());
        assert_eq!(fifo.pop().unwrap(), frame(2, 12));
        fifo.commit().unwrap();
        assert_eq!(fifo.pop().unwrap(), frame(3, 12));
        fifo.commit().unwrap();
        assert!(!fifo.has_data());
    }

    #[test]
    fn test_committed_frames_stay_gone_after_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut fifo = Fifo::open(dir.path()).unwrap();
            fifo.append(&frame(1, 8)).unwrap();
            fifo.append(&frame(2, 8)).unwrap();
            fifo.pop().unwrap();
            fifo.commit().unwrap();
        }
        let mut fifo = Fifo::open(dir.path()).unwrap();
        assert_eq!(fifo.pop().unwrap(), frame(2, 8));
        fifo.commit().unwrap();
        assert!(!fifo.has_data());
    }

    #[test]
    fn test_oversized_frame_gets_own_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut fifo = Fifo::open(dir.path()).unwrap();
        let big = vec![0xaa; FFILE_DEFAULT_SIZE as usize + 16];
        fifo.append(&big).unwrap();
        assert!(fifo.has_data());
        assert_eq!(fifo.pop().unwrap(), big);
        fifo.commit().unwrap();
        assert!(!fifo.has_data());
    }

    #[test]
    fn test_close_reopen_cycle() {
        let dir = tempfile::tempdir().unwrap();
        let mut fifo = Fifo::open(dir.path()).unwrap();
        fifo.append(&frame(5, 10)).unwrap();
        fifo.close().unwrap();
        fifo.reopen().unwrap();
        assert_eq!(fifo.pop().unwrap(), frame(5, 10));
        fifo.commit().unwrap();
    }
}
