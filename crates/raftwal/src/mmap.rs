//! Memory-mapped file region.
//!
//! Every on-disk artifact of the log (the meta page and each entry file)
//! is accessed through one of these: a file kept open for resizing plus a
//! mutable mapping of its full current length. `flush` is the only
//! durability primitive above the filesystem.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use memmap2::MmapMut;

use crate::error::{WalError, WalResult};

/// A fixed-maximum-size file mapped read-write into memory.
///
/// Writes past the current length grow the file (doubling, clamped to the
/// maximum) and re-establish the mapping; the old mapping is dropped, so
/// no reference taken from `slice` may be held across a write.
#[derive(Debug)]
pub(crate) struct MmapRegion {
    path: PathBuf,
    file: File,
    map: MmapMut,
    max_size: u64,
}

impl MmapRegion {
    /// Opens or creates `path`, extends an empty file to `initial_size`,
    /// and maps the full current length.
    pub(crate) fn open(path: &Path, initial_size: u64, max_size: u64) -> WalResult<Self> {
        debug_assert!(initial_size > 0 && initial_size <= max_size);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|e| WalError::io("open", path, e))?;

        let len = file
            .metadata()
            .map_err(|e| WalError::io("stat", path, e))?
            .len();
        if len == 0 {
            file.set_len(initial_size)
                .map_err(|e| WalError::io("extend", path, e))?;
        }

        // SAFETY: the file is open read-write and set_len above guarantees
        // the mapped range is fully allocated. The mapping never outlives
        // the file handle held alongside it.
        let map = unsafe { MmapMut::map_mut(&file) }.map_err(|e| WalError::io("mmap", path, e))?;

        Ok(Self {
            path: path.to_path_buf(),
            file,
            map,
            max_size,
        })
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    /// Current mapped length (equals the file length).
    pub(crate) fn len(&self) -> u64 {
        self.map.len() as u64
    }

    /// Bounded read. An out-of-range request means a stored offset pointed
    /// outside the file, which is corruption, not a caller bug.
    pub(crate) fn slice(&self, offset: u64, len: u64) -> WalResult<&[u8]> {
        let end = offset
            .checked_add(len)
            .filter(|&end| end <= self.len())
            .ok_or_else(|| {
                WalError::corruption(
                    &self.path,
                    offset,
                    format!("read of {len} bytes past mapped length {}", self.len()),
                )
            })?;
        Ok(&self.map[offset as usize..end as usize])
    }

    /// Writes `bytes` at `offset`, growing the file if needed.
    pub(crate) fn write_at(&mut self, offset: u64, bytes: &[u8]) -> WalResult<()> {
        let end = offset + bytes.len() as u64;
        if end > self.len() {
            self.grow(end)?;
        }
        self.map[offset as usize..end as usize].copy_from_slice(bytes);
        Ok(())
    }

    /// Zeroes `[offset, offset + len)`. The range must already be mapped.
    pub(crate) fn zero_range(&mut self, offset: u64, len: u64) -> WalResult<()> {
        let end = offset + len;
        debug_assert!(end <= self.len());
        self.map[offset as usize..end as usize].fill(0);
        Ok(())
    }

    pub(crate) fn read_u64(&self, offset: u64) -> WalResult<u64> {
        let raw = self.slice(offset, 8)?;
        Ok(u64::from_be_bytes(raw.try_into().expect("8-byte slice")))
    }

    pub(crate) fn write_u64(&mut self, offset: u64, value: u64) -> WalResult<()> {
        self.write_at(offset, &value.to_be_bytes())
    }

    pub(crate) fn read_u32(&self, offset: u64) -> WalResult<u32> {
        let raw = self.slice(offset, 4)?;
        Ok(u32::from_be_bytes(raw.try_into().expect("4-byte slice")))
    }

    pub(crate) fn write_u32(&mut self, offset: u64, value: u32) -> WalResult<()> {
        self.write_at(offset, &value.to_be_bytes())
    }

    /// Synchronously pushes dirty mapped pages to durable storage.
    pub(crate) fn flush(&self) -> WalResult<()> {
        self.map
            .flush()
            .map_err(|e| WalError::io("flush", &self.path, e))
    }

    fn grow(&mut self, required: u64) -> WalResult<()> {
        if required > self.max_size {
            return Err(WalError::OutOfSpace {
                path: self.path.clone(),
                requested: required,
                max: self.max_size,
            });
        }

        let mut new_len = self.len();
        while new_len < required {
            new_len = (new_len * 2).min(self.max_size);
        }

        // Flush before the old mapping is dropped, then remap at the new
        // length. Any pointer taken from the old mapping is invalid past
        // this point; &mut self enforces that statically.
        self.flush()?;
        self.file
            .set_len(new_len)
            .map_err(|e| WalError::io("extend", &self.path, e))?;
        // SAFETY: set_len above allocated the full new range; the file
        // handle stays open read-write for the life of the mapping.
        self.map = unsafe { MmapMut::map_mut(&self.file) }
            .map_err(|e| WalError::io("mmap", &self.path, e))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn creates_at_initial_size() {
        let dir = tempdir().unwrap();
        let region = MmapRegion::open(&dir.path().join("r"), 4096, 65536).unwrap();
        assert_eq!(region.len(), 4096);
    }

    #[test]
    fn write_read_roundtrip() {
        let dir = tempdir().unwrap();
        let mut region = MmapRegion::open(&dir.path().join("r"), 4096, 65536).unwrap();
        region.write_at(100, b"hello").unwrap();
        region.write_u64(8, 0xDEAD_BEEF).unwrap();
        assert_eq!(region.slice(100, 5).unwrap(), b"hello");
        assert_eq!(region.read_u64(8).unwrap(), 0xDEAD_BEEF);
    }

    #[test]
    fn grows_past_initial_size() {
        let dir = tempdir().unwrap();
        let mut region = MmapRegion::open(&dir.path().join("r"), 4096, 65536).unwrap();
        region.write_at(10_000, &[7u8; 8]).unwrap();
        assert!(region.len() >= 10_008);
        assert_eq!(region.slice(10_000, 8).unwrap(), &[7u8; 8]);
    }

    #[test]
    fn rejects_writes_past_maximum() {
        let dir = tempdir().unwrap();
        let mut region = MmapRegion::open(&dir.path().join("r"), 4096, 8192).unwrap();
        let err = region.write_at(8192, &[1]).unwrap_err();
        assert!(matches!(err, WalError::OutOfSpace { .. }));
    }

    #[test]
    fn out_of_range_read_is_corruption() {
        let dir = tempdir().unwrap();
        let region = MmapRegion::open(&dir.path().join("r"), 4096, 8192).unwrap();
        let err = region.slice(4090, 16).unwrap_err();
        assert!(matches!(err, WalError::Corruption { .. }));
    }

    #[test]
    fn contents_survive_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("r");
        {
            let mut region = MmapRegion::open(&path, 4096, 65536).unwrap();
            region.write_at(0, b"persisted").unwrap();
            region.flush().unwrap();
        }
        let region = MmapRegion::open(&path, 4096, 65536).unwrap();
        assert_eq!(region.slice(0, 9).unwrap(), b"persisted");
    }
}
