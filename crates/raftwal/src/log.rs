//! The ordered, rotating collection of entry files.
//!
//! The log is a list of sealed (immutable, full) files plus one tail file,
//! ordered by first index with no gaps between them. Only the tail is ever
//! written. Compaction removes whole sealed files once a snapshot
//! supersedes every entry in them.

use std::fs::File;
use std::path::{Path, PathBuf};

use protobuf::Message;
use raft::eraftpb::Entry;
use tracing::debug;

use crate::entry_file::{parse_entry_file_name, EntryFile, Slot, MAX_ENTRIES, PAYLOAD_BASE};
use crate::error::{WalError, WalResult};

#[derive(Debug)]
pub(crate) struct EntryLog {
    dir: PathBuf,
    /// Rotated-away files, ascending by first index, each full.
    sealed: Vec<EntryFile>,
    /// The only file that is written.
    tail: EntryFile,
    /// Next free slot in the tail.
    next_slot: usize,
    /// Tail payload high-water mark; mirrors the tail's footer.
    hwm: u64,
    /// Index of the last appended entry (0 when nothing was ever appended).
    last_index: u64,
}

impl EntryLog {
    pub(crate) fn open(dir: &Path) -> WalResult<Self> {
        let mut found: Vec<(u64, PathBuf)> = std::fs::read_dir(dir)
            .map_err(|e| WalError::io("read dir", dir, e))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter_map(|path| parse_entry_file_name(&path).map(|base| (base, path)))
            .collect();
        found.sort_by_key(|&(base, _)| base);

        if found.is_empty() {
            let tail = EntryFile::create(dir, 1)?;
            sync_dir(dir)?;
            return Ok(Self {
                dir: dir.to_path_buf(),
                sealed: Vec::new(),
                tail,
                next_slot: 0,
                hwm: PAYLOAD_BASE,
                last_index: 0,
            });
        }

        let mut files = Vec::with_capacity(found.len());
        for (base, path) in found {
            if base == 0 {
                return Err(WalError::corruption(&path, 0, "entry file named by index 0"));
            }
            files.push(EntryFile::open(&path, base)?);
        }
        let mut tail = files.pop().expect("at least one entry file");
        let sealed = files;

        for file in &sealed {
            file.validate_sealed()?;
        }
        for pair in sealed.windows(2) {
            if pair[1].base() != pair[0].base() + MAX_ENTRIES as u64 {
                return Err(WalError::corruption(
                    pair[1].path(),
                    0,
                    format!("gap after file starting at {}", pair[0].base()),
                ));
            }
        }
        if let Some(last_sealed) = sealed.last() {
            if tail.base() != last_sealed.base() + MAX_ENTRIES as u64 {
                return Err(WalError::corruption(
                    tail.path(),
                    0,
                    format!("gap after file starting at {}", last_sealed.base()),
                ));
            }
        }

        let (occupied, hwm) = tail.recover_tail()?;
        tail.flush()?;
        let last_index = if occupied > 0 {
            tail.base() + occupied as u64 - 1
        } else {
            tail.base() - 1
        };

        Ok(Self {
            dir: dir.to_path_buf(),
            sealed,
            tail,
            next_slot: occupied,
            hwm,
            last_index,
        })
    }

    /// First index of the earliest file: the stored index of its slot 0,
    /// which is 0 for a freshly created log (the dummy-entry anchor).
    pub(crate) fn first_index(&self) -> WalResult<u64> {
        match self.sealed.first() {
            Some(file) => file.first_index(),
            None => self.tail.first_index(),
        }
    }

    pub(crate) fn last_index(&self) -> u64 {
        self.last_index
    }

    /// Total index slots held on disk: full sealed files plus the tail's
    /// occupancy. Callers compose with `first_index` for logical counts.
    pub(crate) fn num_entries(&self) -> u64 {
        self.sealed.len() as u64 * MAX_ENTRIES as u64 + self.next_slot as u64
    }

    pub(crate) fn term(&self, idx: u64) -> WalResult<u64> {
        if idx > self.last_index {
            return Err(WalError::Unavailable);
        }
        let file_pos = self.locate(idx).ok_or(WalError::Compacted)?;
        let file = self.nth(file_pos);
        Ok(file.slot((idx - file.base()) as usize)?.term)
    }

    /// A bounded prefix of `[lo, hi)`. The entry that pushes the running
    /// serialized size past `max_size` is included, then iteration stops;
    /// at least one entry is returned whenever any exist in range.
    pub(crate) fn entries(
        &self,
        lo: u64,
        hi: u64,
        max_size: Option<u64>,
    ) -> WalResult<Vec<Entry>> {
        if hi.saturating_sub(1) > self.last_index {
            return Err(WalError::Unavailable);
        }
        if lo >= hi {
            return Ok(Vec::new());
        }

        let mut file_pos = self.locate(lo).ok_or(WalError::Compacted)?;
        let mut slot = (lo - self.nth(file_pos).base()) as usize;
        let mut out = Vec::with_capacity((hi - lo) as usize);
        let mut size = 0u64;

        for _ in lo..hi {
            if slot == self.occupied(file_pos) {
                file_pos += 1;
                slot = 0;
            }
            let file = self.nth(file_pos);
            let end = if slot + 1 < self.occupied(file_pos) {
                file.slot(slot + 1)?.offset
            } else {
                self.high_water_of(file_pos)?
            };
            let entry = file.read_entry(slot, end)?;
            size += u64::from(entry.compute_size());
            out.push(entry);
            if max_size.is_some_and(|max| size > max) {
                break;
            }
            slot += 1;
        }
        Ok(out)
    }

    /// Appends entries in order, rotating at the file boundary, truncating
    /// on overwrite, and restarting the log when an installed snapshot has
    /// moved the index past the end. Flushes the tail before returning.
    pub(crate) fn append(&mut self, entries: &[Entry]) -> WalResult<()> {
        if entries.is_empty() {
            return Ok(());
        }
        for entry in entries {
            let idx = entry.get_index();
            debug_assert!(idx > 0, "raft entries start at index 1");
            if idx <= self.last_index {
                self.truncate(idx)?;
            } else if idx != self.last_index + 1 {
                // Forward jump: a snapshot was installed past the log end.
                // Slot position must stay index - base, so start over.
                self.reset(idx)?;
            }
            if self.next_slot == MAX_ENTRIES {
                self.rotate(idx)?;
            }

            let data = entry.get_data();
            let offset = self.hwm;
            if !data.is_empty() {
                self.tail.write_payload(offset, data)?;
                self.hwm += data.len() as u64;
            }
            self.tail.put_slot(
                self.next_slot,
                Slot {
                    term: entry.get_term(),
                    index: idx,
                    offset,
                    typ: entry.get_entry_type() as u64,
                },
            )?;
            if !data.is_empty() {
                self.tail.set_high_water(self.hwm)?;
            }
            self.next_slot += 1;
            self.last_index = idx;
        }
        self.tail.flush()
    }

    /// Removes every entry with index >= `from`. Whole files above the
    /// truncation point are unlinked (highest first, so a crash in between
    /// leaves a gap-free prefix); the remainder is zeroed in the tail.
    pub(crate) fn truncate(&mut self, from: u64) -> WalResult<()> {
        debug_assert!(from >= 1);
        debug!(from, "truncating log");

        let mut deleted = false;
        while self.tail.base() > from {
            match self.sealed.pop() {
                Some(prev) => {
                    self.next_slot = MAX_ENTRIES;
                    self.hwm = prev.high_water()?;
                    let old = std::mem::replace(&mut self.tail, prev);
                    old.delete()?;
                    deleted = true;
                }
                None => {
                    // Nothing precedes the tail; restart at `from`. Unlink
                    // before creating so no partial file can outlive a
                    // crash between the two.
                    self.tail.unlink()?;
                    sync_dir(&self.dir)?;
                    self.tail = EntryFile::create(&self.dir, from)?;
                    sync_dir(&self.dir)?;
                    self.next_slot = 0;
                    self.hwm = PAYLOAD_BASE;
                    self.last_index = from - 1;
                    return Ok(());
                }
            }
        }
        if deleted {
            sync_dir(&self.dir)?;
        }

        let pos = (from - self.tail.base()) as usize;
        if pos < self.next_slot {
            // Footer first: recovery treats slots past the high-water mark
            // as a torn suffix, so a crash mid-zeroing stays consistent.
            let boundary = if pos == 0 {
                PAYLOAD_BASE
            } else {
                self.tail.slot(pos)?.offset
            };
            self.hwm = boundary;
            self.tail.set_high_water(boundary)?;
            self.tail.zero_slots_from(pos)?;
            self.next_slot = pos;
        }
        self.tail.flush()?;
        self.last_index = from - 1;
        Ok(())
    }

    /// Unlinks every sealed file whose last entry precedes `until`. The
    /// file containing `until` and the tail are always retained, so term
    /// lookups at the snapshot boundary keep working.
    pub(crate) fn discard(&mut self, until: u64) -> WalResult<()> {
        let mut removed = 0usize;
        while let Some(first) = self.sealed.first() {
            if first.base() + MAX_ENTRIES as u64 - 1 >= until {
                break;
            }
            let file = self.sealed.remove(0);
            file.delete()?;
            removed += 1;
        }
        if removed > 0 {
            sync_dir(&self.dir)?;
            debug!(removed, until, "discarded superseded entry files");
        }
        Ok(())
    }

    pub(crate) fn flush_tail(&self) -> WalResult<()> {
        self.tail.flush()
    }

    /// Seals the tail and starts a new file named by the incoming index.
    fn rotate(&mut self, first_index: u64) -> WalResult<()> {
        self.tail.flush()?;
        let new_tail = EntryFile::create(&self.dir, first_index)?;
        sync_dir(&self.dir)?;
        let sealed = std::mem::replace(&mut self.tail, new_tail);
        self.sealed.push(sealed);
        self.next_slot = 0;
        self.hwm = PAYLOAD_BASE;
        debug!(first_index, "rotated entry file");
        Ok(())
    }

    /// Deletes every file and starts over with a fresh tail at `first_index`.
    fn reset(&mut self, first_index: u64) -> WalResult<()> {
        debug!(first_index, "restarting log");
        while let Some(file) = self.sealed.pop() {
            file.delete()?;
        }
        // Unlink before creating the replacement; a crash in between
        // reopens as an empty log, never as a partial sealed file.
        self.tail.unlink()?;
        sync_dir(&self.dir)?;
        self.tail = EntryFile::create(&self.dir, first_index)?;
        sync_dir(&self.dir)?;
        self.next_slot = 0;
        self.hwm = PAYLOAD_BASE;
        self.last_index = first_index - 1;
        Ok(())
    }

    /// Position (into sealed files, then the tail) of the file holding
    /// `idx`, or None when `idx` precedes the earliest retained entry.
    /// Indices past the end are the caller's bounds check.
    fn locate(&self, idx: u64) -> Option<usize> {
        if idx >= self.tail.base() {
            if idx - self.tail.base() < self.next_slot as u64 {
                return Some(self.sealed.len());
            }
            return None;
        }
        let pos = self.sealed.partition_point(|f| f.base() <= idx);
        // Sealed files are full and gap-free, so the predecessor holds idx.
        if pos == 0 {
            return None;
        }
        Some(pos - 1)
    }

    fn nth(&self, pos: usize) -> &EntryFile {
        self.sealed.get(pos).unwrap_or(&self.tail)
    }

    fn occupied(&self, pos: usize) -> usize {
        if pos < self.sealed.len() {
            MAX_ENTRIES
        } else {
            self.next_slot
        }
    }

    fn high_water_of(&self, pos: usize) -> WalResult<u64> {
        if pos < self.sealed.len() {
            self.sealed[pos].high_water()
        } else {
            Ok(self.hwm)
        }
    }
}

fn sync_dir(dir: &Path) -> WalResult<()> {
    File::open(dir)
        .and_then(|f| f.sync_all())
        .map_err(|e| WalError::io("sync", dir, e))
}
