//! One pre-allocated entry file (`<first-index>.ent`).
//!
//! Layout, all integers big-endian:
//!
//! ```text
//! [0 .. 960000)        index region: 30,000 slots of 32 bytes
//! [960000 .. 960008)   payload high-water mark footer (u64)
//! [960008 .. 1 MiB)    reserved, zero
//! [1 MiB .. )          payload heap, raw concatenation, no framing
//! ```
//!
//! A slot records (term, index, payload-offset, type). Payload lengths are
//! implicit: entry k's payload ends where entry k+1's begins, and the last
//! occupied slot's payload ends at the footer. Every slot stores the heap
//! allocation point current at its append, so offsets are monotone and the
//! rule needs no special case for empty payloads.

use std::fs;
use std::path::{Path, PathBuf};

use protobuf::ProtobufEnum;
use raft::eraftpb::{Entry, EntryType};

use crate::error::{WalError, WalResult};
use crate::mmap::MmapRegion;

/// Maximum number of index slots per entry file.
pub const MAX_ENTRIES: usize = 30_000;
/// Size of one index slot in bytes.
pub const SLOT_SIZE: u64 = 32;
/// File offset where the payload heap begins.
pub const PAYLOAD_BASE: u64 = 1 << 20;
/// Initial allocation for a fresh entry file.
pub const FILE_INIT_SIZE: u64 = 4 * PAYLOAD_BASE;
/// Hard ceiling on an entry file's size.
pub const FILE_MAX_SIZE: u64 = 1 << 30;

/// Footer slot holding the payload high-water mark, just past the slots.
const HWM_OFFSET: u64 = MAX_ENTRIES as u64 * SLOT_SIZE;

const ENTRY_FILE_EXT: &str = "ent";

/// One 32-byte index record.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct Slot {
    pub term: u64,
    pub index: u64,
    pub offset: u64,
    pub typ: u64,
}

impl Slot {
    fn to_bytes(self) -> [u8; SLOT_SIZE as usize] {
        let mut buf = [0u8; SLOT_SIZE as usize];
        buf[0..8].copy_from_slice(&self.term.to_be_bytes());
        buf[8..16].copy_from_slice(&self.index.to_be_bytes());
        buf[16..24].copy_from_slice(&self.offset.to_be_bytes());
        buf[24..32].copy_from_slice(&self.typ.to_be_bytes());
        buf
    }

    fn from_bytes(buf: &[u8]) -> Self {
        Self {
            term: u64::from_be_bytes(buf[0..8].try_into().unwrap()),
            index: u64::from_be_bytes(buf[8..16].try_into().unwrap()),
            offset: u64::from_be_bytes(buf[16..24].try_into().unwrap()),
            typ: u64::from_be_bytes(buf[24..32].try_into().unwrap()),
        }
    }

    /// An all-zero index terminates the occupied prefix.
    pub(crate) fn is_empty(self) -> bool {
        self.index == 0
    }
}

/// Typed view of one entry file. The log mutates only its tail file; all
/// older files are read through the same type but never written.
#[derive(Debug)]
pub(crate) struct EntryFile {
    base: u64,
    region: MmapRegion,
}

/// Path of the entry file with the given first index.
pub(crate) fn entry_file_path(dir: &Path, first_index: u64) -> PathBuf {
    dir.join(format!("{first_index}.{ENTRY_FILE_EXT}"))
}

/// Parses `<first-index>.ent`, ignoring anything else in the directory.
pub(crate) fn parse_entry_file_name(path: &Path) -> Option<u64> {
    if path.extension()? != ENTRY_FILE_EXT {
        return None;
    }
    path.file_stem()?.to_str()?.parse().ok()
}

impl EntryFile {
    /// Creates a fresh, zero-initialized file named by its first index.
    pub(crate) fn create(dir: &Path, first_index: u64) -> WalResult<Self> {
        let path = entry_file_path(dir, first_index);
        let region = MmapRegion::open(&path, FILE_INIT_SIZE, FILE_MAX_SIZE)?;
        Ok(Self {
            base: first_index,
            region,
        })
    }

    /// Opens an existing file; `base` comes from the file name.
    pub(crate) fn open(path: &Path, base: u64) -> WalResult<Self> {
        let region = MmapRegion::open(path, FILE_INIT_SIZE, FILE_MAX_SIZE)?;
        Ok(Self { base, region })
    }

    /// The first index encoded in the file name.
    pub(crate) fn base(&self) -> u64 {
        self.base
    }

    pub(crate) fn path(&self) -> &Path {
        self.region.path()
    }

    /// The stored index of slot 0; zero means the file is empty.
    pub(crate) fn first_index(&self) -> WalResult<u64> {
        Ok(self.slot(0)?.index)
    }

    pub(crate) fn slot(&self, i: usize) -> WalResult<Slot> {
        debug_assert!(i < MAX_ENTRIES);
        let raw = self.region.slice(i as u64 * SLOT_SIZE, SLOT_SIZE)?;
        Ok(Slot::from_bytes(raw))
    }

    pub(crate) fn put_slot(&mut self, i: usize, slot: Slot) -> WalResult<()> {
        debug_assert!(i < MAX_ENTRIES);
        self.region.write_at(i as u64 * SLOT_SIZE, &slot.to_bytes())
    }

    /// Smallest slot position whose index is zero, `MAX_ENTRIES` if full.
    pub(crate) fn first_empty(&self) -> WalResult<usize> {
        for i in 0..MAX_ENTRIES {
            if self.slot(i)?.is_empty() {
                return Ok(i);
            }
        }
        Ok(MAX_ENTRIES)
    }

    /// Payload high-water mark from the footer, never below the heap base.
    pub(crate) fn high_water(&self) -> WalResult<u64> {
        Ok(self.region.read_u64(HWM_OFFSET)?.max(PAYLOAD_BASE))
    }

    /// Footer value validated against the mapped length. Both open paths
    /// use this so a corrupt footer fails at open, not on a later read
    /// that slices past the end of the file.
    fn checked_high_water(&self) -> WalResult<u64> {
        let hwm = self.high_water()?;
        if hwm > self.region.len() {
            return Err(WalError::corruption(
                self.path(),
                HWM_OFFSET,
                format!("high-water mark {hwm} past file length {}", self.region.len()),
            ));
        }
        Ok(hwm)
    }

    pub(crate) fn set_high_water(&mut self, hwm: u64) -> WalResult<()> {
        debug_assert!(hwm >= PAYLOAD_BASE);
        self.region.write_u64(HWM_OFFSET, hwm)
    }

    /// Copies payload bytes into the heap at `offset`, growing the file.
    pub(crate) fn write_payload(&mut self, offset: u64, bytes: &[u8]) -> WalResult<()> {
        debug_assert!(offset >= PAYLOAD_BASE);
        self.region.write_at(offset, bytes)
    }

    /// Materializes the entry at `slot_idx` whose payload ends at `end`
    /// (the successor's offset, or the high-water mark for the last one).
    pub(crate) fn read_entry(&self, slot_idx: usize, end: u64) -> WalResult<Entry> {
        let slot = self.slot(slot_idx)?;
        if end < slot.offset {
            return Err(WalError::corruption(
                self.path(),
                slot_idx as u64 * SLOT_SIZE,
                format!("payload end {end} precedes offset {}", slot.offset),
            ));
        }

        let mut entry = Entry::default();
        entry.set_term(slot.term);
        entry.set_index(slot.index);
        let typ = EntryType::from_i32(slot.typ as i32).ok_or_else(|| {
            WalError::corruption(
                self.path(),
                slot_idx as u64 * SLOT_SIZE + 24,
                format!("unknown entry type {}", slot.typ),
            )
        })?;
        entry.set_entry_type(typ);
        if end > slot.offset {
            let payload = self.region.slice(slot.offset, end - slot.offset)?;
            entry.set_data(payload.to_vec().into());
        }
        Ok(entry)
    }

    /// Zeroes the index region from `slot_idx` to the end of the slots.
    pub(crate) fn zero_slots_from(&mut self, slot_idx: usize) -> WalResult<()> {
        if slot_idx >= MAX_ENTRIES {
            return Ok(());
        }
        let start = slot_idx as u64 * SLOT_SIZE;
        self.region.zero_range(start, HWM_OFFSET - start)
    }

    /// Validates a sealed (rotated-away) file: a full, dense index region
    /// with monotone in-range payload offsets.
    pub(crate) fn validate_sealed(&self) -> WalResult<()> {
        if self.slot(MAX_ENTRIES - 1)?.is_empty() {
            return Err(WalError::corruption(
                self.path(),
                (MAX_ENTRIES as u64 - 1) * SLOT_SIZE,
                "sealed file has unoccupied slots",
            ));
        }
        self.validate_prefix(MAX_ENTRIES, self.checked_high_water()?)
    }

    /// Recovers the tail after an unclean shutdown: finds the occupied
    /// prefix, drops any slot suffix the footer never covered (torn,
    /// unacknowledged appends), zero-fills the rest of the index region,
    /// and validates what remains. Returns (occupied slots, high-water).
    pub(crate) fn recover_tail(&mut self) -> WalResult<(usize, u64)> {
        let hwm = self.checked_high_water()?;

        let mut occupied = self.first_empty()?;
        while occupied > 0 && self.slot(occupied - 1)?.offset > hwm {
            occupied -= 1;
        }
        self.zero_slots_from(occupied)?;
        self.validate_prefix(occupied, hwm)?;
        Ok((occupied, hwm))
    }

    fn validate_prefix(&self, occupied: usize, limit: u64) -> WalResult<()> {
        if occupied == 0 {
            return Ok(());
        }
        if self.slot(0)?.index != self.base {
            return Err(WalError::corruption(
                self.path(),
                8,
                format!(
                    "slot 0 holds index {} but the file name says {}",
                    self.slot(0)?.index,
                    self.base
                ),
            ));
        }
        let mut prev_offset = PAYLOAD_BASE;
        for i in 0..occupied {
            let slot = self.slot(i)?;
            if slot.index != self.base + i as u64 {
                return Err(WalError::corruption(
                    self.path(),
                    i as u64 * SLOT_SIZE + 8,
                    format!("slot {i} holds index {}, expected {}", slot.index, self.base + i as u64),
                ));
            }
            if slot.offset < prev_offset || slot.offset > limit {
                return Err(WalError::corruption(
                    self.path(),
                    i as u64 * SLOT_SIZE + 16,
                    format!(
                        "slot {i} payload offset {} outside [{prev_offset}, {limit}]",
                        slot.offset
                    ),
                ));
            }
            prev_offset = slot.offset;
        }
        Ok(())
    }

    pub(crate) fn flush(&self) -> WalResult<()> {
        self.region.flush()
    }

    /// Unmaps and unlinks the file.
    pub(crate) fn delete(self) -> WalResult<()> {
        let path = self.region.path().to_path_buf();
        drop(self.region);
        fs::remove_file(&path).map_err(|e| WalError::io("remove", &path, e))
    }

    /// Unlinks the file from the directory while the mapping stays alive.
    /// Lets a caller remove the old tail before its replacement exists, so
    /// a crash between the two never leaves a partial file behind.
    pub(crate) fn unlink(&self) -> WalResult<()> {
        fs::remove_file(self.path()).map_err(|e| WalError::io("remove", self.path(), e))
    }
}
