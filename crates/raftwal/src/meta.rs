//! The fixed 4 KiB metadata page (`wal.meta`).
//!
//! Layout, all integers big-endian:
//!
//! ```text
//! [0..8)       raft node id
//! [8..512)     checkpoint record
//! [512..1024)  hard state record
//! [1024..4096) snapshot record
//! ```
//!
//! Each variable record is a 4-byte length followed by a protobuf payload;
//! a zero length reads as absent. Overwrites zero the length first and
//! write it back last, so a crash mid-write leaves either the old value or
//! an absent one, never a truncated payload behind a live length.

use std::path::Path;

use protobuf::Message;
use raft::eraftpb::{HardState, Snapshot};

use crate::error::{WalError, WalResult};
use crate::mmap::MmapRegion;

/// Size of the meta file, exactly one page.
pub const META_SIZE: u64 = 4096;
/// Offset of the hard state record.
pub const META_HS_OFFSET: u64 = 512;
/// Offset of the snapshot record.
pub const META_SNAP_OFFSET: u64 = 1024;

const RAFT_ID_OFFSET: u64 = 0;
const CHECKPOINT_OFFSET: u64 = 8;

const CHECKPOINT_CAPACITY: u64 = META_HS_OFFSET - CHECKPOINT_OFFSET;
const HS_CAPACITY: u64 = META_SNAP_OFFSET - META_HS_OFFSET;
const SNAP_CAPACITY: u64 = META_SIZE - META_SNAP_OFFSET;

/// Name of the meta file inside the log directory.
pub(crate) const META_FILE: &str = "wal.meta";

/// Structured access to the meta page. Every mutation flushes before
/// returning success.
#[derive(Debug)]
pub(crate) struct MetaPage {
    region: MmapRegion,
}

impl MetaPage {
    pub(crate) fn open(dir: &Path) -> WalResult<Self> {
        let region = MmapRegion::open(&dir.join(META_FILE), META_SIZE, META_SIZE)?;
        Ok(Self { region })
    }

    pub(crate) fn raft_id(&self) -> WalResult<u64> {
        self.region.read_u64(RAFT_ID_OFFSET)
    }

    pub(crate) fn set_raft_id(&mut self, id: u64) -> WalResult<()> {
        self.region.write_u64(RAFT_ID_OFFSET, id)?;
        self.region.flush()
    }

    /// Empty record when absent or never written.
    pub(crate) fn hard_state(&self) -> WalResult<HardState> {
        match self.read_record(META_HS_OFFSET, HS_CAPACITY)? {
            Some(raw) => decode(&self.region, META_HS_OFFSET, raw),
            None => Ok(HardState::default()),
        }
    }

    /// No-op on the empty hard state. Raft never regresses the term
    /// (invariant of the consensus layer, asserted here in debug builds).
    pub(crate) fn set_hard_state(&mut self, hs: &HardState) -> WalResult<()> {
        if *hs == HardState::default() {
            return Ok(());
        }
        debug_assert!(
            hs.get_term() >= self.hard_state()?.get_term(),
            "hard state term regression"
        );
        let raw = encode(&self.region, hs)?;
        self.write_record(META_HS_OFFSET, HS_CAPACITY, &raw)
    }

    /// Empty record when absent.
    pub(crate) fn snapshot(&self) -> WalResult<Snapshot> {
        match self.read_record(META_SNAP_OFFSET, SNAP_CAPACITY)? {
            Some(raw) => decode(&self.region, META_SNAP_OFFSET, raw),
            None => Ok(Snapshot::default()),
        }
    }

    /// No-op on an empty snapshot.
    pub(crate) fn set_snapshot(&mut self, snap: &Snapshot) -> WalResult<()> {
        if snap.get_metadata().get_index() == 0 {
            return Ok(());
        }
        let raw = encode(&self.region, snap)?;
        self.write_record(META_SNAP_OFFSET, SNAP_CAPACITY, &raw)
    }

    /// Index of the application checkpoint, 0 when never written.
    pub(crate) fn checkpoint(&self) -> WalResult<u64> {
        match self.read_record(CHECKPOINT_OFFSET, CHECKPOINT_CAPACITY)? {
            Some(raw) => {
                let snap: Snapshot = decode(&self.region, CHECKPOINT_OFFSET, raw)?;
                Ok(snap.get_metadata().get_index())
            }
            None => Ok(0),
        }
    }

    /// Stores a snapshot-shaped checkpoint marker.
    pub(crate) fn set_checkpoint(&mut self, snap: &Snapshot) -> WalResult<()> {
        let raw = encode(&self.region, snap)?;
        self.write_record(CHECKPOINT_OFFSET, CHECKPOINT_CAPACITY, &raw)
    }

    pub(crate) fn flush(&self) -> WalResult<()> {
        self.region.flush()
    }

    fn read_record(&self, offset: u64, capacity: u64) -> WalResult<Option<&[u8]>> {
        let len = u64::from(self.region.read_u32(offset)?);
        if len == 0 {
            return Ok(None);
        }
        if len + 4 > capacity {
            return Err(WalError::corruption(
                self.region.path(),
                offset,
                format!("record length {len} exceeds region capacity {capacity}"),
            ));
        }
        self.region.slice(offset + 4, len).map(Some)
    }

    fn write_record(&mut self, offset: u64, capacity: u64, payload: &[u8]) -> WalResult<()> {
        let len = payload.len() as u64;
        if len + 4 > capacity {
            return Err(WalError::OutOfSpace {
                path: self.region.path().to_path_buf(),
                requested: len + 4,
                max: capacity,
            });
        }
        self.region.write_u32(offset, 0)?;
        self.region.write_at(offset + 4, payload)?;
        self.region.write_u32(offset, len as u32)?;
        self.region.flush()
    }
}

fn encode<M: Message>(region: &MmapRegion, msg: &M) -> WalResult<Vec<u8>> {
    msg.write_to_bytes().map_err(|e| {
        WalError::corruption(region.path(), 0, format!("protobuf encode failed: {e}"))
    })
}

fn decode<M: Message>(region: &MmapRegion, offset: u64, raw: &[u8]) -> WalResult<M> {
    M::parse_from_bytes(raw).map_err(|e| {
        WalError::corruption(
            region.path(),
            offset,
            format!("protobuf decode failed: {e}"),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn snapshot_at(index: u64, term: u64) -> Snapshot {
        let mut snap = Snapshot::default();
        snap.mut_metadata().set_index(index);
        snap.mut_metadata().set_term(term);
        snap
    }

    #[test]
    fn fresh_page_reads_as_absent() {
        let dir = tempdir().unwrap();
        let meta = MetaPage::open(dir.path()).unwrap();
        assert_eq!(meta.raft_id().unwrap(), 0);
        assert_eq!(meta.hard_state().unwrap(), HardState::default());
        assert_eq!(meta.snapshot().unwrap(), Snapshot::default());
        assert_eq!(meta.checkpoint().unwrap(), 0);
    }

    #[test]
    fn raft_id_is_big_endian_at_offset_zero() {
        let dir = tempdir().unwrap();
        let mut meta = MetaPage::open(dir.path()).unwrap();
        meta.set_raft_id(7).unwrap();
        drop(meta);

        let raw = std::fs::read(dir.path().join(META_FILE)).unwrap();
        assert_eq!(raw.len() as u64, META_SIZE);
        assert_eq!(&raw[0..8], &7u64.to_be_bytes());
    }

    #[test]
    fn hard_state_roundtrip_survives_reopen() {
        let dir = tempdir().unwrap();
        let mut hs = HardState::default();
        hs.set_term(3);
        hs.set_vote(2);
        hs.set_commit(11);
        {
            let mut meta = MetaPage::open(dir.path()).unwrap();
            meta.set_hard_state(&hs).unwrap();
        }
        let meta = MetaPage::open(dir.path()).unwrap();
        assert_eq!(meta.hard_state().unwrap(), hs);
    }

    #[test]
    fn empty_hard_state_does_not_clobber() {
        let dir = tempdir().unwrap();
        let mut meta = MetaPage::open(dir.path()).unwrap();
        let mut hs = HardState::default();
        hs.set_term(5);
        meta.set_hard_state(&hs).unwrap();
        meta.set_hard_state(&HardState::default()).unwrap();
        assert_eq!(meta.hard_state().unwrap().get_term(), 5);
    }

    #[test]
    fn snapshot_and_checkpoint_are_independent() {
        let dir = tempdir().unwrap();
        let mut meta = MetaPage::open(dir.path()).unwrap();
        meta.set_snapshot(&snapshot_at(100, 2)).unwrap();
        meta.set_checkpoint(&snapshot_at(40, 2)).unwrap();
        assert_eq!(meta.snapshot().unwrap().get_metadata().get_index(), 100);
        assert_eq!(meta.checkpoint().unwrap(), 40);
    }

    #[test]
    fn oversized_snapshot_is_rejected() {
        let dir = tempdir().unwrap();
        let mut meta = MetaPage::open(dir.path()).unwrap();
        let mut snap = snapshot_at(1, 1);
        snap.set_data(vec![0xAB; 4096].into());
        let err = meta.set_snapshot(&snap).unwrap_err();
        assert!(matches!(err, WalError::OutOfSpace { .. }));
        // The stored value is untouched.
        assert_eq!(meta.snapshot().unwrap(), Snapshot::default());
    }

    #[test]
    fn zeroed_length_prefix_reads_as_absent() {
        let dir = tempdir().unwrap();
        {
            let mut meta = MetaPage::open(dir.path()).unwrap();
            let mut hs = HardState::default();
            hs.set_term(9);
            meta.set_hard_state(&hs).unwrap();
        }
        // Simulate a crash that zeroed the length but left payload bytes.
        let path = dir.path().join(META_FILE);
        let mut raw = std::fs::read(&path).unwrap();
        raw[META_HS_OFFSET as usize..META_HS_OFFSET as usize + 4].fill(0);
        std::fs::write(&path, &raw).unwrap();

        let meta = MetaPage::open(dir.path()).unwrap();
        assert_eq!(meta.hard_state().unwrap(), HardState::default());
    }
}
