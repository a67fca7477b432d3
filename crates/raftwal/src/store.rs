//! Top-level store: meta page + entry log behind the Raft storage contract.
//!
//! One Raft driver thread issues all mutations; a background worker unlinks
//! entry files superseded by snapshots. Reads go through `&self` and the
//! interior locks, which is what lets the store implement [`raft::Storage`]
//! directly.

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::RwLock;
use raft::eraftpb::{ConfState, Entry, HardState, Snapshot};
use raft::{GetEntriesContext, RaftState, Storage};
use tracing::{error, info};

use crate::config::WalConfig;
use crate::error::{WalError, WalResult};
use crate::log::EntryLog;
use crate::meta::MetaPage;

/// Range of superseded entries handed to the discard worker. Only `until`
/// selects files; `from` is carried for logging.
#[derive(Clone, Copy, Debug)]
struct DiscardRange {
    from: u64,
    until: u64,
}

/// Durable Raft storage over one log directory.
///
/// Composes the meta page (identity, hard state, snapshot, checkpoint) and
/// the entry log (the replicated entries themselves). All operations are
/// crash-consistent under the flush ordering documented on [`Self::save`].
pub struct WalStore {
    dir: PathBuf,
    meta: RwLock<MetaPage>,
    log: Arc<RwLock<EntryLog>>,
    /// Cached copy of the meta snapshot record; every read-side operation
    /// consults it, so the protobuf is parsed once per write, not per read.
    snapshot: RwLock<Snapshot>,
    discard_tx: Option<Sender<DiscardRange>>,
    worker: Option<JoinHandle<()>>,
}

impl WalStore {
    /// Opens (or initializes) the store and starts the discard worker.
    ///
    /// A brand-new log carries the implicit dummy entry (term 0, index 0):
    /// the zeroed slot 0 of the first file is that entry, giving Raft its
    /// matching anchor without a byte written.
    pub fn open(config: WalConfig) -> WalResult<Self> {
        std::fs::create_dir_all(&config.dir)
            .map_err(|e| WalError::io("create dir", &config.dir, e))?;

        let mut meta = MetaPage::open(&config.dir)?;
        if meta.raft_id()? != config.raft_id {
            meta.set_raft_id(config.raft_id)?;
        }
        let snapshot = meta.snapshot()?;
        let log = Arc::new(RwLock::new(EntryLog::open(&config.dir)?));

        let (tx, rx) = bounded(config.discard_queue_depth);
        let worker_log = Arc::clone(&log);
        let worker = thread::Builder::new()
            .name("raftwal-discard".into())
            .spawn(move || discard_loop(&worker_log, &rx))
            .map_err(|e| WalError::io("spawn worker", &config.dir, e))?;

        info!(
            raft_id = config.raft_id,
            group_id = config.group_id,
            dir = %config.dir.display(),
            "opened wal store"
        );
        Ok(Self {
            dir: config.dir,
            meta: RwLock::new(meta),
            log,
            snapshot: RwLock::new(snapshot),
            discard_tx: Some(tx),
            worker: Some(worker),
        })
    }

    /// Hard state and membership for Raft startup.
    pub fn initial_state(&self) -> WalResult<RaftState> {
        let hard_state = self.meta.read().hard_state()?;
        let conf_state = self.snapshot.read().get_metadata().get_conf_state().clone();
        Ok(RaftState {
            hard_state,
            conf_state,
        })
    }

    /// First materially stored index. With a snapshot this is its index
    /// plus one; a fresh log reports 0, the dummy-entry anchor.
    pub fn first_index(&self) -> WalResult<u64> {
        let snap_index = self.snapshot_index();
        if snap_index > 0 {
            Ok(snap_index + 1)
        } else {
            self.log.read().first_index()
        }
    }

    /// Largest index ever appended or covered by a snapshot.
    pub fn last_index(&self) -> WalResult<u64> {
        Ok(self.log.read().last_index().max(self.snapshot_index()))
    }

    /// Index slots held on disk; compose with `first_index` for a count of
    /// live entries.
    pub fn num_entries(&self) -> WalResult<u64> {
        Ok(self.log.read().num_entries())
    }

    /// Term of entry `idx`. The snapshot boundary itself stays answerable
    /// after compaction (Raft match checks probe it).
    pub fn term(&self, idx: u64) -> WalResult<u64> {
        {
            let snap = self.snapshot.read();
            let snap_index = snap.get_metadata().get_index();
            if idx < snap_index {
                return Err(WalError::Compacted);
            }
            if idx == snap_index {
                return Ok(snap.get_metadata().get_term());
            }
        }
        self.log.read().term(idx)
    }

    /// A bounded prefix of entries `[lo, hi)`; see the log for the
    /// `max_size` inclusion rule.
    pub fn entries(
        &self,
        lo: u64,
        hi: u64,
        max_size: impl Into<Option<u64>>,
    ) -> WalResult<Vec<Entry>> {
        if lo < self.first_index()? {
            return Err(WalError::Compacted);
        }
        self.log.read().entries(lo, hi, max_size.into())
    }

    /// The stored snapshot, empty if none was ever written.
    pub fn snapshot(&self) -> WalResult<Snapshot> {
        Ok(self.snapshot.read().clone())
    }

    /// Persists one Raft `Ready` batch. Durability order is entries, then
    /// hard state, then snapshot, each flushed before the next, so a crash
    /// never leaves hard state referencing unflushed entries, nor a
    /// snapshot advertising an entry that is not durable.
    pub fn save(
        &self,
        hard_state: &HardState,
        entries: &[Entry],
        snapshot: &Snapshot,
    ) -> WalResult<()> {
        if !entries.is_empty() {
            self.log.write().append(entries)?;
        }
        self.meta.write().set_hard_state(hard_state)?;

        let incoming = snapshot.get_metadata().get_index();
        if incoming > 0 {
            let stored = self.snapshot_index();
            // Re-installing an old snapshot is a no-op, not an error.
            if incoming > stored {
                self.meta.write().set_snapshot(snapshot)?;
                *self.snapshot.write() = snapshot.clone();
                self.enqueue_discard(DiscardRange {
                    from: stored,
                    until: incoming,
                })?;
            }
        }
        Ok(())
    }

    /// Builds and persists a snapshot at `idx`, then queues compaction of
    /// the files it fully supersedes.
    pub fn create_snapshot(
        &self,
        idx: u64,
        conf_state: ConfState,
        data: Vec<u8>,
    ) -> WalResult<Snapshot> {
        let stored = self.snapshot_index();
        if idx <= stored {
            return Err(WalError::SnapshotOutOfDate {
                requested: idx,
                stored,
            });
        }
        let term = self.term(idx)?;

        let mut snap = Snapshot::default();
        snap.mut_metadata().set_index(idx);
        snap.mut_metadata().set_term(term);
        snap.mut_metadata().set_conf_state(conf_state);
        snap.set_data(data.into());

        self.meta.write().set_snapshot(&snap)?;
        *self.snapshot.write() = snap.clone();
        self.enqueue_discard(DiscardRange {
            from: stored,
            until: idx,
        })?;
        Ok(snap)
    }

    /// Index of the application checkpoint, 0 when never written.
    pub fn checkpoint(&self) -> WalResult<u64> {
        self.meta.read().checkpoint()
    }

    /// Stores a snapshot-shaped checkpoint marker.
    pub fn update_checkpoint(&self, checkpoint: &Snapshot) -> WalResult<()> {
        self.meta.write().set_checkpoint(checkpoint)
    }

    /// Flushes the meta page and the tail entry file.
    pub fn sync(&self) -> WalResult<()> {
        self.meta.read().flush()?;
        self.log.read().flush_tail()
    }

    /// Stops the discard worker after it drains every queued range, then
    /// flushes. The store must be idle: no `save` may be in flight.
    pub fn close(&mut self) -> WalResult<()> {
        drop(self.discard_tx.take());
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                error!("discard worker panicked");
            }
            self.sync()?;
            info!(dir = %self.dir.display(), "closed wal store");
        }
        Ok(())
    }

    fn snapshot_index(&self) -> u64 {
        self.snapshot.read().get_metadata().get_index()
    }

    /// Blocks when the worker is behind: backpressure for snapshot-heavy
    /// callers.
    fn enqueue_discard(&self, range: DiscardRange) -> WalResult<()> {
        let tx = self.discard_tx.as_ref().ok_or_else(|| {
            WalError::io(
                "enqueue discard",
                &self.dir,
                io::Error::new(io::ErrorKind::BrokenPipe, "store is closed"),
            )
        })?;
        tx.send(range).map_err(|_| {
            WalError::io(
                "enqueue discard",
                &self.dir,
                io::Error::new(io::ErrorKind::BrokenPipe, "discard worker exited"),
            )
        })
    }
}

fn discard_loop(log: &Arc<RwLock<EntryLog>>, rx: &Receiver<DiscardRange>) {
    // Runs until the sender is dropped AND the queue is drained, so close
    // always finishes pending compaction.
    for range in rx {
        if let Err(err) = log.write().discard(range.until) {
            error!(%err, from = range.from, until = range.until, "discard failed");
        }
    }
}

impl Drop for WalStore {
    fn drop(&mut self) {
        if self.worker.is_some() {
            if let Err(err) = self.close() {
                error!(%err, "failed to close wal store");
            }
        }
    }
}

impl Storage for WalStore {
    fn initial_state(&self) -> raft::Result<RaftState> {
        Ok(WalStore::initial_state(self)?)
    }

    fn entries(
        &self,
        low: u64,
        high: u64,
        max_size: impl Into<Option<u64>>,
        _context: GetEntriesContext,
    ) -> raft::Result<Vec<Entry>> {
        Ok(WalStore::entries(self, low, high, max_size)?)
    }

    fn term(&self, idx: u64) -> raft::Result<u64> {
        Ok(WalStore::term(self, idx)?)
    }

    fn first_index(&self) -> raft::Result<u64> {
        Ok(WalStore::first_index(self)?)
    }

    fn last_index(&self) -> raft::Result<u64> {
        Ok(WalStore::last_index(self)?)
    }

    fn snapshot(&self, _request_index: u64, _to: u64) -> raft::Result<Snapshot> {
        // This layer always has its latest snapshot at hand, so
        // SnapshotTemporarilyUnavailable is never produced.
        Ok(WalStore::snapshot(self)?)
    }
}
