//! Memory-mapped write-ahead log backing a Raft consensus node.
//!
//! The store keeps three durable artifacts in one directory per Raft
//! group: the replicated log entries, the latest hard state (term, vote,
//! commit), and the most recent snapshot. It serves the read/write
//! contract Raft expects of its storage collaborator and implements
//! [`raft::Storage`] directly.
//!
//! # Architecture
//!
//! - **`wal.meta`**: a single 4 KiB page holding the node identity, an
//!   application checkpoint, the hard state, and the snapshot, each as a
//!   length-prefixed protobuf record overwritten length-last so a crash
//!   leaves the old value or an absent one.
//! - **`<first-index>.ent`**: pre-allocated entry files, each with a fixed
//!   index region of 30,000 32-byte slots and a payload heap above 1 MiB.
//!   Index→entry lookup is a binary search over files plus one slot read.
//!   Only the newest file is written; compaction unlinks whole files once
//!   a snapshot supersedes them, on a background worker.
//! - **Durability**: everything is memory-mapped; `flush` (msync) is the
//!   only primitive. Within one `save`, entries flush before the hard
//!   state that references them, and the snapshot is written last.
//!
//! # Example
//!
//! ```no_run
//! use raft::eraftpb::{Entry, HardState, Snapshot};
//! use raftwal::{WalConfig, WalStore};
//!
//! let store = WalStore::open(
//!     WalConfig::builder()
//!         .dir("./raft/group-1".into())
//!         .raft_id(7)
//!         .build(),
//! )?;
//!
//! let mut entry = Entry::default();
//! entry.set_term(1);
//! entry.set_index(1);
//! entry.set_data(b"payload".to_vec().into());
//! let mut hs = HardState::default();
//! hs.set_term(1);
//! hs.set_commit(1);
//! store.save(&hs, &[entry], &Snapshot::default())?;
//!
//! let entries = store.entries(1, 2, None)?;
//! assert_eq!(entries[0].get_data(), b"payload");
//! # Ok::<(), raftwal::WalError>(())
//! ```

mod config;
mod entry_file;
mod error;
mod log;
mod meta;
mod mmap;
mod store;


pub use config::WalConfig;
pub use entry_file::{FILE_INIT_SIZE, FILE_MAX_SIZE, MAX_ENTRIES, PAYLOAD_BASE, SLOT_SIZE};
pub use error::{WalError, WalResult};
pub use meta::{META_HS_OFFSET, META_SIZE, META_SNAP_OFFSET};
pub use store::WalStore;
