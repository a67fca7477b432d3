use std::path::PathBuf;

/// Open-time configuration for a [`crate::WalStore`].
///
/// Only placement and identity are configurable. The on-disk format
/// constants (slot size, entries per file, file sizes) define the layout
/// and are deliberately not exposed here.
///
/// # Example
/// ```no_run
/// use raftwal::WalConfig;
/// use std::path::PathBuf;
///
/// let config = WalConfig::builder()
///     .dir(PathBuf::from("./raft/group-1"))
///     .raft_id(7)
///     .group_id(1)
///     .build();
/// ```
#[derive(Clone, Debug, bon::Builder)]
pub struct WalConfig {
    /// Directory holding `wal.meta` and the `<first-index>.ent` files.
    /// One directory per Raft group; created if absent.
    pub dir: PathBuf,
    /// Node identifier, persisted in the meta page.
    pub raft_id: u64,
    /// Raft group identifier. Carried for log context; the meta page
    /// layout has no slot for it.
    #[builder(default = 0)]
    pub group_id: u32,
    /// Capacity of the queue feeding the background discard worker.
    /// `create_snapshot` blocks once the worker falls this far behind.
    #[builder(default = 16)]
    pub discard_queue_depth: usize,
}
