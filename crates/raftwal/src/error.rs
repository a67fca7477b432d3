use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Canonical error type for the write-ahead log.
///
/// The first three variants are routine Raft protocol errors: the caller is
/// expected to adapt (retry later, send a snapshot, fall back to a full
/// sync). Everything else is fatal to the node.
#[derive(Error, Debug)]
pub enum WalError {
    /// The requested index lies at or below the current snapshot index.
    #[error("log compacted: requested index predates the snapshot")]
    Compacted,
    /// The requested index lies past the last appended entry.
    #[error("log unavailable: requested index past the end of the log")]
    Unavailable,
    /// A snapshot was proposed at an index not newer than the stored one.
    #[error("snapshot out of date: index {requested} <= stored {stored}")]
    SnapshotOutOfDate { requested: u64, stored: u64 },
    /// A write would grow a file past its maximum size.
    #[error("{}: write of {requested} bytes exceeds maximum size {max}", .path.display())]
    OutOfSpace {
        path: PathBuf,
        requested: u64,
        max: u64,
    },
    /// On-disk state failed structural validation. The node should be
    /// wiped and re-replicated from its peers.
    #[error("corrupt wal file {} at offset {offset}: {reason}", .path.display())]
    Corruption {
        path: PathBuf,
        offset: u64,
        reason: String,
    },
    /// An underlying filesystem operation failed.
    #[error("{op} {}: {source}", .path.display())]
    Io {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl WalError {
    pub(crate) fn io(op: &'static str, path: impl Into<PathBuf>, source: io::Error) -> Self {
        WalError::Io {
            op,
            path: path.into(),
            source,
        }
    }

    pub(crate) fn corruption(
        path: impl Into<PathBuf>,
        offset: u64,
        reason: impl Into<String>,
    ) -> Self {
        WalError::Corruption {
            path: path.into(),
            offset,
            reason: reason.into(),
        }
    }
}

/// Result alias that carries a [`WalError`].
pub type WalResult<T> = Result<T, WalError>;

impl From<WalError> for raft::Error {
    fn from(err: WalError) -> Self {
        match err {
            WalError::Compacted => raft::Error::Store(raft::StorageError::Compacted),
            WalError::Unavailable => raft::Error::Store(raft::StorageError::Unavailable),
            WalError::SnapshotOutOfDate { .. } => {
                raft::Error::Store(raft::StorageError::SnapshotOutOfDate)
            }
            other => raft::Error::Store(raft::StorageError::Other(Box::new(other))),
        }
    }
}
