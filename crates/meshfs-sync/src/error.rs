//! Error types for the replication module.

use thiserror::Error;

use meshfs_core::PeerId;
use meshfs_net::{MessageKind, NetError};

/// Errors that can occur while replicating.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Sending or receiving failed.
    #[error("network error: {0}")]
    Net(#[from] NetError),

    /// Store operation failed.
    #[error("store error: {0}")]
    Store(#[from] meshfs_store::StoreError),

    /// A path or vector in a message was malformed.
    #[error("invalid record: {0}")]
    Core(#[from] meshfs_core::CoreError),

    /// Local content could not be read or written.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A vector named a peer the sender never mapped.
    #[error("peer id {0} missing from the id map")]
    UnmappedPeer(PeerId),

    /// The peer sent a message that has no place on a replication connection.
    #[error("unexpected {0:?} on a peer connection")]
    UnexpectedMessage(MessageKind),

    /// The peer broke the transfer protocol.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// The job worker has stopped.
    #[error("job worker stopped")]
    WorkerStopped,
}

impl SyncError {
    /// Whether this error must tear the connection down.
    ///
    /// Store and local I/O hiccups are logged and skipped so the sync loop
    /// stays alive. So is a vector naming a peer whose mapping has not
    /// arrived yet: the announcement is dropped and the next tree sync
    /// repeats it.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            SyncError::Store(_) | SyncError::Io(_) | SyncError::UnmappedPeer(_)
        )
    }
}

impl From<SyncError> for NetError {
    fn from(e: SyncError) -> Self {
        match e {
            SyncError::Net(e) => e,
            SyncError::Store(e) => NetError::Store(e),
            SyncError::Core(e) => NetError::Core(e),
            SyncError::Io(e) => NetError::Io(e),
            other => NetError::Protocol(other.to_string()),
        }
    }
}

/// Result type for replication operations.
pub type Result<T> = std::result::Result<T, SyncError>;
