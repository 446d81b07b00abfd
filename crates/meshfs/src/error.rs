//! Error types for the node.

use meshfs_core::CoreError;
use meshfs_crypto::CryptoError;
use meshfs_net::NetError;
use meshfs_store::StoreError;
use meshfs_sync::SyncError;
use thiserror::Error;

/// Errors that can occur while running a node.
#[derive(Debug, Error)]
pub enum NodeError {
    /// The configuration is unusable.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// The configuration file could not be parsed.
    #[error("config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    /// The configuration could not be written back.
    #[error("config write error: {0}")]
    ConfigWrite(#[from] toml::ser::Error),

    /// Filesystem or socket error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Storage error.
    #[error("storage error: {0}")]
    Store(#[from] StoreError),

    /// Identity or session crypto error.
    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// Connection error.
    #[error("network error: {0}")]
    Net(#[from] NetError),

    /// Replication error.
    #[error("sync error: {0}")]
    Sync(#[from] SyncError),

    /// Invalid path or record.
    #[error("invalid record: {0}")]
    Core(#[from] CoreError),

    /// Every connection slot is busy.
    #[error("no free connection slot")]
    PoolExhausted,

    /// No entry at the given path.
    #[error("not found: {0}")]
    NotFound(String),

    /// A blocking task panicked or was cancelled.
    #[error("background task failed: {0}")]
    Task(String),

    /// The node is shutting down.
    #[error("node is shutting down")]
    ShuttingDown,
}

/// Result type for node operations.
pub type Result<T> = std::result::Result<T, NodeError>;
