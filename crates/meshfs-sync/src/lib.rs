//! # meshfs Sync
//!
//! Replication logic run on each peer connection's worker task.
//!
//! ## Overview
//!
//! Peers exchange [`NodeInfo`](meshfs_net::messages::NodeInfo) announcements
//! carrying version vectors. A receiver whose local vector is strictly older
//! pulls the content in offset-addressed chunks; concurrent vectors become
//! conflict records and are never merged automatically. Every vector is
//! expressed in the sender's peer numbering and translated through the
//! [`IdMap`](meshfs_net::messages::IdMap) the sender sent first.
//!
//! ## Key Types
//!
//! - [`Replicator`] - Shared state; a [`HandlerFactory`](meshfs_net::HandlerFactory)
//! - [`ReplicationSession`] - Per-connection dispatcher
//! - [`JobWorker`] / [`JobQueue`] - Background tree sync and pings
//!
//! ## Message Flow
//!
//! ```text
//! Node A                              Node B
//!   |-------- IdMap ------------------>|
//!   |<------- IdMap -------------------|
//!   |-------- NodeInfo {A:1} --------->|   B holds {} < {A:1}
//!   |<------- RequestChunk (txn 1, 0) -|
//!   |-------- FileChunk (0..n) ------->|
//!   |<------- RequestChunk (txn 1, n) -|   until total_size
//!   |-------- FileChunk (n..) -------->|   B promotes, adopts {A:1}
//! ```
//!
//! ## Design Notes
//!
//! - **Pre-emption**: a newer announcement restarts the pull with a higher
//!   transaction id; chunks carrying an older id are dropped
//! - **Availability first**: store and local I/O failures are logged and the
//!   message skipped; protocol violations drop the connection

pub mod error;
pub mod files;
pub mod jobs;
pub mod replicator;

pub use error::{Result, SyncError};
pub use jobs::{Job, JobQueue, JobWorker};
pub use replicator::{ReplicationConfig, ReplicationSession, Replicator};
