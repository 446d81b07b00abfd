//! # meshfs
//!
//! The meshfs backend: a peer-to-peer file synchronization node.
//!
//! ## Overview
//!
//! A [`Node`] keeps a directory tree replicated across a mesh of peers.
//! Peers authenticate each other with RSA keys, encrypt every frame after the
//! handshake, and exchange per-file version vectors; a peer whose copy is
//! strictly older pulls the newer content in chunks, while concurrent edits
//! are recorded as conflicts rather than silently merged.
//!
//! - **Peer listener**: accepts authenticated peers up to `max_peers`
//! - **Control listener**: a loopback-only command channel for a UI or CLI
//! - **Job worker**: tree walks and keepalive pings off the connection tasks
//! - **Local mutations**: the API a filesystem adapter calls after a write
//!
//! ## Usage
//!
//! ```rust,no_run
//! use meshfs::{Node, NodeConfig};
//!
//! async fn example() -> meshfs::Result<()> {
//!     let config = NodeConfig::load("meshfs.toml".as_ref())?;
//!     let node = Node::spawn(config).await?;
//!
//!     node.connect_to("peer.example:7420").await?;
//!     node.write_file("/notes/todo.txt", b"buy milk").await?;
//!
//!     node.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Re-exports
//!
//! This crate re-exports the component crates for convenience:
//!
//! - `meshfs::core` - Paths, file records, version vectors
//! - `meshfs::store` - Metadata store trait and SQLite backend
//! - `meshfs::crypto` - Identity, key exchange, frame ciphers
//! - `meshfs::net` - Wire messages, framing, handshake, connections
//! - `meshfs::sync` - Replication and background jobs

pub mod config;
pub mod control;
pub mod error;
mod listener;
pub mod node;

// Re-export component crates
pub use meshfs_core as core;
pub use meshfs_crypto as crypto;
pub use meshfs_net as net;
pub use meshfs_store as store;
pub use meshfs_sync as sync;

// Re-export main types for convenience
pub use config::NodeConfig;
pub use control::{ControlClient, ControlFactory, ControlSession};
pub use error::{NodeError, Result};
pub use node::Node;

// Re-export commonly used core types
pub use meshfs_core::{
    Causality, Conflict, DirEntry, FileEntry, FileKind, KeyFingerprint, PeerId, VersionVector,
};
