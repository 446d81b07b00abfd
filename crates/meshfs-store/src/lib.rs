//! # meshfs Store
//!
//! Storage abstraction for replication metadata. Provides a trait-based
//! interface with SQLite and in-memory implementations.
//!
//! ## Overview
//!
//! The [`MetaStore`] trait keeps the replication engine storage-agnostic.
//! The primary implementation is [`SqliteStore`], with [`MemoryStore`] for
//! testing. One store instance is shared by every connection worker.
//!
//! ## Key Types
//!
//! - [`MetaStore`] - The async trait for all metadata operations
//! - [`SqliteStore`] - SQLite-based persistent storage
//! - [`MemoryStore`] - In-memory storage for tests
//! - [`DownloadOutcome`] - What finishing a download did to the local entry
//!
//! ## Usage
//!
//! ```rust,no_run
//! use meshfs_core::{FileKind, PeerId};
//! use meshfs_store::{MetaStore, SqliteStore};
//!
//! async fn example() {
//!     let store = SqliteStore::open("meta.db").unwrap();
//!
//!     store.mknod("/notes/todo.txt", FileKind::Regular, true).await.unwrap();
//!     let version = store.bump_version("/notes/todo.txt", PeerId(1)).await.unwrap();
//!     assert_eq!(version.get(PeerId(1)), 1);
//! }
//! ```
//!
//! ## Design Notes
//!
//! - **Tombstones**: unlinked entries keep their version history
//! - **Pre-emption**: a new download for the same (path, peer) gets a higher
//!   transaction id, making chunks of the old one stale
//! - **Atomic merges**: directory listings are merged in one transaction

pub mod error;
pub mod memory;
pub mod migration;
pub mod sqlite;
pub mod traits;

pub use error::{Result, StoreError};
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;
pub use traits::{DownloadOutcome, MetaStore};
