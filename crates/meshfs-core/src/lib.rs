//! # meshfs Core
//!
//! Pure primitives shared by every meshfs layer: peer identities, version
//! vectors and the file/download records the replication engine stores.
//!
//! This crate contains no I/O, no storage, no networking.
//!
//! ## Key Types
//!
//! - [`PeerId`] - Locally assigned identifier for a known peer
//! - [`KeyFingerprint`] - Blake3 hash of a peer's public key
//! - [`VersionVector`] - Per-file causal history, compared with [`Causality`]
//! - [`FileEntry`] - Metadata record for one path in the replicated tree
//! - [`Download`] - Bookkeeping for an in-flight pull from a peer

pub mod entry;
pub mod error;
pub mod path;
pub mod types;
pub mod version;

pub use entry::{Conflict, DirEntry, Download, FileEntry, FileKind};
pub use error::{CoreError, Result};
pub use path::{file_name, join, normalize, parent_of, ROOT};
pub use types::{KeyFingerprint, PeerId, PeerInfo};
pub use version::{Causality, VersionVector};
