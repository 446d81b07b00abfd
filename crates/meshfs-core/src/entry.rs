//! Metadata records for the replicated tree.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::CoreError;
use crate::path::parent_of;
use crate::types::PeerId;
use crate::version::VersionVector;

/// Type of a tree node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum FileKind {
    Regular = 0,
    Directory = 1,
    Symlink = 2,
    Socket = 3,
}

impl FileKind {
    /// Convert to the stored tag.
    pub const fn to_u8(self) -> u8 {
        self as u8
    }

    /// Parse a stored tag.
    pub const fn from_u8(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(FileKind::Regular),
            1 => Some(FileKind::Directory),
            2 => Some(FileKind::Symlink),
            3 => Some(FileKind::Socket),
            _ => None,
        }
    }

    /// Whether content for this kind is transferred in chunks.
    pub const fn has_content(self) -> bool {
        matches!(self, FileKind::Regular | FileKind::Symlink)
    }
}

impl TryFrom<u8> for FileKind {
    type Error = CoreError;

    fn try_from(tag: u8) -> Result<Self, Self::Error> {
        FileKind::from_u8(tag).ok_or(CoreError::UnknownFileKind(tag))
    }
}

/// Metadata for one path in the replicated tree.
///
/// Entries are never physically removed. Unlinking turns the entry into a
/// tombstone (`deleted`) whose version vector records the deletion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    /// Normalized absolute path.
    pub path: String,
    /// Parent directory (`None` only for the root).
    pub parent: Option<String>,
    /// Node type.
    pub kind: FileKind,
    /// Whether this peer replicates the content, not just the name.
    pub subscribed: bool,
    /// Tombstone flag.
    pub deleted: bool,
    /// Causal history of the content this peer holds.
    pub version: VersionVector,
}

impl FileEntry {
    /// A new, empty-history entry.
    pub fn new(path: impl Into<String>, kind: FileKind, subscribed: bool) -> Self {
        let path = path.into();
        let parent = parent_of(&path).map(str::to_string);
        Self {
            path,
            parent,
            kind,
            subscribed,
            deleted: false,
            version: VersionVector::new(),
        }
    }

    /// Whether this entry is live (not a tombstone).
    pub fn is_live(&self) -> bool {
        !self.deleted
    }
}

/// One child in a directory listing exchanged between peers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirEntry {
    /// Child name (single component).
    pub name: String,
    /// Child type.
    pub kind: FileKind,
}

/// An in-flight pull of a file from a peer.
///
/// Keyed by `(path, peer)`. A newer request for the same key bumps `txn`,
/// which makes chunks belonging to the older transfer stale.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Download {
    /// File being pulled.
    pub path: String,
    /// Peer serving the content.
    pub peer: PeerId,
    /// Transaction id; chunks carrying a lower id are dropped.
    pub txn: u64,
    /// Staging file accumulating the content.
    pub stage_path: PathBuf,
    /// Bytes written to the staging file so far.
    pub received: u64,
    /// Total size announced by the peer.
    pub total_size: u64,
    /// Version the local entry adopts once the download completes.
    pub version: VersionVector,
}

impl Download {
    /// File name used for the staging file of a transfer.
    pub fn stage_name(path: &str, peer: PeerId, txn: u64) -> String {
        let digest = blake3::hash(path.as_bytes());
        format!("{}-{}-{}.part", &digest.to_hex()[..16], peer.get(), txn)
    }

    /// Whether every byte has arrived.
    pub fn is_complete(&self) -> bool {
        self.received >= self.total_size
    }
}

/// A detected concurrent edit between the local replica and a peer's.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conflict {
    /// Conflicting path.
    pub path: String,
    /// Peer whose version conflicts with ours.
    pub peer: PeerId,
    /// Local version when detected.
    pub local: VersionVector,
    /// Remote version (translated into local numbering).
    pub remote: VersionVector,
    /// When the conflict was detected (Unix ms).
    pub detected_at: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_tags() {
        for kind in [
            FileKind::Regular,
            FileKind::Directory,
            FileKind::Symlink,
            FileKind::Socket,
        ] {
            assert_eq!(FileKind::from_u8(kind.to_u8()), Some(kind));
        }
        assert!(FileKind::try_from(9).is_err());
    }

    #[test]
    fn test_entry_parent_link() {
        let entry = FileEntry::new("/docs/a.txt", FileKind::Regular, true);
        assert_eq!(entry.parent.as_deref(), Some("/docs"));
        assert!(entry.is_live());

        let root = FileEntry::new("/", FileKind::Directory, true);
        assert_eq!(root.parent, None);
    }

    #[test]
    fn test_stage_name_is_per_transaction() {
        let a = Download::stage_name("/a", PeerId(2), 1);
        let b = Download::stage_name("/a", PeerId(2), 2);
        assert_ne!(a, b);
        assert!(a.ends_with("-2-1.part"));
    }
}
