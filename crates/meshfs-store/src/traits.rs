//! MetaStore trait: the abstract interface for replication metadata.
//!
//! Every connection worker in the process shares one store, so each method
//! is an atomic unit: a read-modify-write such as "read vector, compare,
//! conditionally write" happens inside a single method, never across two.

use std::path::Path;

use async_trait::async_trait;
use meshfs_core::{
    Conflict, DirEntry, Download, FileEntry, FileKind, KeyFingerprint, PeerId, PeerInfo,
    VersionVector,
};

use crate::error::Result;

/// Result of finishing a download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadOutcome {
    /// The local entry adopted the downloaded version.
    Promoted(FileEntry),
    /// No download with that transaction id is current.
    Stale,
    /// The local entry changed while the download was in flight and is now
    /// concurrent with the downloaded version. A conflict was recorded and
    /// the local version kept.
    Conflicted(Conflict),
    /// The local entry already caught up to (or passed) the downloaded
    /// version; nothing was changed.
    Superseded,
}

/// The MetaStore trait: async interface for replication metadata.
///
/// # Design Notes
///
/// - **Tombstones**: entries are never deleted. `unlink` marks the entry
///   deleted, drops the subscription and bumps the local counter.
/// - **Placeholders**: directory merges insert unsubscribed entries and never
///   touch existing ones.
/// - **One id per key**: `register_peer` is idempotent per fingerprint.
#[async_trait]
pub trait MetaStore: Send + Sync {
    // ─────────────────────────────────────────────────────────────────────────
    // Entry Operations
    // ─────────────────────────────────────────────────────────────────────────

    /// Get the entry at a path, including tombstones.
    async fn get_entry(&self, path: &str) -> Result<Option<FileEntry>>;

    /// Create an entry (and any missing ancestor directories).
    ///
    /// Revives a tombstone, keeping its version history. Returns `false` when
    /// a live entry already existed.
    async fn mknod(&self, path: &str, kind: FileKind, subscribed: bool) -> Result<bool>;

    /// Tombstone a live entry, returning its new version.
    async fn unlink(&self, path: &str, local: PeerId) -> Result<Option<VersionVector>>;

    /// Names of the live children of a directory, sorted.
    async fn readdir(&self, path: &str, subscribed_only: bool) -> Result<Vec<String>>;

    /// Merge a peer's directory listing as unsubscribed placeholders.
    ///
    /// Returns how many entries were inserted. Applied atomically.
    async fn merge_dir_listing(&self, path: &str, entries: &[DirEntry]) -> Result<usize>;

    /// Change the subscription flag. Returns `false` if the entry is absent.
    async fn set_subscribed(&self, path: &str, subscribed: bool) -> Result<bool>;

    /// Every entry, ordered by path.
    async fn list_entries(&self) -> Result<Vec<FileEntry>>;

    // ─────────────────────────────────────────────────────────────────────────
    // Version Operations
    // ─────────────────────────────────────────────────────────────────────────

    /// Version of a path; absent entries read as the empty vector.
    async fn get_version(&self, path: &str) -> Result<VersionVector>;

    /// Replace the version of an existing entry.
    async fn set_version(&self, path: &str, version: &VersionVector) -> Result<()>;

    /// Increment the local counter of an existing live entry.
    async fn bump_version(&self, path: &str, local: PeerId) -> Result<VersionVector>;

    /// Apply a remote deletion if the remote version is strictly newer.
    ///
    /// Returns `true` when the local entry became a tombstone.
    async fn apply_remote_tombstone(&self, path: &str, remote: &VersionVector) -> Result<bool>;

    /// Adopt a remote version for a node with no transferred content
    /// (directories, sockets) if the remote version is strictly newer.
    ///
    /// Creates or revives the entry as subscribed. Returns `true` when the
    /// local entry changed.
    async fn adopt_remote_node(
        &self,
        path: &str,
        kind: FileKind,
        remote: &VersionVector,
    ) -> Result<bool>;

    // ─────────────────────────────────────────────────────────────────────────
    // Download Operations
    // ─────────────────────────────────────────────────────────────────────────

    /// Start (or pre-empt) a download of `path` from `peer`.
    ///
    /// The returned record carries a transaction id strictly greater than any
    /// previously issued for the same key.
    async fn add_download(
        &self,
        peer: PeerId,
        path: &str,
        size: u64,
        version: &VersionVector,
        stage_dir: &Path,
    ) -> Result<Download>;

    /// The current download for a key.
    async fn get_download(&self, path: &str, peer: PeerId) -> Result<Option<Download>>;

    /// Record bytes received. Returns `false` if `txn` is not current.
    async fn record_progress(&self, path: &str, peer: PeerId, txn: u64, received: u64)
        -> Result<bool>;

    /// Complete a download: adopt its version and drop the record.
    async fn finish_download(&self, path: &str, peer: PeerId, txn: u64)
        -> Result<DownloadOutcome>;

    /// Drop a download record.
    async fn remove_download(&self, path: &str, peer: PeerId) -> Result<()>;

    /// All in-flight downloads.
    async fn list_downloads(&self) -> Result<Vec<Download>>;

    // ─────────────────────────────────────────────────────────────────────────
    // Conflict Operations
    // ─────────────────────────────────────────────────────────────────────────

    /// Record a detected conflict.
    async fn record_conflict(&self, conflict: &Conflict) -> Result<()>;

    /// All recorded conflicts, oldest first.
    async fn list_conflicts(&self) -> Result<Vec<Conflict>>;

    // ─────────────────────────────────────────────────────────────────────────
    // Known Peers
    // ─────────────────────────────────────────────────────────────────────────

    /// Register a public key, returning its stable id.
    ///
    /// Refreshes the display name when the key is already known.
    async fn register_peer(&self, fingerprint: &KeyFingerprint, display_name: &str)
        -> Result<PeerId>;

    /// Look up a peer by id.
    async fn get_peer(&self, id: PeerId) -> Result<Option<PeerInfo>>;

    /// Look up a peer by key fingerprint.
    async fn peer_by_fingerprint(&self, fingerprint: &KeyFingerprint) -> Result<Option<PeerInfo>>;

    /// Every known peer, ordered by id.
    async fn list_peers(&self) -> Result<Vec<PeerInfo>>;
}

/// Decide what finishing a download does to the local entry.
///
/// Shared by both store implementations so they agree exactly.
pub(crate) fn resolve_download(
    entry: Option<&FileEntry>,
    download: &Download,
    now: i64,
) -> DownloadOutcome {
    let local = entry.map(|e| e.version.clone()).unwrap_or_default();
    match local.compare(&download.version) {
        meshfs_core::Causality::Less => {
            let mut promoted = entry
                .cloned()
                .unwrap_or_else(|| FileEntry::new(download.path.clone(), FileKind::Regular, true));
            promoted.version = download.version.clone();
            promoted.subscribed = true;
            promoted.deleted = false;
            DownloadOutcome::Promoted(promoted)
        }
        meshfs_core::Causality::Concurrent => DownloadOutcome::Conflicted(Conflict {
            path: download.path.clone(),
            peer: download.peer,
            local,
            remote: download.version.clone(),
            detected_at: now,
        }),
        _ => DownloadOutcome::Superseded,
    }
}

/// Current time in milliseconds.
pub(crate) fn now_millis() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
