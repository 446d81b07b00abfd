//! In-memory implementation of the MetaStore trait.
//!
//! This is primarily for testing. It has the same semantics as SQLite
//! but keeps everything in memory with no persistence.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;

use meshfs_core::{
    file_name, join, normalize, parent_of, Causality, Conflict, DirEntry, Download, FileEntry,
    FileKind, KeyFingerprint, PeerId, PeerInfo, VersionVector, ROOT,
};

use crate::error::{Result, StoreError};
use crate::traits::{now_millis, resolve_download, DownloadOutcome, MetaStore};

/// In-memory store implementation.
///
/// All data is lost when the store is dropped. Thread-safe via RwLock.
pub struct MemoryStore {
    inner: RwLock<MemoryStoreInner>,
}

struct MemoryStoreInner {
    /// Entries by normalized path, tombstones included.
    entries: BTreeMap<String, FileEntry>,

    /// In-flight downloads by (path, peer).
    downloads: BTreeMap<(String, PeerId), Download>,

    /// Last transaction id issued per (path, peer).
    last_txn: HashMap<(String, PeerId), u64>,

    /// Conflicts in detection order.
    conflicts: Vec<Conflict>,

    /// Known peers in registration order; id = index + 1.
    peers: Vec<PeerInfo>,
}

impl MemoryStoreInner {
    fn ensure_ancestors(&mut self, path: &str, subscribed: bool) {
        let mut current = parent_of(path).map(str::to_string);
        while let Some(dir) = current {
            match self.entries.get_mut(&dir) {
                Some(entry) if entry.is_live() => break,
                Some(entry) => entry.deleted = false,
                None => {
                    self.entries.insert(
                        dir.clone(),
                        FileEntry::new(dir.clone(), FileKind::Directory, subscribed),
                    );
                }
            }
            current = parent_of(&dir).map(str::to_string);
        }
    }
}

impl MemoryStore {
    /// Create a new store holding only the root directory.
    pub fn new() -> Self {
        let mut entries = BTreeMap::new();
        entries.insert(
            ROOT.to_string(),
            FileEntry::new(ROOT, FileKind::Directory, true),
        );
        Self {
            inner: RwLock::new(MemoryStoreInner {
                entries,
                downloads: BTreeMap::new(),
                last_txn: HashMap::new(),
                conflicts: Vec::new(),
                peers: Vec::new(),
            }),
        }
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, MemoryStoreInner>> {
        self.inner.read().map_err(|_| StoreError::Poisoned)
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, MemoryStoreInner>> {
        self.inner.write().map_err(|_| StoreError::Poisoned)
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MetaStore for MemoryStore {
    async fn get_entry(&self, path: &str) -> Result<Option<FileEntry>> {
        let path = normalize(path)?;
        Ok(self.read()?.entries.get(&path).cloned())
    }

    async fn mknod(&self, path: &str, kind: FileKind, subscribed: bool) -> Result<bool> {
        let path = normalize(path)?;
        let mut inner = self.write()?;

        if let Some(entry) = inner.entries.get(&path) {
            if entry.is_live() {
                return Ok(false);
            }
        }
        inner.ensure_ancestors(&path, subscribed);

        match inner.entries.get_mut(&path) {
            Some(entry) => {
                entry.deleted = false;
                entry.kind = kind;
                entry.subscribed = subscribed;
            }
            None => {
                inner
                    .entries
                    .insert(path.clone(), FileEntry::new(path, kind, subscribed));
            }
        }
        Ok(true)
    }

    async fn unlink(&self, path: &str, local: PeerId) -> Result<Option<VersionVector>> {
        let path = normalize(path)?;
        if path == ROOT {
            return Ok(None);
        }
        let mut inner = self.write()?;
        match inner.entries.get_mut(&path) {
            Some(entry) if entry.is_live() => {
                entry.deleted = true;
                entry.subscribed = false;
                entry.version.increment(local);
                Ok(Some(entry.version.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn readdir(&self, path: &str, subscribed_only: bool) -> Result<Vec<String>> {
        let path = normalize(path)?;
        let inner = self.read()?;
        Ok(inner
            .entries
            .values()
            .filter(|e| e.parent.as_deref() == Some(path.as_str()))
            .filter(|e| e.is_live() && (e.subscribed || !subscribed_only))
            .map(|e| file_name(&e.path).to_string())
            .collect())
    }

    async fn merge_dir_listing(&self, path: &str, entries: &[DirEntry]) -> Result<usize> {
        let path = normalize(path)?;
        let mut inner = self.write()?;

        if !inner.entries.contains_key(&path) {
            inner.ensure_ancestors(&path, false);
            inner.entries.insert(
                path.clone(),
                FileEntry::new(path.clone(), FileKind::Directory, false),
            );
        }

        let mut inserted = 0;
        for entry in entries {
            let child = match join(&path, &entry.name) {
                Ok(child) => child,
                Err(e) => {
                    tracing::warn!(dir = %path, name = %entry.name, "skipping listing entry: {}", e);
                    continue;
                }
            };
            if !inner.entries.contains_key(&child) {
                inner
                    .entries
                    .insert(child.clone(), FileEntry::new(child, entry.kind, false));
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    async fn set_subscribed(&self, path: &str, subscribed: bool) -> Result<bool> {
        let path = normalize(path)?;
        let mut inner = self.write()?;
        match inner.entries.get_mut(&path) {
            Some(entry) => {
                entry.subscribed = subscribed;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn list_entries(&self) -> Result<Vec<FileEntry>> {
        Ok(self.read()?.entries.values().cloned().collect())
    }

    async fn get_version(&self, path: &str) -> Result<VersionVector> {
        let path = normalize(path)?;
        Ok(self
            .read()?
            .entries
            .get(&path)
            .map(|e| e.version.clone())
            .unwrap_or_default())
    }

    async fn set_version(&self, path: &str, version: &VersionVector) -> Result<()> {
        let path = normalize(path)?;
        let mut inner = self.write()?;
        match inner.entries.get_mut(&path) {
            Some(entry) => {
                entry.version = version.clone();
                Ok(())
            }
            None => Err(StoreError::NotFound(path)),
        }
    }

    async fn bump_version(&self, path: &str, local: PeerId) -> Result<VersionVector> {
        let path = normalize(path)?;
        let mut inner = self.write()?;
        match inner.entries.get_mut(&path) {
            Some(entry) if entry.is_live() => {
                entry.version.increment(local);
                Ok(entry.version.clone())
            }
            _ => Err(StoreError::NotFound(path)),
        }
    }

    async fn apply_remote_tombstone(&self, path: &str, remote: &VersionVector) -> Result<bool> {
        let path = normalize(path)?;
        let mut inner = self.write()?;

        let local = inner
            .entries
            .get(&path)
            .map(|e| e.version.clone())
            .unwrap_or_default();
        if local.compare(remote) != Causality::Less {
            return Ok(false);
        }

        if !inner.entries.contains_key(&path) {
            inner.ensure_ancestors(&path, false);
        }
        let entry = inner
            .entries
            .entry(path.clone())
            .or_insert_with(|| FileEntry::new(path, FileKind::Regular, false));
        entry.deleted = true;
        entry.subscribed = false;
        entry.version = remote.clone();
        Ok(true)
    }

    async fn adopt_remote_node(
        &self,
        path: &str,
        kind: FileKind,
        remote: &VersionVector,
    ) -> Result<bool> {
        let path = normalize(path)?;
        let mut inner = self.write()?;

        let local = inner
            .entries
            .get(&path)
            .map(|e| e.version.clone())
            .unwrap_or_default();
        if local.compare(remote) != Causality::Less {
            return Ok(false);
        }

        inner.ensure_ancestors(&path, true);
        let entry = inner
            .entries
            .entry(path.clone())
            .or_insert_with(|| FileEntry::new(path, kind, true));
        entry.kind = kind;
        entry.deleted = false;
        entry.subscribed = true;
        entry.version = remote.clone();
        Ok(true)
    }

    async fn add_download(
        &self,
        peer: PeerId,
        path: &str,
        size: u64,
        version: &VersionVector,
        stage_dir: &Path,
    ) -> Result<Download> {
        let path = normalize(path)?;
        let mut inner = self.write()?;

        let key = (path.clone(), peer);
        let txn = inner.last_txn.get(&key).copied().unwrap_or(0) + 1;
        inner.last_txn.insert(key.clone(), txn);

        let download = Download {
            stage_path: stage_dir.join(Download::stage_name(&path, peer, txn)),
            path,
            peer,
            txn,
            received: 0,
            total_size: size,
            version: version.clone(),
        };
        inner.downloads.insert(key, download.clone());
        Ok(download)
    }

    async fn get_download(&self, path: &str, peer: PeerId) -> Result<Option<Download>> {
        let path = normalize(path)?;
        Ok(self.read()?.downloads.get(&(path, peer)).cloned())
    }

    async fn record_progress(
        &self,
        path: &str,
        peer: PeerId,
        txn: u64,
        received: u64,
    ) -> Result<bool> {
        let path = normalize(path)?;
        let mut inner = self.write()?;
        match inner.downloads.get_mut(&(path, peer)) {
            Some(d) if d.txn == txn => {
                d.received = received;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn finish_download(
        &self,
        path: &str,
        peer: PeerId,
        txn: u64,
    ) -> Result<DownloadOutcome> {
        let path = normalize(path)?;
        let mut inner = self.write()?;

        let key = (path.clone(), peer);
        let download = match inner.downloads.get(&key) {
            Some(d) if d.txn == txn => d.clone(),
            _ => return Ok(DownloadOutcome::Stale),
        };

        let outcome = resolve_download(inner.entries.get(&path), &download, now_millis());
        match &outcome {
            DownloadOutcome::Promoted(entry) => {
                inner.ensure_ancestors(&path, true);
                inner.entries.insert(path, entry.clone());
            }
            DownloadOutcome::Conflicted(conflict) => inner.conflicts.push(conflict.clone()),
            DownloadOutcome::Superseded | DownloadOutcome::Stale => {}
        }
        inner.downloads.remove(&key);
        Ok(outcome)
    }

    async fn remove_download(&self, path: &str, peer: PeerId) -> Result<()> {
        let path = normalize(path)?;
        self.write()?.downloads.remove(&(path, peer));
        Ok(())
    }

    async fn list_downloads(&self) -> Result<Vec<Download>> {
        Ok(self.read()?.downloads.values().cloned().collect())
    }

    async fn record_conflict(&self, conflict: &Conflict) -> Result<()> {
        self.write()?.conflicts.push(conflict.clone());
        Ok(())
    }

    async fn list_conflicts(&self) -> Result<Vec<Conflict>> {
        Ok(self.read()?.conflicts.clone())
    }

    async fn register_peer(
        &self,
        fingerprint: &KeyFingerprint,
        display_name: &str,
    ) -> Result<PeerId> {
        let mut inner = self.write()?;
        if let Some(peer) = inner.peers.iter_mut().find(|p| p.fingerprint == *fingerprint) {
            peer.display_name = display_name.to_string();
            return Ok(peer.id);
        }
        let id = PeerId(inner.peers.len() as u32 + 1);
        inner.peers.push(PeerInfo {
            id,
            fingerprint: *fingerprint,
            display_name: display_name.to_string(),
        });
        Ok(id)
    }

    async fn get_peer(&self, id: PeerId) -> Result<Option<PeerInfo>> {
        Ok(self.read()?.peers.iter().find(|p| p.id == id).cloned())
    }

    async fn peer_by_fingerprint(&self, fingerprint: &KeyFingerprint) -> Result<Option<PeerInfo>> {
        Ok(self
            .read()?
            .peers
            .iter()
            .find(|p| p.fingerprint == *fingerprint)
            .cloned())
    }

    async fn list_peers(&self) -> Result<Vec<PeerInfo>> {
        Ok(self.read()?.peers.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vv(entries: &[(u32, u64)]) -> VersionVector {
        VersionVector::from_entries(entries.iter().map(|&(p, c)| (PeerId(p), c)))
    }

    #[tokio::test]
    async fn test_mknod_and_readdir() {
        let store = MemoryStore::new();
        assert!(store.mknod("/a/b.txt", FileKind::Regular, true).await.unwrap());
        assert!(store.mknod("/a/c.txt", FileKind::Regular, false).await.unwrap());

        assert_eq!(store.readdir("/", false).await.unwrap(), vec!["a"]);
        assert_eq!(store.readdir("/a", true).await.unwrap(), vec!["b.txt"]);
        assert_eq!(store.readdir("/a", false).await.unwrap(), vec!["b.txt", "c.txt"]);
    }

    #[tokio::test]
    async fn test_unlink_then_revive() {
        let store = MemoryStore::new();
        store.mknod("/f", FileKind::Regular, true).await.unwrap();
        let v = store.unlink("/f", PeerId(1)).await.unwrap().unwrap();
        assert_eq!(v, vv(&[(1, 1)]));
        assert!(store.readdir("/", false).await.unwrap().is_empty());
        assert!(store.bump_version("/f", PeerId(1)).await.is_err());

        assert!(store.mknod("/f", FileKind::Regular, true).await.unwrap());
        assert_eq!(store.bump_version("/f", PeerId(1)).await.unwrap(), vv(&[(1, 2)]));
    }

    #[tokio::test]
    async fn test_download_lifecycle() {
        let store = MemoryStore::new();
        let stage = Path::new("/stage");
        let d1 = store
            .add_download(PeerId(3), "/f", 4, &vv(&[(3, 1)]), stage)
            .await
            .unwrap();
        let d2 = store
            .add_download(PeerId(3), "/f", 4, &vv(&[(3, 1)]), stage)
            .await
            .unwrap();
        assert!(d2.txn > d1.txn);

        assert!(!store.record_progress("/f", PeerId(3), d1.txn, 4).await.unwrap());
        assert_eq!(
            store.finish_download("/f", PeerId(3), d1.txn).await.unwrap(),
            DownloadOutcome::Stale
        );
        assert!(matches!(
            store.finish_download("/f", PeerId(3), d2.txn).await.unwrap(),
            DownloadOutcome::Promoted(_)
        ));
        assert_eq!(store.get_version("/f").await.unwrap(), vv(&[(3, 1)]));
        assert!(store.list_downloads().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_finish_superseded_when_local_caught_up() {
        let store = MemoryStore::new();
        store.mknod("/f", FileKind::Regular, true).await.unwrap();
        store.set_version("/f", &vv(&[(2, 5)])).await.unwrap();
        let d = store
            .add_download(PeerId(2), "/f", 1, &vv(&[(2, 4)]), Path::new("/s"))
            .await
            .unwrap();
        assert_eq!(
            store.finish_download("/f", PeerId(2), d.txn).await.unwrap(),
            DownloadOutcome::Superseded
        );
        assert_eq!(store.get_version("/f").await.unwrap(), vv(&[(2, 5)]));
    }

    #[tokio::test]
    async fn test_unknown_remote_tombstone_is_recorded() {
        let store = MemoryStore::new();
        assert!(store
            .apply_remote_tombstone("/gone/x", &vv(&[(2, 1)]))
            .await
            .unwrap());
        let entry = store.get_entry("/gone/x").await.unwrap().unwrap();
        assert!(entry.deleted);
        assert!(store.get_entry("/gone").await.unwrap().is_some());
        assert!(!store
            .apply_remote_tombstone("/gone/x", &vv(&[(2, 1)]))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_adopt_remote_node_revives_tombstone() {
        let store = MemoryStore::new();
        store.mknod("/d", FileKind::Directory, true).await.unwrap();
        store.unlink("/d", PeerId(1)).await.unwrap();

        assert!(!store
            .adopt_remote_node("/d", FileKind::Directory, &vv(&[(1, 1)]))
            .await
            .unwrap());
        assert!(store
            .adopt_remote_node("/d", FileKind::Directory, &vv(&[(1, 1), (2, 1)]))
            .await
            .unwrap());
        let entry = store.get_entry("/d").await.unwrap().unwrap();
        assert!(entry.is_live() && entry.subscribed);
    }

    #[tokio::test]
    async fn test_register_peer_ids_are_dense() {
        let store = MemoryStore::new();
        let a = store.register_peer(&KeyFingerprint::of(b"a"), "a").await.unwrap();
        let b = store.register_peer(&KeyFingerprint::of(b"b"), "b").await.unwrap();
        assert_eq!(a, PeerId(1));
        assert_eq!(b, PeerId(2));
        assert_eq!(
            store.register_peer(&KeyFingerprint::of(b"a"), "a2").await.unwrap(),
            a
        );
    }
}
