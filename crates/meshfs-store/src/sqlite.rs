//! SQLite implementation of the MetaStore trait.
//!
//! This is the primary storage backend. It uses rusqlite with bundled
//! SQLite, wrapped in async via `tokio::task::spawn_blocking`. Every trait
//! method runs under the single connection mutex, and multi-row changes run
//! inside one SQL transaction, so no other worker ever sees a partial merge.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};

use meshfs_core::{
    join, normalize, parent_of, Conflict, DirEntry, Download, FileEntry, FileKind, KeyFingerprint,
    PeerId, PeerInfo, VersionVector, ROOT,
};

use crate::error::{Result, StoreError};
use crate::migration;
use crate::traits::{now_millis, resolve_download, DownloadOutcome, MetaStore};

/// SQLite-based store implementation.
///
/// Thread-safe via internal Mutex. All operations use spawn_blocking
/// to avoid blocking the async runtime.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open a SQLite database at the given path.
    ///
    /// Creates the file and runs migrations if it doesn't exist.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::init(conn)
    }

    /// Open an in-memory SQLite database.
    ///
    /// Useful for testing.
    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init(conn)
    }

    fn init(mut conn: Connection) -> Result<Self> {
        migration::migrate(&mut conn)?;
        if fetch_entry(&conn, ROOT)?.is_none() {
            write_entry(&conn, &FileEntry::new(ROOT, FileKind::Directory, true))?;
        }
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run a closure against the connection on the blocking pool.
    async fn run<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = lock(&conn);
            f(&mut conn)
        })
        .await
        .map_err(|e| StoreError::Task(e.to_string()))?
    }
}

/// A panic under the lock leaves no half-applied change behind: multi-row
/// writes run in a transaction that rolls back when dropped.
fn lock(conn: &Mutex<Connection>) -> MutexGuard<'_, Connection> {
    conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

const ENTRY_COLUMNS: &str = "path, parent, kind, subscribed, deleted, version";

fn row_to_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<Result<FileEntry>> {
    let path: String = row.get(0)?;
    let parent: Option<String> = row.get(1)?;
    let kind: u8 = row.get(2)?;
    let subscribed: bool = row.get(3)?;
    let deleted: bool = row.get(4)?;
    let version: Vec<u8> = row.get(5)?;

    Ok((|| -> Result<FileEntry> {
        Ok(FileEntry {
            path,
            parent,
            kind: FileKind::try_from(kind)?,
            subscribed,
            deleted,
            version: VersionVector::from_cbor(&version)?,
        })
    })())
}

fn fetch_entry(conn: &Connection, path: &str) -> Result<Option<FileEntry>> {
    let sql = format!("SELECT {} FROM entries WHERE path = ?1", ENTRY_COLUMNS);
    conn.query_row(&sql, params![path], row_to_entry)
        .optional()?
        .transpose()
}

fn write_entry(conn: &Connection, entry: &FileEntry) -> Result<()> {
    conn.execute(
        "INSERT INTO entries (path, parent, kind, subscribed, deleted, version, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
         ON CONFLICT(path) DO UPDATE SET
            kind = excluded.kind,
            subscribed = excluded.subscribed,
            deleted = excluded.deleted,
            version = excluded.version,
            updated_at = excluded.updated_at",
        params![
            entry.path,
            entry.parent,
            entry.kind.to_u8(),
            entry.subscribed,
            entry.deleted,
            entry.version.to_cbor()?,
            now_millis(),
        ],
    )?;
    Ok(())
}

/// Create missing ancestor directories (reviving tombstoned ones).
fn ensure_ancestors(conn: &Connection, path: &str, subscribed: bool) -> Result<()> {
    let mut current = parent_of(path);
    while let Some(dir) = current {
        match fetch_entry(conn, dir)? {
            Some(entry) if entry.is_live() => break,
            Some(mut entry) => {
                entry.deleted = false;
                write_entry(conn, &entry)?;
            }
            None => write_entry(conn, &FileEntry::new(dir, FileKind::Directory, subscribed))?,
        }
        current = parent_of(dir);
    }
    Ok(())
}

fn row_to_download(row: &rusqlite::Row<'_>) -> rusqlite::Result<Result<Download>> {
    let path: String = row.get(0)?;
    let peer: u32 = row.get(1)?;
    let txn: i64 = row.get(2)?;
    let stage_path: String = row.get(3)?;
    let received: i64 = row.get(4)?;
    let total_size: i64 = row.get(5)?;
    let version: Vec<u8> = row.get(6)?;

    Ok(VersionVector::from_cbor(&version)
        .map_err(StoreError::from)
        .map(|version| Download {
            path,
            peer: PeerId(peer),
            txn: txn as u64,
            stage_path: PathBuf::from(stage_path),
            received: received as u64,
            total_size: total_size as u64,
            version,
        }))
}

const DOWNLOAD_COLUMNS: &str = "path, peer, txn, stage_path, received, total_size, version";

fn fetch_download(conn: &Connection, path: &str, peer: PeerId) -> Result<Option<Download>> {
    let sql = format!(
        "SELECT {} FROM downloads WHERE path = ?1 AND peer = ?2",
        DOWNLOAD_COLUMNS
    );
    conn.query_row(&sql, params![path, peer.get()], row_to_download)
        .optional()?
        .transpose()
}

fn insert_conflict(conn: &Connection, conflict: &Conflict) -> Result<()> {
    conn.execute(
        "INSERT INTO conflicts (path, peer, local_version, remote_version, detected_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            conflict.path,
            conflict.peer.get(),
            conflict.local.to_cbor()?,
            conflict.remote.to_cbor()?,
            conflict.detected_at,
        ],
    )?;
    Ok(())
}

fn row_to_peer(row: &rusqlite::Row<'_>) -> rusqlite::Result<Result<PeerInfo>> {
    let id: u32 = row.get(0)?;
    let fingerprint: Vec<u8> = row.get(1)?;
    let display_name: String = row.get(2)?;

    Ok(KeyFingerprint::try_from(fingerprint.as_slice())
        .map_err(|_| StoreError::InvalidData("fingerprint is not 32 bytes".into()))
        .map(|fingerprint| PeerInfo {
            id: PeerId(id),
            fingerprint,
            display_name,
        }))
}

fn collect<T>(rows: impl Iterator<Item = rusqlite::Result<Result<T>>>) -> Result<Vec<T>> {
    rows.map(|row| row.map_err(StoreError::from).and_then(|r| r))
        .collect()
}

#[async_trait]
impl MetaStore for SqliteStore {
    async fn get_entry(&self, path: &str) -> Result<Option<FileEntry>> {
        let path = normalize(path)?;
        self.run(move |conn| fetch_entry(conn, &path)).await
    }

    async fn mknod(&self, path: &str, kind: FileKind, subscribed: bool) -> Result<bool> {
        let path = normalize(path)?;
        self.run(move |conn| {
            let tx = conn.transaction()?;
            let created = match fetch_entry(&tx, &path)? {
                Some(entry) if entry.is_live() => false,
                Some(mut entry) => {
                    ensure_ancestors(&tx, &path, subscribed)?;
                    entry.deleted = false;
                    entry.kind = kind;
                    entry.subscribed = subscribed;
                    write_entry(&tx, &entry)?;
                    true
                }
                None => {
                    ensure_ancestors(&tx, &path, subscribed)?;
                    write_entry(&tx, &FileEntry::new(path.clone(), kind, subscribed))?;
                    true
                }
            };
            tx.commit()?;
            Ok(created)
        })
        .await
    }

    async fn unlink(&self, path: &str, local: PeerId) -> Result<Option<VersionVector>> {
        let path = normalize(path)?;
        self.run(move |conn| {
            let tx = conn.transaction()?;
            let version = match fetch_entry(&tx, &path)? {
                Some(mut entry) if entry.is_live() && path != ROOT => {
                    entry.deleted = true;
                    entry.subscribed = false;
                    entry.version.increment(local);
                    write_entry(&tx, &entry)?;
                    Some(entry.version)
                }
                _ => None,
            };
            tx.commit()?;
            Ok(version)
        })
        .await
    }

    async fn readdir(&self, path: &str, subscribed_only: bool) -> Result<Vec<String>> {
        let path = normalize(path)?;
        self.run(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT path FROM entries
                 WHERE parent = ?1 AND deleted = 0 AND (subscribed = 1 OR ?2 = 0)
                 ORDER BY path",
            )?;
            let names = stmt
                .query_map(params![path, subscribed_only], |row| row.get::<_, String>(0))?
                .map(|row| row.map(|p| meshfs_core::file_name(&p).to_string()))
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(names)
        })
        .await
    }

    async fn merge_dir_listing(&self, path: &str, entries: &[DirEntry]) -> Result<usize> {
        let path = normalize(path)?;
        let entries = entries.to_vec();
        self.run(move |conn| {
            let tx = conn.transaction()?;
            if fetch_entry(&tx, &path)?.is_none() {
                ensure_ancestors(&tx, &path, false)?;
                write_entry(&tx, &FileEntry::new(path.clone(), FileKind::Directory, false))?;
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
                if fetch_entry(&tx, &child)?.is_none() {
                    write_entry(&tx, &FileEntry::new(child, entry.kind, false))?;
                    inserted += 1;
                }
            }
            tx.commit()?;
            Ok(inserted)
        })
        .await
    }

    async fn set_subscribed(&self, path: &str, subscribed: bool) -> Result<bool> {
        let path = normalize(path)?;
        self.run(move |conn| {
            let changed = conn.execute(
                "UPDATE entries SET subscribed = ?2, updated_at = ?3 WHERE path = ?1",
                params![path, subscribed, now_millis()],
            )?;
            Ok(changed > 0)
        })
        .await
    }

    async fn list_entries(&self) -> Result<Vec<FileEntry>> {
        self.run(|conn| {
            let sql = format!("SELECT {} FROM entries ORDER BY path", ENTRY_COLUMNS);
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map([], row_to_entry)?;
            collect(rows)
        })
        .await
    }

    async fn get_version(&self, path: &str) -> Result<VersionVector> {
        let path = normalize(path)?;
        self.run(move |conn| {
            Ok(fetch_entry(conn, &path)?
                .map(|entry| entry.version)
                .unwrap_or_default())
        })
        .await
    }

    async fn set_version(&self, path: &str, version: &VersionVector) -> Result<()> {
        let path = normalize(path)?;
        let blob = version.to_cbor()?;
        self.run(move |conn| {
            let changed = conn.execute(
                "UPDATE entries SET version = ?2, updated_at = ?3 WHERE path = ?1",
                params![path, blob, now_millis()],
            )?;
            if changed == 0 {
                return Err(StoreError::NotFound(path));
            }
            Ok(())
        })
        .await
    }

    async fn bump_version(&self, path: &str, local: PeerId) -> Result<VersionVector> {
        let path = normalize(path)?;
        self.run(move |conn| {
            let tx = conn.transaction()?;
            let mut entry = match fetch_entry(&tx, &path)? {
                Some(entry) if entry.is_live() => entry,
                _ => return Err(StoreError::NotFound(path)),
            };
            entry.version.increment(local);
            write_entry(&tx, &entry)?;
            tx.commit()?;
            Ok(entry.version)
        })
        .await
    }

    async fn apply_remote_tombstone(&self, path: &str, remote: &VersionVector) -> Result<bool> {
        let path = normalize(path)?;
        let remote = remote.clone();
        self.run(move |conn| {
            let tx = conn.transaction()?;
            let mut entry = match fetch_entry(&tx, &path)? {
                Some(entry) => entry,
                None => {
                    ensure_ancestors(&tx, &path, false)?;
                    FileEntry::new(path.clone(), FileKind::Regular, false)
                }
            };
            if entry.version.compare(&remote) != meshfs_core::Causality::Less {
                return Ok(false);
            }
            entry.deleted = true;
            entry.subscribed = false;
            entry.version = remote;
            write_entry(&tx, &entry)?;
            tx.commit()?;
            Ok(true)
        })
        .await
    }

    async fn adopt_remote_node(
        &self,
        path: &str,
        kind: FileKind,
        remote: &VersionVector,
    ) -> Result<bool> {
        let path = normalize(path)?;
        let remote = remote.clone();
        self.run(move |conn| {
            let tx = conn.transaction()?;
            let mut entry = match fetch_entry(&tx, &path)? {
                Some(entry) => entry,
                None => FileEntry::new(path.clone(), kind, true),
            };
            if entry.version.compare(&remote) != meshfs_core::Causality::Less {
                return Ok(false);
            }
            ensure_ancestors(&tx, &path, true)?;
            entry.kind = kind;
            entry.deleted = false;
            entry.subscribed = true;
            entry.version = remote;
            write_entry(&tx, &entry)?;
            tx.commit()?;
            Ok(true)
        })
        .await
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
        let version = version.clone();
        let stage_dir = stage_dir.to_path_buf();
        self.run(move |conn| {
            let tx = conn.transaction()?;
            let last: i64 = tx
                .query_row(
                    "SELECT last_txn FROM download_txns WHERE path = ?1 AND peer = ?2",
                    params![path, peer.get()],
                    |row| row.get(0),
                )
                .optional()?
                .unwrap_or(0);
            let txn = last as u64 + 1;

            tx.execute(
                "INSERT INTO download_txns (path, peer, last_txn) VALUES (?1, ?2, ?3)
                 ON CONFLICT(path, peer) DO UPDATE SET last_txn = excluded.last_txn",
                params![path, peer.get(), txn as i64],
            )?;

            let download = Download {
                stage_path: stage_dir.join(Download::stage_name(&path, peer, txn)),
                path,
                peer,
                txn,
                received: 0,
                total_size: size,
                version,
            };

            tx.execute(
                "INSERT OR REPLACE INTO downloads
                    (path, peer, txn, stage_path, received, total_size, version)
                 VALUES (?1, ?2, ?3, ?4, 0, ?5, ?6)",
                params![
                    download.path,
                    peer.get(),
                    txn as i64,
                    download.stage_path.to_string_lossy(),
                    size as i64,
                    download.version.to_cbor()?,
                ],
            )?;
            tx.commit()?;
            Ok(download)
        })
        .await
    }

    async fn get_download(&self, path: &str, peer: PeerId) -> Result<Option<Download>> {
        let path = normalize(path)?;
        self.run(move |conn| fetch_download(conn, &path, peer)).await
    }

    async fn record_progress(
        &self,
        path: &str,
        peer: PeerId,
        txn: u64,
        received: u64,
    ) -> Result<bool> {
        let path = normalize(path)?;
        self.run(move |conn| {
            let changed = conn.execute(
                "UPDATE downloads SET received = ?4 WHERE path = ?1 AND peer = ?2 AND txn = ?3",
                params![path, peer.get(), txn as i64, received as i64],
            )?;
            Ok(changed > 0)
        })
        .await
    }

    async fn finish_download(
        &self,
        path: &str,
        peer: PeerId,
        txn: u64,
    ) -> Result<DownloadOutcome> {
        let path = normalize(path)?;
        self.run(move |conn| {
            let tx = conn.transaction()?;
            let download = match fetch_download(&tx, &path, peer)? {
                Some(d) if d.txn == txn => d,
                _ => return Ok(DownloadOutcome::Stale),
            };

            let entry = fetch_entry(&tx, &path)?;
            let outcome = resolve_download(entry.as_ref(), &download, now_millis());
            match &outcome {
                DownloadOutcome::Promoted(entry) => {
                    ensure_ancestors(&tx, &path, true)?;
                    write_entry(&tx, entry)?;
                }
                DownloadOutcome::Conflicted(conflict) => insert_conflict(&tx, conflict)?,
                DownloadOutcome::Superseded | DownloadOutcome::Stale => {}
            }

            tx.execute(
                "DELETE FROM downloads WHERE path = ?1 AND peer = ?2",
                params![path, peer.get()],
            )?;
            tx.commit()?;
            Ok(outcome)
        })
        .await
    }

    async fn remove_download(&self, path: &str, peer: PeerId) -> Result<()> {
        let path = normalize(path)?;
        self.run(move |conn| {
            conn.execute(
                "DELETE FROM downloads WHERE path = ?1 AND peer = ?2",
                params![path, peer.get()],
            )?;
            Ok(())
        })
        .await
    }

    async fn list_downloads(&self) -> Result<Vec<Download>> {
        self.run(|conn| {
            let sql = format!(
                "SELECT {} FROM downloads ORDER BY path, peer",
                DOWNLOAD_COLUMNS
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map([], row_to_download)?;
            collect(rows)
        })
        .await
    }

    async fn record_conflict(&self, conflict: &Conflict) -> Result<()> {
        let conflict = conflict.clone();
        self.run(move |conn| insert_conflict(conn, &conflict)).await
    }

    async fn list_conflicts(&self) -> Result<Vec<Conflict>> {
        self.run(|conn| {
            let mut stmt = conn.prepare(
                "SELECT path, peer, local_version, remote_version, detected_at
                 FROM conflicts ORDER BY id",
            )?;
            let rows = stmt.query_map([], |row| {
                let path: String = row.get(0)?;
                let peer: u32 = row.get(1)?;
                let local: Vec<u8> = row.get(2)?;
                let remote: Vec<u8> = row.get(3)?;
                let detected_at: i64 = row.get(4)?;
                Ok((|| -> Result<Conflict> {
                    Ok(Conflict {
                        path,
                        peer: PeerId(peer),
                        local: VersionVector::from_cbor(&local)?,
                        remote: VersionVector::from_cbor(&remote)?,
                        detected_at,
                    })
                })())
            })?;
            collect(rows)
        })
        .await
    }

    async fn register_peer(
        &self,
        fingerprint: &KeyFingerprint,
        display_name: &str,
    ) -> Result<PeerId> {
        let fingerprint = *fingerprint;
        let display_name = display_name.to_string();
        self.run(move |conn| {
            conn.execute(
                "INSERT INTO peers (fingerprint, display_name, first_seen) VALUES (?1, ?2, ?3)
                 ON CONFLICT(fingerprint) DO UPDATE SET display_name = excluded.display_name",
                params![fingerprint.as_bytes().as_slice(), display_name, now_millis()],
            )?;
            let id: u32 = conn.query_row(
                "SELECT id FROM peers WHERE fingerprint = ?1",
                params![fingerprint.as_bytes().as_slice()],
                |row| row.get(0),
            )?;
            Ok(PeerId(id))
        })
        .await
    }

    async fn get_peer(&self, id: PeerId) -> Result<Option<PeerInfo>> {
        self.run(move |conn| {
            conn.query_row(
                "SELECT id, fingerprint, display_name FROM peers WHERE id = ?1",
                params![id.get()],
                row_to_peer,
            )
            .optional()?
            .transpose()
        })
        .await
    }

    async fn peer_by_fingerprint(&self, fingerprint: &KeyFingerprint) -> Result<Option<PeerInfo>> {
        let fingerprint = *fingerprint;
        self.run(move |conn| {
            conn.query_row(
                "SELECT id, fingerprint, display_name FROM peers WHERE fingerprint = ?1",
                params![fingerprint.as_bytes().as_slice()],
                row_to_peer,
            )
            .optional()?
            .transpose()
        })
        .await
    }

    async fn list_peers(&self) -> Result<Vec<PeerInfo>> {
        self.run(|conn| {
            let mut stmt =
                conn.prepare("SELECT id, fingerprint, display_name FROM peers ORDER BY id")?;
            let rows = stmt.query_map([], row_to_peer)?;
            collect(rows)
        })
        .await
    }
}
