//! Background job worker.
//!
//! Long-running work that must not stall a connection's worker task runs
//! here: walking the tree to announce it to a peer, and keepalive pings.
//! One worker per node drains a bounded channel in order. Each tree walk
//! runs as its own task, so a peer that stops reading only holds up its own
//! walk; pings are dropped for a peer whose queue is full.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use meshfs_core::{parent_of, DirEntry, FileEntry, FileKind, ROOT};
use meshfs_net::messages::{DirChunk, NodeInfo, Ping};
use meshfs_net::{ConnectionHandle, ConnectionPool, NetError};
use meshfs_store::MetaStore;

use crate::error::{Result, SyncError};
use crate::files;

/// Work items for the background worker.
#[derive(Debug)]
pub enum Job {
    /// Announce everything under `path` to one connection.
    TreeSync { path: String, conn: ConnectionHandle },
    /// Ping every active peer.
    PingAll,
}

/// Submits jobs to the worker.
#[derive(Clone)]
pub struct JobQueue {
    tx: mpsc::Sender<Job>,
}

impl JobQueue {
    /// Queue a job, waiting if the worker is behind.
    pub async fn submit(&self, job: Job) -> Result<()> {
        self.tx.send(job).await.map_err(|_| SyncError::WorkerStopped)
    }

    /// Queue a job without waiting. Returns `false` if the queue is full.
    pub fn try_submit(&self, job: Job) -> bool {
        self.tx.try_send(job).is_ok()
    }
}

/// The single background worker.
pub struct JobWorker {
    store: Arc<dyn MetaStore>,
    root_dir: PathBuf,
    pool: Arc<ConnectionPool>,
    rx: mpsc::Receiver<Job>,
    nonce: AtomicU64,
}

impl JobWorker {
    /// Create a worker and the queue feeding it.
    pub fn new(
        store: Arc<dyn MetaStore>,
        root_dir: PathBuf,
        pool: Arc<ConnectionPool>,
        capacity: usize,
    ) -> (Self, JobQueue) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let worker = Self {
            store,
            root_dir,
            pool,
            rx,
            nonce: AtomicU64::new(1),
        };
        (worker, JobQueue { tx })
    }

    /// Process jobs until every queue handle is dropped or `cancel` fires.
    pub async fn run(mut self, cancel: CancellationToken) {
        let mut walks = JoinSet::new();
        loop {
            let job = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                Some(done) = walks.join_next(), if !walks.is_empty() => {
                    if let Err(e) = done {
                        tracing::warn!("tree sync task failed: {}", e);
                    }
                    continue;
                }
                job = self.rx.recv() => match job {
                    Some(job) => job,
                    None => break,
                },
            };
            match job {
                Job::TreeSync { path, conn } => {
                    let store = self.store.clone();
                    let root_dir = self.root_dir.clone();
                    walks.spawn(async move {
                        if let Err(e) = tree_sync(store.as_ref(), &root_dir, &path, &conn).await {
                            tracing::warn!(conn = conn.id(), path = %path, "tree sync failed: {}", e);
                        }
                    });
                }
                Job::PingAll => self.ping_all(),
            }
        }
        walks.shutdown().await;
        tracing::debug!("job worker stopped");
    }

    fn ping_all(&self) {
        for conn in self.pool.peer_handles() {
            let nonce = self.nonce.fetch_add(1, Ordering::Relaxed);
            match conn.try_send(Ping { nonce }) {
                Ok(()) => {}
                Err(NetError::QueueFull) => {
                    tracing::debug!(conn = conn.id(), "peer backlogged, ping skipped")
                }
                Err(e) => tracing::debug!(conn = conn.id(), "ping skipped: {}", e),
            }
        }
    }
}

async fn tree_sync(
    store: &dyn MetaStore,
    root_dir: &Path,
    path: &str,
    conn: &ConnectionHandle,
) -> Result<()> {
    let path = meshfs_core::normalize(path)?;
    let entries = store.list_entries().await?;
    let selected: Vec<&FileEntry> = entries.iter().filter(|e| is_under(&e.path, &path)).collect();

    let mut announced = 0;
    for entry in &selected {
        if let Some(info) = node_info(root_dir, entry).await {
            conn.send(info).await?;
            announced += 1;
        }
    }
    for chunk in dir_chunks(&selected) {
        conn.send(chunk).await?;
    }

    tracing::debug!(conn = conn.id(), path = %path, announced, "tree sync sent");
    Ok(())
}

/// The announcement for one entry. Placeholders hold no content and are
/// not announced; the root is implied.
async fn node_info(root_dir: &Path, entry: &FileEntry) -> Option<NodeInfo> {
    if entry.path == ROOT {
        return None;
    }
    if !entry.deleted && !entry.subscribed {
        return None;
    }
    let size = match (entry.deleted, entry.kind) {
        (false, kind) if kind.has_content() => {
            files::size_of(&files::local_path(root_dir, &entry.path)).await
        }
        _ => 0,
    };
    Some(NodeInfo {
        path: entry.path.clone(),
        kind: entry.kind,
        size,
        version: entry.version.clone(),
        deleted: entry.deleted,
    })
}

fn is_under(candidate: &str, dir: &str) -> bool {
    if dir == ROOT || candidate == dir {
        return true;
    }
    candidate
        .strip_prefix(dir)
        .map_or(false, |rest| rest.starts_with('/'))
}

/// One listing per live directory, naming its live children.
fn dir_chunks(entries: &[&FileEntry]) -> Vec<DirChunk> {
    let mut dirs: BTreeMap<&str, Vec<DirEntry>> = entries
        .iter()
        .filter(|e| e.is_live() && e.kind == FileKind::Directory)
        .map(|e| (e.path.as_str(), Vec::new()))
        .collect();

    for entry in entries.iter().filter(|e| e.is_live()) {
        if let Some(children) = parent_of(&entry.path).and_then(|p| dirs.get_mut(p)) {
            children.push(DirEntry {
                name: meshfs_core::file_name(&entry.path).to_string(),
                kind: entry.kind,
            });
        }
    }

    dirs.into_iter()
        .map(|(path, entries)| DirChunk {
            path: path.to_string(),
            entries,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshfs_core::{PeerId, VersionVector};
    use meshfs_crypto::RsaIdentity;
    use meshfs_net::{Envelope, Message, PriorityQueue, RemoteIdentity, PRIORITY_LEVELS};
    use meshfs_store::MemoryStore;
    use std::sync::OnceLock;
    use std::time::Duration;
    use tempfile::TempDir;

    fn peer_key() -> &'static RsaIdentity {
        static KEY: OnceLock<RsaIdentity> = OnceLock::new();
        KEY.get_or_init(|| RsaIdentity::generate(1024).unwrap())
    }

    /// A peer handle whose outbound queue holds `capacity` items per level.
    fn peer_conn(id: u64, capacity: usize) -> (ConnectionHandle, Arc<PriorityQueue<Envelope>>) {
        let outbound = Arc::new(PriorityQueue::new(PRIORITY_LEVELS, capacity));
        let conn = ConnectionHandle::new(
            id,
            RemoteIdentity::Peer {
                public_key: peer_key().public_key().clone(),
                display_name: format!("peer-{}", id),
            },
            None,
            outbound.clone(),
            CancellationToken::new(),
        );
        (conn, outbound)
    }

    async fn drain_until(queue: &PriorityQueue<Envelope>, count: usize) -> Vec<Message> {
        let mut out = Vec::new();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while out.len() < count && tokio::time::Instant::now() < deadline {
            match queue.try_pop() {
                Some(Envelope::Message(m)) => out.push(m),
                Some(Envelope::Quit) => {}
                None => tokio::time::sleep(Duration::from_millis(10)).await,
            }
        }
        out
    }

    #[tokio::test]
    async fn test_backlogged_peer_does_not_stall_others() {
        let store = Arc::new(MemoryStore::new());
        for path in ["/one", "/two", "/three"] {
            store.mknod(path, FileKind::Regular, true).await.unwrap();
            store.bump_version(path, PeerId(1)).await.unwrap();
        }
        let root = TempDir::new().unwrap();
        let pool = ConnectionPool::new(2);
        let (worker, jobs) = JobWorker::new(store.clone(), root.path().into(), pool.clone(), 8);
        let cancel = CancellationToken::new();
        let running = tokio::spawn(worker.run(cancel.clone()));

        // Never drained: its walk blocks after the first announcement.
        let (stuck, stuck_queue) = peer_conn(1, 1);
        let (healthy, healthy_queue) = peer_conn(2, 64);
        let slot_stuck = pool.try_acquire().unwrap();
        slot_stuck.publish(stuck.clone());
        let slot_healthy = pool.try_acquire().unwrap();
        slot_healthy.publish(healthy.clone());

        jobs.submit(Job::TreeSync {
            path: "/".into(),
            conn: stuck,
        })
        .await
        .unwrap();
        jobs.submit(Job::TreeSync {
            path: "/".into(),
            conn: healthy,
        })
        .await
        .unwrap();
        assert!(jobs.try_submit(Job::PingAll));

        // Three announcements, the root listing, and a ping.
        let sent = drain_until(&healthy_queue, 5).await;
        let infos = sent.iter().filter(|m| matches!(m, Message::NodeInfo(_))).count();
        assert_eq!(infos, 3);
        assert!(sent.iter().any(|m| matches!(m, Message::DirChunk(d) if d.path == "/")));
        assert!(sent.iter().any(|m| matches!(m, Message::Ping(_))));
        assert_eq!(stuck_queue.len(), 1);

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), running)
            .await
            .expect("worker stopped with a walk still blocked")
            .unwrap();
        drop((slot_stuck, slot_healthy));
    }

    fn entry(path: &str, kind: FileKind, deleted: bool) -> FileEntry {
        let mut e = FileEntry::new(path, kind, true);
        e.deleted = deleted;
        e.version = VersionVector::from_entries([(PeerId(1), 1)]);
        e
    }

    #[test]
    fn test_is_under() {
        assert!(is_under("/a/b", "/"));
        assert!(is_under("/a/b", "/a"));
        assert!(is_under("/a", "/a"));
        assert!(!is_under("/ab", "/a"));
        assert!(!is_under("/b", "/a"));
    }

    #[test]
    fn test_dir_chunks_list_live_children() {
        let root = FileEntry::new("/", FileKind::Directory, true);
        let docs = entry("/docs", FileKind::Directory, false);
        let a = entry("/docs/a.txt", FileKind::Regular, false);
        let gone = entry("/docs/gone.txt", FileKind::Regular, true);
        let top = entry("/top.txt", FileKind::Regular, false);
        let all = vec![&root, &docs, &a, &gone, &top];

        let chunks = dir_chunks(&all);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0].path, "/");
        let root_names: Vec<_> = chunks[0].entries.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(root_names, vec!["docs", "top.txt"]);
        assert_eq!(chunks[1].path, "/docs");
        assert_eq!(chunks[1].entries.len(), 1);
        assert_eq!(chunks[1].entries[0].name, "a.txt");
    }
}
