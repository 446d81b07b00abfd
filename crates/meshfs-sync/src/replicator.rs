//! Replication dispatcher.
//!
//! A [`Replicator`] is shared by every peer connection; it hands each new
//! connection a [`ReplicationSession`] that owns the connection's id
//! translation table and dispatches inbound messages by type.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;

use meshfs_core::{
    normalize, Causality, Conflict, CoreError, FileKind, KeyFingerprint, PeerId, VersionVector,
};
use meshfs_net::messages::{
    DirChunk, FileChunk, IdMap, IdMapEntry, NodeInfo, Pong, RequestChunk, RequestTree,
    TransferAbort,
};
use meshfs_net::{ConnectionHandle, ConnectionPool, HandlerFactory, Message, SessionHandler};
use meshfs_store::{DownloadOutcome, MetaStore};

use crate::error::{Result, SyncError};
use crate::files;
use crate::jobs::{Job, JobQueue};

/// Bytes reserved in a frame for the FileChunk envelope and the GCM tag.
const CHUNK_OVERHEAD: usize = 128;

/// Configuration for replication behavior.
#[derive(Debug, Clone)]
pub struct ReplicationConfig {
    /// Largest file slice sent in one FileChunk.
    pub chunk_size: usize,
    /// Frame ceiling of the connections this replicator serves.
    pub max_frame_len: usize,
    /// Fetch content for paths first seen from a peer.
    pub auto_subscribe: bool,
    /// Ask each new peer for its whole tree.
    pub sync_on_connect: bool,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            chunk_size: 32 * 1024,
            max_frame_len: meshfs_net::MAX_FRAME_LEN,
            auto_subscribe: true,
            sync_on_connect: true,
        }
    }
}

impl ReplicationConfig {
    /// Chunk size that still fits a frame for `path`.
    fn chunk_limit(&self, path: &str) -> usize {
        let room = self
            .max_frame_len
            .saturating_sub(CHUNK_OVERHEAD + path.len());
        self.chunk_size.min(room).max(1)
    }
}

/// Shared replication state; creates one session per peer connection.
pub struct Replicator {
    store: Arc<dyn MetaStore>,
    local_id: PeerId,
    root_dir: PathBuf,
    stage_dir: PathBuf,
    config: ReplicationConfig,
    pool: Arc<ConnectionPool>,
    jobs: JobQueue,
}

impl Replicator {
    /// Create a replicator serving content under `root_dir`.
    pub fn new(
        store: Arc<dyn MetaStore>,
        local_id: PeerId,
        root_dir: PathBuf,
        stage_dir: PathBuf,
        config: ReplicationConfig,
        pool: Arc<ConnectionPool>,
        jobs: JobQueue,
    ) -> Self {
        Self {
            store,
            local_id,
            root_dir,
            stage_dir,
            config,
            pool,
            jobs,
        }
    }

    /// This node's own peer id.
    pub fn local_id(&self) -> PeerId {
        self.local_id
    }

    /// The known-peers table as sent on the wire.
    pub async fn id_map(&self) -> Result<IdMap> {
        id_map(self.store.as_ref()).await
    }

    async fn register(&self, fingerprint: &KeyFingerprint, display_name: &str) -> Result<(PeerId, bool)> {
        let known = self.store.peer_by_fingerprint(fingerprint).await?.is_some();
        let id = self.store.register_peer(fingerprint, display_name).await?;
        Ok((id, !known))
    }
}

#[async_trait]
impl HandlerFactory for Replicator {
    async fn open(&self, conn: &ConnectionHandle) -> meshfs_net::Result<Box<dyn SessionHandler>> {
        let remote = conn.remote();
        let fingerprint = remote.fingerprint().ok_or_else(|| {
            meshfs_net::NetError::Protocol("local connection offered to replication".into())
        })?;

        let (peer, is_new) = self.register(&fingerprint, remote.display_name()).await?;
        tracing::info!(
            conn = conn.id(),
            peer = peer.get(),
            name = remote.display_name(),
            fingerprint = %fingerprint.to_hex(),
            is_new,
            "peer session opened"
        );

        let map = self.id_map().await?;
        if is_new {
            // Existing peers must learn the new id before it shows up in vectors.
            self.pool.broadcast(&Message::from(map.clone())).await;
        }

        // Queued before the connection is published, so the id map is the
        // first thing the peer sees.
        conn.send(map).await?;
        if self.config.sync_on_connect {
            conn.send(RequestTree {
                path: meshfs_core::ROOT.into(),
            })
            .await?;
        }

        Ok(Box::new(ReplicationSession {
            store: self.store.clone(),
            peer,
            local_id: self.local_id,
            root_dir: self.root_dir.clone(),
            stage_dir: self.stage_dir.clone(),
            config: self.config.clone(),
            pool: self.pool.clone(),
            jobs: self.jobs.clone(),
            id_table: HashMap::new(),
        }))
    }
}

/// Per-connection replication handler.
pub struct ReplicationSession {
    store: Arc<dyn MetaStore>,
    /// Our id for the peer on the other end.
    peer: PeerId,
    local_id: PeerId,
    root_dir: PathBuf,
    stage_dir: PathBuf,
    config: ReplicationConfig,
    pool: Arc<ConnectionPool>,
    jobs: JobQueue,
    /// The peer's ids mapped onto ours.
    id_table: HashMap<PeerId, PeerId>,
}

#[async_trait]
impl SessionHandler for ReplicationSession {
    async fn handle(&mut self, message: Message, conn: &ConnectionHandle) -> meshfs_net::Result<()> {
        let kind = message.kind();
        match self.dispatch(message, conn).await {
            Ok(()) => Ok(()),
            Err(e) if !e.is_fatal() => {
                tracing::warn!(conn = conn.id(), ?kind, "skipping message: {}", e);
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn on_close(&mut self, conn: &ConnectionHandle) {
        tracing::debug!(conn = conn.id(), peer = self.peer.get(), "peer session closed");
    }
}

impl ReplicationSession {
    async fn dispatch(&mut self, message: Message, conn: &ConnectionHandle) -> Result<()> {
        match message {
            Message::IdMap(map) => self.on_id_map(map).await,
            Message::NodeInfo(info) => self.on_node_info(info, conn).await,
            Message::DirChunk(chunk) => self.on_dir_chunk(chunk).await,
            Message::RequestChunk(req) => self.on_request_chunk(req, conn).await,
            Message::FileChunk(chunk) => self.on_file_chunk(chunk, conn).await,
            Message::TransferAbort(abort) => self.on_transfer_abort(abort).await,
            Message::RequestTree(req) => {
                self.jobs
                    .submit(Job::TreeSync {
                        path: req.path,
                        conn: conn.clone(),
                    })
                    .await
            }
            Message::Ping(ping) => Ok(conn.send(Pong { nonce: ping.nonce }).await?),
            Message::Pong(pong) => {
                tracing::trace!(conn = conn.id(), nonce = pong.nonce, "pong");
                Ok(())
            }
            other => Err(SyncError::UnexpectedMessage(other.kind())),
        }
    }

    /// Rewrite a vector from the peer's numbering into ours.
    fn translate(&self, version: &VersionVector) -> Result<VersionVector> {
        version
            .translate(|id| self.id_table.get(&id).copied())
            .map_err(|e| match e {
                CoreError::UntranslatedPeer(id) => SyncError::UnmappedPeer(id),
                other => SyncError::Core(other),
            })
    }

    /// Rewrite a vector from our numbering into the peer's.
    fn untranslate(&self, version: &VersionVector) -> Result<VersionVector> {
        version
            .translate(|id| {
                self.id_table
                    .iter()
                    .find(|&(_, &local)| local == id)
                    .map(|(&remote, _)| remote)
            })
            .map_err(|e| match e {
                CoreError::UntranslatedPeer(id) => SyncError::UnmappedPeer(id),
                other => SyncError::Core(other),
            })
    }

    async fn on_id_map(&mut self, map: IdMap) -> Result<()> {
        let mut learned = 0;
        for entry in map.peers {
            let known = self.store.peer_by_fingerprint(&entry.fingerprint).await?.is_some();
            match self
                .store
                .register_peer(&entry.fingerprint, &entry.display_name)
                .await
            {
                Ok(local) => {
                    self.id_table.insert(entry.id, local);
                    if !known {
                        learned += 1;
                    }
                }
                Err(e) => tracing::warn!(
                    peer = self.peer.get(),
                    remote_id = entry.id.get(),
                    "could not register mapped peer: {}",
                    e
                ),
            }
        }
        tracing::debug!(peer = self.peer.get(), mapped = self.id_table.len(), learned, "id map applied");

        if learned > 0 {
            // Our vectors may name these ids from now on; every peer has to
            // hold the mapping before the first such vector reaches it.
            let map = id_map(self.store.as_ref()).await?;
            let sent = self.pool.broadcast(&Message::from(map)).await;
            tracing::debug!(learned, sent, "id map rebroadcast");
        }
        Ok(())
    }

    async fn on_node_info(&mut self, info: NodeInfo, conn: &ConnectionHandle) -> Result<()> {
        let path = normalize(&info.path)?;
        if path == meshfs_core::ROOT {
            return Ok(());
        }
        let remote = self.translate(&info.version)?;
        let entry = self.store.get_entry(&path).await?;
        let local = entry.as_ref().map(|e| e.version.clone()).unwrap_or_default();

        match local.compare(&remote) {
            Causality::Less => {}
            Causality::Concurrent => return self.record_conflict(&path, local, remote).await,
            Causality::Equal | Causality::Greater => return Ok(()),
        }

        if info.deleted {
            if self.store.apply_remote_tombstone(&path, &remote).await? {
                if let Some(download) = self.store.get_download(&path, self.peer).await? {
                    self.store.remove_download(&path, self.peer).await?;
                    files::remove(&download.stage_path).await?;
                }
                files::remove(&files::local_path(&self.root_dir, &path)).await?;
                tracing::info!(path = %path, peer = self.peer.get(), "removed by peer");
                self.relay(
                    NodeInfo {
                        path,
                        kind: info.kind,
                        size: 0,
                        version: remote,
                        deleted: true,
                    },
                    conn,
                )
                .await;
            }
            return Ok(());
        }

        if !info.kind.has_content() {
            if self.store.adopt_remote_node(&path, info.kind, &remote).await? {
                if info.kind == FileKind::Directory {
                    tokio::fs::create_dir_all(files::local_path(&self.root_dir, &path)).await?;
                }
                self.relay(
                    NodeInfo {
                        path,
                        kind: info.kind,
                        size: 0,
                        version: remote,
                        deleted: false,
                    },
                    conn,
                )
                .await;
            }
            return Ok(());
        }

        // Placeholders that never held content follow the auto-subscribe policy.
        let subscribed = match &entry {
            Some(e) if e.is_live() => {
                e.subscribed || (e.version.is_empty() && self.config.auto_subscribe)
            }
            _ => self.config.auto_subscribe,
        };
        if !subscribed {
            self.store.mknod(&path, info.kind, false).await?;
            return Ok(());
        }

        if let Some(current) = self.store.get_download(&path, self.peer).await? {
            if current.version == remote {
                return Ok(());
            }
        }
        let download = self
            .store
            .add_download(self.peer, &path, info.size, &remote, &self.stage_dir)
            .await?;
        tracing::debug!(path = %path, peer = self.peer.get(), txn = download.txn, size = info.size, "pulling");
        conn.send(RequestChunk {
            path,
            txn: download.txn,
            offset: 0,
            version: info.version,
        })
        .await?;
        Ok(())
    }

    /// Announce a change learned from this peer to every other peer.
    ///
    /// `info.version` is in our numbering, which our peers already hold.
    async fn relay(&self, info: NodeInfo, conn: &ConnectionHandle) {
        let path = info.path.clone();
        let relayed = self
            .pool
            .broadcast_except(&Message::from(info), Some(conn.id()))
            .await;
        if relayed > 0 {
            tracing::debug!(path = %path, peer = self.peer.get(), relayed, "change relayed");
        }
    }

    async fn record_conflict(&self, path: &str, local: VersionVector, remote: VersionVector) -> Result<()> {
        tracing::warn!(path = %path, peer = self.peer.get(), "concurrent versions, conflict recorded");
        self.store
            .record_conflict(&Conflict {
                path: path.to_string(),
                peer: self.peer,
                local,
                remote,
                detected_at: now_millis(),
            })
            .await?;
        Ok(())
    }

    async fn on_dir_chunk(&mut self, chunk: DirChunk) -> Result<()> {
        let path = normalize(&chunk.path)?;
        let inserted = self.store.merge_dir_listing(&path, &chunk.entries).await?;
        if inserted > 0 {
            tracing::debug!(path = %path, inserted, "placeholders merged");
        }
        Ok(())
    }

    async fn on_request_chunk(&mut self, req: RequestChunk, conn: &ConnectionHandle) -> Result<()> {
        let path = normalize(&req.path)?;
        let entry = match self.store.get_entry(&path).await {
            Ok(Some(entry)) if entry.is_live() && entry.subscribed && entry.kind.has_content() => {
                entry
            }
            Ok(_) => {
                conn.send(transfer_abort(&path, req.txn, "not held")).await?;
                return Ok(());
            }
            Err(e) => {
                tracing::warn!(path = %path, "lookup failed: {}", e);
                conn.send(transfer_abort(&path, req.txn, "not held")).await?;
                return Ok(());
            }
        };
        // Bytes on disk belong to the current version only.
        if entry.version != req.version {
            tracing::debug!(path = %path, txn = req.txn, "requested version superseded");
            conn.send(transfer_abort(&path, req.txn, "version changed")).await?;
            return Ok(());
        }

        let file = files::local_path(&self.root_dir, &path);
        let limit = self.config.chunk_limit(&path);
        match files::read_chunk(&file, req.offset, limit).await {
            Ok((data, total_size)) => {
                if self.store.get_version(&path).await? != req.version {
                    conn.send(transfer_abort(&path, req.txn, "version changed")).await?;
                    return Ok(());
                }
                conn.send(FileChunk {
                    path,
                    txn: req.txn,
                    offset: req.offset,
                    total_size,
                    data,
                })
                .await?;
            }
            Err(e) => {
                tracing::warn!(path = %path, "cannot serve chunk: {}", e);
                conn.send(transfer_abort(&path, req.txn, &e.to_string())).await?;
            }
        }
        Ok(())
    }

    async fn on_file_chunk(&mut self, chunk: FileChunk, conn: &ConnectionHandle) -> Result<()> {
        let path = normalize(&chunk.path)?;
        let download = match self.store.get_download(&path, self.peer).await? {
            Some(d) if d.txn == chunk.txn => d,
            _ => {
                tracing::debug!(path = %path, txn = chunk.txn, "stale chunk dropped");
                return Ok(());
            }
        };
        if chunk.offset != download.received {
            tracing::debug!(path = %path, offset = chunk.offset, expected = download.received, "out of order chunk dropped");
            return Ok(());
        }

        let received = chunk.offset + chunk.data.len() as u64;
        let complete = received >= chunk.total_size;
        if chunk.data.is_empty() && !complete {
            return Err(SyncError::Protocol(format!(
                "empty chunk for {} at {} of {}",
                path, chunk.offset, chunk.total_size
            )));
        }

        files::write_at(&download.stage_path, chunk.offset, &chunk.data).await?;
        if !self
            .store
            .record_progress(&path, self.peer, chunk.txn, received)
            .await?
        {
            return Ok(());
        }

        if !complete {
            let version = self.untranslate(&download.version)?;
            conn.send(RequestChunk {
                path,
                txn: chunk.txn,
                offset: received,
                version,
            })
            .await?;
            return Ok(());
        }

        match self.store.finish_download(&path, self.peer, chunk.txn).await? {
            DownloadOutcome::Promoted(entry) => {
                files::promote(&download.stage_path, &files::local_path(&self.root_dir, &path)).await?;
                tracing::info!(path = %path, peer = self.peer.get(), size = received, version = ?entry.version, "file updated");

                self.relay(
                    NodeInfo {
                        path,
                        kind: entry.kind,
                        size: received,
                        version: entry.version,
                        deleted: false,
                    },
                    conn,
                )
                .await;
            }
            DownloadOutcome::Conflicted(conflict) => {
                tracing::warn!(path = %conflict.path, peer = self.peer.get(), "local change during download, conflict recorded");
                files::remove(&download.stage_path).await?;
            }
            DownloadOutcome::Superseded | DownloadOutcome::Stale => {
                files::remove(&download.stage_path).await?;
            }
        }
        Ok(())
    }

    async fn on_transfer_abort(&mut self, abort: TransferAbort) -> Result<()> {
        let path = normalize(&abort.path)?;
        if let Some(download) = self.store.get_download(&path, self.peer).await? {
            if download.txn == abort.txn {
                tracing::info!(path = %path, peer = self.peer.get(), reason = %abort.reason, "transfer aborted by peer");
                self.store.remove_download(&path, self.peer).await?;
                files::remove(&download.stage_path).await?;
            }
        }
        Ok(())
    }

    /// Our id for the connected peer.
    pub fn peer(&self) -> PeerId {
        self.peer
    }

    /// This node's id.
    pub fn local_id(&self) -> PeerId {
        self.local_id
    }
}

async fn id_map(store: &dyn MetaStore) -> Result<IdMap> {
    let peers = store
        .list_peers()
        .await?
        .into_iter()
        .map(|p| IdMapEntry {
            id: p.id,
            fingerprint: p.fingerprint,
            display_name: p.display_name,
        })
        .collect();
    Ok(IdMap { peers })
}

fn transfer_abort(path: &str, txn: u64, reason: &str) -> TransferAbort {
    TransferAbort {
        path: path.to_string(),
        txn,
        reason: reason.to_string(),
    }
}

fn now_millis() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jobs::JobWorker;
    use meshfs_core::PeerInfo;
    use meshfs_crypto::RsaIdentity;
    use meshfs_net::messages::{Ping, StartSync};
    use meshfs_net::{
        Envelope, NetError, PriorityQueue, RemoteIdentity, SlotGuard, PRIORITY_LEVELS,
    };
    use meshfs_store::MemoryStore;
    use std::sync::OnceLock;
    use tempfile::TempDir;
    use tokio_util::sync::CancellationToken;

    fn remote_key() -> &'static RsaIdentity {
        static KEY: OnceLock<RsaIdentity> = OnceLock::new();
        KEY.get_or_init(|| RsaIdentity::generate(1024).unwrap())
    }

    fn vv(entries: &[(u32, u64)]) -> VersionVector {
        VersionVector::from_entries(entries.iter().map(|&(p, c)| (PeerId(p), c)))
    }

    struct Harness {
        store: Arc<MemoryStore>,
        pool: Arc<ConnectionPool>,
        root: TempDir,
        _stage: TempDir,
        conn: ConnectionHandle,
        outbound: Arc<PriorityQueue<Envelope>>,
        session: Box<dyn SessionHandler>,
    }

    impl Harness {
        async fn new(config: ReplicationConfig) -> Self {
            let store = Arc::new(MemoryStore::new());
            let local = store
                .register_peer(&KeyFingerprint::of(b"local"), "local")
                .await
                .unwrap();
            let root = TempDir::new().unwrap();
            let stage = TempDir::new().unwrap();
            let pool = ConnectionPool::new(3);
            let (_worker, jobs) = JobWorker::new(store.clone(), root.path().into(), pool.clone(), 8);
            let replicator = Replicator::new(
                store.clone(),
                local,
                root.path().into(),
                stage.path().into(),
                config,
                pool.clone(),
                jobs,
            );

            let outbound = Arc::new(PriorityQueue::new(PRIORITY_LEVELS, 64));
            let conn = ConnectionHandle::new(
                1,
                RemoteIdentity::Peer {
                    public_key: remote_key().public_key().clone(),
                    display_name: "remote".into(),
                },
                None,
                outbound.clone(),
                CancellationToken::new(),
            );
            let session = replicator.open(&conn).await.unwrap();
            Self {
                store,
                pool,
                root,
                _stage: stage,
                conn,
                outbound,
                session,
            }
        }

        async fn default() -> Self {
            Self::new(ReplicationConfig {
                sync_on_connect: false,
                ..ReplicationConfig::default()
            })
            .await
        }

        /// Feed the peer's id map: its 1 is itself, its 2 is us.
        async fn map_ids(&mut self) {
            let map = IdMap {
                peers: vec![
                    IdMapEntry {
                        id: PeerId(1),
                        fingerprint: remote_key().fingerprint(),
                        display_name: "remote".into(),
                    },
                    IdMapEntry {
                        id: PeerId(2),
                        fingerprint: KeyFingerprint::of(b"local"),
                        display_name: "local".into(),
                    },
                ],
            };
            self.send(map).await.unwrap();
        }

        async fn send(&mut self, message: impl Into<Message>) -> meshfs_net::Result<()> {
            self.session.handle(message.into(), &self.conn).await
        }

        fn sent(&self) -> Vec<Message> {
            let mut out = Vec::new();
            while let Some(envelope) = self.outbound.try_pop() {
                if let Envelope::Message(m) = envelope {
                    out.push(m);
                }
            }
            out
        }

        fn file(&self, path: &str) -> PathBuf {
            files::local_path(self.root.path(), path)
        }

        /// Publish this session's connection and a second peer's in the
        /// pool; returns the second peer's outbound queue.
        fn join_mesh(&self) -> (Vec<SlotGuard>, Arc<PriorityQueue<Envelope>>) {
            let own = self.pool.try_acquire().unwrap();
            own.publish(self.conn.clone());

            let queue = Arc::new(PriorityQueue::new(PRIORITY_LEVELS, 64));
            let other = self.pool.try_acquire().unwrap();
            other.publish(ConnectionHandle::new(
                2,
                RemoteIdentity::Peer {
                    public_key: remote_key().public_key().clone(),
                    display_name: "other".into(),
                },
                None,
                queue.clone(),
                CancellationToken::new(),
            ));
            (vec![own, other], queue)
        }
    }

    fn drain(queue: &PriorityQueue<Envelope>) -> Vec<Message> {
        let mut out = Vec::new();
        while let Some(envelope) = queue.try_pop() {
            if let Envelope::Message(m) = envelope {
                out.push(m);
            }
        }
        out
    }

    fn node_info(path: &str, version: VersionVector, size: u64) -> NodeInfo {
        NodeInfo {
            path: path.into(),
            kind: FileKind::Regular,
            size,
            version,
            deleted: false,
        }
    }

    #[tokio::test]
    async fn test_open_registers_peer_and_sends_id_map() {
        let h = Harness::default().await;
        let peers: Vec<PeerInfo> = h.store.list_peers().await.unwrap();
        assert_eq!(peers.len(), 2);
        assert_eq!(peers[1].fingerprint, remote_key().fingerprint());

        let sent = h.sent();
        assert_eq!(sent.len(), 1);
        match &sent[0] {
            Message::IdMap(map) => assert_eq!(map.peers.len(), 2),
            other => panic!("expected IdMap, got {:?}", other.kind()),
        }
    }

    #[tokio::test]
    async fn test_newer_file_is_pulled_and_promoted() {
        let mut h = Harness::default().await;
        h.map_ids().await;
        h.sent();

        h.send(node_info("/docs/a.txt", vv(&[(1, 1)]), 5)).await.unwrap();
        let sent = h.sent();
        let txn = match &sent[..] {
            [Message::RequestChunk(req)] => {
                assert_eq!(req.path, "/docs/a.txt");
                assert_eq!(req.offset, 0);
                req.txn
            }
            other => panic!("expected one RequestChunk, got {}", other.len()),
        };

        h.send(FileChunk {
            path: "/docs/a.txt".into(),
            txn,
            offset: 0,
            total_size: 5,
            data: b"hello".to_vec(),
        })
        .await
        .unwrap();

        assert!(h.sent().is_empty());
        assert_eq!(tokio::fs::read(h.file("/docs/a.txt")).await.unwrap(), b"hello");
        // The peer's id 1 is our id 2.
        assert_eq!(h.store.get_version("/docs/a.txt").await.unwrap(), vv(&[(2, 1)]));
        assert!(h.store.list_downloads().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_partial_chunk_requests_next_offset() {
        let mut h = Harness::default().await;
        h.map_ids().await;
        h.sent();

        h.send(node_info("/big", vv(&[(1, 3)]), 10)).await.unwrap();
        let txn = match h.sent().pop() {
            Some(Message::RequestChunk(req)) => req.txn,
            _ => panic!("expected RequestChunk"),
        };
        h.send(FileChunk {
            path: "/big".into(),
            txn,
            offset: 0,
            total_size: 10,
            data: vec![7u8; 4],
        })
        .await
        .unwrap();

        match h.sent().pop() {
            Some(Message::RequestChunk(req)) => {
                assert_eq!(req.offset, 4);
                assert_eq!(req.txn, txn);
                // Named the way the server announced it.
                assert_eq!(req.version, vv(&[(1, 3)]));
            }
            _ => panic!("expected follow-up RequestChunk"),
        }
        assert_eq!(
            h.store.get_download("/big", PeerId(2)).await.unwrap().unwrap().received,
            4
        );
    }

    #[tokio::test]
    async fn test_stale_transaction_is_dropped() {
        let mut h = Harness::default().await;
        h.map_ids().await;
        h.sent();

        h.send(node_info("/f", vv(&[(1, 1)]), 3)).await.unwrap();
        h.send(node_info("/f", vv(&[(1, 2)]), 3)).await.unwrap();
        let txns: Vec<u64> = h
            .sent()
            .into_iter()
            .filter_map(|m| match m {
                Message::RequestChunk(req) => Some(req.txn),
                _ => None,
            })
            .collect();
        assert_eq!(txns.len(), 2);
        assert!(txns[1] > txns[0]);

        h.send(FileChunk {
            path: "/f".into(),
            txn: txns[0],
            offset: 0,
            total_size: 3,
            data: b"old".to_vec(),
        })
        .await
        .unwrap();
        assert!(!h.file("/f").exists());

        h.send(FileChunk {
            path: "/f".into(),
            txn: txns[1],
            offset: 0,
            total_size: 3,
            data: b"new".to_vec(),
        })
        .await
        .unwrap();
        assert_eq!(tokio::fs::read(h.file("/f")).await.unwrap(), b"new");
        assert_eq!(h.store.get_version("/f").await.unwrap(), vv(&[(2, 2)]));
    }

    #[tokio::test]
    async fn test_concurrent_versions_record_conflict() {
        let mut h = Harness::default().await;
        h.map_ids().await;
        h.sent();

        h.store.mknod("/c", FileKind::Regular, true).await.unwrap();
        h.store.set_version("/c", &vv(&[(1, 2), (2, 1)])).await.unwrap();

        // Peer numbering: {remote:2, us:1} -> ours {2:2, 1:1}.
        h.send(node_info("/c", vv(&[(1, 2), (2, 1)]), 1)).await.unwrap();
        assert!(h.sent().is_empty());

        let conflicts = h.store.list_conflicts().await.unwrap();
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].path, "/c");
        assert_eq!(conflicts[0].peer, PeerId(2));
        assert_eq!(h.store.get_version("/c").await.unwrap(), vv(&[(1, 2), (2, 1)]));
    }

    #[tokio::test]
    async fn test_older_or_equal_is_ignored() {
        let mut h = Harness::default().await;
        h.map_ids().await;
        h.sent();

        h.store.mknod("/o", FileKind::Regular, true).await.unwrap();
        h.store.set_version("/o", &vv(&[(2, 3)])).await.unwrap();
        h.send(node_info("/o", vv(&[(1, 3)]), 1)).await.unwrap();
        h.send(node_info("/o", vv(&[(1, 1)]), 1)).await.unwrap();
        assert!(h.sent().is_empty());
    }

    #[tokio::test]
    async fn test_unmapped_peer_skips_announcement() {
        let mut h = Harness::default().await;
        h.sent();

        // Dropped, and the connection stays usable.
        h.send(node_info("/x", vv(&[(9, 1)]), 1)).await.unwrap();
        assert!(h.sent().is_empty());
        assert!(h.store.get_entry("/x").await.unwrap().is_none());

        h.map_ids().await;
        h.send(node_info("/x", vv(&[(1, 1)]), 1)).await.unwrap();
        assert!(matches!(h.sent().pop(), Some(Message::RequestChunk(_))));
    }

    #[tokio::test]
    async fn test_new_ids_rebroadcast_to_every_peer() {
        let mut h = Harness::default().await;
        let (_slots, other) = h.join_mesh();
        h.map_ids().await;
        h.sent();
        drain(&other);

        // The peer knows a third node we have never seen.
        let third = KeyFingerprint::of(b"third");
        let map = IdMap {
            peers: vec![
                IdMapEntry {
                    id: PeerId(1),
                    fingerprint: remote_key().fingerprint(),
                    display_name: "remote".into(),
                },
                IdMapEntry {
                    id: PeerId(7),
                    fingerprint: third,
                    display_name: "third".into(),
                },
            ],
        };
        h.send(map.clone()).await.unwrap();

        let sent = drain(&other);
        match &sent[..] {
            [Message::IdMap(m)] => {
                assert_eq!(m.peers.len(), 3);
                assert!(m.peers.iter().any(|p| p.fingerprint == third));
            }
            other => panic!("expected one IdMap, got {}", other.len()),
        }
        assert!(h.sent().iter().any(|m| matches!(m, Message::IdMap(_))));

        // Nothing new the second time.
        h.send(map).await.unwrap();
        assert!(drain(&other).is_empty());

        // Vectors naming the third node now translate.
        h.send(node_info("/t", vv(&[(7, 1)]), 1)).await.unwrap();
        let third_id = h.store.peer_by_fingerprint(&third).await.unwrap().unwrap().id;
        match h.sent().pop() {
            Some(Message::RequestChunk(req)) => assert_eq!(req.version, vv(&[(7, 1)])),
            _ => panic!("expected RequestChunk"),
        }
        let download = h.store.get_download("/t", PeerId(2)).await.unwrap().unwrap();
        assert_eq!(download.version, VersionVector::from_entries([(third_id, 1)]));
    }

    #[tokio::test]
    async fn test_promoted_file_relayed_to_other_peers() {
        let mut h = Harness::default().await;
        let (_slots, other) = h.join_mesh();
        h.map_ids().await;
        h.sent();
        drain(&other);

        h.send(node_info("/hop.txt", vv(&[(1, 1)]), 3)).await.unwrap();
        let txn = match h.sent().pop() {
            Some(Message::RequestChunk(req)) => req.txn,
            _ => panic!("expected RequestChunk"),
        };
        h.send(FileChunk {
            path: "/hop.txt".into(),
            txn,
            offset: 0,
            total_size: 3,
            data: b"hop".to_vec(),
        })
        .await
        .unwrap();

        match &drain(&other)[..] {
            [Message::NodeInfo(info)] => {
                assert_eq!(info.path, "/hop.txt");
                assert_eq!(info.size, 3);
                assert!(!info.deleted);
                // Our numbering: the source is our 2.
                assert_eq!(info.version, vv(&[(2, 1)]));
            }
            other => panic!("expected one NodeInfo, got {}", other.len()),
        }
        // The source is not told about its own change.
        assert!(h.sent().is_empty());

        h.send(NodeInfo {
            path: "/hop.txt".into(),
            kind: FileKind::Regular,
            size: 0,
            version: vv(&[(1, 2)]),
            deleted: true,
        })
        .await
        .unwrap();
        assert!(matches!(&drain(&other)[..], [Message::NodeInfo(i)] if i.deleted && i.version == vv(&[(2, 2)])));
    }

    #[tokio::test]
    async fn test_remote_tombstone_removes_content() {
        let mut h = Harness::default().await;
        h.map_ids().await;
        h.sent();

        h.store.mknod("/gone", FileKind::Regular, true).await.unwrap();
        h.store.set_version("/gone", &vv(&[(2, 1)])).await.unwrap();
        files::write_at(&h.file("/gone"), 0, b"bye").await.unwrap();

        h.send(NodeInfo {
            path: "/gone".into(),
            kind: FileKind::Regular,
            size: 0,
            version: vv(&[(1, 2)]),
            deleted: true,
        })
        .await
        .unwrap();

        assert!(!h.file("/gone").exists());
        let entry = h.store.get_entry("/gone").await.unwrap().unwrap();
        assert!(entry.deleted);
        assert_eq!(entry.version, vv(&[(2, 2)]));
    }

    #[tokio::test]
    async fn test_directory_adopted_without_transfer() {
        let mut h = Harness::default().await;
        h.map_ids().await;
        h.sent();

        h.send(NodeInfo {
            path: "/photos".into(),
            kind: FileKind::Directory,
            size: 0,
            version: vv(&[(1, 1)]),
            deleted: false,
        })
        .await
        .unwrap();
        assert!(h.sent().is_empty());
        assert!(h.file("/photos").is_dir());
        assert_eq!(h.store.get_version("/photos").await.unwrap(), vv(&[(2, 1)]));
    }

    #[tokio::test]
    async fn test_unsubscribed_path_gets_placeholder() {
        let mut h = Harness::new(ReplicationConfig {
            auto_subscribe: false,
            sync_on_connect: false,
            ..ReplicationConfig::default()
        })
        .await;
        h.map_ids().await;
        h.sent();

        h.send(node_info("/lazy", vv(&[(1, 1)]), 100)).await.unwrap();
        assert!(h.sent().is_empty());
        let entry = h.store.get_entry("/lazy").await.unwrap().unwrap();
        assert!(!entry.subscribed);
        assert!(entry.version.is_empty());
    }

    #[tokio::test]
    async fn test_serves_chunks_and_aborts_unknown() {
        let mut h = Harness::new(ReplicationConfig {
            chunk_size: 4,
            sync_on_connect: false,
            ..ReplicationConfig::default()
        })
        .await;
        h.sent();

        h.store.mknod("/served", FileKind::Regular, true).await.unwrap();
        files::write_at(&h.file("/served"), 0, b"0123456789").await.unwrap();

        h.send(RequestChunk {
            path: "/served".into(),
            txn: 5,
            offset: 8,
            version: VersionVector::new(),
        })
        .await
        .unwrap();
        match h.sent().pop() {
            Some(Message::FileChunk(chunk)) => {
                assert_eq!(chunk.txn, 5);
                assert_eq!(chunk.offset, 8);
                assert_eq!(chunk.total_size, 10);
                assert_eq!(chunk.data, b"89");
            }
            _ => panic!("expected FileChunk"),
        }

        h.send(RequestChunk {
            path: "/missing".into(),
            txn: 1,
            offset: 0,
            version: VersionVector::new(),
        })
        .await
        .unwrap();
        assert!(matches!(h.sent().pop(), Some(Message::TransferAbort(a)) if a.txn == 1));
    }

    #[tokio::test]
    async fn test_edit_during_transfer_aborts_it() {
        let mut h = Harness::new(ReplicationConfig {
            chunk_size: 4,
            sync_on_connect: false,
            ..ReplicationConfig::default()
        })
        .await;
        h.sent();

        h.store.mknod("/doc", FileKind::Regular, true).await.unwrap();
        let announced = h.store.bump_version("/doc", PeerId(1)).await.unwrap();
        files::write_at(&h.file("/doc"), 0, b"version one!").await.unwrap();

        h.send(RequestChunk {
            path: "/doc".into(),
            txn: 3,
            offset: 0,
            version: announced.clone(),
        })
        .await
        .unwrap();
        assert!(matches!(h.sent().pop(), Some(Message::FileChunk(c)) if c.data == b"vers"));

        // Rewritten locally before the next slice is asked for.
        files::write_at(&h.file("/doc"), 0, b"VERSION TWO!").await.unwrap();
        h.store.bump_version("/doc", PeerId(1)).await.unwrap();

        h.send(RequestChunk {
            path: "/doc".into(),
            txn: 3,
            offset: 4,
            version: announced,
        })
        .await
        .unwrap();
        match h.sent().pop() {
            Some(Message::TransferAbort(abort)) => {
                assert_eq!(abort.txn, 3);
                assert_eq!(abort.reason, "version changed");
            }
            _ => panic!("expected TransferAbort"),
        }
    }

    #[tokio::test]
    async fn test_transfer_abort_drops_download() {
        let mut h = Harness::default().await;
        h.map_ids().await;
        h.sent();

        h.send(node_info("/f", vv(&[(1, 1)]), 3)).await.unwrap();
        let txn = match h.sent().pop() {
            Some(Message::RequestChunk(req)) => req.txn,
            _ => panic!("expected RequestChunk"),
        };
        h.send(TransferAbort {
            path: "/f".into(),
            txn,
            reason: "not held".into(),
        })
        .await
        .unwrap();
        assert!(h.store.get_download("/f", PeerId(2)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_ping_and_foreign_messages() {
        let mut h = Harness::default().await;
        h.sent();

        h.send(Ping { nonce: 9 }).await.unwrap();
        assert!(matches!(h.sent().pop(), Some(Message::Pong(p)) if p.nonce == 9));

        let err = h.send(StartSync).await.unwrap_err();
        assert!(matches!(err, NetError::Protocol(_)));
    }
}
