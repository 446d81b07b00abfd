//! The Node: one running meshfs backend.
//!
//! A node owns the metadata store, the RSA identity, the peer connection
//! pool and the background job worker, and exposes the local mutation API a
//! filesystem adapter calls into.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use meshfs_core::{
    normalize, Conflict, CoreError, FileKind, KeyFingerprint, PeerId, VersionVector, ROOT,
};
use meshfs_crypto::RsaIdentity;
use meshfs_net::messages::{BackendInfo, NodeInfo, PeerSummary, RequestTree};
use meshfs_net::{serve, ConnectionContext, ConnectionPool, Message};
use meshfs_store::{MetaStore, SqliteStore};
use meshfs_sync::{files, Job, JobQueue, JobWorker, Replicator};

use crate::config::NodeConfig;
use crate::control::ControlFactory;
use crate::error::{NodeError, Result};
use crate::listener::accept_loop;

/// Concurrent local UI/CLI connections.
const CONTROL_SLOTS: usize = 4;

/// Pending background jobs before submitters wait.
const JOB_QUEUE_CAPACITY: usize = 256;

/// How long shutdown waits for connections to drain.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Default)]
struct Bound {
    listen: Option<SocketAddr>,
    control: Option<SocketAddr>,
}

struct NodeInner {
    config: NodeConfig,
    store: Arc<dyn MetaStore>,
    identity: Arc<RsaIdentity>,
    local_id: PeerId,
    display_name: Arc<RwLock<String>>,
    pool: Arc<ConnectionPool>,
    control_pool: Arc<ConnectionPool>,
    peer_ctx: Arc<ConnectionContext>,
    jobs: JobQueue,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    bound: Mutex<Bound>,
    pending_data_dir: Mutex<Option<PathBuf>>,
}

/// A running meshfs backend. Cheap to clone.
#[derive(Clone)]
pub struct Node {
    inner: Arc<NodeInner>,
}

impl Node {
    /// Open the node's data directory, loading (or creating) its identity
    /// and metadata. Starts the job worker but binds no sockets.
    pub async fn open(config: NodeConfig) -> Result<Self> {
        config.validate()?;
        for dir in [config.data_dir.clone(), config.stage_dir(), config.root_dir()] {
            tokio::fs::create_dir_all(&dir).await?;
        }

        let store: Arc<dyn MetaStore> = Arc::new(SqliteStore::open(config.db_path())?);
        let identity_path = config.identity_path();
        let bits = config.rsa_bits;
        let identity = tokio::task::spawn_blocking(move || {
            RsaIdentity::load_or_generate(&identity_path, bits)
        })
        .await
        .map_err(|e| NodeError::Task(e.to_string()))??;
        let identity = Arc::new(identity);

        // On a fresh store this makes the local node id 1.
        let local_id = store
            .register_peer(&identity.fingerprint(), &config.display_name)
            .await?;

        let shutdown = CancellationToken::new();
        let pool = ConnectionPool::new(config.max_peers);
        let (worker, jobs) =
            JobWorker::new(store.clone(), config.root_dir(), pool.clone(), JOB_QUEUE_CAPACITY);
        let worker_task = tokio::spawn(worker.run(shutdown.clone()));

        let replicator = Replicator::new(
            store.clone(),
            local_id,
            config.root_dir(),
            config.stage_dir(),
            config.replication(),
            pool.clone(),
            jobs.clone(),
        );
        let display_name = Arc::new(RwLock::new(config.display_name.clone()));
        let peer_ctx = Arc::new(ConnectionContext {
            config: config.connection(),
            identity: identity.clone(),
            display_name: display_name.clone(),
            factory: Arc::new(replicator),
            local: false,
        });

        tracing::info!(
            name = %config.display_name,
            fingerprint = %identity.fingerprint(),
            local_id = local_id.get(),
            data_dir = %config.data_dir.display(),
            "node opened"
        );

        Ok(Self {
            inner: Arc::new(NodeInner {
                config,
                store,
                identity,
                local_id,
                display_name,
                pool,
                control_pool: ConnectionPool::new(CONTROL_SLOTS),
                peer_ctx,
                jobs,
                shutdown,
                tasks: Mutex::new(vec![worker_task]),
                bound: Mutex::new(Bound::default()),
                pending_data_dir: Mutex::new(None),
            }),
        })
    }

    /// Open and start in one step.
    pub async fn spawn(config: NodeConfig) -> Result<Self> {
        let node = Self::open(config).await?;
        node.start().await?;
        Ok(node)
    }

    /// Bind the peer listener (and the control listener, if configured) and
    /// start the keepalive ticker. Returns the bound peer address.
    pub async fn start(&self) -> Result<SocketAddr> {
        let config = &self.inner.config;
        let listener = TcpListener::bind(config.listen_addr).await?;
        let listen = listener.local_addr()?;
        tracing::info!(addr = %listen, max_peers = config.max_peers, "listening for peers");
        self.track(tokio::spawn(accept_loop(
            listener,
            self.inner.pool.clone(),
            self.inner.peer_ctx.clone(),
            self.inner.shutdown.clone(),
        )));

        let mut control = None;
        if let Some(addr) = config.control_addr {
            let listener = TcpListener::bind(addr).await?;
            let bound = listener.local_addr()?;
            tracing::info!(addr = %bound, "listening for local control");
            let ctx = Arc::new(ConnectionContext {
                config: config.connection(),
                identity: self.inner.identity.clone(),
                display_name: self.inner.display_name.clone(),
                factory: Arc::new(ControlFactory::new(self.clone())),
                local: true,
            });
            self.track(tokio::spawn(accept_loop(
                listener,
                self.inner.control_pool.clone(),
                ctx,
                self.inner.shutdown.clone(),
            )));
            control = Some(bound);
        }

        if let Some(period) = config.ping_interval() {
            self.track(tokio::spawn(ping_loop(
                self.inner.jobs.clone(),
                period,
                self.inner.shutdown.clone(),
            )));
        }

        *lock(&self.inner.bound) = Bound {
            listen: Some(listen),
            control,
        };
        Ok(listen)
    }

    fn track(&self, task: JoinHandle<()>) {
        lock(&self.inner.tasks).push(task);
    }

    /// Dial a peer. The handshake and session run in the background.
    pub async fn connect(&self, addr: SocketAddr) -> Result<()> {
        if self.inner.shutdown.is_cancelled() {
            return Err(NodeError::ShuttingDown);
        }
        let slot = self
            .inner
            .pool
            .try_acquire()
            .ok_or(NodeError::PoolExhausted)?;
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        tracing::debug!(addr = %addr, conn = slot.id(), "dialed peer");

        let ctx = self.inner.peer_ctx.clone();
        let shutdown = self.inner.shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = serve(stream, Some(addr), slot, ctx, &shutdown).await {
                tracing::debug!(addr = %addr, "outbound connection ended: {}", e);
            }
        });
        Ok(())
    }

    /// Resolve `host:port` and dial the first address.
    pub async fn connect_to(&self, target: &str) -> Result<()> {
        let addr = tokio::net::lookup_host(target)
            .await?
            .next()
            .ok_or_else(|| NodeError::NotFound(target.to_string()))?;
        self.connect(addr).await
    }

    /// Stop listening, close every connection and wait for them to drain.
    pub async fn shutdown(&self) {
        tracing::info!("node shutting down");
        self.inner.shutdown.cancel();
        self.inner.pool.close_all();
        self.inner.control_pool.close_all();

        let tasks = std::mem::take(&mut *lock(&self.inner.tasks));
        for task in tasks {
            let _ = task.await;
        }

        let drained = tokio::time::timeout(DRAIN_TIMEOUT, async {
            for pool in [&self.inner.pool, &self.inner.control_pool] {
                while pool.idle_count() < pool.capacity() {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            }
        })
        .await;
        if drained.is_err() {
            tracing::warn!("connections still draining after shutdown timeout");
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Local Mutations
    // ─────────────────────────────────────────────────────────────────────────

    /// Write a whole file under the sync root and announce the new version.
    pub async fn write_file(&self, path: &str, data: &[u8]) -> Result<VersionVector> {
        let path = tree_path(path)?;
        let file = files::local_path(&self.root_dir(), &path);
        if let Some(dir) = file.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }
        tokio::fs::write(&file, data).await?;
        self.record_local_write(&path, FileKind::Regular).await
    }

    /// Create a directory under the sync root and announce it.
    pub async fn mkdir(&self, path: &str) -> Result<VersionVector> {
        let path = tree_path(path)?;
        tokio::fs::create_dir_all(files::local_path(&self.root_dir(), &path)).await?;
        self.record_local_write(&path, FileKind::Directory).await
    }

    /// Record that local content at `path` changed.
    ///
    /// Creates (or revives) the entry, bumps the local counter and announces
    /// the new version to every connected peer.
    pub async fn record_local_write(&self, path: &str, kind: FileKind) -> Result<VersionVector> {
        let path = tree_path(path)?;
        let store = &self.inner.store;
        if !store.mknod(&path, kind, true).await? {
            store.set_subscribed(&path, true).await?;
        }
        let version = store.bump_version(&path, self.inner.local_id).await?;
        tracing::debug!(path = %path, version = ?version, "local write");
        self.announce(&path, kind, &version, false).await;
        Ok(version)
    }

    /// Delete `path`, leaving a tombstone that propagates to peers.
    pub async fn unlink(&self, path: &str) -> Result<VersionVector> {
        let path = tree_path(path)?;
        let store = &self.inner.store;
        let entry = store
            .get_entry(&path)
            .await?
            .filter(|e| e.is_live())
            .ok_or_else(|| NodeError::NotFound(path.clone()))?;
        let version = store
            .unlink(&path, self.inner.local_id)
            .await?
            .ok_or_else(|| NodeError::NotFound(path.clone()))?;
        files::remove(&files::local_path(&self.root_dir(), &path)).await?;
        self.announce(&path, entry.kind, &version, true).await;
        Ok(version)
    }

    /// Read a replicated file.
    pub async fn read_file(&self, path: &str) -> Result<Vec<u8>> {
        let path = normalize(path)?;
        Ok(tokio::fs::read(files::local_path(&self.root_dir(), &path)).await?)
    }

    /// Whether `path` is live and replicated locally.
    pub async fn is_subscribed(&self, path: &str) -> Result<bool> {
        Ok(self
            .inner
            .store
            .get_entry(path)
            .await?
            .map_or(false, |e| e.is_live() && e.subscribed))
    }

    /// Change whether `path` is replicated locally. Subscribing asks every
    /// peer to re-announce the path so its content gets pulled.
    pub async fn set_subscribed(&self, path: &str, on: bool) -> Result<bool> {
        let path = normalize(path)?;
        let changed = self.inner.store.set_subscribed(&path, on).await?;
        if changed && on {
            self.inner
                .pool
                .broadcast(&Message::from(RequestTree { path }))
                .await;
        }
        Ok(changed)
    }

    /// Version vector of `path` (empty if unknown).
    pub async fn version_of(&self, path: &str) -> Result<VersionVector> {
        Ok(self.inner.store.get_version(path).await?)
    }

    async fn announce(&self, path: &str, kind: FileKind, version: &VersionVector, deleted: bool) {
        let size = if !deleted && kind.has_content() {
            files::size_of(&files::local_path(&self.root_dir(), path)).await
        } else {
            0
        };
        let info = NodeInfo {
            path: path.to_string(),
            kind,
            size,
            version: version.clone(),
            deleted,
        };
        let sent = self.inner.pool.broadcast(&Message::from(info)).await;
        tracing::debug!(path = %path, deleted, sent, "announced");
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Control
    // ─────────────────────────────────────────────────────────────────────────

    /// Ask every connected peer for its whole tree. Returns how many were asked.
    pub async fn start_sync(&self) -> usize {
        self.inner
            .pool
            .broadcast(&Message::from(RequestTree { path: ROOT.into() }))
            .await
    }

    /// Queue a keepalive round.
    pub async fn ping_peers(&self) -> Result<()> {
        Ok(self.inner.jobs.submit(Job::PingAll).await?)
    }

    /// Change the name announced to peers on new connections.
    pub async fn set_display_name(&self, name: &str) -> Result<()> {
        let name = name.trim();
        if name.is_empty() {
            return Err(NodeError::Config("display name must not be empty".into()));
        }
        self.inner
            .store
            .register_peer(&self.fingerprint(), name)
            .await?;
        *self
            .inner
            .display_name
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = name.to_string();
        tracing::info!(name = %name, "display name changed");
        Ok(())
    }

    /// Record a new data directory, used from the next start.
    ///
    /// Returns whether the change was written to the config file.
    pub fn set_data_dir(&self, path: &str) -> Result<bool> {
        let path = PathBuf::from(path);
        let mut next = self.inner.config.clone();
        next.data_dir = path.clone();
        let saved = next.save()?;
        *lock(&self.inner.pending_data_dir) = Some(path);
        Ok(saved)
    }

    /// Data directory recorded for the next start, if changed.
    pub fn pending_data_dir(&self) -> Option<PathBuf> {
        lock(&self.inner.pending_data_dir).clone()
    }

    /// Every known peer except this node.
    pub async fn peers(&self) -> Result<Vec<PeerSummary>> {
        let connected: Vec<KeyFingerprint> = self
            .inner
            .pool
            .peer_handles()
            .iter()
            .filter_map(|h| h.remote().fingerprint())
            .collect();
        Ok(self
            .inner
            .store
            .list_peers()
            .await?
            .into_iter()
            .filter(|p| p.id != self.inner.local_id)
            .map(|p| PeerSummary {
                id: p.id,
                fingerprint: p.fingerprint.to_hex(),
                connected: connected.contains(&p.fingerprint),
                display_name: p.display_name,
            })
            .collect())
    }

    /// Every recorded conflict.
    pub async fn conflicts(&self) -> Result<Vec<Conflict>> {
        Ok(self.inner.store.list_conflicts().await?)
    }

    /// Summary for the local UI.
    pub fn backend_info(&self) -> BackendInfo {
        let config = &self.inner.config;
        BackendInfo {
            display_name: self.display_name(),
            fingerprint: self.fingerprint().to_hex(),
            listen_addr: self
                .listen_addr()
                .unwrap_or(config.listen_addr)
                .to_string(),
            data_dir: config.data_dir.display().to_string(),
            active_connections: self.active_peers() as u32,
            max_peers: config.max_peers as u32,
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Accessors
    // ─────────────────────────────────────────────────────────────────────────

    /// This node's id in its own numbering.
    pub fn local_id(&self) -> PeerId {
        self.inner.local_id
    }

    /// Fingerprint of this node's public key.
    pub fn fingerprint(&self) -> KeyFingerprint {
        self.inner.identity.fingerprint()
    }

    /// Current display name.
    pub fn display_name(&self) -> String {
        self.inner
            .display_name
            .read()
            .map(|name| name.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }

    /// Bound peer listener address, once started.
    pub fn listen_addr(&self) -> Option<SocketAddr> {
        lock(&self.inner.bound).listen
    }

    /// Bound control listener address, once started.
    pub fn control_addr(&self) -> Option<SocketAddr> {
        lock(&self.inner.bound).control
    }

    /// Number of authenticated peer connections.
    pub fn active_peers(&self) -> usize {
        self.inner.pool.peer_handles().len()
    }

    /// The configuration the node runs with.
    pub fn config(&self) -> &NodeConfig {
        &self.inner.config
    }

    /// Root of the replicated tree on disk.
    pub fn root_dir(&self) -> PathBuf {
        self.inner.config.root_dir()
    }

    /// The metadata store.
    pub fn store(&self) -> &Arc<dyn MetaStore> {
        &self.inner.store
    }
}

/// Normalize a path a local caller wants to mutate. The root is fixed.
fn tree_path(path: &str) -> Result<String> {
    let path = normalize(path)?;
    if path == ROOT {
        return Err(CoreError::InvalidPath(path).into());
    }
    Ok(path)
}

async fn ping_loop(jobs: JobQueue, period: Duration, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(period);
    // The first tick fires immediately; nobody is connected yet.
    ticker.tick().await;
    loop {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                if !jobs.try_submit(Job::PingAll) {
                    tracing::debug!("job queue full, skipping ping round");
                }
            }
        }
    }
}
