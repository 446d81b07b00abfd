//! Connection lifecycle: handshake, then three cooperating tasks.
//!
//! - **listen** reads frames and pushes them onto the inbound queue.
//! - **shout** pops the outbound queue and writes frames.
//! - **worker** pops the inbound queue and runs the [`SessionHandler`].
//!
//! Teardown is ordered. When listen stops it queues [`Envelope::Quit`] for
//! shout; when shout stops it closes the outbound queue and queues `Quit` for
//! the worker. A fatal error anywhere cancels the connection's token, which
//! unblocks all three. The slot only returns to the pool after every task
//! has exited.

use std::net::SocketAddr;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;

use meshfs_crypto::RsaIdentity;

use crate::error::{NetError, Result};
use crate::handshake::{self, HandshakeParams, RemoteIdentity};
use crate::marshall::{framed, FrameReader, FrameWriter, MAX_FRAME_LEN};
use crate::messages::{Message, PRIORITY_BULK, PRIORITY_LEVELS};
use crate::pool::{ConnectionState, SlotGuard};
use crate::queue::{BoundedQueue, PriorityQueue};

/// Queue item: a message, or the sentinel that stops the consumer.
#[derive(Debug)]
pub enum Envelope {
    Message(Message),
    Quit,
}

/// Per-connection tuning.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Frame ceiling (at most 65535).
    pub max_frame_len: usize,
    /// Inbound queue capacity.
    pub inbound_capacity: usize,
    /// Outbound capacity per priority level.
    pub outbound_capacity: usize,
    /// Time allowed for the whole handshake.
    pub handshake_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            max_frame_len: MAX_FRAME_LEN,
            inbound_capacity: 64,
            outbound_capacity: 64,
            handshake_timeout: Duration::from_secs(15),
        }
    }
}

/// Cheap, cloneable reference to a live connection.
#[derive(Clone)]
pub struct ConnectionHandle {
    id: u64,
    remote: RemoteIdentity,
    peer_addr: Option<SocketAddr>,
    outbound: Arc<PriorityQueue<Envelope>>,
    cancel: CancellationToken,
}

impl ConnectionHandle {
    /// Build a handle over an existing outbound queue.
    ///
    /// [`serve`] does this for every connection; handlers under test can use
    /// it to observe what they send.
    pub fn new(
        id: u64,
        remote: RemoteIdentity,
        peer_addr: Option<SocketAddr>,
        outbound: Arc<PriorityQueue<Envelope>>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            id,
            remote,
            peer_addr,
            outbound,
            cancel,
        }
    }

    /// Connection id (unique per process run).
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Who is on the other end.
    pub fn remote(&self) -> &RemoteIdentity {
        &self.remote
    }

    /// Socket address of the other end, when known.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    /// Queue a message, waiting while its priority level is full.
    pub async fn send(&self, message: impl Into<Message>) -> Result<()> {
        let message = message.into();
        let level = message.priority();
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(NetError::Cancelled),
            res = self.outbound.push(level, Envelope::Message(message)) => {
                res.map_err(|_| NetError::Disconnected)
            }
        }
    }

    /// Queue a message only if there is room right now.
    ///
    /// Fails with [`NetError::QueueFull`] instead of waiting on a slow peer.
    pub fn try_send(&self, message: impl Into<Message>) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(NetError::Cancelled);
        }
        let message = message.into();
        let level = message.priority();
        match self.outbound.try_push(level, Envelope::Message(message)) {
            Ok(()) => Ok(()),
            Err(_) if self.outbound.is_closed() => Err(NetError::Disconnected),
            Err(_) => Err(NetError::QueueFull),
        }
    }

    /// Tear the connection down.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    /// Whether the connection has been torn down.
    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled() || self.outbound.is_closed()
    }
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.id)
            .field("remote", &self.remote.display_name())
            .field("peer_addr", &self.peer_addr)
            .finish()
    }
}

/// Application logic for one connection. Runs on the worker task only.
#[async_trait]
pub trait SessionHandler: Send {
    /// Called once, before the first inbound message.
    async fn on_open(&mut self, _conn: &ConnectionHandle) -> Result<()> {
        Ok(())
    }

    /// Handle one inbound message. An error tears the connection down.
    async fn handle(&mut self, message: Message, conn: &ConnectionHandle) -> Result<()>;

    /// Called once, after all three tasks have stopped.
    async fn on_close(&mut self, _conn: &ConnectionHandle) {}
}

/// Creates a [`SessionHandler`] for each authenticated connection.
#[async_trait]
pub trait HandlerFactory: Send + Sync {
    async fn open(&self, conn: &ConnectionHandle) -> Result<Box<dyn SessionHandler>>;
}

/// Everything a connection needs besides its socket.
pub struct ConnectionContext {
    pub config: ConnectionConfig,
    pub identity: Arc<RsaIdentity>,
    pub display_name: Arc<RwLock<String>>,
    pub factory: Arc<dyn HandlerFactory>,
    /// Local UI/CLI connections skip authentication.
    pub local: bool,
}

impl ConnectionContext {
    fn display_name(&self) -> String {
        self.display_name
            .read()
            .map(|name| name.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }
}

/// Run one connection to completion on an acquired pool slot.
///
/// `shutdown` is the process-wide terminate signal; the connection derives
/// its own child token from it.
pub async fn serve<S>(
    stream: S,
    peer_addr: Option<SocketAddr>,
    mut slot: SlotGuard,
    ctx: Arc<ConnectionContext>,
    shutdown: &CancellationToken,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let cancel = shutdown.child_token();
    let conn_id = slot.id();
    slot.set_state(ConnectionState::Handshaking);

    let (mut reader, mut writer) = framed(stream, ctx.config.max_frame_len, cancel.clone());
    let params = HandshakeParams {
        local: ctx.local,
        identity: &ctx.identity,
        display_name: ctx.display_name(),
        dh: slot.take_dh(),
    };
    let handshake = match tokio::time::timeout(
        ctx.config.handshake_timeout,
        handshake::perform(&mut reader, &mut writer, params),
    )
    .await
    {
        Ok(Ok(hs)) => hs,
        Ok(Err(e)) => {
            log_end(conn_id, "handshake", &e);
            return Err(e);
        }
        Err(_) => {
            tracing::warn!(conn = conn_id, ?peer_addr, "handshake timed out");
            return Err(NetError::HandshakeTimeout);
        }
    };
    tracing::info!(
        conn = conn_id,
        ?peer_addr,
        peer = handshake.remote.display_name(),
        local = handshake.remote.is_local(),
        "connection established"
    );

    let inbound = Arc::new(BoundedQueue::new(ctx.config.inbound_capacity));
    let outbound = Arc::new(PriorityQueue::new(
        PRIORITY_LEVELS,
        ctx.config.outbound_capacity,
    ));
    let handle = ConnectionHandle::new(
        conn_id,
        handshake.remote,
        peer_addr,
        outbound.clone(),
        cancel.clone(),
    );

    let mut handler = match ctx.factory.open(&handle).await {
        Ok(handler) => handler,
        Err(e) => {
            log_end(conn_id, "open", &e);
            return Err(e);
        }
    };
    slot.publish(handle.clone());

    let listen = tokio::spawn(listen_loop(
        conn_id,
        reader,
        inbound.clone(),
        outbound.clone(),
        cancel.clone(),
    ));
    let shout = tokio::spawn(shout_loop(
        conn_id,
        writer,
        inbound.clone(),
        outbound,
        cancel.clone(),
    ));

    let result = worker_loop(handler.as_mut(), &inbound, &handle, &cancel).await;
    slot.set_state(ConnectionState::Draining);
    if let Err(e) = &result {
        log_end(conn_id, "worker", e);
        cancel.cancel();
    }

    let _ = listen.await;
    let _ = shout.await;
    handler.on_close(&handle).await;
    cancel.cancel();
    tracing::info!(conn = conn_id, peer = handle.remote().display_name(), "connection closed");

    match result {
        Err(e) if !e.is_disconnect() => Err(e),
        _ => Ok(()),
    }
}

fn log_end(conn: u64, stage: &'static str, e: &NetError) {
    if e.is_disconnect() {
        tracing::info!(conn, stage, "peer went away: {}", e);
    } else {
        tracing::warn!(conn, stage, "dropping connection: {}", e);
    }
}

async fn listen_loop<R>(
    conn: u64,
    mut reader: FrameReader<R>,
    inbound: Arc<BoundedQueue<Envelope>>,
    outbound: Arc<PriorityQueue<Envelope>>,
    cancel: CancellationToken,
) where
    R: AsyncRead + Unpin,
{
    loop {
        match reader.read().await {
            Ok(message) => {
                tracing::trace!(conn, kind = ?message.kind(), "received");
                let pushed = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => false,
                    res = inbound.push(Envelope::Message(message)) => res.is_ok(),
                };
                if !pushed {
                    break;
                }
            }
            Err(e) => {
                log_end(conn, "listen", &e);
                if !e.is_disconnect() {
                    cancel.cancel();
                }
                break;
            }
        }
    }

    tokio::select! {
        biased;
        _ = cancel.cancelled() => {}
        _ = outbound.push(PRIORITY_BULK, Envelope::Quit) => {}
    }
}

async fn shout_loop<W>(
    conn: u64,
    mut writer: FrameWriter<W>,
    inbound: Arc<BoundedQueue<Envelope>>,
    outbound: Arc<PriorityQueue<Envelope>>,
    cancel: CancellationToken,
) where
    W: AsyncWrite + Unpin,
{
    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            envelope = outbound.pop() => envelope,
        };
        let message = match next {
            Some(Envelope::Message(message)) => message,
            Some(Envelope::Quit) | None => break,
        };
        if let Err(e) = writer.write(&message).await {
            log_end(conn, "shout", &e);
            if !e.is_disconnect() {
                cancel.cancel();
            }
            break;
        }
    }

    outbound.close();
    let _ = writer.shutdown().await;
    tokio::select! {
        biased;
        _ = cancel.cancelled() => {}
        _ = inbound.push(Envelope::Quit) => {}
    }
}

async fn worker_loop(
    handler: &mut dyn SessionHandler,
    inbound: &BoundedQueue<Envelope>,
    conn: &ConnectionHandle,
    cancel: &CancellationToken,
) -> Result<()> {
    handler.on_open(conn).await?;
    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(()),
            envelope = inbound.pop() => envelope,
        };
        match next {
            Some(Envelope::Message(message)) => {
                let kind = message.kind();
                handler.handle(message, conn).await.map_err(|e| {
                    tracing::debug!(conn = conn.id(), ?kind, "handler failed");
                    e
                })?;
            }
            Some(Envelope::Quit) | None => return Ok(()),
        }
    }
}
