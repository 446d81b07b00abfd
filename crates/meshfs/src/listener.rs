//! TCP accept loop.

use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use meshfs_net::{serve, ConnectionContext, ConnectionPool};

/// Accept connections until `shutdown` fires, running each on a pool slot.
///
/// A saturated pool refuses the socket immediately; nothing is queued.
pub(crate) async fn accept_loop(
    listener: TcpListener,
    pool: Arc<ConnectionPool>,
    ctx: Arc<ConnectionContext>,
    shutdown: CancellationToken,
) {
    let role = if ctx.local { "control" } else { "peer" };
    loop {
        let (stream, addr) = tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    tracing::warn!(role, "accept failed: {}", e);
                    continue;
                }
            },
        };

        let slot = match pool.try_acquire() {
            Some(slot) => slot,
            None => {
                tracing::warn!(role, addr = %addr, capacity = pool.capacity(), "connection pool exhausted, refusing");
                drop(stream);
                continue;
            }
        };
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(role, addr = %addr, "set_nodelay failed: {}", e);
        }
        tracing::debug!(role, addr = %addr, conn = slot.id(), "accepted");

        let ctx = ctx.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = serve(stream, Some(addr), slot, ctx, &shutdown).await {
                tracing::debug!(role, addr = %addr, "inbound connection ended: {}", e);
            }
        });
    }
    tracing::debug!(role, "listener stopped");
}
