//! Test fixtures and helpers.
//!
//! Common setup code for integration tests.

use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;

use tempfile::TempDir;

use meshfs::{Node, NodeConfig};

/// How long helpers wait for the mesh to settle.
pub const SETTLE_TIMEOUT: Duration = Duration::from_secs(10);

/// Configuration for a node confined to `dir` and loopback.
///
/// Both listeners bind ephemeral ports, keys are small so tests stay fast,
/// and keepalive pings are off.
pub fn test_config(dir: &TempDir, name: &str) -> NodeConfig {
    NodeConfig {
        listen_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
        control_addr: Some(SocketAddr::from(([127, 0, 0, 1], 0))),
        data_dir: dir.path().join("data"),
        display_name: name.to_string(),
        rsa_bits: 1024,
        ping_interval_secs: 0,
        ..NodeConfig::default()
    }
}

/// A started node and the directory backing it.
pub struct TestNode {
    pub node: Node,
    pub dir: TempDir,
}

impl TestNode {
    /// Start a node with [`test_config`].
    pub async fn spawn(name: &str) -> Self {
        Self::spawn_with(name, |_| {}).await
    }

    /// Start a node after adjusting its configuration.
    pub async fn spawn_with(name: &str, configure: impl FnOnce(&mut NodeConfig)) -> Self {
        let dir = TempDir::new().expect("create temp dir");
        let mut config = test_config(&dir, name);
        configure(&mut config);
        let node = Node::spawn(config).await.expect("spawn node");
        Self { node, dir }
    }

    /// Bound peer listener address.
    pub fn addr(&self) -> SocketAddr {
        self.node.listen_addr().expect("node is started")
    }

    /// Bound control listener address.
    pub fn control_addr(&self) -> SocketAddr {
        self.node.control_addr().expect("control listener enabled")
    }

    /// Stop the node, keeping its data directory until `self` drops.
    pub async fn shutdown(&self) {
        self.node.shutdown().await;
    }
}

/// Poll `condition` until it holds or `timeout` passes.
pub async fn wait_until<F, Fut>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition().await {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Wait until `node` has `count` authenticated peers, panicking on timeout.
pub async fn wait_for_peers(node: &Node, count: usize) {
    let settled = wait_until(SETTLE_TIMEOUT, move || async move { node.active_peers() == count }).await;
    assert!(
        settled,
        "expected {} peers, have {}",
        count,
        node.active_peers()
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_nodes_get_distinct_identities() {
        let a = TestNode::spawn("a").await;
        let b = TestNode::spawn("b").await;

        assert_ne!(a.node.fingerprint(), b.node.fingerprint());
        assert_ne!(a.addr(), b.addr());
        assert_eq!(a.node.display_name(), "a");

        a.shutdown().await;
        b.shutdown().await;
    }

    #[tokio::test]
    async fn test_wait_until_times_out() {
        let held = wait_until(Duration::from_millis(50), || async { false }).await;
        assert!(!held);
        let held = wait_until(Duration::from_millis(50), || async { true }).await;
        assert!(held);
    }
}
