//! Connection pool limits.

use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;

use meshfs::NodeError;
use meshfs_testkit::fixtures::{wait_for_peers, wait_until, TestNode, SETTLE_TIMEOUT};

#[tokio::test]
async fn test_saturated_pool_refuses_connections() {
    let a = TestNode::spawn_with("alpha", |config| config.max_peers = 1).await;
    let b = TestNode::spawn("beta").await;

    b.node.connect(a.addr()).await.unwrap();
    wait_for_peers(&a.node, 1).await;

    // The listener closes the socket without speaking.
    let mut raw = TcpStream::connect(a.addr()).await.unwrap();
    let mut buf = [0u8; 16];
    let read = tokio::time::timeout(Duration::from_secs(5), raw.read(&mut buf))
        .await
        .expect("refused socket should close promptly");
    assert!(matches!(read, Ok(0) | Err(_)));

    // Outbound dials need a slot too.
    let c = TestNode::spawn("gamma").await;
    assert!(matches!(
        a.node.connect(c.addr()).await,
        Err(NodeError::PoolExhausted)
    ));
    assert_eq!(a.node.active_peers(), 1);

    a.shutdown().await;
    b.shutdown().await;
    c.shutdown().await;
}

#[tokio::test]
async fn test_slot_reused_after_disconnect() {
    let a = TestNode::spawn_with("alpha", |config| config.max_peers = 1).await;
    let b = TestNode::spawn("beta").await;
    let c = TestNode::spawn("gamma").await;

    b.node.connect(a.addr()).await.unwrap();
    wait_for_peers(&a.node, 1).await;

    b.shutdown().await;
    let a_node = &a.node;
    let freed = wait_until(SETTLE_TIMEOUT, move || async move { a_node.active_peers() == 0 }).await;
    assert!(freed);

    // The slot is released once the old session has fully drained.
    let connected = wait_until(SETTLE_TIMEOUT, || {
        let c_node = c.node.clone();
        let addr = a.addr();
        async move {
            if c_node.active_peers() == 1 {
                return true;
            }
            let _ = c_node.connect(addr).await;
            tokio::time::sleep(Duration::from_millis(100)).await;
            c_node.active_peers() == 1
        }
    })
    .await;
    assert!(connected);
    wait_for_peers(&a.node, 1).await;

    a.shutdown().await;
    c.shutdown().await;
}
