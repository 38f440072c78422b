//! Shared test utilities for integration tests.
//!
//! Provides node spawn helpers over ephemeral loopback ports and
//! convergence polling.

#![allow(dead_code)]

use meshmap::{PeerAddress, Replicator, ReplicatorConfig, SharedMap};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Install a test tracing subscriber once per binary.
pub fn init_tracing() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// One running node: its map plus the replicator driving it.
pub struct TestNode {
    pub map: Arc<SharedMap>,
    pub replicator: Replicator<SharedMap>,
}

impl TestNode {
    /// The node's bound TCP listener address, as dialable from loopback.
    pub fn addr(&self) -> SocketAddr {
        let mut addr = self.replicator.local_addr().expect("listener bound");
        if addr.ip().is_unspecified() {
            addr.set_ip(std::net::IpAddr::V4(std::net::Ipv4Addr::LOCALHOST));
        }
        addr
    }

    pub async fn shutdown(mut self) {
        self.replicator.shutdown().await;
    }
}

/// Spawn a node with an ephemeral listen port and the given outbound peers.
pub async fn spawn_node(identifier: u8, peers: &[SocketAddr]) -> TestNode {
    spawn_node_with(identifier, peers, |_| {}).await
}

/// Spawn a node, letting the caller adjust the config first.
pub async fn spawn_node_with(
    identifier: u8,
    peers: &[SocketAddr],
    adjust: impl FnOnce(&mut ReplicatorConfig),
) -> TestNode {
    init_tracing();
    let map = Arc::new(SharedMap::new(identifier));
    let mut config = ReplicatorConfig::for_testing(identifier);
    config.peers = peers
        .iter()
        .map(|a| PeerAddress::new(a.ip().to_string(), a.port()))
        .collect();
    adjust(&mut config);

    let mut replicator = Replicator::new(config, Arc::clone(&map));
    replicator
        .start()
        .await
        .unwrap_or_else(|e| panic!("node {identifier} failed to start: {e}"));
    TestNode { map, replicator }
}

/// Poll `cond` until it holds or the timeout elapses.
pub async fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    cond()
}

/// Assert that every map holds the same live entries within the timeout.
pub async fn assert_converged(maps: &[&Arc<SharedMap>], timeout: Duration) {
    let converged = wait_until(timeout, || {
        let first = maps[0].live_entries();
        maps.iter().all(|m| m.live_entries() == first)
    })
    .await;
    if !converged {
        let sizes: Vec<usize> = maps.iter().map(|m| m.live_entries().len()).collect();
        panic!("maps did not converge within {timeout:?} (live entry counts: {sizes:?})");
    }
}
