//! Shared helpers for engine integration tests
#![allow(dead_code)]

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use lib_network::{CostClass, MemoryLink, MeshConfig, WeftMeshEngine};

static LINK_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Engine with fast maintenance for tests, rooted in its own tempdir
pub async fn test_engine() -> (WeftMeshEngine, TempDir) {
    test_engine_with(|_| {}).await
}

pub async fn test_engine_with(tweak: impl FnOnce(&mut MeshConfig)) -> (WeftMeshEngine, TempDir) {
    let dir = TempDir::new().expect("tempdir");
    let mut config = MeshConfig {
        maintenance_interval: Duration::from_millis(100),
        ..MeshConfig::default()
    };
    tweak(&mut config);
    let engine = WeftMeshEngine::init(config, dir.path(), "test passphrase")
        .await
        .expect("engine init");
    engine.run().await.expect("engine run");
    (engine, dir)
}

/// Wire two engines together over a fresh in-memory link pair and wait for
/// the light-ping to promote both sides.
pub async fn connect(a: &WeftMeshEngine, b: &WeftMeshEngine) {
    let n = LINK_COUNTER.fetch_add(1, Ordering::Relaxed);
    let (la, lb) = MemoryLink::pair(
        &format!("mem://{n}-a"),
        &format!("mem://{n}-b"),
        65_536,
        CostClass::DirectLocal,
    );
    a.attach_link(Arc::new(la)).await.expect("attach a");
    b.attach_link(Arc::new(lb)).await.expect("attach b");

    let a_id = a.local_peer_id().await;
    let b_id = b.local_peer_id().await;
    assert!(
        wait_until(5_000, || async {
            a.is_peer_connected(&b_id).await && b.is_peer_connected(&a_id).await
        })
        .await,
        "light-ping did not complete"
    );
}

/// Poll an async condition until it holds or the timeout passes
pub async fn wait_until<F, Fut>(timeout_ms: u64, mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_millis(timeout_ms);
    while tokio::time::Instant::now() < deadline {
        if condition().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    false
}
