//! In-memory link pair
//!
//! Two cross-wired channel ends implementing `Link`, used by the test
//! suites and by loopback wiring between co-resident engines. Also the
//! reference implementation transport adapters are measured against: no
//! ordering or reliability beyond what a channel gives.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex, Notify};

use lib_crypto::PublicKey;

use crate::transport::{CostClass, Link};

const CHANNEL_DEPTH: usize = 1024;

pub struct MemoryLink {
    tx: mpsc::Sender<Vec<u8>>,
    rx: Mutex<mpsc::Receiver<Vec<u8>>>,
    address: String,
    mtu: usize,
    cost: CostClass,
    closed: AtomicBool,
    closed_notify: Notify,
}

impl MemoryLink {
    /// Build both ends of a link. `addr_a`/`addr_b` become the respective
    /// `address()` values (the far endpoint each side talks to).
    pub fn pair(
        addr_a: &str,
        addr_b: &str,
        mtu: usize,
        cost: CostClass,
    ) -> (MemoryLink, MemoryLink) {
        let (tx_ab, rx_ab) = mpsc::channel(CHANNEL_DEPTH);
        let (tx_ba, rx_ba) = mpsc::channel(CHANNEL_DEPTH);

        let a = MemoryLink {
            tx: tx_ab,
            rx: Mutex::new(rx_ba),
            address: addr_b.to_string(),
            mtu,
            cost,
            closed: AtomicBool::new(false),
            closed_notify: Notify::new(),
        };
        let b = MemoryLink {
            tx: tx_ba,
            rx: Mutex::new(rx_ab),
            address: addr_a.to_string(),
            mtu,
            cost,
            closed: AtomicBool::new(false),
            closed_notify: Notify::new(),
        };
        (a, b)
    }
}

#[async_trait]
impl Link for MemoryLink {
    async fn send(&self, bytes: &[u8]) -> anyhow::Result<()> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(anyhow::anyhow!("link closed"));
        }
        self.tx
            .send(bytes.to_vec())
            .await
            .map_err(|_| anyhow::anyhow!("far side closed"))
    }

    async fn recv(&self) -> Option<Vec<u8>> {
        if self.closed.load(Ordering::Relaxed) {
            return None;
        }
        // close() must not need the rx lock (a pump may be parked inside
        // recv), so closure is signalled out-of-band.
        let mut rx = self.rx.lock().await;
        tokio::select! {
            received = rx.recv() => received,
            _ = self.closed_notify.notified() => None,
        }
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Relaxed);
        self.closed_notify.notify_waiters();
    }

    fn remote_peer_id(&self) -> Option<PublicKey> {
        None
    }

    fn mtu(&self) -> usize {
        self.mtu
    }

    fn cost_class(&self) -> CostClass {
        self.cost
    }

    fn address(&self) -> String {
        self.address.clone()
    }
}
