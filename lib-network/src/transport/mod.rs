//! Transport multiplexer
//!
//! Transports themselves (how a data channel or GATT link comes up) live
//! outside the engine; they hand in `Link` instances. The multiplexer
//! tracks which links reach which peers, promotes links from tentative to
//! active once the light-ping completes, picks the cheapest link for
//! unicast, and rotates across a peer's links for broadcast so one
//! asymmetric transport does not amplify every flood.

pub mod memory;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;

use lib_crypto::PublicKey;

pub use memory::MemoryLink;

/// Relative cost of pushing a byte through a link, cheapest first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum CostClass {
    DirectLocal,
    DirectInternet,
    RadioShortRange,
}

/// One bidirectional byte pipe to a neighbor. Implementations are supplied
/// by transport adapters; the engine only ever sees this trait.
#[async_trait]
pub trait Link: Send + Sync {
    /// Push one encoded frame. Errors mean the link is unusable.
    async fn send(&self, bytes: &[u8]) -> anyhow::Result<()>;

    /// Receive the next inbound byte string; `None` when the link closed
    async fn recv(&self) -> Option<Vec<u8>>;

    async fn close(&self);

    /// Far-side peer id when the transport knows it a priori (most do not;
    /// the light-ping fills it in)
    fn remote_peer_id(&self) -> Option<PublicKey>;

    /// Largest frame this link carries in one piece
    fn mtu(&self) -> usize;

    fn cost_class(&self) -> CostClass;

    /// Transport endpoint descriptor, recorded in the ledger as a
    /// watering-hole address
    fn address(&self) -> String;
}

/// Opaque handle naming an attached link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LinkId(pub u64);

#[derive(Debug, Clone)]
pub enum LinkState {
    /// Attached, ping outstanding; only control traffic is trusted
    Tentative { challenge: [u8; 16], since: Instant },
    /// Ping answered; full traffic
    Active,
}

struct LinkEntry {
    link: Arc<dyn Link>,
    peer: Option<PublicKey>,
    state: LinkState,
}

/// Registry of live links, shared across engine tasks
#[derive(Default)]
pub struct TransportMux {
    links: RwLock<HashMap<LinkId, LinkEntry>>,
    next_id: AtomicU64,
    rotation: AtomicUsize,
}

impl TransportMux {
    pub fn new() -> Self {
        TransportMux::default()
    }

    /// Register a link in tentative state with its outstanding challenge
    pub fn attach(&self, link: Arc<dyn Link>, challenge: [u8; 16], now: Instant) -> LinkId {
        let id = LinkId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let peer = link.remote_peer_id();
        self.links.write().insert(
            id,
            LinkEntry {
                link,
                peer,
                state: LinkState::Tentative { challenge, since: now },
            },
        );
        id
    }

    /// Remove a link; returns the peer it served, if identified
    pub fn detach(&self, id: LinkId) -> Option<PublicKey> {
        self.links.write().remove(&id).and_then(|entry| entry.peer)
    }

    /// Promote a tentative link whose challenge was answered. Returns false
    /// when the id is unknown or the challenge does not match.
    pub fn activate(&self, id: LinkId, peer: PublicKey, challenge: &[u8; 16]) -> bool {
        let mut links = self.links.write();
        let Some(entry) = links.get_mut(&id) else {
            return false;
        };
        match entry.state {
            LinkState::Tentative { challenge: expected, .. } if expected == *challenge => {
                entry.state = LinkState::Active;
                entry.peer = Some(peer);
                debug!(peer = %peer.fingerprint(), link = id.0, "link active");
                true
            }
            LinkState::Active => {
                entry.peer = Some(peer);
                true
            }
            _ => false,
        }
    }

    pub fn link(&self, id: LinkId) -> Option<Arc<dyn Link>> {
        self.links.read().get(&id).map(|entry| entry.link.clone())
    }

    /// Peer identified on a link, if any
    pub fn peer_of(&self, id: LinkId) -> Option<PublicKey> {
        self.links.read().get(&id).and_then(|entry| entry.peer)
    }

    pub fn is_active(&self, id: LinkId) -> bool {
        matches!(
            self.links.read().get(&id).map(|e| &e.state),
            Some(LinkState::Active)
        )
    }

    /// Cheapest active link reaching the peer
    pub fn best_link_for(&self, peer: &PublicKey) -> Option<(LinkId, Arc<dyn Link>)> {
        self.links
            .read()
            .iter()
            .filter(|(_, entry)| {
                matches!(entry.state, LinkState::Active) && entry.peer.as_ref() == Some(peer)
            })
            .min_by_key(|(_, entry)| entry.link.cost_class())
            .map(|(id, entry)| (*id, entry.link.clone()))
    }

    /// One active link per peer for flooding, excluding `exclude`. When a
    /// peer has several links the choice rotates per call.
    pub fn flood_targets(&self, exclude: Option<&PublicKey>) -> Vec<(LinkId, PublicKey, Arc<dyn Link>)> {
        let links = self.links.read();
        let mut per_peer: HashMap<PublicKey, Vec<(LinkId, Arc<dyn Link>)>> = HashMap::new();
        for (id, entry) in links.iter() {
            let (Some(peer), LinkState::Active) = (entry.peer, &entry.state) else {
                continue;
            };
            if exclude == Some(&peer) {
                continue;
            }
            per_peer.entry(peer).or_default().push((*id, entry.link.clone()));
        }

        let turn = self.rotation.fetch_add(1, Ordering::Relaxed);
        per_peer
            .into_iter()
            .map(|(peer, mut candidates)| {
                candidates.sort_by_key(|(id, _)| id.0);
                let (id, link) = candidates.swap_remove(turn % candidates.len());
                (id, peer, link)
            })
            .collect()
    }

    /// Every attached link id, active or tentative
    pub fn all_links(&self) -> Vec<LinkId> {
        self.links.read().keys().copied().collect()
    }

    /// Demote a link to tentative with a fresh challenge (identity
    /// rotation re-associates every live link under the new key)
    pub fn re_challenge(&self, id: LinkId, challenge: [u8; 16], now: Instant) {
        if let Some(entry) = self.links.write().get_mut(&id) {
            entry.state = LinkState::Tentative { challenge, since: now };
        }
    }

    /// Tentative links older than the deadline, for ping-timeout teardown
    pub fn stale_tentative(&self, deadline: std::time::Duration, now: Instant) -> Vec<LinkId> {
        self.links
            .read()
            .iter()
            .filter(|(_, entry)| match entry.state {
                LinkState::Tentative { since, .. } => now.duration_since(since) >= deadline,
                LinkState::Active => false,
            })
            .map(|(id, _)| *id)
            .collect()
    }

    /// Smallest MTU advertised across active links; governs fragmentation
    pub fn min_active_mtu(&self) -> Option<usize> {
        self.links
            .read()
            .values()
            .filter(|entry| matches!(entry.state, LinkState::Active))
            .map(|entry| entry.link.mtu())
            .min()
    }

    pub fn active_count(&self) -> usize {
        self.links
            .read()
            .values()
            .filter(|entry| matches!(entry.state, LinkState::Active))
            .count()
    }

    pub fn link_count(&self) -> usize {
        self.links.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(byte: u8) -> PublicKey {
        PublicKey::from_bytes([byte; 32])
    }

    #[tokio::test]
    async fn test_attach_activate_detach() {
        let mux = TransportMux::new();
        let (a, _b) = MemoryLink::pair("mem://a", "mem://b", 65_536, CostClass::DirectLocal);
        let id = mux.attach(Arc::new(a), [7u8; 16], Instant::now());
        assert!(!mux.is_active(id));

        // Wrong challenge is refused
        assert!(!mux.activate(id, peer(1), &[8u8; 16]));
        assert!(mux.activate(id, peer(1), &[7u8; 16]));
        assert!(mux.is_active(id));
        assert_eq!(mux.peer_of(id), Some(peer(1)));

        assert_eq!(mux.detach(id), Some(peer(1)));
        assert_eq!(mux.link_count(), 0);
    }

    #[tokio::test]
    async fn test_best_link_prefers_cheap_class() {
        let mux = TransportMux::new();
        let (radio, _r) = MemoryLink::pair("mem://radio", "mem://r", 512, CostClass::RadioShortRange);
        let (local, _l) = MemoryLink::pair("mem://local", "mem://l", 65_536, CostClass::DirectLocal);

        let radio_id = mux.attach(Arc::new(radio), [1u8; 16], Instant::now());
        let local_id = mux.attach(Arc::new(local), [2u8; 16], Instant::now());
        mux.activate(radio_id, peer(1), &[1u8; 16]);
        mux.activate(local_id, peer(1), &[2u8; 16]);

        let (best, link) = mux.best_link_for(&peer(1)).unwrap();
        assert_eq!(best, local_id);
        assert_eq!(link.cost_class(), CostClass::DirectLocal);
    }

    #[tokio::test]
    async fn test_flood_excludes_arrival_peer() {
        let mux = TransportMux::new();
        let (a, _ra) = MemoryLink::pair("mem://a", "mem://ra", 65_536, CostClass::DirectLocal);
        let (b, _rb) = MemoryLink::pair("mem://b", "mem://rb", 65_536, CostClass::DirectLocal);
        let ida = mux.attach(Arc::new(a), [1u8; 16], Instant::now());
        let idb = mux.attach(Arc::new(b), [2u8; 16], Instant::now());
        mux.activate(ida, peer(1), &[1u8; 16]);
        mux.activate(idb, peer(2), &[2u8; 16]);

        let targets = mux.flood_targets(Some(&peer(1)));
        assert_eq!(targets.len(), 1);
        assert_eq!(targets[0].1, peer(2));
    }

    #[tokio::test]
    async fn test_flood_picks_one_link_per_peer() {
        let mux = TransportMux::new();
        let (a, _ra) = MemoryLink::pair("mem://a", "mem://ra", 65_536, CostClass::DirectLocal);
        let (b, _rb) = MemoryLink::pair("mem://b", "mem://rb", 512, CostClass::RadioShortRange);
        let ida = mux.attach(Arc::new(a), [1u8; 16], Instant::now());
        let idb = mux.attach(Arc::new(b), [2u8; 16], Instant::now());
        mux.activate(ida, peer(1), &[1u8; 16]);
        mux.activate(idb, peer(1), &[2u8; 16]);

        let targets = mux.flood_targets(None);
        assert_eq!(targets.len(), 1);
    }

    #[tokio::test]
    async fn test_stale_tentative() {
        let mux = TransportMux::new();
        let (a, _ra) = MemoryLink::pair("mem://a", "mem://ra", 65_536, CostClass::DirectLocal);
        let now = Instant::now();
        let id = mux.attach(Arc::new(a), [1u8; 16], now);

        assert!(mux.stale_tentative(std::time::Duration::from_secs(10), now).is_empty());
        let stale = mux.stale_tentative(
            std::time::Duration::from_secs(10),
            now + std::time::Duration::from_secs(11),
        );
        assert_eq!(stale, vec![id]);
    }
}
