//! Connected-peer registry
//!
//! Single source of truth for which peers are currently reachable and how
//! healthy they look. Every validated inbound frame refreshes the sender's
//! heartbeat; a periodic sweep marks silent peers unhealthy after
//! `peer_stale` and removes them after `peer_dead`, emitting a disconnect
//! event the engine fans out. A capacity cap bounds memory against churny
//! or hostile meshes: at the cap the longest-stale non-social peer is
//! evicted first.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::RwLock;
use tracing::{debug, info};

use lib_crypto::PublicKey;

use crate::transport::CostClass;
use crate::types::PeerRecord;

/// Registry tuning
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    pub max_peers: usize,
    pub stale_after: Duration,
    pub dead_after: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        RegistryConfig {
            max_peers: 10_000,
            stale_after: Duration::from_secs(60),
            dead_after: Duration::from_secs(180),
        }
    }
}

pub struct PeerRegistry {
    peers: HashMap<PublicKey, PeerRecord>,
    config: RegistryConfig,
}

/// Thread-safe registry handle shared across engine tasks
pub type SharedPeerRegistry = Arc<RwLock<PeerRegistry>>;

pub fn new_shared_registry(config: RegistryConfig) -> SharedPeerRegistry {
    Arc::new(RwLock::new(PeerRegistry::new(config)))
}

impl PeerRegistry {
    pub fn new(config: RegistryConfig) -> Self {
        PeerRegistry {
            peers: HashMap::new(),
            config,
        }
    }

    /// Record a peer as connected over the given transport. Returns true
    /// when the peer is new.
    pub fn connect(&mut self, peer: PublicKey, transport: CostClass, now: Instant) -> bool {
        if let Some(record) = self.peers.get_mut(&peer) {
            record.last_heartbeat_at = now;
            record.healthy = true;
            if !record.transports.contains(&transport) {
                record.transports.push(transport);
            }
            return false;
        }

        if self.peers.len() >= self.config.max_peers {
            self.evict_one(now);
        }
        self.peers.insert(peer, PeerRecord::new(peer, transport, now));
        info!(peer = %peer.fingerprint(), "peer connected");
        true
    }

    /// Evict the longest-stale non-social peer; fall back to the longest-
    /// stale peer overall when everyone is social.
    fn evict_one(&mut self, _now: Instant) {
        let candidate = self
            .peers
            .values()
            .filter(|r| !r.is_social)
            .min_by_key(|r| r.last_heartbeat_at)
            .or_else(|| self.peers.values().min_by_key(|r| r.last_heartbeat_at))
            .map(|r| r.peer_id);
        if let Some(peer) = candidate {
            self.peers.remove(&peer);
            debug!(peer = %peer.fingerprint(), "evicted stale peer at capacity");
        }
    }

    /// Refresh a peer's heartbeat on any validated inbound frame
    pub fn heartbeat(&mut self, peer: &PublicKey, now: Instant) {
        if let Some(record) = self.peers.get_mut(peer) {
            record.last_heartbeat_at = now;
            record.healthy = true;
        }
    }

    /// Adjust the quality score from a handoff outcome
    pub fn record_handoff(&mut self, peer: &PublicKey, success: bool) {
        if let Some(record) = self.peers.get_mut(peer) {
            let sample = if success { 1.0 } else { 0.0 };
            record.quality = record.quality * 0.9 + sample * 0.1;
        }
    }

    /// Remove a peer immediately (link torn down under us)
    pub fn disconnect(&mut self, peer: &PublicKey) -> bool {
        self.peers.remove(peer).is_some()
    }

    /// Health sweep: mark stale peers unhealthy, drop dead ones. Returns
    /// the peers removed so the engine can emit disconnect events.
    pub fn sweep(&mut self, now: Instant) -> Vec<PublicKey> {
        let stale = self.config.stale_after;
        let dead = self.config.dead_after;

        for record in self.peers.values_mut() {
            if now.duration_since(record.last_heartbeat_at) >= stale {
                record.healthy = false;
            }
        }

        let removed: Vec<PublicKey> = self
            .peers
            .values()
            .filter(|r| now.duration_since(r.last_heartbeat_at) >= dead)
            .map(|r| r.peer_id)
            .collect();
        for peer in &removed {
            self.peers.remove(peer);
            info!(peer = %peer.fingerprint(), "peer dead, removed");
        }
        removed
    }

    pub fn is_connected(&self, peer: &PublicKey) -> bool {
        self.peers.contains_key(peer)
    }

    pub fn get(&self, peer: &PublicKey) -> Option<&PeerRecord> {
        self.peers.get(peer)
    }

    pub fn connected_peers(&self) -> Vec<PublicKey> {
        self.peers.keys().copied().collect()
    }

    pub fn connected_count(&self) -> usize {
        self.peers.len()
    }

    /// Flip the presentation-only social flag. Returns false when the peer
    /// is not currently connected.
    pub fn set_social(&mut self, peer: &PublicKey, social: bool) -> bool {
        match self.peers.get_mut(peer) {
            Some(record) => {
                record.is_social = social;
                true
            }
            None => false,
        }
    }

    pub fn social_count(&self) -> usize {
        self.peers.values().filter(|r| r.is_social).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(byte: u8) -> PublicKey {
        PublicKey::from_bytes([byte; 32])
    }

    fn config() -> RegistryConfig {
        RegistryConfig {
            max_peers: 3,
            stale_after: Duration::from_secs(60),
            dead_after: Duration::from_secs(180),
        }
    }

    #[test]
    fn test_connect_and_heartbeat() {
        let mut registry = PeerRegistry::new(config());
        let now = Instant::now();
        assert!(registry.connect(peer(1), CostClass::DirectLocal, now));
        assert!(!registry.connect(peer(1), CostClass::DirectLocal, now));
        assert_eq!(registry.connected_count(), 1);
        assert!(registry.get(&peer(1)).unwrap().healthy);
    }

    #[test]
    fn test_sweep_marks_stale_then_removes_dead() {
        let mut registry = PeerRegistry::new(config());
        let now = Instant::now();
        registry.connect(peer(1), CostClass::DirectLocal, now);

        // Past stale, before dead: unhealthy but present
        let removed = registry.sweep(now + Duration::from_secs(61));
        assert!(removed.is_empty());
        assert!(!registry.get(&peer(1)).unwrap().healthy);

        // Fresh heartbeat revives
        registry.heartbeat(&peer(1), now + Duration::from_secs(120));
        assert!(registry.get(&peer(1)).unwrap().healthy);

        // Silence past dead removes with an event
        let removed = registry.sweep(now + Duration::from_secs(301));
        assert_eq!(removed, vec![peer(1)]);
        assert_eq!(registry.connected_count(), 0);
    }

    #[test]
    fn test_capacity_evicts_longest_stale_non_social() {
        let mut registry = PeerRegistry::new(config());
        let now = Instant::now();
        registry.connect(peer(1), CostClass::DirectLocal, now);
        registry.connect(peer(2), CostClass::DirectLocal, now + Duration::from_secs(1));
        registry.connect(peer(3), CostClass::DirectLocal, now + Duration::from_secs(2));

        // Peer 1 is the longest-stale but social; peer 2 should go instead
        registry.set_social(&peer(1), true);
        registry.connect(peer(4), CostClass::DirectLocal, now + Duration::from_secs(3));

        assert!(registry.is_connected(&peer(1)));
        assert!(!registry.is_connected(&peer(2)));
        assert!(registry.is_connected(&peer(4)));
    }

    #[test]
    fn test_social_flag_is_presentation_only() {
        let mut registry = PeerRegistry::new(config());
        let now = Instant::now();
        registry.connect(peer(1), CostClass::DirectLocal, now);
        assert_eq!(registry.social_count(), 0);
        assert!(registry.set_social(&peer(1), true));
        assert_eq!(registry.social_count(), 1);
        assert!(!registry.set_social(&peer(9), true));
    }

    #[test]
    fn test_quality_tracks_handoffs() {
        let mut registry = PeerRegistry::new(config());
        let now = Instant::now();
        registry.connect(peer(1), CostClass::DirectLocal, now);
        for _ in 0..5 {
            registry.record_handoff(&peer(1), false);
        }
        assert!(registry.get(&peer(1)).unwrap().quality < 0.7);
    }
}
