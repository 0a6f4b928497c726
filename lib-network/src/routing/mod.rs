//! Soft-state routing table
//!
//! Best-effort, in-memory, refreshed by observed traffic: every validated
//! inbound frame installs "sender is reachable via arrival peer in
//! (initial_ttl - ttl) hops". Entries expire after `route_ttl` and a
//! fewer-hop observation always wins; at equal hops the higher-quality
//! route is kept. Lookups feed the unicast path; the flood path ignores
//! routes entirely.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tracing::debug;

use lib_crypto::PublicKey;

/// One routing observation
#[derive(Debug, Clone)]
pub struct RouteEntry {
    pub next_hop: PublicKey,
    pub hop_count: u8,
    /// Success ratio of handoffs through this route, in [0, 1]
    pub quality: f64,
    pub expires_at: Instant,
}

pub struct RoutingTable {
    routes: HashMap<PublicKey, RouteEntry>,
    ttl: Duration,
}

impl RoutingTable {
    pub fn new(ttl: Duration) -> Self {
        RoutingTable {
            routes: HashMap::new(),
            ttl,
        }
    }

    /// Install or refresh a route. A missing or expired entry always loses;
    /// otherwise fewer hops win, and equal hops refresh the expiry.
    pub fn upsert(&mut self, dest: PublicKey, next_hop: PublicKey, hop_count: u8, now: Instant) {
        let expires_at = now + self.ttl;
        match self.routes.get_mut(&dest) {
            Some(entry) if entry.expires_at > now && entry.hop_count < hop_count => {}
            Some(entry) if entry.expires_at > now && entry.hop_count == hop_count => {
                entry.expires_at = expires_at;
                if entry.next_hop != next_hop && entry.quality < 0.5 {
                    // The incumbent keeps failing; try the new observation
                    entry.next_hop = next_hop;
                    entry.quality = 1.0;
                }
            }
            _ => {
                self.routes.insert(
                    dest,
                    RouteEntry {
                        next_hop,
                        hop_count,
                        quality: 1.0,
                        expires_at,
                    },
                );
            }
        }
    }

    /// Current best route, if any
    pub fn lookup(&self, dest: &PublicKey, now: Instant) -> Option<&RouteEntry> {
        self.routes.get(dest).filter(|entry| entry.expires_at > now)
    }

    /// Fold a handoff outcome into the route quality and refresh on success
    pub fn record_outcome(&mut self, dest: &PublicKey, success: bool, now: Instant) {
        if let Some(entry) = self.routes.get_mut(dest) {
            let sample = if success { 1.0 } else { 0.0 };
            entry.quality = entry.quality * 0.8 + sample * 0.2;
            if success {
                entry.expires_at = now + self.ttl;
            }
        }
    }

    /// Remove every route through a vanished peer
    pub fn purge_next_hop(&mut self, next_hop: &PublicKey) {
        self.routes.retain(|_, entry| entry.next_hop != *next_hop);
    }

    /// Drop expired entries; returns how many were removed
    pub fn sweep(&mut self, now: Instant) -> usize {
        let before = self.routes.len();
        self.routes.retain(|_, entry| entry.expires_at > now);
        let dropped = before - self.routes.len();
        if dropped > 0 {
            debug!(dropped, "route expiry sweep");
        }
        dropped
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}
