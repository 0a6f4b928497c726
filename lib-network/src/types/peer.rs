//! Connected-peer record

use std::time::Instant;

use lib_crypto::{Fingerprint, PublicKey};

use crate::transport::CostClass;

/// Everything the registry tracks about one connected peer.
///
/// `is_social` is presentation-only state: it flips when the user accepts
/// the peer as a contact and has no effect on routing or forwarding. Every
/// peer starts as a silent mesh neighbor.
#[derive(Debug, Clone)]
pub struct PeerRecord {
    pub peer_id: PublicKey,
    pub fingerprint: Fingerprint,
    pub display_name: Option<String>,
    /// Cost classes of the links this peer has been seen on
    pub transports: Vec<CostClass>,
    /// Link quality estimate in [0, 1], updated from handoff outcomes
    pub quality: f64,
    pub last_heartbeat_at: Instant,
    pub added_at: Instant,
    /// Set by the heartbeat sweep once `peer_stale` passes
    pub healthy: bool,
    pub is_social: bool,
}

impl PeerRecord {
    pub fn new(peer_id: PublicKey, transport: CostClass, now: Instant) -> Self {
        PeerRecord {
            peer_id,
            fingerprint: peer_id.fingerprint(),
            display_name: None,
            transports: vec![transport],
            quality: 1.0,
            last_heartbeat_at: now,
            added_at: now,
            healthy: true,
            is_social: false,
        }
    }
}
