//! Engine counters
//!
//! Lock-free counters bumped from every task; `snapshot` folds in the
//! gauges (queue depth, ledger size, peer counts) owned elsewhere.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

#[derive(Debug, Default)]
pub struct Counters {
    pub frames_in: AtomicU64,
    pub frames_out: AtomicU64,
    pub frames_forwarded: AtomicU64,
    pub frames_deduped: AtomicU64,
    pub fragments_reassembled: AtomicU64,
    pub reassembly_dropped: AtomicU64,
    pub transport_errors: AtomicU64,
    pub protocol_errors: AtomicU64,
    pub crypto_errors: AtomicU64,
    pub session_errors: AtomicU64,
    pub persistence_errors: AtomicU64,
    pub capacity_errors: AtomicU64,
    pub policy_errors: AtomicU64,
}

impl Counters {
    pub fn snapshot(
        &self,
        queue_depth: usize,
        ledger_size: usize,
        peers_connected: usize,
        peers_known: usize,
    ) -> StatsSnapshot {
        StatsSnapshot {
            frames_in: self.frames_in.load(Ordering::Relaxed),
            frames_out: self.frames_out.load(Ordering::Relaxed),
            frames_forwarded: self.frames_forwarded.load(Ordering::Relaxed),
            frames_deduped: self.frames_deduped.load(Ordering::Relaxed),
            fragments_reassembled: self.fragments_reassembled.load(Ordering::Relaxed),
            reassembly_dropped: self.reassembly_dropped.load(Ordering::Relaxed),
            transport_errors: self.transport_errors.load(Ordering::Relaxed),
            protocol_errors: self.protocol_errors.load(Ordering::Relaxed),
            crypto_errors: self.crypto_errors.load(Ordering::Relaxed),
            session_errors: self.session_errors.load(Ordering::Relaxed),
            persistence_errors: self.persistence_errors.load(Ordering::Relaxed),
            capacity_errors: self.capacity_errors.load(Ordering::Relaxed),
            policy_errors: self.policy_errors.load(Ordering::Relaxed),
            queue_depth: queue_depth as u64,
            ledger_size: ledger_size as u64,
            peers_connected: peers_connected as u64,
            peers_known: peers_known as u64,
        }
    }
}

/// Point-in-time view of every counter and gauge
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub frames_in: u64,
    pub frames_out: u64,
    pub frames_forwarded: u64,
    pub frames_deduped: u64,
    pub fragments_reassembled: u64,
    pub reassembly_dropped: u64,
    pub transport_errors: u64,
    pub protocol_errors: u64,
    pub crypto_errors: u64,
    pub session_errors: u64,
    pub persistence_errors: u64,
    pub capacity_errors: u64,
    pub policy_errors: u64,
    pub queue_depth: u64,
    pub ledger_size: u64,
    pub peers_connected: u64,
    pub peers_known: u64,
}
