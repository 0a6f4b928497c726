//! Known-Nodes Ledger
//!
//! A terse, append-mostly record of every peer this device has ever
//! validated traffic from, keyed by peer id. The ledger outlives local
//! identity rotation (it never stores local keys) and never holds private
//! keys or message bodies. Updates coalesce in memory; `flush` writes one
//! versioned snapshot, called periodically by the maintenance task and at
//! shutdown.

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use lib_crypto::{AgreementPublic, PublicKey};

use crate::error::StoreError;

/// Current ledger file schema version
pub const LEDGER_SCHEMA_VERSION: u32 = 1;

/// Default retention window: 180 days
pub const DEFAULT_RETENTION_MS: u64 = 15_552_000_000;

/// How many addresses to remember per peer
const MAX_ADDRESSES: usize = 8;

/// One known node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEntry {
    /// Stable peer id (the peer's Ed25519 public key)
    pub public_key: PublicKey,
    /// Agreement key learned from the light-ping, if any; lets a rotated
    /// local identity re-establish sessions without a fresh exchange
    pub agreement_public: Option<AgreementPublic>,
    /// Transport addresses this peer has appeared at, most recent last
    pub last_known_addresses: Vec<String>,
    pub first_seen_at_ms: u64,
    pub last_seen_at_ms: u64,
    /// Accumulated observed-connected time, a watering-hole ranking hint
    pub cumulative_uptime_hint_ms: u64,
}

#[derive(Serialize, Deserialize)]
struct LedgerFile {
    version: u32,
    entries: Vec<LedgerEntry>,
}

/// Durable registry of previously-observed peers
pub struct KnownNodesLedger {
    path: PathBuf,
    entries: HashMap<PublicKey, LedgerEntry>,
    retention_ms: u64,
    dirty: bool,
}

impl KnownNodesLedger {
    /// Load the ledger file, or start empty when none exists
    pub async fn open(path: impl Into<PathBuf>, retention_ms: u64) -> Result<Self, StoreError> {
        let path = path.into();
        let mut entries = HashMap::new();

        if tokio::fs::try_exists(&path).await? {
            let bytes = tokio::fs::read(&path).await?;
            let file: LedgerFile = bincode::deserialize(&bytes)?;
            if file.version > LEDGER_SCHEMA_VERSION {
                return Err(StoreError::Schema(format!(
                    "ledger version {} is newer than supported {}",
                    file.version, LEDGER_SCHEMA_VERSION
                )));
            }
            for entry in file.entries {
                entries.insert(entry.public_key, entry);
            }
        }

        debug!(peers = entries.len(), "ledger opened");
        Ok(KnownNodesLedger {
            path,
            entries,
            retention_ms,
            dirty: false,
        })
    }

    /// Record an observation of a peer: a validated inbound frame, a
    /// successful outbound handoff, or a completed light-ping. Fields are
    /// merged; the entry is created on first sight.
    pub fn observe(
        &mut self,
        peer: PublicKey,
        agreement: Option<AgreementPublic>,
        address: Option<&str>,
        now_ms: u64,
        uptime_delta_ms: u64,
    ) {
        let entry = self.entries.entry(peer).or_insert_with(|| LedgerEntry {
            public_key: peer,
            agreement_public: None,
            last_known_addresses: Vec::new(),
            first_seen_at_ms: now_ms,
            last_seen_at_ms: now_ms,
            cumulative_uptime_hint_ms: 0,
        });

        entry.last_seen_at_ms = entry.last_seen_at_ms.max(now_ms);
        entry.cumulative_uptime_hint_ms += uptime_delta_ms;
        if let Some(agreement) = agreement {
            entry.agreement_public = Some(agreement);
        }
        if let Some(address) = address {
            entry.last_known_addresses.retain(|a| a != address);
            entry.last_known_addresses.push(address.to_string());
            while entry.last_known_addresses.len() > MAX_ADDRESSES {
                entry.last_known_addresses.remove(0);
            }
        }
        self.dirty = true;
    }

    /// Push install-time bootstrap entries. Existing entries win.
    pub fn seed(&mut self, entries: Vec<LedgerEntry>) {
        for entry in entries {
            self.entries.entry(entry.public_key).or_insert(entry);
        }
        self.dirty = true;
    }

    pub fn get(&self, peer: &PublicKey) -> Option<&LedgerEntry> {
        self.entries.get(peer)
    }

    /// Read-only filtered view
    pub fn query(&self, predicate: impl Fn(&LedgerEntry) -> bool) -> Vec<LedgerEntry> {
        self.entries.values().filter(|e| predicate(e)).cloned().collect()
    }

    /// Was this peer seen within the window ending now?
    pub fn seen_within(&self, peer: &PublicKey, window_ms: u64, now_ms: u64) -> bool {
        self.entries
            .get(peer)
            .map(|e| now_ms.saturating_sub(e.last_seen_at_ms) <= window_ms)
            .unwrap_or(false)
    }

    /// The `n` most recently seen peers, for post-rotation bootstrap pings
    pub fn most_recent(&self, n: usize) -> Vec<LedgerEntry> {
        let mut all: Vec<LedgerEntry> = self.entries.values().cloned().collect();
        all.sort_by(|a, b| b.last_seen_at_ms.cmp(&a.last_seen_at_ms));
        all.truncate(n);
        all
    }

    /// Does any entry list this transport address?
    pub fn peer_for_address(&self, address: &str) -> Option<PublicKey> {
        self.entries
            .values()
            .find(|e| e.last_known_addresses.iter().any(|a| a == address))
            .map(|e| e.public_key)
    }

    /// Age out entries past the retention window
    pub fn sweep(&mut self, now_ms: u64) -> usize {
        let retention = self.retention_ms;
        let before = self.entries.len();
        self.entries
            .retain(|_, e| now_ms.saturating_sub(e.last_seen_at_ms) < retention);
        let dropped = before - self.entries.len();
        if dropped > 0 {
            self.dirty = true;
            debug!(dropped, "ledger retention sweep");
        }
        dropped
    }

    /// Explicit user-initiated wipe
    pub async fn wipe(&mut self) -> Result<(), StoreError> {
        self.entries.clear();
        self.dirty = true;
        info!("ledger wiped");
        self.flush().await
    }

    /// Write a snapshot if anything changed since the last flush
    pub async fn flush(&mut self) -> Result<(), StoreError> {
        if !self.dirty {
            return Ok(());
        }
        let file = LedgerFile {
            version: LEDGER_SCHEMA_VERSION,
            entries: self.entries.values().cloned().collect(),
        };
        let bytes = bincode::serialize(&file)?;
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        self.dirty = false;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn peer(byte: u8) -> PublicKey {
        PublicKey::from_bytes([byte; 32])
    }

    #[tokio::test]
    async fn test_observe_and_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("ledger.bin");
        {
            let mut ledger = KnownNodesLedger::open(&path, DEFAULT_RETENTION_MS).await.unwrap();
            ledger.observe(peer(1), None, Some("mem://a"), 1_000, 0);
            ledger.observe(peer(1), None, Some("mem://b"), 2_000, 500);
            ledger.flush().await.unwrap();
        }

        let ledger = KnownNodesLedger::open(&path, DEFAULT_RETENTION_MS).await.unwrap();
        let entry = ledger.get(&peer(1)).unwrap();
        assert_eq!(entry.first_seen_at_ms, 1_000);
        assert_eq!(entry.last_seen_at_ms, 2_000);
        assert_eq!(entry.cumulative_uptime_hint_ms, 500);
        assert_eq!(entry.last_known_addresses, vec!["mem://a", "mem://b"]);
    }

    #[tokio::test]
    async fn test_readdress_moves_to_back() {
        let dir = tempdir().unwrap();
        let mut ledger = KnownNodesLedger::open(dir.path().join("l.bin"), DEFAULT_RETENTION_MS)
            .await
            .unwrap();
        ledger.observe(peer(1), None, Some("mem://a"), 1_000, 0);
        ledger.observe(peer(1), None, Some("mem://b"), 2_000, 0);
        ledger.observe(peer(1), None, Some("mem://a"), 3_000, 0);
        assert_eq!(
            ledger.get(&peer(1)).unwrap().last_known_addresses,
            vec!["mem://b", "mem://a"]
        );
    }

    #[tokio::test]
    async fn test_retention_sweep() {
        let dir = tempdir().unwrap();
        let mut ledger = KnownNodesLedger::open(dir.path().join("l.bin"), 10_000).await.unwrap();
        ledger.observe(peer(1), None, None, 1_000, 0);
        ledger.observe(peer(2), None, None, 50_000, 0);

        assert_eq!(ledger.sweep(60_000), 1);
        assert!(ledger.get(&peer(1)).is_none());
        assert!(ledger.get(&peer(2)).is_some());
    }

    #[tokio::test]
    async fn test_most_recent_ranking() {
        let dir = tempdir().unwrap();
        let mut ledger = KnownNodesLedger::open(dir.path().join("l.bin"), DEFAULT_RETENTION_MS)
            .await
            .unwrap();
        ledger.observe(peer(1), None, None, 1_000, 0);
        ledger.observe(peer(2), None, None, 3_000, 0);
        ledger.observe(peer(3), None, None, 2_000, 0);

        let top: Vec<PublicKey> = ledger.most_recent(2).into_iter().map(|e| e.public_key).collect();
        assert_eq!(top, vec![peer(2), peer(3)]);
    }

    #[tokio::test]
    async fn test_seed_does_not_clobber() {
        let dir = tempdir().unwrap();
        let mut ledger = KnownNodesLedger::open(dir.path().join("l.bin"), DEFAULT_RETENTION_MS)
            .await
            .unwrap();
        ledger.observe(peer(1), None, None, 5_000, 0);
        ledger.seed(vec![LedgerEntry {
            public_key: peer(1),
            agreement_public: None,
            last_known_addresses: vec!["mem://bootstrap".into()],
            first_seen_at_ms: 1,
            last_seen_at_ms: 1,
            cumulative_uptime_hint_ms: 0,
        }]);
        assert_eq!(ledger.get(&peer(1)).unwrap().last_seen_at_ms, 5_000);
    }

    #[tokio::test]
    async fn test_wipe() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("l.bin");
        let mut ledger = KnownNodesLedger::open(&path, DEFAULT_RETENTION_MS).await.unwrap();
        ledger.observe(peer(1), None, None, 1_000, 0);
        ledger.wipe().await.unwrap();
        assert!(ledger.is_empty());

        let ledger = KnownNodesLedger::open(&path, DEFAULT_RETENTION_MS).await.unwrap();
        assert!(ledger.is_empty());
    }
}
