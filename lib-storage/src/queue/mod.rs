//! Durable outbound queue
//!
//! One bincode record file per queued frame, named by a monotonic sequence
//! number. Enqueue hits disk before the caller's send returns; `ack` removes
//! the record after a successful link-level handoff; everything else stays
//! until its expiry sweep. On startup the directory is scanned and replayed
//! into the scheduler in priority-then-insertion order.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use lib_crypto::PublicKey;
use lib_wire::Priority;

use crate::error::StoreError;

/// Current queue record schema version
pub const QUEUE_SCHEMA_VERSION: u32 = 1;

/// One persisted outbound frame
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueuedFrame {
    pub version: u32,
    /// Encoded wire frame, signed and (for user data) encrypted
    pub frame_blob: Vec<u8>,
    /// `None` marks a broadcast
    pub recipient: Option<PublicKey>,
    pub priority: Priority,
    pub created_at_ms: u64,
    pub attempts: u32,
    pub last_attempt_at_ms: Option<u64>,
    pub expires_at_ms: u64,
}

impl QueuedFrame {
    pub fn new(
        frame_blob: Vec<u8>,
        recipient: Option<PublicKey>,
        priority: Priority,
        created_at_ms: u64,
        expires_at_ms: u64,
    ) -> Self {
        QueuedFrame {
            version: QUEUE_SCHEMA_VERSION,
            frame_blob,
            recipient,
            priority,
            created_at_ms,
            attempts: 0,
            last_attempt_at_ms: None,
            expires_at_ms,
        }
    }
}

/// Durable FIFO-per-priority of frame blobs
pub struct OutboundQueue {
    dir: PathBuf,
    /// (priority index, sequence) -> record; BTreeMap order is the replay
    /// order
    entries: BTreeMap<(u8, u64), QueuedFrame>,
    next_seq: u64,
}

impl OutboundQueue {
    /// Open the queue directory and rebuild in-memory state from disk
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        tokio::fs::create_dir_all(&dir).await?;

        let mut entries = BTreeMap::new();
        let mut next_seq = 0u64;
        let mut reader = tokio::fs::read_dir(&dir).await?;
        while let Some(dirent) = reader.next_entry().await? {
            let path = dirent.path();
            let Some(seq) = parse_seq(&path) else {
                continue;
            };
            let bytes = tokio::fs::read(&path).await?;
            match bincode::deserialize::<QueuedFrame>(&bytes) {
                Ok(record) if record.version <= QUEUE_SCHEMA_VERSION => {
                    next_seq = next_seq.max(seq + 1);
                    entries.insert((record.priority.index() as u8, seq), record);
                }
                Ok(record) => {
                    return Err(StoreError::Schema(format!(
                        "queue record {} has version {}",
                        path.display(),
                        record.version
                    )));
                }
                Err(e) => {
                    // A torn write from a crash mid-enqueue; drop the file
                    warn!(path = %path.display(), error = %e, "dropping unreadable queue record");
                    tokio::fs::remove_file(&path).await.ok();
                }
            }
        }

        debug!(depth = entries.len(), "outbound queue opened");
        Ok(OutboundQueue {
            dir,
            entries,
            next_seq,
        })
    }

    fn record_path(&self, seq: u64) -> PathBuf {
        self.dir.join(format!("{seq:020}.bin"))
    }

    /// Persist a frame and return its queue id. The write completes before
    /// this returns, making enqueue transactional with the caller's send.
    pub async fn enqueue(&mut self, record: QueuedFrame) -> Result<u64, StoreError> {
        let seq = self.next_seq;
        self.next_seq += 1;

        let bytes = bincode::serialize(&record)?;
        let path = self.record_path(seq);
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, &path).await?;

        self.entries
            .insert((record.priority.index() as u8, seq), record);
        Ok(seq)
    }

    /// Remove a delivered entry
    pub async fn ack(&mut self, seq: u64) -> Result<(), StoreError> {
        let key = self
            .entries
            .keys()
            .find(|(_, s)| *s == seq)
            .copied()
            .ok_or(StoreError::EntryNotFound)?;
        self.entries.remove(&key);
        tokio::fs::remove_file(self.record_path(seq)).await.ok();
        Ok(())
    }

    /// Record a delivery attempt without removing the entry
    pub async fn mark_attempt(&mut self, seq: u64, now_ms: u64) -> Result<(), StoreError> {
        let key = self
            .entries
            .keys()
            .find(|(_, s)| *s == seq)
            .copied()
            .ok_or(StoreError::EntryNotFound)?;
        let record = self.entries.get_mut(&key).unwrap();
        record.attempts += 1;
        record.last_attempt_at_ms = Some(now_ms);

        let bytes = bincode::serialize(record)?;
        let path = self.record_path(seq);
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(())
    }

    /// All entries in priority-then-insertion order, for startup replay
    pub fn replay(&self) -> Vec<(u64, QueuedFrame)> {
        self.entries
            .iter()
            .map(|((_, seq), record)| (*seq, record.clone()))
            .collect()
    }

    /// Entries waiting for one specific recipient, oldest first
    pub fn entries_for(&self, peer: &PublicKey) -> Vec<(u64, QueuedFrame)> {
        self.entries
            .iter()
            .filter(|(_, record)| record.recipient.as_ref() == Some(peer))
            .map(|((_, seq), record)| (*seq, record.clone()))
            .collect()
    }

    /// Drop entries past their expiry; returns how many were removed
    pub async fn sweep(&mut self, now_ms: u64) -> usize {
        let expired: Vec<(u8, u64)> = self
            .entries
            .iter()
            .filter(|(_, record)| record.expires_at_ms <= now_ms)
            .map(|(key, _)| *key)
            .collect();
        for key in &expired {
            self.entries.remove(key);
            tokio::fs::remove_file(self.record_path(key.1)).await.ok();
        }
        if !expired.is_empty() {
            debug!(dropped = expired.len(), "queue expiry sweep");
        }
        expired.len()
    }

    pub fn depth(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn parse_seq(path: &std::path::Path) -> Option<u64> {
    let name = path.file_name()?.to_str()?;
    let stem = name.strip_suffix(".bin")?;
    stem.parse().ok()
}
