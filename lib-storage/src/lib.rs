//! Weft Persistence
//!
//! The three durable stores behind the mesh engine: the outbound frame
//! queue, the content-addressed blob store, and the Known-Nodes Ledger.
//! Everything survives process restart; schema versions are forward-only
//! and readers tolerate unknown trailing fields.
//!
//! Layout under one root directory:
//!
//! ```text
//! <root>/queue/<seq>.bin     one bincode record per queued frame
//! <root>/blobs/<hex id>      content-addressed payload bytes
//! <root>/ledger.bin          versioned snapshot of known nodes
//! ```

pub mod blob;
pub mod error;
pub mod ledger;
pub mod queue;

pub use blob::BlobStore;
pub use error::StoreError;
pub use ledger::{KnownNodesLedger, LedgerEntry, LEDGER_SCHEMA_VERSION};
pub use queue::{OutboundQueue, QueuedFrame, QUEUE_SCHEMA_VERSION};

/// Milliseconds since the Unix epoch, the timestamp unit of every persisted
/// record
pub fn now_ms() -> u64 {
    chrono::Utc::now().timestamp_millis() as u64
}
