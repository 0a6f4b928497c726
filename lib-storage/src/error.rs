//! Typed persistence errors

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("durable write failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("schema mismatch: {0}")]
    Schema(String),

    #[error("blob not found")]
    BlobNotFound,

    #[error("queue entry not found")]
    EntryNotFound,

    #[error("record encode/decode failed: {0}")]
    Codec(String),
}

impl From<bincode::Error> for StoreError {
    fn from(e: bincode::Error) -> Self {
        StoreError::Codec(e.to_string())
    }
}
