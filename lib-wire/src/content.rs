//! Content addressing
//!
//! Any payload a component references indirectly (file blobs, sneakernet
//! offers) is named by the SHA-256 of its bytes. The blob store resolves
//! `ContentId -> bytes`.

use serde::{Deserialize, Serialize};

use lib_crypto::{hash_sha256, Hash};

/// Content address: SHA-256 of the content bytes
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContentId(pub Hash);

impl ContentId {
    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_bytes()
    }

    pub fn from_hex(hex_str: &str) -> anyhow::Result<Self> {
        Ok(ContentId(Hash::from_hex(hex_str)?))
    }
}

impl std::fmt::Display for ContentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Compute the content address of a byte string
pub fn content_id(content: &[u8]) -> ContentId {
    ContentId(hash_sha256(content))
}
