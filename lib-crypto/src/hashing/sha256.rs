//! SHA-256 hashing
//!
//! Every digest in the protocol (frame hashes, content ids, fingerprints)
//! is SHA-256.

use sha2::{Digest, Sha256};

use crate::types::Hash;

/// SHA-256 over a byte string
pub fn hash_sha256(data: &[u8]) -> Hash {
    let mut hasher = Sha256::new();
    hasher.update(data);
    Hash(hasher.finalize().into())
}

/// SHA-256 over several concatenated byte strings, without an intermediate
/// allocation
pub fn hash_sha256_parts(parts: &[&[u8]]) -> Hash {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
    }
    Hash(hasher.finalize().into())
}
