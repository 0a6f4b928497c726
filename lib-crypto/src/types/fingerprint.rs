//! Short human-readable key digests

use serde::{Deserialize, Serialize};

use crate::hashing::hash_sha256;
use crate::types::PublicKey;

/// Number of digest bytes shown to users (20 hex characters)
pub const FINGERPRINT_BYTES: usize = 10;

/// First bytes of SHA-256 over a public key, base16-encoded for display.
/// Used for out-of-band verification, never for routing or lookups.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Fingerprint(pub [u8; FINGERPRINT_BYTES]);

impl Fingerprint {
    /// Compute the fingerprint of a public key
    pub fn of_public_key(public: &PublicKey) -> Self {
        let digest = hash_sha256(public.as_bytes());
        let mut fp = [0u8; FINGERPRINT_BYTES];
        fp.copy_from_slice(&digest.as_bytes()[..FINGERPRINT_BYTES]);
        Fingerprint(fp)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fingerprint_is_stable() {
        let pk = PublicKey::from_bytes([3u8; 32]);
        assert_eq!(pk.fingerprint(), pk.fingerprint());
        assert_eq!(pk.fingerprint().to_string().len(), FINGERPRINT_BYTES * 2);
    }

    #[test]
    fn test_different_keys_differ() {
        let a = PublicKey::from_bytes([1u8; 32]);
        let b = PublicKey::from_bytes([2u8; 32]);
        assert_ne!(a.fingerprint(), b.fingerprint());
    }
}
