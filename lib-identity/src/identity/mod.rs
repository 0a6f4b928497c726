//! Local long-term identity

pub mod store;

use anyhow::Result;
use chrono::Utc;

use lib_crypto::{AgreementPublic, Fingerprint, KeyPair, PublicKey, Signature};

/// The device's long-term identity: an Ed25519 signing pair whose public key
/// is the stable peer id, plus an X25519 pair for session agreement.
///
/// Rotation replaces every key and yields a new peer id; nothing else about
/// the node (ledger, queue, blobs) is touched by rotation.
#[derive(Debug, Clone)]
pub struct WeftIdentity {
    keypair: KeyPair,
    created_at_ms: u64,
}

impl WeftIdentity {
    /// Create a brand-new identity from OS entropy
    pub fn generate() -> Result<Self> {
        Ok(WeftIdentity {
            keypair: KeyPair::generate()?,
            created_at_ms: Utc::now().timestamp_millis() as u64,
        })
    }

    /// Deterministic identity for tests
    pub fn from_seed(seed: &[u8; 32]) -> Result<Self> {
        Ok(WeftIdentity {
            keypair: KeyPair::from_seed(seed)?,
            created_at_ms: 0,
        })
    }

    pub fn from_parts(keypair: KeyPair, created_at_ms: u64) -> Self {
        WeftIdentity {
            keypair,
            created_at_ms,
        }
    }

    /// Produce a replacement identity with fresh keys. The caller persists
    /// it and re-bootstraps from the ledger; the old identity is gone.
    pub fn rotate(&self) -> Result<Self> {
        WeftIdentity::generate()
    }

    /// Stable peer id (Ed25519 public key bytes)
    pub fn peer_id(&self) -> PublicKey {
        self.keypair.public
    }

    /// X25519 public half, shared with peers during the light-ping
    pub fn agreement_public(&self) -> AgreementPublic {
        self.keypair.agreement_public
    }

    pub fn fingerprint(&self) -> Fingerprint {
        self.keypair.fingerprint()
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        self.keypair.sign(message)
    }

    pub fn keypair(&self) -> &KeyPair {
        &self.keypair
    }

    pub fn created_at_ms(&self) -> u64 {
        self.created_at_ms
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rotation_changes_peer_id() -> Result<()> {
        let id = WeftIdentity::generate()?;
        let rotated = id.rotate()?;
        assert_ne!(id.peer_id(), rotated.peer_id());
        assert_ne!(id.fingerprint(), rotated.fingerprint());
        Ok(())
    }

    #[test]
    fn test_signatures_bind_to_identity() -> Result<()> {
        let id = WeftIdentity::from_seed(&[1u8; 32])?;
        let sig = id.sign(b"announce");
        assert!(id.peer_id().verify(b"announce", &sig));

        let other = WeftIdentity::from_seed(&[2u8; 32])?;
        assert!(!other.peer_id().verify(b"announce", &sig));
        Ok(())
    }
}
