//! Key type definitions
//!
//! `PublicKey` doubles as the stable peer id on the wire; comparisons run in
//! constant time so lookups cannot leak key material through timing.

use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::hashing::hash_sha256;
use crate::types::Fingerprint;

/// Ed25519 public key; the 32 raw bytes are the peer id on the wire
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Hash)]
pub struct PublicKey(pub [u8; 32]);

impl PartialEq for PublicKey {
    /// Constant-time equality, no early exit on a differing byte
    #[inline(never)]
    fn eq(&self, other: &Self) -> bool {
        self.0.ct_eq(&other.0).into()
    }
}

impl Eq for PublicKey {}

impl PublicKey {
    /// Wrap raw public key bytes
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        PublicKey(bytes)
    }

    /// Parse from a byte slice, rejecting wrong lengths
    pub fn try_from_slice(bytes: &[u8]) -> anyhow::Result<Self> {
        if bytes.len() != 32 {
            return Err(anyhow::anyhow!(
                "Invalid public key length: {} (expected 32)",
                bytes.len()
            ));
        }
        let mut pk = [0u8; 32];
        pk.copy_from_slice(bytes);
        Ok(PublicKey(pk))
    }

    /// Get raw key bytes
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Short human-readable digest for out-of-band verification
    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint::of_public_key(self)
    }

    /// Verify a detached signature made by the holder of this key
    pub fn verify(&self, message: &[u8], signature: &crate::types::Signature) -> bool {
        crate::classical::ed25519::verify_signature(message, signature.as_bytes(), &self.0)
    }
}

impl std::fmt::Display for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl AsRef<[u8]> for PublicKey {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// Ed25519 secret key, zeroized on drop
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct PrivateKey(pub(crate) [u8; 32]);

impl PrivateKey {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        PrivateKey(bytes)
    }

    /// Expose raw bytes for wrapping into at-rest storage.
    /// Callers must not persist these outside an encrypted container.
    pub fn expose_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl std::fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PrivateKey(..)")
    }
}

/// X25519 public key used for session key agreement
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Hash)]
pub struct AgreementPublic(pub [u8; 32]);

impl PartialEq for AgreementPublic {
    #[inline(never)]
    fn eq(&self, other: &Self) -> bool {
        self.0.ct_eq(&other.0).into()
    }
}

impl Eq for AgreementPublic {}

impl AgreementPublic {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        AgreementPublic(bytes)
    }

    pub fn try_from_slice(bytes: &[u8]) -> anyhow::Result<Self> {
        if bytes.len() != 32 {
            return Err(anyhow::anyhow!(
                "Invalid agreement key length: {} (expected 32)",
                bytes.len()
            ));
        }
        let mut pk = [0u8; 32];
        pk.copy_from_slice(bytes);
        Ok(AgreementPublic(pk))
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

/// X25519 secret key, zeroized on drop
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct AgreementSecret(pub(crate) [u8; 32]);

impl AgreementSecret {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        AgreementSecret(bytes)
    }

    pub fn expose_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl std::fmt::Debug for AgreementSecret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "AgreementSecret(..)")
    }
}

/// Content digest of a public key, used as a stable map key in stores
pub fn key_id(public: &PublicKey) -> crate::types::Hash {
    hash_sha256(public.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constant_time_equality() {
        let a = PublicKey::from_bytes([0xAA; 32]);
        let b = PublicKey::from_bytes([0xAA; 32]);
        assert_eq!(a, b);

        let mut other = [0xAA; 32];
        other[31] = 0xAB;
        assert_ne!(a, PublicKey::from_bytes(other));
    }

    #[test]
    fn test_slice_length_rejected() {
        assert!(PublicKey::try_from_slice(&[1u8; 31]).is_err());
        assert!(PublicKey::try_from_slice(&[1u8; 32]).is_ok());
        assert!(AgreementPublic::try_from_slice(&[1u8; 33]).is_err());
    }

    #[test]
    fn test_private_key_debug_redacted() {
        let sk = PrivateKey::from_bytes([7u8; 32]);
        assert_eq!(format!("{:?}", sk), "PrivateKey(..)");
    }
}
