//! Identity keypair
//!
//! One Ed25519 signing pair (the peer id) plus one X25519 agreement pair,
//! generated together and rotated together. The agreement secret is derived
//! from an independent seed, never from the signing key.

use anyhow::Result;
use zeroize::Zeroizing;

use crate::classical::ed25519::{ed25519_keypair_from_seed, ed25519_sign};
use crate::classical::x25519::x25519_public;
use crate::kdf::derive_key;
use crate::random::fill_random;
use crate::types::{AgreementPublic, AgreementSecret, Fingerprint, PrivateKey, PublicKey, Signature};

/// Long-term identity key material
#[derive(Debug, Clone)]
pub struct KeyPair {
    /// Ed25519 verifying key; the stable peer id
    pub public: PublicKey,
    secret: PrivateKey,
    /// X25519 public half for session agreement
    pub agreement_public: AgreementPublic,
    agreement_secret: AgreementSecret,
}

impl KeyPair {
    /// Generate a fresh identity from OS entropy. Fails closed when the
    /// platform has no entropy source.
    pub fn generate() -> Result<Self> {
        let mut seed = Zeroizing::new([0u8; 32]);
        fill_random(seed.as_mut())?;
        Self::from_seed(&seed)
    }

    /// Deterministically derive both keypairs from one 32-byte seed
    pub fn from_seed(seed: &[u8; 32]) -> Result<Self> {
        let (pk, sk) = ed25519_keypair_from_seed(seed);
        let agree_seed = derive_key(seed, "weft-identity-agree-v1", &[])?;
        let agreement_secret = AgreementSecret::from_bytes(agree_seed);
        let agreement_public = x25519_public(&agreement_secret);

        Ok(KeyPair {
            public: PublicKey::from_bytes(pk),
            secret: PrivateKey::from_bytes(sk),
            agreement_public,
            agreement_secret,
        })
    }

    /// Reconstruct from stored secret halves
    pub fn from_parts(secret: PrivateKey, agreement_secret: AgreementSecret) -> Self {
        let (pk, _) = ed25519_keypair_from_seed(secret.expose_bytes());
        let agreement_public = x25519_public(&agreement_secret);
        KeyPair {
            public: PublicKey::from_bytes(pk),
            secret,
            agreement_public,
            agreement_secret,
        }
    }

    /// Sign a message with the identity key
    pub fn sign(&self, message: &[u8]) -> Signature {
        Signature::from_bytes(ed25519_sign(message, self.secret.expose_bytes()))
    }

    /// Short digest of the public key for human display
    pub fn fingerprint(&self) -> Fingerprint {
        self.public.fingerprint()
    }

    /// Secret halves, for wrapping into encrypted at-rest storage only
    pub fn secret_parts(&self) -> (&PrivateKey, &AgreementSecret) {
        (&self.secret, &self.agreement_secret)
    }

    /// X25519 secret half for session agreement
    pub fn agreement_secret(&self) -> &AgreementSecret {
        &self.agreement_secret
    }
}
