//! Ed25519 signing and verification
//!
//! Thin adapters over ed25519-dalek. The 32-byte verifying key is the
//! engine's stable peer id; signatures are always 64-byte detached.

use anyhow::Result;
use ed25519_dalek::{Signature as Ed25519Signature, Signer, SigningKey, Verifier, VerifyingKey};

/// Generate an Ed25519 keypair from a 32-byte seed
pub fn ed25519_keypair_from_seed(seed: &[u8; 32]) -> ([u8; 32], [u8; 32]) {
    let signing_key = SigningKey::from_bytes(seed);
    let verifying_key = signing_key.verifying_key();
    (verifying_key.to_bytes(), signing_key.to_bytes())
}

/// Sign a message with an Ed25519 secret key
pub fn ed25519_sign(message: &[u8], secret_key: &[u8; 32]) -> [u8; 64] {
    let signing_key = SigningKey::from_bytes(secret_key);
    signing_key.sign(message).to_bytes()
}

/// Verify an Ed25519 signature. Malformed keys or signatures verify false,
/// never error: a relay must be able to reject garbage without branching.
pub fn verify_signature(message: &[u8], signature: &[u8], public_key: &[u8]) -> bool {
    if signature.len() != 64 || public_key.len() != 32 {
        return false;
    }

    let sig = match Ed25519Signature::try_from(&signature[..64]) {
        Ok(sig) => sig,
        Err(_) => return false,
    };

    let mut pk_bytes = [0u8; 32];
    pk_bytes.copy_from_slice(&public_key[..32]);
    let verifying_key = match VerifyingKey::from_bytes(&pk_bytes) {
        Ok(key) => key,
        Err(_) => return false,
    };

    verifying_key.verify(message, &sig).is_ok()
}

/// Validate that a byte string is a well-formed Ed25519 public key
pub fn validate_public_key(public_key: &[u8]) -> Result<()> {
    if public_key.len() != 32 {
        return Err(anyhow::anyhow!("Invalid Ed25519 public key length"));
    }
    let mut pk_bytes = [0u8; 32];
    pk_bytes.copy_from_slice(public_key);
    VerifyingKey::from_bytes(&pk_bytes)
        .map_err(|_| anyhow::anyhow!("Malformed Ed25519 public key"))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_and_verify() {
        let (pk, sk) = ed25519_keypair_from_seed(&[42u8; 32]);
        let message = b"weft ed25519 test message";

        let signature = ed25519_sign(message, &sk);
        assert!(verify_signature(message, &signature, &pk));

        // Wrong message should fail
        assert!(!verify_signature(b"wrong message", &signature, &pk));
    }

    #[test]
    fn test_deterministic_from_seed() {
        let seed = [7u8; 32];
        let (pk1, sk1) = ed25519_keypair_from_seed(&seed);
        let (pk2, sk2) = ed25519_keypair_from_seed(&seed);
        assert_eq!(pk1, pk2);
        assert_eq!(sk1, sk2);
    }

    #[test]
    fn test_garbage_inputs_verify_false() {
        let (pk, sk) = ed25519_keypair_from_seed(&[1u8; 32]);
        let signature = ed25519_sign(b"msg", &sk);

        assert!(!verify_signature(b"msg", &signature[..63], &pk));
        assert!(!verify_signature(b"msg", &signature, &pk[..31]));
        assert!(!verify_signature(b"msg", &[0u8; 64], &pk));
    }
}
