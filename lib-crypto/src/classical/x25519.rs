//! X25519 key agreement for session establishment
//!
//! Identities carry a dedicated agreement keypair next to the signing pair;
//! the Ed25519 key is never reused for Diffie-Hellman. A hybrid KEM would
//! replace `agree` and widen the shared secret, nothing else.

use x25519_dalek::{PublicKey as XPublicKey, StaticSecret};

use crate::types::{AgreementPublic, AgreementSecret};

/// Derive the X25519 public key for a secret
pub fn x25519_public(secret: &AgreementSecret) -> AgreementPublic {
    let sk = StaticSecret::from(*secret.expose_bytes());
    AgreementPublic(XPublicKey::from(&sk).to_bytes())
}

/// Compute the raw ECDH shared secret between a local secret and a remote
/// public key. Callers always pass the result through HKDF before use.
pub fn agree(local_secret: &AgreementSecret, remote_public: &AgreementPublic) -> [u8; 32] {
    let sk = StaticSecret::from(*local_secret.expose_bytes());
    let pk = XPublicKey::from(*remote_public.as_bytes());
    sk.diffie_hellman(&pk).to_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_agreement_is_symmetric() {
        let a_secret = AgreementSecret::from_bytes([11u8; 32]);
        let b_secret = AgreementSecret::from_bytes([22u8; 32]);
        let a_public = x25519_public(&a_secret);
        let b_public = x25519_public(&b_secret);

        let ab = agree(&a_secret, &b_public);
        let ba = agree(&b_secret, &a_public);
        assert_eq!(ab, ba);
    }

    #[test]
    fn test_distinct_peers_distinct_secrets() {
        let a_secret = AgreementSecret::from_bytes([11u8; 32]);
        let b_public = x25519_public(&AgreementSecret::from_bytes([22u8; 32]));
        let c_public = x25519_public(&AgreementSecret::from_bytes([33u8; 32]));

        assert_ne!(agree(&a_secret, &b_public), agree(&a_secret, &c_public));
    }
}
