//! Weft Cryptography Foundation Module
//!
//! Pure primitives for the mesh engine: Ed25519 identity keys, X25519 key
//! agreement, ChaCha20-Poly1305 AEAD, HKDF-SHA256 derivation, SHA-256
//! hashing, and a fail-closed CSPRNG. Nothing here blocks or touches disk.

// Core modules
pub mod classical;
pub mod hashing;
pub mod kdf;
pub mod keypair;
pub mod random;
pub mod symmetric;
pub mod types;

// Re-export commonly used types and functions
pub use types::{
    fingerprint::Fingerprint,
    hash::Hash,
    keys::{AgreementPublic, AgreementSecret, PrivateKey, PublicKey},
    signatures::Signature,
};

pub use classical::ed25519::{ed25519_sign, verify_signature};
pub use classical::x25519::{agree, x25519_public};

pub use hashing::{hash_sha256, hash_sha256_parts};

pub use kdf::hkdf::{derive_key, derive_keys};

pub use keypair::generation::KeyPair;

pub use random::{fill_random, generate_message_id, generate_nonce, secure_random};

pub use symmetric::chacha20::{aead_open, aead_seal};
