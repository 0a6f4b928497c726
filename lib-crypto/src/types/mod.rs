//! Core type definitions for Weft cryptography

pub mod fingerprint;
pub mod hash;
pub mod keys;
pub mod signatures;

pub use fingerprint::Fingerprint;
pub use hash::Hash;
pub use keys::{AgreementPublic, AgreementSecret, PrivateKey, PublicKey};
pub use signatures::Signature;
