//! Key derivation functions

pub mod hkdf;

pub use hkdf::{derive_key, derive_keys};
