//! Content hashing

pub mod sha256;

pub use sha256::{hash_sha256, hash_sha256_parts};
