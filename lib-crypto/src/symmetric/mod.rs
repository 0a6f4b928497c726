//! Symmetric authenticated encryption

pub mod chacha20;

pub use chacha20::{aead_open, aead_seal};
