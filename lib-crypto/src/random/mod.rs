//! Fail-closed secure randomness

pub mod nonce;
pub mod secure_rng;

pub use nonce::{generate_message_id, generate_nonce};
pub use secure_rng::{fill_random, secure_random};
