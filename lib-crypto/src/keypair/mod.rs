//! Identity keypair generation and use

pub mod generation;

pub use generation::KeyPair;
