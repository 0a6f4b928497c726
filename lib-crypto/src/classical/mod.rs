//! Classical asymmetric cryptography

pub mod ed25519;
pub mod x25519;
