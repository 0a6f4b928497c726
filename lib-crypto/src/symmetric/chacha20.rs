//! ChaCha20-Poly1305 AEAD
//!
//! Nonces are caller-supplied: the session layer owns counter discipline and
//! must never hand the same (key, nonce) pair in twice. These functions do
//! not generate or prepend nonces.

use anyhow::Result;
use chacha20poly1305::{
    aead::{Aead, KeyInit, Payload},
    ChaCha20Poly1305, Key, Nonce,
};

/// AEAD nonce width in bytes (96-bit, counter discipline)
pub const NONCE_LEN: usize = 12;

/// Poly1305 tag width appended to every ciphertext
pub const TAG_LEN: usize = 16;

/// Encrypt and authenticate `plain` under `key`, binding `aad`
pub fn aead_seal(key: &[u8; 32], nonce: &[u8; NONCE_LEN], aad: &[u8], plain: &[u8]) -> Result<Vec<u8>> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    cipher
        .encrypt(Nonce::from_slice(nonce), Payload { msg: plain, aad })
        .map_err(|_| anyhow::anyhow!("AEAD seal failed"))
}

/// Decrypt and verify a ciphertext produced by [`aead_seal`].
/// A tag mismatch (tampered ciphertext, wrong key, wrong aad) is an error.
pub fn aead_open(key: &[u8; 32], nonce: &[u8; NONCE_LEN], aad: &[u8], cipher_text: &[u8]) -> Result<Vec<u8>> {
    if cipher_text.len() < TAG_LEN {
        return Err(anyhow::anyhow!("Ciphertext too short"));
    }
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));
    cipher
        .decrypt(Nonce::from_slice(nonce), Payload { msg: cipher_text, aad })
        .map_err(|_| anyhow::anyhow!("AEAD tag mismatch"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seal_open_roundtrip() -> Result<()> {
        let key = [9u8; 32];
        let nonce = [1u8; NONCE_LEN];
        let aad = b"weft-frame-header";
        let plain = b"weft aead test data";

        let sealed = aead_seal(&key, &nonce, aad, plain)?;
        assert_ne!(&sealed[..plain.len()], plain.as_slice());

        let opened = aead_open(&key, &nonce, aad, &sealed)?;
        assert_eq!(opened, plain);
        Ok(())
    }

    #[test]
    fn test_wrong_aad_fails() -> Result<()> {
        let key = [9u8; 32];
        let nonce = [1u8; NONCE_LEN];
        let sealed = aead_seal(&key, &nonce, b"right", b"payload")?;
        assert!(aead_open(&key, &nonce, b"wrong", &sealed).is_err());
        Ok(())
    }

    #[test]
    fn test_tampered_ciphertext_fails() -> Result<()> {
        let key = [9u8; 32];
        let nonce = [1u8; NONCE_LEN];
        let mut sealed = aead_seal(&key, &nonce, b"aad", b"payload")?;
        sealed[0] ^= 0x01;
        assert!(aead_open(&key, &nonce, b"aad", &sealed).is_err());
        Ok(())
    }

    #[test]
    fn test_nonce_changes_ciphertext() -> Result<()> {
        let key = [9u8; 32];
        let a = aead_seal(&key, &[1u8; NONCE_LEN], b"", b"payload")?;
        let b = aead_seal(&key, &[2u8; NONCE_LEN], b"", b"payload")?;
        assert_ne!(a, b);
        Ok(())
    }
}
