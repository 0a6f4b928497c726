//! Random identifiers
//!
//! Message ids are uniformly random 16-byte values; together with the sender
//! key they name a message for deduplication and reassembly. AEAD nonces are
//! NOT generated here: sessions run a counter, and only non-session uses
//! (at-rest key wrapping) draw a random nonce.

use anyhow::Result;

use crate::random::fill_random;

/// Generate a random 12-byte AEAD nonce for one-shot (non-session) sealing
pub fn generate_nonce() -> Result<[u8; 12]> {
    let mut nonce = [0u8; 12];
    fill_random(&mut nonce)?;
    Ok(nonce)
}

/// Generate a random 16-byte message id
pub fn generate_message_id() -> Result<[u8; 16]> {
    let mut id = [0u8; 16];
    fill_random(&mut id)?;
    Ok(id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_ids_are_unique() -> Result<()> {
        let a = generate_message_id()?;
        let b = generate_message_id()?;
        assert_ne!(a, b);
        Ok(())
    }
}
