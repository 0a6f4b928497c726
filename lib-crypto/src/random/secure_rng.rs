//! CSPRNG access
//!
//! All randomness comes from the operating system entropy source via
//! `getrandom`. If the platform cannot supply entropy the call errors;
//! there is no non-cryptographic fallback anywhere in the engine.

use anyhow::Result;

/// Fill a buffer with cryptographically secure random bytes
pub fn fill_random(buf: &mut [u8]) -> Result<()> {
    getrandom::getrandom(buf).map_err(|e| anyhow::anyhow!("OS entropy unavailable: {}", e))
}

/// Produce `n` cryptographically secure random bytes
pub fn secure_random(n: usize) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; n];
    fill_random(&mut buf)?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fill_produces_entropy() -> Result<()> {
        let mut a = [0u8; 32];
        let mut b = [0u8; 32];
        fill_random(&mut a)?;
        fill_random(&mut b)?;
        assert_ne!(a, b);
        Ok(())
    }

    #[test]
    fn test_requested_length() -> Result<()> {
        assert_eq!(secure_random(16)?.len(), 16);
        assert_eq!(secure_random(0)?.len(), 0);
        Ok(())
    }
}
