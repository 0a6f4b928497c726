//! Per-peer session state
//!
//! A session holds one symmetric key per direction plus a monotonic send
//! nonce. The nonce layout is 4-byte epoch (bumped on every rekey) followed
//! by an 8-byte counter; a (key, nonce) pair is never reused because the
//! counter only moves forward and the epoch changes with the key.

use std::time::Instant;

use zeroize::{Zeroize, ZeroizeOnDrop};

use lib_crypto::{aead_open, aead_seal, derive_key, PublicKey};

use crate::session::SessionError;

/// AEAD nonce width on the wire (prefixed to every ciphertext)
pub const SESSION_NONCE_LEN: usize = 12;

/// Counter headroom: rotate before the send counter can wrap
const NONCE_SOFT_LIMIT: u64 = u64::MAX - 1024;

/// Directional symmetric keys, zeroized on drop
#[derive(Zeroize, ZeroizeOnDrop)]
struct DirectionalKeys {
    send: [u8; 32],
    recv: [u8; 32],
}

/// Forward-secret state for one remote peer
pub struct Session {
    peer: PublicKey,
    keys: DirectionalKeys,
    epoch: u32,
    send_counter: u64,
    established_at: Instant,
    bytes_sent: u64,
}

impl Session {
    /// Derive a session from a fresh shared secret. The context binds the
    /// two peer ids in a fixed direction so send and recv keys mirror on
    /// the remote side.
    pub fn derive(
        local: &PublicKey,
        peer: &PublicKey,
        shared: &[u8; 32],
        epoch: u32,
        now: Instant,
    ) -> Result<Self, SessionError> {
        let mut send_ctx = Vec::with_capacity(64);
        send_ctx.extend_from_slice(local.as_bytes());
        send_ctx.extend_from_slice(peer.as_bytes());
        let mut recv_ctx = Vec::with_capacity(64);
        recv_ctx.extend_from_slice(peer.as_bytes());
        recv_ctx.extend_from_slice(local.as_bytes());

        let send = derive_key(shared, "weft-session-v1", &send_ctx)
            .map_err(|_| SessionError::Crypto)?;
        let recv = derive_key(shared, "weft-session-v1", &recv_ctx)
            .map_err(|_| SessionError::Crypto)?;

        Ok(Session {
            peer: *peer,
            keys: DirectionalKeys { send, recv },
            epoch,
            send_counter: 0,
            established_at: now,
            bytes_sent: 0,
        })
    }

    pub fn peer(&self) -> &PublicKey {
        &self.peer
    }

    pub fn epoch(&self) -> u32 {
        self.epoch
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }

    pub fn age(&self, now: Instant) -> std::time::Duration {
        now.duration_since(self.established_at)
    }

    fn next_nonce(&mut self) -> Result<[u8; SESSION_NONCE_LEN], SessionError> {
        if self.send_counter >= NONCE_SOFT_LIMIT {
            return Err(SessionError::NonceExhausted);
        }
        let mut nonce = [0u8; SESSION_NONCE_LEN];
        nonce[..4].copy_from_slice(&self.epoch.to_be_bytes());
        nonce[4..].copy_from_slice(&self.send_counter.to_be_bytes());
        self.send_counter += 1;
        Ok(nonce)
    }

    /// Encrypt a payload toward this peer. Output is nonce || ciphertext.
    pub fn encrypt(&mut self, aad: &[u8], plain: &[u8]) -> Result<Vec<u8>, SessionError> {
        let nonce = self.next_nonce()?;
        let sealed =
            aead_seal(&self.keys.send, &nonce, aad, plain).map_err(|_| SessionError::Crypto)?;
        self.bytes_sent += sealed.len() as u64;

        let mut blob = Vec::with_capacity(SESSION_NONCE_LEN + sealed.len());
        blob.extend_from_slice(&nonce);
        blob.extend_from_slice(&sealed);
        Ok(blob)
    }

    /// Decrypt a nonce-prefixed ciphertext from this peer
    pub fn decrypt(&self, aad: &[u8], blob: &[u8]) -> Result<Vec<u8>, SessionError> {
        if blob.len() < SESSION_NONCE_LEN {
            return Err(SessionError::Crypto);
        }
        let mut nonce = [0u8; SESSION_NONCE_LEN];
        nonce.copy_from_slice(&blob[..SESSION_NONCE_LEN]);
        aead_open(&self.keys.recv, &nonce, aad, &blob[SESSION_NONCE_LEN..])
            .map_err(|_| SessionError::Crypto)
    }

    /// True when age, traffic volume, or counter headroom call for a rekey
    pub fn needs_rotation(
        &self,
        now: Instant,
        max_age: std::time::Duration,
        max_bytes: u64,
    ) -> bool {
        self.age(now) >= max_age
            || self.bytes_sent >= max_bytes
            || self.send_counter >= NONCE_SOFT_LIMIT
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lib_crypto::agree;
    use lib_crypto::KeyPair;
    use std::time::Duration;

    fn session_pair() -> (Session, Session) {
        let a = KeyPair::from_seed(&[1u8; 32]).unwrap();
        let b = KeyPair::from_seed(&[2u8; 32]).unwrap();
        let shared_a = agree(a.agreement_secret(), &b.agreement_public);
        let shared_b = agree(b.agreement_secret(), &a.agreement_public);
        assert_eq!(shared_a, shared_b);

        let now = Instant::now();
        let sa = Session::derive(&a.public, &b.public, &shared_a, 0, now).unwrap();
        let sb = Session::derive(&b.public, &a.public, &shared_b, 0, now).unwrap();
        (sa, sb)
    }

    #[test]
    fn test_directional_roundtrip() {
        let (mut a, b) = session_pair();
        let blob = a.encrypt(b"aad", b"over the mesh").unwrap();
        assert_eq!(b.decrypt(b"aad", &blob).unwrap(), b"over the mesh");
    }

    #[test]
    fn test_directions_use_distinct_keys() {
        let (mut a, mut b) = session_pair();
        let from_a = a.encrypt(b"", b"x").unwrap();
        let from_b = b.encrypt(b"", b"x").unwrap();
        // a cannot decrypt its own sending direction
        assert!(a.decrypt(b"", &from_a).is_err());
        assert!(b.decrypt(b"", &from_b).is_err());
    }

    #[test]
    fn test_nonces_never_repeat() {
        let (mut a, _) = session_pair();
        let blob1 = a.encrypt(b"", b"same").unwrap();
        let blob2 = a.encrypt(b"", b"same").unwrap();
        assert_ne!(blob1[..SESSION_NONCE_LEN], blob2[..SESSION_NONCE_LEN]);
        assert_ne!(blob1, blob2);
    }

    #[test]
    fn test_rotation_thresholds() {
        let (mut a, _) = session_pair();
        let now = Instant::now();
        assert!(!a.needs_rotation(now, Duration::from_secs(60), 1 << 30));

        a.encrypt(b"", &vec![0u8; 2048]).unwrap();
        assert!(a.needs_rotation(now, Duration::from_secs(60), 1024));
        assert!(a.needs_rotation(now + Duration::from_secs(61), Duration::from_secs(60), 1 << 30));
    }

    #[test]
    fn test_wrong_aad_rejected() {
        let (mut a, b) = session_pair();
        let blob = a.encrypt(b"header", b"payload").unwrap();
        assert!(b.decrypt(b"other", &blob).is_err());
    }
}
