//! Per-peer forward-secret sessions
//!
//! The manager owns every live session, a small ring of retired sessions
//! kept to decrypt late-arriving frames, and the in-flight rekey exchanges.
//! The initial session for a peer comes from long-term ECDH; every rekey
//! after that is an ephemeral-ephemeral exchange carried in `KEY_EXCHANGE`
//! frames, so compromise of the long-term keys does not unwind rekeyed
//! traffic.

pub mod state;

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use lib_crypto::{
    agree, fill_random, x25519_public, AgreementPublic, AgreementSecret, KeyPair, PublicKey,
};

pub use state::Session;

/// Session-layer failures, each mapped to one stats counter by the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("no session established with peer")]
    NoSession,
    #[error("peer agreement key unknown")]
    UnknownPeer,
    #[error("AEAD seal/open failed")]
    Crypto,
    #[error("send nonce space exhausted")]
    NonceExhausted,
    #[error("rekey exchange failed")]
    RekeyFailed,
}

/// Rotation policy and retirement depth
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Rekey after this much wall-clock time
    pub rotate_interval: Duration,
    /// Rekey after this many ciphertext bytes
    pub rotate_bytes: u64,
    /// Abandon a rekey exchange that takes longer than this
    pub rekey_deadline: Duration,
    /// Retired sessions kept per peer for late frames
    pub retired_keep: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            rotate_interval: Duration::from_secs(24 * 60 * 60),
            rotate_bytes: 1 << 30,
            rekey_deadline: Duration::from_secs(10),
            retired_keep: 2,
        }
    }
}

/// Body of a `KEY_EXCHANGE` frame (bincode on the wire, inside the signed
/// frame payload). Frames carry no destination field, so `to` names the
/// intended responder; relays flood the frame onward without acting on it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum KeyExchangePayload {
    /// Initiator offers a fresh ephemeral public for the next epoch
    RekeyInit {
        to: PublicKey,
        epoch: u32,
        ephemeral: AgreementPublic,
    },
    /// Responder answers with its own ephemeral for the same epoch
    RekeyAck {
        to: PublicKey,
        epoch: u32,
        ephemeral: AgreementPublic,
    },
}

impl KeyExchangePayload {
    /// The peer this exchange is addressed to
    pub fn recipient(&self) -> &PublicKey {
        match self {
            KeyExchangePayload::RekeyInit { to, .. } => to,
            KeyExchangePayload::RekeyAck { to, .. } => to,
        }
    }

    pub fn to_bytes(&self) -> anyhow::Result<Vec<u8>> {
        bincode::serialize(self).map_err(|e| anyhow::anyhow!("key exchange encode: {}", e))
    }

    pub fn from_bytes(bytes: &[u8]) -> anyhow::Result<Self> {
        bincode::deserialize(bytes).map_err(|e| anyhow::anyhow!("key exchange decode: {}", e))
    }
}

struct PendingRekey {
    epoch: u32,
    ephemeral_secret: AgreementSecret,
    started: Instant,
}

/// Owner of all per-peer session state
pub struct SessionManager {
    local: KeyPair,
    config: SessionConfig,
    agreements: HashMap<PublicKey, AgreementPublic>,
    sessions: HashMap<PublicKey, Session>,
    retired: HashMap<PublicKey, VecDeque<Session>>,
    pending: HashMap<PublicKey, PendingRekey>,
}

impl SessionManager {
    pub fn new(local: KeyPair, config: SessionConfig) -> Self {
        SessionManager {
            local,
            config,
            agreements: HashMap::new(),
            sessions: HashMap::new(),
            retired: HashMap::new(),
            pending: HashMap::new(),
        }
    }

    /// Swap in a rotated local identity. Every session and exchange dies
    /// with the old keys; peers re-establish through the light-ping path.
    pub fn set_local(&mut self, local: KeyPair) {
        self.local = local;
        self.sessions.clear();
        self.retired.clear();
        self.pending.clear();
    }

    /// Record a peer's agreement key, learned from the light-ping
    pub fn register_peer(&mut self, peer: PublicKey, agreement: AgreementPublic) {
        self.agreements.insert(peer, agreement);
    }

    pub fn has_session(&self, peer: &PublicKey) -> bool {
        self.sessions.contains_key(peer)
    }

    /// True when the peer's agreement key is known, so a session can be
    /// established on demand
    pub fn knows_peer(&self, peer: &PublicKey) -> bool {
        self.agreements.contains_key(peer)
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Establish the epoch-0 session from long-term ECDH if none exists
    pub fn ensure_session(&mut self, peer: &PublicKey, now: Instant) -> Result<(), SessionError> {
        if self.sessions.contains_key(peer) {
            return Ok(());
        }
        let remote = self
            .agreements
            .get(peer)
            .ok_or(SessionError::UnknownPeer)?;
        let shared = agree(self.local.agreement_secret(), remote);
        let session = Session::derive(&self.local.public, peer, &shared, 0, now)?;
        debug!(peer = %peer.fingerprint(), "established initial session");
        self.sessions.insert(*peer, session);
        Ok(())
    }

    /// Encrypt toward a peer, establishing the initial session on demand
    pub fn encrypt(
        &mut self,
        peer: &PublicKey,
        aad: &[u8],
        plain: &[u8],
        now: Instant,
    ) -> Result<Vec<u8>, SessionError> {
        self.ensure_session(peer, now)?;
        self.sessions
            .get_mut(peer)
            .ok_or(SessionError::NoSession)?
            .encrypt(aad, plain)
    }

    /// Decrypt from a peer: the live session first, then the retired ring
    /// for frames sealed just before a rekey.
    pub fn decrypt(
        &mut self,
        peer: &PublicKey,
        aad: &[u8],
        blob: &[u8],
        now: Instant,
    ) -> Result<Vec<u8>, SessionError> {
        self.ensure_session(peer, now)?;
        if let Some(session) = self.sessions.get(peer) {
            if let Ok(plain) = session.decrypt(aad, blob) {
                return Ok(plain);
            }
        }
        if let Some(ring) = self.retired.get(peer) {
            for old in ring.iter().rev() {
                if let Ok(plain) = old.decrypt(aad, blob) {
                    return Ok(plain);
                }
            }
        }
        Err(SessionError::Crypto)
    }

    /// Peers whose sessions have crossed a rotation threshold
    pub fn rotation_due(&self, now: Instant) -> Vec<PublicKey> {
        self.sessions
            .iter()
            .filter(|(peer, session)| {
                !self.pending.contains_key(peer)
                    && session.needs_rotation(
                        now,
                        self.config.rotate_interval,
                        self.config.rotate_bytes,
                    )
            })
            .map(|(peer, _)| *peer)
            .collect()
    }

    /// Start an ephemeral rekey with a peer; the returned payload goes out
    /// in a `KEY_EXCHANGE` frame.
    pub fn initiate_rekey(
        &mut self,
        peer: &PublicKey,
        now: Instant,
    ) -> Result<KeyExchangePayload, SessionError> {
        let epoch = self
            .sessions
            .get(peer)
            .map(|s| s.epoch() + 1)
            .ok_or(SessionError::NoSession)?;

        let mut seed = [0u8; 32];
        fill_random(&mut seed).map_err(|_| SessionError::Crypto)?;
        let ephemeral_secret = AgreementSecret::from_bytes(seed);
        let ephemeral = x25519_public(&ephemeral_secret);

        self.pending.insert(
            *peer,
            PendingRekey {
                epoch,
                ephemeral_secret,
                started: now,
            },
        );
        Ok(KeyExchangePayload::RekeyInit {
            to: *peer,
            epoch,
            ephemeral,
        })
    }

    /// Process an inbound `KEY_EXCHANGE` payload. Returns the reply to send
    /// back, if any.
    pub fn handle_key_exchange(
        &mut self,
        peer: &PublicKey,
        payload: KeyExchangePayload,
        now: Instant,
    ) -> Result<Option<KeyExchangePayload>, SessionError> {
        match payload {
            KeyExchangePayload::RekeyInit { epoch, ephemeral, .. } => {
                let mut seed = [0u8; 32];
                fill_random(&mut seed).map_err(|_| SessionError::Crypto)?;
                let our_secret = AgreementSecret::from_bytes(seed);
                let our_public = x25519_public(&our_secret);

                let shared = agree(&our_secret, &ephemeral);
                let session = Session::derive(&self.local.public, peer, &shared, epoch, now)?;
                self.install(peer, session);
                Ok(Some(KeyExchangePayload::RekeyAck {
                    to: *peer,
                    epoch,
                    ephemeral: our_public,
                }))
            }
            KeyExchangePayload::RekeyAck { epoch, ephemeral, .. } => {
                let pending = self.pending.remove(peer).ok_or(SessionError::RekeyFailed)?;
                if pending.epoch != epoch {
                    warn!(peer = %peer.fingerprint(), "rekey ack for stale epoch");
                    return Err(SessionError::RekeyFailed);
                }
                let shared = agree(&pending.ephemeral_secret, &ephemeral);
                let session = Session::derive(&self.local.public, peer, &shared, epoch, now)?;
                self.install(peer, session);
                Ok(None)
            }
        }
    }

    fn install(&mut self, peer: &PublicKey, session: Session) {
        if let Some(old) = self.sessions.insert(*peer, session) {
            let ring = self.retired.entry(*peer).or_default();
            ring.push_back(old);
            while ring.len() > self.config.retired_keep {
                ring.pop_front();
            }
        }
    }

    /// Abandon rekey exchanges past their deadline; callers retry later.
    /// Returns the affected peers.
    pub fn sweep_rekeys(&mut self, now: Instant) -> Vec<PublicKey> {
        let deadline = self.config.rekey_deadline;
        let expired: Vec<PublicKey> = self
            .pending
            .iter()
            .filter(|(_, p)| now.duration_since(p.started) >= deadline)
            .map(|(peer, _)| *peer)
            .collect();
        for peer in &expired {
            self.pending.remove(peer);
            warn!(peer = %peer.fingerprint(), "rekey exchange timed out");
        }
        expired
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager_pair() -> (SessionManager, SessionManager, PublicKey, PublicKey) {
        let a = KeyPair::from_seed(&[1u8; 32]).unwrap();
        let b = KeyPair::from_seed(&[2u8; 32]).unwrap();
        let a_id = a.public;
        let b_id = b.public;

        let mut ma = SessionManager::new(a.clone(), SessionConfig::default());
        let mut mb = SessionManager::new(b.clone(), SessionConfig::default());
        ma.register_peer(b_id, b.agreement_public);
        mb.register_peer(a_id, a.agreement_public);
        (ma, mb, a_id, b_id)
    }

    #[test]
    fn test_end_to_end_encrypt_decrypt() {
        let (mut ma, mut mb, a_id, b_id) = manager_pair();
        let now = Instant::now();

        let blob = ma.encrypt(&b_id, b"aad", b"hello", now).unwrap();
        let plain = mb.decrypt(&a_id, b"aad", &blob, now).unwrap();
        assert_eq!(plain, b"hello");
    }

    #[test]
    fn test_unknown_peer_fails() {
        let (mut ma, _, _, _) = manager_pair();
        let stranger = KeyPair::from_seed(&[9u8; 32]).unwrap().public;
        assert_eq!(
            ma.encrypt(&stranger, b"", b"x", Instant::now()),
            Err(SessionError::UnknownPeer)
        );
    }

    #[test]
    fn test_rekey_roundtrip() {
        let (mut ma, mut mb, a_id, b_id) = manager_pair();
        let now = Instant::now();

        // Establish epoch 0 both ways
        let blob = ma.encrypt(&b_id, b"", b"warmup", now).unwrap();
        mb.decrypt(&a_id, b"", &blob, now).unwrap();

        // A initiates; B answers; A completes
        let init = ma.initiate_rekey(&b_id, now).unwrap();
        let ack = mb.handle_key_exchange(&a_id, init, now).unwrap().unwrap();
        assert!(ma.handle_key_exchange(&b_id, ack, now).unwrap().is_none());

        // Traffic flows under the new epoch
        let blob = ma.encrypt(&b_id, b"", b"post-rekey", now).unwrap();
        assert_eq!(mb.decrypt(&a_id, b"", &blob, now).unwrap(), b"post-rekey");
    }

    #[test]
    fn test_retired_ring_decrypts_late_frames() {
        let (mut ma, mut mb, a_id, b_id) = manager_pair();
        let now = Instant::now();

        // Seal a frame under epoch 0, deliver it after the rekey lands
        let late = ma.encrypt(&b_id, b"", b"in flight", now).unwrap();
        mb.encrypt(&a_id, b"", b"warmup", now).unwrap();

        let init = ma.initiate_rekey(&b_id, now).unwrap();
        let ack = mb.handle_key_exchange(&a_id, init, now).unwrap().unwrap();
        ma.handle_key_exchange(&b_id, ack, now).unwrap();

        assert_eq!(mb.decrypt(&a_id, b"", &late, now).unwrap(), b"in flight");
    }

    #[test]
    fn test_rekey_deadline_sweep() {
        let (mut ma, _mb, _a_id, b_id) = manager_pair();
        let now = Instant::now();
        ma.encrypt(&b_id, b"", b"warmup", now).unwrap();

        let _init = ma.initiate_rekey(&b_id, now).unwrap();
        let later = now + Duration::from_secs(11);
        assert_eq!(ma.sweep_rekeys(later), vec![b_id]);

        // An ack landing after the sweep has no pending exchange to finish
        let ack = KeyExchangePayload::RekeyAck {
            to: ma.local.public,
            epoch: 1,
            ephemeral: x25519_public(&AgreementSecret::from_bytes([5u8; 32])),
        };
        assert!(matches!(
            ma.handle_key_exchange(&b_id, ack, later),
            Err(SessionError::RekeyFailed)
        ));
    }

    #[test]
    fn test_rotation_clears_sessions() {
        let (mut ma, _, _, b_id) = manager_pair();
        let now = Instant::now();
        ma.encrypt(&b_id, b"", b"x", now).unwrap();
        assert!(ma.has_session(&b_id));

        let rotated = KeyPair::generate().unwrap();
        ma.set_local(rotated);
        assert!(!ma.has_session(&b_id));
    }
}
