//! Control-plane payloads
//!
//! Bodies of `CONTROL` frames, bincode-encoded inside the signed frame
//! payload. The light-ping promotes a tentative link to active: the pong's
//! challenge signature proves the far side holds the key it claims, beyond
//! what frame-level signing already shows, and both directions carry the
//! agreement key so sessions can start immediately.

use serde::{Deserialize, Serialize};

use lib_crypto::{AgreementPublic, Fingerprint, Signature};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ControlPayload {
    /// Link association probe
    Ping {
        fingerprint: Fingerprint,
        agreement: AgreementPublic,
        challenge: [u8; 16],
    },
    /// Probe answer; `signature` is over the echoed challenge bytes
    Pong {
        agreement: AgreementPublic,
        challenge: [u8; 16],
        signature: Signature,
    },
    /// Offer of stored blobs for sneakernet relay
    BlobOffer { content_ids: Vec<lib_wire::ContentId> },
    /// Interest in offered blobs
    BlobRequest { content_ids: Vec<lib_wire::ContentId> },
}

impl ControlPayload {
    pub fn to_bytes(&self) -> anyhow::Result<Vec<u8>> {
        bincode::serialize(self).map_err(|e| anyhow::anyhow!("control encode: {}", e))
    }

    pub fn from_bytes(bytes: &[u8]) -> anyhow::Result<Self> {
        bincode::deserialize(bytes).map_err(|e| anyhow::anyhow!("control decode: {}", e))
    }
}

/// Body of a `PEER_DISCOVERY` frame. Heartbeats flood, so every node a few
/// hops out learns the sender's agreement key and can encrypt toward it
/// without ever sharing a link.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryPayload {
    pub fingerprint: Fingerprint,
    pub agreement: AgreementPublic,
}

impl DiscoveryPayload {
    pub fn to_bytes(&self) -> anyhow::Result<Vec<u8>> {
        bincode::serialize(self).map_err(|e| anyhow::anyhow!("discovery encode: {}", e))
    }

    pub fn from_bytes(bytes: &[u8]) -> anyhow::Result<Self> {
        bincode::deserialize(bytes).map_err(|e| anyhow::anyhow!("discovery decode: {}", e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lib_crypto::KeyPair;

    #[test]
    fn test_ping_roundtrip() {
        let kp = KeyPair::from_seed(&[6u8; 32]).unwrap();
        let ping = ControlPayload::Ping {
            fingerprint: kp.fingerprint(),
            agreement: kp.agreement_public,
            challenge: [0x42; 16],
        };
        let bytes = ping.to_bytes().unwrap();
        match ControlPayload::from_bytes(&bytes).unwrap() {
            ControlPayload::Ping { challenge, .. } => assert_eq!(challenge, [0x42; 16]),
            other => panic!("unexpected payload: {:?}", other),
        }
    }

    #[test]
    fn test_pong_signature_checks_out() {
        let kp = KeyPair::from_seed(&[6u8; 32]).unwrap();
        let challenge = [9u8; 16];
        let pong = ControlPayload::Pong {
            agreement: kp.agreement_public,
            challenge,
            signature: kp.sign(&challenge),
        };
        let bytes = pong.to_bytes().unwrap();
        match ControlPayload::from_bytes(&bytes).unwrap() {
            ControlPayload::Pong { challenge, signature, .. } => {
                assert!(kp.public.verify(&challenge, &signature));
            }
            other => panic!("unexpected payload: {:?}", other),
        }
    }
}
