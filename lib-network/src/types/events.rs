//! Application-facing events and message envelopes

use lib_crypto::{Fingerprint, PublicKey};
use lib_wire::FrameType;

/// Outcome of a `submit` call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitStatus {
    /// Handed to the scheduler with at least one plausible path out
    Sent,
    /// Persisted for replay; no connected path right now, or back-pressure
    /// diverted the submission
    Queued,
}

/// One delivered message on the subscribe stream
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    pub sender: PublicKey,
    pub fingerprint: Fingerprint,
    pub frame_type: FrameType,
    pub payload: Vec<u8>,
    pub arrived_at_ms: u64,
    /// True when the payload came through an authenticated session decrypt;
    /// false for cleartext broadcast traffic
    pub session_verified: bool,
}

/// Mesh membership changes, consumed by the application and the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MeshEvent {
    PeerConnected(PublicKey),
    PeerDisconnected(PublicKey),
}
