//! Authenticated frame codec
//!
//! Fixed-layout, big-endian, no self-describing framing. The header is 136
//! bytes: 132 bytes of fields plus 4 reserved pad zeroes that keep the
//! payload 8-byte aligned after the signature. The signature covers all 136
//! header bytes with the signature field and the relay-mutable TTL byte
//! zeroed, then the payload, so a relay can verify and re-emit a frame
//! without being able to decrypt it.
//!
//! ```text
//! offset  size  field
//!      0     1  version
//!      1     1  type
//!      2     1  ttl
//!      3     1  flags
//!      4     8  timestamp (ms since epoch)
//!     12    32  sender id (Ed25519 public key)
//!     44    16  message id (uniformly random)
//!     60     2  fragment index
//!     62     2  fragment count
//!     64     4  payload length
//!     68    64  signature
//!    132     4  reserved (zero)
//!    136     -  payload
//! ```

use serde::{Deserialize, Serialize};

use lib_crypto::{hash_sha256_parts, Hash, KeyPair, PublicKey, Signature};

use crate::error::WireError;

/// Current wire protocol version
pub const PROTOCOL_VERSION: u8 = 1;

/// Fixed header length in bytes (132 field bytes + 4 reserved pad zeroes)
pub const FRAME_HEADER_LEN: usize = 136;

/// Hop budget for locally originated frames
pub const DEFAULT_TTL: u8 = 7;

/// Protocol maximum TTL; frames claiming more are a policy violation
pub const MAX_TTL: u8 = 16;

/// Upper bound on a single frame's payload; larger messages fragment
pub const MAX_PAYLOAD_LEN: usize = 1_048_576;

/// Smallest MTU a transport may advertise
pub const MIN_FRAGMENT_SIZE: usize = 512;

/// Payload is session-encrypted (user data toward a single recipient)
pub const FLAG_ENCRYPTED: u8 = 0x01;

const SIG_OFFSET: usize = 68;
const SIG_END: usize = SIG_OFFSET + 64;

/// Frame payload kinds, in wire-byte order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum FrameType {
    Text = 0x01,
    FileMetadata = 0x02,
    FileChunk = 0x03,
    Voice = 0x04,
    Control = 0x05,
    PeerDiscovery = 0x06,
    KeyExchange = 0x07,
}

impl FrameType {
    pub fn from_wire(byte: u8) -> Result<Self, WireError> {
        match byte {
            0x01 => Ok(FrameType::Text),
            0x02 => Ok(FrameType::FileMetadata),
            0x03 => Ok(FrameType::FileChunk),
            0x04 => Ok(FrameType::Voice),
            0x05 => Ok(FrameType::Control),
            0x06 => Ok(FrameType::PeerDiscovery),
            0x07 => Ok(FrameType::KeyExchange),
            other => Err(WireError::BadType(other)),
        }
    }

    pub fn to_wire(self) -> u8 {
        self as u8
    }

    /// Scheduling priority for this frame type
    pub fn priority(self) -> Priority {
        match self {
            FrameType::Control | FrameType::PeerDiscovery | FrameType::KeyExchange => {
                Priority::Control
            }
            FrameType::Voice => Priority::Voice,
            FrameType::Text => Priority::Text,
            FrameType::FileMetadata | FrameType::FileChunk => Priority::File,
        }
    }
}

/// Scheduler priority levels, highest first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Priority {
    Control = 0,
    Voice = 1,
    Text = 2,
    File = 3,
}

impl Priority {
    /// Number of scheduling levels
    pub const LEVELS: usize = 4;

    pub fn from_index(index: usize) -> Option<Self> {
        match index {
            0 => Some(Priority::Control),
            1 => Some(Priority::Voice),
            2 => Some(Priority::Text),
            3 => Some(Priority::File),
            _ => None,
        }
    }

    pub fn index(self) -> usize {
        self as usize
    }

    /// One level more urgent, saturating at Control. Used by the scheduler's
    /// anti-starvation promotion.
    pub fn promoted(self) -> Self {
        match self {
            Priority::Control | Priority::Voice => Priority::Control,
            Priority::Text => Priority::Voice,
            Priority::File => Priority::Text,
        }
    }
}

/// Parsed frame header fields
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameHeader {
    pub version: u8,
    pub frame_type: FrameType,
    pub ttl: u8,
    pub flags: u8,
    pub timestamp_ms: u64,
    pub sender_id: PublicKey,
    pub message_id: [u8; 16],
    pub fragment_index: u16,
    pub fragment_count: u16,
    pub payload_len: u32,
}

/// One authenticated wire frame: header, detached signature, payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub header: FrameHeader,
    pub signature: Signature,
    pub payload: Vec<u8>,
}

impl Frame {
    /// Assemble an unsigned frame; `sign_with` must run before encode.
    pub fn unsigned(header: FrameHeader, payload: Vec<u8>) -> Self {
        Frame {
            header,
            signature: Signature::zeroed(),
            payload,
        }
    }

    /// Serialize header + payload to wire bytes
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(FRAME_HEADER_LEN + self.payload.len());
        self.encode_header_into(&mut out, &self.signature);
        out.extend_from_slice(&self.payload);
        out
    }

    fn encode_header_into(&self, out: &mut Vec<u8>, signature: &Signature) {
        let h = &self.header;
        out.push(h.version);
        out.push(h.frame_type.to_wire());
        out.push(h.ttl);
        out.push(h.flags);
        out.extend_from_slice(&h.timestamp_ms.to_be_bytes());
        out.extend_from_slice(h.sender_id.as_bytes());
        out.extend_from_slice(&h.message_id);
        out.extend_from_slice(&h.fragment_index.to_be_bytes());
        out.extend_from_slice(&h.fragment_count.to_be_bytes());
        out.extend_from_slice(&h.payload_len.to_be_bytes());
        out.extend_from_slice(signature.as_bytes());
        out.extend_from_slice(&[0u8; 4]);
    }

    /// The byte string the signature covers: every header byte with the
    /// signature field and the TTL byte zeroed, then the payload. The TTL is
    /// excluded because relays decrement it in flight; everything else a
    /// relay touches would break the signature.
    pub fn signing_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(FRAME_HEADER_LEN + self.payload.len());
        self.encode_header_into(&mut out, &Signature::zeroed());
        out[2] = 0; // ttl
        out.extend_from_slice(&self.payload);
        out
    }

    /// Sign the frame with the sender's identity key
    pub fn sign_with(&mut self, keypair: &KeyPair) {
        self.signature = keypair.sign(&self.signing_bytes());
    }

    /// Verify the signature against the header's sender id
    pub fn verify(&self) -> bool {
        self.header
            .sender_id
            .verify(&self.signing_bytes(), &self.signature)
    }

    /// Parse a frame from wire bytes without checking the signature.
    /// The relay pipeline verifies separately so the two failures count
    /// under different reasons.
    pub fn decode(bytes: &[u8]) -> Result<Frame, WireError> {
        if bytes.len() < FRAME_HEADER_LEN {
            return Err(WireError::TooShort {
                need: FRAME_HEADER_LEN,
                got: bytes.len(),
            });
        }

        let version = bytes[0];
        if version != PROTOCOL_VERSION {
            return Err(WireError::BadVersion(version));
        }

        let frame_type = FrameType::from_wire(bytes[1])?;
        let ttl = bytes[2];
        let flags = bytes[3];

        let mut ts = [0u8; 8];
        ts.copy_from_slice(&bytes[4..12]);
        let timestamp_ms = u64::from_be_bytes(ts);

        let sender_id = PublicKey::try_from_slice(&bytes[12..44])
            .map_err(|_| WireError::TooShort { need: 32, got: 0 })?;

        let mut message_id = [0u8; 16];
        message_id.copy_from_slice(&bytes[44..60]);

        let fragment_index = u16::from_be_bytes([bytes[60], bytes[61]]);
        let fragment_count = u16::from_be_bytes([bytes[62], bytes[63]]);
        if fragment_count == 0
            || fragment_index >= fragment_count
            || (fragment_count == 1 && fragment_index != 0)
        {
            return Err(WireError::BadFragment {
                index: fragment_index,
                count: fragment_count,
            });
        }

        let mut len = [0u8; 4];
        len.copy_from_slice(&bytes[64..68]);
        let payload_len = u32::from_be_bytes(len);

        let actual = bytes.len() - FRAME_HEADER_LEN;
        if payload_len as usize != actual || payload_len as usize > MAX_PAYLOAD_LEN {
            return Err(WireError::BadLength {
                declared: payload_len,
                actual,
            });
        }

        let signature = Signature::try_from_slice(&bytes[SIG_OFFSET..SIG_END])
            .map_err(|_| WireError::TooShort { need: 64, got: 0 })?;

        let payload = bytes[FRAME_HEADER_LEN..].to_vec();

        Ok(Frame {
            header: FrameHeader {
                version,
                frame_type,
                ttl,
                flags,
                timestamp_ms,
                sender_id,
                message_id,
                fragment_index,
                fragment_count,
                payload_len,
            },
            signature,
            payload,
        })
    }

    /// Parse and verify in one step
    pub fn decode_verified(bytes: &[u8]) -> Result<Frame, WireError> {
        let frame = Frame::decode(bytes)?;
        if !frame.verify() {
            return Err(WireError::BadSignature);
        }
        Ok(frame)
    }

    /// Dedup key for this frame
    pub fn frame_hash(&self) -> Hash {
        frame_hash(
            &self.header.sender_id,
            &self.header.message_id,
            self.header.fragment_index,
        )
    }

    /// Total wire size of this frame
    pub fn wire_len(&self) -> usize {
        FRAME_HEADER_LEN + self.payload.len()
    }

    /// True when the payload carries session ciphertext
    pub fn is_encrypted(&self) -> bool {
        self.header.flags & FLAG_ENCRYPTED != 0
    }
}

/// Dedup key: SHA-256 over sender id, message id, and fragment index.
/// Identifies one fragment of one message from one sender.
pub fn frame_hash(sender: &PublicKey, message_id: &[u8; 16], fragment_index: u16) -> Hash {
    hash_sha256_parts(&[
        sender.as_bytes(),
        message_id,
        &fragment_index.to_be_bytes(),
    ])
}
