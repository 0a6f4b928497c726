//! Weft Wire Protocol
//!
//! The fixed-layout authenticated frame that every transport carries, plus
//! fragmentation/reassembly across transport MTUs and content addressing for
//! blob payloads. Encoding and decoding are pure; nothing here allocates a
//! task or touches a socket.

pub mod content;
pub mod error;
pub mod fragment;
pub mod frame;

pub use content::{content_id, ContentId};
pub use error::WireError;
pub use fragment::{split_payload, ReassemblyBuffer};
pub use frame::{
    frame_hash, Frame, FrameHeader, FrameType, Priority, DEFAULT_TTL, FLAG_ENCRYPTED,
    FRAME_HEADER_LEN, MAX_PAYLOAD_LEN, MAX_TTL, MIN_FRAGMENT_SIZE, PROTOCOL_VERSION,
};
