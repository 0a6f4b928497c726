//! Typed wire protocol errors

use thiserror::Error;

/// Decode and framing failures. Every variant carries enough structure for
/// the relay pipeline to count it without parsing strings.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WireError {
    #[error("frame too short: need {need} bytes, got {got}")]
    TooShort { need: usize, got: usize },

    #[error("unsupported protocol version {0}")]
    BadVersion(u8),

    #[error("unknown frame type {0:#04x}")]
    BadType(u8),

    #[error("declared payload length {declared} does not match {actual} available bytes")]
    BadLength { declared: u32, actual: usize },

    #[error("frame signature does not verify against sender id")]
    BadSignature,

    #[error("invalid fragment coordinates {index}/{count}")]
    BadFragment { index: u16, count: u16 },

    #[error("message needs {0} fragments, exceeding the fragment counter")]
    TooManyFragments(usize),

    #[error("reassembly buffer at capacity")]
    ReassemblyFull,

    #[error("fragment size {0} below protocol floor")]
    FragmentSizeTooSmall(usize),
}
