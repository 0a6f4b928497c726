//! Weft Identity Management
//!
//! Owns the single long-term local identity (persisted encrypted at rest)
//! and the per-peer forward-secret session state. Sessions are ephemeral and
//! recomputed after restart; the identity file survives and can be rotated
//! without touching anything recorded about remote peers.

pub mod identity;
pub mod session;

pub use identity::store::{IdentityStore, IDENTITY_SCHEMA_VERSION};
pub use identity::WeftIdentity;
pub use session::{
    KeyExchangePayload, Session, SessionConfig, SessionError, SessionManager,
};
