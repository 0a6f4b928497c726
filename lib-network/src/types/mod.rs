//! Shared engine types

pub mod control;
pub mod events;
pub mod peer;

pub use control::{ControlPayload, DiscoveryPayload};
pub use events::{IncomingMessage, MeshEvent, SubmitStatus};
pub use peer::PeerRecord;
