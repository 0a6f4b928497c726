//! Typed engine errors
//!
//! One variant per error kind the stats surface counts. Inbound-path
//! failures never escape the pipeline; these types surface on the submit
//! path and at startup.

use thiserror::Error;

use lib_identity::SessionError;
use lib_storage::StoreError;
use lib_wire::WireError;

#[derive(Debug, Error)]
pub enum MeshError {
    #[error("transport: {0}")]
    Transport(String),

    #[error("protocol: {0}")]
    Protocol(#[from] WireError),

    #[error("crypto failure: {0}")]
    Crypto(String),

    #[error("session: {0}")]
    Session(#[from] SessionError),

    #[error("persistence: {0}")]
    Persistence(#[from] StoreError),

    #[error("capacity: {0}")]
    Capacity(&'static str),

    #[error("policy: {0}")]
    Policy(&'static str),
}
