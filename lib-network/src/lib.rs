//! Weft Mesh Protocol - Decentralized Network Communication
//!
//! The mesh forwarding engine: flood routing with dedup and TTL bounds,
//! a priority/bandwidth scheduler, store-and-forward over the durable
//! queue, the Known-Nodes Ledger feeding watering-hole retries, and a
//! transport multiplexer over heterogeneous links. One engine handle per
//! process; lifecycle is `init -> run -> shutdown`.

// Re-exports for external use
pub use crate::config::MeshConfig;
pub use crate::error::MeshError;
pub use crate::mesh::server::WeftMeshEngine;
pub use crate::stats::{Counters, StatsSnapshot};
pub use crate::types::{ControlPayload, IncomingMessage, MeshEvent, PeerRecord, SubmitStatus};

// Peer registry (single source of truth for connected-peer data)
pub use crate::peer_registry::{
    new_shared_registry, PeerRegistry, RegistryConfig, SharedPeerRegistry,
};

// Transport abstraction
pub use crate::transport::{CostClass, Link, LinkId, MemoryLink, TransportMux};

// Core modules
pub mod config;
pub mod error;
pub mod mesh;
pub mod peer_registry;
pub mod routing;
pub mod stats;
pub mod transport;
pub mod types;

// Sibling crates, re-exported for engine embedders
pub use lib_crypto;
pub use lib_identity;
pub use lib_storage;
pub use lib_wire;
