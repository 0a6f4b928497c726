//! Engine configuration

use std::time::Duration;

/// Every tunable the mesh engine recognizes, with protocol defaults.
/// Callers construct one and hand it to `WeftMeshEngine::init`; there is no
/// environment parsing.
#[derive(Debug, Clone)]
pub struct MeshConfig {
    /// Hop budget stamped on locally originated frames
    pub initial_ttl: u8,
    /// Frames claiming more than this are rejected at submit
    pub max_ttl: u8,
    /// Fragmentation threshold when a link does not advertise a smaller MTU
    pub fragment_size: usize,
    /// How long an incomplete reassembly is kept
    pub reassembly_timeout: Duration,
    /// Concurrent reassemblies kept before new ones are refused
    pub reassembly_capacity: usize,
    /// Dedup cache entry cap
    pub dedup_capacity: usize,
    /// Dedup cache entry lifetime
    pub dedup_ttl: Duration,
    /// Soft-state route lifetime
    pub route_ttl: Duration,
    /// Heartbeat silence before a peer is marked unhealthy
    pub peer_stale: Duration,
    /// Heartbeat silence before a peer is dropped with a disconnect event
    pub peer_dead: Duration,
    /// Registry capacity; the longest-stale non-social peer is evicted at
    /// the cap
    pub max_peers: usize,
    /// Outbound token bucket rate, bytes per second
    pub bandwidth_bps: u64,
    /// Scheduler entries older than this are promoted one priority level
    pub promote_after: Duration,
    /// In-memory backlog that flips submissions to the durable-queue path
    pub scheduler_high_watermark: usize,
    /// Backlog at which in-memory admission resumes
    pub scheduler_low_watermark: usize,
    /// Session age rotation trigger
    pub session_rotate_interval: Duration,
    /// Session traffic-volume rotation trigger
    pub session_rotate_bytes: u64,
    /// Rekey exchanges slower than this are marked failed and retried
    pub rekey_deadline: Duration,
    /// Durable queue lifetime for user content
    pub queue_item_ttl_user: Duration,
    /// Durable queue lifetime for control frames
    pub queue_item_ttl_control: Duration,
    /// Known-nodes ledger retention window
    pub ledger_retention: Duration,
    /// Light-ping challenge width
    pub ping_challenge_bytes: usize,
    /// A tentative link that never answers the ping is torn down after this
    pub ping_deadline: Duration,
    /// Ledger recency window that drives watering-hole retries
    pub watering_hole_recent: Duration,
    /// Ledger entries pinged when bootstrapping after identity rotation
    pub bootstrap_ping_count: usize,
    /// Cadence of the maintenance sweep
    pub maintenance_interval: Duration,
    /// Outbound drain allowance during shutdown
    pub shutdown_grace: Duration,
}

impl Default for MeshConfig {
    fn default() -> Self {
        MeshConfig {
            initial_ttl: 7,
            max_ttl: 16,
            fragment_size: 65_536,
            reassembly_timeout: Duration::from_millis(30_000),
            reassembly_capacity: 256,
            dedup_capacity: 10_000,
            dedup_ttl: Duration::from_millis(600_000),
            route_ttl: Duration::from_millis(300_000),
            peer_stale: Duration::from_millis(60_000),
            peer_dead: Duration::from_millis(180_000),
            max_peers: 10_000,
            bandwidth_bps: 1_048_576,
            promote_after: Duration::from_secs(5),
            scheduler_high_watermark: 1_000,
            scheduler_low_watermark: 500,
            session_rotate_interval: Duration::from_millis(86_400_000),
            session_rotate_bytes: 1 << 30,
            rekey_deadline: Duration::from_secs(10),
            queue_item_ttl_user: Duration::from_millis(604_800_000),
            queue_item_ttl_control: Duration::from_millis(3_600_000),
            ledger_retention: Duration::from_millis(15_552_000_000),
            ping_challenge_bytes: 16,
            ping_deadline: Duration::from_secs(10),
            watering_hole_recent: Duration::from_secs(72 * 3600),
            bootstrap_ping_count: 8,
            maintenance_interval: Duration::from_secs(1),
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

impl MeshConfig {
    /// Heartbeat cadence, derived so a healthy peer never goes stale
    pub fn heartbeat_interval(&self) -> Duration {
        self.peer_stale / 3
    }
}
