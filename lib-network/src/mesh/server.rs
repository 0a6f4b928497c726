//! The mesh engine
//!
//! One `WeftMeshEngine` per process owns every subsystem: identity and
//! sessions, the wire pipeline, dedup and routing, the bandwidth scheduler,
//! the durable stores, and the transport multiplexer. Lifecycle is
//! `init -> run -> shutdown`. Cooperative tasks: one inbound pump per
//! attached link, one outbound drain, one maintenance sweep, plus the
//! startup queue replay.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use tokio::sync::{broadcast, watch, Mutex as AsyncMutex, Notify, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use lib_crypto::{fill_random, generate_message_id, Fingerprint, PublicKey};
use lib_identity::{
    IdentityStore, KeyExchangePayload, SessionConfig, SessionManager, WeftIdentity,
};
use lib_storage::{now_ms, BlobStore, KnownNodesLedger, LedgerEntry, OutboundQueue, QueuedFrame};
use lib_wire::{
    split_payload, Frame, FrameHeader, FrameType, Priority, ReassemblyBuffer, FLAG_ENCRYPTED,
    MIN_FRAGMENT_SIZE, PROTOCOL_VERSION,
};

use crate::config::MeshConfig;
use crate::error::MeshError;
use crate::mesh::dedup::DedupCache;
use crate::mesh::scheduler::{BandwidthScheduler, ScheduledFrame};
use crate::peer_registry::{new_shared_registry, RegistryConfig, SharedPeerRegistry};
use crate::routing::RoutingTable;
use crate::stats::{Counters, StatsSnapshot};
use crate::transport::{Link, LinkId, TransportMux};
use crate::types::{ControlPayload, DiscoveryPayload, IncomingMessage, MeshEvent, SubmitStatus};

const EVENT_CHANNEL_DEPTH: usize = 256;

/// Hop budget for link-local control traffic (never relayed)
const LINK_LOCAL_TTL: u8 = 1;

struct EngineInner {
    config: MeshConfig,
    identity: RwLock<WeftIdentity>,
    identity_store: IdentityStore,
    passphrase: String,
    sessions: AsyncMutex<SessionManager>,
    registry: SharedPeerRegistry,
    routing: AsyncMutex<RoutingTable>,
    dedup: parking_lot::Mutex<DedupCache>,
    reassembly: parking_lot::Mutex<ReassemblyBuffer>,
    scheduler: parking_lot::Mutex<BandwidthScheduler>,
    queue: AsyncMutex<OutboundQueue>,
    ledger: AsyncMutex<KnownNodesLedger>,
    blobs: AsyncMutex<BlobStore>,
    mux: TransportMux,
    counters: Counters,
    incoming_tx: broadcast::Sender<IncomingMessage>,
    events_tx: broadcast::Sender<MeshEvent>,
    scheduler_notify: Notify,
    diverting: AtomicBool,
    divert_happened: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

/// Process-singleton engine handle. Cloning shares the same engine.
#[derive(Clone)]
pub struct WeftMeshEngine {
    inner: Arc<EngineInner>,
}

impl WeftMeshEngine {
    /// Open the durable stores, load or create the identity, and assemble
    /// the engine. Crypto or persistence failures here are fatal.
    pub async fn init(
        config: MeshConfig,
        store_root: impl AsRef<Path>,
        passphrase: &str,
    ) -> Result<Self, MeshError> {
        let root = store_root.as_ref();

        let identity_store = IdentityStore::new(root.join("identity.bin"));
        let identity = identity_store
            .load_or_create(passphrase)
            .map_err(|e| MeshError::Crypto(e.to_string()))?;

        let queue = OutboundQueue::open(root.join("queue")).await?;
        let blobs = BlobStore::open(root.join("blobs")).await?;
        let ledger = KnownNodesLedger::open(
            root.join("ledger.bin"),
            config.ledger_retention.as_millis() as u64,
        )
        .await?;

        let mut sessions = SessionManager::new(
            identity.keypair().clone(),
            SessionConfig {
                rotate_interval: config.session_rotate_interval,
                rotate_bytes: config.session_rotate_bytes,
                rekey_deadline: config.rekey_deadline,
                retired_keep: 2,
            },
        );
        // Agreement keys recorded in the ledger let store-and-forward
        // encrypt toward peers that are not currently connected.
        for entry in ledger.query(|e| e.agreement_public.is_some()) {
            sessions.register_peer(entry.public_key, entry.agreement_public.unwrap());
        }

        let registry = new_shared_registry(RegistryConfig {
            max_peers: config.max_peers,
            stale_after: config.peer_stale,
            dead_after: config.peer_dead,
        });

        let now = Instant::now();
        let (incoming_tx, _) = broadcast::channel(EVENT_CHANNEL_DEPTH);
        let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_DEPTH);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        info!(fingerprint = %identity.fingerprint(), "mesh engine initialized");

        Ok(WeftMeshEngine {
            inner: Arc::new(EngineInner {
                dedup: parking_lot::Mutex::new(DedupCache::new(
                    config.dedup_capacity,
                    config.dedup_ttl,
                )),
                reassembly: parking_lot::Mutex::new(ReassemblyBuffer::new(
                    config.reassembly_timeout,
                    config.reassembly_capacity,
                )),
                scheduler: parking_lot::Mutex::new(BandwidthScheduler::new(
                    config.bandwidth_bps,
                    config.promote_after,
                    now,
                )),
                routing: AsyncMutex::new(RoutingTable::new(config.route_ttl)),
                identity: RwLock::new(identity),
                identity_store,
                passphrase: passphrase.to_string(),
                sessions: AsyncMutex::new(sessions),
                registry,
                queue: AsyncMutex::new(queue),
                ledger: AsyncMutex::new(ledger),
                blobs: AsyncMutex::new(blobs),
                mux: TransportMux::new(),
                counters: Counters::default(),
                incoming_tx,
                events_tx,
                scheduler_notify: Notify::new(),
                diverting: AtomicBool::new(false),
                divert_happened: AtomicBool::new(false),
                shutdown_tx,
                shutdown_rx,
                config,
                tasks: parking_lot::Mutex::new(Vec::new()),
            }),
        })
    }

    /// Spawn the outbound drain and maintenance tasks and replay the
    /// durable queue into the scheduler.
    pub async fn run(&self) -> Result<(), MeshError> {
        let inner = self.inner.clone();
        let drain = tokio::spawn(async move { outbound_drain(inner).await });

        let inner = self.inner.clone();
        let maintenance = tokio::spawn(async move { maintenance_loop(inner).await });

        // Queue replay: everything persisted before the last shutdown goes
        // back through the scheduler.
        let replayed = {
            let queue = self.inner.queue.lock().await;
            let now = Instant::now();
            let mut scheduler = self.inner.scheduler.lock();
            let entries = queue.replay();
            let count = entries.len();
            for (seq, record) in entries {
                scheduler.push(ScheduledFrame {
                    bytes: record.frame_blob,
                    recipient: record.recipient,
                    exclude: None,
                    priority: record.priority,
                    queued_at: now,
                    queue_seq: Some(seq),
                    forwarded: false,
                });
            }
            count
        };
        if replayed > 0 {
            info!(replayed, "durable queue replayed into scheduler");
            self.inner.scheduler_notify.notify_one();
        }

        self.inner.tasks.lock().extend([drain, maintenance]);
        Ok(())
    }

    /// Drain outbound traffic for up to the grace period, flush state, stop
    /// every task.
    pub async fn shutdown(&self) {
        let _ = self.inner.shutdown_tx.send(true);
        self.inner.scheduler_notify.notify_waiters();

        let deadline = Instant::now() + self.inner.config.shutdown_grace;
        while Instant::now() < deadline {
            if self.inner.scheduler.lock().is_empty() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }

        if let Err(e) = self.inner.ledger.lock().await.flush().await {
            warn!(error = %e, "ledger flush on shutdown failed");
        }

        for task in self.inner.tasks.lock().drain(..) {
            task.abort();
        }
        info!("mesh engine stopped");
    }

    // ------------------------------------------------------------------
    // Links
    // ------------------------------------------------------------------

    /// Adopt a transport-provided link. The link starts tentative; a
    /// completed light-ping promotes it and announces the peer.
    pub async fn attach_link(&self, link: Arc<dyn Link>) -> Result<LinkId, MeshError> {
        let mut challenge = [0u8; 16];
        fill_random(&mut challenge).map_err(|e| MeshError::Crypto(e.to_string()))?;

        let id = self.inner.mux.attach(link.clone(), challenge, Instant::now());

        // Inbound pump for this link
        let inner = self.inner.clone();
        let pump_link = link.clone();
        let mut shutdown = self.inner.shutdown_rx.clone();
        let pump = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    received = pump_link.recv() => match received {
                        Some(bytes) => handle_inbound(&inner, id, &bytes).await,
                        None => {
                            link_failed(&inner, id).await;
                            break;
                        }
                    }
                }
            }
        });
        self.inner.tasks.lock().push(pump);

        send_ping(&self.inner, id, challenge).await;
        Ok(id)
    }

    /// Tear down a link deliberately
    pub async fn detach_link(&self, id: LinkId) {
        if let Some(link) = self.inner.mux.link(id) {
            link.close().await;
        }
        link_failed(&self.inner, id).await;
    }

    // ------------------------------------------------------------------
    // Application surface
    // ------------------------------------------------------------------

    /// Submit a message. `Sent` means the scheduler has it with a plausible
    /// path out; `Queued` means it is parked durably for replay.
    pub async fn submit(
        &self,
        recipient: Option<PublicKey>,
        frame_type: FrameType,
        bytes: &[u8],
        priority: Option<Priority>,
        ttl: Option<u8>,
    ) -> Result<([u8; 16], SubmitStatus), MeshError> {
        let config = &self.inner.config;
        let local = self.inner.identity.read().await.peer_id();

        if recipient.as_ref() == Some(&local) {
            self.inner.counters.policy_errors.fetch_add(1, Ordering::Relaxed);
            return Err(MeshError::Policy("recipient is self"));
        }
        let ttl = ttl.unwrap_or(config.initial_ttl);
        if ttl > config.max_ttl {
            self.inner.counters.policy_errors.fetch_add(1, Ordering::Relaxed);
            return Err(MeshError::Policy("ttl above configured maximum"));
        }
        let priority = priority.unwrap_or_else(|| frame_type.priority());

        let message_id = generate_message_id().map_err(|e| MeshError::Crypto(e.to_string()))?;

        // Unicast user payloads travel encrypted; control-plane and
        // broadcast payloads are cleartext inside the signed frame.
        let mut flags = 0u8;
        let payload = match (recipient, frame_type) {
            (
                Some(peer),
                FrameType::Text | FrameType::Voice | FrameType::FileChunk | FrameType::FileMetadata,
            ) => {
                let aad = session_aad(&local, &message_id);
                let sealed = self
                    .inner
                    .sessions
                    .lock()
                    .await
                    .encrypt(&peer, &aad, bytes, Instant::now())
                    .map_err(|e| {
                        self.inner.counters.session_errors.fetch_add(1, Ordering::Relaxed);
                        MeshError::Session(e)
                    })?;
                flags |= FLAG_ENCRYPTED;
                sealed
            }
            _ => bytes.to_vec(),
        };

        // Fragment to the narrowest active link so every link can carry
        // every fragment
        let fragment_size = self
            .inner
            .mux
            .min_active_mtu()
            .map(|mtu| mtu.clamp(MIN_FRAGMENT_SIZE, config.fragment_size))
            .unwrap_or(config.fragment_size);
        let chunks = split_payload(&payload, fragment_size)?;
        let count = chunks.len() as u16;
        let created = now_ms();
        let expires = created
            + if priority == Priority::Control {
                config.queue_item_ttl_control.as_millis() as u64
            } else {
                config.queue_item_ttl_user.as_millis() as u64
            };

        let identity = self.inner.identity.read().await;
        let mut encoded = Vec::with_capacity(chunks.len());
        for (index, chunk) in chunks.into_iter().enumerate() {
            let mut frame = Frame::unsigned(
                FrameHeader {
                    version: PROTOCOL_VERSION,
                    frame_type,
                    ttl,
                    flags,
                    timestamp_ms: created,
                    sender_id: local,
                    message_id,
                    fragment_index: index as u16,
                    fragment_count: count,
                    payload_len: chunk.len() as u32,
                },
                chunk,
            );
            frame.sign_with(identity.keypair());
            encoded.push(frame.encode());
        }
        drop(identity);

        // Durable enqueue is transactional with the send
        let mut seqs = Vec::with_capacity(encoded.len());
        {
            let mut queue = self.inner.queue.lock().await;
            for bytes in &encoded {
                let seq = queue
                    .enqueue(QueuedFrame::new(
                        bytes.clone(),
                        recipient,
                        priority,
                        created,
                        expires,
                    ))
                    .await?;
                seqs.push(seq);
            }
        }

        // Back-pressure: past the high watermark, non-control submissions
        // stay durable-only until the backlog recedes.
        let backlog = self.inner.scheduler.lock().backlog();
        let diverting = self.update_divert_state(backlog);
        if diverting && priority != Priority::Control {
            self.inner.counters.capacity_errors.fetch_add(1, Ordering::Relaxed);
            self.inner.divert_happened.store(true, Ordering::Relaxed);
            return Ok((message_id, SubmitStatus::Queued));
        }

        let now = Instant::now();
        {
            let mut scheduler = self.inner.scheduler.lock();
            for (bytes, seq) in encoded.into_iter().zip(seqs) {
                scheduler.push(ScheduledFrame {
                    bytes,
                    recipient,
                    exclude: None,
                    priority,
                    queued_at: now,
                    queue_seq: Some(seq),
                    forwarded: false,
                });
            }
        }
        self.inner.scheduler_notify.notify_one();

        let reachable = match recipient {
            Some(peer) => {
                self.inner.registry.read().await.is_connected(&peer)
                    || self.inner.mux.best_link_for(&peer).is_some()
                    || self
                        .inner
                        .routing
                        .lock()
                        .await
                        .lookup(&peer, now)
                        .is_some()
            }
            None => self.inner.mux.active_count() > 0,
        };
        let status = if reachable { SubmitStatus::Sent } else { SubmitStatus::Queued };
        Ok((message_id, status))
    }

    fn update_divert_state(&self, backlog: usize) -> bool {
        let config = &self.inner.config;
        let was = self.inner.diverting.load(Ordering::Relaxed);
        let now = if was {
            backlog > config.scheduler_low_watermark
        } else {
            backlog >= config.scheduler_high_watermark
        };
        self.inner.diverting.store(now, Ordering::Relaxed);
        now
    }

    /// Stream of delivered messages
    pub fn subscribe(&self) -> broadcast::Receiver<IncomingMessage> {
        self.inner.incoming_tx.subscribe()
    }

    /// Stream of peer connect/disconnect events
    pub fn events(&self) -> broadcast::Receiver<MeshEvent> {
        self.inner.events_tx.subscribe()
    }

    /// Replace the local identity with fresh keys. The ledger is preserved
    /// in full; active links are re-challenged so neighbors learn the new
    /// key, and the most recent ledger entries are re-pinged.
    pub async fn rotate_identity(&self) -> Result<Fingerprint, MeshError> {
        let mut identity = self.inner.identity.write().await;
        let rotated = self
            .inner
            .identity_store
            .rotate(&identity, &self.inner.passphrase)
            .map_err(|e| MeshError::Crypto(e.to_string()))?;
        let fingerprint = rotated.fingerprint();
        *identity = rotated.clone();
        drop(identity);

        {
            let mut sessions = self.inner.sessions.lock().await;
            sessions.set_local(rotated.keypair().clone());
            let ledger = self.inner.ledger.lock().await;
            for entry in ledger.query(|e| e.agreement_public.is_some()) {
                sessions.register_peer(entry.public_key, entry.agreement_public.unwrap());
            }
        }

        // Bootstrap: re-associate every live link under the new identity
        for id in self.inner.mux.all_links() {
            let mut challenge = [0u8; 16];
            if fill_random(&mut challenge).is_err() {
                continue;
            }
            self.inner.mux.re_challenge(id, challenge, Instant::now());
            send_ping(&self.inner, id, challenge).await;
        }

        Ok(fingerprint)
    }

    /// Promote a mesh neighbor to a social contact (presentation only)
    pub async fn add_social_contact(&self, peer: &PublicKey) -> bool {
        self.inner.registry.write().await.set_social(peer, true)
    }

    pub async fn remove_social_contact(&self, peer: &PublicKey) -> bool {
        self.inner.registry.write().await.set_social(peer, false)
    }

    /// The most recently seen ledger entries, in watering-hole order. The
    /// application hands these to its transport adapters to dial after an
    /// identity rotation or cold start.
    pub async fn bootstrap_targets(&self) -> Vec<LedgerEntry> {
        let count = self.inner.config.bootstrap_ping_count;
        self.inner.ledger.lock().await.most_recent(count)
    }

    /// Read-only ledger query
    pub async fn ledger_query(
        &self,
        predicate: impl Fn(&LedgerEntry) -> bool,
    ) -> Vec<LedgerEntry> {
        self.inner.ledger.lock().await.query(predicate)
    }

    /// Push install-time bootstrap entries into the ledger
    pub async fn ledger_seed(&self, entries: Vec<LedgerEntry>) {
        let with_keys = {
            let mut ledger = self.inner.ledger.lock().await;
            ledger.seed(entries);
            ledger.query(|e| e.agreement_public.is_some())
        };
        let mut sessions = self.inner.sessions.lock().await;
        for entry in with_keys {
            sessions.register_peer(entry.public_key, entry.agreement_public.unwrap());
        }
    }

    /// User-initiated wipe of everything the ledger remembers
    pub async fn ledger_wipe(&self) -> Result<(), MeshError> {
        Ok(self.inner.ledger.lock().await.wipe().await?)
    }

    /// Store content for later FILE_* sends and sneakernet offers
    pub async fn store_blob(&self, content: &[u8]) -> Result<lib_wire::ContentId, MeshError> {
        Ok(self.inner.blobs.lock().await.put(content).await?)
    }

    pub async fn fetch_blob(&self, id: &lib_wire::ContentId) -> Result<Vec<u8>, MeshError> {
        Ok(self.inner.blobs.lock().await.get(id).await?)
    }

    pub async fn stats(&self) -> StatsSnapshot {
        let queue_depth = self.inner.queue.lock().await.depth();
        let ledger_size = self.inner.ledger.lock().await.len();
        let peers_connected = self.inner.registry.read().await.connected_count();
        self.inner
            .counters
            .snapshot(queue_depth, ledger_size, peers_connected, ledger_size)
    }

    pub async fn local_peer_id(&self) -> PublicKey {
        self.inner.identity.read().await.peer_id()
    }

    pub async fn fingerprint(&self) -> Fingerprint {
        self.inner.identity.read().await.fingerprint()
    }

    pub async fn social_contact_count(&self) -> usize {
        self.inner.registry.read().await.social_count()
    }

    pub async fn connected_peer_count(&self) -> usize {
        self.inner.registry.read().await.connected_count()
    }

    pub async fn is_peer_connected(&self, peer: &PublicKey) -> bool {
        self.inner.registry.read().await.is_connected(peer)
    }

    /// True once this node holds the peer's agreement key and can encrypt
    /// toward it (learned from a light-ping, a flooded heartbeat, or the
    /// ledger)
    pub async fn knows_peer(&self, peer: &PublicKey) -> bool {
        self.inner.sessions.lock().await.knows_peer(peer)
    }
}

fn session_aad(sender: &PublicKey, message_id: &[u8; 16]) -> Vec<u8> {
    let mut aad = Vec::with_capacity(48);
    aad.extend_from_slice(sender.as_bytes());
    aad.extend_from_slice(message_id);
    aad
}

// ----------------------------------------------------------------------
// Inbound pipeline
// ----------------------------------------------------------------------

/// Relay decision, in spec order: parse, verify, dedup, observe route,
/// local dispatch, forward. Every failure short-circuits to a quiet drop
/// with one typed counter bump.
async fn handle_inbound(inner: &Arc<EngineInner>, link_id: LinkId, bytes: &[u8]) {
    inner.counters.frames_in.fetch_add(1, Ordering::Relaxed);

    let frame = match Frame::decode(bytes) {
        Ok(frame) => frame,
        Err(e) => {
            debug!(error = %e, "inbound frame rejected at parse");
            inner.counters.protocol_errors.fetch_add(1, Ordering::Relaxed);
            return;
        }
    };

    if !frame.verify() {
        inner.counters.crypto_errors.fetch_add(1, Ordering::Relaxed);
        return;
    }

    let local = inner.identity.read().await.peer_id();
    let sender = frame.header.sender_id;
    if sender == local {
        // Loopback: our own flood reflected back
        return;
    }

    let arrival_peer = inner.mux.peer_of(link_id);
    let link_active = inner.mux.is_active(link_id);

    // Until the light-ping completes, only control traffic is trusted
    if !link_active && frame.header.frame_type != FrameType::Control {
        inner.counters.policy_errors.fetch_add(1, Ordering::Relaxed);
        return;
    }

    if inner.dedup.lock().seen_or_insert(frame.frame_hash(), Instant::now()) {
        inner.counters.frames_deduped.fetch_add(1, Ordering::Relaxed);
        return;
    }

    let now = Instant::now();
    if let Some(arrival) = arrival_peer {
        inner.registry.write().await.heartbeat(&arrival, now);

        // Routing observation: the sender is reachable via the arrival peer
        // in roughly (initial_ttl - remaining_ttl) hops.
        let hops = inner
            .config
            .initial_ttl
            .saturating_sub(frame.header.ttl)
            .max(1);
        let mut routing = inner.routing.lock().await;
        if sender == arrival {
            routing.upsert(sender, sender, 1, now);
        } else {
            routing.upsert(sender, arrival, hops, now);
        }
    }
    inner
        .ledger
        .lock()
        .await
        .observe(sender, None, None, now_ms(), 0);

    match frame.header.frame_type {
        FrameType::Control => handle_control(inner, link_id, &frame).await,
        FrameType::KeyExchange => handle_key_exchange(inner, &frame).await,
        FrameType::PeerDiscovery => {
            // Flooded heartbeat: remember the sender's agreement key so
            // unicast encryption works toward peers hops away
            if let Ok(announce) = DiscoveryPayload::from_bytes(&frame.payload) {
                inner
                    .sessions
                    .lock()
                    .await
                    .register_peer(sender, announce.agreement);
                inner.ledger.lock().await.observe(
                    sender,
                    Some(announce.agreement),
                    None,
                    now_ms(),
                    0,
                );
            }
        }
        FrameType::Text | FrameType::Voice | FrameType::FileChunk | FrameType::FileMetadata => {
            deliver_user_frame(inner, &frame).await;
        }
    }

    // Forward with a decremented budget; a frame down to its last hop is
    // not re-emitted.
    if frame.header.ttl >= 2 {
        let mut forwarded = frame.clone();
        forwarded.header.ttl -= 1;
        inner.scheduler.lock().push(ScheduledFrame {
            bytes: forwarded.encode(),
            recipient: None,
            exclude: arrival_peer,
            priority: frame.header.frame_type.priority(),
            queued_at: now,
            queue_seq: None,
            forwarded: true,
        });
        inner.scheduler_notify.notify_one();
    }
}

/// Reassemble and, when addressed here, deliver a user-data frame. An
/// encrypted payload we cannot open is simply relay traffic for someone
/// else; cleartext broadcast delivers everywhere.
async fn deliver_user_frame(inner: &Arc<EngineInner>, frame: &Frame) {
    let completed = {
        let mut reassembly = inner.reassembly.lock();
        match reassembly.insert(frame, Instant::now()) {
            Ok(done) => done,
            Err(lib_wire::WireError::ReassemblyFull) => {
                inner.counters.capacity_errors.fetch_add(1, Ordering::Relaxed);
                return;
            }
            Err(_) => {
                inner.counters.protocol_errors.fetch_add(1, Ordering::Relaxed);
                return;
            }
        }
    };
    let Some(payload) = completed else {
        return;
    };

    let sender = frame.header.sender_id;
    let (payload, session_verified) = if frame.is_encrypted() {
        let aad = session_aad(&sender, &frame.header.message_id);
        match inner
            .sessions
            .lock()
            .await
            .decrypt(&sender, &aad, &payload, Instant::now())
        {
            Ok(plain) => (plain, true),
            Err(_) => return, // not addressed to this node
        }
    } else {
        (payload, false)
    };

    if frame.header.fragment_count > 1 {
        inner
            .counters
            .fragments_reassembled
            .fetch_add(1, Ordering::Relaxed);
    }

    let message = IncomingMessage {
        sender,
        fingerprint: sender.fingerprint(),
        frame_type: frame.header.frame_type,
        payload,
        arrived_at_ms: now_ms(),
        session_verified,
    };
    let _ = inner.incoming_tx.send(message);
}

async fn handle_key_exchange(inner: &Arc<EngineInner>, frame: &Frame) {
    let sender = frame.header.sender_id;
    let payload = match KeyExchangePayload::from_bytes(&frame.payload) {
        Ok(payload) => payload,
        Err(_) => {
            inner.counters.protocol_errors.fetch_add(1, Ordering::Relaxed);
            return;
        }
    };

    // Exchanges flood like any frame; only the addressed responder acts
    let local = inner.identity.read().await.peer_id();
    if *payload.recipient() != local {
        return;
    }

    let reply = {
        let mut sessions = inner.sessions.lock().await;
        match sessions.handle_key_exchange(&sender, payload, Instant::now()) {
            Ok(reply) => reply,
            Err(e) => {
                debug!(error = %e, "key exchange rejected");
                inner.counters.session_errors.fetch_add(1, Ordering::Relaxed);
                return;
            }
        }
    };

    if let Some(reply) = reply {
        if let Ok(bytes) = reply.to_bytes() {
            schedule_engine_frame(
                inner,
                Some(sender),
                FrameType::KeyExchange,
                &bytes,
                inner.config.initial_ttl,
            )
            .await;
        }
    }
}

async fn handle_control(inner: &Arc<EngineInner>, link_id: LinkId, frame: &Frame) {
    let sender = frame.header.sender_id;
    let payload = match ControlPayload::from_bytes(&frame.payload) {
        Ok(payload) => payload,
        Err(_) => {
            inner.counters.protocol_errors.fetch_add(1, Ordering::Relaxed);
            return;
        }
    };

    match payload {
        ControlPayload::Ping { agreement, challenge, .. } => {
            // The far side identified itself; answer its challenge and
            // remember its keys.
            inner.sessions.lock().await.register_peer(sender, agreement);
            if let Some(link) = inner.mux.link(link_id) {
                inner.ledger.lock().await.observe(
                    sender,
                    Some(agreement),
                    Some(&link.address()),
                    now_ms(),
                    0,
                );

                // A fresh ping with a new sender over an active link means
                // the far side rotated its identity; re-associate.
                let prior = inner.mux.peer_of(link_id);
                if inner.mux.is_active(link_id) && prior != Some(sender) {
                    inner.mux.activate(link_id, sender, &challenge);
                    if let Some(old) = prior {
                        if inner.registry.write().await.disconnect(&old) {
                            let _ = inner.events_tx.send(MeshEvent::PeerDisconnected(old));
                        }
                        inner.routing.lock().await.purge_next_hop(&old);
                    }
                    let is_new = inner.registry.write().await.connect(
                        sender,
                        link.cost_class(),
                        Instant::now(),
                    );
                    if is_new {
                        let _ = inner.events_tx.send(MeshEvent::PeerConnected(sender));
                    }
                    replay_queued_for_peer(inner, &sender).await;
                }
            }

            let identity = inner.identity.read().await;
            let pong = ControlPayload::Pong {
                agreement: identity.agreement_public(),
                challenge,
                signature: identity.sign(&challenge),
            };
            drop(identity);
            send_control_on_link(inner, link_id, pong).await;
        }
        ControlPayload::Pong { agreement, challenge, signature } => {
            if !sender.verify(&challenge, &signature) {
                inner.counters.crypto_errors.fetch_add(1, Ordering::Relaxed);
                return;
            }
            if !inner.mux.activate(link_id, sender, &challenge) {
                inner.counters.policy_errors.fetch_add(1, Ordering::Relaxed);
                return;
            }

            let Some(link) = inner.mux.link(link_id) else {
                return;
            };
            let is_new = inner.registry.write().await.connect(
                sender,
                link.cost_class(),
                Instant::now(),
            );
            inner.sessions.lock().await.register_peer(sender, agreement);
            inner.ledger.lock().await.observe(
                sender,
                Some(agreement),
                Some(&link.address()),
                now_ms(),
                0,
            );
            if is_new {
                let _ = inner.events_tx.send(MeshEvent::PeerConnected(sender));
            }

            // Watering hole: anything queued for this peer goes out now
            replay_queued_for_peer(inner, &sender).await;
        }
        ControlPayload::BlobOffer { content_ids } => {
            let missing: Vec<_> = {
                let blobs = inner.blobs.lock().await;
                content_ids
                    .into_iter()
                    .filter(|id| !blobs.contains(id))
                    .collect()
            };
            if !missing.is_empty() {
                send_control_on_link(inner, link_id, ControlPayload::BlobRequest {
                    content_ids: missing,
                })
                .await;
            }
        }
        ControlPayload::BlobRequest { content_ids } => {
            for id in content_ids {
                let content = {
                    let blobs = inner.blobs.lock().await;
                    blobs.get(&id).await.ok()
                };
                if let Some(content) = content {
                    schedule_engine_frame(
                        inner,
                        Some(sender),
                        FrameType::FileChunk,
                        &content,
                        inner.config.initial_ttl,
                    )
                    .await;
                }
            }
        }
    }
}

/// Re-schedule durable entries addressed to a peer that just appeared,
/// when the ledger saw it recently enough to bother.
async fn replay_queued_for_peer(inner: &Arc<EngineInner>, peer: &PublicKey) {
    let recent_ms = inner.config.watering_hole_recent.as_millis() as u64;
    let recently_seen = inner
        .ledger
        .lock()
        .await
        .seen_within(peer, recent_ms, now_ms());
    if !recently_seen {
        return;
    }

    let entries = inner.queue.lock().await.entries_for(peer);
    if entries.is_empty() {
        return;
    }
    debug!(peer = %peer.fingerprint(), frames = entries.len(), "watering-hole replay");

    let now = Instant::now();
    {
        let mut scheduler = inner.scheduler.lock();
        for (seq, record) in entries {
            scheduler.push(ScheduledFrame {
                bytes: record.frame_blob,
                recipient: record.recipient,
                exclude: None,
                priority: record.priority,
                queued_at: now,
                queue_seq: Some(seq),
                forwarded: false,
            });
        }
    }
    inner.scheduler_notify.notify_one();
}

// ----------------------------------------------------------------------
// Engine-originated frames
// ----------------------------------------------------------------------

/// Build, sign, and schedule one engine-originated frame (control plane,
/// key exchange, blob relay). These never hit the durable queue.
async fn schedule_engine_frame(
    inner: &Arc<EngineInner>,
    recipient: Option<PublicKey>,
    frame_type: FrameType,
    payload: &[u8],
    ttl: u8,
) {
    let Ok(bytes) = build_signed_frame(inner, frame_type, payload, ttl).await else {
        return;
    };
    inner.scheduler.lock().push(ScheduledFrame {
        bytes,
        recipient,
        exclude: None,
        priority: frame_type.priority(),
        queued_at: Instant::now(),
        queue_seq: None,
        forwarded: false,
    });
    inner.scheduler_notify.notify_one();
}

async fn build_signed_frame(
    inner: &Arc<EngineInner>,
    frame_type: FrameType,
    payload: &[u8],
    ttl: u8,
) -> Result<Vec<u8>> {
    let message_id = generate_message_id()?;
    let identity = inner.identity.read().await;
    let mut frame = Frame::unsigned(
        FrameHeader {
            version: PROTOCOL_VERSION,
            frame_type,
            ttl,
            flags: 0,
            timestamp_ms: now_ms(),
            sender_id: identity.peer_id(),
            message_id,
            fragment_index: 0,
            fragment_count: 1,
            payload_len: payload.len() as u32,
        },
        payload.to_vec(),
    );
    frame.sign_with(identity.keypair());
    Ok(frame.encode())
}

async fn send_ping(inner: &Arc<EngineInner>, link_id: LinkId, challenge: [u8; 16]) {
    let identity = inner.identity.read().await;
    let ping = ControlPayload::Ping {
        fingerprint: identity.fingerprint(),
        agreement: identity.agreement_public(),
        challenge,
    };
    drop(identity);
    send_control_on_link(inner, link_id, ping).await;
}

/// Control traffic bound to one specific link bypasses the scheduler: it
/// is link-local, tiny, and must reach the far side of that exact link.
async fn send_control_on_link(inner: &Arc<EngineInner>, link_id: LinkId, payload: ControlPayload) {
    let Some(link) = inner.mux.link(link_id) else {
        return;
    };
    let Ok(bytes) = payload.to_bytes() else {
        return;
    };
    let Ok(encoded) =
        build_signed_frame(inner, FrameType::Control, &bytes, LINK_LOCAL_TTL).await
    else {
        return;
    };
    match link.send(&encoded).await {
        Ok(()) => {
            inner.counters.frames_out.fetch_add(1, Ordering::Relaxed);
        }
        Err(e) => {
            debug!(error = %e, "control send failed");
            inner.counters.transport_errors.fetch_add(1, Ordering::Relaxed);
            link_failed(inner, link_id).await;
        }
    }
}

// ----------------------------------------------------------------------
// Outbound drain
// ----------------------------------------------------------------------

async fn outbound_drain(inner: Arc<EngineInner>) {
    let mut shutdown = inner.shutdown_rx.clone();
    loop {
        if *shutdown.borrow() && inner.scheduler.lock().is_empty() {
            break;
        }

        let popped = inner.scheduler.lock().pop_ready(Instant::now());
        match popped {
            Some(frame) => emit(&inner, frame).await,
            None => {
                let wait = inner
                    .scheduler
                    .lock()
                    .next_ready_in(Instant::now())
                    .unwrap_or(std::time::Duration::from_millis(250));
                let wait = wait.max(std::time::Duration::from_millis(1));
                tokio::select! {
                    _ = inner.scheduler_notify.notified() => {}
                    _ = tokio::time::sleep(wait) => {}
                    _ = shutdown.changed() => {}
                }
            }
        }
    }
}

/// Push one scheduled frame onto the wire: the cheapest direct link, the
/// routed next hop, or a flood.
async fn emit(inner: &Arc<EngineInner>, frame: ScheduledFrame) {
    if let Some(recipient) = frame.recipient {
        let direct = inner.mux.best_link_for(&recipient);
        let target = match direct {
            Some(found) => Some(found),
            None => {
                let routing = inner.routing.lock().await;
                routing
                    .lookup(&recipient, Instant::now())
                    .map(|route| route.next_hop)
                    .and_then(|hop| inner.mux.best_link_for(&hop))
            }
        };

        match target {
            Some((link_id, link)) => match link.send(&frame.bytes).await {
                Ok(()) => {
                    inner.counters.frames_out.fetch_add(1, Ordering::Relaxed);
                    if let Some(seq) = frame.queue_seq {
                        let _ = inner.queue.lock().await.ack(seq).await;
                    }
                    let handoff_peer = inner.mux.peer_of(link_id).unwrap_or(recipient);
                    inner.registry.write().await.record_handoff(&handoff_peer, true);
                    inner
                        .routing
                        .lock()
                        .await
                        .record_outcome(&recipient, true, Instant::now());
                    inner.ledger.lock().await.observe(
                        handoff_peer,
                        None,
                        Some(&link.address()),
                        now_ms(),
                        0,
                    );
                }
                Err(e) => {
                    debug!(error = %e, "unicast send failed, reverting to queue");
                    inner.counters.transport_errors.fetch_add(1, Ordering::Relaxed);
                    inner
                        .routing
                        .lock()
                        .await
                        .record_outcome(&recipient, false, Instant::now());
                    if let Some(seq) = frame.queue_seq {
                        let _ = inner.queue.lock().await.mark_attempt(seq, now_ms()).await;
                    }
                    link_failed(inner, link_id).await;
                }
            },
            None => {
                // No direct path: flood toward the mesh and keep the
                // durable copy for the watering-hole retry.
                let sent = flood(inner, &frame).await;
                if let Some(seq) = frame.queue_seq {
                    let _ = inner.queue.lock().await.mark_attempt(seq, now_ms()).await;
                }
                if sent == 0 {
                    debug!(peer = %recipient.fingerprint(), "no path, frame parked durably");
                }
            }
        }
    } else {
        let sent = flood(inner, &frame).await;
        if sent > 0 {
            if frame.forwarded {
                inner.counters.frames_forwarded.fetch_add(1, Ordering::Relaxed);
            }
            if let Some(seq) = frame.queue_seq {
                // Broadcasts ack on a successful flood
                let _ = inner.queue.lock().await.ack(seq).await;
            }
        } else if let Some(seq) = frame.queue_seq {
            let _ = inner.queue.lock().await.mark_attempt(seq, now_ms()).await;
        }
    }
}

/// Emit to one link per connected peer, excluding the arrival peer of a
/// forwarded frame. Returns how many links accepted the bytes.
async fn flood(inner: &Arc<EngineInner>, frame: &ScheduledFrame) -> usize {
    let targets = inner.mux.flood_targets(frame.exclude.as_ref());
    let mut sent = 0usize;
    for (link_id, _peer, link) in targets {
        match link.send(&frame.bytes).await {
            Ok(()) => {
                inner.counters.frames_out.fetch_add(1, Ordering::Relaxed);
                sent += 1;
            }
            Err(e) => {
                debug!(error = %e, "flood send failed");
                inner.counters.transport_errors.fetch_add(1, Ordering::Relaxed);
                link_failed(inner, link_id).await;
            }
        }
    }
    sent
}

async fn link_failed(inner: &Arc<EngineInner>, link_id: LinkId) {
    if let Some(peer) = inner.mux.detach(link_id) {
        // Only declare the peer gone when no other link reaches it
        if inner.mux.best_link_for(&peer).is_none() {
            let removed = inner.registry.write().await.disconnect(&peer);
            inner.routing.lock().await.purge_next_hop(&peer);
            if removed {
                let _ = inner.events_tx.send(MeshEvent::PeerDisconnected(peer));
            }
        }
    }
}

// ----------------------------------------------------------------------
// Maintenance
// ----------------------------------------------------------------------

async fn maintenance_loop(inner: Arc<EngineInner>) {
    let mut shutdown = inner.shutdown_rx.clone();
    let mut ticker = tokio::time::interval(inner.config.maintenance_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut last_heartbeat = Instant::now();

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {}
        }
        let now = Instant::now();
        let wall_ms = now_ms();

        inner.dedup.lock().sweep(now);
        inner.routing.lock().await.sweep(now);

        let dropped = inner.reassembly.lock().sweep(now);
        if dropped > 0 {
            inner
                .counters
                .reassembly_dropped
                .fetch_add(dropped as u64, Ordering::Relaxed);
        }

        // Peer health: stale marking and dead removal
        let removed = inner.registry.write().await.sweep(now);
        for peer in removed {
            inner.routing.lock().await.purge_next_hop(&peer);
            let _ = inner.events_tx.send(MeshEvent::PeerDisconnected(peer));
        }

        // Session upkeep: start due rekeys, abandon stuck ones
        let (due, timed_out) = {
            let mut sessions = inner.sessions.lock().await;
            let due: Vec<(PublicKey, KeyExchangePayload)> = sessions
                .rotation_due(now)
                .into_iter()
                .filter_map(|peer| {
                    sessions
                        .initiate_rekey(&peer, now)
                        .ok()
                        .map(|payload| (peer, payload))
                })
                .collect();
            (due, sessions.sweep_rekeys(now))
        };
        for (peer, payload) in due {
            if let Ok(bytes) = payload.to_bytes() {
                schedule_engine_frame(
                    &inner,
                    Some(peer),
                    FrameType::KeyExchange,
                    &bytes,
                    inner.config.initial_ttl,
                )
                .await;
            }
        }
        if !timed_out.is_empty() {
            inner
                .counters
                .session_errors
                .fetch_add(timed_out.len() as u64, Ordering::Relaxed);
        }

        // Durable store upkeep
        inner.queue.lock().await.sweep(wall_ms).await;
        {
            let mut ledger = inner.ledger.lock().await;
            ledger.sweep(wall_ms);
            let interval_ms = inner.config.maintenance_interval.as_millis() as u64;
            for peer in inner.registry.read().await.connected_peers() {
                ledger.observe(peer, None, None, wall_ms, interval_ms);
            }
            if let Err(e) = ledger.flush().await {
                warn!(error = %e, "ledger flush failed");
                inner
                    .counters
                    .persistence_errors
                    .fetch_add(1, Ordering::Relaxed);
            }
        }

        // Links that never answered their ping
        for id in inner.mux.stale_tentative(inner.config.ping_deadline, now) {
            debug!(link = id.0, "tentative link timed out");
            if let Some(link) = inner.mux.link(id) {
                link.close().await;
            }
            inner.mux.detach(id);
        }

        // Flooded keepalive: refreshes heartbeats on neighbors and teaches
        // the wider mesh this node's agreement key
        if now.duration_since(last_heartbeat) >= inner.config.heartbeat_interval() {
            last_heartbeat = now;
            let announce = {
                let identity = inner.identity.read().await;
                DiscoveryPayload {
                    fingerprint: identity.fingerprint(),
                    agreement: identity.agreement_public(),
                }
            };
            if let Ok(bytes) = announce.to_bytes() {
                schedule_engine_frame(
                    &inner,
                    None,
                    FrameType::PeerDiscovery,
                    &bytes,
                    inner.config.initial_ttl,
                )
                .await;
            }
        }

        // Back-pressure recovery: pull diverted durable entries back into
        // the scheduler once the backlog recedes.
        if inner.divert_happened.load(Ordering::Relaxed) {
            let backlog = inner.scheduler.lock().backlog();
            if backlog <= inner.config.scheduler_low_watermark {
                inner.divert_happened.store(false, Ordering::Relaxed);
                inner.diverting.store(false, Ordering::Relaxed);
                top_up_from_queue(&inner).await;
            }
        }
    }
}

/// Re-admit durable entries that were diverted by back-pressure and have
/// never been attempted.
async fn top_up_from_queue(inner: &Arc<EngineInner>) {
    let entries: Vec<(u64, QueuedFrame)> = {
        let queue = inner.queue.lock().await;
        queue
            .replay()
            .into_iter()
            .filter(|(_, record)| record.attempts == 0)
            .collect()
    };
    if entries.is_empty() {
        return;
    }

    let scheduled = inner.scheduler.lock().scheduled_seqs();
    let now = Instant::now();
    {
        let mut scheduler = inner.scheduler.lock();
        for (seq, record) in entries {
            if scheduled.contains(&seq) {
                continue;
            }
            scheduler.push(ScheduledFrame {
                bytes: record.frame_blob,
                recipient: record.recipient,
                exclude: None,
                priority: record.priority,
                queued_at: now,
                queue_seq: Some(seq),
                forwarded: false,
            });
        }
    }
    inner.scheduler_notify.notify_one();
}
