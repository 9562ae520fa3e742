//! TURN server context.
//!
//! [`TurnServer`] owns everything the relay needs: the control session, the
//! optional conventional listener, the allocation table, per-client workers
//! and the background tasks. It is built once by [`TurnServer::start`] and
//! torn down by [`TurnServer::shutdown`].
//!
//! Inbound traffic is split per datagram:
//! - ChannelData and Send indications go straight to the data path
//! - STUN requests are rate limited and queued to the client's worker, so
//!   requests from one 5-tuple are handled one at a time in arrival order

use crate::address_book::AddressBook;
use crate::allocator::{OverlayRelayAllocator, RelayAllocator};
use crate::auth::{CredentialBridge, RoomRegistry};
use crate::cleanup;
use crate::config::Config;
use crate::error::{RelayError, Result, TransportError};
use crate::limits::RateLimits;
use crate::overlay::{DatagramSession, OverlayAddr, TransportAddr, TransportProvider};
use crate::relay::{self, AllocationEntry};
use crate::session::{self, WorkerHandle};
use dashmap::DashMap;
use rand::RngCore;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use turn_core::{ClientPhase, LifetimePolicy, NonceIssuer, PhaseEvent};
use turn_types::{attr_type, is_channel_data, is_stun, Class, Message, Method};
use zeroize::Zeroize;

/// Operational metrics for monitoring relay activity.
///
/// All counters are monotonically increasing (reset only on restart).
#[derive(Debug, Default)]
pub struct RelayMetrics {
    /// STUN requests accepted for processing.
    pub requests_total: AtomicU64,
    /// Requests answered with 401 after carrying MESSAGE-INTEGRITY.
    pub auth_failures: AtomicU64,
    /// Allocations created.
    pub allocations_total: AtomicU64,
    /// Allocations refused because the relay allocator failed.
    pub allocation_failures: AtomicU64,
    /// Allocations released because their lifetime elapsed.
    pub allocations_expired: AtomicU64,
    /// Payload bytes relayed from clients to peers.
    pub bytes_to_peer: AtomicU64,
    /// Payload bytes relayed from peers to clients.
    pub bytes_to_client: AtomicU64,
    /// Datagrams dropped: malformed, unpermitted, or queue full.
    pub packets_dropped: AtomicU64,
    /// Requests dropped by rate limiting.
    pub rate_limit_hits: AtomicU64,
}

impl RelayMetrics {
    pub(crate) fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add(counter: &AtomicU64, n: usize) {
        counter.fetch_add(n as u64, Ordering::Relaxed);
    }
}

/// Which listener a datagram arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ListenerId {
    /// The overlay control session.
    Overlay,
    /// The conventional UDP listener.
    Conventional,
}

/// Client identity: listener plus client address.
///
/// Both listeners carry UDP only, so the protocol is implied.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FiveTuple {
    /// Listener the client talks to.
    pub listener: ListenerId,
    /// Client transport address.
    pub client: TransportAddr,
}

impl FiveTuple {
    /// A client on the overlay control session.
    pub fn overlay(client: TransportAddr) -> Self {
        Self {
            listener: ListenerId::Overlay,
            client,
        }
    }
}

/// Everything the server is built from.
pub struct ServerParts {
    /// Validated configuration.
    pub config: Config,
    /// Source of control and relay sessions.
    pub provider: Arc<dyn TransportProvider>,
    /// Room service.
    pub rooms: Arc<dyn RoomRegistry>,
    /// Optional conventional listener.
    pub conventional: Option<Arc<dyn DatagramSession>>,
}

/// Totals across all live allocations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AllocationTotals {
    /// Live allocations.
    pub allocations: usize,
    /// Live permissions.
    pub permissions: usize,
    /// Live channel bindings.
    pub channels: usize,
}

/// A client's phase and when it was entered.
#[derive(Debug, Clone, Copy)]
pub(crate) struct PhaseRecord {
    pub(crate) phase: ClientPhase,
    pub(crate) since: std::time::Instant,
}

/// Current instant on the runtime clock.
pub(crate) fn now() -> std::time::Instant {
    tokio::time::Instant::now().into_std()
}

pub(crate) struct ServerInner {
    pub(crate) config: Config,
    pub(crate) policy: LifetimePolicy,
    pub(crate) nonces: NonceIssuer,
    pub(crate) credentials: CredentialBridge,
    pub(crate) allocator: Arc<dyn RelayAllocator>,
    pub(crate) addresses: AddressBook,
    pub(crate) allocations: DashMap<FiveTuple, Arc<AllocationEntry>>,
    pub(crate) workers: DashMap<FiveTuple, WorkerHandle>,
    pub(crate) phases: DashMap<FiveTuple, PhaseRecord>,
    pub(crate) pending_allocations: AtomicUsize,
    pub(crate) rate_limits: RateLimits,
    pub(crate) metrics: RelayMetrics,
    pub(crate) shutdown: CancellationToken,
    pub(crate) tasks: TaskTracker,
    control: Arc<dyn DatagramSession>,
    conventional: Option<Arc<dyn DatagramSession>>,
    started: tokio::time::Instant,
    started_unix: u64,
    next_worker_id: AtomicU64,
}

impl ServerInner {
    /// Session serving a listener.
    pub(crate) fn listener(&self, id: ListenerId) -> Option<&Arc<dyn DatagramSession>> {
        match id {
            ListenerId::Overlay => Some(&self.control),
            ListenerId::Conventional => self.conventional.as_ref(),
        }
    }

    /// Live allocation entry for a client.
    pub(crate) fn allocation(&self, tuple: &FiveTuple) -> Option<Arc<AllocationEntry>> {
        self.allocations.get(tuple).map(|entry| Arc::clone(entry.value()))
    }

    /// Seconds since the epoch, advancing with the runtime clock.
    pub(crate) fn unix_now(&self) -> u64 {
        self.started_unix + self.started.elapsed().as_secs()
    }

    pub(crate) fn issue_nonce(&self) -> String {
        self.nonces.issue(self.unix_now())
    }

    pub(crate) fn phase(&self, tuple: &FiveTuple) -> ClientPhase {
        self.phases.get(tuple).map(|r| r.phase).unwrap_or_default()
    }

    pub(crate) fn advance_phase(&self, tuple: &FiveTuple, event: PhaseEvent) -> ClientPhase {
        let mut record = self.phases.entry(tuple.clone()).or_insert_with(|| PhaseRecord {
            phase: ClientPhase::default(),
            since: now(),
        });
        let next = record.phase.on_event(event);
        if next != record.phase {
            record.phase = next;
            record.since = now();
        }
        next
    }

    pub(crate) fn next_worker_id(&self) -> u64 {
        self.next_worker_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Handle one inbound datagram.
    async fn dispatch(self: &Arc<Self>, listener: ListenerId, data: Vec<u8>, from: TransportAddr) {
        let Some(&first) = data.first() else {
            return;
        };
        let tuple = FiveTuple {
            listener,
            client: from,
        };

        if is_channel_data(first) {
            relay::client_channel_data(self, &tuple, &data).await;
            return;
        }
        if !is_stun(first) {
            RelayMetrics::incr(&self.metrics.packets_dropped);
            return;
        }

        let msg = match Message::decode(&data) {
            Ok(msg) => msg,
            Err(e) => {
                tracing::debug!(client = %tuple.client, error = %e, "dropping malformed STUN message");
                RelayMetrics::incr(&self.metrics.packets_dropped);
                return;
            }
        };
        if msg.has(attr_type::FINGERPRINT) && msg.verify_fingerprint().is_err() {
            tracing::debug!(client = %tuple.client, "dropping message with bad FINGERPRINT");
            RelayMetrics::incr(&self.metrics.packets_dropped);
            return;
        }

        match (msg.class(), msg.method()) {
            (Class::Indication, Method::Send) => relay::client_send_indication(self, &tuple, &msg).await,
            (Class::Request, _) => {
                if let Err(e) = self.rate_limits.check_request(&tuple.client) {
                    tracing::debug!(client = %tuple.client, "{}", e);
                    RelayMetrics::incr(&self.metrics.rate_limit_hits);
                    return;
                }
                RelayMetrics::incr(&self.metrics.requests_total);
                self.route_to_worker(tuple, msg);
            }
            _ => {
                RelayMetrics::incr(&self.metrics.packets_dropped);
            }
        }
    }

    /// Queue a request on the client's worker, starting one if needed.
    fn route_to_worker(self: &Arc<Self>, tuple: FiveTuple, msg: Message) {
        let mut msg = msg;
        // A worker may close its queue between lookup and send; retry once with a new one.
        for _ in 0..2 {
            let handle = self
                .workers
                .entry(tuple.clone())
                .or_insert_with(|| session::spawn_worker(Arc::clone(self), tuple.clone()))
                .value()
                .clone();
            match handle.tx.try_send(msg) {
                Ok(()) => return,
                Err(TrySendError::Full(_)) => {
                    tracing::debug!(client = %tuple.client, "client queue full, dropping request");
                    RelayMetrics::incr(&self.metrics.packets_dropped);
                    return;
                }
                Err(TrySendError::Closed(returned)) => {
                    self.workers.remove_if(&tuple, |_, h| h.id == handle.id);
                    msg = returned;
                }
            }
        }
        RelayMetrics::incr(&self.metrics.packets_dropped);
    }
}

/// The relay server.
#[derive(Clone)]
pub struct TurnServer {
    inner: Arc<ServerInner>,
}

impl std::fmt::Debug for TurnServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TurnServer")
            .field("realm", &self.inner.config.server.realm)
            .field("control", &self.inner.control.local_addr())
            .field("allocations", &self.inner.allocations.len())
            .field("metrics", &self.inner.metrics)
            .finish_non_exhaustive()
    }
}

impl TurnServer {
    /// Open the control session and start serving.
    ///
    /// # Errors
    ///
    /// [`RelayError::Bootstrap`] if the control session cannot be opened,
    /// [`RelayError::Config`] for invalid configuration and
    /// [`RelayError::Allocator`] if the relay allocator rejects its settings.
    pub async fn start(parts: ServerParts) -> Result<Self> {
        let ServerParts {
            config,
            provider,
            rooms,
            conventional,
        } = parts;
        config.validate()?;

        let name = config.overlay.control_session.clone();
        let control = match provider.open_control_session(&name).await {
            Ok(session) => session,
            Err(e) => {
                tracing::error!(
                    target: "garlic_turn::bootstrap",
                    session = %name,
                    kind = e.kind(),
                    error = %e,
                    "failed to open control session"
                );
                return Err(RelayError::Bootstrap(e));
            }
        };
        let control_addr = control.local_addr();

        let allocator = match OverlayRelayAllocator::new(
            Arc::clone(&provider),
            control_addr.to_string(),
            config.overlay.relay_session_prefix.clone(),
        ) {
            Ok(allocator) => allocator,
            Err(e) => {
                tracing::error!(target: "garlic_turn::bootstrap", error = %e, "invalid relay allocator");
                control.close().await;
                return Err(e.into());
            }
        };

        let mut secret = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut secret);
        let nonces = NonceIssuer::new(secret, config.lifetimes.nonce_lifetime());
        secret.zeroize();

        let started_unix = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO)
            .as_secs();

        let inner = Arc::new(ServerInner {
            policy: config.lifetimes.policy(),
            rate_limits: RateLimits::new(&config.limits),
            nonces,
            credentials: CredentialBridge::new(rooms),
            allocator: Arc::new(allocator),
            addresses: AddressBook::new(),
            allocations: DashMap::new(),
            workers: DashMap::new(),
            phases: DashMap::new(),
            pending_allocations: AtomicUsize::new(0),
            metrics: RelayMetrics::default(),
            shutdown: CancellationToken::new(),
            tasks: TaskTracker::new(),
            control: Arc::clone(&control),
            conventional: conventional.clone(),
            started: tokio::time::Instant::now(),
            started_unix,
            next_worker_id: AtomicU64::new(0),
            config,
        });

        inner
            .tasks
            .spawn(listen(Arc::clone(&inner), ListenerId::Overlay, control));
        if let Some(session) = conventional {
            tracing::info!(address = %session.local_addr(), "conventional listener enabled (STUN only)");
            inner
                .tasks
                .spawn(listen(Arc::clone(&inner), ListenerId::Conventional, session));
        }
        cleanup::spawn_cleanup_task(Arc::clone(&inner));

        let server = &inner.config.server;
        tracing::info!(
            realm = %server.realm,
            public_address = %server.public_address,
            port = server.listen_port,
            overlay_address = %control_addr,
            "garlic-turn relay started"
        );

        Ok(Self { inner })
    }

    /// Release every allocation, stop all tasks and close the listeners.
    pub async fn shutdown(&self) {
        let inner = &self.inner;
        if inner.shutdown.is_cancelled() {
            return;
        }
        tracing::info!(allocations = inner.allocations.len(), "shutting down");
        inner.shutdown.cancel();

        release_all(inner).await;
        inner.tasks.close();
        inner.tasks.wait().await;
        // Allocations that completed while workers were stopping.
        release_all(inner).await;

        inner.workers.clear();
        if let Some(session) = &inner.conventional {
            session.close().await;
        }
        inner.control.close().await;
        tracing::info!("shutdown complete");
    }

    /// Whether [`shutdown`](Self::shutdown) has been called.
    pub fn is_shut_down(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Address of the control session.
    pub fn control_addr(&self) -> TransportAddr {
        self.inner.control.local_addr()
    }

    /// Address of the conventional listener, if one is enabled.
    pub fn conventional_addr(&self) -> Option<TransportAddr> {
        self.inner.conventional.as_ref().map(|s| s.local_addr())
    }

    /// The server configuration.
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Operational metrics.
    pub fn metrics(&self) -> &RelayMetrics {
        &self.inner.metrics
    }

    /// Number of live allocations.
    pub fn allocation_count(&self) -> usize {
        self.inner.allocations.len()
    }

    /// Lifecycle phase of a client.
    pub fn client_phase(&self, tuple: &FiveTuple) -> ClientPhase {
        self.inner.phase(tuple)
    }

    /// Relayed address handed to a client, while its allocation is live.
    pub fn relayed_addr(&self, tuple: &FiveTuple) -> Option<SocketAddr> {
        self.inner.allocation(tuple).map(|entry| entry.relayed)
    }

    /// Overlay address behind a synthetic address the server has seen.
    pub fn overlay_for(&self, addr: SocketAddr) -> Option<OverlayAddr> {
        self.inner.addresses.resolve(addr)
    }

    /// Counts across all live allocations.
    pub async fn totals(&self) -> AllocationTotals {
        let entries: Vec<Arc<AllocationEntry>> = self
            .inner
            .allocations
            .iter()
            .map(|e| Arc::clone(e.value()))
            .collect();
        let now = now();
        let mut totals = AllocationTotals {
            allocations: entries.len(),
            ..AllocationTotals::default()
        };
        for entry in entries {
            let state = entry.state.read().await;
            totals.permissions += state.permission_count(now);
            totals.channels += state.channel_count(now);
        }
        totals
    }

    /// Time since the server started.
    pub fn uptime(&self) -> Duration {
        self.inner.started.elapsed()
    }

    #[cfg(test)]
    pub(crate) fn inner(&self) -> &Arc<ServerInner> {
        &self.inner
    }
}

async fn release_all(inner: &Arc<ServerInner>) {
    let entries: Vec<Arc<AllocationEntry>> = inner
        .allocations
        .iter()
        .map(|e| Arc::clone(e.value()))
        .collect();
    for entry in entries {
        relay::release(inner, &entry, PhaseEvent::Shutdown).await;
    }
}

/// Receive loop for one listener.
async fn listen(inner: Arc<ServerInner>, id: ListenerId, session: Arc<dyn DatagramSession>) {
    tracing::debug!(listener = ?id, address = %session.local_addr(), "listener started");
    loop {
        let received = tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            r = session.recv_from() => r,
        };
        match received {
            Ok((data, from)) => inner.dispatch(id, data, from).await,
            Err(TransportError::Closed) => {
                if !inner.shutdown.is_cancelled() {
                    tracing::error!(listener = ?id, "listener session closed unexpectedly");
                }
                break;
            }
            Err(e) => {
                tracing::warn!(listener = ?id, error = %e, "receive error");
            }
        }
    }
    tracing::debug!(listener = ?id, "listener stopped");
}
