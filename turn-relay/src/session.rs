//! Per-client request handling.
//!
//! Every client 5-tuple gets one worker task that handles its STUN requests
//! in arrival order. A worker stays up while its client holds an allocation
//! and exits after `limits.client_idle_secs` without requests otherwise.

use crate::allocator::RelayRequest;
use crate::error::AllocationError;
use crate::relay::{self, AllocationEntry};
use crate::server::{now, FiveTuple, RelayMetrics, ServerInner};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use turn_core::{Allocation, ChannelBindError, NonceStatus, PhaseEvent};
use turn_types::attribute::FAMILY_IPV6;
use turn_types::{
    attr_type, is_valid_channel, Attribute, ErrorCode, LongTermKey, Message, MessageBuilder,
    Method, PROTO_TCP, PROTO_UDP,
};

/// Queue into a client's worker.
#[derive(Clone)]
pub(crate) struct WorkerHandle {
    pub(crate) id: u64,
    pub(crate) tx: mpsc::Sender<Message>,
}

/// Start a worker for `tuple` and return its queue.
pub(crate) fn spawn_worker(inner: Arc<ServerInner>, tuple: FiveTuple) -> WorkerHandle {
    let (tx, rx) = mpsc::channel(inner.config.limits.client_queue_depth);
    let id = inner.next_worker_id();
    let worker = ClientWorker {
        inner: Arc::clone(&inner),
        tuple,
        id,
    };
    inner.tasks.spawn(worker.run(rx));
    WorkerHandle { id, tx }
}

/// Credentials that passed the long-term credential check.
struct Authorized {
    username: String,
    key: LongTermKey,
}

struct ClientWorker {
    inner: Arc<ServerInner>,
    tuple: FiveTuple,
    id: u64,
}

impl ClientWorker {
    async fn run(self, mut rx: mpsc::Receiver<Message>) {
        let idle = Duration::from_secs(self.inner.config.limits.client_idle_secs);
        tracing::debug!(client = %self.tuple.client, "client worker started");
        loop {
            let next = tokio::select! {
                _ = self.inner.shutdown.cancelled() => break,
                next = tokio::time::timeout(idle, rx.recv()) => next,
            };
            match next {
                Ok(Some(msg)) => self.handle(msg).await,
                Ok(None) => break,
                Err(_) => {
                    if self.inner.allocations.contains_key(&self.tuple) {
                        continue;
                    }
                    // Idle with nothing to look after: leave the table, then drain what raced in.
                    self.inner
                        .workers
                        .remove_if(&self.tuple, |_, handle| handle.id == self.id);
                    rx.close();
                    while let Ok(msg) = rx.try_recv() {
                        self.handle(msg).await;
                    }
                    break;
                }
            }
        }
        tracing::debug!(client = %self.tuple.client, "client worker stopped");
    }

    async fn handle(&self, msg: Message) {
        let response = match msg.method() {
            Method::Binding => Some(self.binding(&msg)),
            Method::Allocate | Method::Refresh | Method::CreatePermission | Method::ChannelBind => {
                self.authenticated(&msg).await
            }
            Method::Send | Method::Data => Some(self.unsigned_error(&msg, ErrorCode::BAD_REQUEST)),
        };
        let Some(response) = response else {
            return;
        };
        let Some(listener) = self.inner.listener(self.tuple.listener) else {
            return;
        };
        if let Err(e) = listener.send_to(&response, &self.tuple.client).await {
            tracing::debug!(client = %self.tuple.client, error = %e, "failed to send response");
        }
    }

    fn software(&self) -> Attribute {
        Attribute::Software(self.inner.config.server.software.clone())
    }

    fn mapped_address(&self) -> Attribute {
        Attribute::XorMappedAddress(self.inner.addresses.to_wire(&self.tuple.client))
    }

    fn binding(&self, msg: &Message) -> Vec<u8> {
        MessageBuilder::success(msg)
            .attr(self.mapped_address())
            .attr(self.software())
            .with_fingerprint()
            .build()
    }

    /// Error carrying REALM and a fresh NONCE, without MESSAGE-INTEGRITY.
    fn challenge(&self, msg: &Message, code: ErrorCode) -> Vec<u8> {
        MessageBuilder::error(msg, code)
            .attr(Attribute::Realm(self.inner.config.server.realm.clone()))
            .attr(Attribute::Nonce(self.inner.issue_nonce()))
            .attr(self.software())
            .with_fingerprint()
            .build()
    }

    fn unsigned_error(&self, msg: &Message, code: ErrorCode) -> Vec<u8> {
        MessageBuilder::error(msg, code)
            .attr(self.software())
            .with_fingerprint()
            .build()
    }

    fn signed_error(&self, msg: &Message, code: ErrorCode, auth: &Authorized) -> Vec<u8> {
        MessageBuilder::error(msg, code)
            .attr(self.software())
            .with_fingerprint()
            .build_with_integrity(&auth.key)
    }

    fn signed(&self, builder: MessageBuilder, auth: &Authorized) -> Vec<u8> {
        builder
            .attr(self.software())
            .with_fingerprint()
            .build_with_integrity(&auth.key)
    }

    /// Uniform rejection for every credential failure.
    fn unauthorized(&self, msg: &Message) -> Vec<u8> {
        RelayMetrics::incr(&self.inner.metrics.auth_failures);
        self.challenge(msg, ErrorCode::UNAUTHORIZED)
    }

    /// Long-term credential check.
    async fn authenticate(&self, msg: &Message) -> Result<Authorized, Vec<u8>> {
        if !msg.has_integrity() {
            return Err(self.challenge(msg, ErrorCode::UNAUTHORIZED));
        }
        let (Some(username), Some(realm), Some(nonce)) = (msg.username(), msg.realm(), msg.nonce())
        else {
            return Err(self.unsigned_error(msg, ErrorCode::BAD_REQUEST));
        };
        match self.inner.nonces.check(nonce, self.inner.unix_now()) {
            NonceStatus::Fresh => {}
            NonceStatus::Stale | NonceStatus::Invalid => {
                return Err(self.challenge(msg, ErrorCode::STALE_NONCE));
            }
        }

        let server_realm = &self.inner.config.server.realm;
        if realm != server_realm {
            tracing::debug!(client = %self.tuple.client, "realm mismatch");
            return Err(self.unauthorized(msg));
        }
        let Some(key) = self
            .inner
            .credentials
            .authenticate(username, server_realm, self.tuple.client.kind())
            .await
        else {
            tracing::debug!(client = %self.tuple.client, "no credentials for request");
            return Err(self.unauthorized(msg));
        };
        if msg.verify_integrity(&key).is_err() {
            tracing::debug!(client = %self.tuple.client, "MESSAGE-INTEGRITY mismatch");
            return Err(self.unauthorized(msg));
        }
        Ok(Authorized {
            username: username.to_string(),
            key,
        })
    }

    async fn authenticated(&self, msg: &Message) -> Option<Vec<u8>> {
        let auth = match self.authenticate(msg).await {
            Ok(auth) => auth,
            Err(response) => return Some(response),
        };

        let unknown = msg.unknown_comprehension_required();
        if !unknown.is_empty() {
            let response = MessageBuilder::error(msg, ErrorCode::UNKNOWN_ATTRIBUTE)
                .attr(Attribute::UnknownAttributes(unknown));
            return Some(self.signed(response, &auth));
        }

        let entry = self.inner.allocation(&self.tuple);
        if let Some(entry) = &entry {
            let owner_matches = entry.state.read().await.username() == auth.username;
            if !owner_matches {
                return Some(self.signed_error(msg, ErrorCode::WRONG_CREDENTIALS, &auth));
            }
        }

        match msg.method() {
            Method::Allocate => self.allocate(msg, &auth, entry).await,
            Method::Refresh => Some(self.refresh(msg, &auth, entry).await),
            Method::CreatePermission => Some(self.create_permission(msg, &auth, entry).await),
            Method::ChannelBind => Some(self.channel_bind(msg, &auth, entry).await),
            _ => Some(self.signed_error(msg, ErrorCode::BAD_REQUEST, &auth)),
        }
    }

    fn allocate_success(
        &self,
        msg: &Message,
        auth: &Authorized,
        entry: &AllocationEntry,
        lifetime: Duration,
    ) -> Vec<u8> {
        let response = MessageBuilder::success(msg)
            .attr(Attribute::XorRelayedAddress(entry.relayed))
            .attr(Attribute::Lifetime(lifetime_secs(lifetime)))
            .attr(self.mapped_address());
        self.signed(response, auth)
    }

    async fn allocate(
        &self,
        msg: &Message,
        auth: &Authorized,
        existing: Option<Arc<AllocationEntry>>,
    ) -> Option<Vec<u8>> {
        let inner = &self.inner;

        if let Some(entry) = existing {
            // A repeated Allocate on a live 5-tuple refreshes it.
            let lifetime = inner.policy.allocate_lifetime(msg.lifetime());
            let refreshed = entry.state.write().await.refresh(now(), lifetime);
            match refreshed {
                Ok(()) => {
                    entry.reset_timer();
                    inner.advance_phase(&self.tuple, PhaseEvent::AllocateRequested);
                    tracing::debug!(client = %self.tuple.client, "duplicate Allocate treated as refresh");
                    return Some(self.allocate_success(msg, auth, &entry, lifetime));
                }
                Err(_) => relay::release(inner, &entry, PhaseEvent::LifetimeElapsed).await,
            }
        }

        let Some(transport) = msg.requested_transport() else {
            return Some(self.signed_error(msg, ErrorCode::BAD_REQUEST, auth));
        };
        if msg.has(attr_type::RESERVATION_TOKEN) {
            return Some(self.signed_error(msg, ErrorCode::INSUFFICIENT_CAPACITY, auth));
        }
        if let Some(Attribute::RequestedAddressFamily(family)) =
            msg.get(attr_type::REQUESTED_ADDRESS_FAMILY)
        {
            if *family != FAMILY_IPV6 {
                return Some(self.signed_error(
                    msg,
                    ErrorCode::ADDRESS_FAMILY_NOT_SUPPORTED,
                    auth,
                ));
            }
        }
        if transport != PROTO_UDP && transport != PROTO_TCP {
            return Some(self.signed_error(
                msg,
                ErrorCode::UNSUPPORTED_TRANSPORT_PROTOCOL,
                auth,
            ));
        }
        let in_use = inner.allocations.len() + inner.pending_allocations.load(Ordering::SeqCst);
        if in_use >= inner.config.limits.max_allocations {
            tracing::warn!(
                target: "garlic_turn::session",
                client = %self.tuple.client,
                "allocation quota reached"
            );
            return Some(self.signed_error(msg, ErrorCode::ALLOCATION_QUOTA_REACHED, auth));
        }

        inner.advance_phase(&self.tuple, PhaseEvent::AllocateRequested);
        let request = RelayRequest {
            client: self.tuple.client.to_string(),
            requested_port: 0,
        };
        inner.pending_allocations.fetch_add(1, Ordering::SeqCst);
        let outcome = tokio::select! {
            _ = inner.shutdown.cancelled() => Err(AllocationError::Cancelled),
            r = async {
                if transport == PROTO_TCP {
                    inner.allocator.allocate_stream_relay(&request).await
                } else {
                    inner.allocator.allocate_datagram_relay(&request).await
                }
            } => r,
        };
        inner.pending_allocations.fetch_sub(1, Ordering::SeqCst);

        let endpoint = match outcome {
            Ok(endpoint) => endpoint,
            Err(AllocationError::Cancelled) => {
                inner.advance_phase(&self.tuple, PhaseEvent::Shutdown);
                return None;
            }
            Err(AllocationError::Unsupported) => {
                inner.advance_phase(&self.tuple, PhaseEvent::AllocationFailed);
                return Some(self.signed_error(
                    msg,
                    ErrorCode::UNSUPPORTED_TRANSPORT_PROTOCOL,
                    auth,
                ));
            }
            Err(AllocationError::Underlying(e)) => {
                inner.advance_phase(&self.tuple, PhaseEvent::AllocationFailed);
                RelayMetrics::incr(&inner.metrics.allocation_failures);
                tracing::warn!(
                    target: "garlic_turn::session",
                    client = %self.tuple.client,
                    kind = e.kind(),
                    error = %e,
                    "relay allocation failed"
                );
                let code = ErrorCode::INSUFFICIENT_CAPACITY;
                let response = MessageBuilder::new(
                    msg.method(),
                    turn_types::Class::ErrorResponse,
                    msg.transaction_id(),
                )
                .attr(Attribute::ErrorCode {
                    code: code.code(),
                    reason: format!("{}: {}", code.reason(), e.kind()),
                });
                return Some(self.signed(response, auth));
            }
            Err(AllocationError::InvalidConfiguration(reason)) => {
                inner.advance_phase(&self.tuple, PhaseEvent::AllocationFailed);
                RelayMetrics::incr(&inner.metrics.allocation_failures);
                tracing::error!(
                    target: "garlic_turn::session",
                    client = %self.tuple.client,
                    %reason,
                    "relay allocator misconfigured"
                );
                return Some(self.signed_error(msg, ErrorCode::SERVER_ERROR, auth));
            }
        };

        if inner.shutdown.is_cancelled() {
            endpoint.session.close().await;
            inner.advance_phase(&self.tuple, PhaseEvent::Shutdown);
            return None;
        }
        let Some(listener) = inner.listener(self.tuple.listener).cloned() else {
            endpoint.session.close().await;
            return None;
        };

        let relayed = inner.addresses.to_wire(&endpoint.reachable);
        let lifetime = inner.policy.allocate_lifetime(msg.lifetime());
        let allocation = Allocation::new(relayed, auth.username.clone(), now(), lifetime);
        let entry = Arc::new(AllocationEntry::new(
            self.tuple.clone(),
            listener,
            endpoint,
            allocation,
            inner.shutdown.child_token(),
        ));
        inner.allocations.insert(self.tuple.clone(), Arc::clone(&entry));
        relay::spawn_forwarder(Arc::clone(inner), Arc::clone(&entry));
        inner.advance_phase(&self.tuple, PhaseEvent::AllocationSucceeded);
        RelayMetrics::incr(&inner.metrics.allocations_total);

        tracing::info!(
            client = %self.tuple.client,
            %relayed,
            lifetime_secs = lifetime.as_secs(),
            "allocation created"
        );
        Some(self.allocate_success(msg, auth, &entry, lifetime))
    }

    async fn refresh(
        &self,
        msg: &Message,
        auth: &Authorized,
        entry: Option<Arc<AllocationEntry>>,
    ) -> Vec<u8> {
        let Some(entry) = entry else {
            return self.signed_error(msg, ErrorCode::ALLOCATION_MISMATCH, auth);
        };
        let lifetime = self.inner.policy.refresh_lifetime(msg.lifetime());
        if lifetime.is_zero() {
            relay::release(&self.inner, &entry, PhaseEvent::Deleted).await;
        } else {
            let refreshed = entry.state.write().await.refresh(now(), lifetime);
            if refreshed.is_err() {
                return self.signed_error(msg, ErrorCode::ALLOCATION_MISMATCH, auth);
            }
            entry.reset_timer();
            self.inner.advance_phase(&self.tuple, PhaseEvent::Refreshed);
        }
        let response =
            MessageBuilder::success(msg).attr(Attribute::Lifetime(lifetime_secs(lifetime)));
        self.signed(response, auth)
    }

    async fn create_permission(
        &self,
        msg: &Message,
        auth: &Authorized,
        entry: Option<Arc<AllocationEntry>>,
    ) -> Vec<u8> {
        let Some(entry) = entry else {
            return self.signed_error(msg, ErrorCode::ALLOCATION_MISMATCH, auth);
        };
        let peers = msg.xor_peer_addresses();
        if peers.is_empty() {
            return self.signed_error(msg, ErrorCode::BAD_REQUEST, auth);
        }
        // Validate every peer before installing any.
        if peers.iter().any(|peer| self.inner.addresses.resolve(*peer).is_none()) {
            return self.signed_error(msg, ErrorCode::FORBIDDEN, auth);
        }

        let now = now();
        let mut state = entry.state.write().await;
        for peer in &peers {
            if state
                .create_permission(peer.ip(), now, &self.inner.policy)
                .is_err()
            {
                return self.signed_error(msg, ErrorCode::ALLOCATION_MISMATCH, auth);
            }
        }
        drop(state);
        tracing::debug!(client = %self.tuple.client, count = peers.len(), "permissions installed");
        self.signed(MessageBuilder::success(msg), auth)
    }

    async fn channel_bind(
        &self,
        msg: &Message,
        auth: &Authorized,
        entry: Option<Arc<AllocationEntry>>,
    ) -> Vec<u8> {
        let Some(entry) = entry else {
            return self.signed_error(msg, ErrorCode::ALLOCATION_MISMATCH, auth);
        };
        let peer = msg.xor_peer_addresses().into_iter().next();
        let (Some(channel), Some(peer)) = (msg.channel_number(), peer) else {
            return self.signed_error(msg, ErrorCode::BAD_REQUEST, auth);
        };
        if !is_valid_channel(channel) {
            return self.signed_error(msg, ErrorCode::BAD_REQUEST, auth);
        }
        let Some(overlay) = self.inner.addresses.resolve(peer) else {
            return self.signed_error(msg, ErrorCode::FORBIDDEN, auth);
        };
        // Bind the canonical form so peer datagrams find the channel.
        let peer = self.inner.addresses.learn(&overlay);

        let bound = entry
            .state
            .write()
            .await
            .bind_channel(channel, peer, now(), &self.inner.policy);
        match bound {
            Ok(()) => {
                tracing::debug!(client = %self.tuple.client, channel, %peer, "channel bound");
                self.signed(MessageBuilder::success(msg), auth)
            }
            Err(ChannelBindError::AllocationInactive) => {
                self.signed_error(msg, ErrorCode::ALLOCATION_MISMATCH, auth)
            }
            Err(e) => {
                tracing::debug!(client = %self.tuple.client, error = %e, "channel bind rejected");
                self.signed_error(msg, ErrorCode::BAD_REQUEST, auth)
            }
        }
    }
}

fn lifetime_secs(lifetime: Duration) -> u32 {
    u32::try_from(lifetime.as_secs()).unwrap_or(u32::MAX)
}
