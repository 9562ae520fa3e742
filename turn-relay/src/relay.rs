//! Allocation entries and the data path.
//!
//! Each allocation has one forwarding task that reads its relay session and
//! fires its lifetime timer. Data in either direction is sent while holding
//! the entry's read lock; release takes the write lock to close the
//! allocation, so once release starts no further datagram is forwarded.

use crate::allocator::RelayEndpoint;
use crate::error::TransportError;
use crate::overlay::{DatagramSession, TransportAddr};
use crate::server::{now, FiveTuple, RelayMetrics, ServerInner};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{Notify, RwLock};
use tokio_util::sync::CancellationToken;
use turn_core::{Allocation, PhaseEvent};
use turn_types::{Attribute, ChannelData, Class, Message, MessageBuilder, Method, TransactionId};

/// One live allocation.
pub(crate) struct AllocationEntry {
    pub(crate) tuple: FiveTuple,
    /// Listener session the client talks to.
    pub(crate) listener: Arc<dyn DatagramSession>,
    /// Relay session peers talk to.
    pub(crate) relay: Arc<dyn DatagramSession>,
    /// Relayed address as given to the client.
    pub(crate) relayed: SocketAddr,
    pub(crate) state: RwLock<Allocation>,
    cancel: CancellationToken,
    timer_reset: Notify,
    released: AtomicBool,
}

impl AllocationEntry {
    pub(crate) fn new(
        tuple: FiveTuple,
        listener: Arc<dyn DatagramSession>,
        endpoint: RelayEndpoint,
        allocation: Allocation,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            tuple,
            listener,
            relay: endpoint.session,
            relayed: allocation.relayed_addr(),
            state: RwLock::new(allocation),
            cancel,
            timer_reset: Notify::new(),
            released: AtomicBool::new(false),
        }
    }

    /// Re-arm the lifetime timer after the expiry changed.
    pub(crate) fn reset_timer(&self) {
        self.timer_reset.notify_one();
    }
}

/// Start the forwarding task for a new allocation.
pub(crate) fn spawn_forwarder(inner: Arc<ServerInner>, entry: Arc<AllocationEntry>) {
    let tasks = inner.tasks.clone();
    tasks.spawn(forward(inner, entry));
}

async fn forward(inner: Arc<ServerInner>, entry: Arc<AllocationEntry>) {
    loop {
        let expires = entry.state.read().await.expires_at();
        tokio::select! {
            _ = entry.cancel.cancelled() => break,
            _ = entry.timer_reset.notified() => continue,
            _ = tokio::time::sleep_until(tokio::time::Instant::from_std(expires)) => {
                let active = entry.state.read().await.is_active(now());
                if !active {
                    release(&inner, &entry, PhaseEvent::LifetimeElapsed).await;
                    break;
                }
            }
            received = entry.relay.recv_from() => match received {
                Ok((data, from)) => deliver_to_client(&inner, &entry, data, from).await,
                Err(TransportError::Closed) => {
                    if !entry.released.load(Ordering::SeqCst) {
                        tracing::warn!(
                            target: "garlic_turn::session",
                            client = %entry.tuple.client,
                            "relay session closed underneath allocation"
                        );
                        release(&inner, &entry, PhaseEvent::Deleted).await;
                    }
                    break;
                }
                Err(e) => {
                    tracing::debug!(client = %entry.tuple.client, error = %e, "relay receive error");
                }
            }
        }
    }
}

/// Release an allocation and its relay session. Runs once per entry.
pub(crate) async fn release(inner: &ServerInner, entry: &Arc<AllocationEntry>, event: PhaseEvent) {
    if entry.released.swap(true, Ordering::SeqCst) {
        return;
    }
    {
        let mut state = entry.state.write().await;
        state.close();
    }
    entry.cancel.cancel();
    entry.relay.close().await;
    inner
        .allocations
        .remove_if(&entry.tuple, |_, current| Arc::ptr_eq(current, entry));
    let phase = inner.advance_phase(&entry.tuple, event);
    if event == PhaseEvent::LifetimeElapsed {
        RelayMetrics::incr(&inner.metrics.allocations_expired);
    }
    tracing::info!(
        client = %entry.tuple.client,
        relayed = %entry.relayed,
        phase = ?phase,
        reason = ?event,
        "allocation released"
    );
}

/// Send indication from a client.
pub(crate) async fn client_send_indication(inner: &ServerInner, tuple: &FiveTuple, msg: &Message) {
    let peer = msg.xor_peer_addresses().into_iter().next();
    let (Some(peer), Some(data)) = (peer, msg.data()) else {
        RelayMetrics::incr(&inner.metrics.packets_dropped);
        return;
    };
    let Some(entry) = inner.allocation(tuple) else {
        RelayMetrics::incr(&inner.metrics.packets_dropped);
        return;
    };
    let state = entry.state.read().await;
    if !state.permits(peer.ip(), now()) {
        drop(state);
        tracing::trace!(client = %tuple.client, %peer, "no permission, dropping Send");
        RelayMetrics::incr(&inner.metrics.packets_dropped);
        return;
    }
    send_to_peer(inner, &entry, peer, data).await;
}

/// ChannelData from a client.
pub(crate) async fn client_channel_data(inner: &ServerInner, tuple: &FiveTuple, datagram: &[u8]) {
    let frame = match ChannelData::decode(datagram) {
        Ok(frame) => frame,
        Err(_) => {
            RelayMetrics::incr(&inner.metrics.packets_dropped);
            return;
        }
    };
    let Some(entry) = inner.allocation(tuple) else {
        RelayMetrics::incr(&inner.metrics.packets_dropped);
        return;
    };
    let now = now();
    let state = entry.state.read().await;
    let peer = state
        .channel_peer(frame.channel, now)
        .filter(|peer| state.permits(peer.ip(), now));
    let Some(peer) = peer else {
        drop(state);
        RelayMetrics::incr(&inner.metrics.packets_dropped);
        return;
    };
    send_to_peer(inner, &entry, peer, &frame.data).await;
}

/// Relay client data to a peer. Caller holds the entry's read lock.
async fn send_to_peer(inner: &ServerInner, entry: &AllocationEntry, peer: SocketAddr, data: &[u8]) {
    let Some(dest) = inner.addresses.resolve(peer) else {
        RelayMetrics::incr(&inner.metrics.packets_dropped);
        return;
    };
    match entry.relay.send_to(data, &TransportAddr::Overlay(dest)).await {
        Ok(()) => RelayMetrics::add(&inner.metrics.bytes_to_peer, data.len()),
        Err(e) => {
            tracing::debug!(client = %entry.tuple.client, %peer, error = %e, "send to peer failed");
            RelayMetrics::incr(&inner.metrics.packets_dropped);
        }
    }
}

/// Relay a peer datagram to the client, if the peer is permitted.
async fn deliver_to_client(
    inner: &ServerInner,
    entry: &AllocationEntry,
    data: Vec<u8>,
    from: TransportAddr,
) {
    let TransportAddr::Overlay(source) = &from else {
        RelayMetrics::incr(&inner.metrics.packets_dropped);
        return;
    };
    let peer = inner.addresses.learn(source);
    let now = now();
    let state = entry.state.read().await;
    if !state.permits(peer.ip(), now) {
        drop(state);
        tracing::trace!(client = %entry.tuple.client, %peer, "no permission, dropping peer data");
        RelayMetrics::incr(&inner.metrics.packets_dropped);
        return;
    }

    let len = data.len();
    let framed = match state.peer_channel(peer, now) {
        Some(channel) => ChannelData::new(channel, data).map(|frame| frame.encode()),
        None => MessageBuilder::new(Method::Data, Class::Indication, TransactionId::random())
            .attr(Attribute::XorPeerAddress(peer))
            .attr(Attribute::Data(data))
            .try_build(),
    };
    drop(state);
    let packet = match framed {
        Ok(packet) => packet,
        Err(e) => {
            tracing::debug!(client = %entry.tuple.client, %peer, len, error = %e, "peer datagram too large to frame");
            RelayMetrics::incr(&inner.metrics.packets_dropped);
            return;
        }
    };
    match entry.listener.send_to(&packet, &entry.tuple.client).await {
        Ok(()) => RelayMetrics::add(&inner.metrics.bytes_to_client, len),
        Err(e) => {
            tracing::debug!(client = %entry.tuple.client, error = %e, "delivery to client failed");
            RelayMetrics::incr(&inner.metrics.packets_dropped);
        }
    }
}
