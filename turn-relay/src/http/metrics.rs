//! Prometheus metrics endpoint.

use crate::server::TurnServer;
use axum::{http::header::CONTENT_TYPE, response::IntoResponse, Extension};
use std::sync::atomic::Ordering;

/// Prometheus metrics handler.
///
/// Gauges report current state; counters are monotonic since startup.
pub async fn metrics_handler(Extension(server): Extension<TurnServer>) -> impl IntoResponse {
    let m = server.metrics();
    let totals = server.totals().await;

    let allocations = totals.allocations;
    let permissions = totals.permissions;
    let channels = totals.channels;

    let requests = m.requests_total.load(Ordering::Relaxed);
    let auth_failures = m.auth_failures.load(Ordering::Relaxed);
    let allocations_total = m.allocations_total.load(Ordering::Relaxed);
    let allocation_failures = m.allocation_failures.load(Ordering::Relaxed);
    let expired = m.allocations_expired.load(Ordering::Relaxed);
    let to_peer = m.bytes_to_peer.load(Ordering::Relaxed);
    let to_client = m.bytes_to_client.load(Ordering::Relaxed);
    let dropped = m.packets_dropped.load(Ordering::Relaxed);
    let rate_limits = m.rate_limit_hits.load(Ordering::Relaxed);

    let body = format!(
        r#"# HELP garlic_turn_allocations_active Number of live allocations
# TYPE garlic_turn_allocations_active gauge
garlic_turn_allocations_active {allocations}

# HELP garlic_turn_permissions_active Number of live permissions
# TYPE garlic_turn_permissions_active gauge
garlic_turn_permissions_active {permissions}

# HELP garlic_turn_channels_active Number of live channel bindings
# TYPE garlic_turn_channels_active gauge
garlic_turn_channels_active {channels}

# HELP garlic_turn_info Server information
# TYPE garlic_turn_info gauge
garlic_turn_info{{version="{version}"}} 1

# HELP garlic_turn_requests_total STUN requests processed
# TYPE garlic_turn_requests_total counter
garlic_turn_requests_total {requests}

# HELP garlic_turn_auth_failures_total Requests rejected with 401 Unauthorized
# TYPE garlic_turn_auth_failures_total counter
garlic_turn_auth_failures_total {auth_failures}

# HELP garlic_turn_allocations_total Allocations created
# TYPE garlic_turn_allocations_total counter
garlic_turn_allocations_total {allocations_total}

# HELP garlic_turn_allocation_failures_total Allocations refused after a relay allocator failure
# TYPE garlic_turn_allocation_failures_total counter
garlic_turn_allocation_failures_total {allocation_failures}

# HELP garlic_turn_allocations_expired_total Allocations released on lifetime expiry
# TYPE garlic_turn_allocations_expired_total counter
garlic_turn_allocations_expired_total {expired}

# HELP garlic_turn_bytes_to_peer_total Payload bytes relayed from clients to peers
# TYPE garlic_turn_bytes_to_peer_total counter
garlic_turn_bytes_to_peer_total {to_peer}

# HELP garlic_turn_bytes_to_client_total Payload bytes relayed from peers to clients
# TYPE garlic_turn_bytes_to_client_total counter
garlic_turn_bytes_to_client_total {to_client}

# HELP garlic_turn_packets_dropped_total Datagrams dropped
# TYPE garlic_turn_packets_dropped_total counter
garlic_turn_packets_dropped_total {dropped}

# HELP garlic_turn_rate_limit_hits_total Requests dropped by rate limiting
# TYPE garlic_turn_rate_limit_hits_total counter
garlic_turn_rate_limit_hits_total {rate_limits}
"#,
        version = env!("CARGO_PKG_VERSION"),
    );

    (
        [(CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
}
