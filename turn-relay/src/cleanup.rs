//! Background cleanup task.
//!
//! Runs periodically to drop expired permissions and channel bindings,
//! release allocations whose lifetime passed without their timer firing,
//! and evict idle rate limiter keys.
//!
//! Overlay addresses are forgotten once they have gone unseen for a
//! permission lifetime and no live allocation's relayed address,
//! permissions or channel bindings refer to them.

use crate::relay::{self, AllocationEntry};
use crate::server::{now, ServerInner};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;
use turn_core::{ClientPhase, PhaseEvent};

/// Result of one sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepStats {
    /// Expired permissions removed.
    pub permissions: usize,
    /// Expired channel bindings removed.
    pub channels: usize,
    /// Allocations released.
    pub allocations: usize,
    /// Overlay addresses forgotten.
    pub addresses: usize,
}

/// Spawn the cleanup task on the server's task tracker.
pub(crate) fn spawn_cleanup_task(inner: Arc<ServerInner>) {
    let config = inner.config.cleanup.clone();
    if !config.enabled {
        tracing::info!("Cleanup task disabled");
        return;
    }
    let tasks = inner.tasks.clone();
    tasks.spawn(async move {
        let interval_secs = config.interval_secs;
        tracing::info!("Cleanup task started (interval: {}s)", interval_secs);

        let mut timer = interval(Duration::from_secs(interval_secs));
        // The first tick completes immediately.
        timer.tick().await;

        loop {
            tokio::select! {
                _ = inner.shutdown.cancelled() => break,
                _ = timer.tick() => {}
            }
            let stats = sweep(&inner).await;
            if stats == SweepStats::default() {
                tracing::debug!("Cleanup: nothing expired");
            } else {
                tracing::info!(
                    permissions = stats.permissions,
                    channels = stats.channels,
                    allocations = stats.allocations,
                    addresses = stats.addresses,
                    "Cleanup: removed expired state"
                );
            }
        }
    });
}

/// Sweep every allocation once.
pub(crate) async fn sweep(inner: &ServerInner) -> SweepStats {
    let entries: Vec<Arc<AllocationEntry>> = inner
        .allocations
        .iter()
        .map(|e| Arc::clone(e.value()))
        .collect();
    let now = now();
    let mut stats = SweepStats::default();
    let mut referenced = HashSet::new();

    for entry in entries {
        let expired = {
            let mut state = entry.state.write().await;
            let (permissions, channels) = state.sweep(now);
            stats.permissions += permissions;
            stats.channels += channels;
            if state.is_active(now) {
                referenced.insert(entry.relayed.ip());
                referenced.extend(state.peer_ips(now));
            }
            !state.is_active(now)
        };
        if expired {
            relay::release(inner, &entry, PhaseEvent::LifetimeElapsed).await;
            stats.allocations += 1;
        }
    }

    stats.addresses = inner
        .addresses
        .sweep(now, inner.policy.permission_lifetime, &referenced);

    // Forget finished clients once they have been idle for a while.
    let idle = Duration::from_secs(inner.config.limits.client_idle_secs);
    inner.phases.retain(|tuple, record| {
        matches!(record.phase, ClientPhase::Active | ClientPhase::Allocating)
            || inner.workers.contains_key(tuple)
            || now.saturating_duration_since(record.since) < idle
    });

    inner.rate_limits.shrink();
    stats
}
