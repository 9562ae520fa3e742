//! Allocation record: relayed address, lifetime and the two child tables.
//!
//! Every accessor checks the allocation itself first, so once an allocation
//! expires or is closed its permissions and bindings stop working even if
//! their own entries have not yet expired.

use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

use thiserror::Error;

use crate::channel::{ChannelBindError, ChannelTable};
use crate::lifetime::LifetimePolicy;
use crate::permission::PermissionTable;

/// The allocation has expired or been released.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("allocation is no longer active")]
pub struct InactiveAllocation;

/// One client's relay allocation.
#[derive(Debug, Clone)]
pub struct Allocation {
    relayed_addr: SocketAddr,
    username: String,
    created_at: Instant,
    expires_at: Instant,
    closed: bool,
    permissions: PermissionTable,
    channels: ChannelTable,
}

impl Allocation {
    /// Create an allocation that lives for `lifetime` from `now`.
    pub fn new(
        relayed_addr: SocketAddr,
        username: impl Into<String>,
        now: Instant,
        lifetime: Duration,
    ) -> Self {
        Self {
            relayed_addr,
            username: username.into(),
            created_at: now,
            expires_at: now + lifetime,
            closed: false,
            permissions: PermissionTable::new(),
            channels: ChannelTable::new(),
        }
    }

    /// Relayed transport address given to the client.
    pub fn relayed_addr(&self) -> SocketAddr {
        self.relayed_addr
    }

    /// Username that created the allocation.
    pub fn username(&self) -> &str {
        &self.username
    }

    /// Creation time.
    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Expiry time.
    pub fn expires_at(&self) -> Instant {
        self.expires_at
    }

    /// Time left before expiry.
    pub fn remaining(&self, now: Instant) -> Duration {
        self.expires_at.saturating_duration_since(now)
    }

    /// Not closed and not expired.
    pub fn is_active(&self, now: Instant) -> bool {
        !self.closed && now < self.expires_at
    }

    /// Whether [`close`](Self::close) has been called.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Extend the allocation. A zero lifetime closes it.
    pub fn refresh(&mut self, now: Instant, lifetime: Duration) -> Result<(), InactiveAllocation> {
        if !self.is_active(now) {
            return Err(InactiveAllocation);
        }
        if lifetime.is_zero() {
            self.close();
        } else {
            self.expires_at = now + lifetime;
        }
        Ok(())
    }

    /// Release the allocation and everything hanging off it.
    pub fn close(&mut self) {
        self.closed = true;
        self.permissions.clear();
        self.channels.clear();
    }

    /// Install or refresh a permission for `ip`.
    pub fn create_permission(
        &mut self,
        ip: IpAddr,
        now: Instant,
        policy: &LifetimePolicy,
    ) -> Result<(), InactiveAllocation> {
        if !self.is_active(now) {
            return Err(InactiveAllocation);
        }
        self.permissions.install(ip, now, policy.permission_lifetime);
        Ok(())
    }

    /// Bind `channel` to `peer`. Also installs a permission for the peer's IP.
    pub fn bind_channel(
        &mut self,
        channel: u16,
        peer: SocketAddr,
        now: Instant,
        policy: &LifetimePolicy,
    ) -> Result<(), ChannelBindError> {
        if !self.is_active(now) {
            return Err(ChannelBindError::AllocationInactive);
        }
        self.channels
            .bind(channel, peer, now, policy.channel_lifetime)?;
        self.permissions
            .install(peer.ip(), now, policy.permission_lifetime);
        Ok(())
    }

    /// Whether data to or from `ip` may be relayed.
    pub fn permits(&self, ip: IpAddr, now: Instant) -> bool {
        self.is_active(now) && self.permissions.allows(ip, now)
    }

    /// Peer bound to `channel`.
    pub fn channel_peer(&self, channel: u16, now: Instant) -> Option<SocketAddr> {
        if !self.is_active(now) {
            return None;
        }
        self.channels.peer(channel, now)
    }

    /// Channel bound to `peer`.
    pub fn peer_channel(&self, peer: SocketAddr, now: Instant) -> Option<u16> {
        if !self.is_active(now) {
            return None;
        }
        self.channels.channel(peer, now)
    }

    /// Drop expired permissions and bindings. Returns (permissions, channels) removed.
    pub fn sweep(&mut self, now: Instant) -> (usize, usize) {
        (self.permissions.sweep(now), self.channels.sweep(now))
    }

    /// IPs of every peer this allocation still references through a live
    /// permission or channel binding.
    pub fn peer_ips(&self, now: Instant) -> Vec<IpAddr> {
        if !self.is_active(now) {
            return Vec::new();
        }
        let mut ips: Vec<IpAddr> = self
            .permissions
            .live_ips(now)
            .chain(self.channels.live_peers(now).map(|peer| peer.ip()))
            .collect();
        ips.sort_unstable();
        ips.dedup();
        ips
    }

    /// Live permission count.
    pub fn permission_count(&self, now: Instant) -> usize {
        if !self.is_active(now) {
            return 0;
        }
        self.permissions.live_count(now)
    }

    /// Live channel binding count.
    pub fn channel_count(&self, now: Instant) -> usize {
        if !self.is_active(now) {
            return 0;
        }
        self.channels.live_count(now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn relayed() -> SocketAddr {
        "[fd49:3250::aa]:5000".parse().unwrap()
    }

    fn peer() -> SocketAddr {
        "[fd49:3250::bb]:6000".parse().unwrap()
    }

    #[test]
    fn expiry_invalidates_children() {
        let policy = LifetimePolicy::default();
        let t0 = Instant::now();
        let mut alloc = Allocation::new(relayed(), "room-42", t0, Duration::from_secs(100));
        alloc.create_permission(peer().ip(), t0, &policy).unwrap();
        alloc.bind_channel(0x4000, peer(), t0, &policy).unwrap();

        let before = t0 + Duration::from_secs(99);
        assert!(alloc.permits(peer().ip(), before));
        assert_eq!(alloc.channel_peer(0x4000, before), Some(peer()));

        // Permission would live 300s, binding 600s; the allocation dies first.
        let after = t0 + Duration::from_secs(100);
        assert!(!alloc.is_active(after));
        assert!(!alloc.permits(peer().ip(), after));
        assert_eq!(alloc.channel_peer(0x4000, after), None);
        assert_eq!(alloc.peer_channel(peer(), after), None);
    }

    #[test]
    fn zero_refresh_closes() {
        let t0 = Instant::now();
        let mut alloc = Allocation::new(relayed(), "u", t0, Duration::from_secs(600));
        alloc.refresh(t0, Duration::ZERO).unwrap();
        assert!(alloc.is_closed());
        assert!(!alloc.is_active(t0));
        assert_eq!(alloc.refresh(t0, Duration::from_secs(600)), Err(InactiveAllocation));
    }

    #[test]
    fn refresh_extends() {
        let t0 = Instant::now();
        let mut alloc = Allocation::new(relayed(), "u", t0, Duration::from_secs(600));
        let t1 = t0 + Duration::from_secs(500);
        alloc.refresh(t1, Duration::from_secs(600)).unwrap();
        assert!(alloc.is_active(t0 + Duration::from_secs(1000)));
        assert_eq!(alloc.remaining(t1), Duration::from_secs(600));
    }

    #[test]
    fn channel_bind_installs_permission() {
        let policy = LifetimePolicy::default();
        let t0 = Instant::now();
        let mut alloc = Allocation::new(relayed(), "u", t0, Duration::from_secs(600));
        alloc.bind_channel(0x4001, peer(), t0, &policy).unwrap();
        assert!(alloc.permits(peer().ip(), t0));
        assert_eq!(alloc.permission_count(t0), 1);
        assert_eq!(alloc.channel_count(t0), 1);
    }

    #[test]
    fn closed_allocation_rejects_changes() {
        let policy = LifetimePolicy::default();
        let t0 = Instant::now();
        let mut alloc = Allocation::new(relayed(), "u", t0, Duration::from_secs(600));
        alloc.close();
        assert_eq!(
            alloc.create_permission(peer().ip(), t0, &policy),
            Err(InactiveAllocation)
        );
        assert_eq!(
            alloc.bind_channel(0x4001, peer(), t0, &policy),
            Err(ChannelBindError::AllocationInactive)
        );
    }

    #[test]
    fn bound_peer_outlives_its_permission_in_peer_ips() {
        let policy = LifetimePolicy::default();
        let t0 = Instant::now();
        let mut alloc = Allocation::new(relayed(), "u", t0, Duration::from_secs(3600));
        let other: SocketAddr = "[fd49:3250::cc]:7000".parse().unwrap();
        alloc.bind_channel(0x4001, peer(), t0, &policy).unwrap();
        alloc.create_permission(other.ip(), t0, &policy).unwrap();
        assert_eq!(alloc.peer_ips(t0), vec![peer().ip(), other.ip()]);

        // Both permissions lapse at 300s, the binding holds until 600s.
        let t1 = t0 + Duration::from_secs(400);
        assert_eq!(alloc.peer_ips(t1), vec![peer().ip()]);
        assert!(alloc.peer_ips(t0 + Duration::from_secs(600)).is_empty());

        alloc.close();
        assert!(alloc.peer_ips(t0).is_empty());
    }

    #[test]
    fn permission_expires_before_allocation() {
        let policy = LifetimePolicy::default();
        let t0 = Instant::now();
        let mut alloc = Allocation::new(relayed(), "u", t0, Duration::from_secs(3600));
        alloc.create_permission(peer().ip(), t0, &policy).unwrap();
        let t1 = t0 + policy.permission_lifetime;
        assert!(alloc.is_active(t1));
        assert!(!alloc.permits(peer().ip(), t1));
        alloc.create_permission(peer().ip(), t1, &policy).unwrap();
        assert!(alloc.permits(peer().ip(), t1));
    }
}
