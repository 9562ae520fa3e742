//! Per-allocation permission table.

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};

/// Permissions keyed by peer IP. Ports are not part of a permission.
#[derive(Debug, Clone, Default)]
pub struct PermissionTable {
    entries: HashMap<IpAddr, Instant>,
}

impl PermissionTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Install or refresh the permission for `ip`.
    pub fn install(&mut self, ip: IpAddr, now: Instant, ttl: Duration) {
        self.entries.insert(ip, now + ttl);
    }

    /// Whether a live permission exists for `ip`.
    pub fn allows(&self, ip: IpAddr, now: Instant) -> bool {
        self.entries.get(&ip).is_some_and(|expires| *expires > now)
    }

    /// When the permission for `ip` expires, if one is recorded.
    pub fn expires_at(&self, ip: IpAddr) -> Option<Instant> {
        self.entries.get(&ip).copied()
    }

    /// Drop expired entries. Returns how many were removed.
    pub fn sweep(&mut self, now: Instant) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, expires| *expires > now);
        before - self.entries.len()
    }

    /// Peer IPs holding a live permission.
    pub fn live_ips(&self, now: Instant) -> impl Iterator<Item = IpAddr> + '_ {
        self.entries
            .iter()
            .filter(move |(_, expires)| **expires > now)
            .map(|(ip, _)| *ip)
    }

    /// Number of live permissions.
    pub fn live_count(&self, now: Instant) -> usize {
        self.entries.values().filter(|e| **e > now).count()
    }

    /// Number of recorded entries, live or not.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no entries are recorded.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Remove every entry.
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn permission_expires_independently() {
        let mut table = PermissionTable::new();
        let t0 = Instant::now();
        table.install(ip("10.0.0.1"), t0, Duration::from_secs(300));
        table.install(ip("10.0.0.2"), t0 + Duration::from_secs(200), Duration::from_secs(300));

        let t1 = t0 + Duration::from_secs(301);
        assert!(!table.allows(ip("10.0.0.1"), t1));
        assert!(table.allows(ip("10.0.0.2"), t1));
        assert_eq!(table.live_count(t1), 1);
        assert_eq!(table.live_ips(t1).collect::<Vec<_>>(), vec![ip("10.0.0.2")]);
    }

    #[test]
    fn refresh_extends_expiry() {
        let mut table = PermissionTable::new();
        let t0 = Instant::now();
        let peer = ip("fd49:3250::1");
        table.install(peer, t0, Duration::from_secs(300));
        table.install(peer, t0 + Duration::from_secs(250), Duration::from_secs(300));
        assert!(table.allows(peer, t0 + Duration::from_secs(500)));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn expiry_boundary_is_exclusive() {
        let mut table = PermissionTable::new();
        let t0 = Instant::now();
        table.install(ip("10.0.0.1"), t0, Duration::from_secs(300));
        assert!(!table.allows(ip("10.0.0.1"), t0 + Duration::from_secs(300)));
    }

    #[test]
    fn sweep_removes_expired() {
        let mut table = PermissionTable::new();
        let t0 = Instant::now();
        table.install(ip("10.0.0.1"), t0, Duration::from_secs(10));
        table.install(ip("10.0.0.2"), t0, Duration::from_secs(100));
        assert_eq!(table.sweep(t0 + Duration::from_secs(50)), 1);
        assert_eq!(table.len(), 1);
    }
}
