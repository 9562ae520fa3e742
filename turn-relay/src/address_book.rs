//! Synthetic IP addresses for overlay destinations.
//!
//! XOR-*-ADDRESS attributes only carry IP addresses, so every overlay
//! address is given a stable IPv6 address in `fd49:3250::/32` derived from
//! its b32 name. The book remembers each mapping so peer addresses in
//! client requests can be turned back into overlay destinations.
//!
//! Entries carry the time they were last learned. The cleanup task calls
//! [`AddressBook::sweep`] to forget addresses nothing has used for a while.

use crate::overlay::{OverlayAddr, TransportAddr};
use crate::server::now;
use dashmap::DashMap;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::net::{IpAddr, Ipv6Addr, SocketAddr};
use std::time::{Duration, Instant};

/// First four bytes of every synthetic address.
pub const SYNTHETIC_PREFIX: [u8; 4] = [0xfd, 0x49, 0x32, 0x50];

/// Whether `ip` lies in the synthetic overlay range.
pub fn is_synthetic(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V6(v6) => v6.octets()[..4] == SYNTHETIC_PREFIX,
        IpAddr::V4(_) => false,
    }
}

/// Synthetic socket address for an overlay address.
pub fn synthetic_addr(addr: &OverlayAddr) -> SocketAddr {
    let digest = Sha256::digest(addr.b32().as_bytes());
    let mut octets = [0u8; 16];
    octets[..4].copy_from_slice(&SYNTHETIC_PREFIX);
    octets[4..].copy_from_slice(&digest[..12]);
    let port = u16::from_be_bytes([digest[12], digest[13]]) | 0x0400;
    SocketAddr::new(IpAddr::V6(Ipv6Addr::from(octets)), port)
}

#[derive(Debug)]
struct Known {
    addr: OverlayAddr,
    last_seen: Instant,
}

/// Two-way map between overlay addresses and their synthetic addresses.
#[derive(Debug, Default)]
pub struct AddressBook {
    by_ip: DashMap<IpAddr, Known>,
}

impl AddressBook {
    /// Create an empty book.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an overlay address and return its synthetic address.
    ///
    /// A full destination replaces a bare b32 entry for the same name.
    pub fn learn(&self, addr: &OverlayAddr) -> SocketAddr {
        self.learn_at(addr, now())
    }

    fn learn_at(&self, addr: &OverlayAddr, seen: Instant) -> SocketAddr {
        let synthetic = synthetic_addr(addr);
        let mut entry = self.by_ip.entry(synthetic.ip()).or_insert_with(|| Known {
            addr: addr.clone(),
            last_seen: seen,
        });
        if entry.addr.destination().is_none() && addr.destination().is_some() {
            entry.addr = addr.clone();
        }
        entry.last_seen = entry.last_seen.max(seen);
        synthetic
    }

    /// IP form of a transport address, recording overlay addresses.
    pub fn to_wire(&self, addr: &TransportAddr) -> SocketAddr {
        match addr {
            TransportAddr::Ip(ip) => *ip,
            TransportAddr::Overlay(overlay) => self.learn(overlay),
        }
    }

    /// Overlay address behind a synthetic address.
    ///
    /// Ports are ignored since the overlay has none.
    pub fn resolve(&self, addr: SocketAddr) -> Option<OverlayAddr> {
        if !is_synthetic(addr.ip()) {
            return None;
        }
        self.by_ip.get(&addr.ip()).map(|entry| entry.addr.clone())
    }

    /// Forget entries not learned within `max_idle`, except those in `keep`.
    /// Returns how many were removed.
    pub fn sweep(&self, now: Instant, max_idle: Duration, keep: &HashSet<IpAddr>) -> usize {
        let before = self.by_ip.len();
        self.by_ip.retain(|ip, known| {
            keep.contains(ip) || now.saturating_duration_since(known.last_seen) < max_idle
        });
        before.saturating_sub(self.by_ip.len())
    }

    /// Number of known overlay addresses.
    pub fn len(&self) -> usize {
        self.by_ip.len()
    }

    /// Whether the book is empty.
    pub fn is_empty(&self) -> bool {
        self.by_ip.is_empty()
    }
}
