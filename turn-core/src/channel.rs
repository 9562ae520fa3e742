//! Channel binding table.
//!
//! A channel maps to exactly one peer and a peer to exactly one channel.
//! Expired entries are ignored by lookups and do not block new bindings.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use thiserror::Error;
use turn_types::is_valid_channel;

/// Why a ChannelBind could not be applied.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChannelBindError {
    /// Channel number outside 0x4000..=0x4FFF
    #[error("channel number {0:#06x} outside the allowed range")]
    InvalidChannel(u16),

    /// Channel is bound to another peer
    #[error("channel {channel:#06x} already bound to {peer}")]
    ChannelInUse {
        /// Requested channel.
        channel: u16,
        /// Peer currently holding it.
        peer: SocketAddr,
    },

    /// Peer is bound to another channel
    #[error("peer {peer} already bound to channel {channel:#06x}")]
    PeerBound {
        /// Requested peer.
        peer: SocketAddr,
        /// Channel it currently holds.
        channel: u16,
    },

    /// The owning allocation has expired or been released
    #[error("allocation is no longer active")]
    AllocationInactive,
}

#[derive(Debug, Clone, Copy)]
struct Binding {
    peer: SocketAddr,
    expires: Instant,
}

/// Bidirectional channel <-> peer map.
#[derive(Debug, Clone, Default)]
pub struct ChannelTable {
    by_channel: HashMap<u16, Binding>,
    by_peer: HashMap<SocketAddr, u16>,
}

impl ChannelTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `channel` to `peer`, or refresh an identical binding.
    pub fn bind(
        &mut self,
        channel: u16,
        peer: SocketAddr,
        now: Instant,
        ttl: Duration,
    ) -> Result<(), ChannelBindError> {
        if !is_valid_channel(channel) {
            return Err(ChannelBindError::InvalidChannel(channel));
        }
        if let Some(existing) = self.by_channel.get(&channel) {
            if existing.expires > now && existing.peer != peer {
                return Err(ChannelBindError::ChannelInUse {
                    channel,
                    peer: existing.peer,
                });
            }
        }
        if let Some(&bound) = self.by_peer.get(&peer) {
            let live = self
                .by_channel
                .get(&bound)
                .is_some_and(|b| b.expires > now && b.peer == peer);
            if live && bound != channel {
                return Err(ChannelBindError::PeerBound {
                    peer,
                    channel: bound,
                });
            }
        }

        // Drop stale entries in either direction before installing.
        if let Some(old) = self.by_channel.remove(&channel) {
            if self.by_peer.get(&old.peer) == Some(&channel) {
                self.by_peer.remove(&old.peer);
            }
        }
        if let Some(old_channel) = self.by_peer.remove(&peer) {
            if self.by_channel.get(&old_channel).is_some_and(|b| b.peer == peer) {
                self.by_channel.remove(&old_channel);
            }
        }

        self.by_channel.insert(
            channel,
            Binding {
                peer,
                expires: now + ttl,
            },
        );
        self.by_peer.insert(peer, channel);
        Ok(())
    }

    /// Peer bound to `channel`, if the binding is live.
    pub fn peer(&self, channel: u16, now: Instant) -> Option<SocketAddr> {
        self.by_channel
            .get(&channel)
            .filter(|b| b.expires > now)
            .map(|b| b.peer)
    }

    /// Channel bound to `peer`, if the binding is live.
    pub fn channel(&self, peer: SocketAddr, now: Instant) -> Option<u16> {
        let channel = *self.by_peer.get(&peer)?;
        self.peer(channel, now)
            .filter(|p| *p == peer)
            .map(|_| channel)
    }

    /// Drop expired bindings from both directions. Returns how many were removed.
    pub fn sweep(&mut self, now: Instant) -> usize {
        let expired: Vec<(u16, SocketAddr)> = self
            .by_channel
            .iter()
            .filter(|(_, b)| b.expires <= now)
            .map(|(c, b)| (*c, b.peer))
            .collect();
        for (channel, peer) in &expired {
            self.by_channel.remove(channel);
            if self.by_peer.get(peer) == Some(channel) {
                self.by_peer.remove(peer);
            }
        }
        expired.len()
    }

    /// Peers with a live binding.
    pub fn live_peers(&self, now: Instant) -> impl Iterator<Item = SocketAddr> + '_ {
        self.by_channel
            .values()
            .filter(move |b| b.expires > now)
            .map(|b| b.peer)
    }

    /// Number of live bindings.
    pub fn live_count(&self, now: Instant) -> usize {
        self.by_channel.values().filter(|b| b.expires > now).count()
    }

    /// Number of recorded bindings, live or not.
    pub fn len(&self) -> usize {
        self.by_channel.len()
    }

    /// Whether no bindings are recorded.
    pub fn is_empty(&self) -> bool {
        self.by_channel.is_empty()
    }

    /// Remove every binding.
    pub fn clear(&mut self) {
        self.by_channel.clear();
        self.by_peer.clear();
    }
}


#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;
    use std::net::{IpAddr, Ipv4Addr};

    /// Bindings stay one-to-one in both directions whatever the bind sequence.
    #[test]
    fn prop_bindings_stay_bijective() {
        proptest!(|(
            ops in prop::collection::vec((0x4000u16..0x4008u16, 0u8..8u8, 0u64..1200u64), 1..200),
        )| {
            let mut table = ChannelTable::new();
            let t0 = Instant::now();
            let ttl = Duration::from_secs(600);
            let mut latest = t0;

            for (channel, host, offset) in ops {
                let now = t0 + Duration::from_secs(offset);
                latest = latest.max(now);
                let peer = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, host)), 5000);
                let _ = table.bind(channel, peer, now, ttl);
            }

            for channel in 0x4000u16..0x4008u16 {
                if let Some(peer) = table.peer(channel, latest) {
                    prop_assert_eq!(table.channel(peer, latest), Some(channel));
                }
            }
        });
    }

    /// A rejected bind never disturbs the binding that caused the conflict.
    #[test]
    fn prop_conflict_preserves_original() {
        proptest!(|(channel in 0x4000u16..=0x4FFFu16, a in 1u8..=254u8, b in 1u8..=254u8)| {
            prop_assume!(a != b);
            let mut table = ChannelTable::new();
            let now = Instant::now();
            let ttl = Duration::from_secs(600);
            let p = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, a)), 5000);
            let q = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(10, 0, 0, b)), 5000);

            table.bind(channel, p, now, ttl).unwrap();
            prop_assert!(table.bind(channel, q, now, ttl).is_err());
            prop_assert_eq!(table.peer(channel, now), Some(p));
            prop_assert_eq!(table.channel(q, now), None);
        });
    }
}
