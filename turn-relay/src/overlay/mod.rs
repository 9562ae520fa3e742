//! Transport Provider: datagram sessions over the overlay or plain UDP.
//!
//! # Design
//!
//! A [`TransportProvider`] opens named sessions. Each session is a
//! [`DatagramSession`] with its own reachable address:
//! - the control session carries client STUN/TURN traffic
//! - each relay session carries one allocation's peer traffic
//!
//! Implementations:
//! - [`SamProvider`] - I2P datagram sessions through a SAM v3 bridge
//! - [`UdpSession`] - a conventional UDP socket (no provider; clients on it never authenticate)
//! - [`MockOverlay`] - in-memory overlay for tests

mod mock;
mod sam;
mod udp;

pub use mock::{MockFailure, MockOverlay, MockSession};
pub use sam::{SamConfig, SamProvider, SamSession};
pub use udp::UdpSession;

use crate::error::TransportError;
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::net::SocketAddr;
use std::sync::Arc;

/// Suffix of overlay base32 names.
pub const B32_SUFFIX: &str = ".b32.i2p";

/// `.b32.i2p` name for raw destination bytes.
pub fn b32_name(destination: &[u8]) -> String {
    let digest = Sha256::digest(destination);
    let mut name = data_encoding::BASE32_NOPAD.encode(&digest).to_ascii_lowercase();
    name.push_str(B32_SUFFIX);
    name
}

/// An overlay address.
///
/// Identity is the b32 name. The full destination is kept when known, since
/// sending to it avoids a lookup on the router.
#[derive(Clone)]
pub struct OverlayAddr {
    b32: Arc<str>,
    destination: Option<Arc<str>>,
}

impl OverlayAddr {
    /// Address from a b32 name.
    pub fn from_b32(b32: impl Into<Arc<str>>) -> Self {
        Self {
            b32: b32.into(),
            destination: None,
        }
    }

    /// Address from a full destination and its b32 name.
    pub fn with_destination(b32: impl Into<Arc<str>>, destination: impl Into<Arc<str>>) -> Self {
        Self {
            b32: b32.into(),
            destination: Some(destination.into()),
        }
    }

    /// The `.b32.i2p` name.
    pub fn b32(&self) -> &str {
        &self.b32
    }

    /// Full destination if known.
    pub fn destination(&self) -> Option<&str> {
        self.destination.as_deref()
    }

    /// Best form to address datagrams to.
    pub fn send_target(&self) -> &str {
        self.destination.as_deref().unwrap_or(&self.b32)
    }
}

impl PartialEq for OverlayAddr {
    fn eq(&self, other: &Self) -> bool {
        self.b32 == other.b32
    }
}

impl Eq for OverlayAddr {}

impl Hash for OverlayAddr {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.b32.hash(state);
    }
}

impl fmt::Debug for OverlayAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OverlayAddr({})", self.b32)
    }
}

impl fmt::Display for OverlayAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.b32)
    }
}

/// Which kind of network an address belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressKind {
    /// A plain IP transport, where source addresses can be spoofed.
    Conventional,
    /// The anonymizing overlay.
    Overlay,
}

/// A session-level transport address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TransportAddr {
    /// IP socket address.
    Ip(SocketAddr),
    /// Overlay destination.
    Overlay(OverlayAddr),
}

impl TransportAddr {
    /// The network this address lives on.
    pub fn kind(&self) -> AddressKind {
        match self {
            Self::Ip(_) => AddressKind::Conventional,
            Self::Overlay(_) => AddressKind::Overlay,
        }
    }

    /// The overlay address, if this is one.
    pub fn as_overlay(&self) -> Option<&OverlayAddr> {
        match self {
            Self::Overlay(addr) => Some(addr),
            Self::Ip(_) => None,
        }
    }
}

impl fmt::Display for TransportAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ip(addr) => write!(f, "{addr}"),
            Self::Overlay(addr) => write!(f, "{addr}"),
        }
    }
}

impl From<SocketAddr> for TransportAddr {
    fn from(addr: SocketAddr) -> Self {
        Self::Ip(addr)
    }
}

impl From<OverlayAddr> for TransportAddr {
    fn from(addr: OverlayAddr) -> Self {
        Self::Overlay(addr)
    }
}

/// A bidirectional datagram session.
#[async_trait]
pub trait DatagramSession: Send + Sync {
    /// This session's own reachable address.
    fn local_addr(&self) -> TransportAddr;

    /// Send one datagram.
    async fn send_to(&self, data: &[u8], to: &TransportAddr) -> Result<(), TransportError>;

    /// Receive one datagram.
    ///
    /// Blocks until data arrives. Returns [`TransportError::Closed`] once the
    /// session is closed.
    async fn recv_from(&self) -> Result<(Vec<u8>, TransportAddr), TransportError>;

    /// Close the session. Idempotent.
    async fn close(&self);
}

/// Opens overlay sessions.
#[async_trait]
pub trait TransportProvider: Send + Sync {
    /// Open the server's control session.
    async fn open_control_session(
        &self,
        name: &str,
    ) -> Result<Arc<dyn DatagramSession>, TransportError>;

    /// Open a session used only for relaying one allocation's data.
    async fn open_relay_session(
        &self,
        name: &str,
    ) -> Result<Arc<dyn DatagramSession>, TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn b32_name_shape() {
        let name = b32_name(b"some destination bytes");
        assert!(name.ends_with(B32_SUFFIX));
        // 32 bytes of SHA-256 in unpadded base32 is 52 characters.
        assert_eq!(name.len(), 52 + B32_SUFFIX.len());
        assert_eq!(name, name.to_ascii_lowercase());
    }

    #[test]
    fn overlay_identity_is_b32() {
        let a = OverlayAddr::from_b32("abc.b32.i2p");
        let b = OverlayAddr::with_destination("abc.b32.i2p", "FULLDEST");
        assert_eq!(a, b);
        let mut set = HashSet::new();
        set.insert(TransportAddr::Overlay(a));
        assert!(set.contains(&TransportAddr::Overlay(b.clone())));
        assert_eq!(b.send_target(), "FULLDEST");
    }

    #[test]
    fn address_kinds() {
        let ip: TransportAddr = "127.0.0.1:3478".parse::<SocketAddr>().unwrap().into();
        assert_eq!(ip.kind(), AddressKind::Conventional);
        let overlay: TransportAddr = OverlayAddr::from_b32("x.b32.i2p").into();
        assert_eq!(overlay.kind(), AddressKind::Overlay);
        assert!(overlay.as_overlay().is_some());
    }
}
