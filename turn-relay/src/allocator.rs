//! Relay allocator: obtains a relay endpoint per allocation.
//!
//! On the overlay each allocation gets its own datagram session, so peers
//! see a distinct destination per client and closing the session drops all
//! of that allocation's peer traffic at once.

use crate::error::{AllocationError, AllocationResult};
use crate::overlay::{DatagramSession, TransportAddr, TransportProvider};
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// What the server asks the allocator for.
#[derive(Debug, Clone)]
pub struct RelayRequest {
    /// Client address as text, used to derive the session name.
    pub client: String,
    /// Port the client asked for, 0 for any.
    pub requested_port: u16,
}

/// A relay endpoint handed back to the server.
#[derive(Clone)]
pub struct RelayEndpoint {
    /// Session that carries the allocation's peer traffic.
    pub session: Arc<dyn DatagramSession>,
    /// Address peers send to.
    pub reachable: TransportAddr,
}

impl std::fmt::Debug for RelayEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayEndpoint")
            .field("reachable", &self.reachable)
            .finish_non_exhaustive()
    }
}

/// Source of relay endpoints.
#[async_trait]
pub trait RelayAllocator: Send + Sync {
    /// Allocate a datagram relay.
    async fn allocate_datagram_relay(&self, request: &RelayRequest)
        -> AllocationResult<RelayEndpoint>;

    /// Allocate a stream relay.
    async fn allocate_stream_relay(&self, request: &RelayRequest)
        -> AllocationResult<RelayEndpoint>;
}

/// Allocator that opens one overlay session per allocation.
pub struct OverlayRelayAllocator {
    provider: Arc<dyn TransportProvider>,
    reachable_hint: String,
    prefix: String,
    sequence: AtomicU64,
}

impl OverlayRelayAllocator {
    /// Create an allocator.
    ///
    /// `reachable_hint` is the server's own overlay address and must not be
    /// empty. `prefix` starts every relay session name.
    pub fn new(
        provider: Arc<dyn TransportProvider>,
        reachable_hint: impl Into<String>,
        prefix: impl Into<String>,
    ) -> AllocationResult<Self> {
        let reachable_hint = reachable_hint.into();
        if reachable_hint.trim().is_empty() {
            return Err(AllocationError::InvalidConfiguration(
                "reachable address hint is empty".into(),
            ));
        }
        let prefix = prefix.into();
        if prefix.is_empty() || prefix.contains(char::is_whitespace) {
            return Err(AllocationError::InvalidConfiguration(format!(
                "relay session prefix {prefix:?} is not a valid session name"
            )));
        }
        Ok(Self {
            provider,
            reachable_hint,
            prefix,
            sequence: AtomicU64::new(0),
        })
    }

    /// The server address this allocator was built with.
    pub fn reachable_hint(&self) -> &str {
        &self.reachable_hint
    }

    /// Unique session name for one allocation.
    fn session_name(&self, client: &str) -> String {
        let seq = self.sequence.fetch_add(1, Ordering::Relaxed);
        let digest = Sha256::digest(client.as_bytes());
        format!("{}-{}-{}", self.prefix, seq, hex::encode(&digest[..4]))
    }
}

impl std::fmt::Debug for OverlayRelayAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OverlayRelayAllocator")
            .field("reachable_hint", &self.reachable_hint)
            .field("prefix", &self.prefix)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl RelayAllocator for OverlayRelayAllocator {
    async fn allocate_datagram_relay(
        &self,
        request: &RelayRequest,
    ) -> AllocationResult<RelayEndpoint> {
        let name = self.session_name(&request.client);
        tracing::debug!(
            session = %name,
            client = %request.client,
            requested_port = request.requested_port,
            "opening relay session"
        );
        // The overlay has no ports; a requested port is ignored.
        let session = self.provider.open_relay_session(&name).await?;
        let reachable = session.local_addr();
        Ok(RelayEndpoint { session, reachable })
    }

    async fn allocate_stream_relay(
        &self,
        _request: &RelayRequest,
    ) -> AllocationResult<RelayEndpoint> {
        Err(AllocationError::Unsupported)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TransportError;
    use crate::overlay::{MockFailure, MockOverlay};

    fn request() -> RelayRequest {
        RelayRequest {
            client: "abc.b32.i2p".into(),
            requested_port: 0,
        }
    }

    #[test]
    fn empty_hint_rejected() {
        let overlay: Arc<dyn TransportProvider> = Arc::new(MockOverlay::new());
        let err = OverlayRelayAllocator::new(overlay, "  ", "rtcchat-turn-udp").unwrap_err();
        assert!(matches!(err, AllocationError::InvalidConfiguration(_)));
    }

    #[test]
    fn session_names_are_unique() {
        let overlay: Arc<dyn TransportProvider> = Arc::new(MockOverlay::new());
        let allocator = OverlayRelayAllocator::new(overlay, "srv.b32.i2p", "rtcchat-turn-udp").unwrap();
        let a = allocator.session_name("client");
        let b = allocator.session_name("client");
        assert_ne!(a, b);
        assert!(a.starts_with("rtcchat-turn-udp-0-"));
        assert!(b.starts_with("rtcchat-turn-udp-1-"));
    }

    #[tokio::test]
    async fn datagram_relay_opens_session() {
        let overlay = MockOverlay::new();
        let provider: Arc<dyn TransportProvider> = Arc::new(overlay.clone());
        let allocator = OverlayRelayAllocator::new(provider, "srv.b32.i2p", "relay").unwrap();

        let endpoint = allocator.allocate_datagram_relay(&request()).await.unwrap();
        assert_eq!(overlay.open_relay_sessions(), 1);
        assert!(endpoint.reachable.as_overlay().is_some());
    }

    #[tokio::test]
    async fn stream_relay_unsupported() {
        let overlay = MockOverlay::new();
        let provider: Arc<dyn TransportProvider> = Arc::new(overlay.clone());
        let allocator = OverlayRelayAllocator::new(provider, "srv.b32.i2p", "relay").unwrap();

        let err = allocator.allocate_stream_relay(&request()).await.unwrap_err();
        assert!(matches!(err, AllocationError::Unsupported));
        assert_eq!(overlay.relay_sessions_opened(), 0);
    }

    #[tokio::test]
    async fn provider_failure_is_underlying() {
        let overlay = MockOverlay::new();
        overlay.fail_next_open(MockFailure::BridgeUnreachable);
        let provider: Arc<dyn TransportProvider> = Arc::new(overlay.clone());
        let allocator = OverlayRelayAllocator::new(provider, "srv.b32.i2p", "relay").unwrap();

        let err = allocator.allocate_datagram_relay(&request()).await.unwrap_err();
        assert!(matches!(
            err,
            AllocationError::Underlying(TransportError::BridgeUnreachable(_))
        ));
    }
}
