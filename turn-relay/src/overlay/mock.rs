//! In-memory overlay for testing.
//!
//! Sessions opened through one [`MockOverlay`] can reach each other by
//! address. Failures can be injected into the next open.

use super::{b32_name, DatagramSession, OverlayAddr, TransportAddr, TransportProvider};
use crate::error::TransportError;
use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

type Datagram = (Vec<u8>, TransportAddr);

/// Failure to inject into the next session open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MockFailure {
    /// Fail with [`TransportError::BridgeUnreachable`].
    BridgeUnreachable,
    /// Fail with [`TransportError::NameConflict`].
    NameConflict,
    /// Fail with [`TransportError::OverlayRejected`].
    OverlayRejected,
}

impl MockFailure {
    fn into_error(self, name: &str) -> TransportError {
        match self {
            Self::BridgeUnreachable => TransportError::BridgeUnreachable("mock bridge".into()),
            Self::NameConflict => TransportError::NameConflict(name.to_string()),
            Self::OverlayRejected => TransportError::OverlayRejected("I2P_ERROR".into()),
        }
    }
}

/// In-memory overlay network.
#[derive(Debug, Clone, Default)]
pub struct MockOverlay {
    inner: Arc<MockOverlayInner>,
}

#[derive(Debug, Default)]
struct MockOverlayInner {
    routes: DashMap<Arc<str>, mpsc::UnboundedSender<Datagram>>,
    names: DashMap<String, ()>,
    relay_open: AtomicUsize,
    relay_opened: AtomicUsize,
    fail_next_open: Mutex<Option<MockFailure>>,
    unreachable: AtomicBool,
}

impl MockOverlay {
    /// Create an empty overlay.
    pub fn new() -> Self {
        Self::default()
    }

    /// Overlay address a session named `name` gets.
    pub fn address_for(name: &str) -> OverlayAddr {
        OverlayAddr::from_b32(b32_name(format!("mock:{name}").as_bytes()))
    }

    /// Open a session that is neither control nor relay, such as a test peer.
    pub fn endpoint(&self, name: &str) -> Result<Arc<MockSession>, TransportError> {
        self.register(name, false)
    }

    /// Cause the next control or relay open to fail.
    pub fn fail_next_open(&self, failure: MockFailure) {
        let mut slot = self
            .inner
            .fail_next_open
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        *slot = Some(failure);
    }

    /// Make every control or relay open fail as if the bridge were down.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.inner.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// Relay sessions currently open.
    pub fn open_relay_sessions(&self) -> usize {
        self.inner.relay_open.load(Ordering::SeqCst)
    }

    /// Relay sessions opened since creation.
    pub fn relay_sessions_opened(&self) -> usize {
        self.inner.relay_opened.load(Ordering::SeqCst)
    }

    /// Whether a session with this name is open.
    pub fn is_open(&self, name: &str) -> bool {
        self.inner.names.contains_key(name)
    }

    fn take_failure(&self, name: &str) -> Result<(), TransportError> {
        if self.inner.unreachable.load(Ordering::SeqCst) {
            return Err(MockFailure::BridgeUnreachable.into_error(name));
        }
        let failure = self
            .inner
            .fail_next_open
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        match failure {
            Some(failure) => Err(failure.into_error(name)),
            None => Ok(()),
        }
    }

    fn register(&self, name: &str, relay: bool) -> Result<Arc<MockSession>, TransportError> {
        match self.inner.names.entry(name.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(TransportError::NameConflict(name.to_string()))
            }
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(());
            }
        }
        let addr = Self::address_for(name);
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.routes.insert(Arc::from(addr.b32()), tx);
        if relay {
            self.inner.relay_open.fetch_add(1, Ordering::SeqCst);
            self.inner.relay_opened.fetch_add(1, Ordering::SeqCst);
        }
        Ok(Arc::new(MockSession {
            name: name.to_string(),
            addr,
            relay,
            rx: tokio::sync::Mutex::new(rx),
            overlay: Arc::clone(&self.inner),
            cancel: CancellationToken::new(),
            closed: AtomicBool::new(false),
        }))
    }
}

#[async_trait]
impl TransportProvider for MockOverlay {
    async fn open_control_session(
        &self,
        name: &str,
    ) -> Result<Arc<dyn DatagramSession>, TransportError> {
        self.take_failure(name)?;
        let session: Arc<dyn DatagramSession> = self.register(name, false)?;
        Ok(session)
    }

    async fn open_relay_session(
        &self,
        name: &str,
    ) -> Result<Arc<dyn DatagramSession>, TransportError> {
        self.take_failure(name)?;
        let session: Arc<dyn DatagramSession> = self.register(name, true)?;
        Ok(session)
    }
}

/// A session on a [`MockOverlay`].
#[derive(Debug)]
pub struct MockSession {
    name: String,
    addr: OverlayAddr,
    relay: bool,
    rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Datagram>>,
    overlay: Arc<MockOverlayInner>,
    cancel: CancellationToken,
    closed: AtomicBool,
}

impl MockSession {
    /// Name the session was opened with.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// This session's overlay address.
    pub fn overlay_addr(&self) -> &OverlayAddr {
        &self.addr
    }
}

#[async_trait]
impl DatagramSession for MockSession {
    fn local_addr(&self) -> TransportAddr {
        TransportAddr::Overlay(self.addr.clone())
    }

    async fn send_to(&self, data: &[u8], to: &TransportAddr) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        let TransportAddr::Overlay(dest) = to else {
            return Err(TransportError::Unroutable(to.to_string()));
        };
        // Unknown destinations drop silently, like the real overlay.
        if let Some(route) = self.overlay.routes.get(dest.b32()) {
            let _ = route.send((data.to_vec(), self.local_addr()));
        }
        Ok(())
    }

    async fn recv_from(&self) -> Result<(Vec<u8>, TransportAddr), TransportError> {
        let mut rx = self.rx.lock().await;
        tokio::select! {
            _ = self.cancel.cancelled() => Err(TransportError::Closed),
            datagram = rx.recv() => datagram.ok_or(TransportError::Closed),
        }
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.cancel.cancel();
        self.overlay.routes.remove(self.addr.b32());
        self.overlay.names.remove(&self.name);
        if self.relay {
            self.overlay.relay_open.fetch_sub(1, Ordering::SeqCst);
        }
    }
}
