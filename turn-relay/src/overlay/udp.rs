//! Conventional UDP listener session.

use super::{DatagramSession, TransportAddr};
use crate::error::TransportError;
use async_trait::async_trait;
use std::net::SocketAddr;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;

const MAX_DATAGRAM: usize = 64 * 1024;

/// A plain UDP socket presented as a [`DatagramSession`].
#[derive(Debug)]
pub struct UdpSession {
    socket: UdpSocket,
    local: SocketAddr,
    closed: CancellationToken,
}

impl UdpSession {
    /// Bind a socket at `addr`.
    pub async fn bind(addr: SocketAddr) -> Result<Self, TransportError> {
        let socket = UdpSocket::bind(addr).await?;
        let local = socket.local_addr()?;
        Ok(Self {
            socket,
            local,
            closed: CancellationToken::new(),
        })
    }
}

#[async_trait]
impl DatagramSession for UdpSession {
    fn local_addr(&self) -> TransportAddr {
        TransportAddr::Ip(self.local)
    }

    async fn send_to(&self, data: &[u8], to: &TransportAddr) -> Result<(), TransportError> {
        if self.closed.is_cancelled() {
            return Err(TransportError::Closed);
        }
        match to {
            TransportAddr::Ip(addr) => {
                self.socket.send_to(data, addr).await?;
                Ok(())
            }
            TransportAddr::Overlay(addr) => Err(TransportError::Unroutable(addr.to_string())),
        }
    }

    async fn recv_from(&self) -> Result<(Vec<u8>, TransportAddr), TransportError> {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        tokio::select! {
            _ = self.closed.cancelled() => Err(TransportError::Closed),
            r = self.socket.recv_from(&mut buf) => {
                let (n, src) = r?;
                buf.truncate(n);
                Ok((buf, TransportAddr::Ip(src)))
            }
        }
    }

    async fn close(&self) {
        self.closed.cancel();
    }
}
