//! SAM v3 bridge client for I2P datagram sessions.
//!
//! Each session holds one TCP control connection to the bridge for its whole
//! lifetime; closing that connection destroys the session on the router.
//! Datagrams travel over UDP: outbound to the bridge's datagram port with a
//! `3.0 <id> <destination>` header line, inbound forwarded by the bridge to
//! our local socket with a `<destination> [FROM_PORT=..] [TO_PORT=..]` line.

use super::{b32_name, DatagramSession, OverlayAddr, TransportAddr, TransportProvider};
use crate::config::OverlayConfig;
use crate::error::TransportError;
use async_trait::async_trait;
use base64::alphabet::Alphabet;
use base64::engine::general_purpose::{GeneralPurpose, PAD};
use base64::Engine;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, UdpSocket};
use tokio_util::sync::CancellationToken;

const I2P_ALPHABET: Alphabet =
    match Alphabet::new("ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789-~") {
        Ok(alphabet) => alphabet,
        Err(_) => panic!("invalid I2P base64 alphabet"),
    };

/// Base64 with I2P's `-` and `~` substitutions.
pub(crate) const I2P_BASE64: GeneralPurpose = GeneralPurpose::new(&I2P_ALPHABET, PAD);

const MAX_DATAGRAM: usize = 64 * 1024;

/// Where the bridge lives and how sessions are created.
#[derive(Debug, Clone)]
pub struct SamConfig {
    /// Bridge TCP control address.
    pub tcp_address: String,
    /// Bridge UDP datagram address.
    pub udp_address: String,
    /// Tunnel options appended to SESSION CREATE.
    pub options: Vec<String>,
    /// Timeout for connecting and for each command round trip.
    pub step_timeout: Duration,
}

impl From<&OverlayConfig> for SamConfig {
    fn from(config: &OverlayConfig) -> Self {
        Self {
            tcp_address: config.sam_address.clone(),
            udp_address: config.sam_udp_address.clone(),
            options: config.tunnel_options.clone(),
            step_timeout: Duration::from_secs(config.open_timeout_secs),
        }
    }
}

/// Opens I2P datagram sessions through a SAM bridge.
#[derive(Debug, Clone)]
pub struct SamProvider {
    config: SamConfig,
}

impl SamProvider {
    /// Create a provider. Nothing is contacted until a session is opened.
    pub fn new(config: SamConfig) -> Self {
        Self { config }
    }

    /// Open a named datagram session.
    pub async fn open(&self, name: &str) -> Result<Arc<SamSession>, TransportError> {
        let step = self.config.step_timeout;
        let tcp_addr = &self.config.tcp_address;

        let stream = match tokio::time::timeout(step, TcpStream::connect(tcp_addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                return Err(TransportError::BridgeUnreachable(format!("{tcp_addr}: {e}")))
            }
            Err(_) => {
                return Err(TransportError::BridgeUnreachable(format!(
                    "{tcp_addr}: connect timed out"
                )))
            }
        };
        let bridge_udp = resolve(&self.config.udp_address).await?;
        let local_ip = stream
            .local_addr()
            .map(|a| a.ip())
            .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST));
        let socket = UdpSocket::bind(SocketAddr::new(local_ip, 0)).await?;
        let local_port = socket.local_addr()?.port();

        let (read, mut write) = stream.into_split();
        let mut lines = BufReader::new(read).lines();

        let hello = command(&mut write, &mut lines, "HELLO VERSION MIN=3.0 MAX=3.3", step).await?;
        hello.ensure("HELLO", "REPLY")?;
        if hello.result() != Some("OK") {
            return Err(TransportError::OverlayRejected(hello.describe()));
        }

        let mut create = format!(
            "SESSION CREATE STYLE=DATAGRAM ID={name} DESTINATION=TRANSIENT PORT={local_port} HOST={local_ip}"
        );
        for option in &self.config.options {
            create.push(' ');
            create.push_str(option);
        }
        let status = command(&mut write, &mut lines, &create, step).await?;
        status.ensure("SESSION", "STATUS")?;
        match status.result() {
            Some("OK") => {}
            Some("DUPLICATED_ID") | Some("DUPLICATED_DEST") => {
                return Err(TransportError::NameConflict(format!(
                    "{name}: {}",
                    status.describe()
                )))
            }
            _ => return Err(TransportError::OverlayRejected(status.describe())),
        }

        let lookup = command(&mut write, &mut lines, "NAMING LOOKUP NAME=ME", step).await?;
        lookup.ensure("NAMING", "REPLY")?;
        let destination = match (lookup.result(), lookup.fields.get("VALUE")) {
            (Some("OK"), Some(value)) => value.clone(),
            _ => return Err(TransportError::OverlayRejected(lookup.describe())),
        };
        let raw = I2P_BASE64.decode(destination.as_bytes()).map_err(|e| {
            TransportError::OverlayRejected(format!("malformed destination from bridge: {e}"))
        })?;
        let local = OverlayAddr::with_destination(b32_name(&raw), destination);

        tracing::info!(session = name, address = %local, "SAM session created");

        let closed = CancellationToken::new();
        tokio::spawn(keepalive(lines, write, closed.clone(), name.to_string()));

        Ok(Arc::new(SamSession {
            id: name.to_string(),
            local,
            socket,
            bridge: bridge_udp,
            closed,
        }))
    }
}

#[async_trait]
impl TransportProvider for SamProvider {
    async fn open_control_session(
        &self,
        name: &str,
    ) -> Result<Arc<dyn DatagramSession>, TransportError> {
        let session: Arc<dyn DatagramSession> = self.open(name).await?;
        Ok(session)
    }

    async fn open_relay_session(
        &self,
        name: &str,
    ) -> Result<Arc<dyn DatagramSession>, TransportError> {
        let session: Arc<dyn DatagramSession> = self.open(name).await?;
        Ok(session)
    }
}

/// An open SAM datagram session.
pub struct SamSession {
    id: String,
    local: OverlayAddr,
    socket: UdpSocket,
    bridge: SocketAddr,
    closed: CancellationToken,
}

impl SamSession {
    /// Session ID as registered with the bridge.
    pub fn id(&self) -> &str {
        &self.id
    }
}

impl std::fmt::Debug for SamSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SamSession")
            .field("id", &self.id)
            .field("local", &self.local)
            .field("bridge", &self.bridge)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl DatagramSession for SamSession {
    fn local_addr(&self) -> TransportAddr {
        TransportAddr::Overlay(self.local.clone())
    }

    async fn send_to(&self, data: &[u8], to: &TransportAddr) -> Result<(), TransportError> {
        if self.closed.is_cancelled() {
            return Err(TransportError::Closed);
        }
        let TransportAddr::Overlay(dest) = to else {
            return Err(TransportError::Unroutable(to.to_string()));
        };
        let header = format!("3.0 {} {}\n", self.id, dest.send_target());
        let mut packet = Vec::with_capacity(header.len() + data.len());
        packet.extend_from_slice(header.as_bytes());
        packet.extend_from_slice(data);
        self.socket.send_to(&packet, self.bridge).await?;
        Ok(())
    }

    async fn recv_from(&self) -> Result<(Vec<u8>, TransportAddr), TransportError> {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            let (n, src) = tokio::select! {
                _ = self.closed.cancelled() => return Err(TransportError::Closed),
                r = self.socket.recv_from(&mut buf) => r?,
            };
            if src.ip() != self.bridge.ip() {
                tracing::debug!(session = %self.id, %src, "ignoring datagram not from bridge");
                continue;
            }
            match parse_forwarded(&buf[..n]) {
                Some((destination, payload)) => {
                    let raw = match I2P_BASE64.decode(destination.as_bytes()) {
                        Ok(raw) => raw,
                        Err(_) => {
                            tracing::debug!(session = %self.id, "bad source destination");
                            continue;
                        }
                    };
                    let from = OverlayAddr::with_destination(b32_name(&raw), destination);
                    return Ok((payload.to_vec(), TransportAddr::Overlay(from)));
                }
                None => {
                    tracing::debug!(session = %self.id, len = n, "malformed forwarded datagram");
                }
            }
        }
    }

    async fn close(&self) {
        if !self.closed.is_cancelled() {
            tracing::debug!(session = %self.id, "closing SAM session");
        }
        self.closed.cancel();
    }
}

/// Hold the control socket open and answer bridge PINGs.
async fn keepalive(
    mut lines: Lines<BufReader<OwnedReadHalf>>,
    mut write: OwnedWriteHalf,
    closed: CancellationToken,
    id: String,
) {
    loop {
        tokio::select! {
            _ = closed.cancelled() => break,
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    if let Some(rest) = line.strip_prefix("PING") {
                        let pong = format!("PONG{rest}\n");
                        if write.write_all(pong.as_bytes()).await.is_err() {
                            break;
                        }
                    } else {
                        tracing::debug!(session = %id, line = %line, "unexpected SAM control line");
                    }
                }
                Ok(None) | Err(_) => {
                    tracing::warn!(target: "garlic_turn::session", session = %id, "SAM control socket closed by bridge");
                    break;
                }
            }
        }
    }
    closed.cancel();
    let _ = write.shutdown().await;
}

async fn resolve(addr: &str) -> Result<SocketAddr, TransportError> {
    let mut addrs = tokio::net::lookup_host(addr)
        .await
        .map_err(|e| TransportError::BridgeUnreachable(format!("{addr}: {e}")))?;
    addrs
        .next()
        .ok_or_else(|| TransportError::BridgeUnreachable(format!("{addr}: no address")))
}

/// Send one command line and read one reply line.
async fn command(
    write: &mut OwnedWriteHalf,
    lines: &mut Lines<BufReader<OwnedReadHalf>>,
    line: &str,
    step: Duration,
) -> Result<SamReply, TransportError> {
    let round_trip = async {
        write.write_all(line.as_bytes()).await?;
        write.write_all(b"\n").await?;
        lines.next_line().await
    };
    let verb = line.split_whitespace().take(2).collect::<Vec<_>>().join(" ");
    match tokio::time::timeout(step, round_trip).await {
        Ok(Ok(Some(reply))) => parse_reply(&reply).ok_or_else(|| {
            TransportError::OverlayRejected(format!("unparseable reply to {verb}: {reply}"))
        }),
        Ok(Ok(None)) => Err(TransportError::BridgeUnreachable(format!(
            "bridge closed the connection during {verb}"
        ))),
        Ok(Err(e)) => Err(TransportError::BridgeUnreachable(format!("{verb}: {e}"))),
        Err(_) => Err(TransportError::BridgeUnreachable(format!("{verb} timed out"))),
    }
}

/// A parsed SAM reply line: `TOPIC KIND KEY=VALUE ...`.
#[derive(Debug, Clone, PartialEq, Eq)]
struct SamReply {
    topic: String,
    kind: String,
    fields: HashMap<String, String>,
}

impl SamReply {
    fn result(&self) -> Option<&str> {
        self.fields.get("RESULT").map(String::as_str)
    }

    fn ensure(&self, topic: &str, kind: &str) -> Result<(), TransportError> {
        if self.topic == topic && self.kind == kind {
            Ok(())
        } else {
            Err(TransportError::OverlayRejected(format!(
                "expected {topic} {kind}, got {} {}",
                self.topic, self.kind
            )))
        }
    }

    fn describe(&self) -> String {
        let result = self.result().unwrap_or("NO_RESULT");
        match self.fields.get("MESSAGE") {
            Some(message) => format!("{result}: {message}"),
            None => result.to_string(),
        }
    }
}

fn parse_reply(line: &str) -> Option<SamReply> {
    let mut tokens = tokenize(line).into_iter();
    let topic = tokens.next()?;
    let kind = tokens.next()?;
    let fields = tokens
        .filter_map(|token| {
            let (key, value) = token.split_once('=')?;
            Some((key.to_string(), value.to_string()))
        })
        .collect();
    Some(SamReply {
        topic,
        kind,
        fields,
    })
}

/// Split on spaces, keeping double-quoted runs together and dropping the quotes.
fn tokenize(line: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    for c in line.trim_end_matches(['\r', '\n']).chars() {
        match c {
            '"' => quoted = !quoted,
            ' ' if !quoted => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
            }
            _ => current.push(c),
        }
    }
    if !current.is_empty() {
        tokens.push(current);
    }
    tokens
}

/// Split a forwarded datagram into source destination and payload.
fn parse_forwarded(datagram: &[u8]) -> Option<(String, &[u8])> {
    let newline = datagram.iter().position(|b| *b == b'\n')?;
    let header = std::str::from_utf8(&datagram[..newline]).ok()?;
    let destination = header.split_whitespace().next()?;
    Some((destination.to_string(), &datagram[newline + 1..]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[test]
    fn parse_session_status() {
        let reply = parse_reply("SESSION STATUS RESULT=DUPLICATED_ID").unwrap();
        assert_eq!(reply.topic, "SESSION");
        assert_eq!(reply.kind, "STATUS");
        assert_eq!(reply.result(), Some("DUPLICATED_ID"));
    }

    #[test]
    fn parse_quoted_message() {
        let reply =
            parse_reply("SESSION STATUS RESULT=I2P_ERROR MESSAGE=\"tunnel build failed\"\n").unwrap();
        assert_eq!(reply.describe(), "I2P_ERROR: tunnel build failed");
    }

    #[test]
    fn parse_forwarded_with_ports() {
        let datagram = b"AAAA~-bb FROM_PORT=0 TO_PORT=0\nhello";
        let (dest, payload) = parse_forwarded(datagram).unwrap();
        assert_eq!(dest, "AAAA~-bb");
        assert_eq!(payload, b"hello");
        assert!(parse_forwarded(b"no newline").is_none());
    }

    #[test]
    fn i2p_base64_uses_substituted_alphabet() {
        let encoded = I2P_BASE64.encode([0xfb, 0xff, 0xbf]);
        assert_eq!(encoded, "-~-~");
        assert_eq!(I2P_BASE64.decode("-~-~").unwrap(), vec![0xfb, 0xff, 0xbf]);
        assert!(I2P_BASE64.decode("+/+/").is_err());
    }

    fn config_for(tcp: SocketAddr, udp: SocketAddr) -> SamConfig {
        SamConfig {
            tcp_address: tcp.to_string(),
            udp_address: udp.to_string(),
            options: vec!["inbound.length=1".into()],
            step_timeout: Duration::from_secs(5),
        }
    }

    /// Minimal bridge that answers one session's handshake.
    async fn fake_bridge(create_result: &'static str) -> (SocketAddr, tokio::task::JoinHandle<Vec<String>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (read, mut write) = stream.into_split();
            let mut lines = BufReader::new(read).lines();
            let mut seen = Vec::new();
            while let Ok(Some(line)) = lines.next_line().await {
                seen.push(line.clone());
                let reply = if line.starts_with("HELLO") {
                    "HELLO REPLY RESULT=OK VERSION=3.1".to_string()
                } else if line.starts_with("SESSION CREATE") {
                    format!("SESSION STATUS RESULT={create_result}")
                } else if line.starts_with("NAMING LOOKUP") {
                    format!("NAMING REPLY RESULT=OK NAME=ME VALUE={}", I2P_BASE64.encode([7u8; 387]))
                } else {
                    continue;
                };
                write.write_all(reply.as_bytes()).await.unwrap();
                write.write_all(b"\n").await.unwrap();
                if create_result != "OK" && line.starts_with("SESSION CREATE") {
                    break;
                }
            }
            seen
        });
        (addr, handle)
    }

    #[tokio::test]
    async fn unreachable_bridge() {
        // Bind then drop to get a port with nothing listening.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let provider = SamProvider::new(config_for(addr, addr));
        let err = provider.open("x").await.unwrap_err();
        assert!(matches!(err, TransportError::BridgeUnreachable(_)));
    }

    #[tokio::test]
    async fn session_handshake() {
        let (addr, bridge) = fake_bridge("OK").await;
        let provider = SamProvider::new(config_for(addr, "127.0.0.1:7655".parse().unwrap()));
        let session = provider.open("rtcchat-turn").await.unwrap();

        let TransportAddr::Overlay(local) = session.local_addr() else {
            panic!("expected overlay address");
        };
        assert_eq!(local.b32(), b32_name(&[7u8; 387]));
        session.close().await;

        let seen = bridge.await.unwrap();
        assert_eq!(seen[0], "HELLO VERSION MIN=3.0 MAX=3.3");
        assert!(seen[1].starts_with("SESSION CREATE STYLE=DATAGRAM ID=rtcchat-turn DESTINATION=TRANSIENT PORT="));
        assert!(seen[1].contains("HOST=127.0.0.1"));
        assert!(seen[1].ends_with("inbound.length=1"));
        assert_eq!(seen[2], "NAMING LOOKUP NAME=ME");
    }

    #[tokio::test]
    async fn duplicated_id_is_name_conflict() {
        let (addr, _bridge) = fake_bridge("DUPLICATED_ID").await;
        let provider = SamProvider::new(config_for(addr, "127.0.0.1:7655".parse().unwrap()));
        let err = provider.open("taken").await.unwrap_err();
        assert!(matches!(err, TransportError::NameConflict(_)));
    }

    #[tokio::test]
    async fn other_failure_is_overlay_rejected() {
        let (addr, _bridge) = fake_bridge("I2P_ERROR").await;
        let provider = SamProvider::new(config_for(addr, "127.0.0.1:7655".parse().unwrap()));
        let err = provider.open("x").await.unwrap_err();
        assert!(matches!(err, TransportError::OverlayRejected(_)));
    }
}
