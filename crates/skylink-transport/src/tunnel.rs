//! Fallback transport: framed stream behind an encrypted-tunnel handshake.
//!
//! `connect()` dials the relay's tunnel port and announces this client's
//! X25519 tunnel key with a `tunnel_handshake` envelope. Only after the relay
//! answers `ok` is the transport considered connected; from then on session
//! envelopes travel as length-prefixed frames on the same stream.

use crate::datagram::resolve;
use crate::envelope::{Envelope, HandshakeMode, HandshakeRole};
use crate::framing::{read_frame, write_frame};
use crate::link::{Link, LinkSlot};
use crate::transport::{
    StatsCounter, TransportClient, TransportError, TransportKind, TransportResult, TransportStats,
};
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use rand_core::OsRng;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::net::TcpStream;
use x25519_dalek::{PublicKey, StaticSecret};

/// How long the relay has to accept the tunnel handshake
const HANDSHAKE_DEADLINE: Duration = Duration::from_secs(10);

/// Tunnel identity and mode
#[derive(Debug, Clone)]
pub struct TunnelSettings {
    /// Announced public key; a fresh X25519 key is used when absent
    pub public_key: Option<String>,
    /// Announced listen port
    pub listen_port: u16,
    /// Requested mode
    pub mode: HandshakeMode,
}

impl Default for TunnelSettings {
    fn default() -> Self {
        Self {
            public_key: None,
            listen_port: 51820,
            mode: HandshakeMode::Auto,
        }
    }
}

/// Stream transport to the relay's tunnel port
pub struct TunnelTransport {
    relay: String,
    connect_timeout: Duration,
    secret: StaticSecret,
    public_key: String,
    listen_port: u16,
    mode: HandshakeMode,
    relay_key: std::sync::Mutex<Option<[u8; 32]>>,
    link: LinkSlot<TcpStream>,
    stats: StatsCounter,
}

impl TunnelTransport {
    /// Transport targeting `relay` (`host:port`)
    pub fn new(relay: impl Into<String>, connect_timeout: Duration, settings: TunnelSettings) -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public_key = settings
            .public_key
            .unwrap_or_else(|| STANDARD.encode(PublicKey::from(&secret).as_bytes()));
        Self {
            relay: relay.into(),
            connect_timeout,
            secret,
            public_key,
            listen_port: settings.listen_port,
            mode: settings.mode,
            relay_key: std::sync::Mutex::new(None),
            link: LinkSlot::default(),
            stats: StatsCounter::default(),
        }
    }

    /// Public key announced in the handshake
    pub fn public_key(&self) -> &str {
        &self.public_key
    }

    /// X25519 agreement between our tunnel key and the relay's, once the
    /// relay has announced one
    pub fn shared_secret(&self) -> Option<[u8; 32]> {
        let relay = (*self.relay_key.lock().ok()?)?;
        Some(*self.secret.diffie_hellman(&PublicKey::from(relay)).as_bytes())
    }

    async fn round_trip(
        &self,
        stream: &mut TcpStream,
        request: &Envelope,
    ) -> TransportResult<Envelope> {
        let payload = request.to_bytes()?;
        write_frame(stream, &payload).await?;
        self.stats.record_send(payload.len());

        let frame = read_frame(stream).await?;
        self.stats.record_recv(frame.len());
        Envelope::from_bytes(&frame)
    }

    async fn handshake(&self, stream: &mut TcpStream) -> TransportResult<()> {
        let request = Envelope::TunnelHandshake {
            role: HandshakeRole::Client,
            public_key: self.public_key.clone(),
            listen_port: self.listen_port,
            mode: self.mode.resolve(&[]),
            timestamp: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs() as i64)
                .unwrap_or_default(),
        };

        let response = tokio::time::timeout(HANDSHAKE_DEADLINE, self.round_trip(stream, &request))
            .await
            .map_err(|_| TransportError::Timeout {
                operation: "tunnel_handshake",
                deadline: HANDSHAKE_DEADLINE,
            })??;

        match response {
            Envelope::TunnelHandshakeResponse {
                status,
                message,
                server_public_key,
            } => {
                if status.as_deref() != Some("ok") {
                    return Err(TransportError::ConnectionFailed(
                        format!(
                            "tunnel handshake rejected: {}",
                            message.unwrap_or_else(|| "no reason given".into())
                        )
                        .into(),
                    ));
                }
                let relay_key = server_public_key
                    .and_then(|k| STANDARD.decode(k).ok())
                    .and_then(|k| <[u8; 32]>::try_from(k).ok());
                if let Ok(mut slot) = self.relay_key.lock() {
                    *slot = relay_key;
                }
                Ok(())
            }
            other => Err(TransportError::unexpected("tunnel_handshake_response", other)),
        }
    }
}

#[async_trait]
impl TransportClient for TunnelTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Tunnel
    }

    async fn connect(&self) -> TransportResult<()> {
        self.link.ensure_disconnected()?;

        let peer = resolve(&self.relay, self.connect_timeout).await?;
        let mut stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(peer))
            .await
            .map_err(|_| TransportError::Timeout {
                operation: "connect",
                deadline: self.connect_timeout,
            })?
            .map_err(|e| TransportError::ConnectionFailed(format!("dial {peer}: {e}").into()))?;
        stream.set_nodelay(true)?;

        self.handshake(&mut stream).await?;
        self.link.install(Link::new(stream, peer)).await?;
        tracing::debug!(relay = %peer, mode = %self.mode, "tunnel transport established");
        Ok(())
    }

    async fn disconnect(&self) -> TransportResult<()> {
        if let Some(link) = self.link.take().await {
            tracing::debug!(
                relay = %link.peer,
                uptime = ?link.established.elapsed(),
                "tunnel transport closed"
            );
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.link.is_connected()
    }

    async fn exchange(&self, request: Envelope, deadline: Duration) -> TransportResult<Envelope> {
        let link = self.link.current().await?;
        let on_wire = AtomicBool::new(false);
        let result = link
            .bounded(request.message_type(), deadline, async {
                let mut stream = link.io.lock().await;
                on_wire.store(true, Ordering::Relaxed);
                self.round_trip(&mut stream, &request).await
            })
            .await;

        if let Err(e) = &result {
            self.stats.record_error();
            if on_wire.load(Ordering::Relaxed)
                && e.desyncs_stream()
                && self.link.retire(&link).await
            {
                tracing::debug!(relay = %link.peer, error = %e, "tunnel stream out of step, dropped");
            }
        }
        result
    }

    fn stats(&self) -> TransportStats {
        self.stats.snapshot()
    }
}
