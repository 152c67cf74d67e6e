//! Transport client abstraction for the relay session protocol.
//!
//! Every relay transport (datagram, tunnel, RPC) implements
//! [`TransportClient`]. Variants only provide connection management and a
//! single request/response primitive, [`TransportClient::exchange`]; the
//! session operations (`hello`, `authenticate`, `create_tunnel`,
//! `send_heartbeat`) are built on top of it with their own deadlines, so all
//! variants behave identically at the protocol level.

use crate::envelope::{Envelope, HeartbeatMetrics};
use async_trait::async_trait;
use std::borrow::Cow;
use std::fmt;
use std::io;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Bounded wait for `hello`
pub const HELLO_DEADLINE: Duration = Duration::from_secs(10);
/// Bounded wait for `authenticate`
pub const AUTH_DEADLINE: Duration = Duration::from_secs(10);
/// Bounded wait for `create_tunnel`
pub const TUNNEL_DEADLINE: Duration = Duration::from_secs(15);
/// Bounded wait for `send_heartbeat`
pub const HEARTBEAT_DEADLINE: Duration = Duration::from_secs(5);

/// Transport layer errors
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// I/O error from the underlying socket
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Operation needs a connected transport
    #[error("transport is not connected")]
    NotConnected,

    /// `connect()` on a connected transport
    #[error("transport is already connected")]
    AlreadyConnected,

    /// Dial or establishment failed
    #[error("connection failed: {0}")]
    ConnectionFailed(Cow<'static, str>),

    /// Deadline elapsed
    #[error("{operation} timed out after {deadline:?}")]
    Timeout {
        /// Operation name
        operation: &'static str,
        /// Deadline that elapsed
        deadline: Duration,
    },

    /// Response type did not match the request
    #[error("unexpected response: expected {expected}, got {actual}")]
    UnexpectedResponse {
        /// Expected envelope type
        expected: &'static str,
        /// Received envelope type
        actual: String,
    },

    /// Relay answered with an error envelope
    #[error("relay error: {0}")]
    Relay(String),

    /// Envelope could not be encoded or decoded
    #[error("codec error: {0}")]
    Codec(Cow<'static, str>),

    /// Invalid transport settings
    #[error("invalid configuration: {0}")]
    InvalidConfig(Cow<'static, str>),
}

impl TransportError {
    /// Faults of the path itself, worth failing over on
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Io(_) | Self::NotConnected | Self::ConnectionFailed(_) | Self::Timeout { .. }
        )
    }

    /// Whether a stream exchange that failed this way may have left a reply
    /// (or part of one) unread
    pub(crate) fn desyncs_stream(&self) -> bool {
        matches!(self, Self::Io(_) | Self::Timeout { .. } | Self::Codec(_))
    }

    pub(crate) fn unexpected(expected: &'static str, got: Envelope) -> Self {
        match got {
            Envelope::Error { message, .. } => Self::Relay(message),
            other => Self::UnexpectedResponse {
                expected,
                actual: other.message_type().to_string(),
            },
        }
    }
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// Closed set of relay transports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Primary: JSON envelopes over UDP datagrams
    Datagram,
    /// Fallback: framed stream behind an encrypted-tunnel handshake
    Tunnel,
    /// Alternate: request/response RPC records
    Rpc,
}

impl TransportKind {
    /// Configuration name
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Datagram => "datagram",
            Self::Tunnel => "tunnel",
            Self::Rpc => "rpc",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransportKind {
    type Err = TransportError;

    fn from_str(s: &str) -> TransportResult<Self> {
        match s {
            "datagram" | "quic" => Ok(Self::Datagram),
            "tunnel" | "wireguard" => Ok(Self::Tunnel),
            "rpc" | "grpc" => Ok(Self::Rpc),
            other => Err(TransportError::InvalidConfig(
                format!("unknown transport: {other}").into(),
            )),
        }
    }
}

/// Outcome of `hello`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HelloResult {
    /// `ok` unless the relay said otherwise
    pub status: String,
    /// Relay protocol version
    pub server_version: Option<String>,
    /// Features the relay supports
    pub features: Vec<String>,
    /// Relay-side session id
    pub session_id: Option<String>,
    /// Relay message
    pub error: Option<String>,
}

/// Outcome of `authenticate`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthResult {
    /// `ok` on success; empty when the relay sent none
    pub status: String,
    /// Client id assigned by the relay
    pub client_id: Option<String>,
    /// Tenant the relay bound the client to
    pub tenant_id: Option<String>,
    /// Relay message
    pub error: Option<String>,
}

/// Outcome of `create_tunnel`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelResult {
    /// `ok` on success; empty when the relay sent none
    pub status: String,
    /// Tunnel id echoed by the relay
    pub tunnel_id: Option<String>,
    /// Relay-side endpoint for the tunnel
    pub endpoint: Option<String>,
    /// Relay message
    pub error: Option<String>,
}

/// Outcome of `send_heartbeat`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeartbeatResult {
    /// `ok` unless the relay said otherwise
    pub status: String,
    /// Interval the relay asks for
    pub interval_seconds: Option<u64>,
    /// Relay message
    pub error: Option<String>,
}

macro_rules! impl_is_ok {
    ($($t:ty),*) => {$(
        impl $t {
            /// Whether the relay accepted the request
            pub fn is_ok(&self) -> bool {
                self.status == "ok"
            }
        }
    )*};
}

impl_is_ok!(HelloResult, AuthResult, TunnelResult, HeartbeatResult);

/// Relay transport client.
///
/// Implementations must serialize exchanges: one request is answered before
/// the next is sent. No operation retries internally.
#[async_trait]
pub trait TransportClient: Send + Sync {
    /// Which variant this is
    fn kind(&self) -> TransportKind;

    /// Open the path to the relay.
    ///
    /// # Errors
    /// [`TransportError::AlreadyConnected`] if connected; dial errors otherwise.
    async fn connect(&self) -> TransportResult<()>;

    /// Drop the path. Disconnecting a disconnected client is a no-op.
    async fn disconnect(&self) -> TransportResult<()>;

    /// Whether the path is open
    fn is_connected(&self) -> bool;

    /// Send `request` and wait up to `deadline` for the single response.
    ///
    /// # Errors
    /// [`TransportError::NotConnected`], [`TransportError::Timeout`], I/O and
    /// codec errors.
    async fn exchange(&self, request: Envelope, deadline: Duration) -> TransportResult<Envelope>;

    /// Traffic counters
    fn stats(&self) -> TransportStats;

    /// Release everything. Safe to call repeatedly.
    async fn close(&self) -> TransportResult<()> {
        self.disconnect().await
    }

    /// Protocol greeting
    async fn hello(&self, version: &str, features: &[String]) -> TransportResult<HelloResult> {
        let request = Envelope::Hello {
            version: version.to_string(),
            features: features.to_vec(),
        };
        match self.exchange(request, HELLO_DEADLINE).await? {
            Envelope::HelloResponse {
                status,
                server_version,
                features,
                session_id,
                error,
            } => Ok(HelloResult {
                status: status.unwrap_or_else(|| "ok".into()),
                server_version,
                features,
                session_id,
                error,
            }),
            other => Err(TransportError::unexpected("hello_response", other)),
        }
    }

    /// Present a bearer token
    async fn authenticate(&self, token: &str, subject: &str) -> TransportResult<AuthResult> {
        let request = Envelope::Auth {
            token: token.to_string(),
            sub: subject.to_string(),
        };
        match self.exchange(request, AUTH_DEADLINE).await? {
            Envelope::AuthResponse {
                status,
                client_id,
                tenant_id,
                error,
            } => Ok(AuthResult {
                status: status.unwrap_or_default(),
                client_id,
                tenant_id,
                error,
            }),
            other => Err(TransportError::unexpected("auth_response", other)),
        }
    }

    /// Ask the relay to open a tunnel
    async fn create_tunnel(
        &self,
        tunnel_id: &str,
        tenant_id: &str,
        local_port: u16,
        remote_host: &str,
        remote_port: u16,
    ) -> TransportResult<TunnelResult> {
        let request = Envelope::TunnelInfo {
            tunnel_id: tunnel_id.to_string(),
            tenant_id: tenant_id.to_string(),
            local_port,
            remote_host: remote_host.to_string(),
            remote_port,
        };
        match self.exchange(request, TUNNEL_DEADLINE).await? {
            Envelope::TunnelResponse {
                status,
                tunnel_id,
                endpoint,
                error,
            } => Ok(TunnelResult {
                status: status.unwrap_or_default(),
                tunnel_id,
                endpoint,
                error,
            }),
            other => Err(TransportError::unexpected("tunnel_response", other)),
        }
    }

    /// Keep the session alive and report metrics
    async fn send_heartbeat(
        &self,
        client_id: &str,
        tenant_id: &str,
        metrics: &HeartbeatMetrics,
    ) -> TransportResult<HeartbeatResult> {
        let request = Envelope::Heartbeat {
            client_id: client_id.to_string(),
            tenant_id: tenant_id.to_string(),
            metrics: metrics.clone(),
        };
        match self.exchange(request, HEARTBEAT_DEADLINE).await? {
            Envelope::HeartbeatResponse {
                status,
                interval_seconds,
                error,
            } => Ok(HeartbeatResult {
                status: status.unwrap_or_else(|| "ok".into()),
                interval_seconds,
                error,
            }),
            other => Err(TransportError::unexpected("heartbeat_response", other)),
        }
    }

    /// Liveness check with a short timeout; returns the round-trip time
    async fn probe(&self, timeout: Duration) -> TransportResult<Duration> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        let started = Instant::now();
        let request = Envelope::Hello {
            version: crate::envelope::PROTOCOL_VERSION.to_string(),
            features: Vec::new(),
        };
        match self.exchange(request, timeout).await? {
            Envelope::HelloResponse { .. } => Ok(started.elapsed()),
            other => Err(TransportError::unexpected("hello_response", other)),
        }
    }
}

/// Transport statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransportStats {
    /// Total bytes sent
    pub bytes_sent: u64,
    /// Total bytes received
    pub bytes_received: u64,
    /// Total envelopes sent
    pub packets_sent: u64,
    /// Total envelopes received
    pub packets_received: u64,
    /// Exchanges that failed
    pub errors: u64,
}

/// Lock-free counters behind [`TransportStats`]
#[derive(Debug, Default)]
pub(crate) struct StatsCounter {
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    packets_sent: AtomicU64,
    packets_received: AtomicU64,
    errors: AtomicU64,
}

impl StatsCounter {
    pub fn record_send(&self, bytes: usize) {
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
        self.packets_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_recv(&self, bytes: usize) {
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
        self.packets_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> TransportStats {
        TransportStats {
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            packets_sent: self.packets_sent.load(Ordering::Relaxed),
            packets_received: self.packets_received.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_counter() {
        let stats = StatsCounter::default();
        stats.record_send(100);
        stats.record_send(50);
        stats.record_recv(200);
        stats.record_error();

        let snap = stats.snapshot();
        assert_eq!(snap.bytes_sent, 150);
        assert_eq!(snap.packets_sent, 2);
        assert_eq!(snap.bytes_received, 200);
        assert_eq!(snap.packets_received, 1);
        assert_eq!(snap.errors, 1);
    }

    #[test]
    fn test_kind_names() {
        assert_eq!("quic".parse::<TransportKind>().unwrap(), TransportKind::Datagram);
        assert_eq!("wireguard".parse::<TransportKind>().unwrap(), TransportKind::Tunnel);
        assert_eq!("grpc".parse::<TransportKind>().unwrap(), TransportKind::Rpc);
        assert!("carrier-pigeon".parse::<TransportKind>().is_err());
        assert_eq!(TransportKind::Tunnel.to_string(), "tunnel");
    }

    #[test]
    fn test_error_classification() {
        assert!(TransportError::NotConnected.is_transient());
        assert!(
            TransportError::Timeout {
                operation: "hello",
                deadline: HELLO_DEADLINE
            }
            .is_transient()
        );
        assert!(!TransportError::Relay("denied".into()).is_transient());
        assert_eq!(
            TransportError::Timeout {
                operation: "heartbeat",
                deadline: Duration::from_secs(5)
            }
            .to_string(),
            "heartbeat timed out after 5s"
        );
    }

    #[test]
    fn test_unexpected_maps_error_envelope() {
        let err = TransportError::unexpected(
            "auth_response",
            Envelope::Error {
                code: None,
                message: "tenant suspended".into(),
            },
        );
        assert!(matches!(err, TransportError::Relay(m) if m == "tenant suspended"));

        let err = TransportError::unexpected("auth_response", Envelope::PeerList { peers: vec![] });
        assert_eq!(
            err.to_string(),
            "unexpected response: expected auth_response, got peer_list"
        );
    }

    #[test]
    fn test_result_status() {
        let ok = TunnelResult {
            status: "ok".into(),
            tunnel_id: None,
            endpoint: None,
            error: None,
        };
        assert!(ok.is_ok());
        let denied = AuthResult {
            status: "denied".into(),
            client_id: None,
            tenant_id: None,
            error: Some("expired".into()),
        };
        assert!(!denied.is_ok());
    }
}
