//! Relay wire envelopes.
//!
//! Envelopes are JSON objects discriminated by a `type` field. Every variant
//! carries the same envelope regardless of transport; only the framing
//! differs.

use crate::transport::{TransportError, TransportResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Protocol version announced in `hello`
pub const PROTOCOL_VERSION: &str = "1.0";

/// Features announced in `hello`
pub const DEFAULT_FEATURES: [&str; 3] = ["tls", "heartbeat", "tunnel_info"];

/// Relay protocol messages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Envelope {
    /// Client greeting
    Hello {
        /// Protocol version
        version: String,
        /// Client features
        #[serde(default)]
        features: Vec<String>,
    },

    /// Relay greeting
    HelloResponse {
        /// Optional status
        #[serde(default, skip_serializing_if = "Option::is_none")]
        status: Option<String>,
        /// Relay protocol version
        #[serde(default, skip_serializing_if = "Option::is_none")]
        server_version: Option<String>,
        /// Relay features
        #[serde(default)]
        features: Vec<String>,
        /// Relay session id
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
        /// Relay message
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    /// Token presentation
    Auth {
        /// Bearer token
        token: String,
        /// Token subject
        sub: String,
    },

    /// Authentication verdict
    AuthResponse {
        /// `ok` on success
        #[serde(default, skip_serializing_if = "Option::is_none")]
        status: Option<String>,
        /// Assigned client id
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client_id: Option<String>,
        /// Bound tenant
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tenant_id: Option<String>,
        /// Relay message
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    /// Tunnel request
    TunnelInfo {
        /// Client-chosen tunnel id
        tunnel_id: String,
        /// Owning tenant
        tenant_id: String,
        /// Local port on this client
        local_port: u16,
        /// Remote host behind the relay
        remote_host: String,
        /// Remote port
        remote_port: u16,
    },

    /// Tunnel verdict
    TunnelResponse {
        /// `ok` on success
        #[serde(default, skip_serializing_if = "Option::is_none")]
        status: Option<String>,
        /// Echoed tunnel id
        #[serde(default, skip_serializing_if = "Option::is_none")]
        tunnel_id: Option<String>,
        /// Relay-side endpoint
        #[serde(default, skip_serializing_if = "Option::is_none")]
        endpoint: Option<String>,
        /// Relay message
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    /// Keepalive with metrics
    Heartbeat {
        /// Client id from authentication
        client_id: String,
        /// Tenant id from the token
        tenant_id: String,
        /// Counters since session start
        metrics: HeartbeatMetrics,
    },

    /// Keepalive acknowledgement
    HeartbeatResponse {
        /// Optional status
        #[serde(default, skip_serializing_if = "Option::is_none")]
        status: Option<String>,
        /// Interval the relay asks for
        #[serde(default, skip_serializing_if = "Option::is_none")]
        interval_seconds: Option<u64>,
        /// Relay message
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    /// Mesh peer handshake
    P2pHandshake {
        /// `client` or `server`
        role: HandshakeRole,
        /// Our public key
        public_key: String,
        /// Our listen port
        listen_port: u16,
        /// Resolved mesh mode
        mode: HandshakeMode,
        /// Peers we serve (server role only)
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        peers: Vec<PeerDescriptor>,
        /// Target peer id
        #[serde(default, skip_serializing_if = "Option::is_none")]
        peer_id: Option<String>,
        /// Unix seconds
        timestamp: i64,
    },

    /// Mesh peer handshake verdict
    P2pHandshakeResponse {
        /// `ok` on success
        #[serde(default, skip_serializing_if = "Option::is_none")]
        status: Option<String>,
        /// Human-readable detail
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
        /// Responding peer id
        #[serde(default, skip_serializing_if = "Option::is_none")]
        peer_id: Option<String>,
    },

    /// Ask the relay for mesh peers
    PeerDiscovery {
        /// Tenant scope
        tenant_id: String,
        /// Our public key
        public_key: String,
        /// Our reachable endpoint
        #[serde(default, skip_serializing_if = "Option::is_none")]
        endpoint: Option<String>,
    },

    /// Peers known to the relay
    PeerList {
        /// Discovered peers
        #[serde(default)]
        peers: Vec<PeerDescriptor>,
    },

    /// Relay-pushed mesh policy
    MeshConfig {
        /// Discover peers automatically
        #[serde(default, skip_serializing_if = "Option::is_none")]
        auto_discovery: Option<bool>,
        /// Routing strategy
        #[serde(default, skip_serializing_if = "Option::is_none")]
        routing: Option<String>,
        /// Replacement whitelist
        #[serde(default, skip_serializing_if = "Option::is_none")]
        allowed_peers: Option<Vec<String>>,
        /// Whitelist enforcement switch
        #[serde(default, skip_serializing_if = "Option::is_none")]
        auto_approve: Option<bool>,
        /// Capacity bound
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_peers: Option<usize>,
    },

    /// Fallback tunnel establishment
    TunnelHandshake {
        /// Always `client` from this side
        role: HandshakeRole,
        /// Tunnel public key, base64
        public_key: String,
        /// Tunnel listen port
        listen_port: u16,
        /// Resolved mode
        mode: HandshakeMode,
        /// Unix seconds
        timestamp: i64,
    },

    /// Fallback tunnel verdict
    TunnelHandshakeResponse {
        /// `ok` on success
        #[serde(default, skip_serializing_if = "Option::is_none")]
        status: Option<String>,
        /// Human-readable detail
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
        /// Relay tunnel public key, base64
        #[serde(default, skip_serializing_if = "Option::is_none")]
        server_public_key: Option<String>,
    },

    /// Relay-side error
    Error {
        /// Machine-readable code
        #[serde(default, skip_serializing_if = "Option::is_none")]
        code: Option<String>,
        /// Human-readable message
        #[serde(default)]
        message: String,
    },
}

impl Envelope {
    /// Wire name of the `type` field
    pub fn message_type(&self) -> &'static str {
        match self {
            Envelope::Hello { .. } => "hello",
            Envelope::HelloResponse { .. } => "hello_response",
            Envelope::Auth { .. } => "auth",
            Envelope::AuthResponse { .. } => "auth_response",
            Envelope::TunnelInfo { .. } => "tunnel_info",
            Envelope::TunnelResponse { .. } => "tunnel_response",
            Envelope::Heartbeat { .. } => "heartbeat",
            Envelope::HeartbeatResponse { .. } => "heartbeat_response",
            Envelope::P2pHandshake { .. } => "p2p_handshake",
            Envelope::P2pHandshakeResponse { .. } => "p2p_handshake_response",
            Envelope::PeerDiscovery { .. } => "peer_discovery",
            Envelope::PeerList { .. } => "peer_list",
            Envelope::MeshConfig { .. } => "mesh_config",
            Envelope::TunnelHandshake { .. } => "tunnel_handshake",
            Envelope::TunnelHandshakeResponse { .. } => "tunnel_handshake_response",
            Envelope::Error { .. } => "error",
        }
    }

    /// Serialize to JSON bytes
    pub fn to_bytes(&self) -> TransportResult<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| TransportError::Codec(e.to_string().into()))
    }

    /// Parse JSON bytes
    pub fn from_bytes(bytes: &[u8]) -> TransportResult<Self> {
        serde_json::from_slice(bytes).map_err(|e| TransportError::Codec(e.to_string().into()))
    }
}

/// Counters reported with every heartbeat
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatMetrics {
    /// Bytes sent across all transports
    pub bytes_sent: u64,
    /// Bytes received across all transports
    pub bytes_received: u64,
    /// Envelopes sent
    pub packets_sent: u64,
    /// Envelopes received
    pub packets_received: u64,
    /// Registered tunnels
    pub active_tunnels: u64,
    /// Connected mesh peers
    pub active_peers: u64,
    /// Active transport name
    pub transport_mode: String,
    /// Unix seconds of the last transport switch
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_switch: Option<i64>,
}

/// Peer as described on the wire
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerDescriptor {
    /// Peer id
    pub id: String,
    /// Peer public key
    #[serde(default)]
    pub public_key: String,
    /// Reachable endpoint (`host:port`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    /// Ranges routed to this peer
    #[serde(default)]
    pub allowed_ips: Vec<String>,
    /// Long-lived peer
    #[serde(default)]
    pub persistent: bool,
}

/// Handshake role
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HandshakeRole {
    /// Initiating side
    Client,
    /// Side serving a peer list
    Server,
}

/// Mesh mode negotiated in handshakes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HandshakeMode {
    /// Decide from the peer set
    Auto,
    /// Transient peers
    ClientServer,
    /// Persistent peers
    ServerServer,
}

impl HandshakeMode {
    /// Resolve `Auto` against a peer set.
    ///
    /// No peers means client-server; any persistent peer means
    /// server-server; otherwise client-server. Explicit modes are kept.
    pub fn resolve(self, peers: &[PeerDescriptor]) -> Self {
        match self {
            Self::Auto if peers.iter().any(|p| p.persistent) => Self::ServerServer,
            Self::Auto => Self::ClientServer,
            explicit => explicit,
        }
    }

    /// Configuration name
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::ClientServer => "client-server",
            Self::ServerServer => "server-server",
        }
    }
}

impl fmt::Display for HandshakeMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HandshakeMode {
    type Err = TransportError;

    fn from_str(s: &str) -> TransportResult<Self> {
        match s {
            "auto" | "" => Ok(Self::Auto),
            "client-server" => Ok(Self::ClientServer),
            "server-server" => Ok(Self::ServerServer),
            other => Err(TransportError::InvalidConfig(
                format!("unsupported mode: {other}").into(),
            )),
        }
    }
}
