//! Typed claims and the authorization envelope derived from them.
//!
//! Issuers disagree on the shape of the optional sub-objects, so every one of
//! them is parsed independently and leniently: a missing or oddly shaped
//! sub-object becomes `None` (or an empty list) instead of an error. Only
//! `sub` is mandatory.

use crate::error::{AuthError, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Allowed range handed out when the token carries no transport config
pub const DEFAULT_ALLOWED_RANGE: &str = "10.0.0.0/24";

/// Permissions that imply mesh membership
const MESH_PERMISSIONS: [&str; 2] = ["mesh:connect", "mesh:discover"];

/// How this client participates in the relay network
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConnectionType {
    /// Client reaches services through the relay
    ClientServer,
    /// Long-lived server-to-server link
    ServerServer,
    /// Peer-to-peer overlay coordinated by the relay
    P2pMesh,
}

impl ConnectionType {
    /// Wire name
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ClientServer => "client-server",
            Self::ServerServer => "server-server",
            Self::P2pMesh => "p2p-mesh",
        }
    }

    /// Normalize an explicit `connection_type` claim value.
    ///
    /// `wireguard` and unrecognised values map to [`ConnectionType::P2pMesh`].
    pub fn from_claim(value: &str) -> Self {
        match value {
            "client-server" => Self::ClientServer,
            "server-server" => Self::ServerServer,
            _ => Self::P2pMesh,
        }
    }
}

impl fmt::Display for ConnectionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConnectionType {
    type Err = AuthError;

    /// Strict parse used for operator input, unlike [`ConnectionType::from_claim`]
    fn from_str(s: &str) -> Result<Self> {
        match s {
            "client-server" => Ok(Self::ClientServer),
            "server-server" => Ok(Self::ServerServer),
            "p2p-mesh" | "wireguard" => Ok(Self::P2pMesh),
            other => Err(AuthError::unsupported(format!(
                "unknown connection type: {other}"
            ))),
        }
    }
}

/// Tunnel key material and allowed ranges
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransportConfig {
    /// Public key announced for this client
    pub public_key: String,
    /// CIDR ranges routed through the tunnel
    pub allowed_ips: Vec<String>,
    /// True when the token had no transport config and these are placeholders
    pub synthetic: bool,
}

impl TransportConfig {
    fn placeholder() -> Self {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default();
        Self {
            public_key: format!("generated-key-{nanos}"),
            allowed_ips: vec![DEFAULT_ALLOWED_RANGE.to_string()],
            synthetic: true,
        }
    }

    fn parse(value: &Value) -> Option<Self> {
        let obj = value.as_object()?;
        Some(Self {
            public_key: str_field(obj, "public_key").unwrap_or_default(),
            allowed_ips: str_list(obj.get("allowed_ips")),
            synthetic: false,
        })
    }
}

/// Mesh behaviour requested by the issuer
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MeshConfig {
    /// Ask the relay for peers on start
    pub auto_discovery: bool,
    /// Peers of this client are persistent
    pub persistent: bool,
    /// Routing strategy (`hybrid`, `direct`, `relay`, ...)
    pub routing: Option<String>,
    /// Encryption scheme name
    pub encryption: Option<String>,
    /// Heartbeat interval, from seconds or a duration string
    #[serde(serialize_with = "opt_secs::serialize")]
    pub heartbeat_interval: Option<Duration>,
}

impl MeshConfig {
    /// Lenient parse of a `mesh_config` object
    pub fn parse(value: &Value) -> Option<Self> {
        let obj = value.as_object()?;
        Some(Self {
            auto_discovery: bool_field(obj, "auto_discovery")
                .or_else(|| bool_field(obj, "enable_auto_discovery"))
                .unwrap_or(false),
            persistent: bool_field(obj, "persistent").unwrap_or(false),
            routing: str_field(obj, "routing").or_else(|| str_field(obj, "routing_strategy")),
            encryption: str_field(obj, "encryption"),
            heartbeat_interval: obj.get("heartbeat_interval").and_then(parse_interval),
        })
    }
}

/// Which peers may join and how many
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PeerWhitelist {
    /// Peer ids admitted when `auto_approve` is off
    pub allowed_peers: Vec<String>,
    /// Admit any discovered peer
    pub auto_approve: bool,
    /// Upper bound on active peers
    pub max_peers: Option<usize>,
}

impl PeerWhitelist {
    fn parse(value: &Value) -> Option<Self> {
        match value {
            // bare list of ids: enforcement on
            Value::Array(_) => Some(Self {
                allowed_peers: str_list(Some(value)),
                auto_approve: false,
                max_peers: None,
            }),
            Value::Object(obj) => Some(Self {
                allowed_peers: str_list(obj.get("allowed_peers")),
                auto_approve: bool_field(obj, "auto_approve").unwrap_or(false),
                max_peers: obj.get("max_peers").and_then(parse_count),
            }),
            _ => None,
        }
    }
}

/// Overlay addressing handed down by the issuer
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct NetworkConfig {
    /// Overlay subnet in CIDR form
    pub subnet: Option<String>,
    /// Resolver addresses
    pub dns: Vec<String>,
    /// Interface MTU
    pub mtu: Option<u32>,
}

impl NetworkConfig {
    fn parse(value: &Value) -> Option<Self> {
        let obj = value.as_object()?;
        Some(Self {
            subnet: str_field(obj, "subnet"),
            dns: str_list(obj.get("dns")),
            mtu: obj
                .get("mtu")
                .and_then(parse_count)
                .and_then(|m| u32::try_from(m).ok()),
        })
    }
}

/// Claims of a validated token.
///
/// Built once per validation and never mutated.
#[derive(Debug, Clone, Serialize)]
pub struct Claims {
    subject: String,
    tenant_id: Option<String>,
    org_id: Option<String>,
    permissions: BTreeSet<String>,
    connection_type: Option<String>,
    issuer: Option<String>,
    audience: Vec<String>,
    expires_at: Option<i64>,
    issued_at: Option<i64>,
    not_before: Option<i64>,
    transport: TransportConfig,
    mesh: Option<MeshConfig>,
    whitelist: Option<PeerWhitelist>,
    network: Option<NetworkConfig>,
}

impl Claims {
    /// Build typed claims from a decoded payload.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::MissingSubject`] if `sub` is absent or not a string.
    pub fn from_payload(payload: &Map<String, Value>) -> Result<Self> {
        let subject = match payload.get("sub") {
            Some(Value::String(s)) => s.clone(),
            _ => return Err(AuthError::MissingSubject),
        };

        let transport = payload
            .get("transport_config")
            .or_else(|| payload.get("quic_config"))
            .and_then(TransportConfig::parse)
            .unwrap_or_else(TransportConfig::placeholder);

        Ok(Self {
            subject,
            tenant_id: str_field(payload, "tenant_id"),
            org_id: str_field(payload, "org_id"),
            permissions: str_list(payload.get("permissions")).into_iter().collect(),
            connection_type: str_field(payload, "connection_type"),
            issuer: str_field(payload, "iss"),
            audience: match payload.get("aud") {
                Some(Value::String(s)) => vec![s.clone()],
                other => str_list(other),
            },
            expires_at: int_field(payload, "exp"),
            issued_at: int_field(payload, "iat"),
            not_before: int_field(payload, "nbf"),
            transport,
            mesh: payload.get("mesh_config").and_then(MeshConfig::parse),
            whitelist: payload.get("peer_whitelist").and_then(PeerWhitelist::parse),
            network: payload.get("network_config").and_then(NetworkConfig::parse),
        })
    }

    /// Token subject
    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// Tenant id, empty when the token is not multi-tenant
    pub fn tenant_id(&self) -> &str {
        self.tenant_id.as_deref().unwrap_or_default()
    }

    /// Organization id
    pub fn org_id(&self) -> Option<&str> {
        self.org_id.as_deref()
    }

    /// Granted permissions
    pub fn permissions(&self) -> &BTreeSet<String> {
        &self.permissions
    }

    /// Effective connection type.
    ///
    /// The explicit claim wins. Without one, any mesh permission yields
    /// `p2p-mesh`, otherwise `client-server`.
    pub fn connection_type(&self) -> ConnectionType {
        if let Some(explicit) = &self.connection_type {
            return ConnectionType::from_claim(explicit);
        }
        if MESH_PERMISSIONS.iter().any(|p| self.permissions.contains(*p)) {
            ConnectionType::P2pMesh
        } else {
            ConnectionType::ClientServer
        }
    }

    /// Transport key material, possibly a synthetic placeholder
    pub fn transport_config(&self) -> &TransportConfig {
        &self.transport
    }

    /// Mesh behaviour, if the token carries one
    pub fn mesh_config(&self) -> Option<&MeshConfig> {
        self.mesh.as_ref()
    }

    /// Peer admission policy, if the token carries one
    pub fn peer_whitelist(&self) -> Option<&PeerWhitelist> {
        self.whitelist.as_ref()
    }

    /// Overlay addressing, if the token carries one
    pub fn network_config(&self) -> Option<&NetworkConfig> {
        self.network.as_ref()
    }

    /// `iss`
    pub fn issuer(&self) -> Option<&str> {
        self.issuer.as_deref()
    }

    /// `aud`, normalized to a list
    pub fn audience(&self) -> &[String] {
        &self.audience
    }

    /// `exp` as Unix seconds
    pub fn expires_at(&self) -> Option<i64> {
        self.expires_at
    }

    /// `iat` as Unix seconds
    pub fn issued_at(&self) -> Option<i64> {
        self.issued_at
    }

    /// `nbf` as Unix seconds
    pub fn not_before(&self) -> Option<i64> {
        self.not_before
    }
}

// ───────────────────────────────────────────────────────────────────────────
// Lenient field readers
// ───────────────────────────────────────────────────────────────────────────

fn str_field(obj: &Map<String, Value>, key: &str) -> Option<String> {
    obj.get(key).and_then(Value::as_str).map(str::to_owned)
}

fn bool_field(obj: &Map<String, Value>, key: &str) -> Option<bool> {
    obj.get(key).and_then(Value::as_bool)
}

fn int_field(obj: &Map<String, Value>, key: &str) -> Option<i64> {
    obj.get(key).and_then(Value::as_f64).map(|f| f as i64)
}

fn str_list(value: Option<&Value>) -> Vec<String> {
    match value {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_owned)
            .collect(),
        _ => Vec::new(),
    }
}

/// Non-negative count from a number or a numeric string
fn parse_count(value: &Value) -> Option<usize> {
    match value {
        Value::Number(n) => n.as_u64().and_then(|v| usize::try_from(v).ok()),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Interval from a number of seconds or a string such as `30s`, `1m`, `500ms`
pub(crate) fn parse_interval(value: &Value) -> Option<Duration> {
    match value {
        Value::Number(n) => n
            .as_f64()
            .filter(|s| *s > 0.0)
            .map(Duration::from_secs_f64),
        Value::String(s) => parse_duration_str(s),
        _ => None,
    }
}

fn parse_duration_str(s: &str) -> Option<Duration> {
    let s = s.trim();
    let split = s.find(|c: char| !c.is_ascii_digit() && c != '.')?;
    let (num, unit) = s.split_at(split);
    let value: f64 = num.parse().ok()?;
    let secs = match unit {
        "ms" => value / 1000.0,
        "s" => value,
        "m" => value * 60.0,
        "h" => value * 3600.0,
        _ => return None,
    };
    (secs > 0.0).then(|| Duration::from_secs_f64(secs))
}

mod opt_secs {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => s.serialize_some(&d.as_secs_f64()),
            None => s.serialize_none(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn claims(v: Value) -> Result<Claims> {
        Claims::from_payload(v.as_object().unwrap())
    }

    #[test]
    fn test_subject_is_mandatory() {
        assert!(matches!(
            claims(json!({"tenant_id": "acme"})),
            Err(AuthError::MissingSubject)
        ));
        assert!(matches!(
            claims(json!({"sub": 42})),
            Err(AuthError::MissingSubject)
        ));
    }

    #[test]
    fn test_tenant_absent_is_empty() {
        let c = claims(json!({"sub": "u1"})).unwrap();
        assert_eq!(c.tenant_id(), "");
        assert!(c.permissions().is_empty());
        assert!(c.mesh_config().is_none());
        assert!(c.peer_whitelist().is_none());
        assert!(c.network_config().is_none());
    }

    #[test]
    fn test_connection_type_derivation() {
        let mesh = claims(json!({"sub": "u", "permissions": ["mesh:connect"]})).unwrap();
        assert_eq!(mesh.connection_type(), ConnectionType::P2pMesh);

        let wg = claims(json!({"sub": "u", "connection_type": "wireguard"})).unwrap();
        assert_eq!(wg.connection_type(), ConnectionType::P2pMesh);

        let plain = claims(json!({"sub": "u", "permissions": ["tunnel:create"]})).unwrap();
        assert_eq!(plain.connection_type(), ConnectionType::ClientServer);

        let explicit = claims(json!({
            "sub": "u",
            "connection_type": "server-server",
            "permissions": ["mesh:discover"]
        }))
        .unwrap();
        assert_eq!(explicit.connection_type(), ConnectionType::ServerServer);
    }

    #[test]
    fn test_transport_config_placeholder() {
        let c = claims(json!({"sub": "u"})).unwrap();
        let tc = c.transport_config();
        assert!(tc.synthetic);
        assert!(tc.public_key.starts_with("generated-key-"));
        assert_eq!(tc.allowed_ips, vec![DEFAULT_ALLOWED_RANGE.to_string()]);

        let legacy = claims(json!({
            "sub": "u",
            "quic_config": {"public_key": "pk", "allowed_ips": ["10.8.0.0/16"]}
        }))
        .unwrap();
        assert!(!legacy.transport_config().synthetic);
        assert_eq!(legacy.transport_config().public_key, "pk");
    }

    #[test]
    fn test_mesh_config_shapes() {
        let c = claims(json!({
            "sub": "u",
            "mesh_config": {
                "enable_auto_discovery": true,
                "routing_strategy": "direct",
                "heartbeat_interval": "30s"
            }
        }))
        .unwrap();
        let mesh = c.mesh_config().unwrap();
        assert!(mesh.auto_discovery);
        assert_eq!(mesh.routing.as_deref(), Some("direct"));
        assert_eq!(mesh.heartbeat_interval, Some(Duration::from_secs(30)));

        let numeric = MeshConfig::parse(&json!({"heartbeat_interval": 15})).unwrap();
        assert_eq!(numeric.heartbeat_interval, Some(Duration::from_secs(15)));

        let junk = MeshConfig::parse(&json!({"heartbeat_interval": "soon"})).unwrap();
        assert_eq!(junk.heartbeat_interval, None);
        assert!(MeshConfig::parse(&json!("hybrid")).is_none());
    }

    #[test]
    fn test_whitelist_shapes() {
        let obj = claims(json!({
            "sub": "u",
            "peer_whitelist": {"allowed_peers": ["p1", "p2"], "auto_approve": false, "max_peers": "5"}
        }))
        .unwrap();
        let wl = obj.peer_whitelist().unwrap();
        assert_eq!(wl.allowed_peers, vec!["p1", "p2"]);
        assert_eq!(wl.max_peers, Some(5));

        let list = claims(json!({"sub": "u", "peer_whitelist": ["peer-001"]})).unwrap();
        let wl = list.peer_whitelist().unwrap();
        assert!(!wl.auto_approve);
        assert_eq!(wl.allowed_peers, vec!["peer-001"]);
        assert_eq!(wl.max_peers, None);
    }

    #[test]
    fn test_network_config() {
        let c = claims(json!({
            "sub": "u",
            "network_config": {"subnet": "10.0.0.0/24", "dns": ["1.1.1.1"], "mtu": 1420}
        }))
        .unwrap();
        let net = c.network_config().unwrap();
        assert_eq!(net.subnet.as_deref(), Some("10.0.0.0/24"));
        assert_eq!(net.dns, vec!["1.1.1.1"]);
        assert_eq!(net.mtu, Some(1420));
    }

    #[test]
    fn test_audience_forms() {
        let single = claims(json!({"sub": "u", "aud": "relay"})).unwrap();
        assert_eq!(single.audience(), ["relay".to_string()]);
        let many = claims(json!({"sub": "u", "aud": ["a", "b"]})).unwrap();
        assert_eq!(many.audience().len(), 2);
    }

    #[test]
    fn test_connection_type_from_str() {
        assert_eq!(
            "wireguard".parse::<ConnectionType>().unwrap(),
            ConnectionType::P2pMesh
        );
        assert!("mesh".parse::<ConnectionType>().unwrap_err().is_configuration());
        assert_eq!(ConnectionType::from_claim("mesh"), ConnectionType::P2pMesh);
    }

    proptest! {
        #[test]
        fn prop_mesh_permission_implies_p2p(
            mut perms in proptest::collection::vec("[a-z]{1,8}:[a-z]{1,8}", 0..6),
            with_mesh in any::<bool>(),
        ) {
            perms.retain(|p| !MESH_PERMISSIONS.contains(&p.as_str()));
            if with_mesh {
                perms.push("mesh:connect".to_string());
            }
            let c = claims(json!({"sub": "u", "permissions": perms})).unwrap();
            let expected = if with_mesh {
                ConnectionType::P2pMesh
            } else {
                ConnectionType::ClientServer
            };
            prop_assert_eq!(c.connection_type(), expected);
        }
    }
}
