//! Peer-to-peer mesh coordination through the relay.
//!
//! Active when a session authenticates with connection type `p2p-mesh`. Policy
//! comes from the token's claims:
//!
//! - `peer_whitelist.auto_approve == false` turns on whitelist enforcement:
//!   only ids in `allowed_peers` are admitted, others fail with
//!   [`SessionError::PeerRejected`]
//! - `peer_whitelist.max_peers` bounds the active peer set; peers beyond it
//!   are rejected with [`SessionError::CapacityExceeded`]
//! - `mesh_config.auto_discovery` asks the relay for peers on start
//!
//! Every admitted peer goes through a `p2p_handshake` exchange on the
//! session's transport. A rejected handshake fails that peer only.

use crate::error::{Result, SessionError};
use crate::metrics::unix_now;
use dashmap::DashMap;
use skylink_auth::{Claims, NetworkConfig};
use skylink_transport::{
    Envelope, HandshakeMode, HandshakeRole, PeerDescriptor, TransportClient, TransportError,
};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, RwLock};
use tracing::Span;

/// Deadline for one peer handshake or discovery round trip
const MESH_EXCHANGE_DEADLINE: Duration = Duration::from_secs(10);

/// Local mesh settings
#[derive(Debug, Clone)]
pub struct MeshSettings {
    /// Port announced to peers
    pub listen_port: u16,
    /// Key announced to peers; the token's transport key when absent
    pub public_key: Option<String>,
    /// Requested mode, resolved against the peer set when `Auto`
    pub mode: HandshakeMode,
    /// Run discovery during `start()` when the token allows it
    pub discover_on_start: bool,
}

impl Default for MeshSettings {
    fn default() -> Self {
        Self {
            listen_port: 51820,
            public_key: None,
            mode: HandshakeMode::Auto,
            discover_on_start: true,
        }
    }
}

/// Admission policy derived from claims
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MeshPolicy {
    /// Ask the relay for peers
    pub auto_discovery: bool,
    /// This client's peers are long-lived; we serve our peer list
    pub persistent: bool,
    /// Routing strategy named by the issuer
    pub routing: Option<String>,
    /// Ids admitted under enforcement
    pub allowed_peers: BTreeSet<String>,
    /// Admit anyone
    pub auto_approve: bool,
    /// Bound on the active peer set
    pub max_peers: Option<usize>,
    /// Overlay addressing
    pub network: Option<NetworkConfig>,
}

impl MeshPolicy {
    /// Policy carried by `claims`. Absent sections are permissive.
    pub fn from_claims(claims: &Claims) -> Self {
        let mesh = claims.mesh_config();
        let whitelist = claims.peer_whitelist();
        Self {
            auto_discovery: mesh.is_some_and(|m| m.auto_discovery),
            persistent: mesh.is_some_and(|m| m.persistent),
            routing: mesh.and_then(|m| m.routing.clone()),
            allowed_peers: whitelist
                .map(|w| w.allowed_peers.iter().cloned().collect())
                .unwrap_or_default(),
            auto_approve: whitelist.is_none_or(|w| w.auto_approve),
            max_peers: whitelist.and_then(|w| w.max_peers),
            network: claims.network_config().cloned(),
        }
    }

    /// Whether whitelist enforcement is on
    pub fn enforces_whitelist(&self) -> bool {
        !self.auto_approve
    }
}

/// A peer in the routing table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peer {
    /// Peer id
    pub id: String,
    /// Peer public key
    pub public_key: String,
    /// Reachable endpoint
    pub endpoint: Option<String>,
    /// Ranges routed to the peer
    pub allowed_ips: Vec<String>,
    /// Long-lived peer
    pub persistent: bool,
    /// Last successful handshake
    pub last_seen: Instant,
    /// Handshake completed
    pub connected: bool,
}

impl Peer {
    fn from_descriptor(d: &PeerDescriptor) -> Self {
        Self {
            id: d.id.clone(),
            public_key: d.public_key.clone(),
            endpoint: d.endpoint.clone(),
            allowed_ips: d.allowed_ips.clone(),
            persistent: d.persistent,
            last_seen: Instant::now(),
            connected: true,
        }
    }

    fn descriptor(&self) -> PeerDescriptor {
        PeerDescriptor {
            id: self.id.clone(),
            public_key: self.public_key.clone(),
            endpoint: self.endpoint.clone(),
            allowed_ips: self.allowed_ips.clone(),
            persistent: self.persistent,
        }
    }
}

/// Outcome of one discovery round
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiscoveryReport {
    /// Peers admitted and handshaken
    pub added: Vec<String>,
    /// Peers rejected, with the reason
    pub rejected: Vec<(String, String)>,
}

/// Mesh peer manager
pub struct MeshManager {
    settings: MeshSettings,
    running: AtomicBool,
    policy: RwLock<MeshPolicy>,
    transport: RwLock<Option<Arc<dyn TransportClient>>>,
    public_key: RwLock<String>,
    tenant_id: RwLock<String>,
    peers: DashMap<String, Peer>,
    // serializes admission so capacity checks see a stable count
    admission: Mutex<()>,
    rejected: AtomicU64,
    span: Span,
}

impl MeshManager {
    /// Create an idle manager
    pub fn new(settings: MeshSettings, span: Span) -> Self {
        Self {
            settings,
            running: AtomicBool::new(false),
            policy: RwLock::new(MeshPolicy::default()),
            transport: RwLock::new(None),
            public_key: RwLock::new(String::new()),
            tenant_id: RwLock::new(String::new()),
            peers: DashMap::new(),
            admission: Mutex::new(()),
            rejected: AtomicU64::new(0),
            span,
        }
    }

    /// Start coordinating peers for a freshly authenticated session.
    ///
    /// # Errors
    ///
    /// [`SessionError::TransportUnavailable`] if `transport` is not
    /// connected, and any error from the initial discovery exchange. Individual
    /// peer rejections are not errors.
    pub async fn start(&self, claims: &Claims, transport: Arc<dyn TransportClient>) -> Result<()> {
        if !transport.is_connected() {
            return Err(SessionError::unavailable("mesh start requires a connected transport"));
        }
        let policy = MeshPolicy::from_claims(claims);
        let public_key = self
            .settings
            .public_key
            .clone()
            .unwrap_or_else(|| claims.transport_config().public_key.clone());

        *self.policy.write().await = policy.clone();
        *self.public_key.write().await = public_key;
        *self.tenant_id.write().await = claims.tenant_id().to_string();
        *self.transport.write().await = Some(transport);
        self.peers.clear();
        self.running.store(true, Ordering::SeqCst);

        tracing::info!(
            parent: &self.span,
            tenant = claims.tenant_id(),
            enforce_whitelist = policy.enforces_whitelist(),
            max_peers = ?policy.max_peers,
            routing = ?policy.routing,
            "mesh started"
        );

        if self.settings.discover_on_start && policy.auto_discovery {
            if let Err(e) = self.discover().await {
                self.stop().await;
                return Err(e);
            }
        }
        Ok(())
    }

    /// Stop and forget every peer
    pub async fn stop(&self) {
        if self.running.swap(false, Ordering::SeqCst) {
            tracing::info!(parent: &self.span, peers = self.peers.len(), "mesh stopped");
        }
        self.peers.clear();
        *self.transport.write().await = None;
    }

    /// Follow the session onto a new transport
    pub async fn rebind(&self, transport: Arc<dyn TransportClient>) {
        if !self.is_running() {
            return;
        }
        tracing::debug!(parent: &self.span, kind = %transport.kind(), "mesh rebound");
        *self.transport.write().await = Some(transport);
    }

    /// Whether the manager is active
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Current policy
    pub async fn policy(&self) -> MeshPolicy {
        self.policy.read().await.clone()
    }

    /// Ask the relay for peers and admit each one.
    ///
    /// # Errors
    ///
    /// Fails if the manager is stopped or the discovery exchange fails.
    pub async fn discover(&self) -> Result<DiscoveryReport> {
        let transport = self.bound_transport().await?;
        let request = Envelope::PeerDiscovery {
            tenant_id: self.tenant_id.read().await.clone(),
            public_key: self.public_key.read().await.clone(),
            endpoint: None,
        };

        let peers = match transport.exchange(request, MESH_EXCHANGE_DEADLINE).await? {
            Envelope::PeerList { peers } => peers,
            Envelope::Error { message, .. } => return Err(SessionError::ProtocolViolation(message.into())),
            other => {
                return Err(SessionError::ProtocolViolation(
                    format!("expected peer_list, got {}", other.message_type()).into(),
                ));
            }
        };

        let own_key = self.public_key.read().await.clone();
        let mut report = DiscoveryReport::default();
        for descriptor in peers.iter().filter(|p| p.public_key != own_key || own_key.is_empty()) {
            match self.add_peer(descriptor.clone()).await {
                Ok(()) => report.added.push(descriptor.id.clone()),
                Err(e) => report.rejected.push((descriptor.id.clone(), e.to_string())),
            }
        }

        tracing::info!(
            parent: &self.span,
            discovered = peers.len(),
            added = report.added.len(),
            rejected = report.rejected.len(),
            "peer discovery complete"
        );
        Ok(report)
    }

    /// Admit a peer and handshake with it.
    ///
    /// # Errors
    ///
    /// [`SessionError::PeerRejected`] for a non-whitelisted peer,
    /// [`SessionError::CapacityExceeded`] when the peer set is full, and the
    /// handshake's failure otherwise. The peer is not added on error.
    pub async fn add_peer(&self, descriptor: PeerDescriptor) -> Result<()> {
        let result = self.admit_and_handshake(&descriptor).await;
        if let Err(e) = &result {
            self.rejected.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(parent: &self.span, peer = %descriptor.id, error = %e, "peer rejected");
        }
        result
    }

    async fn admit_and_handshake(&self, descriptor: &PeerDescriptor) -> Result<()> {
        let transport = self.bound_transport().await?;
        let _admission = self.admission.lock().await;

        let policy = self.policy.read().await.clone();
        if policy.enforces_whitelist() && !policy.allowed_peers.contains(&descriptor.id) {
            return Err(SessionError::PeerRejected(
                format!("peer {} is not whitelisted", descriptor.id).into(),
            ));
        }
        let replacing = self.peers.contains_key(&descriptor.id);
        if let Some(max) = policy.max_peers {
            if !replacing && self.peers.len() >= max {
                return Err(SessionError::CapacityExceeded(
                    format!("peer limit of {max} reached").into(),
                ));
            }
        }

        self.handshake(transport.as_ref(), descriptor, &policy).await?;

        self.peers
            .insert(descriptor.id.clone(), Peer::from_descriptor(descriptor));
        tracing::info!(
            parent: &self.span,
            peer = %descriptor.id,
            persistent = descriptor.persistent,
            "peer added"
        );
        Ok(())
    }

    async fn handshake(
        &self,
        transport: &dyn TransportClient,
        descriptor: &PeerDescriptor,
        policy: &MeshPolicy,
    ) -> Result<()> {
        let mut known: Vec<PeerDescriptor> = self.peers.iter().map(|p| p.descriptor()).collect();
        known.push(descriptor.clone());
        let mode = self.settings.mode.resolve(&known);

        let (role, peers) = if policy.persistent {
            known.retain(|p| p.id != descriptor.id);
            (HandshakeRole::Server, known)
        } else {
            (HandshakeRole::Client, Vec::new())
        };

        let request = Envelope::P2pHandshake {
            role,
            public_key: self.public_key.read().await.clone(),
            listen_port: self.settings.listen_port,
            mode,
            peers,
            peer_id: Some(descriptor.id.clone()),
            timestamp: unix_now(),
        };

        match transport.exchange(request, MESH_EXCHANGE_DEADLINE).await {
            Ok(Envelope::P2pHandshakeResponse {
                status, message, ..
            }) => {
                if status.as_deref() == Some("ok") {
                    Ok(())
                } else {
                    Err(SessionError::ProtocolViolation(
                        format!(
                            "handshake with {} rejected: {}",
                            descriptor.id,
                            message.unwrap_or_else(|| "no reason given".into())
                        )
                        .into(),
                    ))
                }
            }
            Ok(other) => Err(TransportError::UnexpectedResponse {
                expected: "p2p_handshake_response",
                actual: other.message_type().to_string(),
            }
            .into()),
            Err(e) => Err(e.into()),
        }
    }

    /// Drop a peer from the routing table
    pub fn remove_peer(&self, peer_id: &str) -> Option<Peer> {
        let removed = self.peers.remove(peer_id).map(|(_, p)| p);
        if removed.is_some() {
            tracing::info!(parent: &self.span, peer = peer_id, "peer removed");
        }
        removed
    }

    /// Snapshot of every peer, ordered by id
    pub fn peers(&self) -> Vec<Peer> {
        let mut all: Vec<_> = self.peers.iter().map(|p| p.value().clone()).collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    /// Look up one peer
    pub fn peer(&self, peer_id: &str) -> Option<Peer> {
        self.peers.get(peer_id).map(|p| p.clone())
    }

    /// Number of peers
    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Peers rejected since creation
    pub fn rejected_count(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    /// Apply a relay-pushed `mesh_config` envelope.
    ///
    /// Peers that fall outside a tightened whitelist are evicted.
    ///
    /// # Errors
    ///
    /// [`SessionError::ProtocolViolation`] for any other envelope type.
    pub async fn apply_mesh_config(&self, envelope: &Envelope) -> Result<()> {
        let Envelope::MeshConfig {
            auto_discovery,
            routing,
            allowed_peers,
            auto_approve,
            max_peers,
        } = envelope
        else {
            return Err(SessionError::ProtocolViolation(
                format!("expected mesh_config, got {}", envelope.message_type()).into(),
            ));
        };

        let policy = {
            let mut policy = self.policy.write().await;
            if let Some(v) = auto_discovery {
                policy.auto_discovery = *v;
            }
            if let Some(v) = routing {
                policy.routing = Some(v.clone());
            }
            if let Some(v) = allowed_peers {
                policy.allowed_peers = v.iter().cloned().collect();
            }
            if let Some(v) = auto_approve {
                policy.auto_approve = *v;
            }
            if let Some(v) = max_peers {
                policy.max_peers = Some(*v);
            }
            policy.clone()
        };

        if policy.enforces_whitelist() {
            let evicted: Vec<String> = self
                .peers
                .iter()
                .filter(|p| !policy.allowed_peers.contains(p.key()))
                .map(|p| p.key().clone())
                .collect();
            for id in evicted {
                self.peers.remove(&id);
                tracing::info!(parent: &self.span, peer = %id, "peer evicted by mesh policy");
            }
        }
        tracing::info!(
            parent: &self.span,
            enforce_whitelist = policy.enforces_whitelist(),
            max_peers = ?policy.max_peers,
            "mesh policy updated"
        );
        Ok(())
    }

    async fn bound_transport(&self) -> Result<Arc<dyn TransportClient>> {
        if !self.is_running() {
            return Err(SessionError::invalid_state("mesh is not running"));
        }
        self.transport
            .read()
            .await
            .clone()
            .ok_or_else(|| SessionError::unavailable("mesh has no transport"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{ScriptedTransport, mesh_token, ok_responder, peer, validator};
    use serde_json::json;
    use skylink_transport::TransportKind;

    async fn started(
        whitelist: serde_json::Value,
        transport: Arc<ScriptedTransport>,
        settings: MeshSettings,
    ) -> MeshManager {
        let claims = validator().validate(&mesh_token(whitelist)).await.unwrap();
        transport.connect().await.unwrap();
        let mesh = MeshManager::new(settings, Span::none());
        mesh.start(&claims, transport).await.unwrap();
        mesh
    }

    fn no_discovery() -> MeshSettings {
        MeshSettings {
            discover_on_start: false,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_whitelist_enforced() {
        let transport = ScriptedTransport::new(TransportKind::Datagram);
        let mesh = started(
            json!({"allowed_peers": ["p1"], "auto_approve": false}),
            transport.clone(),
            no_discovery(),
        )
        .await;

        mesh.add_peer(peer("p1", false)).await.unwrap();
        let err = mesh.add_peer(peer("p2", false)).await.unwrap_err();
        assert!(matches!(err, SessionError::PeerRejected(_)));
        assert!(err.to_string().contains("peer p2"));
        assert!(!err.is_transient());

        assert_eq!(mesh.peer_count(), 1);
        assert!(mesh.peer("p2").is_none());
        assert_eq!(mesh.rejected_count(), 1);
        // the rejected peer never saw a handshake
        assert_eq!(transport.count("p2p_handshake"), 1);
    }

    #[tokio::test]
    async fn test_capacity_exceeded() {
        let transport = ScriptedTransport::new(TransportKind::Datagram);
        let mesh = started(
            json!({"auto_approve": true, "max_peers": "2"}),
            transport,
            no_discovery(),
        )
        .await;

        mesh.add_peer(peer("p1", false)).await.unwrap();
        mesh.add_peer(peer("p2", false)).await.unwrap();
        let err = mesh.add_peer(peer("p3", false)).await.unwrap_err();
        assert!(matches!(err, SessionError::CapacityExceeded(_)));

        // re-handshaking a known peer does not count against capacity
        mesh.add_peer(peer("p2", true)).await.unwrap();
        assert!(mesh.peer("p2").unwrap().persistent);
        assert_eq!(mesh.peer_count(), 2);
    }

    #[tokio::test]
    async fn test_rejected_handshake_fails_only_that_peer() {
        let transport = ScriptedTransport::with_responder(TransportKind::Datagram, |req| match req {
            Envelope::P2pHandshake { peer_id, .. } if peer_id.as_deref() == Some("bad") => {
                Envelope::P2pHandshakeResponse {
                    status: Some("denied".into()),
                    message: Some("key mismatch".into()),
                    peer_id: peer_id.clone(),
                }
            }
            Envelope::PeerDiscovery { .. } => Envelope::PeerList {
                peers: vec![peer("good", false), peer("bad", false)],
            },
            other => ok_responder(other),
        });
        let mesh = started(json!({"auto_approve": true}), transport, MeshSettings::default()).await;

        assert!(mesh.is_running());
        assert_eq!(mesh.peer_count(), 1);
        assert!(mesh.peer("good").unwrap().connected);

        let report = mesh.discover().await.unwrap();
        assert_eq!(report.added, ["good"]);
        assert_eq!(report.rejected.len(), 1);
        assert!(report.rejected[0].1.contains("key mismatch"));
    }

    #[tokio::test]
    async fn test_handshake_mode_and_role() {
        let transport = ScriptedTransport::new(TransportKind::Datagram);
        let mesh = started(json!({"auto_approve": true}), transport.clone(), no_discovery()).await;

        mesh.add_peer(peer("p1", false)).await.unwrap();
        mesh.add_peer(peer("p2", true)).await.unwrap();

        let modes: Vec<_> = transport
            .requests()
            .into_iter()
            .filter_map(|e| match e {
                Envelope::P2pHandshake { mode, role, .. } => Some((mode, role)),
                _ => None,
            })
            .collect();
        assert_eq!(
            modes,
            [
                (HandshakeMode::ClientServer, HandshakeRole::Client),
                (HandshakeMode::ServerServer, HandshakeRole::Client),
            ]
        );
    }

    #[tokio::test]
    async fn test_start_requires_connected_transport() {
        let claims = validator()
            .validate(&mesh_token(json!({"auto_approve": true})))
            .await
            .unwrap();
        let mesh = MeshManager::new(MeshSettings::default(), Span::none());
        let err = mesh
            .start(&claims, ScriptedTransport::new(TransportKind::Datagram))
            .await
            .unwrap_err();
        assert!(err.is_transient());
        assert!(!mesh.is_running());
    }

    #[tokio::test]
    async fn test_mesh_config_tightens_whitelist() {
        let transport = ScriptedTransport::new(TransportKind::Datagram);
        let mesh = started(json!({"auto_approve": true}), transport, no_discovery()).await;
        mesh.add_peer(peer("p1", false)).await.unwrap();
        mesh.add_peer(peer("p2", false)).await.unwrap();

        mesh.apply_mesh_config(&Envelope::MeshConfig {
            auto_discovery: None,
            routing: Some("direct".into()),
            allowed_peers: Some(vec!["p2".into()]),
            auto_approve: Some(false),
            max_peers: None,
        })
        .await
        .unwrap();

        assert_eq!(mesh.peers().iter().map(|p| p.id.as_str()).collect::<Vec<_>>(), ["p2"]);
        assert_eq!(mesh.policy().await.routing.as_deref(), Some("direct"));
        assert!(
            mesh.apply_mesh_config(&Envelope::PeerList { peers: vec![] })
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn test_stop_clears_peers() {
        let transport = ScriptedTransport::new(TransportKind::Datagram);
        let mesh = started(json!({"auto_approve": true}), transport, no_discovery()).await;
        mesh.add_peer(peer("p1", false)).await.unwrap();

        mesh.stop().await;
        assert!(!mesh.is_running());
        assert_eq!(mesh.peer_count(), 0);
        assert!(matches!(
            mesh.add_peer(peer("p1", false)).await,
            Err(SessionError::InvalidState(_))
        ));
    }
}
