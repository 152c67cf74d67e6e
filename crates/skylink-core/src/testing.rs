//! In-memory transport and token helpers for unit tests.

use async_trait::async_trait;
use serde_json::json;
use skylink_auth::{ClaimValidator, mint_hs256};
use skylink_transport::{
    Envelope, PeerDescriptor, TransportClient, TransportError, TransportKind, TransportResult,
    TransportStats,
};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const SECRET: &str = "unit-test-shared-secret";

pub fn validator() -> Arc<ClaimValidator> {
    Arc::new(ClaimValidator::shared_secret(SECRET, None, false, tracing::Span::none()).unwrap())
}

pub fn token(claims: serde_json::Value) -> String {
    mint_hs256(&claims, SECRET.as_bytes(), None).unwrap()
}

pub fn client_server_token() -> String {
    token(json!({"sub": "svc-1", "tenant_id": "acme", "exp": 4102444800i64}))
}

pub fn mesh_token(whitelist: serde_json::Value) -> String {
    token(json!({
        "sub": "node-1",
        "tenant_id": "acme",
        "permissions": ["mesh:connect"],
        "mesh_config": {"auto_discovery": true},
        "peer_whitelist": whitelist,
        "exp": 4102444800i64
    }))
}

pub fn peer(id: &str, persistent: bool) -> PeerDescriptor {
    PeerDescriptor {
        id: id.into(),
        public_key: format!("{id}-key"),
        endpoint: Some(format!("{id}.mesh:51820")),
        allowed_ips: vec!["10.0.0.0/24".into()],
        persistent,
    }
}

type Responder = Box<dyn Fn(&Envelope) -> Envelope + Send + Sync>;

/// Transport answering from a closure, with switches for failure modes
pub struct ScriptedTransport {
    kind: TransportKind,
    connected: AtomicBool,
    pub fail_connect: AtomicBool,
    pub silent: AtomicBool,
    pub connect_delay: Mutex<Duration>,
    connects: AtomicU64,
    requests: Mutex<Vec<Envelope>>,
    responder: Responder,
}

impl ScriptedTransport {
    pub fn new(kind: TransportKind) -> Arc<Self> {
        Self::with_responder(kind, ok_responder)
    }

    pub fn with_responder(
        kind: TransportKind,
        responder: impl Fn(&Envelope) -> Envelope + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            kind,
            connected: AtomicBool::new(false),
            fail_connect: AtomicBool::new(false),
            silent: AtomicBool::new(false),
            connect_delay: Mutex::new(Duration::ZERO),
            connects: AtomicU64::new(0),
            requests: Mutex::new(Vec::new()),
            responder: Box::new(responder),
        })
    }

    pub fn requests(&self) -> Vec<Envelope> {
        self.requests.lock().unwrap().clone()
    }

    pub fn count(&self, message_type: &str) -> usize {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.message_type() == message_type)
            .count()
    }

    pub fn connects(&self) -> u64 {
        self.connects.load(Ordering::SeqCst)
    }
}

pub fn ok_responder(request: &Envelope) -> Envelope {
    match request {
        Envelope::Hello { .. } => Envelope::HelloResponse {
            status: Some("ok".into()),
            server_version: Some("1.0".into()),
            features: vec!["heartbeat".into()],
            session_id: None,
            error: None,
        },
        Envelope::Auth { .. } => Envelope::AuthResponse {
            status: Some("ok".into()),
            client_id: Some("c-1".into()),
            tenant_id: None,
            error: None,
        },
        Envelope::TunnelInfo { tunnel_id, .. } => Envelope::TunnelResponse {
            status: Some("ok".into()),
            tunnel_id: Some(tunnel_id.clone()),
            endpoint: None,
            error: None,
        },
        Envelope::Heartbeat { .. } => Envelope::HeartbeatResponse {
            status: Some("ok".into()),
            interval_seconds: None,
            error: None,
        },
        Envelope::P2pHandshake { peer_id, .. } => Envelope::P2pHandshakeResponse {
            status: Some("ok".into()),
            message: None,
            peer_id: peer_id.clone(),
        },
        Envelope::PeerDiscovery { .. } => Envelope::PeerList { peers: vec![] },
        other => Envelope::Error {
            code: None,
            message: format!("unexpected {}", other.message_type()),
        },
    }
}

#[async_trait]
impl TransportClient for ScriptedTransport {
    fn kind(&self) -> TransportKind {
        self.kind
    }

    async fn connect(&self) -> TransportResult<()> {
        let delay = *self.connect_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.fail_connect.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectionFailed("scripted refusal".into()));
        }
        if self.connected.swap(true, Ordering::SeqCst) {
            return Err(TransportError::AlreadyConnected);
        }
        self.connects.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> TransportResult<()> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn exchange(&self, request: Envelope, deadline: Duration) -> TransportResult<Envelope> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        if self.silent.load(Ordering::SeqCst) {
            return Err(TransportError::Timeout {
                operation: request.message_type(),
                deadline,
            });
        }
        let response = (self.responder)(&request);
        self.requests.lock().unwrap().push(request);
        Ok(response)
    }

    fn stats(&self) -> TransportStats {
        let packets = self.requests.lock().unwrap().len() as u64;
        TransportStats {
            packets_sent: packets,
            packets_received: packets,
            ..Default::default()
        }
    }
}
