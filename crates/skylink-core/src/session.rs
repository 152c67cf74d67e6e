//! Relay session protocol engine.
//!
//! The engine drives the hello → auth → tunnel → heartbeat exchange against
//! whichever transport it is currently bound to, and owns the session's
//! identity (client id, tenant id, connection type).
//!
//! # State Machine
//!
//! ```text
//! Disconnected ──connect──▶ Connected ──authenticate──▶ Authenticated ──create_tunnel──▶ Ready
//!       ▲                                                                                │
//!       └──────────── transports exhausted during a switch ◀──────────────────────────────┘
//!
//! close(): any state ──▶ Closed (terminal)
//! ```
//!
//! Out-of-order calls are rejected with [`SessionError::InvalidState`], never
//! queued. All session fields live behind one `RwLock`: mutations (connect,
//! authenticate, tunnel creation, transport switch) take it exclusively, and
//! heartbeats snapshot what they need under a shared guard and release it
//! before touching the network.

use crate::error::{Result, SessionError};
use crate::mesh::{MeshManager, MeshSettings};
use crate::metrics::ClientMetrics;
use crate::tunnel::{TunnelDescriptor, TunnelRegistry, TunnelStatus};
use skylink_auth::{ClaimValidator, Claims, ConnectionType};
use skylink_transport::{
    DEFAULT_FEATURES, HeartbeatResult, PROTOCOL_VERSION, TransportClient, TransportError,
    TransportKind,
};
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{Mutex, RwLock, broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::Span;

/// Capacity of the health signal channel
const HEALTH_CHANNEL_CAPACITY: usize = 64;

/// Session lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SessionState {
    /// No transport open
    Disconnected,
    /// Hello exchanged
    Connected,
    /// Relay accepted the token
    Authenticated,
    /// At least one tunnel created; heartbeats enabled
    Ready,
    /// Closed for good
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Disconnected => "disconnected",
            SessionState::Connected => "connected",
            SessionState::Authenticated => "authenticated",
            SessionState::Ready => "ready",
            SessionState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Snapshot of the session identity
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    /// Client id assigned by the relay
    pub client_id: String,
    /// Tenant from the token; empty when the token has none
    pub tenant_id: String,
    /// Set by authentication, fixed afterwards
    pub connection_type: Option<ConnectionType>,
    /// Transport carrying the session
    pub transport: TransportKind,
    /// Whether that transport is open
    pub connected: bool,
}

/// Outcome of one heartbeat, published for the auto-switch controller
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthSignal {
    /// Transport the heartbeat went over
    pub kind: TransportKind,
    /// Relay acknowledged it
    pub ok: bool,
    /// Failure detail
    pub reason: Option<String>,
}

struct Inner {
    state: SessionState,
    transport: Arc<dyn TransportClient>,
    client_id: String,
    tenant_id: String,
    connection_type: Option<ConnectionType>,
    // kept only to re-authenticate after a transport switch
    token: Option<String>,
    claims: Option<Arc<Claims>>,
}

impl Inner {
    fn reset_identity(&mut self) {
        self.client_id.clear();
        self.tenant_id.clear();
        self.connection_type = None;
        self.token = None;
        self.claims = None;
    }
}

/// Relay session engine
pub struct SessionEngine {
    inner: RwLock<Inner>,
    validator: Arc<ClaimValidator>,
    tunnels: Arc<TunnelRegistry>,
    mesh: Arc<MeshManager>,
    metrics: Arc<ClientMetrics>,
    health_tx: broadcast::Sender<HealthSignal>,
    shutdown_tx: watch::Sender<bool>,
    heartbeat_task: Mutex<Option<JoinHandle<()>>>,
    span: Span,
}

impl SessionEngine {
    /// Engine bound to `transport`, not yet connected
    pub fn new(transport: Arc<dyn TransportClient>, validator: Arc<ClaimValidator>, span: Span) -> Self {
        let mesh_span = tracing::info_span!(parent: &span, "mesh");
        let kind = transport.kind();
        let (health_tx, _) = broadcast::channel(HEALTH_CHANNEL_CAPACITY);
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            inner: RwLock::new(Inner {
                state: SessionState::Disconnected,
                transport,
                client_id: String::new(),
                tenant_id: String::new(),
                connection_type: None,
                token: None,
                claims: None,
            }),
            validator,
            tunnels: Arc::new(TunnelRegistry::new()),
            mesh: Arc::new(MeshManager::new(MeshSettings::default(), mesh_span)),
            metrics: Arc::new(ClientMetrics::new(kind)),
            health_tx,
            shutdown_tx,
            heartbeat_task: Mutex::new(None),
            span,
        }
    }

    /// Replace the mesh settings. Only meaningful before authentication.
    #[must_use]
    pub fn with_mesh_settings(mut self, settings: MeshSettings) -> Self {
        let mesh_span = tracing::info_span!(parent: &self.span, "mesh");
        self.mesh = Arc::new(MeshManager::new(settings, mesh_span));
        self
    }

    /// Current state
    pub async fn state(&self) -> SessionState {
        self.inner.read().await.state
    }

    /// Snapshot of the session identity
    pub async fn session(&self) -> Session {
        let inner = self.inner.read().await;
        Session {
            client_id: inner.client_id.clone(),
            tenant_id: inner.tenant_id.clone(),
            connection_type: inner.connection_type,
            transport: inner.transport.kind(),
            connected: inner.transport.is_connected(),
        }
    }

    /// Claims of the last successful authentication
    pub async fn claims(&self) -> Option<Arc<Claims>> {
        self.inner.read().await.claims.clone()
    }

    /// Transport the session is bound to
    pub async fn active_transport(&self) -> Arc<dyn TransportClient> {
        Arc::clone(&self.inner.read().await.transport)
    }

    /// Kind of the bound transport, without waiting on the session lock
    pub fn transport_kind(&self) -> TransportKind {
        self.metrics.mode()
    }

    /// Registered tunnels
    pub fn tunnels(&self) -> &Arc<TunnelRegistry> {
        &self.tunnels
    }

    /// Mesh manager
    pub fn mesh(&self) -> &Arc<MeshManager> {
        &self.mesh
    }

    /// Client metrics
    pub fn metrics(&self) -> &Arc<ClientMetrics> {
        &self.metrics
    }

    /// Heartbeat outcomes
    pub fn health_signals(&self) -> broadcast::Receiver<HealthSignal> {
        self.health_tx.subscribe()
    }

    /// Flips to `true` when the session closes
    pub fn closed_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    /// Open the bound transport and exchange hello.
    ///
    /// # Errors
    ///
    /// [`SessionError::InvalidState`] unless disconnected. Any transport or
    /// hello failure leaves the engine disconnected with the transport closed.
    pub async fn connect(&self) -> Result<()> {
        let mut inner = self.inner.write().await;
        match inner.state {
            SessionState::Disconnected => {}
            SessionState::Closed => return Err(SessionError::invalid_state("session is closed")),
            other => {
                return Err(SessionError::invalid_state(format!("already {other}")));
            }
        }

        let transport = Arc::clone(&inner.transport);
        if let Err(e) = open(transport.as_ref()).await {
            tracing::warn!(parent: &self.span, kind = %transport.kind(), error = %e, "connect failed");
            return Err(e);
        }

        inner.state = SessionState::Connected;
        tracing::info!(parent: &self.span, kind = %transport.kind(), "session connected");
        Ok(())
    }

    /// Validate `token`, present it to the relay and record the identity.
    ///
    /// Starts the mesh manager before returning when the token grants
    /// `p2p-mesh`; a mesh start failure fails the whole call.
    ///
    /// # Errors
    ///
    /// [`SessionError::InvalidState`] unless connected,
    /// [`SessionError::InvalidToken`] from validation,
    /// [`SessionError::AuthenticationFailed`] when the relay declines or
    /// answers with the wrong shape.
    pub async fn authenticate(&self, token: &str) -> Result<()> {
        let mut inner = self.inner.write().await;
        match inner.state {
            SessionState::Connected => {}
            SessionState::Authenticated | SessionState::Ready => {
                return Err(SessionError::invalid_state(
                    "already authenticated; re-authentication requires a new session",
                ));
            }
            SessionState::Disconnected => return Err(SessionError::invalid_state("not connected")),
            SessionState::Closed => return Err(SessionError::invalid_state("session is closed")),
        }

        let claims = self.validator.validate(token).await?;
        let transport = Arc::clone(&inner.transport);
        let client_id = present_token(transport.as_ref(), token, &claims).await?;
        let connection_type = claims.connection_type();

        if connection_type == ConnectionType::P2pMesh {
            if let Err(e) = self.mesh.start(&claims, Arc::clone(&transport)).await {
                tracing::warn!(parent: &self.span, error = %e, "mesh start failed");
                return Err(e);
            }
        }

        inner.client_id = client_id;
        inner.tenant_id = claims.tenant_id().to_string();
        inner.connection_type = Some(connection_type);
        inner.token = Some(token.to_string());
        inner.claims = Some(Arc::new(claims));
        inner.state = SessionState::Authenticated;

        tracing::info!(
            parent: &self.span,
            client_id = %inner.client_id,
            tenant = %inner.tenant_id,
            connection_type = %connection_type,
            "session authenticated"
        );
        Ok(())
    }

    /// Ask the relay for a tunnel and register it.
    ///
    /// # Errors
    ///
    /// [`SessionError::InvalidState`] before authentication or for an id that
    /// is already active, [`SessionError::TunnelCreationFailed`] when the relay
    /// declines.
    pub async fn create_tunnel(
        &self,
        tunnel_id: &str,
        local_port: u16,
        remote_host: &str,
        remote_port: u16,
    ) -> Result<TunnelDescriptor> {
        let mut inner = self.inner.write().await;
        if !matches!(inner.state, SessionState::Authenticated | SessionState::Ready) {
            return Err(SessionError::invalid_state(format!(
                "cannot create tunnel while {}",
                inner.state
            )));
        }
        if self.tunnels.is_active(tunnel_id) {
            return Err(SessionError::invalid_state(format!(
                "tunnel {tunnel_id} already exists"
            )));
        }

        let descriptor = TunnelDescriptor {
            tunnel_id: tunnel_id.to_string(),
            tenant_id: inner.tenant_id.clone(),
            local_port,
            remote_host: remote_host.to_string(),
            remote_port,
            status: TunnelStatus::Active,
            endpoint: None,
        };
        let descriptor = request_tunnel(inner.transport.as_ref(), descriptor).await?;

        self.tunnels.insert(descriptor.clone());
        inner.state = SessionState::Ready;
        tracing::info!(
            parent: &self.span,
            tunnel = %descriptor.tunnel_id,
            mapping = %descriptor.mapping(),
            "tunnel created"
        );
        Ok(descriptor)
    }

    /// Forget a tunnel locally. The relay protocol has no teardown message.
    pub async fn remove_tunnel(&self, tunnel_id: &str) -> Option<TunnelDescriptor> {
        let _guard = self.inner.write().await;
        let removed = self.tunnels.remove(tunnel_id);
        if removed.is_some() {
            tracing::info!(parent: &self.span, tunnel = tunnel_id, "tunnel removed");
        }
        removed
    }

    /// Send one heartbeat on the bound transport.
    ///
    /// # Errors
    ///
    /// [`SessionError::InvalidState`] unless ready; transport failures as
    /// [`SessionError::TransportUnavailable`]; a declined heartbeat as
    /// [`SessionError::ProtocolViolation`].
    pub async fn send_heartbeat(&self) -> Result<HeartbeatResult> {
        self.heartbeat_once().await.1
    }

    async fn heartbeat_once(&self) -> (TransportKind, Result<HeartbeatResult>) {
        let (transport, client_id, tenant_id) = {
            let inner = self.inner.read().await;
            if inner.state != SessionState::Ready {
                let err = SessionError::invalid_state(format!(
                    "heartbeat requires a ready session, state is {}",
                    inner.state
                ));
                return (inner.transport.kind(), Err(err));
            }
            (
                Arc::clone(&inner.transport),
                inner.client_id.clone(),
                inner.tenant_id.clone(),
            )
        };

        let kind = transport.kind();
        self.metrics.observe(kind, transport.stats());
        let metrics = self
            .metrics
            .snapshot(self.tunnels.active_count(), self.mesh.peer_count());

        let result = match transport.send_heartbeat(&client_id, &tenant_id, &metrics).await {
            Ok(hb) if hb.is_ok() => Ok(hb),
            Ok(hb) => Err(SessionError::ProtocolViolation(
                format!(
                    "heartbeat declined: {}",
                    hb.error.unwrap_or_else(|| hb.status.clone())
                )
                .into(),
            )),
            Err(e) => Err(e.into()),
        };
        self.metrics.observe(kind, transport.stats());
        (kind, result)
    }

    /// Spawn the heartbeat task.
    ///
    /// Sends a heartbeat every `interval` while the session is ready and
    /// publishes each outcome on [`SessionEngine::health_signals`]. An
    /// `interval_seconds` hint from the relay replaces the interval.
    ///
    /// # Errors
    ///
    /// [`SessionError::InvalidState`] if the session is closed or a heartbeat
    /// task is already running, [`SessionError::Config`] for a zero interval.
    pub async fn start_heartbeat(self: &Arc<Self>, interval: Duration) -> Result<()> {
        if interval.is_zero() {
            return Err(SessionError::config("heartbeat interval must be positive"));
        }
        if self.state().await == SessionState::Closed {
            return Err(SessionError::invalid_state("session is closed"));
        }
        let mut slot = self.heartbeat_task.lock().await;
        if slot.as_ref().is_some_and(|task| !task.is_finished()) {
            return Err(SessionError::invalid_state("heartbeat already running"));
        }

        let engine: Weak<Self> = Arc::downgrade(self);
        let mut shutdown = self.shutdown_tx.subscribe();
        let span = tracing::info_span!(parent: &self.span, "heartbeat");

        *slot = Some(tokio::spawn(async move {
            let mut period = interval;
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            tracing::debug!(parent: &span, ?period, "heartbeat started");

            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    _ = ticker.tick() => {
                        let Some(engine) = engine.upgrade() else { break };
                        if engine.state().await != SessionState::Ready {
                            continue;
                        }

                        let (kind, result) = engine.heartbeat_once().await;
                        let signal = match &result {
                            Ok(_) => HealthSignal { kind, ok: true, reason: None },
                            Err(e) => HealthSignal { kind, ok: false, reason: Some(e.to_string()) },
                        };
                        match &result {
                            Ok(_) => tracing::trace!(parent: &span, %kind, "heartbeat acknowledged"),
                            Err(e) => tracing::warn!(parent: &span, %kind, error = %e, "heartbeat failed"),
                        }
                        // no subscribers is fine
                        let _ = engine.health_tx.send(signal);

                        let hint = result
                            .ok()
                            .and_then(|hb| hb.interval_seconds)
                            .filter(|secs| *secs > 0)
                            .map(Duration::from_secs);
                        if let Some(next) = hint.filter(|next| *next != period) {
                            tracing::debug!(parent: &span, ?next, "relay adjusted heartbeat interval");
                            period = next;
                            ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
                            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                        }
                    }
                }
            }
            tracing::debug!(parent: &span, "heartbeat stopped");
        }));
        Ok(())
    }

    /// Move the session onto `target`.
    ///
    /// Disconnects the current transport, then connects `target` and rebuilds
    /// as much of the session as existed: hello, authentication with the
    /// cached token, and every registered tunnel. A tunnel that cannot be
    /// re-created is marked failed without failing the switch.
    ///
    /// If `target` cannot carry the session the original transport is brought
    /// back the same way and the switch error is returned. If that also fails
    /// the engine ends up disconnected and the error is
    /// [`SessionError::TransportUnavailable`] with [`crate::error::TRANSPORTS_EXHAUSTED`].
    ///
    /// # Errors
    ///
    /// See above; also [`SessionError::InvalidState`] when closed or when
    /// re-authentication yields a different connection type.
    pub async fn switch_transport(&self, target: Arc<dyn TransportClient>) -> Result<()> {
        let mut inner = self.inner.write().await;
        let prior = inner.state;
        if prior == SessionState::Closed {
            return Err(SessionError::invalid_state("session is closed"));
        }

        let previous = Arc::clone(&inner.transport);
        let (from, to) = (previous.kind(), target.kind());
        if let Err(e) = previous.disconnect().await {
            tracing::debug!(parent: &self.span, kind = %from, error = %e, "disconnect failed");
        }

        // nothing to carry over; rebinding is not a switch
        if prior == SessionState::Disconnected {
            inner.transport = target;
            self.metrics.set_mode(to);
            tracing::debug!(parent: &self.span, %from, %to, "idle session rebound");
            return Ok(());
        }

        match self.establish(&mut inner, Arc::clone(&target), prior).await {
            Ok(()) => {
                inner.transport = Arc::clone(&target);
                self.metrics.record_switch(to);
                self.mesh.rebind(target).await;
                tracing::info!(parent: &self.span, %from, %to, state = %inner.state, "transport switched");
                Ok(())
            }
            Err(switch_err) => {
                let _ = target.disconnect().await;
                tracing::warn!(parent: &self.span, %from, %to, error = %switch_err, "switch failed, reverting");

                match self.establish(&mut inner, Arc::clone(&previous), prior).await {
                    Ok(()) => {
                        self.mesh.rebind(previous).await;
                        Err(switch_err)
                    }
                    Err(revert_err) => {
                        let _ = previous.disconnect().await;
                        inner.state = SessionState::Disconnected;
                        inner.reset_identity();
                        self.mesh.stop().await;
                        tracing::error!(
                            parent: &self.span,
                            %from,
                            %to,
                            error = %revert_err,
                            "revert failed; session lost"
                        );
                        Err(SessionError::exhausted())
                    }
                }
            }
        }
    }

    async fn establish(
        &self,
        inner: &mut Inner,
        transport: Arc<dyn TransportClient>,
        prior: SessionState,
    ) -> Result<()> {
        open(transport.as_ref()).await?;

        if prior >= SessionState::Authenticated {
            let token = inner
                .token
                .clone()
                .ok_or_else(|| SessionError::invalid_state("no cached token to re-authenticate"))?;
            let claims = self.validator.validate(&token).await?;
            let connection_type = claims.connection_type();
            if Some(connection_type) != inner.connection_type {
                return Err(SessionError::invalid_state(format!(
                    "connection type changed to {connection_type} on re-authentication"
                )));
            }
            inner.client_id = present_token(transport.as_ref(), &token, &claims).await?;
            inner.claims = Some(Arc::new(claims));

            for tunnel in self.tunnels.list() {
                let id = tunnel.tunnel_id.clone();
                match request_tunnel(transport.as_ref(), tunnel).await {
                    Ok(replayed) => {
                        self.tunnels.insert(replayed);
                    }
                    Err(e) => {
                        self.tunnels.set_status(&id, TunnelStatus::Failed);
                        tracing::warn!(parent: &self.span, tunnel = %id, error = %e, "tunnel replay failed");
                    }
                }
            }
        }

        inner.state = match prior {
            SessionState::Connected => SessionState::Connected,
            _ if self.tunnels.is_empty() => SessionState::Authenticated,
            _ => SessionState::Ready,
        };
        Ok(())
    }

    /// Stop background work, close the transport and enter `Closed`.
    /// Closing twice is a no-op.
    ///
    /// # Errors
    ///
    /// Never fails today; the signature leaves room for transports whose
    /// close can.
    pub async fn close(&self) -> Result<()> {
        // wake background tasks before waiting on the session lock
        self.shutdown_tx.send_replace(true);

        let mut inner = self.inner.write().await;
        if inner.state == SessionState::Closed {
            return Ok(());
        }

        if let Some(task) = self.heartbeat_task.lock().await.take() {
            task.abort();
        }
        if let Err(e) = inner.transport.close().await {
            tracing::debug!(parent: &self.span, error = %e, "transport close failed");
        }
        self.mesh.stop().await;
        self.tunnels.clear();

        let from = inner.state;
        inner.state = SessionState::Closed;
        inner.reset_identity();
        tracing::info!(parent: &self.span, from = %from, "session closed");
        Ok(())
    }
}

impl fmt::Debug for SessionEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionEngine")
            .field("transport", &self.transport_kind())
            .field("tunnels", &self.tunnels.len())
            .finish_non_exhaustive()
    }
}

/// Connect `transport` and exchange hello; the transport is closed again on
/// any failure.
async fn open(transport: &dyn TransportClient) -> Result<()> {
    transport.connect().await?;

    let outcome = match transport.hello(PROTOCOL_VERSION, &default_features()).await {
        Ok(hello) if hello.is_ok() => Ok(()),
        Ok(hello) => Err(SessionError::ProtocolViolation(
            format!(
                "hello declined: {}",
                hello.error.unwrap_or_else(|| hello.status.clone())
            )
            .into(),
        )),
        Err(e) => Err(e.into()),
    };
    if outcome.is_err() {
        let _ = transport.disconnect().await;
    }
    outcome
}

fn default_features() -> Vec<String> {
    DEFAULT_FEATURES.iter().map(|f| (*f).to_string()).collect()
}

/// Auth exchange; returns the client id the relay assigned
async fn present_token(transport: &dyn TransportClient, token: &str, claims: &Claims) -> Result<String> {
    let result = transport
        .authenticate(token, claims.subject())
        .await
        .map_err(|e| match e {
            e if e.is_transient() => SessionError::from(e),
            TransportError::Relay(msg) => SessionError::AuthenticationFailed(msg.into()),
            other => SessionError::AuthenticationFailed(other.to_string().into()),
        })?;

    if !result.is_ok() {
        let message = result
            .error
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| "authentication failed".into());
        return Err(SessionError::AuthenticationFailed(message.into()));
    }
    Ok(result
        .client_id
        .filter(|id| !id.is_empty())
        .unwrap_or_else(|| claims.subject().to_string()))
}

/// Tunnel exchange; returns the descriptor as the relay accepted it
async fn request_tunnel(
    transport: &dyn TransportClient,
    mut descriptor: TunnelDescriptor,
) -> Result<TunnelDescriptor> {
    let result = transport
        .create_tunnel(
            &descriptor.tunnel_id,
            &descriptor.tenant_id,
            descriptor.local_port,
            &descriptor.remote_host,
            descriptor.remote_port,
        )
        .await
        .map_err(|e| match e {
            TransportError::Relay(msg) => SessionError::TunnelCreationFailed(msg.into()),
            other => SessionError::from(other),
        })?;

    if !result.is_ok() {
        let message = result
            .error
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| "tunnel creation failed".into());
        return Err(SessionError::TunnelCreationFailed(message.into()));
    }
    descriptor.status = TunnelStatus::Active;
    descriptor.endpoint = result.endpoint;
    Ok(descriptor)
}
