//! In-process relay for integration testing
//!
//! Serves the relay protocol on all three transports at once:
//! - datagram: one JSON envelope per UDP datagram
//! - tunnel: TCP, a `tunnel_handshake` frame first, then framed envelopes
//! - rpc: TCP, framed `{id, method, params}` call records
//!
//! Behavior is steered through [`RelayControl`]: individual transports can be
//! silenced to simulate a blocked path, the next reply on a stream transport
//! can be held back, and auth, tunnel or heartbeat requests can be rejected
//! with a message.
//!
//! # Example
//!
//! ```no_run
//! use skylink_integration_tests::fixtures::FakeRelay;
//! use skylink_transport::{TransportFactory, TransportKind};
//!
//! # async fn demo() -> std::io::Result<()> {
//! let relay = FakeRelay::start().await?;
//! let transport = TransportFactory::create(TransportKind::Tunnel, &relay.settings());
//! relay.control().set_silent(TransportKind::Datagram, true);
//! # Ok(())
//! # }
//! ```

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use skylink_transport::framing::{read_frame, write_frame};
use skylink_transport::rpc::{RpcError, RpcRequest, RpcResponse};
use skylink_transport::{Envelope, PeerDescriptor, TransportKind, TransportSettings};
use std::collections::{HashMap, HashSet};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::task::JoinHandle;

/// Shared relay behavior and request log
#[derive(Default)]
pub struct RelayControl {
    silent: Mutex<HashSet<TransportKind>>,
    auth_rejection: Mutex<Option<String>>,
    tunnel_rejection: Mutex<Option<String>>,
    heartbeat_interval: Mutex<Option<u64>>,
    heartbeat_rejection: Mutex<Option<String>>,
    delays: Mutex<HashMap<TransportKind, Duration>>,
    peers: Mutex<Vec<PeerDescriptor>>,
    log: Mutex<Vec<(TransportKind, Envelope)>>,
    next_client: AtomicU64,
}

impl RelayControl {
    /// Stop (or resume) answering on `kind`
    pub fn set_silent(&self, kind: TransportKind, silent: bool) {
        let mut set = self.silent.lock().unwrap();
        if silent {
            set.insert(kind);
        } else {
            set.remove(&kind);
        }
    }

    /// Answer auth requests with an error status and `message`
    pub fn reject_auth(&self, message: Option<&str>) {
        *self.auth_rejection.lock().unwrap() = message.map(str::to_string);
    }

    /// Answer tunnel requests with an error status and `message`
    pub fn reject_tunnels(&self, message: Option<&str>) {
        *self.tunnel_rejection.lock().unwrap() = message.map(str::to_string);
    }

    /// Heartbeat interval hint returned to clients
    pub fn set_heartbeat_interval(&self, secs: Option<u64>) {
        *self.heartbeat_interval.lock().unwrap() = secs;
    }

    /// Answer heartbeats with an error status and `message`
    pub fn decline_heartbeats(&self, message: Option<&str>) {
        *self.heartbeat_rejection.lock().unwrap() = message.map(str::to_string);
    }

    /// Hold the next reply on a tunnel or rpc connection back for `delay`
    pub fn delay_next(&self, kind: TransportKind, delay: Duration) {
        self.delays.lock().unwrap().insert(kind, delay);
    }

    async fn pace(&self, kind: TransportKind) {
        let delay = self.delays.lock().unwrap().remove(&kind);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }

    /// Peers returned from discovery
    pub fn set_peers(&self, peers: Vec<PeerDescriptor>) {
        *self.peers.lock().unwrap() = peers;
    }

    /// Requests of `message_type` received on `kind`
    pub fn count(&self, kind: TransportKind, message_type: &str) -> usize {
        self.log
            .lock()
            .unwrap()
            .iter()
            .filter(|(k, e)| *k == kind && e.message_type() == message_type)
            .count()
    }

    /// Every request received on `kind`, in arrival order
    pub fn requests(&self, kind: TransportKind) -> Vec<Envelope> {
        self.log
            .lock()
            .unwrap()
            .iter()
            .filter(|(k, _)| *k == kind)
            .map(|(_, e)| e.clone())
            .collect()
    }

    fn is_silent(&self, kind: TransportKind) -> bool {
        self.silent.lock().unwrap().contains(&kind)
    }

    /// Record `request` and build the answer; `None` while `kind` is silent
    fn handle(&self, kind: TransportKind, request: Envelope) -> Option<Envelope> {
        self.log.lock().unwrap().push((kind, request.clone()));
        if self.is_silent(kind) {
            return None;
        }

        let response = match request {
            Envelope::Hello { .. } => Envelope::HelloResponse {
                status: Some("ok".into()),
                server_version: Some("1.0".into()),
                features: vec!["heartbeat".into(), "tunnels".into(), "mesh".into()],
                session_id: Some(format!("s-{}", self.next_client.load(Ordering::SeqCst))),
                error: None,
            },
            Envelope::Auth { .. } => match self.auth_rejection.lock().unwrap().clone() {
                Some(message) => Envelope::AuthResponse {
                    status: Some("error".into()),
                    client_id: None,
                    tenant_id: None,
                    error: Some(message),
                },
                None => Envelope::AuthResponse {
                    status: Some("ok".into()),
                    client_id: Some(format!(
                        "client-{}",
                        self.next_client.fetch_add(1, Ordering::SeqCst) + 1
                    )),
                    tenant_id: None,
                    error: None,
                },
            },
            Envelope::TunnelInfo {
                tunnel_id,
                local_port,
                ..
            } => match self.tunnel_rejection.lock().unwrap().clone() {
                Some(message) => Envelope::TunnelResponse {
                    status: Some("error".into()),
                    tunnel_id: Some(tunnel_id),
                    endpoint: None,
                    error: Some(message),
                },
                None => Envelope::TunnelResponse {
                    status: Some("ok".into()),
                    tunnel_id: Some(tunnel_id),
                    endpoint: Some(format!("relay.test:{local_port}")),
                    error: None,
                },
            },
            Envelope::Heartbeat { .. } => match self.heartbeat_rejection.lock().unwrap().clone() {
                Some(message) => Envelope::HeartbeatResponse {
                    status: Some("error".into()),
                    interval_seconds: None,
                    error: Some(message),
                },
                None => Envelope::HeartbeatResponse {
                    status: Some("ok".into()),
                    interval_seconds: *self.heartbeat_interval.lock().unwrap(),
                    error: None,
                },
            },
            Envelope::PeerDiscovery { .. } => Envelope::PeerList {
                peers: self.peers.lock().unwrap().clone(),
            },
            Envelope::P2pHandshake { peer_id, .. } => Envelope::P2pHandshakeResponse {
                status: Some("ok".into()),
                message: None,
                peer_id,
            },
            other => Envelope::Error {
                code: Some("unsupported".into()),
                message: format!("relay does not handle {}", other.message_type()),
            },
        };
        Some(response)
    }
}

/// Relay listening on loopback for all three transports
pub struct FakeRelay {
    /// Datagram endpoint
    pub datagram_addr: SocketAddr,
    /// Tunnel endpoint
    pub tunnel_addr: SocketAddr,
    /// RPC endpoint
    pub rpc_addr: SocketAddr,
    control: Arc<RelayControl>,
    tasks: Vec<JoinHandle<()>>,
}

impl FakeRelay {
    /// Bind ephemeral loopback ports and start serving
    ///
    /// # Errors
    ///
    /// Returns an error if any socket cannot be bound.
    pub async fn start() -> io::Result<Self> {
        let control = Arc::new(RelayControl::default());

        let udp = UdpSocket::bind("127.0.0.1:0").await?;
        let tunnel = TcpListener::bind("127.0.0.1:0").await?;
        let rpc = TcpListener::bind("127.0.0.1:0").await?;
        let (datagram_addr, tunnel_addr, rpc_addr) =
            (udp.local_addr()?, tunnel.local_addr()?, rpc.local_addr()?);

        let tasks = vec![
            tokio::spawn(serve_datagram(udp, Arc::clone(&control))),
            tokio::spawn(accept_loop(tunnel, Arc::clone(&control), TransportKind::Tunnel)),
            tokio::spawn(accept_loop(rpc, Arc::clone(&control), TransportKind::Rpc)),
        ];

        Ok(Self {
            datagram_addr,
            tunnel_addr,
            rpc_addr,
            control,
            tasks,
        })
    }

    /// Behavior switches and request log
    pub fn control(&self) -> &Arc<RelayControl> {
        &self.control
    }

    /// Transport settings pointing at this relay
    pub fn settings(&self) -> TransportSettings {
        TransportSettings {
            host: "127.0.0.1".into(),
            datagram_port: self.datagram_addr.port(),
            tunnel_port: self.tunnel_addr.port(),
            rpc_port: self.rpc_addr.port(),
            connect_timeout: Duration::from_secs(2),
            ..TransportSettings::default()
        }
    }
}

impl Drop for FakeRelay {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

async fn serve_datagram(socket: UdpSocket, control: Arc<RelayControl>) {
    let mut buf = vec![0u8; 64 * 1024];
    while let Ok((len, from)) = socket.recv_from(&mut buf).await {
        let Ok(request) = Envelope::from_bytes(&buf[..len]) else {
            continue;
        };
        if let Some(response) = control.handle(TransportKind::Datagram, request) {
            let bytes = serde_json::to_vec(&response).unwrap();
            let _ = socket.send_to(&bytes, from).await;
        }
    }
}

async fn accept_loop(listener: TcpListener, control: Arc<RelayControl>, kind: TransportKind) {
    while let Ok((stream, _)) = listener.accept().await {
        let control = Arc::clone(&control);
        tokio::spawn(async move {
            let _ = match kind {
                TransportKind::Rpc => serve_rpc(stream, control).await,
                _ => serve_tunnel(stream, control).await,
            };
        });
    }
}

async fn serve_tunnel(mut stream: TcpStream, control: Arc<RelayControl>) -> io::Result<()> {
    let first = Envelope::from_bytes(&read_frame(&mut stream).await?)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
    control.log.lock().unwrap().push((TransportKind::Tunnel, first.clone()));
    let verdict = match first {
        Envelope::TunnelHandshake { .. } => Envelope::TunnelHandshakeResponse {
            status: Some("ok".into()),
            message: None,
            server_public_key: Some(STANDARD.encode([7u8; 32])),
        },
        other => Envelope::TunnelHandshakeResponse {
            status: Some("error".into()),
            message: Some(format!("expected tunnel_handshake, got {}", other.message_type())),
            server_public_key: None,
        },
    };
    write_frame(&mut stream, &serde_json::to_vec(&verdict).unwrap()).await?;

    loop {
        let frame = read_frame(&mut stream).await?;
        let Ok(request) = Envelope::from_bytes(&frame) else {
            continue;
        };
        if let Some(response) = control.handle(TransportKind::Tunnel, request) {
            control.pace(TransportKind::Tunnel).await;
            write_frame(&mut stream, &serde_json::to_vec(&response).unwrap()).await?;
        }
    }
}

async fn serve_rpc(mut stream: TcpStream, control: Arc<RelayControl>) -> io::Result<()> {
    loop {
        let frame = read_frame(&mut stream).await?;
        let Ok(call) = serde_json::from_slice::<RpcRequest>(&frame) else {
            continue;
        };
        let Some(response) = control.handle(TransportKind::Rpc, call.params) else {
            continue;
        };
        control.pace(TransportKind::Rpc).await;
        let reply = match response {
            Envelope::Error { message, .. } => RpcResponse {
                id: call.id,
                result: None,
                error: Some(RpcError { code: 12, message }),
            },
            envelope => RpcResponse {
                id: call.id,
                result: Some(envelope),
                error: None,
            },
        };
        write_frame(&mut stream, &serde_json::to_vec(&reply).unwrap()).await?;
    }
}
