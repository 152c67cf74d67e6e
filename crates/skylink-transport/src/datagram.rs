//! Primary transport: one JSON envelope per UDP datagram.
//!
//! Datagram loss shows up as an exchange timeout, which is exactly the
//! signal the auto-switch controller watches for when a network starts
//! blocking UDP.

use crate::envelope::Envelope;
use crate::link::{Link, LinkSlot};
use crate::transport::{
    TransportClient, TransportError, TransportKind, TransportResult, TransportStats,
};
use crate::transport::StatsCounter;
use async_trait::async_trait;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;
use tokio::net::UdpSocket;

/// Largest envelope datagram accepted
const MAX_DATAGRAM: usize = 64 * 1024;

/// Socket buffer size
const SOCKET_BUFFER: usize = 256 * 1024;

/// UDP transport to the relay's datagram port
pub struct DatagramTransport {
    relay: String,
    connect_timeout: Duration,
    link: LinkSlot<UdpSocket>,
    stats: StatsCounter,
}

impl DatagramTransport {
    /// Transport targeting `relay` (`host:port`)
    pub fn new(relay: impl Into<String>, connect_timeout: Duration) -> Self {
        Self {
            relay: relay.into(),
            connect_timeout,
            link: LinkSlot::default(),
            stats: StatsCounter::default(),
        }
    }

    /// Relay address this transport dials
    pub fn relay(&self) -> &str {
        &self.relay
    }
}

pub(crate) async fn resolve(target: &str, timeout: Duration) -> TransportResult<SocketAddr> {
    let mut addrs = tokio::time::timeout(timeout, tokio::net::lookup_host(target))
        .await
        .map_err(|_| TransportError::Timeout {
            operation: "resolve",
            deadline: timeout,
        })??;
    addrs
        .next()
        .ok_or_else(|| TransportError::ConnectionFailed(format!("no address for {target}").into()))
}

fn bind_socket(peer: SocketAddr) -> TransportResult<UdpSocket> {
    let (domain, local): (socket2::Domain, SocketAddr) = if peer.is_ipv4() {
        (socket2::Domain::IPV4, (Ipv4Addr::UNSPECIFIED, 0).into())
    } else {
        (socket2::Domain::IPV6, (Ipv6Addr::UNSPECIFIED, 0).into())
    };

    let bind_err = |e: std::io::Error| TransportError::ConnectionFailed(e.to_string().into());
    let socket = socket2::Socket::new(domain, socket2::Type::DGRAM, Some(socket2::Protocol::UDP))
        .map_err(bind_err)?;
    socket.set_recv_buffer_size(SOCKET_BUFFER).map_err(bind_err)?;
    socket.set_send_buffer_size(SOCKET_BUFFER).map_err(bind_err)?;
    socket.bind(&local.into()).map_err(bind_err)?;
    socket.set_nonblocking(true).map_err(bind_err)?;

    let std_socket: std::net::UdpSocket = socket.into();
    UdpSocket::from_std(std_socket).map_err(bind_err)
}

#[async_trait]
impl TransportClient for DatagramTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Datagram
    }

    async fn connect(&self) -> TransportResult<()> {
        self.link.ensure_disconnected()?;

        let peer = resolve(&self.relay, self.connect_timeout).await?;
        let socket = bind_socket(peer)?;
        socket.connect(peer).await?;

        self.link.install(Link::new(socket, peer)).await?;
        tracing::debug!(relay = %peer, "datagram transport connected");
        Ok(())
    }

    async fn disconnect(&self) -> TransportResult<()> {
        if let Some(link) = self.link.take().await {
            tracing::debug!(
                relay = %link.peer,
                uptime = ?link.established.elapsed(),
                "datagram transport disconnected"
            );
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.link.is_connected()
    }

    async fn exchange(&self, request: Envelope, deadline: Duration) -> TransportResult<Envelope> {
        let link = self.link.current().await?;
        let payload = request.to_bytes()?;
        let operation = request.message_type();

        let result = link
            .bounded(operation, deadline, async {
                let socket = link.io.lock().await;
                let mut buf = vec![0u8; MAX_DATAGRAM];

                // answers to requests that already timed out
                while let Ok(stale) = socket.try_recv(&mut buf) {
                    tracing::trace!(bytes = stale, "discarding stale datagram");
                }

                socket.send(&payload).await?;
                self.stats.record_send(payload.len());

                let len = socket.recv(&mut buf).await?;
                self.stats.record_recv(len);
                Envelope::from_bytes(&buf[..len])
            })
            .await;

        if result.is_err() {
            self.stats.record_error();
        }
        result
    }

    fn stats(&self) -> TransportStats {
        self.stats.snapshot()
    }
}
