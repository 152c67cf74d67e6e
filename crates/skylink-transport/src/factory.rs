//! Transport factory for creating relay transports from settings.

use crate::datagram::DatagramTransport;
use crate::rpc::RpcTransport;
use crate::transport::{TransportClient, TransportKind};
use crate::tunnel::{TunnelSettings, TunnelTransport};
use std::sync::Arc;
use std::time::Duration;

/// Where and how to reach the relay.
#[derive(Debug, Clone)]
pub struct TransportSettings {
    /// Relay host name or address
    pub host: String,
    /// Datagram port
    pub datagram_port: u16,
    /// Tunnel port
    pub tunnel_port: u16,
    /// RPC port
    pub rpc_port: u16,
    /// Dial timeout
    pub connect_timeout: Duration,
    /// Tunnel identity
    pub tunnel: TunnelSettings,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            datagram_port: 9090,
            tunnel_port: 51820,
            rpc_port: 9091,
            connect_timeout: Duration::from_secs(30),
            tunnel: TunnelSettings::default(),
        }
    }
}

impl TransportSettings {
    /// `host:port` for `kind`
    pub fn endpoint(&self, kind: TransportKind) -> String {
        let port = match kind {
            TransportKind::Datagram => self.datagram_port,
            TransportKind::Tunnel => self.tunnel_port,
            TransportKind::Rpc => self.rpc_port,
        };
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{port}", self.host)
        } else {
            format!("{}:{port}", self.host)
        }
    }
}

/// Builds transport clients by kind.
pub struct TransportFactory;

impl TransportFactory {
    /// Create an unconnected client of `kind`.
    ///
    /// # Examples
    /// ```no_run
    /// use skylink_transport::factory::{TransportFactory, TransportSettings};
    /// use skylink_transport::transport::TransportKind;
    ///
    /// let settings = TransportSettings::default();
    /// let primary = TransportFactory::create(TransportKind::Datagram, &settings);
    /// assert!(!primary.is_connected());
    /// ```
    #[must_use]
    pub fn create(kind: TransportKind, settings: &TransportSettings) -> Arc<dyn TransportClient> {
        let endpoint = settings.endpoint(kind);
        match kind {
            TransportKind::Datagram => {
                Arc::new(DatagramTransport::new(endpoint, settings.connect_timeout))
            }
            TransportKind::Tunnel => Arc::new(TunnelTransport::new(
                endpoint,
                settings.connect_timeout,
                settings.tunnel.clone(),
            )),
            TransportKind::Rpc => Arc::new(RpcTransport::new(endpoint, settings.connect_timeout)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_each_kind() {
        let settings = TransportSettings::default();
        for kind in [TransportKind::Datagram, TransportKind::Tunnel, TransportKind::Rpc] {
            let client = TransportFactory::create(kind, &settings);
            assert_eq!(client.kind(), kind);
            assert!(!client.is_connected());
        }
    }

    #[test]
    fn test_endpoints() {
        let mut settings = TransportSettings {
            host: "relay.example.net".into(),
            ..Default::default()
        };
        assert_eq!(
            settings.endpoint(TransportKind::Datagram),
            "relay.example.net:9090"
        );
        assert_eq!(
            settings.endpoint(TransportKind::Tunnel),
            "relay.example.net:51820"
        );
        settings.host = "::1".into();
        assert_eq!(settings.endpoint(TransportKind::Rpc), "[::1]:9091");
    }
}
