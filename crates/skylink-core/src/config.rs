//! Client configuration.
//!
//! Every field has a default, so an empty document is a valid configuration.
//! The binary loads this from TOML; the library only consumes it.

use crate::backoff::RetryConfig;
use crate::error::{Result, SessionError};
use crate::mesh::MeshSettings;
use crate::switch::SwitchConfig;
use serde::{Deserialize, Serialize};
use skylink_auth::{AuthType, KeySetConfig, ValidatorConfig};
use skylink_transport::{HandshakeMode, TransportKind, TransportSettings, TunnelSettings};
use std::path::PathBuf;
use std::time::Duration;

/// Skylink client configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Relay endpoint
    pub relay: RelayConfig,
    /// Token validation
    pub auth: AuthConfig,
    /// Transport selection
    pub transport: TransportSection,
    /// Auto-switch tuning
    pub switch: SwitchSection,
    /// Heartbeat cadence
    pub heartbeat: HeartbeatConfig,
    /// Retry policy
    pub retry: RetrySection,
    /// Mesh settings
    pub mesh: MeshSection,
    /// Logging
    pub logging: LoggingConfig,
}

/// Relay endpoint configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Relay host name or address
    #[serde(default = "default_host")]
    pub host: String,
    /// Per-transport ports
    #[serde(default)]
    pub ports: PortsConfig,
    /// Dial timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    /// TLS settings for key set discovery
    #[serde(default)]
    pub tls: TlsConfig,
}

/// Relay ports
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortsConfig {
    /// Datagram transport port
    #[serde(default = "default_datagram_port")]
    pub datagram: u16,
    /// Tunnel transport port
    #[serde(default = "default_tunnel_port")]
    pub tunnel: u16,
    /// RPC transport port
    #[serde(default = "default_rpc_port")]
    pub rpc: u16,
}

/// TLS settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlsConfig {
    /// Use TLS
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Verify server certificates
    #[serde(default = "default_true")]
    pub verify_cert: bool,
    /// Extra CA certificate (PEM)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_cert: Option<PathBuf>,
    /// Expected server name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_name: Option<String>,
}

/// Token validation configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// `jwt` or `keycloak`
    #[serde(rename = "type", default = "default_auth_type")]
    pub auth_type: String,
    /// Shared secret, raw or base64
    #[serde(default)]
    pub secret: String,
    /// Secret for tokens carrying the fallback key id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fallback_secret: Option<String>,
    /// Development only: accept tokens without checking signatures
    #[serde(default)]
    pub skip_validation: bool,
    /// Realm settings for `keycloak`
    #[serde(default)]
    pub keycloak: KeycloakConfig,
}

/// Realm settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct KeycloakConfig {
    /// Identity provider base URL
    pub server_url: String,
    /// Realm name
    pub realm: String,
    /// Expected audience
    pub client_id: String,
    /// Explicit key set URL
    #[serde(skip_serializing_if = "Option::is_none")]
    pub jwks_url: Option<String>,
}

/// Transport selection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportSection {
    /// Transport used first
    #[serde(default = "default_primary")]
    pub primary: String,
    /// Transport switched to when the primary fails
    #[serde(default = "default_fallback")]
    pub fallback: String,
    /// Tunnel public key; generated when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tunnel_public_key: Option<String>,
    /// Tunnel listen port
    #[serde(default = "default_tunnel_port")]
    pub tunnel_listen_port: u16,
    /// `auto`, `client-server` or `server-server`
    #[serde(default = "default_mode")]
    pub tunnel_mode: String,
}

/// Auto-switch tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SwitchSection {
    /// Run the controller
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Probe period
    #[serde(default = "default_probe_interval")]
    pub probe_interval_ms: u64,
    /// Probe deadline
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_ms: u64,
    /// Consecutive failures before switching
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// Primary must probe healthy this long before switching back
    #[serde(default = "default_recovery_window")]
    pub recovery_window_ms: u64,
}

/// Heartbeat cadence
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// Seconds between heartbeats
    #[serde(default = "default_heartbeat_interval")]
    pub interval_secs: u64,
}

/// Retry policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySection {
    /// Failed attempts tolerated in a row
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// First backoff
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,
    /// Backoff ceiling
    #[serde(default = "default_max_backoff")]
    pub max_backoff_secs: u64,
    /// Growth factor
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    /// Randomize backoff
    #[serde(default = "default_true")]
    pub jitter: bool,
}

/// Mesh settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeshSection {
    /// Port announced to peers
    #[serde(default = "default_tunnel_port")]
    pub listen_port: u16,
    /// Key announced to peers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,
    /// Discover peers when the mesh starts
    #[serde(default = "default_true")]
    pub discover_on_start: bool,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default values

fn default_host() -> String {
    "relay.local".to_string()
}

fn default_datagram_port() -> u16 {
    9090
}

fn default_tunnel_port() -> u16 {
    51820
}

fn default_rpc_port() -> u16 {
    9091
}

fn default_connect_timeout() -> u64 {
    30
}

fn default_true() -> bool {
    true
}

fn default_auth_type() -> String {
    "jwt".to_string()
}

fn default_primary() -> String {
    "datagram".to_string()
}

fn default_fallback() -> String {
    "tunnel".to_string()
}

fn default_mode() -> String {
    "auto".to_string()
}

fn default_probe_interval() -> u64 {
    3000
}

fn default_probe_timeout() -> u64 {
    2000
}

fn default_failure_threshold() -> u32 {
    3
}

fn default_recovery_window() -> u64 {
    30_000
}

fn default_heartbeat_interval() -> u64 {
    30
}

fn default_max_retries() -> u32 {
    3
}

fn default_initial_backoff() -> u64 {
    100
}

fn default_max_backoff() -> u64 {
    30
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            ports: PortsConfig::default(),
            connect_timeout_secs: default_connect_timeout(),
            tls: TlsConfig::default(),
        }
    }
}

impl Default for PortsConfig {
    fn default() -> Self {
        Self {
            datagram: default_datagram_port(),
            tunnel: default_tunnel_port(),
            rpc: default_rpc_port(),
        }
    }
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            verify_cert: true,
            ca_cert: None,
            server_name: None,
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            auth_type: default_auth_type(),
            secret: String::new(),
            fallback_secret: None,
            skip_validation: false,
            keycloak: KeycloakConfig::default(),
        }
    }
}

impl Default for TransportSection {
    fn default() -> Self {
        Self {
            primary: default_primary(),
            fallback: default_fallback(),
            tunnel_public_key: None,
            tunnel_listen_port: default_tunnel_port(),
            tunnel_mode: default_mode(),
        }
    }
}

impl Default for SwitchSection {
    fn default() -> Self {
        Self {
            enabled: true,
            probe_interval_ms: default_probe_interval(),
            probe_timeout_ms: default_probe_timeout(),
            failure_threshold: default_failure_threshold(),
            recovery_window_ms: default_recovery_window(),
        }
    }
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_heartbeat_interval(),
        }
    }
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_secs: default_max_backoff(),
            multiplier: default_multiplier(),
            jitter: true,
        }
    }
}

impl Default for MeshSection {
    fn default() -> Self {
        Self {
            listen_port: default_tunnel_port(),
            public_key: None,
            discover_on_start: true,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl ClientConfig {
    /// Validate configuration
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Config`] for out-of-range values and
    /// [`SessionError::UnsupportedConfiguration`] for unknown names.
    pub fn validate(&self) -> Result<()> {
        if self.relay.host.trim().is_empty() {
            return Err(SessionError::config("relay.host is empty"));
        }
        let ports = &self.relay.ports;
        if ports.datagram == 0 || ports.tunnel == 0 || ports.rpc == 0 {
            return Err(SessionError::config("relay ports must be non-zero"));
        }
        if self.relay.connect_timeout_secs == 0 {
            return Err(SessionError::config("relay.connect_timeout_secs must be positive"));
        }

        let auth_type = self.auth_type()?;
        if auth_type == AuthType::Jwt && self.auth.secret.is_empty() && !self.auth.skip_validation {
            return Err(SessionError::config("auth.secret is required for jwt auth"));
        }
        if auth_type == AuthType::Keycloak {
            let kc = &self.auth.keycloak;
            if kc.server_url.is_empty() || kc.realm.is_empty() || kc.client_id.is_empty() {
                return Err(SessionError::config(
                    "auth.keycloak requires server_url, realm and client_id",
                ));
            }
        }

        let (primary, fallback) = (self.primary_kind()?, self.fallback_kind()?);
        if primary == fallback {
            return Err(SessionError::config("primary and fallback transports must differ"));
        }
        self.tunnel_mode()?;

        let sw = &self.switch;
        if sw.probe_interval_ms == 0 || sw.probe_timeout_ms == 0 {
            return Err(SessionError::config("switch probe interval and timeout must be positive"));
        }
        if sw.failure_threshold == 0 {
            return Err(SessionError::config("switch.failure_threshold must be at least 1"));
        }
        if self.heartbeat.interval_secs == 0 {
            return Err(SessionError::config("heartbeat.interval_secs must be positive"));
        }
        if self.retry.multiplier < 1.0 {
            return Err(SessionError::config("retry.multiplier must be at least 1.0"));
        }

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            return Err(SessionError::config(format!(
                "invalid log level: {}. Must be one of: {}",
                self.logging.level,
                valid_log_levels.join(", ")
            )));
        }
        Ok(())
    }

    /// Parsed `auth.type`
    pub fn auth_type(&self) -> Result<AuthType> {
        Ok(self.auth.auth_type.parse::<AuthType>()?)
    }

    /// Parsed `transport.primary`
    pub fn primary_kind(&self) -> Result<TransportKind> {
        Ok(self.transport.primary.parse::<TransportKind>()?)
    }

    /// Parsed `transport.fallback`
    pub fn fallback_kind(&self) -> Result<TransportKind> {
        Ok(self.transport.fallback.parse::<TransportKind>()?)
    }

    /// Parsed `transport.tunnel_mode`
    pub fn tunnel_mode(&self) -> Result<HandshakeMode> {
        Ok(self.transport.tunnel_mode.parse::<HandshakeMode>()?)
    }

    /// Validator settings for the configured auth type
    ///
    /// # Errors
    ///
    /// Unknown auth type, or an unreadable CA certificate.
    pub fn validator_config(&self) -> Result<ValidatorConfig> {
        match self.auth_type()? {
            AuthType::Jwt => Ok(ValidatorConfig::SharedSecret {
                secret: self.auth.secret.clone(),
                fallback_secret: self.auth.fallback_secret.clone(),
                skip_validation: self.auth.skip_validation,
            }),
            AuthType::Keycloak => {
                let tls = &self.relay.tls;
                let ca_cert_pem = match &tls.ca_cert {
                    Some(path) if tls.enabled => Some(std::fs::read(path).map_err(|e| {
                        SessionError::config(format!("reading {}: {e}", path.display()))
                    })?),
                    _ => None,
                };
                let kc = &self.auth.keycloak;
                Ok(ValidatorConfig::KeySet(KeySetConfig {
                    server_url: kc.server_url.clone(),
                    realm: kc.realm.clone(),
                    client_id: kc.client_id.clone(),
                    jwks_url: kc.jwks_url.clone(),
                    verify_cert: tls.verify_cert,
                    ca_cert_pem,
                }))
            }
        }
    }

    /// Settings shared by every transport
    pub fn transport_settings(&self) -> Result<TransportSettings> {
        Ok(TransportSettings {
            host: self.relay.host.clone(),
            datagram_port: self.relay.ports.datagram,
            tunnel_port: self.relay.ports.tunnel,
            rpc_port: self.relay.ports.rpc,
            connect_timeout: Duration::from_secs(self.relay.connect_timeout_secs),
            tunnel: TunnelSettings {
                public_key: self.transport.tunnel_public_key.clone(),
                listen_port: self.transport.tunnel_listen_port,
                mode: self.tunnel_mode()?,
            },
        })
    }

    /// Auto-switch settings
    pub fn switch_config(&self) -> SwitchConfig {
        SwitchConfig {
            enabled: self.switch.enabled,
            probe_interval: Duration::from_millis(self.switch.probe_interval_ms),
            probe_timeout: Duration::from_millis(self.switch.probe_timeout_ms),
            failure_threshold: self.switch.failure_threshold,
            recovery_window: Duration::from_millis(self.switch.recovery_window_ms),
        }
    }

    /// Retry policy
    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_retries: self.retry.max_retries,
            initial_backoff: Duration::from_millis(self.retry.initial_backoff_ms),
            max_backoff: Duration::from_secs(self.retry.max_backoff_secs),
            multiplier: self.retry.multiplier,
            jitter: self.retry.jitter,
        }
    }

    /// Mesh settings
    pub fn mesh_settings(&self) -> Result<MeshSettings> {
        Ok(MeshSettings {
            listen_port: self.mesh.listen_port,
            public_key: self.mesh.public_key.clone(),
            mode: self.tunnel_mode()?,
            discover_on_start: self.mesh.discover_on_start,
        })
    }

    /// Heartbeat period
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat.interval_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn with_secret() -> ClientConfig {
        let mut config = ClientConfig::default();
        config.auth.secret = "s3cret".into();
        config
    }

    #[test]
    fn test_defaults() {
        let config = ClientConfig::default();
        assert_eq!(config.relay.host, "relay.local");
        assert_eq!(config.relay.ports.datagram, 9090);
        assert_eq!(config.relay.ports.tunnel, 51820);
        assert_eq!(config.relay.ports.rpc, 9091);
        assert_eq!(config.primary_kind().unwrap(), TransportKind::Datagram);
        assert_eq!(config.fallback_kind().unwrap(), TransportKind::Tunnel);
        assert_eq!(config.switch_config().failure_threshold, 3);
        assert_eq!(config.heartbeat_interval(), Duration::from_secs(30));
        assert_eq!(config.retry_config().initial_backoff, Duration::from_millis(100));
    }

    #[test]
    fn test_empty_document_is_default() {
        let config: ClientConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.auth.auth_type, "jwt");
        assert!(config.relay.tls.verify_cert);

        let partial: ClientConfig =
            serde_json::from_str(r#"{"relay": {"host": "r.example", "ports": {"rpc": 7000}}}"#)
                .unwrap();
        assert_eq!(partial.relay.host, "r.example");
        assert_eq!(partial.relay.ports.rpc, 7000);
        assert_eq!(partial.relay.ports.datagram, 9090);
    }

    #[test]
    fn test_validation() {
        assert!(with_secret().validate().is_ok());
        assert!(matches!(
            ClientConfig::default().validate(),
            Err(SessionError::Config(_))
        ));

        let mut config = with_secret();
        config.auth.auth_type = "saml".into();
        assert!(matches!(
            config.validate(),
            Err(SessionError::UnsupportedConfiguration(_))
        ));

        let mut config = with_secret();
        config.transport.fallback = "quic".into();
        assert!(config.validate().is_err());

        let mut config = with_secret();
        config.transport.tunnel_mode = "hub".into();
        assert!(matches!(
            config.validate(),
            Err(SessionError::UnsupportedConfiguration(_))
        ));

        let mut config = with_secret();
        config.logging.level = "loud".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validator_config() {
        let mut config = with_secret();
        config.auth.fallback_secret = Some("old".into());
        assert!(matches!(
            config.validator_config().unwrap(),
            ValidatorConfig::SharedSecret { fallback_secret: Some(_), .. }
        ));

        config.auth.auth_type = "keycloak".into();
        config.auth.keycloak = KeycloakConfig {
            server_url: "https://idp.test".into(),
            realm: "skylink".into(),
            client_id: "skylink-client".into(),
            jwks_url: None,
        };
        config.relay.tls.verify_cert = false;
        match config.validator_config().unwrap() {
            ValidatorConfig::KeySet(ks) => {
                assert_eq!(ks.issuer(), "https://idp.test/realms/skylink");
                assert!(!ks.verify_cert);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_transport_settings() {
        let mut config = with_secret();
        config.relay.host = "relay.example.net".into();
        config.transport.tunnel_mode = "server-server".into();
        let settings = config.transport_settings().unwrap();
        assert_eq!(settings.endpoint(TransportKind::Rpc), "relay.example.net:9091");
        assert_eq!(settings.tunnel.mode, HandshakeMode::ServerServer);
    }
}
