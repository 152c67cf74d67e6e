//! Bookkeeping for tunnels opened through the relay.

use dashmap::DashMap;
use serde::Serialize;
use std::fmt;

/// Lifecycle of a registered tunnel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TunnelStatus {
    /// Accepted by the relay on the active transport
    Active,
    /// Could not be re-created after a transport switch
    Failed,
}

impl fmt::Display for TunnelStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TunnelStatus::Active => f.write_str("active"),
            TunnelStatus::Failed => f.write_str("failed"),
        }
    }
}

/// One tunnel as the relay accepted it
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TunnelDescriptor {
    /// Client-chosen id, unique per session
    pub tunnel_id: String,
    /// Owning tenant
    pub tenant_id: String,
    /// Local port on this client
    pub local_port: u16,
    /// Remote host behind the relay
    pub remote_host: String,
    /// Remote port
    pub remote_port: u16,
    /// Current status
    pub status: TunnelStatus,
    /// Relay-side endpoint, when the relay reported one
    pub endpoint: Option<String>,
}

impl TunnelDescriptor {
    /// `local_port -> remote_host:remote_port`
    pub fn mapping(&self) -> String {
        format!("{} -> {}:{}", self.local_port, self.remote_host, self.remote_port)
    }
}

/// Tunnels of one session, keyed by tunnel id
#[derive(Debug, Default)]
pub struct TunnelRegistry {
    tunnels: DashMap<String, TunnelDescriptor>,
}

impl TunnelRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tunnel, returning the descriptor it replaced
    pub fn insert(&self, descriptor: TunnelDescriptor) -> Option<TunnelDescriptor> {
        self.tunnels.insert(descriptor.tunnel_id.clone(), descriptor)
    }

    /// Look up a tunnel
    pub fn get(&self, tunnel_id: &str) -> Option<TunnelDescriptor> {
        self.tunnels.get(tunnel_id).map(|t| t.clone())
    }

    /// Whether an active tunnel holds `tunnel_id`
    pub fn is_active(&self, tunnel_id: &str) -> bool {
        self.tunnels
            .get(tunnel_id)
            .is_some_and(|t| t.status == TunnelStatus::Active)
    }

    /// Drop a tunnel
    pub fn remove(&self, tunnel_id: &str) -> Option<TunnelDescriptor> {
        self.tunnels.remove(tunnel_id).map(|(_, t)| t)
    }

    /// Change a tunnel's status. False if it is not registered.
    pub fn set_status(&self, tunnel_id: &str, status: TunnelStatus) -> bool {
        match self.tunnels.get_mut(tunnel_id) {
            Some(mut t) => {
                t.status = status;
                true
            }
            None => false,
        }
    }

    /// All tunnels, ordered by id
    pub fn list(&self) -> Vec<TunnelDescriptor> {
        let mut all: Vec<_> = self.tunnels.iter().map(|t| t.value().clone()).collect();
        all.sort_by(|a, b| a.tunnel_id.cmp(&b.tunnel_id));
        all
    }

    /// Number of registered tunnels
    pub fn len(&self) -> usize {
        self.tunnels.len()
    }

    /// True when no tunnel is registered
    pub fn is_empty(&self) -> bool {
        self.tunnels.is_empty()
    }

    /// Tunnels currently active
    pub fn active_count(&self) -> usize {
        self.tunnels
            .iter()
            .filter(|t| t.status == TunnelStatus::Active)
            .count()
    }

    /// Forget every tunnel
    pub fn clear(&self) {
        self.tunnels.clear();
    }
}
