//! Client-side counters reported with every heartbeat.
//!
//! Each transport keeps cumulative traffic counters of its own. The collector
//! remembers the latest snapshot per transport kind and sums them, so traffic
//! is counted once even when the session moves back and forth between
//! transports.

use dashmap::DashMap;
use skylink_transport::{HeartbeatMetrics, TransportKind, TransportStats};
use std::sync::atomic::{AtomicI64, AtomicU8, AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

pub(crate) fn kind_code(kind: TransportKind) -> u8 {
    match kind {
        TransportKind::Datagram => 0,
        TransportKind::Tunnel => 1,
        TransportKind::Rpc => 2,
    }
}

pub(crate) fn kind_from_code(code: u8) -> TransportKind {
    match code {
        1 => TransportKind::Tunnel,
        2 => TransportKind::Rpc,
        _ => TransportKind::Datagram,
    }
}

pub(crate) fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}

/// Traffic and switch counters for one client
#[derive(Debug)]
pub struct ClientMetrics {
    traffic: DashMap<TransportKind, TransportStats>,
    mode: AtomicU8,
    switches: AtomicU64,
    last_switch: AtomicI64,
}

impl ClientMetrics {
    /// Collector starting on `mode`
    pub fn new(mode: TransportKind) -> Self {
        Self {
            traffic: DashMap::new(),
            mode: AtomicU8::new(kind_code(mode)),
            switches: AtomicU64::new(0),
            last_switch: AtomicI64::new(0),
        }
    }

    /// Record the latest cumulative counters of a transport
    pub fn observe(&self, kind: TransportKind, stats: TransportStats) {
        self.traffic.insert(kind, stats);
    }

    /// Point at `kind` without counting a switch, for rebinding an idle
    /// session
    pub fn set_mode(&self, kind: TransportKind) {
        self.mode.store(kind_code(kind), Ordering::SeqCst);
    }

    /// Record a completed transport switch
    pub fn record_switch(&self, to: TransportKind) {
        self.set_mode(to);
        self.switches.fetch_add(1, Ordering::Relaxed);
        self.last_switch.store(unix_now(), Ordering::Relaxed);
    }

    /// Transport currently carrying the session
    pub fn mode(&self) -> TransportKind {
        kind_from_code(self.mode.load(Ordering::SeqCst))
    }

    /// Completed switches
    pub fn switch_count(&self) -> u64 {
        self.switches.load(Ordering::Relaxed)
    }

    /// Unix seconds of the last switch
    pub fn last_switch(&self) -> Option<i64> {
        match self.last_switch.load(Ordering::Relaxed) {
            0 => None,
            ts => Some(ts),
        }
    }

    /// Totals across every transport seen so far
    pub fn traffic(&self) -> TransportStats {
        self.traffic.iter().fold(TransportStats::default(), |mut acc, entry| {
            let s = entry.value();
            acc.bytes_sent += s.bytes_sent;
            acc.bytes_received += s.bytes_received;
            acc.packets_sent += s.packets_sent;
            acc.packets_received += s.packets_received;
            acc.errors += s.errors;
            acc
        })
    }

    /// Heartbeat payload
    pub fn snapshot(&self, active_tunnels: usize, active_peers: usize) -> HeartbeatMetrics {
        let traffic = self.traffic();
        HeartbeatMetrics {
            bytes_sent: traffic.bytes_sent,
            bytes_received: traffic.bytes_received,
            packets_sent: traffic.packets_sent,
            packets_received: traffic.packets_received,
            active_tunnels: active_tunnels as u64,
            active_peers: active_peers as u64,
            transport_mode: self.mode().to_string(),
            last_switch: self.last_switch(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats(bytes: u64, packets: u64) -> TransportStats {
        TransportStats {
            bytes_sent: bytes,
            bytes_received: bytes * 2,
            packets_sent: packets,
            packets_received: packets,
            errors: 0,
        }
    }

    #[test]
    fn test_traffic_counted_once_per_transport() {
        let metrics = ClientMetrics::new(TransportKind::Datagram);
        metrics.observe(TransportKind::Datagram, stats(100, 1));
        metrics.observe(TransportKind::Datagram, stats(300, 3));
        metrics.observe(TransportKind::Tunnel, stats(50, 1));

        let snap = metrics.snapshot(2, 0);
        assert_eq!(snap.bytes_sent, 350);
        assert_eq!(snap.bytes_received, 700);
        assert_eq!(snap.packets_sent, 4);
        assert_eq!(snap.active_tunnels, 2);
        assert_eq!(snap.transport_mode, "datagram");
        assert_eq!(snap.last_switch, None);
    }

    #[test]
    fn test_switch_recorded() {
        let metrics = ClientMetrics::new(TransportKind::Datagram);
        metrics.record_switch(TransportKind::Tunnel);

        assert_eq!(metrics.mode(), TransportKind::Tunnel);
        assert_eq!(metrics.switch_count(), 1);
        assert!(metrics.last_switch().is_some());
        assert_eq!(metrics.snapshot(0, 0).transport_mode, "tunnel");
    }

    #[test]
    fn test_mode_change_without_switch() {
        let metrics = ClientMetrics::new(TransportKind::Datagram);
        metrics.set_mode(TransportKind::Rpc);

        assert_eq!(metrics.mode(), TransportKind::Rpc);
        assert_eq!(metrics.switch_count(), 0);
        assert!(metrics.last_switch().is_none());
    }

    #[test]
    fn test_kind_codes() {
        for kind in [TransportKind::Datagram, TransportKind::Tunnel, TransportKind::Rpc] {
            assert_eq!(kind_from_code(kind_code(kind)), kind);
        }
    }
}
