//! # Skylink Transport
//!
//! Relay transports for the Skylink session protocol.
//!
//! This crate provides:
//! - The [`TransportClient`] capability shared by every variant
//! - Datagram (UDP) primary transport
//! - Encrypted-tunnel fallback transport with an X25519 handshake
//! - RPC alternate transport over framed request/response records
//! - JSON wire envelopes and a length-prefixed frame codec
//!
//! Variants only differ in how envelopes reach the relay. Session semantics
//! (hello, auth, tunnels, heartbeats) are identical across them, which is
//! what lets the session engine swap transports under a live session.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod datagram;
pub mod envelope;
pub mod factory;
pub mod framing;
pub mod rpc;
pub mod transport;
pub mod tunnel;

mod link;

pub use datagram::DatagramTransport;
pub use envelope::{
    DEFAULT_FEATURES, Envelope, HandshakeMode, HandshakeRole, HeartbeatMetrics, PROTOCOL_VERSION,
    PeerDescriptor,
};
pub use factory::{TransportFactory, TransportSettings};
pub use rpc::RpcTransport;
pub use transport::{
    AuthResult, HelloResult, HeartbeatResult, TransportClient, TransportError, TransportKind,
    TransportResult, TransportStats, TunnelResult,
};
pub use tunnel::{TunnelSettings, TunnelTransport};
