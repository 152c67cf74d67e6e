//! # Skylink Core
//!
//! Session engine for the Skylink relay client.
//!
//! This crate provides:
//! - [`SessionEngine`]: the hello → auth → tunnel → heartbeat state machine,
//!   bound to one transport at a time
//! - [`AutoSwitchController`]: health probing and failover between a primary
//!   and a fallback transport, with observers for completed switches
//! - [`MeshManager`]: peer admission, whitelist and capacity enforcement, and
//!   handshakes for `p2p-mesh` sessions
//! - [`TunnelRegistry`]: bookkeeping for tunnels opened through the relay
//! - [`ClientConfig`]: the client configuration file model
//!
//! ## Concurrency
//!
//! A session is shared by the caller, the heartbeat task and the auto-switch
//! task. Session fields sit behind one `RwLock`; mutations take it
//! exclusively and reads used for decisions share it. Switches are serialized
//! with a compare-and-swap flag, so a second switch request while one is in
//! flight is dropped rather than queued.
//!
//! ## Example
//!
//! ```no_run
//! use skylink_auth::ClaimValidator;
//! use skylink_core::SessionEngine;
//! use skylink_transport::{TransportFactory, TransportKind, TransportSettings};
//! use std::sync::Arc;
//!
//! # async fn run(token: &str) -> Result<(), Box<dyn std::error::Error>> {
//! let settings = TransportSettings::default();
//! let transport = TransportFactory::create(TransportKind::Datagram, &settings);
//! let validator = Arc::new(ClaimValidator::shared_secret("secret", None, false, tracing::info_span!("claims"))?);
//!
//! let engine = SessionEngine::new(transport, validator, tracing::info_span!("session"));
//! engine.connect().await?;
//! engine.authenticate(token).await?;
//! engine.create_tunnel("web", 8080, "example.org", 80).await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod backoff;
pub mod config;
pub mod error;
pub mod mesh;
pub mod metrics;
pub mod session;
pub mod switch;
pub mod tunnel;

#[cfg(test)]
mod testing;

pub use backoff::RetryConfig;
pub use config::ClientConfig;
pub use error::{Result, SessionError, TRANSPORTS_EXHAUSTED};
pub use mesh::{DiscoveryReport, MeshManager, MeshPolicy, MeshSettings, Peer};
pub use metrics::ClientMetrics;
pub use session::{HealthSignal, Session, SessionEngine, SessionState};
pub use switch::{
    AutoSwitchController, BoxError, FnObserver, SwitchConfig, SwitchEvent, SwitchFailure, SwitchObserver,
    SwitchOutcome, TransportHealth,
};
pub use tunnel::{TunnelDescriptor, TunnelRegistry, TunnelStatus};
