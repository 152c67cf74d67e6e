//! Error types for the Skylink session engine.
//!
//! [`SessionError`] is the one error callers of the engine, the auto-switch
//! controller and the mesh manager ever see. Errors from the validator and the
//! transports are folded into it at the crate boundary.
//!
//! # Error Categories
//!
//! - **Transient**: the path to the relay failed ([`SessionError::TransportUnavailable`]).
//!   The auto-switch controller recovers from these by switching transports.
//! - **Policy**: the relay or the token said no (invalid token, authentication
//!   or tunnel rejection, peer whitelist, capacity). Surfaced to the caller, never retried.
//! - **Usage**: out-of-order calls and bad configuration.

use skylink_auth::AuthError;
use skylink_transport::TransportError;
use std::borrow::Cow;
use thiserror::Error;

/// Message carried when neither transport can hold the session
pub const TRANSPORTS_EXHAUSTED: &str = "all transports exhausted";

/// Errors surfaced by the session engine and its collaborators
#[derive(Debug, Error, Clone)]
pub enum SessionError {
    /// Token failed validation (signature, format, expiry, issuer, audience)
    #[error("invalid token: {0}")]
    InvalidToken(Cow<'static, str>),

    /// Relay rejected the credentials
    #[error("authentication failed: {0}")]
    AuthenticationFailed(Cow<'static, str>),

    /// Relay rejected the tunnel
    #[error("tunnel creation failed: {0}")]
    TunnelCreationFailed(Cow<'static, str>),

    /// Not connected, dial failure or deadline elapsed
    #[error("transport unavailable: {0}")]
    TransportUnavailable(Cow<'static, str>),

    /// Response of the wrong type or shape
    #[error("protocol violation: {0}")]
    ProtocolViolation(Cow<'static, str>),

    /// Peer is not on the token's whitelist
    #[error("peer rejected: {0}")]
    PeerRejected(Cow<'static, str>),

    /// Peer whitelist is full
    #[error("capacity exceeded: {0}")]
    CapacityExceeded(Cow<'static, str>),

    /// Unknown auth type, transport or mode string
    #[error("unsupported configuration: {0}")]
    UnsupportedConfiguration(Cow<'static, str>),

    /// Operation not allowed in the current session state
    #[error("invalid state: {0}")]
    InvalidState(Cow<'static, str>),

    /// Configuration failed validation
    #[error("configuration error: {0}")]
    Config(Cow<'static, str>),
}

impl SessionError {
    /// Returns true if switching transports may fix this
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, SessionError::TransportUnavailable(_))
    }

    /// Create an invalid state error
    #[must_use]
    pub fn invalid_state(context: impl Into<Cow<'static, str>>) -> Self {
        SessionError::InvalidState(context.into())
    }

    /// Create a transport unavailable error
    #[must_use]
    pub fn unavailable(context: impl Into<Cow<'static, str>>) -> Self {
        SessionError::TransportUnavailable(context.into())
    }

    /// Neither transport can carry the session
    #[must_use]
    pub fn exhausted() -> Self {
        SessionError::TransportUnavailable(Cow::Borrowed(TRANSPORTS_EXHAUSTED))
    }

    /// Whether this is the terminal "all transports exhausted" failure
    #[must_use]
    pub fn is_exhausted(&self) -> bool {
        matches!(self, SessionError::TransportUnavailable(msg) if msg == TRANSPORTS_EXHAUSTED)
    }

    /// Create a configuration error
    #[must_use]
    pub fn config(context: impl Into<Cow<'static, str>>) -> Self {
        SessionError::Config(context.into())
    }
}

impl From<AuthError> for SessionError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::UnsupportedConfiguration(msg) => SessionError::UnsupportedConfiguration(msg),
            other => SessionError::InvalidToken(other.to_string().into()),
        }
    }
}

impl From<TransportError> for SessionError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::NotConnected
            | TransportError::AlreadyConnected
            | TransportError::Io(_)
            | TransportError::Timeout { .. }
            | TransportError::ConnectionFailed(_) => {
                SessionError::TransportUnavailable(err.to_string().into())
            }
            TransportError::UnexpectedResponse { .. } | TransportError::Codec(_) => {
                SessionError::ProtocolViolation(err.to_string().into())
            }
            TransportError::Relay(msg) => SessionError::ProtocolViolation(msg.into()),
            TransportError::InvalidConfig(msg) => SessionError::UnsupportedConfiguration(msg),
        }
    }
}

/// Result type for session operations
pub type Result<T> = std::result::Result<T, SessionError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_transport_mapping() {
        let err: SessionError = TransportError::NotConnected.into();
        assert!(matches!(err, SessionError::TransportUnavailable(_)));
        assert!(err.is_transient());

        let err: SessionError = TransportError::Timeout {
            operation: "heartbeat",
            deadline: Duration::from_secs(5),
        }
        .into();
        assert!(err.to_string().contains("heartbeat timed out"));

        let err: SessionError = TransportError::UnexpectedResponse {
            expected: "hello_response",
            actual: "peer_list".into(),
        }
        .into();
        assert!(matches!(err, SessionError::ProtocolViolation(_)));
        assert!(!err.is_transient());

        let err: SessionError = TransportError::Relay("tenant suspended".into()).into();
        assert_eq!(err.to_string(), "protocol violation: tenant suspended");

        let err: SessionError = TransportError::InvalidConfig("unknown transport: x".into()).into();
        assert!(matches!(err, SessionError::UnsupportedConfiguration(_)));
    }

    #[test]
    fn test_auth_mapping() {
        let err: SessionError = AuthError::Expired.into();
        assert!(matches!(err, SessionError::InvalidToken(_)));

        let err: SessionError = AuthError::unsupported("unknown auth type: saml").into();
        assert!(matches!(err, SessionError::UnsupportedConfiguration(m) if m.contains("saml")));
    }
}
