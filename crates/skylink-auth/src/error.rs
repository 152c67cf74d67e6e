//! Token validation error types.

use std::borrow::Cow;
use thiserror::Error;

/// Errors raised while validating bearer tokens or reading their claims.
///
/// Everything except [`AuthError::UnsupportedConfiguration`] means the token
/// itself is unacceptable.
#[derive(Debug, Error)]
pub enum AuthError {
    /// Token is not a well-formed compact JWS
    #[error("malformed token: {0}")]
    Malformed(Cow<'static, str>),

    /// Header names an algorithm outside the configured family
    #[error("unexpected signing method: {0}")]
    UnsupportedAlgorithm(String),

    /// Signature did not verify against any candidate key
    #[error("signature is invalid")]
    InvalidSignature,

    /// `exp` is in the past
    #[error("token is expired")]
    Expired,

    /// `nbf` is in the future
    #[error("token is not valid yet")]
    NotYetValid,

    /// `iat` is in the future
    #[error("token used before issued")]
    IssuedInFuture,

    /// `iss` does not match the realm issuer
    #[error("invalid issuer: expected {expected}, got {actual}")]
    IssuerMismatch {
        /// Issuer derived from the realm configuration
        expected: String,
        /// Issuer carried by the token
        actual: String,
    },

    /// `aud` does not contain the configured client id
    #[error("invalid audience: {0} not present")]
    AudienceMismatch(String),

    /// `sub` is missing or not a string
    #[error("subject claim not found or invalid")]
    MissingSubject,

    /// No usable verification key for the token
    #[error("key not found: {0}")]
    KeyNotFound(Cow<'static, str>),

    /// Key set discovery failed
    #[error("key set unavailable: {0}")]
    KeySet(Cow<'static, str>),

    /// Authorization header did not carry a bearer token
    #[error("invalid authorization header: {0}")]
    InvalidHeader(Cow<'static, str>),

    /// Unknown auth type or unusable validator settings
    #[error("unsupported configuration: {0}")]
    UnsupportedConfiguration(Cow<'static, str>),
}

impl AuthError {
    /// Create a malformed-token error
    pub fn malformed(msg: impl Into<Cow<'static, str>>) -> Self {
        Self::Malformed(msg.into())
    }

    /// Create an unsupported-configuration error
    pub fn unsupported(msg: impl Into<Cow<'static, str>>) -> Self {
        Self::UnsupportedConfiguration(msg.into())
    }

    /// Whether the error stems from validator settings rather than the token
    pub fn is_configuration(&self) -> bool {
        matches!(self, Self::UnsupportedConfiguration(_))
    }

    /// Whether retrying later could succeed (key set fetch failures only)
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::KeySet(_))
    }
}

/// Result alias for token validation
pub type Result<T> = std::result::Result<T, AuthError>;
