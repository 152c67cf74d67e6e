//! # Skylink Auth
//!
//! Bearer token validation and claims extraction for the Skylink relay client.
//!
//! This crate provides:
//! - Shared-secret (HMAC) validation with raw or base64 secrets and a
//!   kid-selected fallback secret
//! - Public-key (RSA) validation against a realm's JWKS endpoint, with
//!   issuer and audience checks
//! - A development-only unverified mode
//! - Typed [`Claims`] with lenient parsing of mesh, whitelist, network and
//!   transport policy
//!
//! ## Signing Disciplines
//!
//! | Mode | Algorithms | Key source | Leeway |
//! |------|------------|------------|--------|
//! | Shared secret | HS256 / HS384 / HS512 | configured secret(s) | 0s |
//! | Key set | RS256 / RS384 / RS512 | JWKS, cached 5 min | 60s |

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod claims;
pub mod error;
pub mod jwks;
pub mod jwt;
pub mod validator;

pub use claims::{Claims, ConnectionType, MeshConfig, NetworkConfig, PeerWhitelist, TransportConfig};
pub use error::{AuthError, Result};
pub use jwt::{bearer_token, mint_hs256};
pub use validator::{AuthType, ClaimValidator, FALLBACK_KEY_ID, KeySetConfig, ValidatorConfig};
