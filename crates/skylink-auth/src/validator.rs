//! Bearer token validation.
//!
//! A [`ClaimValidator`] is configured with exactly one signing discipline:
//!
//! ```text
//!   SharedSecret ── HS256/384/512 ── primary secret, optional fallback secret
//!   KeySet       ── RS256/384/512 ── keys fetched from the realm's JWKS endpoint
//! ```
//!
//! Either way the result is a typed [`Claims`] value; the validator never
//! hands out the raw payload.

use crate::claims::Claims;
use crate::error::{AuthError, Result};
use crate::jwks::{Jwks, KeyStore};
use crate::jwt::{self, Algorithm, DecodedToken};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tracing::Span;
use zeroize::Zeroizing;

/// Key id that routes a token to the fallback secret
pub const FALLBACK_KEY_ID: &str = "fallback-key";

/// Clock skew tolerated for key-set tokens
const KEY_SET_LEEWAY_SECS: i64 = 60;

/// Timeout for key set discovery requests
const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(30);

/// Auth type named in configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthType {
    /// Shared-secret HMAC tokens
    Jwt,
    /// RSA tokens from a Keycloak-style realm
    Keycloak,
}

impl FromStr for AuthType {
    type Err = AuthError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "jwt" => Ok(Self::Jwt),
            "keycloak" => Ok(Self::Keycloak),
            other => Err(AuthError::unsupported(format!(
                "unsupported auth type: {other}"
            ))),
        }
    }
}

/// Realm settings for public-key validation
#[derive(Debug, Clone, Default)]
pub struct KeySetConfig {
    /// Identity provider base URL
    pub server_url: String,
    /// Realm name
    pub realm: String,
    /// Expected audience
    pub client_id: String,
    /// Explicit JWKS URL, derived from the realm when absent
    pub jwks_url: Option<String>,
    /// Verify the discovery endpoint's certificate
    pub verify_cert: bool,
    /// Extra PEM root for the discovery endpoint
    pub ca_cert_pem: Option<Vec<u8>>,
}

impl KeySetConfig {
    /// Issuer tokens must carry: `{server_url}/realms/{realm}`
    pub fn issuer(&self) -> String {
        format!("{}/realms/{}", self.server_url.trim_end_matches('/'), self.realm)
    }

    /// Where the key set is fetched from
    pub fn discovery_url(&self) -> String {
        match &self.jwks_url {
            Some(url) if !url.is_empty() => url.clone(),
            _ => format!("{}/protocol/openid-connect/certs", self.issuer()),
        }
    }

    fn http_client(&self) -> Result<reqwest::Client> {
        let mut builder = reqwest::Client::builder()
            .timeout(DISCOVERY_TIMEOUT)
            .danger_accept_invalid_certs(!self.verify_cert);
        if let Some(pem) = &self.ca_cert_pem {
            let cert = reqwest::Certificate::from_pem(pem)
                .map_err(|e| AuthError::unsupported(format!("invalid CA certificate: {e}")))?;
            builder = builder.add_root_certificate(cert);
        }
        builder
            .build()
            .map_err(|e| AuthError::unsupported(format!("HTTP client: {e}")))
    }
}

/// Validator settings, one discipline per instance
#[derive(Debug, Clone)]
pub enum ValidatorConfig {
    /// HMAC tokens
    SharedSecret {
        /// Primary secret, raw or base64
        secret: String,
        /// Secret for tokens whose kid is [`FALLBACK_KEY_ID`]
        fallback_secret: Option<String>,
        /// Development only: parse tokens without checking signatures
        skip_validation: bool,
    },
    /// RSA tokens from a realm key set
    KeySet(KeySetConfig),
}

enum Discipline {
    SharedSecret {
        primary: Vec<Zeroizing<Vec<u8>>>,
        fallback: Vec<Zeroizing<Vec<u8>>>,
        skip_validation: bool,
    },
    KeySet {
        store: KeyStore,
        issuer: String,
        client_id: String,
    },
}

/// Verifies bearer tokens and produces typed claims
pub struct ClaimValidator {
    discipline: Discipline,
    span: Span,
}

impl fmt::Debug for ClaimValidator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClaimValidator")
            .field("mode", &self.mode_name())
            .finish_non_exhaustive()
    }
}

/// Secret candidates: base64-decoded form first (when it decodes to
/// something), then the raw bytes.
fn secret_candidates(secret: &str) -> Vec<Zeroizing<Vec<u8>>> {
    let mut out = Vec::with_capacity(2);
    if let Ok(decoded) = STANDARD.decode(secret) {
        if !decoded.is_empty() && decoded != secret.as_bytes() {
            out.push(Zeroizing::new(decoded));
        }
    }
    out.push(Zeroizing::new(secret.as_bytes().to_vec()));
    out
}

impl ClaimValidator {
    /// Build a validator, fetching the key set up front in key-set mode.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::UnsupportedConfiguration`] for unusable settings
    /// and [`AuthError::KeySet`] if the initial key set fetch fails.
    pub async fn new(config: ValidatorConfig, span: Span) -> Result<Self> {
        match config {
            ValidatorConfig::SharedSecret {
                secret,
                fallback_secret,
                skip_validation,
            } => Self::shared_secret(&secret, fallback_secret.as_deref(), skip_validation, span),
            ValidatorConfig::KeySet(ks) => {
                if ks.server_url.is_empty() || ks.realm.is_empty() || ks.client_id.is_empty() {
                    return Err(AuthError::unsupported(
                        "key-set mode requires server_url, realm and client_id",
                    ));
                }
                let url = ks.discovery_url();
                let store = KeyStore::remote(url.clone(), ks.http_client()?);
                let count = store.refresh().await?;
                tracing::info!(parent: &span, url = %url, keys = count, "key set loaded");
                Ok(Self {
                    discipline: Discipline::KeySet {
                        store,
                        issuer: ks.issuer(),
                        client_id: ks.client_id,
                    },
                    span,
                })
            }
        }
    }

    /// Shared-secret validator.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::UnsupportedConfiguration`] when the secret is
    /// empty and signatures are being checked.
    pub fn shared_secret(
        secret: &str,
        fallback_secret: Option<&str>,
        skip_validation: bool,
        span: Span,
    ) -> Result<Self> {
        if secret.is_empty() && !skip_validation {
            return Err(AuthError::unsupported("shared secret is empty"));
        }
        if skip_validation {
            tracing::warn!(
                parent: &span,
                "token signature validation is DISABLED; development use only"
            );
        }
        let fallback = fallback_secret
            .filter(|s| !s.is_empty())
            .map(secret_candidates)
            .unwrap_or_default();
        Ok(Self {
            discipline: Discipline::SharedSecret {
                primary: secret_candidates(secret),
                fallback,
                skip_validation,
            },
            span,
        })
    }

    /// Key-set validator over a fixed key set, no discovery
    pub fn with_key_set(config: &KeySetConfig, jwks: &Jwks, span: Span) -> Self {
        Self {
            discipline: Discipline::KeySet {
                store: KeyStore::fixed(jwks),
                issuer: config.issuer(),
                client_id: config.client_id.clone(),
            },
            span,
        }
    }

    /// Active discipline, for logs and diagnostics
    pub fn mode_name(&self) -> &'static str {
        match &self.discipline {
            Discipline::SharedSecret {
                skip_validation: true,
                ..
            } => "unverified",
            Discipline::SharedSecret { .. } => "shared-secret",
            Discipline::KeySet { .. } => "key-set",
        }
    }

    /// Validate `token` and return its claims.
    ///
    /// # Errors
    ///
    /// Any [`AuthError`]; callers treat all of them as an invalid token except
    /// [`AuthError::UnsupportedConfiguration`].
    pub async fn validate(&self, token: &str) -> Result<Claims> {
        let token = token.trim();
        let result = match &self.discipline {
            Discipline::SharedSecret {
                skip_validation: true,
                ..
            } => {
                let (_, payload) = jwt::decode_unverified(token)?;
                Claims::from_payload(&payload)
            }
            Discipline::SharedSecret {
                primary, fallback, ..
            } => self.validate_shared(token, primary, fallback),
            Discipline::KeySet {
                store,
                issuer,
                client_id,
            } => self.validate_key_set(token, store, issuer, client_id).await,
        };

        match &result {
            Ok(claims) => tracing::debug!(
                parent: &self.span,
                subject = claims.subject(),
                tenant = claims.tenant_id(),
                "token validated"
            ),
            Err(e) => tracing::debug!(parent: &self.span, error = %e, "token rejected"),
        }
        result
    }

    fn validate_shared(
        &self,
        token: &str,
        primary: &[Zeroizing<Vec<u8>>],
        fallback: &[Zeroizing<Vec<u8>>],
    ) -> Result<Claims> {
        let decoded = jwt::decode(token)?;
        let alg = Algorithm::from_name(&decoded.header.alg)
            .filter(|a| a.is_hmac())
            .ok_or_else(|| AuthError::UnsupportedAlgorithm(decoded.header.alg.clone()))?;

        let use_fallback =
            decoded.header.kid.as_deref() == Some(FALLBACK_KEY_ID) && !fallback.is_empty();
        if use_fallback {
            tracing::debug!(parent: &self.span, "token selects fallback secret");
        }
        let candidates = fallback
            .iter()
            .filter(|_| use_fallback)
            .chain(primary.iter());

        let mut last_err = AuthError::InvalidSignature;
        for key in candidates {
            match jwt::verify_hmac(
                alg,
                key,
                decoded.signing_input.as_bytes(),
                &decoded.signature,
            ) {
                Ok(()) => return finish(&decoded, 0, false),
                Err(e) => last_err = e,
            }
        }
        Err(last_err)
    }

    async fn validate_key_set(
        &self,
        token: &str,
        store: &KeyStore,
        issuer: &str,
        client_id: &str,
    ) -> Result<Claims> {
        let decoded = jwt::decode(token)?;
        let alg = Algorithm::from_name(&decoded.header.alg)
            .filter(|a| a.is_rsa())
            .ok_or_else(|| AuthError::UnsupportedAlgorithm(decoded.header.alg.clone()))?;

        let key = store.key_for(decoded.header.kid.as_deref()).await?;
        jwt::verify_rsa(
            alg,
            &key.n,
            &key.e,
            decoded.signing_input.as_bytes(),
            &decoded.signature,
        )?;

        let claims = finish(&decoded, KEY_SET_LEEWAY_SECS, true)?;

        let actual = claims.issuer().unwrap_or_default();
        if actual.trim_end_matches('/') != issuer.trim_end_matches('/') {
            return Err(AuthError::IssuerMismatch {
                expected: issuer.to_string(),
                actual: actual.to_string(),
            });
        }
        if !claims.audience().iter().any(|a| a == client_id) {
            return Err(AuthError::AudienceMismatch(client_id.to_string()));
        }
        Ok(claims)
    }
}

fn finish(decoded: &DecodedToken, leeway: i64, check_iat: bool) -> Result<Claims> {
    jwt::check_registered(&decoded.payload, jwt::now_unix(), leeway, check_iat)?;
    Claims::from_payload(&decoded.payload)
}
