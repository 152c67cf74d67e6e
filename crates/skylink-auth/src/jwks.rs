//! RSA key set discovery and caching.

use crate::error::{AuthError, Result};
use crate::jwt::URL_SAFE_LENIENT;
use base64::Engine;
use serde::Deserialize;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

/// How long fetched keys are trusted before the set is fetched again
pub const KEY_SET_TTL: Duration = Duration::from_secs(5 * 60);

/// Default RSA public exponent when a JWK omits `e`
const DEFAULT_EXPONENT: [u8; 3] = [0x01, 0x00, 0x01];

/// A JSON Web Key Set document
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Jwks {
    /// Keys in document order
    #[serde(default)]
    pub keys: Vec<Jwk>,
}

/// A single JSON Web Key
#[derive(Debug, Clone, Deserialize)]
pub struct Jwk {
    /// Key identifier
    #[serde(default)]
    pub kid: Option<String>,
    /// Key type, only `RSA` is used
    pub kty: String,
    /// Modulus, base64url
    #[serde(default)]
    pub n: Option<String>,
    /// Exponent, base64url
    #[serde(default)]
    pub e: Option<String>,
}

/// Decoded RSA public key
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RsaKey {
    pub kid: Option<String>,
    pub n: Vec<u8>,
    pub e: Vec<u8>,
}

impl Jwk {
    fn to_rsa(&self) -> Option<RsaKey> {
        if self.kty != "RSA" {
            return None;
        }
        let n = URL_SAFE_LENIENT.decode(self.n.as_deref()?).ok()?;
        let e = match &self.e {
            Some(e) => URL_SAFE_LENIENT.decode(e).ok()?,
            None => DEFAULT_EXPONENT.to_vec(),
        };
        (!n.is_empty()).then(|| RsaKey {
            kid: self.kid.clone(),
            n,
            e,
        })
    }
}

impl Jwks {
    fn rsa_keys(&self) -> Vec<RsaKey> {
        let keys: Vec<RsaKey> = self.keys.iter().filter_map(Jwk::to_rsa).collect();
        if keys.len() != self.keys.len() {
            tracing::debug!(
                skipped = self.keys.len() - keys.len(),
                "ignoring non-RSA or undecodable keys"
            );
        }
        keys
    }
}

enum KeySource {
    Static,
    Remote { url: String, http: reqwest::Client },
}

struct Cached {
    keys: Vec<RsaKey>,
    fetched_at: Option<Instant>,
}

/// Key set with time-bounded cache
pub(crate) struct KeyStore {
    source: KeySource,
    cache: RwLock<Cached>,
}

impl KeyStore {
    /// Store over a fixed key set that is never refetched
    pub fn fixed(jwks: &Jwks) -> Self {
        Self {
            source: KeySource::Static,
            cache: RwLock::new(Cached {
                keys: jwks.rsa_keys(),
                fetched_at: None,
            }),
        }
    }

    /// Store that fetches from `url` on first use and after [`KEY_SET_TTL`]
    pub fn remote(url: String, http: reqwest::Client) -> Self {
        Self {
            source: KeySource::Remote { url, http },
            cache: RwLock::new(Cached {
                keys: Vec::new(),
                fetched_at: None,
            }),
        }
    }

    /// Fetch the key set now
    pub async fn refresh(&self) -> Result<usize> {
        let KeySource::Remote { url, http } = &self.source else {
            return Ok(self.cache.read().await.keys.len());
        };

        let response = http
            .get(url)
            .send()
            .await
            .map_err(|e| AuthError::KeySet(format!("fetch {url}: {e}").into()))?;
        if !response.status().is_success() {
            return Err(AuthError::KeySet(
                format!("fetch {url}: HTTP {}", response.status()).into(),
            ));
        }
        let jwks: Jwks = response
            .json()
            .await
            .map_err(|e| AuthError::KeySet(format!("decode key set: {e}").into()))?;

        let keys = jwks.rsa_keys();
        let count = keys.len();
        let mut cache = self.cache.write().await;
        cache.keys = keys;
        cache.fetched_at = Some(Instant::now());
        tracing::debug!(url = %url, keys = count, "key set refreshed");
        Ok(count)
    }

    fn is_stale(&self, cached: &Cached) -> bool {
        match (&self.source, cached.fetched_at) {
            (KeySource::Static, _) => false,
            (KeySource::Remote { .. }, None) => true,
            (KeySource::Remote { .. }, Some(at)) => at.elapsed() >= KEY_SET_TTL,
        }
    }

    /// Pick the key for `kid`: the matching key if any, else the first key
    pub async fn key_for(&self, kid: Option<&str>) -> Result<RsaKey> {
        let stale = {
            let cached = self.cache.read().await;
            self.is_stale(&cached)
        };
        if stale {
            self.refresh().await?;
        }

        let cached = self.cache.read().await;
        let by_kid = kid.and_then(|kid| {
            cached
                .keys
                .iter()
                .find(|k| k.kid.as_deref() == Some(kid))
        });
        by_kid
            .or_else(|| cached.keys.first())
            .cloned()
            .ok_or_else(|| AuthError::KeyNotFound("key set contains no RSA keys".into()))
    }
}
