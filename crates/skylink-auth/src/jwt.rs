//! Compact JWS handling: segment decoding, signature verification,
//! registered-claim checks and HS256 minting.
//!
//! Only the pieces the relay client needs are implemented. Tokens are
//! `header.payload.signature`, each segment base64url encoded. Padding is
//! tolerated on decode and never emitted on encode.

use crate::error::{AuthError, Result};
use base64::Engine;
use base64::alphabet;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use hmac::digest::KeyInit;
use hmac::{Hmac, Mac};
use ring::signature::{self, RsaPublicKeyComponents};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Sha256, Sha384, Sha512};
use std::time::{SystemTime, UNIX_EPOCH};

/// base64url decoder accepting both padded and unpadded input
pub(crate) const URL_SAFE_LENIENT: GeneralPurpose = GeneralPurpose::new(
    &alphabet::URL_SAFE,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// Signing algorithms understood by the validator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Algorithm {
    /// HMAC with SHA-256
    HS256,
    /// HMAC with SHA-384
    HS384,
    /// HMAC with SHA-512
    HS512,
    /// RSASSA-PKCS1-v1_5 with SHA-256
    RS256,
    /// RSASSA-PKCS1-v1_5 with SHA-384
    RS384,
    /// RSASSA-PKCS1-v1_5 with SHA-512
    RS512,
}

impl Algorithm {
    /// Parse the `alg` header value
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "HS256" => Some(Self::HS256),
            "HS384" => Some(Self::HS384),
            "HS512" => Some(Self::HS512),
            "RS256" => Some(Self::RS256),
            "RS384" => Some(Self::RS384),
            "RS512" => Some(Self::RS512),
            _ => None,
        }
    }

    /// Shared-secret family
    pub fn is_hmac(self) -> bool {
        matches!(self, Self::HS256 | Self::HS384 | Self::HS512)
    }

    /// Public-key family
    pub fn is_rsa(self) -> bool {
        matches!(self, Self::RS256 | Self::RS384 | Self::RS512)
    }
}

/// JOSE header fields the validator reads
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    /// Signing algorithm name
    #[serde(default)]
    pub alg: String,
    /// Key identifier
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kid: Option<String>,
    /// Token type, normally `JWT`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub typ: Option<String>,
}

/// A token split into its parts, signature not yet checked
#[derive(Debug, Clone)]
pub struct DecodedToken {
    /// Parsed header
    pub header: Header,
    /// Parsed payload object
    pub payload: Map<String, Value>,
    /// `header.payload` exactly as received, the signed bytes
    pub signing_input: String,
    /// Raw signature bytes
    pub signature: Vec<u8>,
}

fn decode_json_object(segment: &str, what: &'static str) -> Result<Map<String, Value>> {
    let bytes = URL_SAFE_LENIENT
        .decode(segment)
        .map_err(|e| AuthError::malformed(format!("{what} is not base64url: {e}")))?;
    match serde_json::from_slice::<Value>(&bytes) {
        Ok(Value::Object(map)) => Ok(map),
        Ok(_) => Err(AuthError::malformed(format!("{what} is not a JSON object"))),
        Err(e) => Err(AuthError::malformed(format!("{what} is not valid JSON: {e}"))),
    }
}

/// Split and decode a standard three-segment token.
///
/// # Errors
///
/// Returns [`AuthError::Malformed`] on a wrong segment count or an
/// undecodable segment.
pub fn decode(token: &str) -> Result<DecodedToken> {
    let mut parts = token.split('.');
    let (Some(h), Some(p), Some(s), None) = (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Err(AuthError::malformed(
            "token contains an invalid number of segments",
        ));
    };

    let header_map = decode_json_object(h, "header")?;
    let header: Header = serde_json::from_value(Value::Object(header_map))
        .map_err(|e| AuthError::malformed(format!("header fields: {e}")))?;
    let payload = decode_json_object(p, "payload")?;
    let signature = URL_SAFE_LENIENT
        .decode(s)
        .map_err(|e| AuthError::malformed(format!("signature is not base64url: {e}")))?;

    Ok(DecodedToken {
        header,
        payload,
        signing_input: format!("{h}.{p}"),
        signature,
    })
}

/// Parse a token for structure only, without any signature check.
///
/// Accepts the standard three-segment form, and a degraded two-segment form
/// whose first segment is the claims object. Used only by skip-validation.
pub fn decode_unverified(token: &str) -> Result<(Header, Map<String, Value>)> {
    let segments = token.split('.').count();
    match segments {
        3 => {
            let decoded = decode(token)?;
            Ok((decoded.header, decoded.payload))
        }
        2 => {
            let first = token.split('.').next().unwrap_or_default();
            let payload = decode_json_object(first, "claims segment")?;
            Ok((Header::default(), payload))
        }
        _ => Err(AuthError::malformed(
            "token contains an invalid number of segments",
        )),
    }
}

fn verify_mac<M: Mac + KeyInit>(key: &[u8], input: &[u8], sig: &[u8]) -> Result<()> {
    let mut mac = <M as KeyInit>::new_from_slice(key).map_err(|_| AuthError::InvalidSignature)?;
    mac.update(input);
    mac.verify_slice(sig).map_err(|_| AuthError::InvalidSignature)
}

fn sign_mac<M: Mac + KeyInit>(key: &[u8], input: &[u8]) -> Result<Vec<u8>> {
    let mut mac = <M as KeyInit>::new_from_slice(key)
        .map_err(|_| AuthError::unsupported("unusable HMAC key"))?;
    mac.update(input);
    Ok(mac.finalize().into_bytes().to_vec())
}

/// Verify an HMAC signature in constant time
pub fn verify_hmac(alg: Algorithm, key: &[u8], input: &[u8], sig: &[u8]) -> Result<()> {
    match alg {
        Algorithm::HS256 => verify_mac::<Hmac<Sha256>>(key, input, sig),
        Algorithm::HS384 => verify_mac::<Hmac<Sha384>>(key, input, sig),
        Algorithm::HS512 => verify_mac::<Hmac<Sha512>>(key, input, sig),
        other => Err(AuthError::UnsupportedAlgorithm(format!("{other:?}"))),
    }
}

/// Verify an RSASSA-PKCS1-v1_5 signature from raw modulus and exponent
pub fn verify_rsa(alg: Algorithm, n: &[u8], e: &[u8], input: &[u8], sig: &[u8]) -> Result<()> {
    let params: &'static signature::RsaParameters = match alg {
        Algorithm::RS256 => &signature::RSA_PKCS1_2048_8192_SHA256,
        Algorithm::RS384 => &signature::RSA_PKCS1_2048_8192_SHA384,
        Algorithm::RS512 => &signature::RSA_PKCS1_2048_8192_SHA512,
        other => return Err(AuthError::UnsupportedAlgorithm(format!("{other:?}"))),
    };
    let key = RsaPublicKeyComponents {
        n: strip_leading_zeros(n),
        e: strip_leading_zeros(e),
    };
    key.verify(params, input, sig)
        .map_err(|_| AuthError::InvalidSignature)
}

fn strip_leading_zeros(bytes: &[u8]) -> &[u8] {
    let first = bytes.iter().position(|b| *b != 0).unwrap_or(bytes.len());
    &bytes[first..]
}

/// Seconds since the Unix epoch
pub fn now_unix() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}

fn numeric_claim(payload: &Map<String, Value>, name: &'static str) -> Result<Option<i64>> {
    match payload.get(name) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => v
            .as_f64()
            .map(|f| Some(f as i64))
            .ok_or_else(|| AuthError::malformed(format!("{name} claim is not numeric"))),
    }
}

/// Check `exp`, `nbf` and optionally `iat` against `now` with `leeway` seconds
pub fn check_registered(
    payload: &Map<String, Value>,
    now: i64,
    leeway: i64,
    check_iat: bool,
) -> Result<()> {
    if let Some(exp) = numeric_claim(payload, "exp")? {
        if now > exp + leeway {
            return Err(AuthError::Expired);
        }
    }
    if let Some(nbf) = numeric_claim(payload, "nbf")? {
        if now + leeway < nbf {
            return Err(AuthError::NotYetValid);
        }
    }
    if check_iat {
        if let Some(iat) = numeric_claim(payload, "iat")? {
            if now + leeway < iat {
                return Err(AuthError::IssuedInFuture);
            }
        }
    }
    Ok(())
}

/// Extract the token from an `Authorization` header value
pub fn bearer_token(header_value: &str) -> Result<&str> {
    let token = header_value
        .strip_prefix("Bearer ")
        .ok_or_else(|| AuthError::InvalidHeader("expected Bearer scheme".into()))?
        .trim();
    if token.is_empty() {
        return Err(AuthError::InvalidHeader("empty bearer token".into()));
    }
    Ok(token)
}

/// Sign `claims` with HS256.
///
/// Development helper for issuing local tokens; the relay's issuer is the
/// normal source of tokens.
///
/// # Errors
///
/// Returns [`AuthError::Malformed`] if `claims` is not a JSON object.
pub fn mint_hs256(claims: &Value, secret: &[u8], kid: Option<&str>) -> Result<String> {
    if !claims.is_object() {
        return Err(AuthError::malformed("claims must be a JSON object"));
    }
    let header = Header {
        alg: "HS256".into(),
        kid: kid.map(str::to_owned),
        typ: Some("JWT".into()),
    };
    let header_json =
        serde_json::to_vec(&header).map_err(|e| AuthError::malformed(e.to_string()))?;
    let payload_json =
        serde_json::to_vec(claims).map_err(|e| AuthError::malformed(e.to_string()))?;

    let signing_input = format!(
        "{}.{}",
        URL_SAFE_NO_PAD.encode(header_json),
        URL_SAFE_NO_PAD.encode(payload_json)
    );
    let sig = sign_mac::<Hmac<Sha256>>(secret, signing_input.as_bytes())?;
    Ok(format!("{signing_input}.{}", URL_SAFE_NO_PAD.encode(sig)))
}
