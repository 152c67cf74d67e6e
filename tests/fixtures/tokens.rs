//! Token helpers signed with a shared test secret.

use serde_json::{Value, json};
use skylink_auth::{ClaimValidator, mint_hs256};
use std::sync::Arc;

/// Shared secret behind every fixture token
pub const SECRET: &str = "integration-shared-secret";

/// Far-future expiry (2100-01-01)
const EXP: i64 = 4_102_444_800;

/// Validator accepting fixture tokens
pub fn validator() -> Arc<ClaimValidator> {
    Arc::new(ClaimValidator::shared_secret(SECRET, None, false, tracing::Span::none()).unwrap())
}

/// Sign arbitrary claims
pub fn token(claims: Value) -> String {
    mint_hs256(&claims, SECRET.as_bytes(), None).unwrap()
}

/// `client-server` token for tenant `acme`
pub fn client_server_token() -> String {
    token(json!({
        "sub": "svc-1",
        "tenant_id": "acme",
        "connection_type": "client-server",
        "exp": EXP
    }))
}

/// `p2p-mesh` token with the given whitelist
pub fn mesh_token(whitelist: Value) -> String {
    token(json!({
        "sub": "node-1",
        "tenant_id": "acme",
        "permissions": ["mesh:connect"],
        "mesh_config": {"auto_discovery": true, "persistent": false},
        "peer_whitelist": whitelist,
        "exp": EXP
    }))
}
