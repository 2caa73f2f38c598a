//! JWS request signing (RFC 8555 §6.2).

use crate::acme::account::AccountKey;
use crate::acme::b64url;
use crate::error::{EngineError, EngineResult};
use serde::Serialize;

/// A signed JWS envelope in flattened JSON serialization.
#[derive(Debug, Clone, Serialize)]
pub struct JwsEnvelope {
    /// Base64url protected header.
    pub protected: String,
    /// Base64url payload. Empty for POST-as-GET requests.
    pub payload: String,
    /// Base64url signature over `protected.payload`.
    pub signature: String,
}

/// Sign an ACME request body.
///
/// Registered accounts identify themselves with `kid` (the account URL);
/// the public JWK header is only used before an account URL exists. A
/// `None` payload produces the empty-payload POST-as-GET form.
pub fn sign(
    key: &AccountKey,
    kid: Option<&str>,
    nonce: &str,
    url: &str,
    payload: Option<&serde_json::Value>,
) -> EngineResult<JwsEnvelope> {
    let protected = match kid {
        Some(kid) => serde_json::json!({
            "alg": key.algorithm().as_str(),
            "kid": kid,
            "nonce": nonce,
            "url": url,
        }),
        None => serde_json::json!({
            "alg": key.algorithm().as_str(),
            "jwk": key.public_jwk()?,
            "nonce": nonce,
            "url": url,
        }),
    };

    let protected_b64 = b64url(
        serde_json::to_string(&protected)
            .map_err(|err| EngineError::Crypto(err.to_string()))?,
    );
    let payload_b64 = match payload {
        Some(value) => b64url(
            serde_json::to_string(value).map_err(|err| EngineError::Crypto(err.to_string()))?,
        ),
        None => String::new(),
    };

    let signing_input = format!("{}.{}", protected_b64, payload_b64);
    let signature = key.sign(signing_input.as_bytes())?;

    Ok(JwsEnvelope {
        protected: protected_b64,
        payload: payload_b64,
        signature: b64url(signature),
    })
}
