//! ACME protocol integration.
//!
//! The session in [`session`] owns the issuance state machine; the wire
//! resources it exchanges live in [`resources`]; account identity and JWS
//! request signing live in [`account`] and [`jws`]; [`transport`] carries
//! signed requests to the ACME server.

pub mod account;
pub mod jws;
pub mod resources;
pub mod session;
pub mod transport;

pub use account::{AccountCredentials, AccountKey, JwsAlgorithm};
pub use resources::{
    AuthorizationResource, AuthorizationStatus, ChallengeResource, ChallengeStatus, Identifier,
    OrderResource, OrderStatus, Problem, DNS01,
};
pub use session::{AcmeSession, KeyAuthorization, SessionState};
pub use transport::{AcmeTransport, HttpAcmeTransport};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use sha2::{Digest, Sha256};

/// Base64 URL-safe encoding without padding, as used throughout RFC 8555.
pub(crate) fn b64url(data: impl AsRef<[u8]>) -> String {
    URL_SAFE_NO_PAD.encode(data)
}

/// DNS-01 TXT record value for a key authorization.
pub(crate) fn dns01_txt_digest(key_authorization: &str) -> String {
    b64url(Sha256::digest(key_authorization.as_bytes()))
}
