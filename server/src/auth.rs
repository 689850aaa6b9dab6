//! Bearer-token validation for realtime connections.
//!
//! Token issuance lives in the out-of-scope auth service; the session layer
//! only needs to verify. A token is `<user_id>.<hex hmac-sha256>` where the
//! signature covers the user id with the platform token secret. Verification
//! uses a constant-time comparison and never logs the secret.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("malformed token")]
    Malformed,
    #[error("invalid token signature")]
    InvalidSignature,
}

/// Validates bearer tokens against the platform secret.
#[derive(Clone)]
pub struct TokenVerifier {
    secret: Vec<u8>,
}

impl TokenVerifier {
    pub fn new(secret: &[u8]) -> Self {
        Self {
            secret: secret.to_vec(),
        }
    }

    /// Verifies `token` and returns the authenticated user id.
    pub fn verify(&self, token: &str) -> Result<String, AuthError> {
        let (user_id, sig_hex) = token.rsplit_once('.').ok_or(AuthError::Malformed)?;
        if user_id.is_empty() {
            return Err(AuthError::Malformed);
        }
        let sig = hex::decode(sig_hex).map_err(|_| AuthError::Malformed)?;

        let mut mac = HmacSha256::new_from_slice(&self.secret).map_err(|_| AuthError::Malformed)?;
        mac.update(user_id.as_bytes());
        mac.verify_slice(&sig)
            .map_err(|_| AuthError::InvalidSignature)?;
        Ok(user_id.to_string())
    }

    /// Issues a token for `user_id`. Used by tests and local tooling; the
    /// production issuer is the auth service.
    pub fn sign(&self, user_id: &str) -> String {
        let mut mac =
            HmacSha256::new_from_slice(&self.secret).expect("hmac accepts any key length");
        mac.update(user_id.as_bytes());
        let sig = hex::encode(mac.finalize().into_bytes());
        format!("{user_id}.{sig}")
    }
}
