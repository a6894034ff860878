//! Tamper-evident reservation handles.
//!
//! A token is `base64url(id) "." base64url(mac)` where `mac` is a BLAKE3 keyed
//! hash of the raw id bytes. Clients only ever see tokens for reservations they
//! were shown, so a delete cannot be aimed at a guessed id.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use thiserror::Error;
use ulid::Ulid;

const KEY_CONTEXT: &str = "roombook 2024 reservation token v1";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TokenError {
    #[error("malformed token")]
    Malformed,
    #[error("token signature mismatch")]
    BadSignature,
}

#[derive(Clone)]
pub struct TokenSigner {
    key: [u8; 32],
}

impl std::fmt::Debug for TokenSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenSigner").finish_non_exhaustive()
    }
}

impl TokenSigner {
    /// Derive the MAC key from an operator-supplied secret.
    pub fn new(secret: &str) -> Self {
        Self {
            key: blake3::derive_key(KEY_CONTEXT, secret.as_bytes()),
        }
    }

    pub fn sign(&self, id: Ulid) -> String {
        let payload = id.to_bytes();
        let mac = blake3::keyed_hash(&self.key, &payload);
        format!(
            "{}.{}",
            URL_SAFE_NO_PAD.encode(payload),
            URL_SAFE_NO_PAD.encode(mac.as_bytes())
        )
    }

    pub fn verify(&self, token: &str) -> Result<Ulid, TokenError> {
        let (payload_b64, mac_b64) = token.trim().split_once('.').ok_or(TokenError::Malformed)?;
        let payload = URL_SAFE_NO_PAD
            .decode(payload_b64)
            .map_err(|_| TokenError::Malformed)?;
        let mac = URL_SAFE_NO_PAD
            .decode(mac_b64)
            .map_err(|_| TokenError::Malformed)?;
        let payload: [u8; 16] = payload.try_into().map_err(|_| TokenError::Malformed)?;
        let mac: [u8; 32] = mac.try_into().map_err(|_| TokenError::Malformed)?;

        // blake3::Hash equality is constant-time.
        if blake3::keyed_hash(&self.key, &payload) != blake3::Hash::from(mac) {
            return Err(TokenError::BadSignature);
        }
        Ok(Ulid::from_bytes(payload))
    }
}
