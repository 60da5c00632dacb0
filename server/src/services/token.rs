//! Bearer-token service — mint and verify the handshake token.
//!
//! DESIGN
//! ======
//! The token is `base64url(claims-json) "." base64url(hmac-sha256)`, signed
//! with the process-wide shared secret. It carries the participant identity
//! (subject, display name, body color) and an absolute expiry, so the
//! handshake needs no database round-trip to authenticate a socket.
//!
//! TRADE-OFFS
//! ==========
//! Symmetric signing keeps minting and verification on the same secret; the
//! short lifetime (≤ 15 minutes) bounds the damage of a leaked token.

use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use time::OffsetDateTime;
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

/// Identity and expiry carried inside a token.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenClaims {
    /// Participant id the token authenticates.
    pub sub: Uuid,
    /// Display name at mint time.
    pub name: String,
    /// Body color at mint time (7-char hex).
    pub color: String,
    /// Absolute expiry, seconds since the Unix epoch.
    pub exp: i64,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TokenError {
    #[error("malformed token")]
    Malformed,
    #[error("invalid token signature")]
    BadSignature,
    #[error("token expired")]
    Expired,
}

fn mac_for(secret: &str, payload: &[u8]) -> HmacSha256 {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("hmac accepts keys of any length");
    mac.update(payload);
    mac
}

/// Mint a token for `sub` that expires `ttl` from now.
#[must_use]
pub fn mint(secret: &str, sub: Uuid, name: &str, color: &str, ttl: Duration) -> String {
    let exp = OffsetDateTime::now_utc().unix_timestamp() + ttl.as_secs() as i64;
    sign(secret, &TokenClaims { sub, name: name.to_owned(), color: color.to_owned(), exp })
}

/// Sign explicit claims. Used by [`mint`] and by test tooling that needs
/// already-expired tokens.
#[must_use]
pub fn sign(secret: &str, claims: &TokenClaims) -> String {
    let payload = serde_json::to_vec(claims).expect("token claims serialize to json");
    let sig = mac_for(secret, &payload).finalize().into_bytes();
    format!("{}.{}", URL_SAFE_NO_PAD.encode(payload), URL_SAFE_NO_PAD.encode(sig))
}

/// Verify a token against the shared secret and the current clock.
///
/// # Errors
///
/// Returns [`TokenError`] when the token is malformed, carries a bad
/// signature, or has expired.
pub fn verify(secret: &str, token: &str) -> Result<TokenClaims, TokenError> {
    verify_at(secret, token, OffsetDateTime::now_utc().unix_timestamp())
}

fn verify_at(secret: &str, token: &str, now_unix: i64) -> Result<TokenClaims, TokenError> {
    let (payload_b64, sig_b64) = token.split_once('.').ok_or(TokenError::Malformed)?;
    let payload = URL_SAFE_NO_PAD
        .decode(payload_b64)
        .map_err(|_| TokenError::Malformed)?;
    let sig = URL_SAFE_NO_PAD
        .decode(sig_b64)
        .map_err(|_| TokenError::Malformed)?;

    mac_for(secret, &payload)
        .verify_slice(&sig)
        .map_err(|_| TokenError::BadSignature)?;

    let claims: TokenClaims = serde_json::from_slice(&payload).map_err(|_| TokenError::Malformed)?;
    if claims.exp < now_unix {
        return Err(TokenError::Expired);
    }
    Ok(claims)
}

#[cfg(test)]
#[path = "token_test.rs"]
mod tests;
