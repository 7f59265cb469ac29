//! Request signing for the internal bot plane.
//!
//! Both sides share one bot token. A request carries a unix timestamp, a
//! random nonce, the hex SHA-256 of the token and the hex HMAC-SHA-256 of
//! `"<ts>:<nonce>:<hash>"` keyed by the token. There is no nonce store:
//! the 300 s window plus the signature over the nonce is the replay guard.

use axum::http::HeaderMap;
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use thiserror::Error;

use crate::config::Secret;

pub const TIMESTAMP_HEADER: &str = "X-Bot-Timestamp";
pub const NONCE_HEADER: &str = "X-Bot-Nonce";
pub const TOKEN_HASH_HEADER: &str = "X-Bot-Token-Hash";
pub const SIGNATURE_HEADER: &str = "X-Bot-Signature";

pub const REPLAY_WINDOW_SECS: i64 = 300;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RpcAuthError {
    #[error("missing {0} header")]
    MissingHeader(&'static str),

    #[error("internal rpc token is not configured")]
    NotConfigured,

    #[error("malformed timestamp")]
    MalformedTimestamp,

    #[error("timestamp outside the {REPLAY_WINDOW_SECS}s window")]
    Expired,

    #[error("token hash mismatch")]
    TokenMismatch,

    #[error("bad signature")]
    BadSignature,
}

/// Header values for one signed request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedHeaders {
    pub timestamp: String,
    pub nonce: String,
    pub token_hash: String,
    pub signature: String,
}

impl SignedHeaders {
    pub fn pairs(&self) -> [(&'static str, &str); 4] {
        [
            (TIMESTAMP_HEADER, self.timestamp.as_str()),
            (NONCE_HEADER, self.nonce.as_str()),
            (TOKEN_HASH_HEADER, self.token_hash.as_str()),
            (SIGNATURE_HEADER, self.signature.as_str()),
        ]
    }
}

pub fn token_hash(token: &Secret) -> String { hex::encode(Sha256::digest(token.expose().as_bytes())) }

fn mac(token: &Secret) -> Option<Hmac<Sha256>> { Hmac::<Sha256>::new_from_slice(token.expose().as_bytes()).ok() }

fn message(timestamp: &str, nonce: &str, hash: &str) -> String { format!("{}:{}:{}", timestamp, nonce, hash) }

pub fn sign(token: &Secret, timestamp: i64, nonce: &str) -> SignedHeaders {
    let timestamp = timestamp.to_string();
    let hash = token_hash(token);
    let signature = match mac(token) {
        Some(mut mac) => {
            mac.update(message(&timestamp, nonce, &hash).as_bytes());
            hex::encode(mac.finalize().into_bytes())
        }
        None => String::new(),
    };
    SignedHeaders { timestamp, nonce: nonce.to_string(), token_hash: hash, signature }
}

pub fn new_nonce() -> String {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

fn header<'a>(headers: &'a HeaderMap, name: &'static str) -> Result<&'a str, RpcAuthError> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or(RpcAuthError::MissingHeader(name))
}

/// Checks the four signing headers against the shared token at unix time
/// `now`.
pub fn verify(token: &Secret, headers: &HeaderMap, now: i64) -> Result<(), RpcAuthError> {
    let timestamp = header(headers, TIMESTAMP_HEADER)?;
    let nonce = header(headers, NONCE_HEADER)?;
    let hash = header(headers, TOKEN_HASH_HEADER)?;
    let signature = header(headers, SIGNATURE_HEADER)?;
    if token.is_empty() {
        return Err(RpcAuthError::NotConfigured);
    }

    let ts: i64 = timestamp.parse().map_err(|_| RpcAuthError::MalformedTimestamp)?;
    if (now - ts).abs() > REPLAY_WINDOW_SECS {
        return Err(RpcAuthError::Expired);
    }

    let expected_hash = token_hash(token);
    if !bool::from(expected_hash.as_bytes().ct_eq(hash.to_ascii_lowercase().as_bytes())) {
        return Err(RpcAuthError::TokenMismatch);
    }

    let provided = hex::decode(signature).map_err(|_| RpcAuthError::BadSignature)?;
    let mut mac = mac(token).ok_or(RpcAuthError::BadSignature)?;
    mac.update(message(timestamp, nonce, hash).as_bytes());
    mac.verify_slice(&provided).map_err(|_| RpcAuthError::BadSignature)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn headers(signed: &SignedHeaders) -> HeaderMap {
        let mut map = HeaderMap::new();
        for (name, value) in signed.pairs() {
            map.insert(name, HeaderValue::from_str(value).unwrap());
        }
        map
    }

    #[test]
    fn test_signed_request_verifies() {
        let token = Secret::new("bot-token");
        let signed = sign(&token, 1_700_000_000, &new_nonce());
        assert_eq!(verify(&token, &headers(&signed), 1_700_000_100), Ok(()));
    }

    #[test]
    fn test_replay_window() {
        let token = Secret::new("bot-token");
        let signed = sign(&token, 1_700_000_000, "abcd");
        assert_eq!(verify(&token, &headers(&signed), 1_700_000_301), Err(RpcAuthError::Expired));
        assert_eq!(verify(&token, &headers(&signed), 1_699_999_700), Ok(()));
    }

    #[test]
    fn test_rejections() {
        let token = Secret::new("bot-token");
        let signed = sign(&token, 1_700_000_000, "abcd");

        let mut missing = headers(&signed);
        missing.remove(NONCE_HEADER);
        assert_eq!(verify(&token, &missing, 1_700_000_000), Err(RpcAuthError::MissingHeader(NONCE_HEADER)));

        let other = sign(&Secret::new("other"), 1_700_000_000, "abcd");
        assert_eq!(verify(&token, &headers(&other), 1_700_000_000), Err(RpcAuthError::TokenMismatch));

        let tampered = SignedHeaders { nonce: "abce".into(), ..signed.clone() };
        assert_eq!(verify(&token, &headers(&tampered), 1_700_000_000), Err(RpcAuthError::BadSignature));

        assert_eq!(verify(&Secret::default(), &headers(&signed), 1_700_000_000), Err(RpcAuthError::NotConfigured));
    }
}
