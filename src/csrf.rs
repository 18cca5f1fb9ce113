//! Synchronizer-token CSRF protection.
//!
//! A token is `base64(salt).base64(HMAC-SHA256(secret, salt || "." || session id))`.
//! The secret lives in the session record, so a token verifies only against
//! the session it was issued for and only while that session's secret is the
//! one in the store.

use axum::http::{HeaderMap, Method};
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use tracing::debug;

use crate::error::LabError;
use crate::session::{redact, Session, SessionGateway};

type HmacSha256 = Hmac<Sha256>;

/// Header clients echo the token back in.
pub const CSRF_HEADER: &str = "x-csrf-token";

/// Alternate header names accepted for the token.
const CSRF_HEADER_ALIASES: [&str; 3] = [CSRF_HEADER, "csrf-token", "x-xsrf-token"];

const SECRET_LEN: usize = 32;
const SALT_LEN: usize = 16;

#[derive(Clone)]
pub struct CsrfGuard {
    sessions: SessionGateway,
}

impl CsrfGuard {
    pub fn new(sessions: SessionGateway) -> Self {
        Self { sessions }
    }

    /// Issue a fresh token for the session, creating its secret on first use.
    pub async fn issue(&self, session_id: &str) -> Result<String, LabError> {
        let secret = self
            .sessions
            .ensure_csrf_secret(session_id, random_bytes(SECRET_LEN))
            .await?;
        let salt = random_bytes(SALT_LEN);
        let mac = sign(&secret, &salt, session_id)?;
        debug!(session = %redact(session_id), "Issued CSRF token");
        Ok(format!("{}.{}", URL_SAFE_NO_PAD.encode(salt), URL_SAFE_NO_PAD.encode(mac)))
    }

    /// Verify a token against the secret currently stored for `session_id`.
    pub async fn verify(&self, session_id: &str, token: &str) -> bool {
        match self.sessions.authenticate(session_id).await {
            Ok(session) => verify_for_session(&session, token),
            Err(_) => false,
        }
    }
}

/// Verify a token against an already loaded session.
pub fn verify_for_session(session: &Session, token: &str) -> bool {
    let Some(secret) = session.csrf_secret.as_deref() else {
        return false;
    };
    let Some((salt, mac)) = token.split_once('.') else {
        return false;
    };
    let (Ok(salt), Ok(given)) = (URL_SAFE_NO_PAD.decode(salt), URL_SAFE_NO_PAD.decode(mac)) else {
        return false;
    };
    if salt.len() != SALT_LEN {
        return false;
    }
    match sign(secret, &salt, &session.id) {
        Ok(expected) => bool::from(expected.as_slice().ct_eq(given.as_slice())),
        Err(_) => false,
    }
}

/// Reads, HEAD and preflight requests never need a token.
pub fn is_exempt(method: &Method) -> bool {
    matches!(*method, Method::GET | Method::HEAD | Method::OPTIONS)
}

pub fn token_from_headers(headers: &HeaderMap) -> Option<&str> {
    CSRF_HEADER_ALIASES
        .iter()
        .find_map(|name| headers.get(*name))
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
}

fn sign(secret: &[u8], salt: &[u8], session_id: &str) -> Result<Vec<u8>, LabError> {
    let mut mac = HmacSha256::new_from_slice(secret)
        .map_err(|e| LabError::Internal(format!("csrf key: {e}")))?;
    mac.update(salt);
    mac.update(b".");
    mac.update(session_id.as_bytes());
    Ok(mac.finalize().into_bytes().to_vec())
}

fn random_bytes(len: usize) -> Vec<u8> {
    let mut bytes = vec![0u8; len];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes
}
