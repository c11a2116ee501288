//! Signed session tokens.
//!
//! The cookie value binds a session id to the client IP and mount
//! point through an HMAC over a process-wide secret:
//!
//! ```text
//! PAYLOAD = <session_id>:<auth_expiry>
//! SIG     = hex(HMAC-SHA256(secret, PAYLOAD:<client_ip>:<mount_point>))
//! TOKEN   = base64(PAYLOAD:SIG)
//! ```
//!
//! Verification is stateless with respect to server memory; the session
//! record itself still lives in the [`crate::session::SessionStore`].

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

/// Session cookie name, fixed by the wire protocol.
pub const COOKIE_NAME: &str = "flumotion-session";

type HmacSha256 = Hmac<Sha256>;

/// Outcome of verifying a session cookie.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CookieState {
    /// Signature and expiry check out.
    Valid { session_id: String },
    /// Signature checks out but the authentication window lapsed;
    /// re-authenticate and re-issue with the same session id.
    RenewAuth { session_id: String, auth_expiry: u64 },
    /// Malformed, forged, bound to another address, or for a
    /// different session than expected.
    NotValid,
}

/// Generates and verifies signed session tokens.
#[derive(Clone)]
pub struct TokenCodec {
    secret: Vec<u8>,
    mount_point: String,
}

impl std::fmt::Debug for TokenCodec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenCodec")
            .field("mount_point", &self.mount_point)
            .finish()
    }
}

impl TokenCodec {
    #[must_use]
    pub fn new(secret: &[u8], mount_point: &str) -> Self {
        Self {
            secret: secret.to_vec(),
            mount_point: mount_point.to_string(),
        }
    }

    fn sign(&self, payload: &str, client_ip: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .expect("HMAC accepts any key length");
        mac.update(payload.as_bytes());
        mac.update(b":");
        mac.update(client_ip.as_bytes());
        mac.update(b":");
        mac.update(self.mount_point.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    /// Build a token for `session_id` bound to `client_ip`.
    /// `auth_expiry` is a Unix timestamp; 0 means the authentication
    /// never expires.
    #[must_use]
    pub fn generate(&self, session_id: &str, client_ip: &str, auth_expiry: u64) -> String {
        let payload = format!("{session_id}:{auth_expiry}");
        let sig = self.sign(&payload, client_ip);
        BASE64.encode(format!("{payload}:{sig}"))
    }

    /// Verify a cookie against the client address and, optionally, a
    /// session id pinned by the request (`GKID`).
    #[must_use]
    pub fn verify(
        &self,
        cookie: &str,
        client_ip: &str,
        expected_session_id: Option<&str>,
    ) -> CookieState {
        let Ok(decoded) = BASE64.decode(cookie) else {
            tracing::debug!("cookie rejected: not base64");
            return CookieState::NotValid;
        };
        let Ok(token) = String::from_utf8(decoded) else {
            tracing::debug!("cookie rejected: not utf-8");
            return CookieState::NotValid;
        };
        let Some((payload, sig)) = token.rsplit_once(':') else {
            tracing::debug!("cookie rejected: missing signature");
            return CookieState::NotValid;
        };
        let Some((session_id, expiry_str)) = payload.split_once(':') else {
            tracing::debug!("cookie rejected: malformed payload");
            return CookieState::NotValid;
        };
        let Ok(auth_expiry) = expiry_str.parse::<u64>() else {
            tracing::debug!("cookie rejected: malformed expiry");
            return CookieState::NotValid;
        };

        let expected_sig = self.sign(payload, client_ip);
        if !bool::from(expected_sig.as_bytes().ct_eq(sig.as_bytes())) {
            tracing::debug!("cookie rejected: invalid signature");
            return CookieState::NotValid;
        }

        if let Some(expected) = expected_session_id {
            if expected != session_id {
                tracing::debug!("cookie rejected: session id mismatch");
                return CookieState::NotValid;
            }
        }

        let now = chrono::Utc::now().timestamp().max(0) as u64;
        if auth_expiry != 0 && auth_expiry < now {
            tracing::debug!(session_id, "cookie authentication expired");
            return CookieState::RenewAuth {
                session_id: session_id.to_string(),
                auth_expiry,
            };
        }

        CookieState::Valid {
            session_id: session_id.to_string(),
        }
    }
}
