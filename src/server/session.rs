//! Signed cookie sessions.
//!
//! Session data is stored client-side as `base64url(json).hex(hmac)`, keyed
//! by the provisioned auth secret. Rotating the secret invalidates every
//! outstanding session.

use std::sync::{Arc, Mutex};

use axum::extract::{Request, State};
use axum::http::{HeaderMap, HeaderValue, header};
use axum::middleware::Next;
use axum::response::Response;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::Utc;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::boot::AuthSecret;

type HmacSha256 = Hmac<Sha256>;

pub const SESSION_COOKIE: &str = "fabhost-session";
/// 31 days.
pub const SESSION_MAX_AGE_SECS: i64 = 2_678_400;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    /// Unix seconds after which the cookie is ignored.
    #[serde(default)]
    pub expires_at: i64,
}

/// HMAC key derived from the auth secret.
#[derive(Clone)]
pub struct SessionKey {
    key: Arc<[u8]>,
}

impl SessionKey {
    pub fn new(secret: &AuthSecret) -> Self {
        Self::from_bytes(secret.expose().as_bytes())
    }

    pub(crate) fn from_bytes(bytes: &[u8]) -> Self {
        Self { key: bytes.into() }
    }

    fn mac(&self, payload: &str) -> Option<HmacSha256> {
        let mut mac = HmacSha256::new_from_slice(&self.key).ok()?;
        mac.update(payload.as_bytes());
        Some(mac)
    }

    pub fn sign(&self, data: &SessionData) -> Option<String> {
        let json = serde_json::to_vec(data).ok()?;
        let payload = URL_SAFE_NO_PAD.encode(json);
        let signature = self.mac(&payload)?.finalize().into_bytes();
        Some(format!("{payload}.{}", hex::encode(signature)))
    }

    /// Returns the session if the signature matches and it has not expired.
    pub fn verify(&self, cookie: &str) -> Option<SessionData> {
        let (payload, signature) = cookie.rsplit_once('.')?;
        let signature = hex::decode(signature).ok()?;
        self.mac(payload)?.verify_slice(&signature).ok()?;

        let json = URL_SAFE_NO_PAD.decode(payload).ok()?;
        let data: SessionData = serde_json::from_slice(&json).ok()?;
        (data.expires_at > Utc::now().timestamp()).then_some(data)
    }
}

#[derive(Debug, Default)]
struct SessionInner {
    data: SessionData,
    changed: bool,
}

/// Per-request session handle, stored in request extensions.
#[derive(Debug, Clone, Default)]
pub struct Session {
    inner: Arc<Mutex<SessionInner>>,
}

impl Session {
    fn new(data: SessionData) -> Self {
        Self {
            inner: Arc::new(Mutex::new(SessionInner {
                data,
                changed: false,
            })),
        }
    }

    pub fn user(&self) -> Option<String> {
        self.inner.lock().ok().and_then(|s| s.data.user.clone())
    }

    pub fn set_user(&self, user: Option<String>) {
        if let Ok(mut inner) = self.inner.lock() {
            inner.data.user = user;
            inner.changed = true;
        }
    }

    fn take_changed(&self) -> Option<SessionData> {
        let mut inner = self.inner.lock().ok()?;
        if !inner.changed {
            return None;
        }
        inner.changed = false;
        Some(inner.data.clone())
    }
}

/// Value of the session cookie, if the request carries one.
pub(crate) fn session_cookie(headers: &HeaderMap) -> Option<&str> {
    headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, _)| *name == SESSION_COOKIE)
        .map(|(_, value)| value)
}

fn set_cookie_header(value: &str) -> Option<HeaderValue> {
    HeaderValue::from_str(&format!(
        "{SESSION_COOKIE}={value}; Path=/; Max-Age={SESSION_MAX_AGE_SECS}; SameSite=Lax"
    ))
    .ok()
}

/// Restore the session from its cookie and re-issue the cookie if a handler
/// changed it.
pub async fn session_middleware(
    State(key): State<SessionKey>,
    mut request: Request,
    next: Next,
) -> Response {
    let data = session_cookie(request.headers())
        .and_then(|cookie| key.verify(cookie))
        .unwrap_or_default();
    let session = Session::new(data);
    request.extensions_mut().insert(session.clone());

    let mut response = next.run(request).await;

    if let Some(mut data) = session.take_changed() {
        data.expires_at = Utc::now().timestamp() + SESSION_MAX_AGE_SECS;
        match key.sign(&data).as_deref().and_then(set_cookie_header) {
            Some(cookie) => {
                response.headers_mut().append(header::SET_COOKIE, cookie);
            }
            None => tracing::warn!("Failed to sign session cookie"),
        }
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> SessionKey {
        SessionKey::from_bytes(&[7u8; 64])
    }

    fn fresh(user: &str) -> SessionData {
        SessionData {
            user: Some(user.to_string()),
            expires_at: Utc::now().timestamp() + 60,
        }
    }

    #[test]
    fn signed_session_verifies() {
        let data = fresh("admin");
        let cookie = key().sign(&data).unwrap();
        assert_eq!(key().verify(&cookie), Some(data));
    }

    #[test]
    fn tampered_or_foreign_cookie_is_rejected() {
        let cookie = key().sign(&fresh("admin")).unwrap();
        let (payload, signature) = cookie.rsplit_once('.').unwrap();

        let forged_payload = URL_SAFE_NO_PAD.encode(br#"{"user":"root","expires_at":99999999999}"#);
        assert_eq!(key().verify(&format!("{forged_payload}.{signature}")), None);
        assert_eq!(key().verify(&format!("{payload}.00")), None);
        assert_eq!(SessionKey::from_bytes(b"other").verify(&cookie), None);
        assert_eq!(key().verify("garbage"), None);
    }

    #[test]
    fn expired_session_is_ignored() {
        let data = SessionData {
            user: Some("admin".to_string()),
            expires_at: Utc::now().timestamp() - 1,
        };
        let cookie = key().sign(&data).unwrap();
        assert_eq!(key().verify(&cookie), None);
    }

    #[test]
    fn cookie_is_found_among_others() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::COOKIE,
            HeaderValue::from_static("theme=dark; fabhost-session=abc.def; lang=en"),
        );
        assert_eq!(session_cookie(&headers), Some("abc.def"));
    }

    #[test]
    fn set_cookie_is_script_readable() {
        let header = set_cookie_header("abc.def").unwrap();
        let header = header.to_str().unwrap();
        assert!(header.contains("Max-Age=2678400"));
        assert!(header.contains("Path=/"));
        assert!(!header.contains("HttpOnly"));
        assert!(!header.contains("Secure"));
    }
}
