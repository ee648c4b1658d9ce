//! Login, logout, and the authenticated-user guard.
//!
//! Users live in the engine config under `users`, as a map of username to
//! `<salt>$<digest>`: a random per-user salt and the HMAC-SHA256 of the
//! password keyed by it, both hex. Bare hex SHA-256 digests from older
//! releases still verify.

use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::{Request, State};
use axum::http::header;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use hmac::{Hmac, Mac};
use rand::RngCore;
use rand::rngs::OsRng;
use serde::Deserialize;
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::error::ConfigError;
use crate::server::middleware::RequestParams;
use crate::server::session::Session;
use crate::server::{ApiError, ServerContext, success};
use crate::settings::{ConfigStore, USERS_KEY};

/// The user restored from the session for this request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CurrentUser(pub String);

#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn verify(&self, username: &str, password: &str) -> bool;

    /// Whether a session naming `username` is still valid.
    async fn exists(&self, username: &str) -> bool;
}

const SALT_BYTES: usize = 16;

type HmacSha256 = Hmac<Sha256>;

fn keyed_digest(salt: &[u8], password: &str) -> Option<HmacSha256> {
    let mut mac = HmacSha256::new_from_slice(salt).ok()?;
    mac.update(password.as_bytes());
    Some(mac)
}

/// Salted digest of `password` in the stored `<salt>$<digest>` form.
pub fn hash_password(password: &str) -> Option<String> {
    let mut salt = [0u8; SALT_BYTES];
    OsRng.fill_bytes(&mut salt);
    let digest = keyed_digest(&salt, password)?.finalize().into_bytes();
    Some(format!("{}${}", hex::encode(salt), hex::encode(digest)))
}

/// Check `password` against a stored digest in constant time.
pub fn verify_password(stored: &str, password: &str) -> bool {
    match stored.split_once('$') {
        Some((salt, digest)) => {
            let (Ok(salt), Ok(digest)) = (hex::decode(salt), hex::decode(digest)) else {
                return false;
            };
            keyed_digest(&salt, password).is_some_and(|mac| mac.verify_slice(&digest).is_ok())
        }
        None => {
            let candidate = hex::encode(Sha256::digest(password.as_bytes()));
            stored
                .to_ascii_lowercase()
                .as_bytes()
                .ct_eq(candidate.as_bytes())
                .into()
        }
    }
}

/// [`Authenticator`] backed by the engine configuration.
pub struct ConfigAuthenticator {
    config: Arc<dyn ConfigStore>,
}

impl ConfigAuthenticator {
    pub fn new(config: Arc<dyn ConfigStore>) -> Self {
        Self { config }
    }

    fn stored_digest(&self, username: &str) -> Option<String> {
        match self.config.get(USERS_KEY)? {
            Value::Object(users) => users.get(username)?.as_str().map(str::to_string),
            _ => None,
        }
    }

    /// Add or replace a user.
    pub async fn set_password(
        &self,
        username: &str,
        password: &str,
    ) -> Result<(), ConfigError> {
        let mut users = match self.config.get(USERS_KEY) {
            Some(Value::Object(users)) => users,
            _ => serde_json::Map::new(),
        };
        let digest = hash_password(password).ok_or_else(|| ConfigError::InvalidValue {
            key: USERS_KEY.to_string(),
            message: "failed to derive password digest".to_string(),
        })?;
        users.insert(username.to_string(), Value::from(digest));
        self.config.set(USERS_KEY, Value::Object(users)).await
    }
}

#[async_trait]
impl Authenticator for ConfigAuthenticator {
    async fn verify(&self, username: &str, password: &str) -> bool {
        let Some(stored) = self.stored_digest(username) else {
            return false;
        };
        verify_password(&stored, password)
    }

    async fn exists(&self, username: &str) -> bool {
        self.stored_digest(username).is_some()
    }
}

/// Turn the session's user into a [`CurrentUser`] extension.
///
/// A session naming a user that no longer exists is cleared.
pub async fn restore_user(
    State(authenticator): State<Arc<dyn Authenticator>>,
    mut request: Request,
    next: Next,
) -> Response {
    let session = request.extensions().get::<Session>().cloned();
    if let Some(session) = session
        && let Some(user) = session.user()
    {
        if authenticator.exists(&user).await {
            request.extensions_mut().insert(CurrentUser(user));
        } else {
            tracing::debug!(user = %user, "Session names an unknown user, clearing it");
            session.set_user(None);
        }
    }
    next.run(request).await
}

/// Route layer rejecting requests without a logged-in user.
pub async fn require_user(request: Request, next: Next) -> Response {
    if request.extensions().get::<CurrentUser>().is_none() {
        return ApiError::unauthorized("login required").into_response();
    }
    next.run(request).await
}

#[derive(Debug, Deserialize)]
struct Credentials {
    username: String,
    password: String,
}

/// Credentials from a form/query body, or else from a JSON body.
async fn credentials(request: Request) -> Result<Credentials, ApiError> {
    if let Some(params) = request.extensions().get::<RequestParams>()
        && let (Some(username), Some(password)) = (params.get("username"), params.get("password"))
    {
        return Ok(Credentials {
            username: username.to_string(),
            password: password.to_string(),
        });
    }

    let is_json = request
        .headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.starts_with("application/json"));
    if !is_json {
        return Err(ApiError::bad_request("username and password are required"));
    }
    let body = axum::body::to_bytes(request.into_body(), 64 * 1024)
        .await
        .map_err(|_| ApiError::bad_request("login body unreadable or too large"))?;
    serde_json::from_slice(&body)
        .map_err(|_| ApiError::bad_request("username and password are required"))
}

pub async fn login_handler(
    State(ctx): State<Arc<ServerContext>>,
    Extension(session): Extension<Session>,
    request: Request,
) -> Result<Json<Value>, ApiError> {
    let creds = credentials(request).await?;
    if !ctx.authenticator.verify(&creds.username, &creds.password).await {
        tracing::info!(user = %creds.username, "Login refused");
        return Err(ApiError::unauthorized("invalid username or password"));
    }
    tracing::info!(user = %creds.username, "User logged in");
    session.set_user(Some(creds.username.clone()));
    Ok(success(json!({ "user": creds.username })))
}

pub async fn logout_handler(Extension(session): Extension<Session>) -> Json<Value> {
    if let Some(user) = session.user() {
        tracing::info!(user = %user, "User logged out");
    }
    session.set_user(None);
    success(json!({ "user": Value::Null }))
}

pub async fn current_user_handler(
    Extension(user): Extension<CurrentUser>,
) -> Json<Value> {
    success(json!({ "user": user.0 }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::JsonConfigStore;
    use tempfile::tempdir;

    #[tokio::test]
    async fn verifies_stored_digest() {
        let dir = tempdir().unwrap();
        let store: Arc<dyn ConfigStore> =
            Arc::new(JsonConfigStore::open(dir.path().join("engine.json")));
        let auth = ConfigAuthenticator::new(store.clone());

        assert!(!auth.verify("admin", "go2fab").await);
        auth.set_password("admin", "go2fab").await.unwrap();

        assert!(auth.verify("admin", "go2fab").await);
        assert!(!auth.verify("admin", "wrong").await);
        assert!(!auth.verify("guest", "go2fab").await);
        assert!(auth.exists("admin").await);

        let stored = store.get("users.admin").unwrap();
        let stored = stored.as_str().unwrap();
        assert!(!stored.contains("go2fab"));
        assert!(verify_password(stored, "go2fab"));
    }

    #[test]
    fn digests_are_salted_per_hash() {
        let first = hash_password("go2fab").unwrap();
        let second = hash_password("go2fab").unwrap();
        assert_ne!(first, second);
        assert!(verify_password(&first, "go2fab"));
        assert!(verify_password(&second, "go2fab"));
        assert!(!verify_password(&first, "go2fab "));
        assert!(!verify_password("zz$zz", "go2fab"));
    }

    #[test]
    fn unsalted_sha256_digests_still_verify() {
        let legacy = "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad";
        assert!(verify_password(legacy, "abc"));
        assert!(verify_password(&legacy.to_ascii_uppercase(), "abc"));
        assert!(!verify_password(legacy, "abd"));
    }
}
