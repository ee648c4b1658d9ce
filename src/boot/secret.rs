//! Session signing secret.
//!
//! The secret lives in `<home>/config/auth_secret` as 512 hex characters.
//! A file of the right length is adopted as-is so sessions survive restarts;
//! anything else is replaced with fresh randomness.

use std::fmt;
use std::path::Path;

use rand::RngCore;
use rand::rngs::OsRng;
use secrecy::{ExposeSecret, SecretString};

use crate::error::PersistenceError;

/// Random bytes drawn for a new secret.
pub const SECRET_BYTES: usize = 256;
/// Length of the hex-encoded secret on disk.
pub const SECRET_HEX_LEN: usize = SECRET_BYTES * 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecretOrigin {
    Loaded,
    Generated,
}

/// The secret used to sign session cookies.
pub struct AuthSecret {
    value: SecretString,
    origin: SecretOrigin,
}

impl AuthSecret {
    pub fn expose(&self) -> &str {
        self.value.expose_secret()
    }

    pub fn origin(&self) -> SecretOrigin {
        self.origin
    }
}

impl fmt::Debug for AuthSecret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthSecret")
            .field("value", &"[REDACTED]")
            .field("origin", &self.origin)
            .finish()
    }
}

/// 256 bytes from the OS CSPRNG, hex encoded.
pub fn generate_secret() -> String {
    let mut bytes = [0u8; SECRET_BYTES];
    OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Load the stored secret if it has the expected length, otherwise generate
/// and persist a new one.
///
/// An unreadable file is treated like a missing one. Failing to write the
/// replacement is fatal: sessions signed with a secret that is not on disk
/// would all be invalidated by the next restart.
pub async fn provision_secret(path: &Path) -> Result<AuthSecret, PersistenceError> {
    match tokio::fs::read_to_string(path).await {
        Ok(stored) => {
            let stored = stored.trim_end_matches(['\r', '\n']);
            if stored.chars().count() == SECRET_HEX_LEN {
                tracing::info!(path = %path.display(), "Using stored auth secret");
                return Ok(AuthSecret {
                    value: SecretString::from(stored.to_string()),
                    origin: SecretOrigin::Loaded,
                });
            }
            tracing::warn!(
                path = %path.display(),
                length = stored.chars().count(),
                "Stored auth secret has the wrong length, regenerating"
            );
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            tracing::info!(path = %path.display(), "No auth secret on disk, generating one");
        }
        Err(e) => {
            tracing::warn!(path = %path.display(), "Failed to read auth secret, regenerating: {}", e);
        }
    }

    let secret = generate_secret();
    write_secret(path, &secret)
        .await
        .map_err(|source| PersistenceError::WriteSecret {
            path: path.to_path_buf(),
            source,
        })?;
    tracing::info!(path = %path.display(), "Generated new auth secret");

    Ok(AuthSecret {
        value: SecretString::from(secret),
        origin: SecretOrigin::Generated,
    })
}

async fn write_secret(path: &Path, secret: &str) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, secret).await?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)).await?;
    }

    Ok(())
}
