//! Bootstrap helpers for fabhost.
//!
//! Everything here runs before the engine config store is open: locating the
//! data directory and loading env overrides from `~/.fabhost/.env`.
//!
//! File: `~/.fabhost/.env` (standard dotenvy format)

use std::path::{Path, PathBuf};

use crate::config::helpers::optional_env;
use crate::error::PersistenceError;

/// Root of all persisted engine state: `$FABHOST_HOME` or `~/.fabhost`.
pub fn fabhost_home() -> PathBuf {
    if let Ok(Some(home)) = optional_env("FABHOST_HOME") {
        return PathBuf::from(home);
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".fabhost")
}

/// Path to the fabhost-specific `.env` file: `~/.fabhost/.env`.
pub fn fabhost_env_path() -> PathBuf {
    fabhost_home().join(".env")
}

/// Load env vars from `~/.fabhost/.env` (in addition to the standard `.env`).
///
/// Call this **after** `dotenvy::dotenv()` so that `./.env` takes priority.
/// dotenvy never overwrites existing env vars, so the effective priority is:
///
///   explicit env vars > `./.env` > `~/.fabhost/.env`
pub fn load_fabhost_env() {
    let path = fabhost_env_path();
    if path.exists()
        && let Err(e) = dotenvy::from_path(&path)
    {
        eprintln!("Warning: failed to load {}: {}", path.display(), e);
    }
}

/// Directory layout under the engine home.
#[derive(Debug, Clone)]
pub struct DataPaths {
    pub root: PathBuf,
}

impl DataPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn config_dir(&self) -> PathBuf {
        self.root.join("config")
    }

    /// Engine configuration store file.
    pub fn engine_config(&self) -> PathBuf {
        self.config_dir().join("engine.json")
    }

    /// Persisted session secret.
    pub fn auth_secret(&self) -> PathBuf {
        self.config_dir().join("auth_secret")
    }

    /// Unpacked client application bundle, invalidated on version change.
    pub fn approot(&self) -> PathBuf {
        self.root.join("approot")
    }

    pub fn apps(&self) -> PathBuf {
        self.root.join("apps")
    }

    pub fn files(&self) -> PathBuf {
        self.root.join("files")
    }

    pub fn tmp(&self) -> PathBuf {
        self.root.join("tmp")
    }

    pub fn log(&self) -> PathBuf {
        self.root.join("log")
    }

    pub fn all_dirs(&self) -> [PathBuf; 7] {
        [
            self.root.clone(),
            self.config_dir(),
            self.approot(),
            self.apps(),
            self.files(),
            self.tmp(),
            self.log(),
        ]
    }

    /// Create every directory the engine writes into.
    pub async fn create_all(&self) -> Result<(), PersistenceError> {
        for dir in self.all_dirs() {
            create_dir(&dir).await?;
        }
        Ok(())
    }
}

async fn create_dir(path: &Path) -> Result<(), PersistenceError> {
    tokio::fs::create_dir_all(path)
        .await
        .map_err(|source| PersistenceError::CreateDir {
            path: path.to_path_buf(),
            source,
        })?;
    tracing::debug!(path = %path.display(), "Data directory ready");
    Ok(())
}
