//! Client application asset cache.
//!
//! The approot holds the unpacked client bundle served under the version
//! segment of every URL. When the version token changes the bundle is thrown
//! away and rebuilt by the app loader on demand.

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::error::CollaboratorError;

#[async_trait]
pub trait AssetCache: Send + Sync {
    /// Remove cached application assets. Returns a human-readable summary.
    async fn clear_cached_assets(&self) -> Result<String, CollaboratorError>;
}

/// [`AssetCache`] over the on-disk approot directory.
#[derive(Debug, Clone)]
pub struct ApprootCache {
    approot: PathBuf,
}

impl ApprootCache {
    pub fn new(approot: impl Into<PathBuf>) -> Self {
        Self {
            approot: approot.into(),
        }
    }

    pub fn approot(&self) -> &Path {
        &self.approot
    }
}

fn clear_failed(reason: impl Into<String>) -> CollaboratorError {
    CollaboratorError::call_failed("approot", "clear_cached_assets", reason)
}

#[async_trait]
impl AssetCache for ApprootCache {
    async fn clear_cached_assets(&self) -> Result<String, CollaboratorError> {
        let mut entries = match tokio::fs::read_dir(&self.approot).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(format!("{} does not exist", self.approot.display()));
            }
            Err(e) => return Err(clear_failed(e.to_string())),
        };

        let mut removed = 0usize;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| clear_failed(e.to_string()))?
        {
            let path = entry.path();
            let file_type = entry
                .file_type()
                .await
                .map_err(|e| clear_failed(format!("{}: {}", path.display(), e)))?;
            let result = if file_type.is_dir() {
                tokio::fs::remove_dir_all(&path).await
            } else {
                tokio::fs::remove_file(&path).await
            };
            result.map_err(|e| clear_failed(format!("{}: {}", path.display(), e)))?;
            removed += 1;
        }

        Ok(format!(
            "removed {} entries from {}",
            removed,
            self.approot.display()
        ))
    }
}
