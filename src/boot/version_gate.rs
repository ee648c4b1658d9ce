//! Build version tracking and cache invalidation.
//!
//! The version token is the first URL segment of every client asset. When it
//! changes, browsers fetch fresh assets and the server-side approot cache is
//! rebuilt.

use rand::Rng;
use serde_json::Value;

use crate::assets::AssetCache;
use crate::boot::state::BuildInfo;
use crate::error::ConfigError;
use crate::settings::{ConfigStore, VERSION_KEY};

/// Range of the throwaway tokens used in debug mode.
const DEBUG_TOKEN_RANGE: std::ops::Range<u32> = 10_000..99_999;

/// What the gate decided for this boot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VersionDecision {
    /// The persisted token already matches this build.
    Unchanged { token: String },
    /// A different build ran last; the cache was invalidated.
    Upgraded {
        previous: Option<String>,
        token: String,
    },
    /// Debug mode: a fresh token every boot.
    Debug { token: String },
}

impl VersionDecision {
    pub fn token(&self) -> &str {
        match self {
            Self::Unchanged { token } | Self::Upgraded { token, .. } | Self::Debug { token } => {
                token
            }
        }
    }

    pub fn invalidated_cache(&self) -> bool {
        !matches!(self, Self::Unchanged { .. })
    }
}

pub fn debug_token() -> String {
    rand::thread_rng().gen_range(DEBUG_TOKEN_RANGE).to_string()
}

fn stored_token(store: &dyn ConfigStore) -> Option<String> {
    match store.get(VERSION_KEY)? {
        Value::String(s) => Some(s.trim().to_string()).filter(|s| !s.is_empty()),
        Value::Null => None,
        other => Some(other.to_string()),
    }
}

/// Compare the build identity with the persisted token and invalidate the
/// asset cache when they differ.
///
/// A failed cache clear is logged and does not fail the check; the stale
/// assets are unreachable under the new token anyway.
pub async fn check_version(
    build: &BuildInfo,
    store: &dyn ConfigStore,
    assets: &dyn AssetCache,
) -> Result<VersionDecision, ConfigError> {
    let previous = stored_token(store);

    let decision = if build.debug {
        let token = debug_token();
        tracing::info!(token = %token, "Debug mode, using throwaway version token");
        VersionDecision::Debug { token }
    } else {
        let identity = build.identity().ok_or_else(|| ConfigError::MissingRequired {
            key: "build identity".to_string(),
            hint: "Build has neither a content hash nor a version number.".to_string(),
        })?;
        if previous.as_deref() == Some(identity.as_str()) {
            tracing::info!(version = %identity, "Engine version unchanged");
            return Ok(VersionDecision::Unchanged { token: identity });
        }
        tracing::info!(
            previous = previous.as_deref().unwrap_or("none"),
            version = %identity,
            "Engine version changed"
        );
        VersionDecision::Upgraded {
            previous,
            token: identity,
        }
    };

    store
        .set(VERSION_KEY, Value::from(decision.token()))
        .await?;

    match assets.clear_cached_assets().await {
        Ok(summary) => tracing::info!("Cleared application cache: {}", summary),
        Err(e) => tracing::warn!("Failed to clear application cache: {}", e),
    }

    Ok(decision)
}
