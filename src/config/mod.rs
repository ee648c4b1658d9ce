//! Configuration for fabhost.
//!
//! Settings are loaded with priority: env var > `.env` files > engine config
//! store > default. `BootConfig` is resolved before the first stage runs;
//! `ServerConfig` is resolved by the server assembly stage, after platform
//! defaults and the engine config have been applied.

pub(crate) mod helpers;
mod server;

use std::path::PathBuf;
use std::time::Duration;

use crate::error::ConfigError;

pub use self::server::{DEFAULT_SERVER_PORT, ServerConfig};

/// Default bound on the machine connection stage.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Debug switches shared by the version gate and the server pipeline.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DebugMode {
    /// Fresh cache-busting token every boot, request logging.
    pub enabled: bool,
    /// Artificial request latency for exercising client loading states.
    pub slow: bool,
}

impl DebugMode {
    pub(crate) fn resolve() -> Result<Self, ConfigError> {
        let enabled = helpers::bool_env("FABHOST_DEBUG")?.unwrap_or(false);
        let slow = match helpers::optional_env("FABHOST_DEBUG_MODE")? {
            None => false,
            Some(mode) => match mode.to_ascii_lowercase().as_str() {
                "slow" => true,
                "normal" | "fast" => false,
                _ => {
                    return Err(ConfigError::InvalidValue {
                        key: "FABHOST_DEBUG_MODE".to_string(),
                        message: format!("expected 'slow' or 'normal', got '{mode}'"),
                    });
                }
            },
        };
        // The slow sub-mode only exists inside debug mode.
        Ok(Self {
            enabled: enabled || slow,
            slow,
        })
    }
}

/// Everything the sequencer needs before any stage has run.
#[derive(Debug, Clone)]
pub struct BootConfig {
    pub data_dir: PathBuf,
    pub debug: DebugMode,
    /// Default bound applied to every stage that does not declare its own.
    pub stage_timeout: Option<Duration>,
    pub connect_timeout: Duration,
    /// Attach the built-in simulated machine instead of a real controller.
    pub simulate: bool,
    /// HTTP port given on the command line; wins over env and stored config.
    pub port_override: Option<u16>,
}

impl BootConfig {
    pub fn resolve() -> Result<Self, ConfigError> {
        let stage_timeout = helpers::parse_env::<u64>(
            "FABHOST_STAGE_TIMEOUT_SECS",
            "a whole number of seconds",
        )?
        .map(Duration::from_secs);
        if stage_timeout == Some(Duration::ZERO) {
            return Err(ConfigError::InvalidValue {
                key: "FABHOST_STAGE_TIMEOUT_SECS".to_string(),
                message: "must be > 0".to_string(),
            });
        }

        let connect_timeout = helpers::parse_env::<u64>(
            "FABHOST_CONNECT_TIMEOUT_SECS",
            "a whole number of seconds",
        )?
        .map(Duration::from_secs)
        .unwrap_or(DEFAULT_CONNECT_TIMEOUT);

        Ok(Self {
            data_dir: crate::bootstrap::fabhost_home(),
            debug: DebugMode::resolve()?,
            stage_timeout,
            connect_timeout,
            simulate: helpers::bool_env("FABHOST_SIMULATE")?.unwrap_or(false),
            port_override: None,
        })
    }

    /// Config rooted at `data_dir` with every optional behavior off.
    pub fn for_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            debug: DebugMode::default(),
            stage_timeout: None,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            simulate: false,
            port_override: None,
        }
    }
}
