//! The engine context threaded through every boot stage.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::assets::{ApprootCache, AssetCache};
use crate::boot::secret::AuthSecret;
use crate::bootstrap::DataPaths;
use crate::config::BootConfig;
use crate::machine::{FirmwareInfo, Machine, MachineConnector, SimulatedConnector};
use crate::platform::PlatformProbe;
use crate::server::auth::{Authenticator, ConfigAuthenticator};
use crate::server::{EngineServer, RunningServer};
use crate::settings::{ConfigStore, JsonConfigStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReleaseKind {
    Dev,
    Beta,
    Release,
}

impl ReleaseKind {
    fn parse(value: Option<&str>) -> Self {
        match value.map(|v| v.trim().to_ascii_lowercase()).as_deref() {
            Some("release") => Self::Release,
            Some("beta") | Some("rc") => Self::Beta,
            _ => Self::Dev,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Dev => "dev",
            Self::Beta => "beta",
            Self::Release => "release",
        }
    }
}

/// Identity of the running build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BuildInfo {
    /// Content hash of the build, when the build pipeline stamped one.
    pub hash: Option<String>,
    /// Semantic version number.
    pub number: String,
    pub kind: ReleaseKind,
    pub debug: bool,
}

impl BuildInfo {
    /// Identity of this binary. `FABHOST_BUILD_HASH` and `FABHOST_RELEASE`
    /// are read at compile time.
    pub fn current(debug: bool) -> Self {
        Self {
            hash: option_env!("FABHOST_BUILD_HASH").map(str::to_string),
            number: env!("CARGO_PKG_VERSION").to_string(),
            kind: ReleaseKind::parse(option_env!("FABHOST_RELEASE")),
            debug,
        }
    }

    /// First non-empty of {content hash, semantic number}, trimmed.
    pub fn identity(&self) -> Option<String> {
        [self.hash.as_deref(), Some(self.number.as_str())]
            .into_iter()
            .flatten()
            .map(str::trim)
            .find(|s| !s.is_empty())
            .map(str::to_string)
    }
}

#[derive(Debug, Default)]
struct ClockState {
    synced: AtomicBool,
    offset_ms: AtomicI64,
}

/// One-shot wall clock synchronization.
///
/// Appliances often boot without an RTC; the first client to connect sends
/// its clock and every later request is ignored.
#[derive(Debug, Clone, Default)]
pub struct TimeSync {
    inner: Arc<ClockState>,
}

impl TimeSync {
    pub fn is_synced(&self) -> bool {
        self.inner.synced.load(Ordering::SeqCst)
    }

    /// Adopt `reference` as the current time. Returns `false` (and changes
    /// nothing) if the clock was already synchronized.
    pub fn sync(&self, reference: DateTime<Utc>) -> bool {
        if self
            .inner
            .synced
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            tracing::debug!("Clock already synchronized, ignoring time-set request");
            return false;
        }
        let offset = reference.signed_duration_since(Utc::now());
        self.inner
            .offset_ms
            .store(offset.num_milliseconds(), Ordering::SeqCst);
        tracing::info!(offset_ms = offset.num_milliseconds(), "Clock synchronized");
        true
    }

    pub fn offset(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.inner.offset_ms.load(Ordering::SeqCst))
    }

    pub fn now(&self) -> DateTime<Utc> {
        Utc::now() + self.offset()
    }
}

/// Collaborator handles the stages reach through.
#[derive(Clone)]
pub struct Services {
    pub boot: BootConfig,
    pub paths: DataPaths,
    pub config: Arc<dyn ConfigStore>,
    pub assets: Arc<dyn AssetCache>,
    pub connector: Arc<dyn MachineConnector>,
    pub authenticator: Arc<dyn Authenticator>,
    pub platform: PlatformProbe,
}

impl Services {
    /// Production wiring: JSON config store, approot cache, simulated or
    /// detached machine depending on `boot.simulate`.
    pub fn standard(boot: BootConfig) -> Self {
        let paths = DataPaths::new(&boot.data_dir);
        let config: Arc<dyn ConfigStore> = Arc::new(JsonConfigStore::open(paths.engine_config()));
        Self {
            assets: Arc::new(ApprootCache::new(paths.approot())),
            connector: Arc::new(SimulatedConnector {
                attach: boot.simulate,
            }),
            authenticator: Arc::new(ConfigAuthenticator::new(config.clone())),
            config,
            paths,
            platform: PlatformProbe::current(),
            boot,
        }
    }
}

/// Shared context for the boot sequence.
pub struct EngineState {
    pub build: BuildInfo,
    pub firmware: FirmwareInfo,
    pub clock: TimeSync,
    /// `None` until the connect stage runs.
    pub machine: Option<Arc<dyn Machine>>,
    pub auth_secret: Option<AuthSecret>,
    /// `None` until the assembly stage completes.
    pub server: Option<EngineServer>,
    pub listener: Option<RunningServer>,
    pub services: Services,
}

impl EngineState {
    pub fn new(build: BuildInfo, services: Services) -> Self {
        Self {
            build,
            firmware: FirmwareInfo::default(),
            clock: TimeSync::default(),
            machine: None,
            auth_secret: None,
            server: None,
            listener: None,
            services,
        }
    }

    pub fn machine_connected(&self) -> bool {
        self.machine.as_ref().is_some_and(|m| m.is_connected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build(hash: Option<&str>, number: &str) -> BuildInfo {
        BuildInfo {
            hash: hash.map(str::to_string),
            number: number.to_string(),
            kind: ReleaseKind::Dev,
            debug: false,
        }
    }

    #[test]
    fn identity_prefers_hash() {
        assert_eq!(
            build(Some(" 9f8e7d \n"), "1.4.0").identity().as_deref(),
            Some("9f8e7d")
        );
        assert_eq!(build(Some("   "), "1.4.0").identity().as_deref(), Some("1.4.0"));
        assert_eq!(build(None, "").identity(), None);
    }

    #[test]
    fn time_sync_happens_once() {
        let clock = TimeSync::default();
        assert!(!clock.is_synced());

        let reference = Utc::now() + chrono::Duration::hours(3);
        assert!(clock.sync(reference));
        assert!(clock.is_synced());
        let first_offset = clock.offset();

        assert!(!clock.sync(Utc::now() - chrono::Duration::days(400)));
        assert_eq!(clock.offset(), first_offset);
        assert!(clock.offset() > chrono::Duration::hours(2));
    }

    #[test]
    fn release_kind_parse() {
        assert_eq!(ReleaseKind::parse(Some("Release")), ReleaseKind::Release);
        assert_eq!(ReleaseKind::parse(Some("rc")), ReleaseKind::Beta);
        assert_eq!(ReleaseKind::parse(None), ReleaseKind::Dev);
    }
}
