//! First-run platform defaults.
//!
//! On the very first boot the host seeds configuration that depends on where
//! it is running: the serial device a controller is most likely attached to,
//! and the HTTP port an appliance image listens on. Later boots skip this
//! entirely, so operator edits are never overwritten.

use std::path::PathBuf;
use std::sync::LazyLock;

use regex::Regex;
use serde_json::{Map, Value};

use crate::error::ConfigError;
use crate::settings::{ConfigStore, FIRST_RUN_KEY, SERIAL_PORT_KEY, SERVER_PORT_KEY};

/// Appliance images serve the UI on the standard HTTP port.
pub const LINUX_APPLIANCE_PORT: u16 = 80;

static LINUX_SERIAL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^tty(ACM|USB)\d+$").expect("valid regex"));
static MACOS_SERIAL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^cu\.(usbmodem|usbserial)[\w.-]*$").expect("valid regex"));

/// Where and what to probe. `current()` in production, a temp dir in tests.
#[derive(Debug, Clone)]
pub struct PlatformProbe {
    pub os: String,
    pub dev_dir: PathBuf,
}

impl PlatformProbe {
    pub fn current() -> Self {
        Self::new(std::env::consts::OS, "/dev")
    }

    pub fn new(os: impl Into<String>, dev_dir: impl Into<PathBuf>) -> Self {
        Self {
            os: os.into(),
            dev_dir: dev_dir.into(),
        }
    }

    fn serial_pattern(&self) -> Option<&'static Regex> {
        match self.os.as_str() {
            "linux" => Some(&*LINUX_SERIAL),
            "macos" => Some(&*MACOS_SERIAL),
            _ => None,
        }
    }

    /// Serial device candidates, sorted so the pick is stable across boots.
    pub fn candidate_ports(&self) -> Vec<String> {
        let Some(pattern) = self.serial_pattern() else {
            return Vec::new();
        };
        let entries = match std::fs::read_dir(&self.dev_dir) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::debug!("Cannot enumerate {}: {}", self.dev_dir.display(), e);
                return Vec::new();
            }
        };

        let mut ports: Vec<String> = entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| entry.file_name().into_string().ok())
            .filter(|name| pattern.is_match(name))
            .map(|name| self.dev_dir.join(name).to_string_lossy().into_owned())
            .collect();
        ports.sort();
        ports
    }

    /// Platform defaults, excluding the first-run flag.
    pub fn defaults(&self) -> Map<String, Value> {
        let mut defaults = Map::new();
        if let Some(port) = self.candidate_ports().into_iter().next() {
            defaults.insert(SERIAL_PORT_KEY.to_string(), Value::from(port));
        }
        if self.os == "linux" {
            defaults.insert(
                SERVER_PORT_KEY.to_string(),
                Value::from(LINUX_APPLIANCE_PORT),
            );
        }
        defaults
    }
}

/// Whether platform defaults still need to be written.
pub fn is_first_run(store: &dyn ConfigStore) -> bool {
    !store.has(FIRST_RUN_KEY)
}

/// Seed platform defaults and record that the first run happened.
///
/// Returns the keys that were written (besides the flag).
pub async fn apply_platform_defaults(
    store: &dyn ConfigStore,
    probe: &PlatformProbe,
) -> Result<Vec<String>, ConfigError> {
    let mut values = probe.defaults();
    let written: Vec<String> = values.keys().cloned().collect();

    if written.is_empty() {
        tracing::info!(os = %probe.os, "No platform defaults for this platform");
    } else if !values.contains_key(SERIAL_PORT_KEY) {
        tracing::info!(os = %probe.os, "No serial devices found, leaving serial port unset");
    }

    values.insert(FIRST_RUN_KEY.to_string(), Value::Bool(true));
    store.update(values).await?;
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::JsonConfigStore;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use tempfile::tempdir;

    fn fake_dev(names: &[&str]) -> tempfile::TempDir {
        let dir = tempdir().unwrap();
        for name in names {
            std::fs::write(dir.path().join(name), "").unwrap();
        }
        dir
    }

    #[test]
    fn linux_candidates_are_filtered_and_sorted() {
        let dev = fake_dev(&["ttyUSB0", "ttyACM1", "ttyACM0", "tty0", "null", "ttyS0"]);
        let probe = PlatformProbe::new("linux", dev.path());

        let ports = probe.candidate_ports();
        let names: Vec<String> = ports
            .iter()
            .map(|p| p.rsplit('/').next().unwrap().to_string())
            .collect();
        assert_eq!(names, vec!["ttyACM0", "ttyACM1", "ttyUSB0"]);
    }

    #[test]
    fn macos_candidates() {
        let dev = fake_dev(&["cu.usbmodem14101", "cu.Bluetooth-Incoming-Port", "tty.usbmodem14101"]);
        let probe = PlatformProbe::new("macos", dev.path());
        let ports = probe.candidate_ports();
        assert_eq!(ports.len(), 1);
        assert!(ports[0].ends_with("cu.usbmodem14101"));
        assert!(!probe.defaults().contains_key(SERVER_PORT_KEY));
    }

    #[tokio::test]
    async fn zero_devices_leaves_serial_port_absent() {
        let dev = fake_dev(&[]);
        let cfg = tempdir().unwrap();
        let store = JsonConfigStore::open(cfg.path().join("engine.json"));
        assert!(is_first_run(&store));

        let written = apply_platform_defaults(&store, &PlatformProbe::new("linux", dev.path()))
            .await
            .unwrap();

        assert_eq!(written, vec![SERVER_PORT_KEY.to_string()]);
        assert!(!store.has(SERIAL_PORT_KEY));
        assert_eq!(store.get(SERVER_PORT_KEY), Some(json!(80)));
        assert!(!is_first_run(&store));
    }

    #[tokio::test]
    async fn unknown_platform_only_records_the_flag() {
        let cfg = tempdir().unwrap();
        let store = JsonConfigStore::open(cfg.path().join("engine.json"));

        let written = apply_platform_defaults(&store, &PlatformProbe::new("plan9", "/dev"))
            .await
            .unwrap();

        assert!(written.is_empty());
        assert_eq!(store.get(FIRST_RUN_KEY), Some(json!(true)));
    }

    #[test]
    fn missing_dev_dir_is_tolerated() {
        let probe = PlatformProbe::new("linux", "/definitely/not/a/dev/dir");
        assert!(probe.candidate_ports().is_empty());
    }
}
