//! The production boot stages.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::boot::secret::provision_secret;
use crate::boot::state::EngineState;
use crate::boot::version_gate::check_version;
use crate::boot::Stage;
use crate::config::ServerConfig;
use crate::error::{ConnectionError, Result, ServerError};
use crate::machine::{FIRMWARE_KEYS, FirmwareInfo, MachineState, Units};
use crate::platform::{apply_platform_defaults, is_first_run};
use crate::server::{EngineServer, ServerContext};
use crate::settings::{DRIVER_KEY, OBSOLETE_KEYS, SERIAL_PORT_KEY, UNITS_KEY};

/// Every stage of a normal boot, in execution order.
pub fn standard_stages() -> Vec<Box<dyn Stage>> {
    vec![
        Box::new(CreateDataDirectories),
        Box::new(ApplyEngineConfig),
        Box::new(PlatformDefaults),
        Box::new(CheckEngineVersion),
        Box::new(ConnectMachine),
        Box::new(SetUnits),
        Box::new(ConfigureDriver),
        Box::new(FetchFirmware),
        Box::new(LoadCommands),
        Box::new(IdleMachine),
        Box::new(ProvisionSecret),
        Box::new(AssembleServer),
        Box::new(StartListening),
    ]
}

pub struct CreateDataDirectories;

#[async_trait]
impl Stage for CreateDataDirectories {
    fn name(&self) -> &'static str {
        "create-data-directories"
    }

    async fn run(&self, state: &mut EngineState) -> Result<()> {
        state.services.paths.create_all().await?;
        Ok(())
    }
}

/// Load engine.json over the defaults and drop keys older releases left behind.
pub struct ApplyEngineConfig;

#[async_trait]
impl Stage for ApplyEngineConfig {
    fn name(&self) -> &'static str {
        "apply-engine-config"
    }

    async fn run(&self, state: &mut EngineState) -> Result<()> {
        let config = &state.services.config;
        config.apply().await?;

        let obsolete: Vec<&str> = OBSOLETE_KEYS
            .iter()
            .copied()
            .filter(|key| config.has(key))
            .collect();
        if !obsolete.is_empty() {
            tracing::info!(keys = ?obsolete, "Removing obsolete configuration keys");
            config.delete_many(&obsolete).await?;
        }
        Ok(())
    }
}

pub struct PlatformDefaults;

#[async_trait]
impl Stage for PlatformDefaults {
    fn name(&self) -> &'static str {
        "platform-defaults"
    }

    fn applies(&self, state: &EngineState) -> bool {
        is_first_run(state.services.config.as_ref())
    }

    async fn run(&self, state: &mut EngineState) -> Result<()> {
        let written =
            apply_platform_defaults(state.services.config.as_ref(), &state.services.platform)
                .await?;
        tracing::info!(keys = ?written, "Applied first-run platform defaults");
        Ok(())
    }
}

pub struct CheckEngineVersion;

#[async_trait]
impl Stage for CheckEngineVersion {
    fn name(&self) -> &'static str {
        "check-engine-version"
    }

    async fn run(&self, state: &mut EngineState) -> Result<()> {
        check_version(
            &state.build,
            state.services.config.as_ref(),
            state.services.assets.as_ref(),
        )
        .await?;
        Ok(())
    }
}

/// Open the configured port and try to reach the controller.
///
/// The handle is attached to the state before connecting, so a failed or
/// timed-out connect still leaves a (disconnected) machine for the UI to
/// report on.
pub struct ConnectMachine;

#[async_trait]
impl Stage for ConnectMachine {
    fn name(&self) -> &'static str {
        "connect-machine"
    }

    async fn run(&self, state: &mut EngineState) -> Result<()> {
        let port = state
            .services
            .config
            .get(SERIAL_PORT_KEY)
            .and_then(|v| v.as_str().map(str::to_string))
            .filter(|p| !p.trim().is_empty());

        let machine = state.services.connector.open(port);
        state.machine = Some(Arc::clone(&machine));

        let limit = state.services.boot.connect_timeout;
        match tokio::time::timeout(limit, machine.connect()).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(ConnectionError::Timeout {
                    port: machine.port().unwrap_or("none").to_string(),
                    timeout: limit,
                }
                .into());
            }
        }
        tracing::info!(port = machine.port().unwrap_or("none"), "Machine connected");
        Ok(())
    }
}

fn hardware_ready(state: &EngineState) -> bool {
    state.machine_connected()
}

fn connected_machine(state: &EngineState) -> Result<Arc<dyn crate::machine::Machine>> {
    state
        .machine
        .clone()
        .filter(|m| m.is_connected())
        .ok_or_else(|| ConnectionError::NotConnected.into())
}

pub struct SetUnits;

#[async_trait]
impl Stage for SetUnits {
    fn name(&self) -> &'static str {
        "set-units"
    }

    fn applies(&self, state: &EngineState) -> bool {
        hardware_ready(state)
    }

    async fn run(&self, state: &mut EngineState) -> Result<()> {
        let machine = connected_machine(state)?;
        let stored = state.services.config.get(UNITS_KEY);
        let units = match stored.as_ref().and_then(Value::as_str).and_then(Units::parse) {
            Some(units) => units,
            None => {
                tracing::warn!(value = ?stored, "Unrecognized units setting, using inches");
                Units::In
            }
        };
        machine.driver().set_units(units).await?;
        Ok(())
    }
}

pub struct ConfigureDriver;

#[async_trait]
impl Stage for ConfigureDriver {
    fn name(&self) -> &'static str {
        "configure-driver"
    }

    fn applies(&self, state: &EngineState) -> bool {
        hardware_ready(state)
    }

    async fn run(&self, state: &mut EngineState) -> Result<()> {
        let machine = connected_machine(state)?;
        let settings = match state.services.config.get(DRIVER_KEY) {
            Some(Value::Object(map)) => map,
            _ => serde_json::Map::new(),
        };
        machine.driver().configure(&settings).await?;
        tracing::debug!(keys = settings.len(), "Driver configured");
        Ok(())
    }
}

pub struct FetchFirmware;

#[async_trait]
impl Stage for FetchFirmware {
    fn name(&self) -> &'static str {
        "fetch-firmware"
    }

    fn applies(&self, state: &EngineState) -> bool {
        hardware_ready(state)
    }

    async fn run(&self, state: &mut EngineState) -> Result<()> {
        let machine = connected_machine(state)?;
        let values = machine.driver().get(&FIRMWARE_KEYS).await?;
        state.firmware = FirmwareInfo::from_driver_values(&values);
        tracing::info!(
            build = %state.firmware.build,
            version = %state.firmware.version,
            config = %state.firmware.config,
            "Firmware identified"
        );
        Ok(())
    }
}

pub struct LoadCommands;

#[async_trait]
impl Stage for LoadCommands {
    fn name(&self) -> &'static str {
        "load-commands"
    }

    fn applies(&self, state: &EngineState) -> bool {
        hardware_ready(state)
    }

    async fn run(&self, state: &mut EngineState) -> Result<()> {
        let machine = connected_machine(state)?;
        let count = machine.load_commands().await?;
        tracing::info!(count, "Runtime commands loaded");
        Ok(())
    }
}

pub struct IdleMachine;

#[async_trait]
impl Stage for IdleMachine {
    fn name(&self) -> &'static str {
        "idle-machine"
    }

    fn applies(&self, state: &EngineState) -> bool {
        hardware_ready(state)
    }

    async fn run(&self, state: &mut EngineState) -> Result<()> {
        let machine = connected_machine(state)?;
        machine.set_state(MachineState::Idle).await;
        Ok(())
    }
}

pub struct ProvisionSecret;

#[async_trait]
impl Stage for ProvisionSecret {
    fn name(&self) -> &'static str {
        "provision-secret"
    }

    async fn run(&self, state: &mut EngineState) -> Result<()> {
        let path = state.services.paths.auth_secret();
        state.auth_secret = Some(provision_secret(&path).await?);
        Ok(())
    }
}

pub struct AssembleServer;

#[async_trait]
impl Stage for AssembleServer {
    fn name(&self) -> &'static str {
        "assemble-server"
    }

    async fn run(&self, state: &mut EngineState) -> Result<()> {
        let secret = state
            .auth_secret
            .as_ref()
            .ok_or_else(|| ServerError::Assembly("auth secret not provisioned".to_string()))?;

        // Port problems here leave the host unreachable, so they are fatal.
        let mut config = ServerConfig::resolve(
            state.services.config.as_ref(),
            state.services.boot.debug,
        )
        .map_err(|e| ServerError::Assembly(e.to_string()))?;
        if let Some(port) = state.services.boot.port_override {
            config.port = port;
        }

        let context = ServerContext {
            config: Arc::clone(&state.services.config),
            machine: state.machine.clone(),
            build: state.build.clone(),
            firmware: state.firmware.clone(),
            clock: state.clock.clone(),
            approot: state.services.paths.approot(),
            authenticator: Arc::clone(&state.services.authenticator),
        };
        state.server = Some(EngineServer::assemble(context, secret, config));
        Ok(())
    }
}

pub struct StartListening;

#[async_trait]
impl Stage for StartListening {
    fn name(&self) -> &'static str {
        "start-listening"
    }

    async fn run(&self, state: &mut EngineState) -> Result<()> {
        let server = state
            .server
            .as_ref()
            .ok_or_else(|| ServerError::Assembly("server was not assembled".to_string()))?;
        let running = server.listen().await?;
        state.listener = Some(running);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::boot::state::{BuildInfo, ReleaseKind, Services};
    use crate::boot::{Sequencer, StageOutcome};
    use crate::config::BootConfig;
    use crate::error::{CollaboratorError, ErrorDomain};
    use crate::machine::{Driver, JobPayload, JobReceipt, Machine, MachineConnector};
    use crate::platform::PlatformProbe;
    use crate::settings::{FIRST_RUN_KEY, SERVER_PORT_KEY, VERSION_KEY};
    use pretty_assertions::assert_eq;
    use serde_json::{Map, json};
    use std::collections::HashMap;
    use std::sync::Mutex;
    use tempfile::{TempDir, tempdir};

    type Calls = Arc<Mutex<Vec<&'static str>>>;

    struct RecordingDriver {
        calls: Calls,
    }

    #[async_trait]
    impl Driver for RecordingDriver {
        async fn get(
            &self,
            _keys: &[&str],
        ) -> std::result::Result<HashMap<String, Value>, CollaboratorError> {
            self.calls.lock().unwrap().push("driver.get");
            Ok(HashMap::new())
        }

        async fn set_units(&self, _units: Units) -> std::result::Result<(), CollaboratorError> {
            self.calls.lock().unwrap().push("driver.set_units");
            Ok(())
        }

        async fn configure(
            &self,
            _values: &Map<String, Value>,
        ) -> std::result::Result<(), CollaboratorError> {
            self.calls.lock().unwrap().push("driver.configure");
            Ok(())
        }
    }

    /// A machine whose controller never answers.
    struct Unplugged {
        calls: Calls,
        driver: RecordingDriver,
    }

    #[async_trait]
    impl Machine for Unplugged {
        fn port(&self) -> Option<&str> {
            Some("/dev/ttyACM0")
        }

        fn is_connected(&self) -> bool {
            false
        }

        async fn connect(&self) -> std::result::Result<(), ConnectionError> {
            self.calls.lock().unwrap().push("connect");
            Err(ConnectionError::PortUnavailable {
                port: "/dev/ttyACM0".to_string(),
                reason: "device not present".to_string(),
            })
        }

        async fn disconnect(&self) {}

        fn state(&self) -> MachineState {
            MachineState::NotReady
        }

        async fn set_state(&self, _state: MachineState) {
            self.calls.lock().unwrap().push("set_state");
        }

        fn driver(&self) -> &dyn Driver {
            &self.driver
        }

        async fn load_commands(&self) -> std::result::Result<usize, CollaboratorError> {
            self.calls.lock().unwrap().push("load_commands");
            Ok(0)
        }

        async fn add_job(
            &self,
            _job: JobPayload,
        ) -> std::result::Result<JobReceipt, CollaboratorError> {
            Err(CollaboratorError::call_failed("machine", "add_job", "unplugged"))
        }
    }

    struct UnpluggedConnector {
        calls: Calls,
    }

    impl MachineConnector for UnpluggedConnector {
        fn open(&self, _port: Option<String>) -> Arc<dyn Machine> {
            Arc::new(Unplugged {
                calls: self.calls.clone(),
                driver: RecordingDriver {
                    calls: self.calls.clone(),
                },
            })
        }
    }

    fn build() -> BuildInfo {
        BuildInfo {
            hash: Some("abc123".to_string()),
            number: "1.0.0".to_string(),
            kind: ReleaseKind::Release,
            debug: false,
        }
    }

    fn services(dir: &TempDir, simulate: bool) -> Services {
        let mut boot = BootConfig::for_data_dir(dir.path().join("home"));
        boot.simulate = simulate;
        let mut services = Services::standard(boot);
        services.platform = PlatformProbe::new("test", dir.path().join("dev"));
        services
    }

    /// Everything up to, but not including, binding a socket.
    fn offline_sequencer() -> Sequencer {
        Sequencer::new(
            standard_stages()
                .into_iter()
                .filter(|s| s.name() != "start-listening")
                .collect(),
        )
    }

    #[tokio::test]
    async fn disconnected_machine_skips_hardware_stages() {
        let dir = tempdir().unwrap();
        let calls = Calls::default();
        let mut services = services(&dir, false);
        services.connector = Arc::new(UnpluggedConnector {
            calls: calls.clone(),
        });

        let outcome = offline_sequencer()
            .run(EngineState::new(build(), services))
            .await
            .unwrap();

        assert_eq!(*calls.lock().unwrap(), vec!["connect"]);
        assert!(matches!(
            outcome.report.outcome("connect-machine"),
            Some(StageOutcome::Degraded {
                domain: ErrorDomain::Connection,
                ..
            })
        ));
        for stage in [
            "set-units",
            "configure-driver",
            "fetch-firmware",
            "load-commands",
            "idle-machine",
        ] {
            assert_eq!(outcome.report.outcome(stage), Some(&StageOutcome::Skipped));
        }

        let state = outcome.state;
        assert!(state.machine.is_some());
        assert!(state.firmware.is_empty());
        assert!(state.auth_secret.is_some());
        assert!(state.server.is_some());
    }

    #[tokio::test]
    async fn simulated_machine_runs_every_stage() {
        let dir = tempdir().unwrap();
        let outcome = offline_sequencer()
            .run(EngineState::new(build(), services(&dir, true)))
            .await
            .unwrap();

        assert_eq!(outcome.report.degraded().count(), 0);
        let state = outcome.state;
        assert_eq!(state.firmware.version, "0.99");
        let machine = state.machine.unwrap();
        assert!(machine.is_connected());
        assert_eq!(machine.state(), MachineState::Idle);
    }

    #[tokio::test]
    async fn first_boot_seeds_config_and_later_boots_skip_defaults() {
        let dir = tempdir().unwrap();
        let engine_json = dir.path().join("home").join("config").join("engine.json");
        std::fs::create_dir_all(engine_json.parent().unwrap()).unwrap();
        std::fs::write(
            &engine_json,
            r#"{"auth_secret":"legacy","approot_version":"x","units":"mm"}"#,
        )
        .unwrap();

        let first = offline_sequencer()
            .run(EngineState::new(build(), services(&dir, false)))
            .await
            .unwrap();
        assert_eq!(
            first.report.outcome("platform-defaults"),
            Some(&StageOutcome::Completed)
        );

        let config = &first.state.services.config;
        assert_eq!(config.get(FIRST_RUN_KEY), Some(json!(true)));
        assert_eq!(config.get(VERSION_KEY), Some(json!("abc123")));
        assert_eq!(config.get(UNITS_KEY), Some(json!("mm")));
        assert!(config.get(SERVER_PORT_KEY).is_some());
        assert!(!config.has("auth_secret"));
        assert!(!config.has("approot_version"));

        let second = offline_sequencer()
            .run(EngineState::new(build(), services(&dir, false)))
            .await
            .unwrap();
        assert_eq!(
            second.report.outcome("platform-defaults"),
            Some(&StageOutcome::Skipped)
        );
    }

    #[tokio::test]
    async fn connect_timeout_degrades() {
        struct Hanging;

        #[async_trait]
        impl Machine for Hanging {
            fn port(&self) -> Option<&str> {
                Some("/dev/ttyUSB0")
            }
            fn is_connected(&self) -> bool {
                false
            }
            async fn connect(&self) -> std::result::Result<(), ConnectionError> {
                std::future::pending().await
            }
            async fn disconnect(&self) {}
            fn state(&self) -> MachineState {
                MachineState::NotReady
            }
            async fn set_state(&self, _state: MachineState) {}
            fn driver(&self) -> &dyn Driver {
                unreachable!("no driver without a connection")
            }
            async fn load_commands(&self) -> std::result::Result<usize, CollaboratorError> {
                Ok(0)
            }
            async fn add_job(
                &self,
                _job: JobPayload,
            ) -> std::result::Result<JobReceipt, CollaboratorError> {
                Err(CollaboratorError::call_failed("machine", "add_job", "hung"))
            }
        }

        struct HangingConnector;

        impl MachineConnector for HangingConnector {
            fn open(&self, _port: Option<String>) -> Arc<dyn Machine> {
                Arc::new(Hanging)
            }
        }

        let dir = tempdir().unwrap();
        let mut services = services(&dir, false);
        services.boot.connect_timeout = std::time::Duration::from_millis(20);
        services.connector = Arc::new(HangingConnector);

        let outcome = offline_sequencer()
            .run(EngineState::new(build(), services))
            .await
            .unwrap();

        match outcome.report.outcome("connect-machine") {
            Some(StageOutcome::Degraded { domain, message }) => {
                assert_eq!(*domain, ErrorDomain::Connection);
                assert!(message.contains("timed out"));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert!(outcome.state.server.is_some());
    }

    #[tokio::test]
    async fn unwritable_home_aborts_boot() {
        let dir = tempdir().unwrap();
        let blocker = dir.path().join("home");
        std::fs::write(&blocker, "").unwrap();

        let failure = offline_sequencer()
            .run(EngineState::new(build(), services(&dir, false)))
            .await
            .err()
            .unwrap();
        assert_eq!(failure.stage, "create-data-directories");
    }
}
