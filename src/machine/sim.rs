//! In-process simulated controller.
//!
//! Used by `fabhost --simulate` and by tests. Without `--simulate` the host
//! opens a detached handle that never connects, so the UI is still served
//! with hardware stages skipped.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::{CollaboratorError, ConnectionError};
use crate::machine::{
    Driver, JobPayload, JobReceipt, Machine, MachineConnector, MachineState, Units,
};

pub const SIMULATED_PORT: &str = "sim://controller";

const SIMULATED_COMMANDS: [&str; 6] = ["home", "jog", "move", "zero", "spindle", "probe"];

#[derive(Debug)]
pub struct SimulatedDriver {
    values: Mutex<HashMap<String, Value>>,
    units: Mutex<Option<Units>>,
}

impl SimulatedDriver {
    fn new() -> Self {
        let mut values = HashMap::new();
        values.insert("fb".to_string(), Value::from("100.26"));
        values.insert("fv".to_string(), Value::from("0.99"));
        values.insert("fc".to_string(), Value::from("sim-3axis"));
        Self {
            values: Mutex::new(values),
            units: Mutex::new(None),
        }
    }

    pub fn units(&self) -> Option<Units> {
        self.units.lock().ok().and_then(|u| *u)
    }
}

fn poisoned(call: &'static str) -> CollaboratorError {
    CollaboratorError::call_failed("simulated driver", call, "state lock poisoned")
}

#[async_trait]
impl Driver for SimulatedDriver {
    async fn get(&self, keys: &[&str]) -> Result<HashMap<String, Value>, CollaboratorError> {
        let values = self.values.lock().map_err(|_| poisoned("get"))?;
        Ok(keys
            .iter()
            .filter_map(|key| values.get(*key).map(|v| (key.to_string(), v.clone())))
            .collect())
    }

    async fn set_units(&self, units: Units) -> Result<(), CollaboratorError> {
        *self.units.lock().map_err(|_| poisoned("set_units"))? = Some(units);
        Ok(())
    }

    async fn configure(&self, settings: &Map<String, Value>) -> Result<(), CollaboratorError> {
        let mut values = self.values.lock().map_err(|_| poisoned("configure"))?;
        for (key, value) in settings {
            values.insert(key.clone(), value.clone());
        }
        Ok(())
    }
}

pub struct SimulatedMachine {
    port: Option<String>,
    hardware_present: bool,
    connected: AtomicBool,
    state: Mutex<MachineState>,
    driver: SimulatedDriver,
    jobs: Mutex<Vec<JobReceipt>>,
}

impl SimulatedMachine {
    /// A machine that connects on the first `connect` call.
    pub fn attached() -> Self {
        Self::new(Some(SIMULATED_PORT.to_string()), true)
    }

    /// A handle for `port` with no controller behind it.
    pub fn detached(port: Option<String>) -> Self {
        Self::new(port, false)
    }

    fn new(port: Option<String>, hardware_present: bool) -> Self {
        Self {
            port,
            hardware_present,
            connected: AtomicBool::new(false),
            state: Mutex::new(MachineState::NotReady),
            driver: SimulatedDriver::new(),
            jobs: Mutex::new(Vec::new()),
        }
    }

    pub fn simulated_driver(&self) -> &SimulatedDriver {
        &self.driver
    }

    pub fn queued_jobs(&self) -> Vec<JobReceipt> {
        self.jobs.lock().map(|jobs| jobs.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl Machine for SimulatedMachine {
    fn port(&self) -> Option<&str> {
        self.port.as_deref()
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn connect(&self) -> Result<(), ConnectionError> {
        let port = self.port.clone().ok_or(ConnectionError::NoPort)?;
        if !self.hardware_present {
            return Err(ConnectionError::PortUnavailable {
                port,
                reason: "no controller responded".to_string(),
            });
        }
        self.connected.store(true, Ordering::SeqCst);
        tracing::debug!(port = %port, "Simulated controller attached");
        Ok(())
    }

    async fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
        self.set_state(MachineState::NotReady).await;
    }

    fn state(&self) -> MachineState {
        self.state
            .lock()
            .map(|s| *s)
            .unwrap_or(MachineState::Dead)
    }

    async fn set_state(&self, state: MachineState) {
        if let Ok(mut current) = self.state.lock() {
            *current = state;
        }
    }

    fn driver(&self) -> &dyn Driver {
        &self.driver
    }

    async fn load_commands(&self) -> Result<usize, CollaboratorError> {
        if !self.is_connected() {
            return Err(CollaboratorError::call_failed(
                "machine",
                "load_commands",
                "not connected",
            ));
        }
        Ok(SIMULATED_COMMANDS.len())
    }

    async fn add_job(&self, job: JobPayload) -> Result<JobReceipt, CollaboratorError> {
        job.validate()?;
        let receipt = JobReceipt {
            id: Uuid::new_v4(),
            name: job.name,
            queued_at: Utc::now(),
        };
        self.jobs
            .lock()
            .map_err(|_| CollaboratorError::call_failed("machine", "add_job", "queue poisoned"))?
            .push(receipt.clone());
        Ok(receipt)
    }
}

/// Opens simulated machines; `attach` decides whether a controller answers.
#[derive(Debug, Clone, Copy)]
pub struct SimulatedConnector {
    pub attach: bool,
}

impl MachineConnector for SimulatedConnector {
    fn open(&self, port: Option<String>) -> Arc<dyn Machine> {
        if self.attach {
            Arc::new(SimulatedMachine::attached())
        } else {
            Arc::new(SimulatedMachine::detached(port))
        }
    }
}
