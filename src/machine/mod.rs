//! Hardware handle contracts.
//!
//! The motion controller protocol and command language live behind these
//! traits. The boot stages and the HTTP job route only ever see a
//! `dyn Machine`.

pub mod sim;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::{CollaboratorError, ConnectionError};

pub use self::sim::{SIMULATED_PORT, SimulatedConnector, SimulatedMachine};

/// Driver keys holding the firmware build, version and configuration.
pub const FIRMWARE_KEYS: [&str; 3] = ["fb", "fv", "fc"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Units {
    In,
    Mm,
}

impl Units {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "in" | "inch" | "inches" | "0" => Some(Self::In),
            "mm" | "millimeters" | "1" => Some(Self::Mm),
            _ => None,
        }
    }
}

/// High-level machine state as reported to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MachineState {
    NotReady,
    Idle,
    Running,
    Paused,
    Stopped,
    Dead,
}

impl MachineState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotReady => "not_ready",
            Self::Idle => "idle",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Stopped => "stopped",
            Self::Dead => "dead",
        }
    }
}

impl fmt::Display for MachineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Firmware identity reported by the controller. Empty when no machine is attached.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirmwareInfo {
    pub build: String,
    pub version: String,
    pub config: String,
}

impl FirmwareInfo {
    pub fn is_empty(&self) -> bool {
        self.build.is_empty() && self.version.is_empty() && self.config.is_empty()
    }

    /// Build from a driver `get` of [`FIRMWARE_KEYS`]; missing keys stay empty.
    pub fn from_driver_values(values: &HashMap<String, Value>) -> Self {
        let field = |key: &str| match values.get(key) {
            Some(Value::String(s)) => s.trim().to_string(),
            Some(Value::Null) | None => String::new(),
            Some(other) => other.to_string(),
        };
        Self {
            build: field("fb"),
            version: field("fv"),
            config: field("fc"),
        }
    }
}

/// A job submitted by a client or relayed from an app frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobPayload {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    /// Path of an uploaded program file.
    #[serde(default)]
    pub file: Option<String>,
    /// Inline program text.
    #[serde(default)]
    pub program: Option<String>,
}

impl JobPayload {
    pub fn validate(&self) -> Result<(), CollaboratorError> {
        if self.name.trim().is_empty() {
            return Err(CollaboratorError::Rejected {
                collaborator: "job queue",
                reason: "job name is empty".to_string(),
            });
        }
        if self.file.is_none() && self.program.is_none() {
            return Err(CollaboratorError::Rejected {
                collaborator: "job queue",
                reason: "job has neither a file nor a program".to_string(),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobReceipt {
    pub id: Uuid,
    pub name: String,
    pub queued_at: DateTime<Utc>,
}

/// Driver-level access to the controller.
#[async_trait]
pub trait Driver: Send + Sync {
    async fn get(&self, keys: &[&str]) -> Result<HashMap<String, Value>, CollaboratorError>;

    async fn set_units(&self, units: Units) -> Result<(), CollaboratorError>;

    /// Push stored driver settings down to the controller.
    async fn configure(&self, values: &Map<String, Value>) -> Result<(), CollaboratorError>;
}

/// Connection and state of the physical machine.
#[async_trait]
pub trait Machine: Send + Sync {
    fn port(&self) -> Option<&str>;

    fn is_connected(&self) -> bool;

    async fn connect(&self) -> Result<(), ConnectionError>;

    async fn disconnect(&self);

    fn state(&self) -> MachineState;

    async fn set_state(&self, state: MachineState);

    fn driver(&self) -> &dyn Driver;

    /// Load the runtime command set; returns how many commands are available.
    async fn load_commands(&self) -> Result<usize, CollaboratorError>;

    async fn add_job(&self, job: JobPayload) -> Result<JobReceipt, CollaboratorError>;
}

/// Opens a machine handle for the configured port.
pub trait MachineConnector: Send + Sync {
    fn open(&self, port: Option<String>) -> Arc<dyn Machine>;
}
