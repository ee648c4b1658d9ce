//! Message relay between embedded app frames and the host UI.
//!
//! Apps run sandboxed in frames inside the host UI and can only reach the
//! engine through messages. Each message carries exactly one command:
//!
//! | field        | value      | effect                                      |
//! |--------------|------------|---------------------------------------------|
//! | `showDRO`    | bool       | show or hide the position readout           |
//! | `job`        | job object | submit a job, then open the job manager     |
//! | `getMachine` | `true`     | reply to the sender with `{ip, port}`       |
//!
//! Messages are handled one at a time in arrival order.

pub mod client;

use std::net::IpAddr;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::CollaboratorError;
use crate::machine::{JobPayload, JobReceipt};

pub use self::client::HttpMachineClient;

const KNOWN_FIELDS: [&str; 3] = ["showDRO", "job", "getMachine"];

/// Identifies the frame a message came from, so replies go back to it only.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FrameId(pub String);

/// The only machine details a frame is allowed to learn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MachineAddress {
    pub ip: IpAddr,
    pub port: u16,
}

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("Malformed relay message: {0}")]
    Malformed(String),

    #[error("Relay message names no known command")]
    Empty,

    #[error("Relay message names several commands: {0}")]
    Ambiguous(String),

    #[error("No active machine")]
    NoMachine,

    #[error("Host UI call {call} failed: {reason}")]
    HostUi { call: &'static str, reason: String },
}

/// A decoded frame message.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayMessage {
    ShowDro(bool),
    Job(JobPayload),
    GetMachine,
}

impl TryFrom<Value> for RelayMessage {
    type Error = RelayError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        let Value::Object(mut fields) = value else {
            return Err(RelayError::Malformed("message is not an object".to_string()));
        };
        let present: Vec<&str> = KNOWN_FIELDS
            .iter()
            .copied()
            .filter(|field| fields.contains_key(*field))
            .collect();

        match present.as_slice() {
            [] => Err(RelayError::Empty),
            ["showDRO"] => match fields.remove("showDRO") {
                Some(Value::Bool(show)) => Ok(Self::ShowDro(show)),
                _ => Err(RelayError::Malformed("showDRO must be a boolean".to_string())),
            },
            ["job"] => {
                let job = fields.remove("job").unwrap_or_default();
                serde_json::from_value(job)
                    .map(Self::Job)
                    .map_err(|e| RelayError::Malformed(format!("job: {e}")))
            }
            ["getMachine"] => match fields.remove("getMachine") {
                Some(Value::Bool(true)) => Ok(Self::GetMachine),
                _ => Err(RelayError::Malformed("getMachine must be true".to_string())),
            },
            several => Err(RelayError::Ambiguous(several.join(", "))),
        }
    }
}

/// The host UI surface the relay drives.
#[async_trait]
pub trait HostUi: Send + Sync {
    async fn show_dro(&self) -> Result<(), RelayError>;

    async fn hide_dro(&self) -> Result<(), RelayError>;

    async fn open_job_manager(&self) -> Result<(), RelayError>;

    /// Deliver `message` to `target` and no other frame.
    async fn reply(&self, target: &FrameId, message: Value) -> Result<(), RelayError>;
}

/// The engine as seen from the host UI.
#[async_trait]
pub trait RelayMachine: Send + Sync {
    fn address(&self) -> MachineAddress;

    async fn submit_job(&self, job: JobPayload) -> Result<JobReceipt, CollaboratorError>;
}

/// What the relay did with a message.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayAction {
    DroShown(bool),
    JobSubmitted(JobReceipt),
    JobFailed(String),
    MachineSent(MachineAddress),
    Ignored,
}

/// One inbound frame message.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub source: FrameId,
    pub message: Value,
}

pub struct MessageRelay {
    ui: Arc<dyn HostUi>,
    machine: RwLock<Option<Arc<dyn RelayMachine>>>,
}

impl MessageRelay {
    pub fn new(ui: Arc<dyn HostUi>) -> Self {
        Self {
            ui,
            machine: RwLock::new(None),
        }
    }

    /// Switch the active machine. `None` when the UI disconnects.
    pub fn set_machine(&self, machine: Option<Arc<dyn RelayMachine>>) {
        if let Ok(mut active) = self.machine.write() {
            *active = machine;
        }
    }

    fn active_machine(&self) -> Option<Arc<dyn RelayMachine>> {
        self.machine.read().ok().and_then(|m| m.clone())
    }

    /// Decode and handle a raw message. Malformed messages are dropped.
    pub async fn handle_raw(
        &self,
        source: &FrameId,
        message: Value,
    ) -> Result<RelayAction, RelayError> {
        match RelayMessage::try_from(message) {
            Ok(message) => self.handle(source, message).await,
            Err(e) => {
                tracing::debug!(frame = %source.0, "Ignoring relay message: {}", e);
                Ok(RelayAction::Ignored)
            }
        }
    }

    /// Host UI failures are returned, not swallowed.
    pub async fn handle(
        &self,
        source: &FrameId,
        message: RelayMessage,
    ) -> Result<RelayAction, RelayError> {
        let machine = self.active_machine();
        match message {
            RelayMessage::ShowDro(show) => {
                if machine.is_none() {
                    return Ok(RelayAction::Ignored);
                }
                if show {
                    self.ui.show_dro().await?;
                } else {
                    self.ui.hide_dro().await?;
                }
                Ok(RelayAction::DroShown(show))
            }
            RelayMessage::Job(job) => {
                let machine = machine.ok_or(RelayError::NoMachine)?;
                match machine.submit_job(job).await {
                    Ok(receipt) => {
                        tracing::info!(frame = %source.0, job = %receipt.id, "Job submitted from app");
                        self.ui.open_job_manager().await?;
                        Ok(RelayAction::JobSubmitted(receipt))
                    }
                    Err(e) => {
                        tracing::warn!(frame = %source.0, "Job submission failed: {}", e);
                        Ok(RelayAction::JobFailed(e.to_string()))
                    }
                }
            }
            RelayMessage::GetMachine => {
                let machine = machine.ok_or(RelayError::NoMachine)?;
                let address = machine.address();
                let reply = serde_json::to_value(address)
                    .map_err(|e| RelayError::Malformed(e.to_string()))?;
                self.ui.reply(source, reply).await?;
                Ok(RelayAction::MachineSent(address))
            }
        }
    }

    /// Handle messages in arrival order until the channel closes.
    pub async fn run(&self, mut inbox: mpsc::Receiver<Envelope>) -> Result<(), RelayError> {
        while let Some(envelope) = inbox.recv().await {
            self.handle_raw(&envelope.source, envelope.message).await?;
        }
        Ok(())
    }
}
