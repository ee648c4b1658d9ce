//! Error types for fabhost.

use std::path::PathBuf;
use std::time::Duration;

use serde::Serialize;

/// Top-level error type for the engine host.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("Persistence error: {0}")]
    Persistence(#[from] PersistenceError),

    #[error("Collaborator error: {0}")]
    Collaborator(#[from] CollaboratorError),

    #[error("Server error: {0}")]
    Server(#[from] ServerError),

    #[error("Stage {stage} timed out after {timeout:?}")]
    StageTimeout {
        stage: &'static str,
        timeout: Duration,
    },
}

/// Failure domain used in logs and the boot report.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorDomain {
    Config,
    Connection,
    Persistence,
    Collaborator,
    Server,
    Timeout,
}

impl ErrorDomain {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Config => "config",
            Self::Connection => "connection",
            Self::Persistence => "persistence",
            Self::Collaborator => "collaborator",
            Self::Server => "server",
            Self::Timeout => "timeout",
        }
    }
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required configuration: {key}. {hint}")]
    MissingRequired { key: String, hint: String },

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Hardware connection errors.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("No serial port configured")]
    NoPort,

    #[error("Port {port} unavailable: {reason}")]
    PortUnavailable { port: String, reason: String },

    #[error("Machine is not connected")]
    NotConnected,

    #[error("Connection to {port} timed out after {timeout:?}")]
    Timeout { port: String, timeout: Duration },
}

/// Errors writing or creating persistent artifacts the engine cannot run without.
#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("Failed to create directory {}: {source}", path.display())]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write auth secret to {}: {source}", path.display())]
    WriteSecret {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Failures reported by external collaborators (driver, job queue, asset cache).
#[derive(Debug, thiserror::Error)]
pub enum CollaboratorError {
    #[error("{collaborator} call {call} failed: {reason}")]
    CallFailed {
        collaborator: &'static str,
        call: &'static str,
        reason: String,
    },

    #[error("{collaborator} rejected request: {reason}")]
    Rejected {
        collaborator: &'static str,
        reason: String,
    },
}

impl CollaboratorError {
    pub fn call_failed(
        collaborator: &'static str,
        call: &'static str,
        reason: impl Into<String>,
    ) -> Self {
        Self::CallFailed {
            collaborator,
            call,
            reason: reason.into(),
        }
    }
}

/// Network server errors.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("Failed to bind to {addr}: {reason}")]
    Bind { addr: String, reason: String },

    #[error("Server cannot be assembled: {0}")]
    Assembly(String),
}

impl Error {
    pub fn domain(&self) -> ErrorDomain {
        match self {
            Self::Config(_) => ErrorDomain::Config,
            Self::Connection(_) => ErrorDomain::Connection,
            Self::Persistence(_) => ErrorDomain::Persistence,
            Self::Collaborator(_) => ErrorDomain::Collaborator,
            Self::Server(_) => ErrorDomain::Server,
            Self::StageTimeout { .. } => ErrorDomain::Timeout,
        }
    }

    /// Whether boot must stop when a stage returns this error.
    ///
    /// Configuration problems are repaired by defaulting, a missing machine
    /// only disables hardware stages, and collaborator failures are logged.
    /// Anything that leaves the host without its data directories, its
    /// session secret, or a listening socket ends the boot.
    pub fn is_fatal(&self) -> bool {
        match self {
            Self::Config(_) | Self::Connection(_) | Self::Collaborator(_) => false,
            Self::Persistence(_) | Self::Server(_) | Self::StageTimeout { .. } => true,
        }
    }
}

/// Result type alias for the engine host.
pub type Result<T> = std::result::Result<T, Error>;
