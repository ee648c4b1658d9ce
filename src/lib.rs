//! fabhost: boots a single-machine CNC controller host and serves its web UI.
//!
//! Startup runs as an ordered list of stages (see [`boot`]) that prepare
//! storage, apply configuration, attach the machine, provision the session
//! secret, and bring up the HTTP server. The [`relay`] module bridges
//! sandboxed app frames in the host UI to the engine.

pub mod assets;
pub mod boot;
pub mod bootstrap;
pub mod cli;
pub mod config;
pub mod error;
pub mod machine;
pub mod platform;
pub mod relay;
pub mod server;
pub mod settings;

pub use error::{Error, Result};
