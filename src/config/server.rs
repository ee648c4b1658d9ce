use std::net::SocketAddr;
use std::path::PathBuf;

use crate::config::DebugMode;
use crate::config::helpers::{optional_env, parse_env};
use crate::error::ConfigError;
use crate::settings::{ConfigStore, SERVER_PORT_KEY};

pub const DEFAULT_SERVER_PORT: u16 = 9876;

/// Network server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Where multipart uploads are streamed before a handler picks them up.
    pub upload_dir: PathBuf,
    pub debug: DebugMode,
}

impl ServerConfig {
    pub(crate) fn resolve(store: &dyn ConfigStore, debug: DebugMode) -> Result<Self, ConfigError> {
        let stored_port = match store.get(SERVER_PORT_KEY) {
            None => None,
            Some(value) => Some(port_from_value(&value)?),
        };

        let port = parse_env::<u16>("FABHOST_PORT", "a valid port number")?
            .or(stored_port)
            .unwrap_or(DEFAULT_SERVER_PORT);

        Ok(Self {
            host: optional_env("FABHOST_HOST")?.unwrap_or_else(|| "0.0.0.0".to_string()),
            port,
            upload_dir: optional_env("FABHOST_UPLOAD_DIR")?
                .map(PathBuf::from)
                .unwrap_or_else(std::env::temp_dir),
            debug,
        })
    }

    pub fn bind_addr(&self) -> Result<SocketAddr, ConfigError> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .map_err(|e| ConfigError::InvalidValue {
                key: "FABHOST_HOST".to_string(),
                message: format!("not a bindable address: {e}"),
            })
    }
}

fn port_from_value(value: &serde_json::Value) -> Result<u16, ConfigError> {
    let invalid = |message: String| ConfigError::InvalidValue {
        key: SERVER_PORT_KEY.to_string(),
        message,
    };
    match value {
        serde_json::Value::Number(n) => n
            .as_u64()
            .and_then(|n| u16::try_from(n).ok())
            .ok_or_else(|| invalid(format!("{n} is not a valid port number"))),
        serde_json::Value::String(s) => s
            .trim()
            .parse()
            .map_err(|e| invalid(format!("'{s}' is not a valid port number: {e}"))),
        other => Err(invalid(format!("expected a number, got {other}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::JsonConfigStore;
    use serde_json::json;
    use tempfile::tempdir;

    #[tokio::test]
    async fn stored_port_is_used() {
        let dir = tempdir().unwrap();
        let store = JsonConfigStore::open(dir.path().join("engine.json"));
        store.set(SERVER_PORT_KEY, json!("8080")).await.unwrap();

        let config = ServerConfig::resolve(&store, DebugMode::default()).unwrap();
        assert_eq!(config.port, 8080);
    }

    #[tokio::test]
    async fn bad_stored_port_names_the_key() {
        let dir = tempdir().unwrap();
        let store = JsonConfigStore::open(dir.path().join("engine.json"));
        store.set(SERVER_PORT_KEY, json!(70000)).await.unwrap();

        let err = ServerConfig::resolve(&store, DebugMode::default()).unwrap_err();
        assert!(err.to_string().contains(SERVER_PORT_KEY));
    }

    #[test]
    fn bind_addr_combines_host_and_port() {
        let config = ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            upload_dir: std::env::temp_dir(),
            debug: DebugMode::default(),
        };
        assert_eq!(config.bind_addr().unwrap().to_string(), "127.0.0.1:0");
    }
}
