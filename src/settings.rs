//! Engine configuration persistence.
//!
//! Stores engine settings in `<home>/config/engine.json`. Reads are served
//! from memory; every write goes straight back to disk. Values are loaded
//! with env var > engine.json > default priority by `crate::config`.

use std::path::{Path, PathBuf};
use std::sync::RwLock;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::error::ConfigError;

/// Set once platform defaults have been written on the very first boot.
pub const FIRST_RUN_KEY: &str = "first_run_complete";
/// Persisted version token, compared against the build identity every boot.
pub const VERSION_KEY: &str = "version";
pub const SERIAL_PORT_KEY: &str = "serial_port";
pub const SERVER_PORT_KEY: &str = "server_port";
pub const UNITS_KEY: &str = "units";
pub const DRIVER_KEY: &str = "driver";
pub const USERS_KEY: &str = "users";

/// Keys written by earlier releases that are pruned when the config is applied.
pub const OBSOLETE_KEYS: [&str; 2] = ["auth_secret", "approot_version"];

/// The configuration store contract the boot stages rely on.
///
/// Reads are synchronous; writes and applies touch the disk and are async.
#[async_trait]
pub trait ConfigStore: Send + Sync {
    /// Get a value by dotted path (e.g. `driver.xvm`).
    fn get(&self, path: &str) -> Option<Value>;

    fn has(&self, path: &str) -> bool {
        self.get(path).is_some()
    }

    async fn set(&self, key: &str, value: Value) -> Result<(), ConfigError>;

    /// Merge several top-level keys in one write.
    async fn update(&self, values: Map<String, Value>) -> Result<(), ConfigError>;

    async fn delete_many(&self, keys: &[&str]) -> Result<(), ConfigError>;

    /// Reload from disk, fill in defaults for missing keys, and persist the result.
    async fn apply(&self) -> Result<(), ConfigError>;
}

/// Default engine settings, used for any key absent on disk.
pub fn engine_defaults() -> Map<String, Value> {
    let mut map = Map::new();
    map.insert(UNITS_KEY.to_string(), Value::from("in"));
    map.insert(SERVER_PORT_KEY.to_string(), Value::from(9876));
    map.insert(DRIVER_KEY.to_string(), Value::Object(Map::new()));
    map.insert(USERS_KEY.to_string(), Value::Object(Map::new()));
    map
}

/// JSON-file backed [`ConfigStore`].
pub struct JsonConfigStore {
    path: PathBuf,
    defaults: Map<String, Value>,
    values: RwLock<Map<String, Value>>,
    // Serializes snapshot+write so an older snapshot never lands after a newer one.
    write_lock: tokio::sync::Mutex<()>,
}

impl JsonConfigStore {
    /// Open the store at `path`, loading whatever is on disk.
    ///
    /// A missing file starts empty. A corrupt file is renamed to
    /// `<name>.corrupt` and the store starts empty; configuration errors are
    /// repaired by defaulting, never fatal.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self::with_defaults(path, engine_defaults())
    }

    pub fn with_defaults(path: impl Into<PathBuf>, defaults: Map<String, Value>) -> Self {
        let path = path.into();
        let values = load_map(&path);
        Self {
            path,
            defaults,
            values: RwLock::new(values),
            write_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Snapshot of every stored key.
    pub fn snapshot(&self) -> Map<String, Value> {
        self.values
            .read()
            .map(|values| values.clone())
            .unwrap_or_default()
    }

    async fn mutate<F>(&self, f: F) -> Result<(), ConfigError>
    where
        F: FnOnce(&mut Map<String, Value>) + Send,
    {
        let _guard = self.write_lock.lock().await;
        let mut next = self
            .values
            .read()
            .map_err(|_| poisoned())?
            .clone();
        f(&mut next);

        // Memory only changes once the new map is on disk.
        write_map(&self.path, &next).await?;
        *self.values.write().map_err(|_| poisoned())? = next;
        Ok(())
    }
}

#[async_trait]
impl ConfigStore for JsonConfigStore {
    fn get(&self, path: &str) -> Option<Value> {
        let values = self.values.read().ok()?;
        let mut parts = path.split('.');
        let mut current = values.get(parts.next()?)?;
        for part in parts {
            current = current.get(part)?;
        }
        Some(current.clone())
    }

    async fn set(&self, key: &str, value: Value) -> Result<(), ConfigError> {
        self.mutate(|values| {
            values.insert(key.to_string(), value);
        })
        .await
    }

    async fn update(&self, new_values: Map<String, Value>) -> Result<(), ConfigError> {
        self.mutate(|values| {
            for (key, value) in new_values {
                values.insert(key, value);
            }
        })
        .await
    }

    async fn delete_many(&self, keys: &[&str]) -> Result<(), ConfigError> {
        self.mutate(|values| {
            for key in keys {
                values.remove(*key);
            }
        })
        .await
    }

    async fn apply(&self) -> Result<(), ConfigError> {
        let on_disk = load_map(&self.path);
        let defaults = self.defaults.clone();
        self.mutate(move |values| {
            *values = on_disk;
            for (key, value) in defaults {
                values.entry(key).or_insert(value);
            }
        })
        .await?;
        tracing::debug!(path = %self.path.display(), "Engine configuration applied");
        Ok(())
    }
}

fn poisoned() -> ConfigError {
    ConfigError::ParseError("config store lock poisoned".to_string())
}

fn load_map(path: &Path) -> Map<String, Value> {
    let data = match std::fs::read_to_string(path) {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Map::new(),
        Err(e) => {
            tracing::warn!("Failed to read {}: {}", path.display(), e);
            return Map::new();
        }
    };

    match serde_json::from_str::<Value>(&data) {
        Ok(Value::Object(map)) => map,
        Ok(_) | Err(_) => {
            tracing::warn!(
                "Engine config {} is corrupt, starting from defaults",
                path.display()
            );
            rename_to_corrupt(path);
            Map::new()
        }
    }
}

/// Rename a file to `<name>.corrupt` so it can be inspected later.
fn rename_to_corrupt(path: &Path) {
    let mut corrupt = path.as_os_str().to_owned();
    corrupt.push(".corrupt");
    if let Err(e) = std::fs::rename(path, &corrupt) {
        tracing::warn!("Failed to rename {} to .corrupt: {}", path.display(), e);
    }
}

async fn write_map(path: &Path, values: &Map<String, Value>) -> Result<(), ConfigError> {
    let content = serde_json::to_string_pretty(values)
        .map_err(|e| ConfigError::ParseError(format!("failed to serialize config: {e}")))?;

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    // Write-then-rename so a crash mid-write never truncates the store.
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    tokio::fs::write(&tmp, content).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_set_persists_to_disk() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config").join("engine.json");
        let store = JsonConfigStore::open(&path);

        store.set(VERSION_KEY, json!("abc123")).await.unwrap();

        let reopened = JsonConfigStore::open(&path);
        assert_eq!(reopened.get(VERSION_KEY), Some(json!("abc123")));
    }

    #[tokio::test]
    async fn test_get_dotted_path() {
        let dir = tempdir().unwrap();
        let store = JsonConfigStore::open(dir.path().join("engine.json"));
        store
            .set(DRIVER_KEY, json!({ "xvm": 120, "jerk": { "x": 5 } }))
            .await
            .unwrap();

        assert_eq!(store.get("driver.xvm"), Some(json!(120)));
        assert_eq!(store.get("driver.jerk.x"), Some(json!(5)));
        assert_eq!(store.get("driver.missing"), None);
        assert!(!store.has("nonexistent"));
    }

    #[tokio::test]
    async fn test_apply_fills_defaults_without_clobbering() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("engine.json");
        std::fs::write(&path, r#"{"units":"mm","version":"1.2.3"}"#).unwrap();

        let store = JsonConfigStore::open(&path);
        store.apply().await.unwrap();

        assert_eq!(store.get(UNITS_KEY), Some(json!("mm")));
        assert_eq!(store.get(VERSION_KEY), Some(json!("1.2.3")));
        assert_eq!(store.get(SERVER_PORT_KEY), Some(json!(9876)));

        let on_disk: Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(on_disk["server_port"], 9876);
    }

    #[tokio::test]
    async fn test_corrupt_file_is_set_aside() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("engine.json");
        std::fs::write(&path, "{ not json").unwrap();

        let store = JsonConfigStore::open(&path);
        assert!(store.snapshot().is_empty());
        assert!(dir.path().join("engine.json.corrupt").exists());

        store.apply().await.unwrap();
        assert_eq!(store.get(UNITS_KEY), Some(json!("in")));
    }

    #[tokio::test]
    async fn test_failed_write_leaves_memory_unchanged() {
        let dir = tempdir().unwrap();
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, "").unwrap();
        let store = JsonConfigStore::open(blocker.join("engine.json"));

        assert!(store.set(VERSION_KEY, json!("abc123")).await.is_err());
        assert_eq!(store.get(VERSION_KEY), None);
        assert!(store.snapshot().is_empty());
    }

    #[tokio::test]
    async fn test_update_and_delete_many() {
        let dir = tempdir().unwrap();
        let store = JsonConfigStore::open(dir.path().join("engine.json"));

        let mut values = Map::new();
        values.insert("auth_secret".to_string(), json!("legacy"));
        values.insert(SERIAL_PORT_KEY.to_string(), json!("/dev/ttyACM0"));
        store.update(values).await.unwrap();
        assert!(store.has("auth_secret"));

        store.delete_many(&OBSOLETE_KEYS).await.unwrap();
        assert!(!store.has("auth_secret"));
        assert_eq!(store.get(SERIAL_PORT_KEY), Some(json!("/dev/ttyACM0")));
    }
}
