//! Persisted user settings
//!
//! Values are stored as JSON under the keys in [`keys`]. Stores only hold values; the scene
//! decides what is valid and falls back to defaults for anything missing or malformed.

use crate::error::SettingsError;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::fs;
use std::path::{Path, PathBuf};

pub mod keys {
    pub const BBOX: &str = "bbox";
    pub const PARTICLE_COUNT: &str = "particleCount";
    pub const COLOR_MODE: &str = "colorMode";
    pub const DROP_PROBABILITY: &str = "dropProbability";
    pub const FADE_OUT: &str = "fadeout";
    pub const TIME_STEP: &str = "timeStep";
    pub const VECTOR_FIELD: &str = "vectorField";
}

pub trait SettingsStore {
    fn get(&self, key: &str) -> Option<Value>;

    fn set(&mut self, key: &str, value: Value);

    /// Write pending changes to backing storage.
    fn flush(&mut self) -> Result<(), SettingsError> {
        Ok(())
    }
}

/// Read and deserialize a key; malformed values read as missing.
pub fn load<T: DeserializeOwned>(store: &dyn SettingsStore, key: &str) -> Option<T> {
    let value = store.get(key)?;
    match serde_json::from_value(value) {
        Ok(parsed) => Some(parsed),
        Err(err) => {
            log::debug!("Ignoring malformed setting {key}: {err}");
            None
        }
    }
}

/// Serialize and store a value.
pub fn save<T: serde::Serialize>(store: &mut dyn SettingsStore, key: &str, value: &T) {
    match serde_json::to_value(value) {
        Ok(value) => store.set(key, value),
        Err(err) => log::warn!("Could not serialize setting {key}: {err}"),
    }
}

/// In-memory store, the default when nothing is persisted
#[derive(Debug, Clone, Default)]
pub struct MemorySettings {
    values: Map<String, Value>,
}

impl MemorySettings {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SettingsStore for MemorySettings {
    fn get(&self, key: &str) -> Option<Value> {
        self.values.get(key).cloned()
    }

    fn set(&mut self, key: &str, value: Value) {
        self.values.insert(key.to_string(), value);
    }
}

/// Settings kept in a pretty-printed JSON object on disk
#[derive(Debug)]
pub struct JsonFileSettings {
    path: PathBuf,
    values: Map<String, Value>,
    dirty: bool,
}

impl JsonFileSettings {
    /// Open `path`, starting empty if it does not exist.
    ///
    /// A file that is not a JSON object is treated as empty and replaced on the next flush.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, SettingsError> {
        let path = path.as_ref().to_path_buf();
        let values = if path.exists() {
            match serde_json::from_str::<Value>(&fs::read_to_string(&path)?)? {
                Value::Object(values) => values,
                other => {
                    log::warn!("Settings file {} is not an object: {other}", path.display());
                    Map::new()
                }
            }
        } else {
            Map::new()
        };

        log::info!("Loaded {} settings from {}", values.len(), path.display());
        Ok(Self {
            path,
            values,
            dirty: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SettingsStore for JsonFileSettings {
    fn get(&self, key: &str) -> Option<Value> {
        self.values.get(key).cloned()
    }

    fn set(&mut self, key: &str, value: Value) {
        if self.values.get(key) != Some(&value) {
            self.values.insert(key.to_string(), value);
            self.dirty = true;
        }
    }

    fn flush(&mut self) -> Result<(), SettingsError> {
        if !self.dirty {
            return Ok(());
        }
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(&Value::Object(self.values.clone()))?;
        fs::write(&self.path, contents)?;
        self.dirty = false;
        Ok(())
    }
}
