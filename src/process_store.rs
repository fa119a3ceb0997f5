use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::{debug_log, warn_log};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Key/value storage that outlives a restart of the hosting runtime
///
/// The supervisor only uses it to remember the id of the server process it owns.
pub trait ProcessStore: Send + Sync {
    fn get_int(&self, key: &str, default: i64) -> i64;
    fn set_int(&self, key: &str, value: i64);
    fn delete_key(&self, key: &str);
}

/// In-process store, survives the supervisor being dropped and rebuilt inside one host process
#[derive(Debug, Default)]
pub struct MemoryStore {
    values: Mutex<HashMap<String, i64>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ProcessStore for MemoryStore {
    fn get_int(&self, key: &str, default: i64) -> i64 {
        self.values
            .lock()
            .ok()
            .and_then(|values| values.get(key).copied())
            .unwrap_or(default)
    }

    fn set_int(&self, key: &str, value: i64) {
        if let Ok(mut values) = self.values.lock() {
            values.insert(key.to_string(), value);
        }
    }

    fn delete_key(&self, key: &str) {
        if let Ok(mut values) = self.values.lock() {
            values.remove(key);
        }
    }
}

/// Store backed by a JSON object file, written through on every change
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    values: Mutex<HashMap<String, i64>>,
}

impl JsonFileStore {
    /// Opens the store at `path`, an unreadable file starts out empty
    pub fn open<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref().to_path_buf();
        let values = match Self::read_values(&path) {
            Ok(values) => values,
            Err(StoreError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => {
                warn_log!("Ignoring unreadable store file {}: {}", path.display(), e);
                HashMap::new()
            }
        };

        Self {
            path,
            values: Mutex::new(values),
        }
    }

    fn read_values(path: &Path) -> Result<HashMap<String, i64>, StoreError> {
        let content = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    fn write_values(&self, values: &HashMap<String, i64>) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(values)?;
        fs::write(&self.path, content)?;
        Ok(())
    }

    fn update(&self, change: impl FnOnce(&mut HashMap<String, i64>)) {
        let Ok(mut values) = self.values.lock() else {
            return;
        };
        change(&mut *values);
        if let Err(e) = self.write_values(&values) {
            warn_log!("Failed to write store file {}: {}", self.path.display(), e);
        } else {
            debug_log!("Store file {} updated", self.path.display());
        }
    }
}

impl ProcessStore for JsonFileStore {
    fn get_int(&self, key: &str, default: i64) -> i64 {
        self.values
            .lock()
            .ok()
            .and_then(|values| values.get(key).copied())
            .unwrap_or(default)
    }

    fn set_int(&self, key: &str, value: i64) {
        self.update(|values| {
            values.insert(key.to_string(), value);
        });
    }

    fn delete_key(&self, key: &str) {
        self.update(|values| {
            values.remove(key);
        });
    }
}
