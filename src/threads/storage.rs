//! Injected key-value storage port.
//!
//! The store persists through this port rather than a concrete backend, so
//! hosts can plug in whatever durable storage they have. Keys are
//! namespaced by the store; values are opaque serialized records.

use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;

use crate::threads::StoreError;

/// Durable string storage with localStorage-like semantics.
pub trait StoragePort: Send + Sync + 'static {
    /// Returns the stored value for `key`, if any.
    fn get(&self, key: &str) -> Option<String>;
    /// Stores `value` under `key`, replacing any previous value.
    fn set(&self, key: &str, value: String) -> Result<(), StoreError>;
    /// Removes `key`. Removing an absent key is not an error.
    fn remove(&self, key: &str);
}

/// In-memory backend, used in tests and as a default for hosts without
/// durable storage.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    values: Mutex<HashMap<String, String>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StoragePort for MemoryStorage {
    fn get(&self, key: &str) -> Option<String> {
        self.values.lock().expect("storage lock").get(key).cloned()
    }

    fn set(&self, key: &str, value: String) -> Result<(), StoreError> {
        self.values
            .lock()
            .expect("storage lock")
            .insert(key.to_string(), value);
        Ok(())
    }

    fn remove(&self, key: &str) {
        self.values.lock().expect("storage lock").remove(key);
    }
}

/// File-backed storage writing one file per key under a root directory.
#[derive(Debug, Clone)]
pub struct FileStorage {
    root: PathBuf,
}

impl FileStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(format!("{key}.json"))
    }
}

impl StoragePort for FileStorage {
    fn get(&self, key: &str) -> Option<String> {
        fs::read_to_string(self.path_for(key)).ok()
    }

    fn set(&self, key: &str, value: String) -> Result<(), StoreError> {
        fs::create_dir_all(&self.root)?;
        fs::write(self.path_for(key), value)?;
        Ok(())
    }

    fn remove(&self, key: &str) {
        let _ = fs::remove_file(self.path_for(key));
    }
}
