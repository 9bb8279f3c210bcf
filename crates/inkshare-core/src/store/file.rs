//! File-based store for native platforms.

use super::{BoxFuture, KeyValueStore, StoreError, StoreEvent, StoreResult, Subscription};
use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

/// Origin reported for changes detected on disk.
const FILE_ORIGIN: &str = "file";

/// File-based store for native platforms.
///
/// Stores each key as a file in a directory. Several processes pointing at
/// the same directory share values; subscriptions notice their writes by
/// comparing file contents when polled.
pub struct FileStore {
    /// Base directory for value files.
    base_path: PathBuf,
    origin: String,
    /// Last value this handle wrote per key, so its own writes are not reported back.
    own_writes: Arc<Mutex<HashMap<String, String>>>,
}

impl FileStore {
    /// Create a new file store with the given base directory.
    ///
    /// Creates the directory if it doesn't exist.
    pub fn new(base_path: PathBuf) -> StoreResult<Self> {
        if !base_path.exists() {
            fs::create_dir_all(&base_path).map_err(|e| {
                StoreError::Io(format!("Failed to create store directory: {}", e))
            })?;
        }
        Ok(Self {
            base_path,
            origin: Uuid::new_v4().to_string(),
            own_writes: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    /// Create a file store in the default location.
    ///
    /// On Unix: `~/.local/share/inkshare/store/`
    /// On Windows: `%LOCALAPPDATA%\inkshare\store\`
    pub fn default_location() -> StoreResult<Self> {
        let base = dirs::data_local_dir()
            .or_else(dirs::home_dir)
            .ok_or_else(|| StoreError::Io("Could not determine home directory".to_string()))?;

        Self::new(base.join("inkshare").join("store"))
    }

    /// Get the base path.
    pub fn base_path(&self) -> &Path {
        &self.base_path
    }

    /// Get the file path for a key.
    fn value_path(&self, key: &str) -> PathBuf {
        value_path(&self.base_path, key)
    }
}

fn value_path(base: &Path, key: &str) -> PathBuf {
    // Sanitize key to be safe for filenames
    let safe_key: String = key
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    base.join(format!("{}.json", safe_key))
}

fn read_value(path: &Path) -> StoreResult<Option<String>> {
    if !path.exists() {
        return Ok(None);
    }
    fs::read_to_string(path)
        .map(Some)
        .map_err(|e| StoreError::Io(format!("Failed to read {}: {}", path.display(), e)))
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> BoxFuture<'_, StoreResult<Option<String>>> {
        let path = self.value_path(key);
        Box::pin(async move { read_value(&path) })
    }

    fn set(&self, key: &str, value: &str) -> BoxFuture<'_, StoreResult<()>> {
        let path = self.value_path(key);
        let key = key.to_string();
        let value = value.to_string();

        Box::pin(async move {
            // Write a uniquely named file then rename it over the value, so
            // readers never observe a partial value and writers never share a temp file.
            let mut tmp = tempfile::NamedTempFile::new_in(&self.base_path).map_err(|e| {
                StoreError::Io(format!("Failed to create temp file: {}", e))
            })?;
            tmp.write_all(value.as_bytes()).map_err(|e| {
                StoreError::Io(format!("Failed to write {}: {}", tmp.path().display(), e))
            })?;
            tmp.persist(&path).map_err(|e| {
                StoreError::Io(format!("Failed to replace {}: {}", path.display(), e.error))
            })?;

            let mut own = self.own_writes.lock().map_err(|e| {
                StoreError::Other(format!("Lock error: {}", e))
            })?;
            own.insert(key, value);
            Ok(())
        })
    }

    fn subscribe(&self, key: &str) -> StoreResult<Box<dyn Subscription>> {
        let path = self.value_path(key);
        let last_seen = read_value(&path)?;
        Ok(Box::new(FileSubscription {
            key: key.to_string(),
            path,
            last_seen,
            own_writes: self.own_writes.clone(),
        }))
    }

    fn origin(&self) -> &str {
        &self.origin
    }
}

struct FileSubscription {
    key: String,
    path: PathBuf,
    last_seen: Option<String>,
    own_writes: Arc<Mutex<HashMap<String, String>>>,
}

impl Subscription for FileSubscription {
    fn poll_events(&mut self) -> Vec<StoreEvent> {
        let current = match read_value(&self.path) {
            Ok(v) => v,
            Err(e) => {
                log::warn!("File store poll failed: {}", e);
                return Vec::new();
            }
        };
        if current == self.last_seen {
            return Vec::new();
        }
        self.last_seen = current.clone();

        let own = self
            .own_writes
            .lock()
            .map(|own| own.get(&self.key).cloned())
            .unwrap_or(None);
        if current.is_some() && current == own {
            return Vec::new();
        }

        vec![StoreEvent {
            key: self.key.clone(),
            value: current,
            origin: FILE_ORIGIN.to_string(),
        }]
    }
}
