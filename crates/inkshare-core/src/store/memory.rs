//! In-memory store shared between handles in one process.

use super::{BoxFuture, ChannelSubscription, KeyValueStore, StoreError, StoreEvent, StoreResult, Subscription};
use std::collections::HashMap;
use std::sync::mpsc::{Sender, channel};
use std::sync::{Arc, Mutex, RwLock};
use uuid::Uuid;

struct Watcher {
    key: String,
    tx: Sender<StoreEvent>,
}

#[derive(Default)]
struct Shared {
    values: RwLock<HashMap<String, String>>,
    /// Watchers keyed by the origin of the handle that created them.
    watchers: Mutex<Vec<(String, Watcher)>>,
}

/// In-memory store for testing and same-process writers.
///
/// [`MemoryStore::handle`] creates another writer over the same values, so
/// several handles behave like browser tabs sharing one localStorage.
pub struct MemoryStore {
    shared: Arc<Shared>,
    origin: String,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self {
            shared: Arc::new(Shared::default()),
            origin: Uuid::new_v4().to_string(),
        }
    }
}

impl MemoryStore {
    /// Create a new empty memory store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Another handle over the same values, with its own origin.
    pub fn handle(&self) -> Self {
        Self {
            shared: self.shared.clone(),
            origin: Uuid::new_v4().to_string(),
        }
    }

    /// Remove a key, notifying other handles.
    pub fn remove(&self, key: &str) -> StoreResult<()> {
        {
            let mut values = self.shared.values.write().map_err(|e| {
                StoreError::Other(format!("Lock error: {}", e))
            })?;
            values.remove(key);
        }
        self.notify(key, None)
    }

    fn notify(&self, key: &str, value: Option<String>) -> StoreResult<()> {
        let mut watchers = self.shared.watchers.lock().map_err(|e| {
            StoreError::Other(format!("Lock error: {}", e))
        })?;
        watchers.retain(|(origin, watcher)| {
            if watcher.key != key || *origin == self.origin {
                return true;
            }
            let event = StoreEvent {
                key: key.to_string(),
                value: value.clone(),
                origin: self.origin.clone(),
            };
            // Dropped subscriptions are pruned.
            watcher.tx.send(event).is_ok()
        });
        Ok(())
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> BoxFuture<'_, StoreResult<Option<String>>> {
        let key = key.to_string();
        Box::pin(async move {
            let values = self.shared.values.read().map_err(|e| {
                StoreError::Other(format!("Lock error: {}", e))
            })?;
            Ok(values.get(&key).cloned())
        })
    }

    fn set(&self, key: &str, value: &str) -> BoxFuture<'_, StoreResult<()>> {
        let key = key.to_string();
        let value = value.to_string();
        Box::pin(async move {
            {
                let mut values = self.shared.values.write().map_err(|e| {
                    StoreError::Other(format!("Lock error: {}", e))
                })?;
                values.insert(key.clone(), value.clone());
            }
            self.notify(&key, Some(value))
        })
    }

    fn subscribe(&self, key: &str) -> StoreResult<Box<dyn Subscription>> {
        let (tx, rx) = channel();
        let mut watchers = self.shared.watchers.lock().map_err(|e| {
            StoreError::Other(format!("Lock error: {}", e))
        })?;
        watchers.push((
            self.origin.clone(),
            Watcher {
                key: key.to_string(),
                tx,
            },
        ));
        Ok(Box::new(ChannelSubscription::new(rx)))
    }

    fn origin(&self) -> &str {
        &self.origin
    }
}
