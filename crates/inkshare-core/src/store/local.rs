//! Browser localStorage store for WebAssembly.
//!
//! Cross-tab notification uses the window `storage` event, which the browser
//! delivers to every tab except the one that wrote the key.

use super::{BoxFuture, KeyValueStore, StoreError, StoreEvent, StoreResult, Subscription};
use std::cell::RefCell;
use std::rc::Rc;
use wasm_bindgen::JsCast;
use wasm_bindgen::prelude::*;
use web_sys::{Storage, StorageEvent};

/// Origin reported for events from other tabs; the browser does not say which.
const OTHER_TAB_ORIGIN: &str = "other-tab";

/// localStorage-backed store.
///
/// Note: This is intentionally not Send/Sync since WASM is single-threaded
/// and web-sys handles are not thread-safe.
pub struct LocalStorageStore {
    origin: String,
}

impl LocalStorageStore {
    /// Create a store over the window's localStorage.
    pub fn new() -> Self {
        Self {
            origin: uuid::Uuid::new_v4().to_string(),
        }
    }

    fn storage() -> StoreResult<Storage> {
        let window =
            web_sys::window().ok_or_else(|| StoreError::Other("No window object".to_string()))?;
        window
            .local_storage()
            .map_err(|e| StoreError::Other(format!("localStorage error: {:?}", e)))?
            .ok_or_else(|| StoreError::Other("localStorage not available".to_string()))
    }
}

impl Default for LocalStorageStore {
    fn default() -> Self {
        Self::new()
    }
}

impl KeyValueStore for LocalStorageStore {
    fn get(&self, key: &str) -> BoxFuture<'_, StoreResult<Option<String>>> {
        let key = key.to_string();
        Box::pin(async move {
            Self::storage()?
                .get_item(&key)
                .map_err(|e| StoreError::Io(format!("getItem failed: {:?}", e)))
        })
    }

    fn set(&self, key: &str, value: &str) -> BoxFuture<'_, StoreResult<()>> {
        let key = key.to_string();
        let value = value.to_string();
        Box::pin(async move {
            // Quota errors surface here.
            Self::storage()?
                .set_item(&key, &value)
                .map_err(|e| StoreError::Io(format!("setItem failed: {:?}", e)))
        })
    }

    fn subscribe(&self, key: &str) -> StoreResult<Box<dyn Subscription>> {
        let window =
            web_sys::window().ok_or_else(|| StoreError::Other("No window object".to_string()))?;
        let events = Rc::new(RefCell::new(Vec::new()));

        let watched = key.to_string();
        let events_cb = events.clone();
        let on_storage = Closure::wrap(Box::new(move |e: StorageEvent| {
            if e.key().as_deref() == Some(watched.as_str()) {
                events_cb.borrow_mut().push(StoreEvent {
                    key: watched.clone(),
                    value: e.new_value(),
                    origin: OTHER_TAB_ORIGIN.to_string(),
                });
            }
        }) as Box<dyn Fn(StorageEvent)>);

        window
            .add_event_listener_with_callback("storage", on_storage.as_ref().unchecked_ref())
            .map_err(|e| StoreError::Other(format!("addEventListener failed: {:?}", e)))?;

        Ok(Box::new(StorageSubscription {
            window,
            events,
            on_storage,
        }))
    }

    fn origin(&self) -> &str {
        &self.origin
    }
}

struct StorageSubscription {
    window: web_sys::Window,
    events: Rc<RefCell<Vec<StoreEvent>>>,
    on_storage: Closure<dyn Fn(StorageEvent)>,
}

impl Subscription for StorageSubscription {
    fn poll_events(&mut self) -> Vec<StoreEvent> {
        std::mem::take(&mut *self.events.borrow_mut())
    }
}

impl Drop for StorageSubscription {
    fn drop(&mut self) {
        let _ = self
            .window
            .remove_event_listener_with_callback("storage", self.on_storage.as_ref().unchecked_ref());
    }
}
