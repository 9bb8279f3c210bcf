//! Key-value store abstraction shared by every writer of the canvas.
//!
//! A store holds string values under string keys and notifies subscribers
//! when *another* handle writes a key they watch, the way browser storage
//! events reach every tab except the one that made the change.

mod memory;

#[cfg(not(target_arch = "wasm32"))]
mod file;

#[cfg(not(target_arch = "wasm32"))]
mod relay;

#[cfg(target_arch = "wasm32")]
mod local;

pub use memory::MemoryStore;

#[cfg(not(target_arch = "wasm32"))]
pub use file::FileStore;

#[cfg(not(target_arch = "wasm32"))]
pub use relay::{ConnectionState, REQUEST_TIMEOUT, RelayStore, path_for_key};

#[cfg(target_arch = "wasm32")]
pub use local::LocalStorageStore;

use std::future::Future;
use std::pin::Pin;
use thiserror::Error;

/// Storage errors.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Key not found: {0}")]
    NotFound(String),
    #[error("Serialization error: {0}")]
    Serialization(String),
    #[error("IO error: {0}")]
    Io(String),
    #[error("Connection error: {0}")]
    Connection(String),
    #[error("Storage error: {0}")]
    Other(String),
}

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Boxed future for async operations (compatible with WASM).
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + 'a>>;

/// A change to a watched key made by another store handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreEvent {
    /// Key that changed.
    pub key: String,
    /// New value, or `None` if the key was removed.
    pub value: Option<String>,
    /// Identifier of the handle that made the change.
    pub origin: String,
}

/// Receives change events for one key.
pub trait Subscription {
    /// Drain events received since the last poll (non-blocking).
    fn poll_events(&mut self) -> Vec<StoreEvent>;
}

/// Trait for key-value store backends.
///
/// Implementations can keep values in memory, in files, in browser
/// localStorage (WASM) or behind the realtime relay server.
///
/// Note: On native platforms, implementations must be Send + Sync.
/// On WASM, these bounds are relaxed since it's single-threaded.
#[cfg(not(target_arch = "wasm32"))]
pub trait KeyValueStore: Send + Sync {
    /// Read the value under `key`; `None` when absent.
    fn get(&self, key: &str) -> BoxFuture<'_, StoreResult<Option<String>>>;

    /// Overwrite the value under `key`.
    fn set(&self, key: &str, value: &str) -> BoxFuture<'_, StoreResult<()>>;

    /// Watch `key` for changes made by other handles.
    fn subscribe(&self, key: &str) -> StoreResult<Box<dyn Subscription>>;

    /// Identifier reported as `origin` on events caused by this handle.
    fn origin(&self) -> &str;
}

/// Trait for key-value store backends (WASM version without Send + Sync).
#[cfg(target_arch = "wasm32")]
pub trait KeyValueStore {
    /// Read the value under `key`; `None` when absent.
    fn get(&self, key: &str) -> BoxFuture<'_, StoreResult<Option<String>>>;

    /// Overwrite the value under `key`.
    fn set(&self, key: &str, value: &str) -> BoxFuture<'_, StoreResult<()>>;

    /// Watch `key` for changes made by other handles.
    fn subscribe(&self, key: &str) -> StoreResult<Box<dyn Subscription>>;

    /// Identifier reported as `origin` on events caused by this handle.
    fn origin(&self) -> &str;
}

/// Subscription backed by a channel receiver.
pub(crate) struct ChannelSubscription {
    rx: std::sync::mpsc::Receiver<StoreEvent>,
}

impl ChannelSubscription {
    pub(crate) fn new(rx: std::sync::mpsc::Receiver<StoreEvent>) -> Self {
        Self { rx }
    }
}

impl Subscription for ChannelSubscription {
    fn poll_events(&mut self) -> Vec<StoreEvent> {
        self.rx.try_iter().collect()
    }
}

#[cfg(test)]
pub(crate) fn block_on<F: std::future::Future>(f: F) -> F::Output {
    // Simple blocking executor for tests
    use std::task::{Context, Poll, Waker};

    let mut cx = Context::from_waker(Waker::noop());
    let mut f = std::pin::pin!(f);

    loop {
        if let Poll::Ready(result) = f.as_mut().poll(&mut cx) {
            return result;
        }
        std::thread::yield_now();
    }
}
