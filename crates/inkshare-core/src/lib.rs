//! InkShare Core Library
//!
//! A shared drawing surface that persists itself as a PNG snapshot in a
//! key-value store and follows snapshots written by other tabs or users.

pub mod context;
pub mod controller;
pub mod persistence;
pub mod picture;
pub mod presence;
pub mod protocol;
pub mod snapshot;
pub mod store;
pub mod surface;
pub mod text;

pub use context::{BlendMode, DrawingContext, Tool};
pub use controller::{DEFAULT_AUTOSAVE_INTERVAL_SECS, SurfaceController};
pub use persistence::{
    LoadOutcome, ManagerConfig, PersistenceManager, RemoteNotice, SaveOutcome, SnapshotInfo,
};
pub use picture::{ImageFormat, MAX_IMAGE_FRACTION, decode_image, fit_centered};
pub use presence::{PresenceRecord, update_presence, user_id};
pub use snapshot::{BACKUP_KEY, CANVAS_KEY, CanvasSnapshot, SnapshotError, VersionClock};
pub use store::{KeyValueStore, MemoryStore, StoreError, StoreEvent, Subscription};
pub use surface::{Surface, SurfaceError};
pub use text::TextRenderer;

#[cfg(not(target_arch = "wasm32"))]
pub use store::{FileStore, RelayStore};

#[cfg(target_arch = "wasm32")]
pub use store::LocalStorageStore;
