//! Snapshot persistence and cross-writer synchronization.
//!
//! Every save overwrites the single live snapshot under the canvas key.
//! Remote changes are applied unconditionally: the last write wins and
//! nothing is merged.

use crate::snapshot::{
    BACKUP_KEY, CANVAS_KEY, CanvasSnapshot, DEFAULT_EDITOR, SnapshotError, VersionClock,
    normalize_editor,
};
use crate::store::{KeyValueStore, StoreError, StoreEvent, Subscription};
use crate::surface::Surface;
use chrono::{DateTime, Utc};
use std::cell::{Cell, RefCell};
use std::sync::Arc;

/// Persistence configuration.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Key holding the live snapshot.
    pub key: String,
    /// Secondary key written on every save, if set.
    pub backup_key: Option<String>,
    /// Name of the local user; remote changes by anyone else produce a notice.
    pub local_editor: String,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            key: CANVAS_KEY.to_string(),
            backup_key: None,
            local_editor: DEFAULT_EDITOR.to_string(),
        }
    }
}

impl ManagerConfig {
    /// Default configuration with the backup key enabled.
    pub fn with_backup() -> Self {
        Self {
            backup_key: Some(BACKUP_KEY.to_string()),
            ..Self::default()
        }
    }
}

/// Metadata of the snapshot most recently saved or applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotInfo {
    pub editor: String,
    pub timestamp: DateTime<Utc>,
    pub version: u64,
}

impl From<&CanvasSnapshot> for SnapshotInfo {
    fn from(snapshot: &CanvasSnapshot) -> Self {
        Self {
            editor: snapshot.editor.clone(),
            timestamp: snapshot.timestamp,
            version: snapshot.version,
        }
    }
}

/// Result of a save.
#[derive(Debug)]
pub enum SaveOutcome {
    /// Snapshot written.
    Saved(SnapshotInfo),
    /// A load was in progress; nothing written.
    Skipped,
    /// The surface could not be encoded.
    EncodeFailed(SnapshotError),
    /// The store rejected the write.
    StoreFailed(StoreError),
}

impl SaveOutcome {
    pub fn is_saved(&self) -> bool {
        matches!(self, SaveOutcome::Saved(_))
    }

    pub fn info(&self) -> Option<&SnapshotInfo> {
        match self {
            SaveOutcome::Saved(info) => Some(info),
            _ => None,
        }
    }
}

/// Result of a load.
#[derive(Debug)]
pub enum LoadOutcome {
    /// Snapshot drawn onto the surface.
    Loaded(SnapshotInfo),
    /// Nothing stored under the key; surface untouched.
    NoData,
    /// Stored value is malformed; surface untouched.
    Corrupt(SnapshotError),
    /// The store could not be read; surface untouched.
    StoreFailed(StoreError),
}

impl LoadOutcome {
    pub fn is_loaded(&self) -> bool {
        matches!(self, LoadOutcome::Loaded(_))
    }
}

/// Transient on-screen notice about a change made by someone else.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteNotice {
    pub editor: String,
    pub version: u64,
    pub message: String,
}

/// Clears the loading flag when dropped, including when a load future is abandoned.
struct LoadGuard<'a>(&'a Cell<bool>);

impl<'a> LoadGuard<'a> {
    fn engage(flag: &'a Cell<bool>) -> Self {
        flag.set(true);
        Self(flag)
    }
}

impl Drop for LoadGuard<'_> {
    fn drop(&mut self) {
        self.0.set(false);
    }
}

/// Serializes the surface to the store and applies snapshots written by others.
///
/// Single-threaded: state lives in `Cell`/`RefCell` so a save can observe a
/// load that is still awaiting the store.
pub struct PersistenceManager<S: KeyValueStore + ?Sized> {
    store: Arc<S>,
    config: RefCell<ManagerConfig>,
    clock: Cell<VersionClock>,
    loading: Cell<bool>,
    last: RefCell<Option<SnapshotInfo>>,
    subscription: RefCell<Option<Box<dyn Subscription>>>,
}

impl<S: KeyValueStore + ?Sized> PersistenceManager<S> {
    /// Create a manager with the default configuration.
    pub fn new(store: Arc<S>) -> Self {
        Self::with_config(store, ManagerConfig::default())
    }

    pub fn with_config(store: Arc<S>, config: ManagerConfig) -> Self {
        Self {
            store,
            config: RefCell::new(config),
            clock: Cell::new(VersionClock::new()),
            loading: Cell::new(false),
            last: RefCell::new(None),
            subscription: RefCell::new(None),
        }
    }

    /// Get a reference to the store backend.
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn key(&self) -> String {
        self.config.borrow().key.clone()
    }

    pub fn local_editor(&self) -> String {
        self.config.borrow().local_editor.clone()
    }

    pub fn set_local_editor(&self, name: &str) {
        self.config.borrow_mut().local_editor = normalize_editor(name);
    }

    /// Whether a load or remote redraw is in progress.
    pub fn is_loading(&self) -> bool {
        self.loading.get()
    }

    /// Metadata of the last snapshot saved or applied.
    pub fn last_snapshot(&self) -> Option<SnapshotInfo> {
        self.last.borrow().clone()
    }

    /// Time of the last snapshot saved or applied.
    pub fn last_saved(&self) -> Option<DateTime<Utc>> {
        self.last.borrow().as_ref().map(|info| info.timestamp)
    }

    /// Author of the last snapshot saved or applied.
    pub fn last_editor(&self) -> Option<String> {
        self.last.borrow().as_ref().map(|info| info.editor.clone())
    }

    /// Encode the surface and write it under the canvas key.
    pub async fn save(&self, surface: &Surface, editor: &str) -> SaveOutcome {
        self.save_at(surface, editor, Utc::now()).await
    }

    /// [`save`](Self::save) with an explicit wall-clock time.
    pub async fn save_at(&self, surface: &Surface, editor: &str, now: DateTime<Utc>) -> SaveOutcome {
        if self.loading.get() {
            log::debug!("Save skipped while a load is in progress");
            return SaveOutcome::Skipped;
        }

        let editor = normalize_editor(editor);
        self.config.borrow_mut().local_editor = editor.clone();

        let mut clock = self.clock.get();
        let version = clock.next(now.timestamp_millis().max(0) as u64);
        self.clock.set(clock);

        let encoded = CanvasSnapshot::capture(surface, &editor, now, version)
            .and_then(|snapshot| snapshot.to_json().map(|json| (snapshot, json)));
        let (snapshot, json) = match encoded {
            Ok(encoded) => encoded,
            Err(e) => {
                log::error!("Failed to encode canvas snapshot: {}", e);
                return SaveOutcome::EncodeFailed(e);
            }
        };

        let (key, backup_key) = {
            let config = self.config.borrow();
            (config.key.clone(), config.backup_key.clone())
        };

        if let Err(e) = self.store.set(&key, &json).await {
            log::error!("Failed to save canvas: {}", e);
            return SaveOutcome::StoreFailed(e);
        }
        if let Some(backup_key) = backup_key {
            if let Err(e) = self.store.set(&backup_key, &json).await {
                log::warn!("Failed to write canvas backup: {}", e);
            }
        }

        let info = SnapshotInfo::from(&snapshot);
        *self.last.borrow_mut() = Some(info.clone());
        log::debug!("Canvas saved (version {}, editor {})", info.version, info.editor);
        SaveOutcome::Saved(info)
    }

    /// Read the live snapshot and draw it onto `surface`.
    pub async fn load(&self, surface: &mut Surface) -> LoadOutcome {
        let _guard = LoadGuard::engage(&self.loading);
        let key = self.key();

        let json = match self.store.get(&key).await {
            Ok(Some(json)) => json,
            Ok(None) => {
                log::info!("No saved canvas found");
                return LoadOutcome::NoData;
            }
            Err(e) => {
                log::error!("Failed to read canvas: {}", e);
                return LoadOutcome::StoreFailed(e);
            }
        };

        match self.apply(surface, &json) {
            Ok(info) => {
                log::info!("Canvas loaded (version {}, editor {})", info.version, info.editor);
                LoadOutcome::Loaded(info)
            }
            Err(e) => {
                log::error!("Error loading canvas: {}", e);
                LoadOutcome::Corrupt(e)
            }
        }
    }

    /// Start watching the canvas key for writes by other handles.
    pub fn subscribe(&self) -> Result<(), StoreError> {
        let subscription = self.store.subscribe(&self.key())?;
        *self.subscription.borrow_mut() = Some(subscription);
        Ok(())
    }

    /// Apply every pending remote change, returning the notices to show.
    pub fn poll_remote(&self, surface: &mut Surface) -> Vec<RemoteNotice> {
        let events = match self.subscription.borrow_mut().as_mut() {
            Some(subscription) => subscription.poll_events(),
            None => return Vec::new(),
        };
        events
            .iter()
            .filter_map(|event| self.on_remote_change(surface, event))
            .collect()
    }

    /// Redraw from a snapshot another writer stored.
    ///
    /// Applied without comparing versions against local state. Returns a
    /// notice when the remote editor is not the local user.
    pub fn on_remote_change(&self, surface: &mut Surface, event: &StoreEvent) -> Option<RemoteNotice> {
        let Some(json) = event.value.as_deref() else {
            log::debug!("Ignoring removal of {}", event.key);
            return None;
        };

        let _guard = LoadGuard::engage(&self.loading);
        let info = match self.apply(surface, json) {
            Ok(info) => info,
            Err(e) => {
                log::warn!("Ignoring malformed remote canvas: {}", e);
                return None;
            }
        };
        log::info!("Applied remote canvas from {} (version {})", info.editor, info.version);

        if info.editor == self.config.borrow().local_editor {
            return None;
        }
        Some(RemoteNotice {
            message: format!("{} updated the canvas", info.editor),
            editor: info.editor,
            version: info.version,
        })
    }

    /// Decode `json` fully before touching the surface.
    fn apply(&self, surface: &mut Surface, json: &str) -> Result<SnapshotInfo, SnapshotError> {
        let snapshot = CanvasSnapshot::from_json(json)?;
        let image = snapshot.decode_image()?;
        surface.replace_with(&image);

        let mut clock = self.clock.get();
        clock.observe(snapshot.version);
        self.clock.set(clock);

        let info = SnapshotInfo::from(&snapshot);
        *self.last.borrow_mut() = Some(info.clone());
        Ok(info)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::BlendMode;
    use crate::store::{BoxFuture, MemoryStore, StoreResult, block_on};
    use std::future::Future;
    use std::pin::pin;
    use std::task::{Context, Poll, Waker};

    fn painted_surface() -> Surface {
        let mut surface = Surface::new(32, 24);
        surface.blend_pixel(5, 6, 1.0, [9, 99, 199, 255], BlendMode::SourceOver);
        surface
    }

    #[test]
    fn test_save_writes_snapshot_under_key() {
        let store = Arc::new(MemoryStore::new());
        let manager = PersistenceManager::new(store.clone());

        let outcome = block_on(manager.save(&painted_surface(), "Ada"));
        assert!(outcome.is_saved());

        let json = block_on(store.get(CANVAS_KEY)).unwrap().unwrap();
        let snapshot = CanvasSnapshot::from_json(&json).unwrap();
        assert_eq!(snapshot.editor, "Ada");
        assert_eq!(manager.last_editor().as_deref(), Some("Ada"));
    }

    #[test]
    fn test_save_with_backup_key() {
        let store = Arc::new(MemoryStore::new());
        let manager = PersistenceManager::with_config(store.clone(), ManagerConfig::with_backup());

        block_on(manager.save(&painted_surface(), "Ada"));
        let live = block_on(store.get(CANVAS_KEY)).unwrap();
        let backup = block_on(store.get(BACKUP_KEY)).unwrap();
        assert!(live.is_some());
        assert_eq!(live, backup);
    }

    #[test]
    fn test_versions_strictly_increase() {
        let store = Arc::new(MemoryStore::new());
        let manager = PersistenceManager::new(store);
        let surface = painted_surface();
        let now = Utc::now();

        let first = block_on(manager.save_at(&surface, "Ada", now));
        let second = block_on(manager.save_at(&surface, "Ada", now));
        assert!(second.info().unwrap().version > first.info().unwrap().version);
    }

    #[test]
    fn test_load_without_data() {
        let store = Arc::new(MemoryStore::new());
        let manager = PersistenceManager::new(store);
        let mut surface = painted_surface();
        let before = surface.clone();

        let outcome = block_on(manager.load(&mut surface));
        assert!(matches!(outcome, LoadOutcome::NoData));
        assert_eq!(surface, before);
        assert!(!manager.is_loading());
    }

    #[test]
    fn test_load_corrupt_leaves_surface() {
        let store = Arc::new(MemoryStore::new());
        block_on(store.set(CANVAS_KEY, "{\"imageData\":\"garbage\"")).unwrap();
        let manager = PersistenceManager::new(store.clone());
        let mut surface = painted_surface();
        let before = surface.clone();

        assert!(matches!(block_on(manager.load(&mut surface)), LoadOutcome::Corrupt(_)));
        assert_eq!(surface, before);

        // Well-formed JSON with an undecodable image.
        block_on(store.set(
            CANVAS_KEY,
            r#"{"imageData":"data:image/png;base64,AAAA","timestamp":"2024-01-01T00:00:00Z","editor":"x","version":1}"#,
        ))
        .unwrap();
        assert!(matches!(block_on(manager.load(&mut surface)), LoadOutcome::Corrupt(_)));
        assert_eq!(surface, before);
    }

    /// Store whose reads stay pending until polled twice.
    struct SlowStore {
        inner: MemoryStore,
    }

    struct YieldOnce(bool);

    impl Future for YieldOnce {
        type Output = ();
        fn poll(mut self: std::pin::Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
            if self.0 {
                Poll::Ready(())
            } else {
                self.0 = true;
                cx.waker().wake_by_ref();
                Poll::Pending
            }
        }
    }

    impl KeyValueStore for SlowStore {
        fn get(&self, key: &str) -> BoxFuture<'_, StoreResult<Option<String>>> {
            let inner = self.inner.get(key);
            Box::pin(async move {
                YieldOnce(false).await;
                inner.await
            })
        }

        fn set(&self, key: &str, value: &str) -> BoxFuture<'_, StoreResult<()>> {
            self.inner.set(key, value)
        }

        fn subscribe(&self, key: &str) -> StoreResult<Box<dyn Subscription>> {
            self.inner.subscribe(key)
        }

        fn origin(&self) -> &str {
            self.inner.origin()
        }
    }

    #[test]
    fn test_save_suppressed_while_loading() {
        let store = Arc::new(SlowStore { inner: MemoryStore::new() });
        let manager = PersistenceManager::new(store.clone());
        block_on(manager.save(&painted_surface(), "Ada"));

        let mut target = Surface::new(32, 24);
        let other = Surface::new(32, 24);
        {
            let mut load = pin!(manager.load(&mut target));
            let mut cx = Context::from_waker(Waker::noop());
            assert!(load.as_mut().poll(&mut cx).is_pending());
            assert!(manager.is_loading());

            let outcome = block_on(manager.save(&other, "Ada"));
            assert!(matches!(outcome, SaveOutcome::Skipped));

            assert!(matches!(load.as_mut().poll(&mut cx), Poll::Ready(LoadOutcome::Loaded(_))));
        }
        assert!(!manager.is_loading());
        assert_eq!(target, painted_surface());
    }

    #[test]
    fn test_remote_change_notice() {
        let tab_a = Arc::new(MemoryStore::new());
        let tab_b = Arc::new(tab_a.handle());
        let writer = PersistenceManager::new(tab_a);
        let reader = PersistenceManager::new(tab_b);
        reader.set_local_editor("Bob");
        reader.subscribe().unwrap();

        block_on(writer.save(&painted_surface(), "Ada"));

        let mut surface = Surface::new(32, 24);
        let notices = reader.poll_remote(&mut surface);
        assert_eq!(notices.len(), 1);
        assert_eq!(notices[0].editor, "Ada");
        assert!(notices[0].message.contains("Ada"));
        assert_eq!(surface, painted_surface());
    }

    #[test]
    fn test_remote_change_same_editor_silent() {
        let tab_a = Arc::new(MemoryStore::new());
        let tab_b = Arc::new(tab_a.handle());
        let writer = PersistenceManager::new(tab_a);
        let reader = PersistenceManager::new(tab_b);
        reader.set_local_editor("Ada");
        reader.subscribe().unwrap();

        block_on(writer.save(&painted_surface(), "Ada"));

        let mut surface = Surface::new(32, 24);
        assert!(reader.poll_remote(&mut surface).is_empty());
        // Still redrawn.
        assert_eq!(surface, painted_surface());
    }

    #[test]
    fn test_remote_malformed_ignored() {
        let manager = PersistenceManager::new(Arc::new(MemoryStore::new()));
        let mut surface = painted_surface();
        let event = StoreEvent {
            key: CANVAS_KEY.to_string(),
            value: Some("nope".to_string()),
            origin: "x".to_string(),
        };
        assert!(manager.on_remote_change(&mut surface, &event).is_none());
        assert_eq!(surface, painted_surface());
        assert!(!manager.is_loading());
    }

    #[test]
    fn test_remote_version_advances_clock() {
        let manager = PersistenceManager::new(Arc::new(MemoryStore::new()));
        let now = Utc::now();
        let future_version = now.timestamp_millis() as u64 + 60_000;
        let snapshot = CanvasSnapshot::capture(&painted_surface(), "Eve", now, future_version).unwrap();
        let event = StoreEvent {
            key: CANVAS_KEY.to_string(),
            value: Some(snapshot.to_json().unwrap()),
            origin: "x".to_string(),
        };
        let mut surface = Surface::new(32, 24);
        manager.on_remote_change(&mut surface, &event);

        let saved = block_on(manager.save_at(&surface, "Ada", now));
        assert!(saved.info().unwrap().version > future_version);
    }
}
