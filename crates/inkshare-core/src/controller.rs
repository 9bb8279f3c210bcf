//! Tool-driven mutations of the shared surface.
//!
//! Every terminal action (stroke end, text commit, image insert, clear)
//! writes a fresh snapshot; a timer tick saves again every thirty seconds.

use crate::context::DrawingContext;
use crate::persistence::{LoadOutcome, ManagerConfig, PersistenceManager, RemoteNotice, SaveOutcome};
use crate::picture::{decode_image, fit_centered};
use crate::store::{KeyValueStore, StoreError};
use crate::surface::Surface;
use crate::text::TextRenderer;
use kurbo::{Point, Rect};
use std::sync::Arc;

#[cfg(not(target_arch = "wasm32"))]
use std::time::{Duration, Instant};

#[cfg(target_arch = "wasm32")]
use web_time::{Duration, Instant};

/// Default auto-save interval in seconds.
pub const DEFAULT_AUTOSAVE_INTERVAL_SECS: u64 = 30;

/// Owns the surface and saves it after each change.
pub struct SurfaceController<S: KeyValueStore + ?Sized> {
    surface: Surface,
    manager: PersistenceManager<S>,
    text: TextRenderer,
    /// Pen position of the stroke in progress.
    pen: Option<Point>,
    editor: String,
    interval: Duration,
    last_save: Instant,
}

impl<S: KeyValueStore + ?Sized> SurfaceController<S> {
    /// Create a controller with a blank surface and the default configuration.
    pub fn new(store: Arc<S>, width: u32, height: u32) -> Self {
        Self::with_config(store, ManagerConfig::default(), width, height)
    }

    pub fn with_config(store: Arc<S>, config: ManagerConfig, width: u32, height: u32) -> Self {
        let editor = config.local_editor.clone();
        Self {
            surface: Surface::new(width, height),
            manager: PersistenceManager::with_config(store, config),
            text: TextRenderer::builtin(),
            pen: None,
            editor,
            interval: Duration::from_secs(DEFAULT_AUTOSAVE_INTERVAL_SECS),
            last_save: Instant::now(),
        }
    }

    pub fn surface(&self) -> &Surface {
        &self.surface
    }

    pub fn manager(&self) -> &PersistenceManager<S> {
        &self.manager
    }

    pub fn editor(&self) -> &str {
        &self.editor
    }

    /// Set the name stamped on subsequent saves.
    pub fn set_editor(&mut self, name: &str) {
        self.manager.set_local_editor(name);
        self.editor = self.manager.local_editor();
    }

    /// Use a different text renderer, e.g. one backed by a font file.
    pub fn set_text_renderer(&mut self, renderer: TextRenderer) {
        self.text = renderer;
    }

    pub fn set_autosave_interval(&mut self, interval: Duration) {
        self.interval = interval;
    }

    pub fn autosave_interval(&self) -> Duration {
        self.interval
    }

    /// Whether a stroke is in progress.
    pub fn is_drawing(&self) -> bool {
        self.pen.is_some()
    }

    /// Put the pen down. Ignored for the text tool.
    pub fn begin_stroke(&mut self, ctx: &DrawingContext, point: Point) {
        if !ctx.tool.is_freehand() {
            return;
        }
        self.pen = Some(point);
    }

    /// Draw from the last pen position to `point`.
    pub fn continue_stroke(&mut self, ctx: &DrawingContext, point: Point) {
        let Some(last) = self.pen else {
            return;
        };
        self.surface
            .stroke_segment(last, point, ctx.stroke_width, ctx.rgba(), ctx.blend_mode());
        self.pen = Some(point);
    }

    /// Lift the pen and save. Returns `None` when no stroke was active.
    pub async fn end_stroke(&mut self) -> Option<SaveOutcome> {
        self.pen.take()?;
        Some(self.save_now().await)
    }

    /// Render `text` with its top-left corner at `position` and save.
    ///
    /// Blank text changes nothing and is not saved.
    pub async fn place_text(
        &mut self,
        ctx: &DrawingContext,
        position: Point,
        text: &str,
    ) -> Option<SaveOutcome> {
        let text = text.trim();
        if text.is_empty() {
            return None;
        }
        self.text.draw(
            &mut self.surface,
            position,
            text,
            ctx.font_size,
            &ctx.font_family,
            ctx.rgba(),
        );
        Some(self.save_now().await)
    }

    /// Decode an image, draw it centered at no more than half the surface
    /// size, and save. Returns where it was placed and how the save went.
    pub async fn insert_image(&mut self, data: &[u8]) -> Option<(Rect, SaveOutcome)> {
        let image = match decode_image(data) {
            Ok(image) => image,
            Err(e) => {
                log::warn!("Failed to load image: {}", e);
                return None;
            }
        };

        let target = fit_centered(
            image.width(),
            image.height(),
            self.surface.width(),
            self.surface.height(),
        );
        self.surface.draw_image(&image, target);
        Some((target, self.save_now().await))
    }

    /// Erase everything once `confirm` agrees, then save.
    pub async fn clear(&mut self, confirm: impl FnOnce() -> bool) -> Option<SaveOutcome> {
        if !confirm() {
            return None;
        }
        self.surface.clear();
        Some(self.save_now().await)
    }

    /// Resize the surface, keeping pixels anchored at the top-left.
    pub fn resize(&mut self, width: u32, height: u32) {
        self.surface.resize(width, height);
    }

    /// Auto-save when the interval has elapsed since the last save.
    pub async fn tick(&mut self, now: Instant) -> Option<SaveOutcome> {
        if now.saturating_duration_since(self.last_save) < self.interval {
            return None;
        }
        let outcome = self.manager.save(&self.surface, &self.editor).await;
        // Retry on the next interval even when the write failed.
        self.last_save = now;
        Some(outcome)
    }

    /// Save immediately.
    pub async fn save_now(&mut self) -> SaveOutcome {
        let outcome = self.manager.save(&self.surface, &self.editor).await;
        if outcome.is_saved() {
            self.last_save = Instant::now();
        }
        outcome
    }

    /// Replace the surface with the stored snapshot, if any.
    pub async fn load(&mut self) -> LoadOutcome {
        self.manager.load(&mut self.surface).await
    }

    /// Start receiving changes made by other writers.
    pub fn subscribe(&self) -> Result<(), StoreError> {
        self.manager.subscribe()
    }

    /// Apply pending remote changes and return the notices to show.
    pub fn sync(&mut self) -> Vec<RemoteNotice> {
        self.manager.poll_remote(&mut self.surface)
    }
}
