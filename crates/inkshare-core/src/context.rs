//! Drawing context: the tool, color and sizes applied by each surface operation.

use peniko::Color;
use serde::{Deserialize, Serialize};

/// Default stroke width in pixels.
pub const DEFAULT_STROKE_WIDTH: f64 = 3.0;

/// Default font size in pixels.
pub const DEFAULT_FONT_SIZE: f64 = 20.0;

/// Default font family name.
pub const DEFAULT_FONT_FAMILY: &str = "Arial";

/// Available drawing tools.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tool {
    /// Freehand paint.
    #[default]
    Draw,
    /// Freehand paint removal.
    Erase,
    /// Text placement.
    Text,
}

impl Tool {
    /// Composite mode a stroke made with this tool uses.
    pub fn blend_mode(self) -> BlendMode {
        match self {
            Tool::Erase => BlendMode::DestinationOut,
            Tool::Draw | Tool::Text => BlendMode::SourceOver,
        }
    }

    /// Whether this tool produces freehand strokes.
    pub fn is_freehand(self) -> bool {
        matches!(self, Tool::Draw | Tool::Erase)
    }
}

/// How new paint is composited over existing pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlendMode {
    /// Standard alpha blending of source over destination.
    SourceOver,
    /// Removes destination paint in proportion to source coverage.
    DestinationOut,
}

/// Immutable drawing state passed into every surface operation.
///
/// Builder methods return a modified copy; nothing is shared or mutated in place.
#[derive(Debug, Clone)]
pub struct DrawingContext {
    pub tool: Tool,
    pub color: Color,
    pub stroke_width: f64,
    pub font_size: f64,
    pub font_family: String,
}

impl Default for DrawingContext {
    fn default() -> Self {
        Self {
            tool: Tool::Draw,
            color: Color::from_rgba8(0, 0, 0, 255),
            stroke_width: DEFAULT_STROKE_WIDTH,
            font_size: DEFAULT_FONT_SIZE,
            font_family: DEFAULT_FONT_FAMILY.to_string(),
        }
    }
}

impl DrawingContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tool(&self, tool: Tool) -> Self {
        Self { tool, ..self.clone() }
    }

    pub fn with_color(&self, color: Color) -> Self {
        Self { color, ..self.clone() }
    }

    /// Widths below one pixel are clamped to one.
    pub fn with_stroke_width(&self, stroke_width: f64) -> Self {
        Self {
            stroke_width: stroke_width.max(1.0),
            ..self.clone()
        }
    }

    pub fn with_font_size(&self, font_size: f64) -> Self {
        Self {
            font_size: font_size.max(1.0),
            ..self.clone()
        }
    }

    pub fn with_font_family(&self, family: impl Into<String>) -> Self {
        Self {
            font_family: family.into(),
            ..self.clone()
        }
    }

    /// Composite mode for the current tool.
    pub fn blend_mode(&self) -> BlendMode {
        self.tool.blend_mode()
    }

    /// Color as straight-alpha RGBA bytes.
    pub fn rgba(&self) -> [u8; 4] {
        color_to_rgba(self.color)
    }
}

/// Convert a color to straight-alpha RGBA bytes.
pub fn color_to_rgba(color: Color) -> [u8; 4] {
    let rgba = color.to_rgba8();
    [rgba.r, rgba.g, rgba.b, rgba.a]
}

/// Parse a CSS hex color (`#rgb`, `#rrggbb`, `#rrggbbaa`) as produced by color pickers.
pub fn parse_hex_color(input: &str) -> Option<Color> {
    let hex = input.trim().strip_prefix('#')?;
    if !hex.is_ascii() {
        return None;
    }
    let channel = |s: &str| u8::from_str_radix(s, 16).ok();
    match hex.len() {
        3 => {
            let r = channel(&hex[0..1])? * 17;
            let g = channel(&hex[1..2])? * 17;
            let b = channel(&hex[2..3])? * 17;
            Some(Color::from_rgba8(r, g, b, 255))
        }
        6 => Some(Color::from_rgba8(
            channel(&hex[0..2])?,
            channel(&hex[2..4])?,
            channel(&hex[4..6])?,
            255,
        )),
        8 => Some(Color::from_rgba8(
            channel(&hex[0..2])?,
            channel(&hex[2..4])?,
            channel(&hex[4..6])?,
            channel(&hex[6..8])?,
        )),
        _ => None,
    }
}
