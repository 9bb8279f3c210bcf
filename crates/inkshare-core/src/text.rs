//! Text rasterization onto a [`Surface`].
//!
//! When a font file is supplied, glyphs are outlined with `ab_glyph`. Without
//! one, a built-in 5x7 bitmap face scaled to the requested size is used so text
//! placement works on hosts with no fonts installed.

use crate::context::BlendMode;
use crate::surface::{Surface, SurfaceError};
use ab_glyph::{Font, FontVec, PxScale, ScaleFont};
use kurbo::{Point, Rect, Size};
use std::collections::HashMap;
use std::path::Path;

/// Bitmap glyph cell: 5 columns by 7 rows, drawn in a 6x8 advance box.
const CELL_COLUMNS: f64 = 6.0;
const CELL_ROWS: f64 = 8.0;

/// Renders text with loaded fonts or the built-in bitmap face.
///
/// Fonts are registered per family name. A family that was never registered
/// falls back to the default font, and without one to the bitmap face.
#[derive(Default)]
pub struct TextRenderer {
    default_font: Option<FontVec>,
    families: HashMap<String, FontVec>,
}

impl std::fmt::Debug for TextRenderer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TextRenderer")
            .field("default_font", &self.default_font.is_some())
            .field("families", &self.families.keys().collect::<Vec<_>>())
            .finish()
    }
}

fn parse_font(data: Vec<u8>) -> Result<FontVec, SurfaceError> {
    FontVec::try_from_vec(data).map_err(|e| SurfaceError::Font(e.to_string()))
}

fn read_font_file(path: &Path) -> Result<Vec<u8>, SurfaceError> {
    std::fs::read(path)
        .map_err(|e| SurfaceError::Font(format!("Failed to read {}: {}", path.display(), e)))
}

impl TextRenderer {
    /// Renderer using the built-in bitmap face.
    pub fn builtin() -> Self {
        Self::default()
    }

    /// Load a TrueType/OpenType font from raw bytes as the default font.
    pub fn from_font_bytes(data: Vec<u8>) -> Result<Self, SurfaceError> {
        Ok(Self {
            default_font: Some(parse_font(data)?),
            families: HashMap::new(),
        })
    }

    /// Load a TrueType/OpenType font file as the default font.
    pub fn from_font_file(path: &Path) -> Result<Self, SurfaceError> {
        Self::from_font_bytes(read_font_file(path)?)
    }

    /// Register a font for a family name (matched case-insensitively).
    pub fn add_family(&mut self, family: &str, data: Vec<u8>) -> Result<(), SurfaceError> {
        let font = parse_font(data)?;
        self.families.insert(family_key(family), font);
        Ok(())
    }

    /// Register a font file for a family name.
    pub fn add_family_file(&mut self, family: &str, path: &Path) -> Result<(), SurfaceError> {
        self.add_family(family, read_font_file(path)?)
    }

    /// Whether any font file is loaded.
    pub fn has_font(&self) -> bool {
        self.default_font.is_some() || !self.families.is_empty()
    }

    /// Whether `family` has its own registered font.
    pub fn has_family(&self, family: &str) -> bool {
        self.families.contains_key(&family_key(family))
    }

    fn font_for(&self, family: &str) -> Option<&FontVec> {
        self.families
            .get(&family_key(family))
            .or(self.default_font.as_ref())
    }

    /// Draw `text` in `family` with its top-left corner at `origin`.
    ///
    /// Returns the area the text occupies.
    pub fn draw(
        &self,
        surface: &mut Surface,
        origin: Point,
        text: &str,
        size: f64,
        family: &str,
        color: [u8; 4],
    ) -> Rect {
        match self.font_for(family) {
            Some(font) => draw_outlined(font, surface, origin, text, size, color),
            None => draw_bitmap(surface, origin, text, size, color),
        }
    }

    /// Size of `text` at the given font size without drawing it.
    pub fn measure(&self, text: &str, size: f64, family: &str) -> Size {
        match self.font_for(family) {
            Some(font) => {
                let scaled = font.as_scaled(PxScale::from(size as f32));
                let mut width = 0.0f32;
                let mut prev = None;
                for ch in text.chars() {
                    let id = scaled.glyph_id(ch);
                    if let Some(p) = prev {
                        width += scaled.kern(p, id);
                    }
                    width += scaled.h_advance(id);
                    prev = Some(id);
                }
                Size::new(width as f64, scaled.height() as f64)
            }
            None => {
                let cell = size / CELL_ROWS;
                Size::new(text.chars().count() as f64 * CELL_COLUMNS * cell, size)
            }
        }
    }
}

fn family_key(family: &str) -> String {
    family.trim().to_lowercase()
}

fn draw_outlined(
    font: &FontVec,
    surface: &mut Surface,
    origin: Point,
    text: &str,
    size: f64,
    color: [u8; 4],
) -> Rect {
    let scale = PxScale::from(size as f32);
    let scaled = font.as_scaled(scale);
    let mut caret = ab_glyph::point(origin.x as f32, origin.y as f32 + scaled.ascent());
    let mut prev = None;

    for ch in text.chars() {
        let id = scaled.glyph_id(ch);
        if let Some(p) = prev {
            caret.x += scaled.kern(p, id);
        }
        let glyph = id.with_scale_and_position(scale, caret);
        caret.x += scaled.h_advance(id);
        prev = Some(id);

        if let Some(outlined) = font.outline_glyph(glyph) {
            let bounds = outlined.px_bounds();
            let left = bounds.min.x as i64;
            let top = bounds.min.y as i64;
            outlined.draw(|gx, gy, coverage| {
                surface.blend_pixel(
                    left + gx as i64,
                    top + gy as i64,
                    coverage,
                    color,
                    BlendMode::SourceOver,
                );
            });
        }
    }

    Rect::new(
        origin.x,
        origin.y,
        caret.x as f64,
        origin.y + scaled.height() as f64,
    )
}

fn draw_bitmap(surface: &mut Surface, origin: Point, text: &str, size: f64, color: [u8; 4]) -> Rect {
    let cell = size / CELL_ROWS;
    let mut x = origin.x;

    for ch in text.chars() {
        for (row, bits) in glyph_rows(ch).iter().enumerate() {
            for col in 0..5u32 {
                if (bits >> (4 - col)) & 1 == 1 {
                    let x0 = x + col as f64 * cell;
                    let y0 = origin.y + row as f64 * cell;
                    surface.fill_rect(
                        Rect::new(x0, y0, x0 + cell, y0 + cell),
                        color,
                        BlendMode::SourceOver,
                    );
                }
            }
        }
        x += CELL_COLUMNS * cell;
    }

    Rect::new(origin.x, origin.y, x, origin.y + size)
}

/// 5x7 bitmap rows for a character; lower case shares the upper-case shapes.
fn glyph_rows(ch: char) -> [u8; 7] {
    match ch.to_ascii_uppercase() {
        'A' => [0b01110, 0b10001, 0b10001, 0b11111, 0b10001, 0b10001, 0b10001],
        'B' => [0b11110, 0b10001, 0b10001, 0b11110, 0b10001, 0b10001, 0b11110],
        'C' => [0b01110, 0b10001, 0b10000, 0b10000, 0b10000, 0b10001, 0b01110],
        'D' => [0b11110, 0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b11110],
        'E' => [0b11111, 0b10000, 0b10000, 0b11110, 0b10000, 0b10000, 0b11111],
        'F' => [0b11111, 0b10000, 0b10000, 0b11110, 0b10000, 0b10000, 0b10000],
        'G' => [0b01110, 0b10001, 0b10000, 0b10111, 0b10001, 0b10001, 0b01111],
        'H' => [0b10001, 0b10001, 0b10001, 0b11111, 0b10001, 0b10001, 0b10001],
        'I' => [0b01110, 0b00100, 0b00100, 0b00100, 0b00100, 0b00100, 0b01110],
        'J' => [0b00111, 0b00010, 0b00010, 0b00010, 0b00010, 0b10010, 0b01100],
        'K' => [0b10001, 0b10010, 0b10100, 0b11000, 0b10100, 0b10010, 0b10001],
        'L' => [0b10000, 0b10000, 0b10000, 0b10000, 0b10000, 0b10000, 0b11111],
        'M' => [0b10001, 0b11011, 0b10101, 0b10101, 0b10001, 0b10001, 0b10001],
        'N' => [0b10001, 0b11001, 0b10101, 0b10011, 0b10001, 0b10001, 0b10001],
        'O' => [0b01110, 0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b01110],
        'P' => [0b11110, 0b10001, 0b10001, 0b11110, 0b10000, 0b10000, 0b10000],
        'Q' => [0b01110, 0b10001, 0b10001, 0b10001, 0b10101, 0b10010, 0b01101],
        'R' => [0b11110, 0b10001, 0b10001, 0b11110, 0b10100, 0b10010, 0b10001],
        'S' => [0b01111, 0b10000, 0b10000, 0b01110, 0b00001, 0b00001, 0b11110],
        'T' => [0b11111, 0b00100, 0b00100, 0b00100, 0b00100, 0b00100, 0b00100],
        'U' => [0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b01110],
        'V' => [0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b01010, 0b00100],
        'W' => [0b10001, 0b10001, 0b10001, 0b10101, 0b10101, 0b11011, 0b10001],
        'X' => [0b10001, 0b10001, 0b01010, 0b00100, 0b01010, 0b10001, 0b10001],
        'Y' => [0b10001, 0b10001, 0b01010, 0b00100, 0b00100, 0b00100, 0b00100],
        'Z' => [0b11111, 0b00001, 0b00010, 0b00100, 0b01000, 0b10000, 0b11111],
        '0' => [0b01110, 0b10001, 0b10011, 0b10101, 0b11001, 0b10001, 0b01110],
        '1' => [0b00100, 0b01100, 0b00100, 0b00100, 0b00100, 0b00100, 0b01110],
        '2' => [0b01110, 0b10001, 0b00001, 0b00010, 0b00100, 0b01000, 0b11111],
        '3' => [0b11111, 0b00010, 0b00100, 0b00010, 0b00001, 0b10001, 0b01110],
        '4' => [0b00010, 0b00110, 0b01010, 0b10010, 0b11111, 0b00010, 0b00010],
        '5' => [0b11111, 0b10000, 0b11110, 0b00001, 0b00001, 0b10001, 0b01110],
        '6' => [0b00110, 0b01000, 0b10000, 0b11110, 0b10001, 0b10001, 0b01110],
        '7' => [0b11111, 0b00001, 0b00010, 0b00100, 0b01000, 0b01000, 0b01000],
        '8' => [0b01110, 0b10001, 0b10001, 0b01110, 0b10001, 0b10001, 0b01110],
        '9' => [0b01110, 0b10001, 0b10001, 0b01111, 0b00001, 0b00010, 0b01100],
        '.' => [0b00000, 0b00000, 0b00000, 0b00000, 0b00000, 0b01100, 0b01100],
        ',' => [0b00000, 0b00000, 0b00000, 0b00000, 0b01100, 0b00100, 0b01000],
        ':' => [0b00000, 0b01100, 0b01100, 0b00000, 0b01100, 0b01100, 0b00000],
        '!' => [0b00100, 0b00100, 0b00100, 0b00100, 0b00100, 0b00000, 0b00100],
        '?' => [0b01110, 0b10001, 0b00001, 0b00010, 0b00100, 0b00000, 0b00100],
        '\'' => [0b00100, 0b00100, 0b01000, 0b00000, 0b00000, 0b00000, 0b00000],
        '"' => [0b01010, 0b01010, 0b00000, 0b00000, 0b00000, 0b00000, 0b00000],
        '-' => [0b00000, 0b00000, 0b00000, 0b11111, 0b00000, 0b00000, 0b00000],
        '+' => [0b00000, 0b00100, 0b00100, 0b11111, 0b00100, 0b00100, 0b00000],
        '=' => [0b00000, 0b00000, 0b11111, 0b00000, 0b11111, 0b00000, 0b00000],
        '/' => [0b00000, 0b00001, 0b00010, 0b00100, 0b01000, 0b10000, 0b00000],
        '(' => [0b00010, 0b00100, 0b01000, 0b01000, 0b01000, 0b00100, 0b00010],
        ')' => [0b01000, 0b00100, 0b00010, 0b00010, 0b00010, 0b00100, 0b01000],
        '#' => [0b01010, 0b01010, 0b11111, 0b01010, 0b11111, 0b01010, 0b01010],
        '@' => [0b01110, 0b10001, 0b10111, 0b10101, 0b10111, 0b10000, 0b01110],
        '&' => [0b01100, 0b10010, 0b10100, 0b01000, 0b10101, 0b10010, 0b01101],
        '_' => [0b00000, 0b00000, 0b00000, 0b00000, 0b00000, 0b00000, 0b11111],
        ' ' => [0; 7],
        // Unknown characters render as a hollow box.
        _ => [0b11111, 0b10001, 0b10001, 0b10001, 0b10001, 0b10001, 0b11111],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BLUE: [u8; 4] = [0, 0, 255, 255];

    #[test]
    fn test_builtin_draws_top_left_anchored() {
        let mut surface = Surface::new(100, 40);
        let renderer = TextRenderer::builtin();
        let area = renderer.draw(&mut surface, Point::new(10.0, 5.0), "I", 16.0, "Arial", BLUE);

        // 16px font: each bitmap cell is 2x2 pixels. 'I' top row is 0b01110.
        assert_eq!(surface.pixel(12, 5), Some(BLUE));
        assert_eq!(surface.pixel(10, 5).map(|p| p[3]), Some(0));
        // Nothing above the origin.
        assert_eq!(surface.pixel(12, 4).map(|p| p[3]), Some(0));
        assert!((area.x0 - 10.0).abs() < f64::EPSILON);
        assert!((area.height() - 16.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_space_draws_nothing() {
        let mut surface = Surface::new(50, 20);
        TextRenderer::builtin().draw(&mut surface, Point::new(0.0, 0.0), "   ", 8.0, "Arial", BLUE);
        assert!(surface.is_blank());
    }

    #[test]
    fn test_measure_builtin() {
        let renderer = TextRenderer::builtin();
        let size = renderer.measure("ab", 8.0, "Arial");
        assert!((size.width - 12.0).abs() < f64::EPSILON);
        assert!((size.height - 8.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_invalid_font_bytes() {
        let result = TextRenderer::from_font_bytes(vec![0, 1, 2, 3]);
        assert!(matches!(result, Err(SurfaceError::Font(_))));
    }

    /// A TrueType font from the host, or `None` when none is installed.
    fn system_font() -> Option<Vec<u8>> {
        let candidates = [
            std::env::var("INKSHARE_TEST_FONT").unwrap_or_default(),
            "/usr/share/fonts/truetype/dejavu/DejaVuSans.ttf".to_string(),
            "/usr/share/fonts/dejavu/DejaVuSans.ttf".to_string(),
            "/usr/share/fonts/TTF/DejaVuSans.ttf".to_string(),
            "/usr/share/fonts/truetype/liberation/LiberationSans-Regular.ttf".to_string(),
            "/System/Library/Fonts/Supplemental/Arial.ttf".to_string(),
            "C:\\Windows\\Fonts\\arial.ttf".to_string(),
        ];
        candidates
            .iter()
            .filter(|path| !path.is_empty())
            .find_map(|path| std::fs::read(path).ok())
    }

    fn painted_bounds(surface: &Surface) -> Option<(u32, u32, u32, u32)> {
        let mut bounds: Option<(u32, u32, u32, u32)> = None;
        for (x, y, p) in surface.pixels().enumerate_pixels() {
            if p[3] == 0 {
                continue;
            }
            bounds = Some(match bounds {
                None => (x, y, x, y),
                Some((x0, y0, x1, y1)) => (x0.min(x), y0.min(y), x1.max(x), y1.max(y)),
            });
        }
        bounds
    }

    #[test]
    fn test_outlined_text_top_left_anchored() {
        let Some(data) = system_font() else {
            eprintln!("no system font found, skipping outlined text check");
            return;
        };
        let renderer = TextRenderer::from_font_bytes(data).unwrap();
        assert!(renderer.has_font());

        let mut surface = Surface::new(200, 100);
        let origin = Point::new(20.0, 30.0);
        let area = renderer.draw(&mut surface, origin, "HH", 32.0, "Arial", BLUE);

        let (x0, y0, x1, y1) = painted_bounds(&surface).unwrap();
        // Cap height sits below the top edge, within the first line.
        assert!(y0 >= 30, "ink above origin at y={}", y0);
        assert!(y0 < 30 + 16, "ink starts too low at y={}", y0);
        assert!(x0 >= 19, "ink left of origin at x={}", x0);
        assert!((x1 as f64) <= area.x1 + 1.0);
        assert!((y1 as f64) <= area.y1 + 1.0);
        assert!((area.x0 - origin.x).abs() < f64::EPSILON);
        assert!((area.width() - renderer.measure("HH", 32.0, "Arial").width).abs() < 1.0);
    }

    #[test]
    fn test_family_lookup_falls_back() {
        let Some(data) = system_font() else {
            eprintln!("no system font found, skipping family lookup check");
            return;
        };
        let mut renderer = TextRenderer::builtin();
        renderer.add_family("Sans", data).unwrap();
        assert!(renderer.has_family("  sans "));
        assert!(!renderer.has_family("Arial"));

        // Registered family is outlined; anything else uses the bitmap face.
        let outlined = renderer.measure("ab", 8.0, "SANS");
        let bitmap = renderer.measure("ab", 8.0, "Arial");
        assert!((bitmap.width - 12.0).abs() < f64::EPSILON);
        assert!((outlined.width - bitmap.width).abs() > f64::EPSILON);
    }

    #[test]
    fn test_lowercase_shares_uppercase_glyph() {
        assert_eq!(glyph_rows('q'), glyph_rows('Q'));
        assert_ne!(glyph_rows('?'), glyph_rows('~'));
    }
}
