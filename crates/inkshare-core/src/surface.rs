//! Raster drawing surface.
//!
//! An RGBA pixel buffer with straight (non-premultiplied) alpha. Strokes are
//! rasterized as anti-aliased round-capped segments and composited with either
//! source-over or destination-out blending.

use crate::context::BlendMode;
use image::{Rgba, RgbaImage, imageops};
use kurbo::{Point, Rect, Vec2};
use thiserror::Error;

/// Surface errors.
#[derive(Debug, Error)]
pub enum SurfaceError {
    #[error("Image decode error: {0}")]
    Decode(String),
    #[error("Image encode error: {0}")]
    Encode(String),
    #[error("Font error: {0}")]
    Font(String),
}

const TRANSPARENT: Rgba<u8> = Rgba([0, 0, 0, 0]);

/// A drawable RGBA surface.
#[derive(Debug, Clone, PartialEq)]
pub struct Surface {
    pixels: RgbaImage,
}

impl Surface {
    /// Create a fully transparent surface.
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            pixels: RgbaImage::from_pixel(width, height, TRANSPARENT),
        }
    }

    /// Wrap an existing pixel buffer.
    pub fn from_image(pixels: RgbaImage) -> Self {
        Self { pixels }
    }

    pub fn width(&self) -> u32 {
        self.pixels.width()
    }

    pub fn height(&self) -> u32 {
        self.pixels.height()
    }

    /// Surface bounds as a rectangle anchored at the origin.
    pub fn bounds(&self) -> Rect {
        Rect::new(0.0, 0.0, self.width() as f64, self.height() as f64)
    }

    pub fn pixels(&self) -> &RgbaImage {
        &self.pixels
    }

    /// Pixel at the given coordinates, if inside the surface.
    pub fn pixel(&self, x: u32, y: u32) -> Option<[u8; 4]> {
        self.pixels.get_pixel_checked(x, y).map(|p| p.0)
    }

    /// Whether every pixel is fully transparent.
    pub fn is_blank(&self) -> bool {
        self.pixels.pixels().all(|p| p.0[3] == 0)
    }

    /// Reset every pixel to transparent.
    pub fn clear(&mut self) {
        for p in self.pixels.pixels_mut() {
            *p = TRANSPARENT;
        }
    }

    /// Resize the surface, keeping existing pixels anchored at the top-left corner.
    pub fn resize(&mut self, width: u32, height: u32) {
        if width == self.width() && height == self.height() {
            return;
        }
        let mut resized = RgbaImage::from_pixel(width, height, TRANSPARENT);
        imageops::replace(&mut resized, &self.pixels, 0, 0);
        self.pixels = resized;
    }

    /// Replace the surface contents with `image` drawn at the origin.
    ///
    /// The surface keeps its own dimensions; the image is clipped or padded
    /// with transparency as needed.
    pub fn replace_with(&mut self, image: &RgbaImage) {
        self.clear();
        imageops::replace(&mut self.pixels, image, 0, 0);
    }

    /// Stroke a straight segment with round caps.
    pub fn stroke_segment(
        &mut self,
        from: Point,
        to: Point,
        width: f64,
        color: [u8; 4],
        mode: BlendMode,
    ) {
        let radius = (width / 2.0).max(0.5);
        let reach = radius + 1.0;
        let x0 = (from.x.min(to.x) - reach).floor().max(0.0) as i64;
        let y0 = (from.y.min(to.y) - reach).floor().max(0.0) as i64;
        let x1 = (from.x.max(to.x) + reach).ceil().min(self.width() as f64) as i64;
        let y1 = (from.y.max(to.y) + reach).ceil().min(self.height() as f64) as i64;

        for y in y0..y1 {
            for x in x0..x1 {
                let center = Point::new(x as f64 + 0.5, y as f64 + 0.5);
                let distance = distance_to_segment(center, from, to);
                let coverage = (radius + 0.5 - distance).clamp(0.0, 1.0) as f32;
                if coverage > 0.0 {
                    self.blend_pixel(x, y, coverage, color, mode);
                }
            }
        }
    }

    /// Fill an axis-aligned rectangle, painting pixels whose centers fall inside it.
    pub fn fill_rect(&mut self, rect: Rect, color: [u8; 4], mode: BlendMode) {
        let x0 = (rect.x0 - 0.5).ceil().max(0.0) as i64;
        let y0 = (rect.y0 - 0.5).ceil().max(0.0) as i64;
        let x1 = (rect.x1 - 0.5).ceil().min(self.width() as f64) as i64;
        let y1 = (rect.y1 - 0.5).ceil().min(self.height() as f64) as i64;
        for y in y0..y1 {
            for x in x0..x1 {
                self.blend_pixel(x, y, 1.0, color, mode);
            }
        }
    }

    /// Draw `image` scaled into `target`, blending source-over.
    pub fn draw_image(&mut self, image: &RgbaImage, target: Rect) {
        let width = target.width().round().max(1.0) as u32;
        let height = target.height().round().max(1.0) as u32;
        let scaled = if width == image.width() && height == image.height() {
            image.clone()
        } else {
            imageops::resize(image, width, height, imageops::FilterType::Triangle)
        };
        imageops::overlay(
            &mut self.pixels,
            &scaled,
            target.x0.round() as i64,
            target.y0.round() as i64,
        );
    }

    /// Composite a single pixel with the given coverage. Out-of-bounds writes are ignored.
    pub fn blend_pixel(&mut self, x: i64, y: i64, coverage: f32, color: [u8; 4], mode: BlendMode) {
        if x < 0 || y < 0 || x >= self.width() as i64 || y >= self.height() as i64 {
            return;
        }
        let dst = self.pixels.get_pixel_mut(x as u32, y as u32);
        *dst = Rgba(composite(dst.0, color, coverage, mode));
    }

    /// Encode the surface as PNG bytes.
    pub fn encode_png(&self) -> Result<Vec<u8>, SurfaceError> {
        let mut png_data = Vec::new();
        {
            let mut encoder = png::Encoder::new(&mut png_data, self.width(), self.height());
            encoder.set_color(png::ColorType::Rgba);
            encoder.set_depth(png::BitDepth::Eight);

            let mut writer = encoder
                .write_header()
                .map_err(|e| SurfaceError::Encode(format!("PNG header: {}", e)))?;
            writer
                .write_image_data(self.pixels.as_raw())
                .map_err(|e| SurfaceError::Encode(format!("PNG data: {}", e)))?;
        }
        Ok(png_data)
    }
}

fn distance_to_segment(p: Point, a: Point, b: Point) -> f64 {
    let ab: Vec2 = b - a;
    let len_sq = ab.hypot2();
    if len_sq <= f64::EPSILON {
        return (p - a).hypot();
    }
    let t = ((p - a).dot(ab) / len_sq).clamp(0.0, 1.0);
    (p - (a + ab * t)).hypot()
}

fn composite(dst: [u8; 4], src: [u8; 4], coverage: f32, mode: BlendMode) -> [u8; 4] {
    let sa = (src[3] as f32 / 255.0) * coverage;
    let da = dst[3] as f32 / 255.0;
    match mode {
        BlendMode::SourceOver => {
            let out_a = sa + da * (1.0 - sa);
            if out_a <= 0.0 {
                return [0, 0, 0, 0];
            }
            let channel = |s: u8, d: u8| {
                let v = (s as f32 * sa + d as f32 * da * (1.0 - sa)) / out_a;
                v.round().clamp(0.0, 255.0) as u8
            };
            [
                channel(src[0], dst[0]),
                channel(src[1], dst[1]),
                channel(src[2], dst[2]),
                (out_a * 255.0).round().clamp(0.0, 255.0) as u8,
            ]
        }
        BlendMode::DestinationOut => {
            let out_a = (da * (1.0 - sa) * 255.0).round().clamp(0.0, 255.0) as u8;
            if out_a == 0 {
                [0, 0, 0, 0]
            } else {
                [dst[0], dst[1], dst[2], out_a]
            }
        }
    }
}
