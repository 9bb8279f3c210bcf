//! Raster image import: format detection, decoding and placement on the surface.

use crate::surface::SurfaceError;
use image::RgbaImage;
use kurbo::Rect;
use serde::{Deserialize, Serialize};

/// Largest fraction of each surface dimension an inserted image may occupy.
pub const MAX_IMAGE_FRACTION: f64 = 0.5;

/// Image format for incoming image data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ImageFormat {
    /// PNG format.
    Png,
    /// JPEG format.
    Jpeg,
    /// WebP format.
    WebP,
}

impl ImageFormat {
    /// Get MIME type for this format.
    pub fn mime_type(&self) -> &'static str {
        match self {
            ImageFormat::Png => "image/png",
            ImageFormat::Jpeg => "image/jpeg",
            ImageFormat::WebP => "image/webp",
        }
    }

    /// Detect format from a MIME type such as a clipboard item or file input reports.
    pub fn from_mime_type(mime: &str) -> Option<Self> {
        match mime.trim().to_ascii_lowercase().as_str() {
            "image/png" => Some(ImageFormat::Png),
            "image/jpeg" | "image/jpg" => Some(ImageFormat::Jpeg),
            "image/webp" => Some(ImageFormat::WebP),
            _ => None,
        }
    }

    /// Detect format from file extension.
    pub fn from_extension(ext: &str) -> Option<Self> {
        match ext.to_lowercase().as_str() {
            "png" => Some(ImageFormat::Png),
            "jpg" | "jpeg" => Some(ImageFormat::Jpeg),
            "webp" => Some(ImageFormat::WebP),
            _ => None,
        }
    }

    /// Detect format from magic bytes.
    pub fn from_magic_bytes(data: &[u8]) -> Option<Self> {
        if data.len() < 4 {
            return None;
        }

        // PNG: 89 50 4E 47
        if data.starts_with(&[0x89, 0x50, 0x4E, 0x47]) {
            return Some(ImageFormat::Png);
        }

        // JPEG: FF D8 FF
        if data.starts_with(&[0xFF, 0xD8, 0xFF]) {
            return Some(ImageFormat::Jpeg);
        }

        // WebP: RIFF....WEBP
        if data.len() >= 12 && &data[0..4] == b"RIFF" && &data[8..12] == b"WEBP" {
            return Some(ImageFormat::WebP);
        }

        None
    }

    fn as_image_format(self) -> image::ImageFormat {
        match self {
            ImageFormat::Png => image::ImageFormat::Png,
            ImageFormat::Jpeg => image::ImageFormat::Jpeg,
            ImageFormat::WebP => image::ImageFormat::WebP,
        }
    }
}

/// Decode PNG, JPEG or WebP bytes into an RGBA buffer.
pub fn decode_image(data: &[u8]) -> Result<RgbaImage, SurfaceError> {
    let format = ImageFormat::from_magic_bytes(data)
        .ok_or_else(|| SurfaceError::Decode("Unrecognized image format".to_string()))?;
    let decoded = image::load_from_memory_with_format(data, format.as_image_format())
        .map_err(|e| SurfaceError::Decode(e.to_string()))?;
    Ok(decoded.to_rgba8())
}

/// Placement of a `width` x `height` image on a surface of the given size.
///
/// Images larger than half the surface in either dimension are scaled down
/// uniformly to fit; smaller images keep their natural size. The result is
/// centered on the surface.
pub fn fit_centered(width: u32, height: u32, surface_width: u32, surface_height: u32) -> Rect {
    let max_width = surface_width as f64 * MAX_IMAGE_FRACTION;
    let max_height = surface_height as f64 * MAX_IMAGE_FRACTION;
    let mut w = width as f64;
    let mut h = height as f64;

    if (w > max_width || h > max_height) && w > 0.0 && h > 0.0 {
        let ratio = (max_width / w).min(max_height / h);
        w *= ratio;
        h *= ratio;
    }

    let x = (surface_width as f64 - w) / 2.0;
    let y = (surface_height as f64 - h) / 2.0;
    Rect::from_origin_size((x, y), (w, h))
}
