//! Canvas snapshot: one full serialized state of the surface plus metadata.

use crate::picture::{ImageFormat, decode_image};
use crate::surface::{Surface, SurfaceError};
use base64::{Engine, engine::general_purpose::STANDARD};
use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use image::RgbaImage;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

/// Store key holding the live snapshot.
pub const CANVAS_KEY: &str = "collaborative-canvas";

/// Optional secondary key written alongside the live snapshot.
pub const BACKUP_KEY: &str = "collaborative-canvas-backup";

/// Editor name used when none is given.
pub const DEFAULT_EDITOR: &str = "Anonymous";

const DATA_URL_PREFIX: &str = "data:";
const BASE64_MARKER: &str = ";base64";

/// Snapshot errors.
#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("Malformed snapshot JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Malformed image data URL: {0}")]
    DataUrl(String),
    #[error(transparent)]
    Image(#[from] SurfaceError),
}

/// A full-state snapshot of the drawing surface.
///
/// Serialized with the camelCase field names other writers of the shared key use.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CanvasSnapshot {
    /// `data:image/png;base64,...` encoding of the surface.
    pub image_data: String,
    /// Creation time, written as ISO-8601 with millisecond precision.
    #[serde(
        serialize_with = "serialize_timestamp",
        deserialize_with = "deserialize_timestamp"
    )]
    pub timestamp: DateTime<Utc>,
    pub editor: String,
    /// Wall-clock derived counter; absent in snapshots from writers that predate it.
    #[serde(default)]
    pub version: u64,
}

impl CanvasSnapshot {
    /// Capture the current surface contents.
    pub fn capture(
        surface: &Surface,
        editor: &str,
        timestamp: DateTime<Utc>,
        version: u64,
    ) -> Result<Self, SnapshotError> {
        let png = surface.encode_png()?;
        Ok(Self {
            image_data: encode_data_url(ImageFormat::Png, &png),
            timestamp: timestamp.trunc_subsecs(3),
            editor: normalize_editor(editor),
            version,
        })
    }

    /// Serialize to JSON.
    pub fn to_json(&self) -> Result<String, SnapshotError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parse from JSON.
    pub fn from_json(json: &str) -> Result<Self, SnapshotError> {
        Ok(serde_json::from_str(json)?)
    }

    /// Decode the embedded image.
    pub fn decode_image(&self) -> Result<RgbaImage, SnapshotError> {
        let (_, bytes) = decode_data_url(&self.image_data)?;
        Ok(decode_image(&bytes)?)
    }
}

/// Editor name with surrounding whitespace removed, or the default when blank.
pub fn normalize_editor(name: &str) -> String {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        DEFAULT_EDITOR.to_string()
    } else {
        trimmed.to_string()
    }
}

/// Build a base64 data URL for image bytes.
pub fn encode_data_url(format: ImageFormat, data: &[u8]) -> String {
    format!(
        "{}{}{},{}",
        DATA_URL_PREFIX,
        format.mime_type(),
        BASE64_MARKER,
        STANDARD.encode(data)
    )
}

/// Split a base64 image data URL into its declared MIME type and raw bytes.
pub fn decode_data_url(url: &str) -> Result<(String, Vec<u8>), SnapshotError> {
    let rest = url
        .strip_prefix(DATA_URL_PREFIX)
        .ok_or_else(|| SnapshotError::DataUrl("missing data: scheme".to_string()))?;
    let (header, payload) = rest
        .split_once(',')
        .ok_or_else(|| SnapshotError::DataUrl("missing payload separator".to_string()))?;
    let mime = header
        .strip_suffix(BASE64_MARKER)
        .ok_or_else(|| SnapshotError::DataUrl("payload is not base64".to_string()))?;
    if !mime.starts_with("image/") {
        return Err(SnapshotError::DataUrl(format!("unsupported media type {}", mime)));
    }
    let bytes = STANDARD
        .decode(payload.trim())
        .map_err(|e| SnapshotError::DataUrl(e.to_string()))?;
    Ok((mime.to_string(), bytes))
}

/// Hands out strictly increasing wall-clock derived versions.
#[derive(Debug, Clone, Copy, Default)]
pub struct VersionClock {
    last: u64,
}

impl VersionClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next version for a write at `now_millis` (Unix milliseconds).
    pub fn next(&mut self, now_millis: u64) -> u64 {
        let version = now_millis.max(self.last.saturating_add(1));
        self.last = version;
        version
    }

    /// Record a version seen from another writer so later local writes exceed it.
    pub fn observe(&mut self, version: u64) {
        self.last = self.last.max(version);
    }

    /// Last version handed out or observed.
    pub fn last(&self) -> u64 {
        self.last
    }
}

fn serialize_timestamp<S: Serializer>(ts: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&ts.to_rfc3339_opts(SecondsFormat::Millis, true))
}

/// Realtime-database writers store a server timestamp in Unix milliseconds
/// instead of an ISO string; accept both.
fn deserialize_timestamp<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawTimestamp {
        Iso(DateTime<Utc>),
        Millis(i64),
    }

    match RawTimestamp::deserialize(deserializer)? {
        RawTimestamp::Iso(ts) => Ok(ts),
        RawTimestamp::Millis(ms) => DateTime::from_timestamp_millis(ms)
            .ok_or_else(|| serde::de::Error::custom(format!("timestamp out of range: {}", ms))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::BlendMode;

    fn sample_surface() -> Surface {
        let mut surface = Surface::new(16, 8);
        surface.blend_pixel(3, 4, 1.0, [200, 10, 10, 255], BlendMode::SourceOver);
        surface
    }

    #[test]
    fn test_capture_and_decode() {
        let surface = sample_surface();
        let snapshot = CanvasSnapshot::capture(&surface, "Ada", Utc::now(), 7).unwrap();

        assert!(snapshot.image_data.starts_with("data:image/png;base64,"));
        assert_eq!(snapshot.editor, "Ada");
        assert_eq!(snapshot.version, 7);

        let image = snapshot.decode_image().unwrap();
        assert_eq!(&image, surface.pixels());
    }

    #[test]
    fn test_json_field_names() {
        let snapshot = CanvasSnapshot::capture(&sample_surface(), "", Utc::now(), 42).unwrap();
        let json = snapshot.to_json().unwrap();

        assert!(json.contains("\"imageData\""));
        assert!(json.contains("\"timestamp\""));
        assert!(json.contains("\"editor\":\"Anonymous\""));
        assert!(json.contains("\"version\":42"));

        let parsed = CanvasSnapshot::from_json(&json).unwrap();
        assert_eq!(parsed, snapshot);
    }

    #[test]
    fn test_timestamp_iso_millis() {
        let ts = DateTime::parse_from_rfc3339("2024-03-01T12:30:45.123456Z")
            .unwrap()
            .with_timezone(&Utc);
        let snapshot = CanvasSnapshot::capture(&sample_surface(), "Ada", ts, 1).unwrap();
        let json = snapshot.to_json().unwrap();
        assert!(json.contains("\"timestamp\":\"2024-03-01T12:30:45.123Z\""));
    }

    #[test]
    fn test_parse_legacy_snapshot_without_version() {
        let json = r#"{"imageData":"data:image/png;base64,AAAA","timestamp":"2024-01-01T00:00:00.000Z","editor":"Bob"}"#;
        let snapshot = CanvasSnapshot::from_json(json).unwrap();
        assert_eq!(snapshot.version, 0);
        assert_eq!(snapshot.editor, "Bob");
    }

    #[test]
    fn test_parse_millisecond_timestamp() {
        let json = r#"{"imageData":"data:image/png;base64,AAAA","timestamp":1700000000000,"editor":"Bob","version":3}"#;
        let snapshot = CanvasSnapshot::from_json(json).unwrap();
        assert_eq!(snapshot.timestamp.timestamp_millis(), 1_700_000_000_000);
    }

    #[test]
    fn test_malformed_json() {
        assert!(matches!(
            CanvasSnapshot::from_json("{not json"),
            Err(SnapshotError::Json(_))
        ));
    }

    #[test]
    fn test_data_url_errors() {
        assert!(decode_data_url("image/png;base64,AAAA").is_err());
        assert!(decode_data_url("data:image/png;base64").is_err());
        assert!(decode_data_url("data:image/png,AAAA").is_err());
        assert!(decode_data_url("data:text/plain;base64,AAAA").is_err());
        assert!(decode_data_url("data:image/png;base64,@@@").is_err());

        let (mime, bytes) = decode_data_url("data:image/png;base64,AQID").unwrap();
        assert_eq!(mime, "image/png");
        assert_eq!(bytes, vec![1, 2, 3]);
    }

    #[test]
    fn test_corrupt_image_payload() {
        let snapshot = CanvasSnapshot {
            image_data: "data:image/png;base64,AQID".to_string(),
            timestamp: Utc::now(),
            editor: "x".to_string(),
            version: 1,
        };
        assert!(matches!(snapshot.decode_image(), Err(SnapshotError::Image(_))));
    }

    #[test]
    fn test_normalize_editor() {
        assert_eq!(normalize_editor("  "), "Anonymous");
        assert_eq!(normalize_editor(" Grace "), "Grace");
    }

    #[test]
    fn test_version_clock_strictly_increasing() {
        let mut clock = VersionClock::new();
        assert_eq!(clock.next(100), 100);
        assert_eq!(clock.next(100), 101);
        assert_eq!(clock.next(50), 102);
        assert_eq!(clock.next(500), 500);

        clock.observe(1000);
        assert_eq!(clock.next(600), 1001);
        clock.observe(10);
        assert_eq!(clock.last(), 1001);
    }
}
