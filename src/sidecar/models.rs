use std::collections::BTreeSet;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Schema version written into every new sidecar.
pub const SIDECAR_VERSION: &str = "1.0.0";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SidecarData {
    pub version: String,
    pub original_image_path: PathBuf,
    pub original_image_checksum: String,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
    pub metadata: CaptureMetadata,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default)]
    pub notes: String,
    #[serde(default)]
    pub annotations: Vec<Annotation>,
    #[serde(default)]
    pub edit_history: Vec<EditRecord>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ocr_text: Option<String>,
    #[serde(default)]
    pub ocr_completed: bool,
}

impl SidecarData {
    /// Major component of the schema version, if it parses.
    pub fn major_version(&self) -> Option<u32> {
        major_of(&self.version)
    }

    pub fn annotation(&self, id: &str) -> Option<&Annotation> {
        self.annotations.iter().find(|a| a.id == id)
    }
}

pub(crate) fn major_of(version: &str) -> Option<u32> {
    version.split('.').next()?.parse().ok()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptureMetadata {
    pub capture_timestamp: DateTime<Utc>,
    pub application_info: ApplicationInfo,
    pub screen_info: ScreenInfo,
    pub device_info: DeviceInfo,
    pub capture_method: CaptureMethod,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capture_area: Option<CaptureArea>,
}

impl Default for CaptureMetadata {
    fn default() -> Self {
        Self {
            capture_timestamp: Utc::now(),
            application_info: ApplicationInfo::default(),
            screen_info: ScreenInfo::default(),
            device_info: DeviceInfo::default(),
            capture_method: CaptureMethod::Fullscreen,
            capture_area: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationInfo {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScreenInfo {
    pub width: u32,
    pub height: u32,
    pub scale_factor: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_id: Option<String>,
}

impl Default for ScreenInfo {
    fn default() -> Self {
        Self {
            width: 0,
            height: 0,
            scale_factor: 1.0,
            display_id: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    pub platform: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
}

impl Default for DeviceInfo {
    fn default() -> Self {
        Self {
            platform: std::env::consts::OS.to_string(),
            hostname: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum CaptureMethod {
    Fullscreen,
    Window,
    Area,
    Import,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CaptureArea {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AnnotationType {
    Arrow,
    Rectangle,
    Text,
    Numbering,
    Blur,
}

impl AnnotationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AnnotationType::Arrow => "arrow",
            AnnotationType::Rectangle => "rectangle",
            AnnotationType::Text => "text",
            AnnotationType::Numbering => "numbering",
            AnnotationType::Blur => "blur",
        }
    }

    pub fn parse(s: &str) -> Option<AnnotationType> {
        match s {
            "arrow" => Some(AnnotationType::Arrow),
            "rectangle" => Some(AnnotationType::Rectangle),
            "text" => Some(AnnotationType::Text),
            "numbering" => Some(AnnotationType::Numbering),
            "blur" => Some(AnnotationType::Blur),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<f64>,
}

impl Position {
    pub fn point(x: f64, y: f64) -> Self {
        Self {
            x,
            y,
            width: None,
            height: None,
        }
    }

    pub fn rect(x: f64, y: f64, width: f64, height: f64) -> Self {
        Self {
            x,
            y,
            width: Some(width),
            height: Some(height),
        }
    }

    pub fn is_valid(&self) -> bool {
        let dims_ok = |d: Option<f64>| d.is_none_or(|v| v.is_finite() && v >= 0.0);
        self.x.is_finite() && self.y.is_finite() && dims_ok(self.width) && dims_ok(self.height)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Annotation {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: AnnotationType,
    pub color: String,
    pub position: Position,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub number: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blur_intensity: Option<f64>,
    pub created_at: DateTime<Utc>,
    pub modified_at: DateTime<Utc>,
    pub visible: bool,
    pub z_index: i32,
}

impl Annotation {
    pub fn new(kind: AnnotationType, color: &str, position: Position) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind,
            color: color.to_string(),
            position,
            text: None,
            number: None,
            blur_intensity: None,
            created_at: now,
            modified_at: now,
            visible: true,
            z_index: 0,
        }
    }
}

/// Changes to apply to an existing annotation; `None` leaves a field alone.
#[derive(Debug, Clone, Default)]
pub struct AnnotationPatch {
    pub color: Option<String>,
    pub position: Option<Position>,
    pub text: Option<String>,
    pub number: Option<u32>,
    pub blur_intensity: Option<f64>,
    pub visible: Option<bool>,
    pub z_index: Option<i32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EditOperation {
    Created,
    AnnotationAdded,
    AnnotationUpdated,
    AnnotationRemoved,
    TagsChanged,
    NotesChanged,
    OcrCompleted,
    Relinked,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EditRecord {
    pub id: String,
    pub operation: EditOperation,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl EditRecord {
    pub fn new(operation: EditOperation, details: Option<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            operation,
            timestamp: Utc::now(),
            details,
        }
    }
}

/// Partial update merged into an existing sidecar by `SidecarStore::update`.
#[derive(Debug, Clone, Default)]
pub struct SidecarUpdate {
    pub tags: Option<BTreeSet<String>>,
    pub notes: Option<String>,
    pub annotations: Option<Vec<Annotation>>,
    pub ocr_text: Option<String>,
    pub ocr_completed: Option<bool>,
}

/// Non-fatal problems found while loading a sidecar.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IntegrityWarning {
    SchemaMismatch { found: String, expected: String },
    ChecksumMismatch { expected: String, actual: String },
    ImageMissing,
}

#[derive(Debug, Clone)]
pub struct SidecarLoad {
    pub data: SidecarData,
    pub warnings: Vec<IntegrityWarning>,
}

impl SidecarLoad {
    pub fn is_clean(&self) -> bool {
        self.warnings.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChecksumStatus {
    Match,
    Mismatch { expected: String, actual: String },
    ImageMissing,
}

/// One image found by `SidecarStore::scan_directory`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanEntry {
    pub image_path: PathBuf,
    pub sidecar_path: PathBuf,
    pub has_sidecar: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_annotation_type_round_trip() {
        for kind in [
            AnnotationType::Arrow,
            AnnotationType::Rectangle,
            AnnotationType::Text,
            AnnotationType::Numbering,
            AnnotationType::Blur,
        ] {
            assert_eq!(AnnotationType::parse(kind.as_str()), Some(kind));
        }
        assert_eq!(AnnotationType::parse("circle"), None);
    }

    #[test]
    fn test_annotation_serializes_type_key() {
        let ann = Annotation::new(AnnotationType::Blur, "#ff0000", Position::point(1.0, 2.0));
        let json = serde_json::to_value(&ann).unwrap();
        assert_eq!(json["type"], "blur");
        assert_eq!(json["zIndex"], 0);
        assert!(json.get("text").is_none());
    }

    #[test]
    fn test_position_validation() {
        assert!(Position::rect(0.0, 0.0, 10.0, 5.0).is_valid());
        assert!(!Position::rect(0.0, 0.0, -1.0, 5.0).is_valid());
        assert!(!Position::point(f64::NAN, 0.0).is_valid());
    }

    #[test]
    fn test_major_version() {
        assert_eq!(major_of("1.0.0"), Some(1));
        assert_eq!(major_of("2"), Some(2));
        assert_eq!(major_of("x.1"), None);
    }
}
