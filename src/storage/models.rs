use std::collections::BTreeSet;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dimensions {
    pub width: u32,
    pub height: u32,
}

/// Catalog entry for one image. A projection of the file and its sidecar,
/// rebuilt whenever either changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexedImage {
    pub id: String,
    pub file_path: PathBuf,
    pub file_name: String,
    pub timestamp: DateTime<Utc>,
    pub file_size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dimensions: Option<Dimensions>,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ocr_text: Option<String>,
    pub last_modified: DateTime<Utc>,
    pub last_indexed: DateTime<Utc>,
}

/// Metadata changes applied through `LibraryIndex::update_image_metadata`.
#[derive(Debug, Clone, Default)]
pub struct MetadataUpdate {
    pub tags: Option<BTreeSet<String>>,
    pub notes: Option<String>,
    pub ocr_text: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogStats {
    pub total_images: usize,
    pub total_size: u64,
    pub tagged_images: usize,
    pub ocr_images: usize,
    pub indexed_terms: usize,
    pub last_full_scan: Option<DateTime<Utc>>,
}
