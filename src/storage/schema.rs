use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::models::IndexedImage;

/// Bumped whenever the on-disk catalog shape changes. A file carrying any
/// other version is discarded and rebuilt by a full scan.
pub const CATALOG_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersistedCatalog {
    pub version: u32,
    pub last_full_scan: Option<DateTime<Utc>>,
    pub images: BTreeMap<String, IndexedImage>,
    pub search_index: BTreeMap<String, Vec<String>>,
}

impl PersistedCatalog {
    pub fn empty() -> Self {
        Self {
            version: CATALOG_VERSION,
            last_full_scan: None,
            images: BTreeMap::new(),
            search_index: BTreeMap::new(),
        }
    }

    pub fn is_current(&self) -> bool {
        self.version == CATALOG_VERSION
    }
}
