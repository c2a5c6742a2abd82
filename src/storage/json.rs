use std::path::{Path, PathBuf};
use std::sync::Mutex;

use super::schema::PersistedCatalog;
use super::{CatalogStore, write_atomic_blocking};
use crate::errors::{Result, ShotError};

/// Catalog kept as a single JSON file inside the library's state directory.
pub struct JsonCatalogStore {
    path: PathBuf,
}

impl JsonCatalogStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl CatalogStore for JsonCatalogStore {
    fn load(&self) -> Result<Option<PersistedCatalog>> {
        let contents = match std::fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(ShotError::Io(e)),
        };
        Ok(Some(serde_json::from_str(&contents)?))
    }

    fn save(&self, catalog: &PersistedCatalog) -> Result<()> {
        let data = serde_json::to_vec_pretty(catalog)?;
        write_atomic_blocking(&self.path, &data)
    }
}

/// Keeps the catalog in memory and counts saves; used by tests that need to
/// observe flush timing.
#[derive(Default)]
pub struct MemoryCatalogStore {
    inner: Mutex<(Option<PersistedCatalog>, usize)>,
}

impl MemoryCatalogStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn save_count(&self) -> usize {
        self.inner.lock().map(|g| g.1).unwrap_or(0)
    }

    pub fn snapshot(&self) -> Option<PersistedCatalog> {
        self.inner.lock().ok().and_then(|g| g.0.clone())
    }
}

impl CatalogStore for MemoryCatalogStore {
    fn load(&self) -> Result<Option<PersistedCatalog>> {
        Ok(self.snapshot())
    }

    fn save(&self, catalog: &PersistedCatalog) -> Result<()> {
        let mut guard = self
            .inner
            .lock()
            .map_err(|_| ShotError::Io(std::io::Error::other("catalog store poisoned")))?;
        guard.0 = Some(catalog.clone());
        guard.1 += 1;
        Ok(())
    }
}
