//! Searchable catalog of every image in the library.
//!
//! The catalog is a cache: it is rebuilt from image files and their sidecars
//! and persisted only so startup does not require a full rescan. All
//! mutation goes through [`LibraryIndex`]; persistence is debounced and
//! written by a single flush path.

pub mod debounce;
pub mod search;

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::Mutex;

use crate::config::LibraryConfig;
use crate::errors::{Result, ShotError};
use crate::events::{EventBus, LibraryEvent};
use crate::hash::image_id_for_path;
use crate::sidecar::{SidecarStore, is_supported_image};
use crate::storage::CatalogStore;
use crate::storage::models::{CatalogStats, Dimensions, IndexedImage, MetadataUpdate};
use crate::storage::schema::{CATALOG_VERSION, PersistedCatalog};
use debounce::Debouncer;
use search::{InvertedIndex, terms_for, tokenize};

const DEFAULT_SEARCH_LIMIT: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ScanState {
    Idle,
    Scanning,
    Aborted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ScanOutcome {
    Completed,
    Aborted,
    /// Another scan was already running; this call did nothing.
    AlreadyRunning,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanReport {
    pub outcome: ScanOutcome,
    pub total: usize,
    pub processed: usize,
    pub indexed: usize,
    pub unchanged: usize,
    pub pruned: usize,
    pub failed: Vec<(PathBuf, String)>,
}

impl ScanReport {
    fn new(outcome: ScanOutcome, total: usize) -> Self {
        Self {
            outcome,
            total,
            processed: 0,
            indexed: 0,
            unchanged: 0,
            pruned: 0,
            failed: Vec::new(),
        }
    }
}

enum FileResult {
    Indexed,
    Unchanged,
}

#[derive(Default)]
struct Catalog {
    images: HashMap<String, IndexedImage>,
    search: InvertedIndex,
    last_full_scan: Option<DateTime<Utc>>,
}

impl Catalog {
    fn upsert(&mut self, image: IndexedImage) {
        self.search.insert(&image.id, terms_for(&image));
        self.images.insert(image.id.clone(), image);
    }

    fn remove(&mut self, id: &str) -> Option<IndexedImage> {
        self.search.remove(id);
        self.images.remove(id)
    }

    fn snapshot(&self) -> PersistedCatalog {
        PersistedCatalog {
            version: CATALOG_VERSION,
            last_full_scan: self.last_full_scan,
            images: self
                .images
                .iter()
                .map(|(id, img)| (id.clone(), img.clone()))
                .collect::<BTreeMap<_, _>>(),
            search_index: self.search.to_persisted(),
        }
    }
}

struct Inner {
    catalog: Mutex<Catalog>,
    store: Arc<dyn CatalogStore>,
    sidecars: SidecarStore,
    events: EventBus,
    debouncer: Debouncer,
    batch_size: usize,
    scanning: AtomicBool,
    cancel: AtomicBool,
    last_scan_aborted: AtomicBool,
    needs_full_scan: AtomicBool,
    /// Bumped after every catalog mutation.
    generation: AtomicU64,
    /// Generation of the last snapshot the store accepted.
    persisted: AtomicU64,
    /// Held from snapshot to `store.save`; saves land in snapshot order.
    save_lock: Mutex<()>,
}

impl Inner {
    fn mark_dirty(&self) {
        self.generation.fetch_add(1, Ordering::SeqCst);
    }

    fn is_dirty(&self) -> bool {
        self.generation.load(Ordering::SeqCst) != self.persisted.load(Ordering::SeqCst)
    }
}

/// One per library root. Cheap to clone; clones share the same catalog.
#[derive(Clone)]
pub struct LibraryIndex {
    inner: Arc<Inner>,
}

/// Clears the scanning flag however the scan exits.
struct ScanGuard<'a>(&'a AtomicBool);

impl Drop for ScanGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl LibraryIndex {
    pub fn new(
        store: Arc<dyn CatalogStore>,
        sidecars: SidecarStore,
        events: EventBus,
        config: &LibraryConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                catalog: Mutex::new(Catalog::default()),
                store,
                sidecars,
                events,
                debouncer: Debouncer::new(config.save_debounce()),
                batch_size: config.scan_batch_size.max(1),
                scanning: AtomicBool::new(false),
                cancel: AtomicBool::new(false),
                last_scan_aborted: AtomicBool::new(false),
                needs_full_scan: AtomicBool::new(true),
                generation: AtomicU64::new(0),
                persisted: AtomicU64::new(0),
                save_lock: Mutex::new(()),
            }),
        }
    }

    /// Loads the persisted catalog. A missing, corrupt, or wrong-version file
    /// leaves the catalog empty and flags that a full scan is needed.
    pub async fn load(&self) -> Result<usize> {
        let store = self.inner.store.clone();
        let loaded = tokio::task::spawn_blocking(move || store.load()).await?;
        let persisted = match loaded {
            Ok(Some(p)) if p.is_current() => Some(p),
            Ok(Some(p)) => {
                log::info!(
                    "catalog version {} != {}, rebuilding from scan",
                    p.version,
                    CATALOG_VERSION
                );
                None
            }
            Ok(None) => None,
            Err(ShotError::Json(e)) => {
                log::warn!("catalog unreadable, rebuilding from scan: {}", e);
                None
            }
            Err(e) => return Err(e),
        };

        let mut catalog = self.inner.catalog.lock().await;
        *catalog = Catalog::default();
        let count = match persisted {
            Some(p) => {
                catalog.last_full_scan = p.last_full_scan;
                catalog.images = p.images.into_iter().collect();
                catalog.search = InvertedIndex::from_persisted(p.search_index);
                self.inner.needs_full_scan.store(false, Ordering::SeqCst);
                catalog.images.len()
            }
            None => {
                self.inner.needs_full_scan.store(true, Ordering::SeqCst);
                0
            }
        };
        drop(catalog);

        self.inner
            .events
            .emit(LibraryEvent::IndexLoaded { images: count });
        log::info!("catalog loaded with {} image(s)", count);
        Ok(count)
    }

    pub fn needs_full_scan(&self) -> bool {
        self.inner.needs_full_scan.load(Ordering::SeqCst)
    }

    pub fn scan_state(&self) -> ScanState {
        if self.inner.scanning.load(Ordering::SeqCst) {
            ScanState::Scanning
        } else if self.inner.last_scan_aborted.load(Ordering::SeqCst) {
            ScanState::Aborted
        } else {
            ScanState::Idle
        }
    }

    pub fn is_dirty(&self) -> bool {
        self.inner.is_dirty()
    }

    /// Indexes every supported image directly inside `directory` in batches,
    /// yielding between batches. Returns immediately with
    /// [`ScanOutcome::AlreadyRunning`] if a scan is in progress.
    pub async fn start_scan(&self, directory: &Path) -> Result<ScanReport> {
        let inner = &self.inner;
        if inner
            .scanning
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            log::debug!("scan already running, ignoring request for {}", directory.display());
            return Ok(ScanReport::new(ScanOutcome::AlreadyRunning, 0));
        }
        let _guard = ScanGuard(&inner.scanning);
        inner.cancel.store(false, Ordering::SeqCst);
        inner.last_scan_aborted.store(false, Ordering::SeqCst);

        let files = match list_images(directory).await {
            Ok(files) => files,
            Err(e) => {
                inner.events.emit(LibraryEvent::ScanError {
                    directory: directory.to_path_buf(),
                    message: e.to_string(),
                });
                return Err(e);
            }
        };

        let total = files.len();
        log::info!("scanning {} ({} candidate files)", directory.display(), total);
        inner.events.emit(LibraryEvent::ScanStarted {
            directory: directory.to_path_buf(),
            total,
        });

        let mut report = ScanReport::new(ScanOutcome::Completed, total);
        for batch in files.chunks(inner.batch_size) {
            if inner.cancel.load(Ordering::SeqCst) {
                report.outcome = ScanOutcome::Aborted;
                break;
            }
            for path in batch {
                match self.index_file(path).await {
                    Ok(FileResult::Indexed) => report.indexed += 1,
                    Ok(FileResult::Unchanged) => report.unchanged += 1,
                    Err(e) => {
                        log::warn!("failed to index {}: {}", path.display(), e);
                        report.failed.push((path.clone(), e.to_string()));
                    }
                }
                report.processed += 1;
            }
            inner.events.emit(LibraryEvent::ScanProgress {
                processed: report.processed,
                total,
            });
            tokio::task::yield_now().await;
        }

        if report.outcome == ScanOutcome::Completed {
            let seen: HashSet<&PathBuf> = files.iter().collect();
            report.pruned = self.prune_directory(directory, &seen).await;
            self.inner.catalog.lock().await.last_full_scan = Some(Utc::now());
            inner.needs_full_scan.store(false, Ordering::SeqCst);
            inner.events.emit(LibraryEvent::ScanCompleted {
                processed: report.processed,
                total,
            });
            log::info!(
                "scan complete: {} indexed, {} unchanged, {} pruned, {} failed",
                report.indexed,
                report.unchanged,
                report.pruned,
                report.failed.len()
            );
        } else {
            inner.last_scan_aborted.store(true, Ordering::SeqCst);
            inner.events.emit(LibraryEvent::ScanAborted {
                processed: report.processed,
                total,
            });
            log::info!("scan aborted after {}/{} files", report.processed, total);
        }

        inner.mark_dirty();
        if let Err(e) = self.force_save().await {
            inner.events.emit(LibraryEvent::ScanError {
                directory: directory.to_path_buf(),
                message: e.to_string(),
            });
            return Err(e);
        }
        Ok(report)
    }

    /// Asks a running scan to stop at the next batch boundary.
    pub fn stop_scan(&self) {
        if self.inner.scanning.load(Ordering::SeqCst) {
            self.inner.cancel.store(true, Ordering::SeqCst);
        }
    }

    /// Indexes (or re-indexes) a single image and schedules a save.
    pub async fn add_image(&self, path: &Path) -> Result<IndexedImage> {
        let image = self.build_entry(path).await?;
        self.insert_entry(image.clone()).await;
        self.schedule_save();
        Ok(image)
    }

    pub async fn remove_image(&self, id: &str) -> bool {
        let removed = self.inner.catalog.lock().await.remove(id).is_some();
        if removed {
            self.inner
                .events
                .emit(LibraryEvent::ImageRemoved { id: id.to_string() });
            self.schedule_save();
        }
        removed
    }

    pub async fn remove_by_path(&self, path: &Path) -> bool {
        self.remove_image(&image_id_for_path(path)).await
    }

    /// Applies tag/notes/OCR changes to a cataloged image. `Ok(false)` if the
    /// id is unknown.
    pub async fn update_image_metadata(&self, id: &str, update: MetadataUpdate) -> Result<bool> {
        let mut catalog = self.inner.catalog.lock().await;
        let Some(mut image) = catalog.images.get(id).cloned() else {
            return Ok(false);
        };
        if let Some(tags) = update.tags {
            image.tags = tags;
        }
        if let Some(notes) = update.notes {
            image.notes = non_empty(notes);
        }
        if let Some(ocr) = update.ocr_text {
            image.ocr_text = non_empty(ocr);
        }
        image.last_indexed = Utc::now();
        catalog.upsert(image);
        drop(catalog);

        self.inner
            .events
            .emit(LibraryEvent::ImageUpdated { id: id.to_string() });
        self.schedule_save();
        Ok(true)
    }

    /// Ranked search. An empty query lists everything newest first; otherwise
    /// images are ordered by matched term count, then by recency.
    pub async fn search(&self, query: &str, limit: usize) -> Vec<IndexedImage> {
        let limit = if limit == 0 { DEFAULT_SEARCH_LIMIT } else { limit };
        let catalog = self.inner.catalog.lock().await;

        if query.trim().is_empty() {
            let mut all: Vec<&IndexedImage> = catalog.images.values().collect();
            all.sort_by(|a, b| newest_first(a, b));
            return all.into_iter().take(limit).cloned().collect();
        }

        let terms: BTreeSet<String> = tokenize(query).into_iter().collect();
        let scores = catalog.search.score(&terms);
        let mut hits: Vec<(&IndexedImage, usize)> = scores
            .iter()
            .filter_map(|(id, score)| catalog.images.get(id).map(|img| (img, *score)))
            .collect();
        hits.sort_by(|(a, sa), (b, sb)| sb.cmp(sa).then_with(|| newest_first(a, b)));
        hits.into_iter()
            .take(limit)
            .map(|(img, _)| img.clone())
            .collect()
    }

    pub async fn get_image(&self, id: &str) -> Option<IndexedImage> {
        self.inner.catalog.lock().await.images.get(id).cloned()
    }

    pub async fn get_by_path(&self, path: &Path) -> Option<IndexedImage> {
        self.get_image(&image_id_for_path(path)).await
    }

    pub async fn len(&self) -> usize {
        self.inner.catalog.lock().await.images.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Every image, newest first.
    pub async fn all_images(&self) -> Vec<IndexedImage> {
        let catalog = self.inner.catalog.lock().await;
        let mut all: Vec<IndexedImage> = catalog.images.values().cloned().collect();
        all.sort_by(newest_first);
        all
    }

    pub async fn images_with_tag(&self, tag: &str) -> Vec<IndexedImage> {
        self.all_images()
            .await
            .into_iter()
            .filter(|img| img.tags.contains(tag))
            .collect()
    }

    /// Tag -> number of images carrying it.
    pub async fn all_tags(&self) -> BTreeMap<String, usize> {
        let catalog = self.inner.catalog.lock().await;
        let mut counts = BTreeMap::new();
        for tag in catalog.images.values().flat_map(|img| img.tags.iter()) {
            *counts.entry(tag.clone()).or_insert(0) += 1;
        }
        counts
    }

    pub async fn stats(&self) -> CatalogStats {
        let catalog = self.inner.catalog.lock().await;
        CatalogStats {
            total_images: catalog.images.len(),
            total_size: catalog.images.values().map(|i| i.file_size).sum(),
            tagged_images: catalog.images.values().filter(|i| !i.tags.is_empty()).count(),
            ocr_images: catalog.images.values().filter(|i| i.ocr_text.is_some()).count(),
            indexed_terms: catalog.search.term_count(),
            last_full_scan: catalog.last_full_scan,
        }
    }

    /// The inverted index as persisted: term -> sorted ids.
    pub async fn search_index_snapshot(&self) -> BTreeMap<String, Vec<String>> {
        self.inner.catalog.lock().await.search.to_persisted()
    }

    /// Drops entries whose image file no longer exists.
    pub async fn prune_missing(&self) -> usize {
        let paths: Vec<(String, PathBuf)> = {
            let catalog = self.inner.catalog.lock().await;
            catalog
                .images
                .values()
                .map(|i| (i.id.clone(), i.file_path.clone()))
                .collect()
        };
        let mut removed = 0;
        for (id, path) in paths {
            if !tokio::fs::try_exists(&path).await.unwrap_or(false) && self.remove_image(&id).await {
                removed += 1;
            }
        }
        removed
    }

    pub async fn rebuild_search_index(&self) {
        let mut catalog = self.inner.catalog.lock().await;
        let images: Vec<IndexedImage> = catalog.images.values().cloned().collect();
        catalog.search.clear();
        for image in images {
            catalog.search.insert(&image.id, terms_for(&image));
        }
        drop(catalog);
        self.schedule_save();
    }

    pub async fn clear(&self) {
        *self.inner.catalog.lock().await = Catalog::default();
        self.inner.needs_full_scan.store(true, Ordering::SeqCst);
        self.schedule_save();
    }

    /// Writes the catalog now, bypassing the debounce window. Waits for a
    /// save already in progress, then writes whatever that one missed.
    pub async fn force_save(&self) -> Result<()> {
        self.inner.debouncer.cancel();
        flush(&self.inner).await
    }

    /// Stops any scan and flushes pending changes.
    pub async fn shutdown(&self) -> Result<()> {
        self.stop_scan();
        if self.is_dirty() {
            self.force_save().await?;
        }
        Ok(())
    }

    fn schedule_save(&self) {
        self.inner.mark_dirty();
        let inner = self.inner.clone();
        self.inner.debouncer.schedule(move || async move {
            if let Err(e) = flush(&inner).await {
                log::error!("debounced catalog save failed: {}", e);
            }
        });
    }

    async fn index_file(&self, path: &Path) -> Result<FileResult> {
        let meta = tokio::fs::metadata(path).await?;
        let mtime: DateTime<Utc> = meta.modified()?.into();
        let id = image_id_for_path(path);
        if let Some(existing) = self.inner.catalog.lock().await.images.get(&id) {
            if existing.last_modified == mtime {
                return Ok(FileResult::Unchanged);
            }
        }
        let image = self.build_entry(path).await?;
        self.insert_entry(image).await;
        Ok(FileResult::Indexed)
    }

    async fn insert_entry(&self, image: IndexedImage) {
        let event = LibraryEvent::ImageIndexed {
            id: image.id.clone(),
            path: image.file_path.clone(),
        };
        self.inner.catalog.lock().await.upsert(image);
        self.inner.mark_dirty();
        self.inner.events.emit(event);
    }

    async fn build_entry(&self, path: &Path) -> Result<IndexedImage> {
        let meta = tokio::fs::metadata(path)
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => ShotError::NotFound(path.display().to_string()),
                _ => ShotError::Io(e),
            })?;
        let modified: DateTime<Utc> = meta.modified()?.into();
        let created: DateTime<Utc> = meta.created().map(Into::into).unwrap_or(modified);

        let file = path.to_path_buf();
        let dimensions = tokio::task::spawn_blocking(move || image::image_dimensions(&file))
            .await?
            .ok()
            .map(|(width, height)| Dimensions { width, height });

        let sidecar = match self.inner.sidecars.load_data(path).await {
            Ok(s) => s,
            Err(e) => {
                log::warn!("could not read sidecar for {}: {}", path.display(), e);
                None
            }
        };

        let (tags, notes, ocr_text) = match sidecar {
            Some(s) => (s.tags, non_empty(s.notes), s.ocr_text.and_then(non_empty)),
            None => (BTreeSet::new(), None, None),
        };

        Ok(IndexedImage {
            id: image_id_for_path(path),
            file_path: path.to_path_buf(),
            file_name: path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            timestamp: created,
            file_size: meta.len(),
            dimensions,
            tags,
            notes,
            ocr_text,
            last_modified: modified,
            last_indexed: Utc::now(),
        })
    }

    /// Removes entries under `directory` (non-recursive) that the scan did not see.
    async fn prune_directory(&self, directory: &Path, seen: &HashSet<&PathBuf>) -> usize {
        let stale: Vec<String> = {
            let catalog = self.inner.catalog.lock().await;
            catalog
                .images
                .values()
                .filter(|img| img.file_path.parent() == Some(directory))
                .filter(|img| !seen.contains(&img.file_path))
                .map(|img| img.id.clone())
                .collect()
        };
        let mut removed = 0;
        for id in stale {
            if self.inner.catalog.lock().await.remove(&id).is_some() {
                self.inner.events.emit(LibraryEvent::ImageRemoved { id });
                removed += 1;
            }
        }
        removed
    }
}

async fn flush(inner: &Arc<Inner>) -> Result<()> {
    let _turn = inner.save_lock.lock().await;
    if !inner.is_dirty() {
        return Ok(());
    }
    // Mutations bump the generation after touching the catalog, so a change
    // missing from this snapshot always leaves a newer generation behind.
    let (snapshot, generation) = {
        let catalog = inner.catalog.lock().await;
        (catalog.snapshot(), inner.generation.load(Ordering::SeqCst))
    };
    let store = inner.store.clone();
    let images = snapshot.images.len();
    tokio::task::spawn_blocking(move || store.save(&snapshot)).await??;
    inner.persisted.fetch_max(generation, Ordering::SeqCst);
    log::debug!("catalog saved ({} images, generation {})", images, generation);
    Ok(())
}

async fn list_images(directory: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let mut rd = tokio::fs::read_dir(directory).await?;
    while let Some(entry) = rd.next_entry().await? {
        let path = entry.path();
        if is_supported_image(&path) && entry.file_type().await?.is_file() {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

fn newest_first(a: &IndexedImage, b: &IndexedImage) -> std::cmp::Ordering {
    b.timestamp
        .cmp(&a.timestamp)
        .then_with(|| a.file_path.cmp(&b.file_path))
}

fn non_empty(s: String) -> Option<String> {
    if s.trim().is_empty() { None } else { Some(s) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::drain;
    use crate::sidecar::models::CaptureMetadata;
    use crate::storage::json::{JsonCatalogStore, MemoryCatalogStore};
    use std::time::{Duration, SystemTime};
    use tempfile::TempDir;

    fn config() -> LibraryConfig {
        LibraryConfig {
            scan_batch_size: 2,
            save_debounce_ms: 50,
            ..Default::default()
        }
    }

    fn index_with(store: Arc<dyn CatalogStore>) -> LibraryIndex {
        LibraryIndex::new(store, SidecarStore::new(), EventBus::new(), &config())
    }

    fn write_png(path: &Path, w: u32, h: u32) {
        image::RgbImage::new(w, h).save(path).unwrap();
    }

    fn set_times(path: &Path, secs_ago: u64) {
        let t = SystemTime::now() - Duration::from_secs(secs_ago);
        let f = std::fs::File::options().write(true).open(path).unwrap();
        f.set_modified(t).unwrap();
    }

    fn fixture(ts_ago: u64, name: &str, notes: Option<&str>, dir: &Path) -> IndexedImage {
        let ts: DateTime<Utc> = (SystemTime::now() - Duration::from_secs(ts_ago)).into();
        IndexedImage {
            id: name.to_string(),
            file_path: dir.join(name),
            file_name: name.to_string(),
            timestamp: ts,
            file_size: 10,
            dimensions: None,
            tags: BTreeSet::new(),
            notes: notes.map(String::from),
            ocr_text: None,
            last_modified: ts,
            last_indexed: ts,
        }
    }

    #[tokio::test]
    async fn test_scan_indexes_images_with_sidecar_data() {
        let dir = TempDir::new().unwrap();
        let a = dir.path().join("login error.png");
        write_png(&a, 4, 3);
        std::fs::write(dir.path().join("readme.txt"), "x").unwrap();
        SidecarStore::new()
            .create(
                &a,
                CaptureMetadata::default(),
                ["bug".to_string()].into_iter().collect(),
                "checkout crash",
                vec![],
            )
            .await
            .unwrap();

        let index = index_with(Arc::new(MemoryCatalogStore::new()));
        let report = index.start_scan(dir.path()).await.unwrap();
        assert_eq!(report.outcome, ScanOutcome::Completed);
        assert_eq!(report.total, 1);
        assert_eq!(report.indexed, 1);

        let img = index.get_by_path(&a).await.unwrap();
        assert_eq!(img.dimensions, Some(Dimensions { width: 4, height: 3 }));
        assert!(img.tags.contains("bug"));
        assert_eq!(img.notes.as_deref(), Some("checkout crash"));
        assert_eq!(index.search("checkout", 10).await.len(), 1);
        assert_eq!(index.scan_state(), ScanState::Idle);
        assert!(!index.needs_full_scan());
    }

    #[tokio::test]
    async fn test_rescan_without_changes_is_idempotent() {
        let dir = TempDir::new().unwrap();
        for i in 0..5 {
            write_png(&dir.path().join(format!("shot {i}.png")), 2, 2);
        }
        let index = index_with(Arc::new(MemoryCatalogStore::new()));
        index.start_scan(dir.path()).await.unwrap();
        let first_images = index.all_images().await;
        let first_terms = index.search_index_snapshot().await;

        let report = index.start_scan(dir.path()).await.unwrap();
        assert_eq!(report.unchanged, 5);
        assert_eq!(report.indexed, 0);
        assert_eq!(index.all_images().await, first_images);
        assert_eq!(index.search_index_snapshot().await, first_terms);
    }

    #[tokio::test]
    async fn test_rescan_picks_up_modified_and_deleted_files() {
        let dir = TempDir::new().unwrap();
        let a = dir.path().join("a.png");
        let b = dir.path().join("b.png");
        write_png(&a, 2, 2);
        write_png(&b, 2, 2);
        set_times(&a, 100);
        let index = index_with(Arc::new(MemoryCatalogStore::new()));
        index.start_scan(dir.path()).await.unwrap();

        write_png(&a, 8, 8);
        std::fs::remove_file(&b).unwrap();
        let report = index.start_scan(dir.path()).await.unwrap();
        assert_eq!(report.indexed, 1);
        assert_eq!(report.pruned, 1);
        assert_eq!(
            index.get_by_path(&a).await.unwrap().dimensions,
            Some(Dimensions { width: 8, height: 8 })
        );
        assert!(index.get_by_path(&b).await.is_none());
    }

    #[tokio::test]
    async fn test_progress_events_are_monotonic() {
        let dir = TempDir::new().unwrap();
        for i in 0..5 {
            write_png(&dir.path().join(format!("{i}.png")), 1, 1);
        }
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        let index = LibraryIndex::new(
            Arc::new(MemoryCatalogStore::new()),
            SidecarStore::new(),
            bus,
            &config(),
        );
        index.start_scan(dir.path()).await.unwrap();

        let events = drain(&mut rx);
        assert!(matches!(events.first(), Some(LibraryEvent::ScanStarted { total: 5, .. })));
        let progress: Vec<usize> = events
            .iter()
            .filter_map(|e| match e {
                LibraryEvent::ScanProgress { processed, .. } => Some(*processed),
                _ => None,
            })
            .collect();
        assert_eq!(progress, vec![2, 4, 5]);
        assert!(events.iter().any(|e| matches!(e, LibraryEvent::ScanCompleted { processed: 5, .. })));
    }

    #[tokio::test]
    async fn test_stop_scan_aborts_and_persists_partial_catalog() {
        let dir = TempDir::new().unwrap();
        for i in 0..6 {
            write_png(&dir.path().join(format!("{i}.png")), 1, 1);
        }
        let store = Arc::new(MemoryCatalogStore::new());
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        let index = LibraryIndex::new(store.clone(), SidecarStore::new(), bus, &config());

        let watcher = index.clone();
        let stopper = tokio::spawn(async move {
            let mut rx = watcher.inner.events.subscribe();
            while let Ok(ev) = rx.recv().await {
                if matches!(ev, LibraryEvent::ScanProgress { .. }) {
                    watcher.stop_scan();
                    break;
                }
            }
        });
        // give the stopper a chance to subscribe before the scan starts
        tokio::task::yield_now().await;
        let report = index.start_scan(dir.path()).await.unwrap();
        stopper.await.unwrap();

        assert_eq!(report.outcome, ScanOutcome::Aborted);
        assert!(report.processed < 6);
        assert_eq!(index.scan_state(), ScanState::Aborted);
        let events = drain(&mut rx);
        assert!(events.iter().any(|e| matches!(e, LibraryEvent::ScanAborted { .. })));
        assert!(!events.iter().any(|e| matches!(e, LibraryEvent::ScanCompleted { .. })));
        let saved = store.snapshot().unwrap();
        assert_eq!(saved.images.len(), report.processed);
    }

    #[tokio::test]
    async fn test_second_scan_while_running_is_noop() {
        let dir = TempDir::new().unwrap();
        let index = index_with(Arc::new(MemoryCatalogStore::new()));
        index.inner.scanning.store(true, Ordering::SeqCst);
        let report = index.start_scan(dir.path()).await.unwrap();
        assert_eq!(report.outcome, ScanOutcome::AlreadyRunning);
        assert_eq!(index.scan_state(), ScanState::Scanning);
    }

    #[tokio::test]
    async fn test_scan_missing_directory_emits_error() {
        let dir = TempDir::new().unwrap();
        let bus = EventBus::new();
        let mut rx = bus.subscribe();
        let index = LibraryIndex::new(
            Arc::new(MemoryCatalogStore::new()),
            SidecarStore::new(),
            bus,
            &config(),
        );
        assert!(index.start_scan(&dir.path().join("missing")).await.is_err());
        assert!(matches!(drain(&mut rx).as_slice(), [LibraryEvent::ScanError { .. }]));
        assert_eq!(index.scan_state(), ScanState::Idle);
    }

    #[tokio::test]
    async fn test_search_orders_by_score_then_recency() {
        let dir = TempDir::new().unwrap();
        let index = index_with(Arc::new(MemoryCatalogStore::new()));
        {
            let mut catalog = index.inner.catalog.lock().await;
            catalog.upsert(fixture(300, "a.png", Some("login bug"), dir.path()));
            catalog.upsert(fixture(100, "b.png", Some("login bug"), dir.path()));
            catalog.upsert(fixture(10, "c.png", Some("login"), dir.path()));
            catalog.upsert(fixture(5, "d.png", Some("unrelated"), dir.path()));
        }
        let names: Vec<String> = index
            .search("Login BUG", 10)
            .await
            .into_iter()
            .map(|i| i.file_name)
            .collect();
        assert_eq!(names, vec!["b.png", "a.png", "c.png"]);
    }

    #[tokio::test]
    async fn test_empty_query_returns_all_newest_first_with_limit() {
        let dir = TempDir::new().unwrap();
        let index = index_with(Arc::new(MemoryCatalogStore::new()));
        {
            let mut catalog = index.inner.catalog.lock().await;
            catalog.upsert(fixture(300, "old.png", None, dir.path()));
            catalog.upsert(fixture(10, "new.png", None, dir.path()));
            catalog.upsert(fixture(100, "mid.png", None, dir.path()));
        }
        let names: Vec<String> = index
            .search("  ", 2)
            .await
            .into_iter()
            .map(|i| i.file_name)
            .collect();
        assert_eq!(names, vec!["new.png", "mid.png"]);
    }

    #[tokio::test]
    async fn test_update_metadata_reindexes_terms() {
        let dir = TempDir::new().unwrap();
        let a = dir.path().join("plain.png");
        write_png(&a, 1, 1);
        let index = index_with(Arc::new(MemoryCatalogStore::new()));
        let img = index.add_image(&a).await.unwrap();
        assert!(index.search("invoice", 10).await.is_empty());

        let updated = index
            .update_image_metadata(
                &img.id,
                MetadataUpdate {
                    tags: Some(["finance".to_string()].into_iter().collect()),
                    ocr_text: Some("Invoice total".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(updated);
        assert_eq!(index.search("invoice", 10).await.len(), 1);
        assert_eq!(index.images_with_tag("finance").await.len(), 1);
        assert_eq!(index.all_tags().await.get("finance"), Some(&1));
        assert!(!index.update_image_metadata("nope", MetadataUpdate::default()).await.unwrap());
    }

    #[tokio::test]
    async fn test_remove_image_clears_search_terms() {
        let dir = TempDir::new().unwrap();
        let a = dir.path().join("receipt.png");
        write_png(&a, 1, 1);
        let index = index_with(Arc::new(MemoryCatalogStore::new()));
        index.add_image(&a).await.unwrap();
        assert!(index.remove_by_path(&a).await);
        assert!(index.search("receipt", 10).await.is_empty());
        assert!(index.search_index_snapshot().await.is_empty());
        assert!(!index.remove_by_path(&a).await);
    }

    #[tokio::test]
    async fn test_mutations_are_debounced_into_one_save() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(MemoryCatalogStore::new());
        let cfg = LibraryConfig {
            save_debounce_ms: 250,
            ..config()
        };
        let index = LibraryIndex::new(store.clone(), SidecarStore::new(), EventBus::new(), &cfg);
        for i in 0..4 {
            let p = dir.path().join(format!("{i}.png"));
            write_png(&p, 1, 1);
            index.add_image(&p).await.unwrap();
        }
        assert_eq!(store.save_count(), 0);
        assert!(index.is_dirty());
        tokio::time::sleep(Duration::from_millis(800)).await;
        assert_eq!(store.save_count(), 1);
        assert_eq!(store.snapshot().unwrap().images.len(), 4);
        assert!(!index.is_dirty());
    }

    #[tokio::test]
    async fn test_shutdown_flushes_immediately() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(MemoryCatalogStore::new());
        let index = index_with(store.clone());
        let p = dir.path().join("x.png");
        write_png(&p, 1, 1);
        index.add_image(&p).await.unwrap();
        index.shutdown().await.unwrap();
        assert_eq!(store.save_count(), 1);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(store.save_count(), 1);
    }

    /// Store whose first save blocks, so a later save has to queue behind it.
    struct SlowFirstSave {
        inner: MemoryCatalogStore,
        slow: AtomicBool,
    }

    impl CatalogStore for SlowFirstSave {
        fn load(&self) -> Result<Option<PersistedCatalog>> {
            self.inner.load()
        }

        fn save(&self, catalog: &PersistedCatalog) -> Result<()> {
            if self.slow.swap(false, Ordering::SeqCst) {
                std::thread::sleep(Duration::from_millis(400));
            }
            self.inner.save(catalog)
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_shutdown_during_debounced_save_persists_latest_catalog() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(SlowFirstSave {
            inner: MemoryCatalogStore::new(),
            slow: AtomicBool::new(true),
        });
        let index = index_with(store.clone());
        let a = dir.path().join("a.png");
        let b = dir.path().join("b.png");
        write_png(&a, 1, 1);
        write_png(&b, 1, 1);

        index.add_image(&a).await.unwrap();
        // debounced save of [a] is now stuck inside the store
        tokio::time::sleep(Duration::from_millis(120)).await;
        index.add_image(&b).await.unwrap();
        index.shutdown().await.unwrap();

        assert_eq!(index.len().await, 2);
        assert_eq!(store.inner.snapshot().unwrap().images.len(), 2);
        assert!(!index.is_dirty());

        // nothing left for a late timer to write
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(store.inner.save_count() <= 2);
        assert_eq!(store.inner.snapshot().unwrap().images.len(), 2);
    }

    #[tokio::test]
    async fn test_force_save_without_changes_skips_the_store() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(MemoryCatalogStore::new());
        let index = index_with(store.clone());
        let p = dir.path().join("x.png");
        write_png(&p, 1, 1);
        index.add_image(&p).await.unwrap();
        index.force_save().await.unwrap();
        index.force_save().await.unwrap();
        assert_eq!(store.save_count(), 1);
        assert!(!index.is_dirty());
    }

    #[tokio::test]
    async fn test_load_round_trips_through_json_store() {
        let dir = TempDir::new().unwrap();
        let shots = dir.path().join("shots");
        std::fs::create_dir(&shots).unwrap();
        write_png(&shots.join("dashboard.png"), 3, 3);
        let catalog_path = dir.path().join("catalog.json");

        let index = index_with(Arc::new(JsonCatalogStore::new(catalog_path.clone())));
        index.start_scan(&shots).await.unwrap();
        let before = index.all_images().await;

        let reopened = index_with(Arc::new(JsonCatalogStore::new(catalog_path)));
        assert_eq!(reopened.load().await.unwrap(), 1);
        assert!(!reopened.needs_full_scan());
        assert_eq!(reopened.all_images().await, before);
        assert_eq!(reopened.search("dashboard", 5).await.len(), 1);

        let report = reopened.start_scan(&shots).await.unwrap();
        assert_eq!(report.unchanged, 1);
    }

    #[tokio::test]
    async fn test_version_mismatch_discards_catalog() {
        let store = Arc::new(MemoryCatalogStore::new());
        let mut stale = PersistedCatalog::empty();
        stale.version = CATALOG_VERSION + 1;
        let dir = TempDir::new().unwrap();
        stale
            .images
            .insert("x".into(), fixture(1, "x.png", None, dir.path()));
        store.save(&stale).unwrap();

        let index = index_with(store);
        assert_eq!(index.load().await.unwrap(), 0);
        assert!(index.needs_full_scan());
        assert!(index.is_empty().await);
    }

    #[tokio::test]
    async fn test_corrupt_catalog_file_treated_as_absent() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("catalog.json");
        std::fs::write(&path, "garbage").unwrap();
        let index = index_with(Arc::new(JsonCatalogStore::new(path)));
        assert_eq!(index.load().await.unwrap(), 0);
        assert!(index.needs_full_scan());
    }

    #[tokio::test]
    async fn test_prune_missing_and_stats() {
        let dir = TempDir::new().unwrap();
        let a = dir.path().join("a.png");
        let b = dir.path().join("b.png");
        write_png(&a, 1, 1);
        write_png(&b, 1, 1);
        let index = index_with(Arc::new(MemoryCatalogStore::new()));
        index.add_image(&a).await.unwrap();
        index.add_image(&b).await.unwrap();
        std::fs::remove_file(&a).unwrap();

        assert_eq!(index.prune_missing().await, 1);
        let stats = index.stats().await;
        assert_eq!(stats.total_images, 1);
        assert!(stats.total_size > 0);
    }

    #[tokio::test]
    async fn test_add_missing_image_is_not_found() {
        let dir = TempDir::new().unwrap();
        let index = index_with(Arc::new(MemoryCatalogStore::new()));
        assert!(matches!(
            index.add_image(&dir.path().join("gone.png")).await,
            Err(ShotError::NotFound(_))
        ));
    }
}
