//! Resized JPEG previews, cached on disk under the library's state folder.
//!
//! A thumbnail is reused only while its file is at least as new as the
//! source image. Concurrent requests for the same key share one generation.

use std::collections::{HashMap, HashSet};
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{DateTime, Utc};
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use serde::Serialize;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::config::LibraryConfig;
use crate::errors::{Result, ShotError};
use crate::events::{EventBus, LibraryEvent};
use crate::hash::hash_content;
use crate::storage::write_atomic;

const KEY_LEN: usize = 32;
const THUMBNAIL_EXT: &str = "jpg";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct ThumbnailOptions {
    pub width: u32,
    pub height: u32,
    pub quality: u8,
}

impl Default for ThumbnailOptions {
    fn default() -> Self {
        Self {
            width: 200,
            height: 200,
            quality: 80,
        }
    }
}

impl ThumbnailOptions {
    pub fn from_config(config: &LibraryConfig) -> Self {
        Self {
            width: config.thumbnail_width,
            height: config.thumbnail_height,
            quality: config.thumbnail_quality,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.width == 0 || self.height == 0 {
            return Err(ShotError::InvalidInput(format!(
                "thumbnail size must be non-zero, got {}x{}",
                self.width, self.height
            )));
        }
        if !(1..=100).contains(&self.quality) {
            return Err(ShotError::InvalidInput(format!(
                "thumbnail quality must be 1..=100, got {}",
                self.quality
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedThumbnail {
    pub file_path: PathBuf,
    pub thumbnail_path: PathBuf,
    pub original_modified: DateTime<Utc>,
    pub thumbnail_generated: DateTime<Utc>,
    pub size: u64,
    pub options: ThumbnailOptions,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheSize {
    pub files: usize,
    pub bytes: u64,
}

/// First 32 hex chars of SHA-256 over `"{path}|{w}x{h}|q{quality}"`.
pub fn cache_key(source: &Path, options: &ThumbnailOptions) -> String {
    let raw = format!(
        "{}|{}x{}|q{}",
        source.display(),
        options.width,
        options.height,
        options.quality
    );
    let mut key = hash_content(raw.as_bytes());
    key.truncate(KEY_LEN);
    key
}

struct CacheInner {
    dir: PathBuf,
    events: EventBus,
    /// Size the library asks for by default; lets a fresh process find a
    /// source's thumbnail without any recorded metadata.
    options: ThumbnailOptions,
    entries: Mutex<HashMap<String, CachedThumbnail>>,
    in_flight: StdMutex<HashMap<String, Arc<Mutex<()>>>>,
}

#[derive(Clone)]
pub struct ThumbnailCache {
    inner: Arc<CacheInner>,
}

/// Marks a key as being generated. Waiters block on the held lock; dropping
/// the claim (even on cancellation) unregisters the key and releases them.
struct InFlightClaim {
    inner: Arc<CacheInner>,
    key: String,
    _held: OwnedMutexGuard<()>,
}

impl Drop for InFlightClaim {
    fn drop(&mut self) {
        lock_in_flight(&self.inner).remove(&self.key);
    }
}

fn lock_in_flight(inner: &CacheInner) -> MutexGuard<'_, HashMap<String, Arc<Mutex<()>>>> {
    inner
        .in_flight
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl ThumbnailCache {
    pub fn new(dir: PathBuf, events: EventBus) -> Self {
        Self::with_options(dir, events, ThumbnailOptions::default())
    }

    pub fn with_options(dir: PathBuf, events: EventBus, options: ThumbnailOptions) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                dir,
                events,
                options,
                entries: Mutex::new(HashMap::new()),
                in_flight: StdMutex::new(HashMap::new()),
            }),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.inner.dir
    }

    pub fn default_options(&self) -> ThumbnailOptions {
        self.inner.options
    }

    pub fn thumbnail_path(&self, source: &Path, options: &ThumbnailOptions) -> PathBuf {
        self.path_for_key(&cache_key(source, options))
    }

    fn path_for_key(&self, key: &str) -> PathBuf {
        self.inner.dir.join(format!("{key}.{THUMBNAIL_EXT}"))
    }

    /// Returns a valid thumbnail for `source`, generating it if needed.
    ///
    /// `Ok(None)` means generation failed (missing or undecodable source); a
    /// `thumbnailError` event carries the reason. Only bad options are `Err`.
    pub async fn get_thumbnail(
        &self,
        source: &Path,
        options: ThumbnailOptions,
    ) -> Result<Option<PathBuf>> {
        options.validate()?;
        let key = cache_key(source, &options);

        let _claim = loop {
            match self.claim(&key) {
                Ok(claim) => break claim,
                Err(busy) => {
                    // wait for the running generation, then look again
                    let _ = busy.lock().await;
                }
            }
        };

        let source_modified = match tokio::fs::metadata(source).await.and_then(|m| m.modified()) {
            Ok(t) => t,
            Err(e) => {
                self.report_error(source, &e.to_string());
                return Ok(None);
            }
        };

        if let Some(path) = self.valid_cached(source, &key, options, source_modified).await {
            return Ok(Some(path));
        }

        match self.generate(source, &key, options, source_modified).await {
            Ok(entry) => {
                let thumbnail = entry.thumbnail_path.clone();
                self.inner.entries.lock().await.insert(key, entry);
                log::debug!("thumbnail generated for {}", source.display());
                self.inner.events.emit(LibraryEvent::ThumbnailGenerated {
                    source: source.to_path_buf(),
                    thumbnail: thumbnail.clone(),
                });
                Ok(Some(thumbnail))
            }
            Err(e) => {
                self.report_error(source, &e.to_string());
                Ok(None)
            }
        }
    }

    /// Metadata for a cached thumbnail, without touching the disk.
    pub async fn cached(&self, source: &Path, options: &ThumbnailOptions) -> Option<CachedThumbnail> {
        self.inner
            .entries
            .lock()
            .await
            .get(&cache_key(source, options))
            .cloned()
    }

    /// Deletes every file in the cache directory and forgets all metadata.
    pub async fn clear_cache(&self) -> Result<usize> {
        let mut removed = 0;
        for path in self.cache_files().await? {
            tokio::fs::remove_file(&path).await?;
            removed += 1;
        }
        self.inner.entries.lock().await.clear();
        log::info!("cleared {} thumbnail(s)", removed);
        self.inner
            .events
            .emit(LibraryEvent::CacheCleared { removed });
        Ok(removed)
    }

    /// Removes every recorded thumbnail of `source`, whatever its size, plus
    /// the default-size file even when nothing was recorded for it.
    pub async fn remove_thumbnail(&self, source: &Path) -> Result<usize> {
        let mut doomed: Vec<PathBuf> = {
            let mut entries = self.inner.entries.lock().await;
            let keys: Vec<String> = entries
                .iter()
                .filter(|(_, e)| e.file_path == source)
                .map(|(k, _)| k.clone())
                .collect();
            keys.into_iter()
                .filter_map(|k| entries.remove(&k).map(|e| e.thumbnail_path))
                .collect()
        };
        let default_path = self.thumbnail_path(source, &self.inner.options);
        if !doomed.contains(&default_path) {
            doomed.push(default_path);
        }
        let mut removed = 0;
        for path in &doomed {
            match tokio::fs::remove_file(path).await {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(ShotError::Io(e)),
            }
        }
        if removed > 0 {
            self.inner.events.emit(LibraryEvent::ThumbnailRemoved {
                source: source.to_path_buf(),
            });
        }
        Ok(removed)
    }

    /// Drops thumbnails whose source image no longer exists.
    pub async fn cleanup_orphaned_thumbnails(&self) -> Result<usize> {
        let sources: Vec<PathBuf> = {
            let entries = self.inner.entries.lock().await;
            let mut s: Vec<PathBuf> = entries.values().map(|e| e.file_path.clone()).collect();
            s.sort();
            s.dedup();
            s
        };
        let mut removed = 0;
        for source in sources {
            if !tokio::fs::try_exists(&source).await.unwrap_or(false) {
                removed += self.remove_thumbnail(&source).await?;
            }
        }
        if removed > 0 {
            log::info!("removed {} orphaned thumbnail(s)", removed);
        }
        Ok(removed)
    }

    /// Re-derives metadata for `sources` from the files already on disk.
    /// A thumbnail whose source is gone is still recorded, so the orphan
    /// sweep can find it. Returns how many entries were recorded.
    pub async fn rebuild_metadata(
        &self,
        sources: &[PathBuf],
        options: ThumbnailOptions,
    ) -> Result<usize> {
        options.validate()?;
        let mut found = 0;
        for source in sources {
            let key = cache_key(source, &options);
            // a missing source makes any thumbnail count as current
            let modified = tokio::fs::metadata(source)
                .await
                .and_then(|m| m.modified())
                .unwrap_or(UNIX_EPOCH);
            if self.valid_cached(source, &key, options, modified).await.is_some() {
                found += 1;
            }
        }
        Ok(found)
    }

    /// Deletes every cache file that belongs to none of `known` sources.
    /// A source owns its default-size key and any key recorded for it.
    pub async fn cleanup_unknown_thumbnails(&self, known: &[PathBuf]) -> Result<usize> {
        let known_set: HashSet<&Path> = known.iter().map(PathBuf::as_path).collect();
        let mut keep: HashSet<PathBuf> = known
            .iter()
            .map(|s| self.thumbnail_path(s, &self.inner.options))
            .collect();
        {
            let entries = self.inner.entries.lock().await;
            keep.extend(
                entries
                    .values()
                    .filter(|e| known_set.contains(e.file_path.as_path()))
                    .map(|e| e.thumbnail_path.clone()),
            );
        }

        let mut removed = 0;
        for path in self.cache_files().await? {
            if keep.contains(&path) {
                continue;
            }
            match tokio::fs::remove_file(&path).await {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(ShotError::Io(e)),
            }
        }
        self.inner
            .entries
            .lock()
            .await
            .retain(|_, e| keep.contains(&e.thumbnail_path));
        if removed > 0 {
            log::info!("removed {} unreferenced thumbnail(s)", removed);
        }
        Ok(removed)
    }

    pub async fn cache_size(&self) -> Result<CacheSize> {
        let mut size = CacheSize::default();
        for path in self.cache_files().await? {
            size.files += 1;
            size.bytes += tokio::fs::metadata(&path).await?.len();
        }
        Ok(size)
    }

    fn claim(&self, key: &str) -> std::result::Result<InFlightClaim, Arc<Mutex<()>>> {
        let mut in_flight = lock_in_flight(&self.inner);
        if let Some(busy) = in_flight.get(key) {
            return Err(busy.clone());
        }
        let lock = Arc::new(Mutex::new(()));
        // a fresh mutex is never contended
        let held = match lock.clone().try_lock_owned() {
            Ok(held) => held,
            Err(_) => return Err(lock),
        };
        in_flight.insert(key.to_string(), lock);
        Ok(InFlightClaim {
            inner: self.inner.clone(),
            key: key.to_string(),
            _held: held,
        })
    }

    /// Checks the file on disk and refreshes the metadata entry when valid.
    async fn valid_cached(
        &self,
        source: &Path,
        key: &str,
        options: ThumbnailOptions,
        source_modified: SystemTime,
    ) -> Option<PathBuf> {
        let path = self.path_for_key(key);
        let meta = tokio::fs::metadata(&path).await.ok()?;
        let thumb_modified = meta.modified().ok()?;
        if thumb_modified < source_modified {
            return None;
        }
        let mut entries = self.inner.entries.lock().await;
        entries
            .entry(key.to_string())
            .or_insert_with(|| CachedThumbnail {
                file_path: source.to_path_buf(),
                thumbnail_path: path.clone(),
                original_modified: source_modified.into(),
                thumbnail_generated: thumb_modified.into(),
                size: meta.len(),
                options,
            });
        Some(path)
    }

    async fn generate(
        &self,
        source: &Path,
        key: &str,
        options: ThumbnailOptions,
        source_modified: SystemTime,
    ) -> Result<CachedThumbnail> {
        let input = source.to_path_buf();
        let bytes = tokio::task::spawn_blocking(move || render(&input, options)).await??;
        let path = self.path_for_key(key);
        write_atomic(&path, &bytes).await?;
        Ok(CachedThumbnail {
            file_path: source.to_path_buf(),
            thumbnail_path: path,
            original_modified: source_modified.into(),
            thumbnail_generated: Utc::now(),
            size: bytes.len() as u64,
            options,
        })
    }

    async fn cache_files(&self) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        let mut rd = match tokio::fs::read_dir(&self.inner.dir).await {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(files),
            Err(e) => return Err(ShotError::Io(e)),
        };
        while let Some(entry) = rd.next_entry().await? {
            let path = entry.path();
            if entry.file_type().await?.is_file()
                && path.extension().and_then(|e| e.to_str()) == Some(THUMBNAIL_EXT)
            {
                files.push(path);
            }
        }
        Ok(files)
    }

    fn report_error(&self, source: &Path, message: &str) {
        log::warn!("thumbnail for {} failed: {}", source.display(), message);
        self.inner.events.emit(LibraryEvent::ThumbnailError {
            source: source.to_path_buf(),
            message: message.to_string(),
        });
    }
}

/// Decode, fit inside the box without enlarging, and encode as JPEG.
fn render(source: &Path, options: ThumbnailOptions) -> Result<Vec<u8>> {
    let img = image::open(source)?;
    let fitted = if img.width() <= options.width && img.height() <= options.height {
        img
    } else {
        img.resize(options.width, options.height, FilterType::Lanczos3)
    };
    let mut out = Cursor::new(Vec::new());
    let encoder = JpegEncoder::new_with_quality(&mut out, options.quality);
    fitted.to_rgb8().write_with_encoder(encoder)?;
    Ok(out.into_inner())
}
