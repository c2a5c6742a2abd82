//! Archive, restore and delete for image+sidecar pairs.
//!
//! Files move together and are never overwritten. Every operation reports
//! per item; one failing file never stops a batch.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tokio::sync::Mutex;

use crate::config::{LibraryConfig, LibraryPaths};
use crate::errors::{Result, ShotError};
use crate::events::{BulkOperation, EventBus, LibraryEvent};
use crate::index::LibraryIndex;
use crate::sidecar::models::SidecarData;
use crate::sidecar::{SidecarStore, image_for_sidecar, is_sidecar, sidecar_path};
use crate::storage::move_no_clobber;
use crate::thumbnail::ThumbnailCache;
use crate::trash::TrashBin;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemResult {
    pub file_path: PathBuf,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Where the image ended up, for moves and soft deletes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub destination: Option<PathBuf>,
}

impl ItemResult {
    fn from_result(file_path: &Path, result: Result<Option<PathBuf>>) -> Self {
        match result {
            Ok(destination) => Self {
                file_path: file_path.to_path_buf(),
                success: true,
                error: None,
                destination,
            },
            Err(e) => Self {
                file_path: file_path.to_path_buf(),
                success: false,
                error: Some(e.to_string()),
                destination: None,
            },
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchResult {
    pub success: Vec<ItemResult>,
    pub failed: Vec<ItemResult>,
    pub total_count: usize,
}

/// Undo record for a soft delete. Lives only as long as the process.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeletedItem {
    pub original_path: PathBuf,
    pub file_name: String,
    pub deleted_at: DateTime<Utc>,
    pub trashed_path: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trashed_sidecar: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sidecar_data: Option<SidecarData>,
}

/// Bounded, time-boxed list of soft deletes, oldest first.
#[derive(Debug)]
pub struct RecoveryCache {
    items: VecDeque<DeletedItem>,
    capacity: usize,
    retention: Duration,
}

impl RecoveryCache {
    pub fn new(capacity: usize, retention: Duration) -> Self {
        Self {
            items: VecDeque::new(),
            capacity,
            retention,
        }
    }

    /// Adds an item and returns what fell out: an older entry for the same
    /// path, and the oldest entries past capacity.
    #[must_use]
    pub fn push(&mut self, item: DeletedItem) -> Vec<DeletedItem> {
        let mut dropped = Vec::new();
        if let Some(previous) = self.take(&item.original_path) {
            dropped.push(previous);
        }
        self.items.push_back(item);
        while self.items.len() > self.capacity {
            dropped.extend(self.items.pop_front());
        }
        dropped
    }

    /// Removes and returns entries older than the retention window as of `now`.
    #[must_use]
    pub fn purge_expired(&mut self, now: DateTime<Utc>) -> Vec<DeletedItem> {
        let cutoff = now - self.retention;
        let (kept, expired): (Vec<_>, Vec<_>) = std::mem::take(&mut self.items)
            .into_iter()
            .partition(|i| i.deleted_at >= cutoff);
        self.items = VecDeque::from(kept);
        expired
    }

    pub fn take(&mut self, original_path: &Path) -> Option<DeletedItem> {
        let pos = self
            .items
            .iter()
            .position(|i| i.original_path == original_path)?;
        self.items.remove(pos)
    }

    /// Newest first.
    pub fn items(&self) -> Vec<DeletedItem> {
        self.items.iter().rev().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

pub struct LifecycleManager {
    sidecars: SidecarStore,
    index: Option<LibraryIndex>,
    thumbnails: Option<ThumbnailCache>,
    trash: Arc<dyn TrashBin>,
    events: EventBus,
    save_dir: PathBuf,
    archive_dir: PathBuf,
    batch_size: usize,
    recovery: Mutex<RecoveryCache>,
}

impl LifecycleManager {
    pub fn new(
        paths: &LibraryPaths,
        config: &LibraryConfig,
        sidecars: SidecarStore,
        trash: Arc<dyn TrashBin>,
        events: EventBus,
    ) -> Result<Self> {
        Ok(Self {
            sidecars,
            index: None,
            thumbnails: None,
            trash,
            events,
            save_dir: paths.save_dir.clone(),
            archive_dir: paths.archive_dir.clone(),
            batch_size: config.lifecycle_batch_size.max(1),
            recovery: Mutex::new(RecoveryCache::new(
                config.recovery_capacity,
                config.recovery_retention()?,
            )),
        })
    }

    /// Keeps this index in step with every move and delete.
    pub fn with_index(mut self, index: LibraryIndex) -> Self {
        self.index = Some(index);
        self
    }

    /// Drops thumbnails of files that move or disappear.
    pub fn with_thumbnails(mut self, thumbnails: ThumbnailCache) -> Self {
        self.thumbnails = Some(thumbnails);
        self
    }

    pub async fn archive(&self, path: &Path) -> ItemResult {
        let result = self.move_pair(path, &self.archive_dir).await;
        if let Ok(to) = &result {
            log::info!("archived {} -> {}", path.display(), to.display());
            self.events.emit(LibraryEvent::FileArchived {
                from: path.to_path_buf(),
                to: to.clone(),
            });
        }
        self.finish(path, "archive", result.map(Some))
    }

    pub async fn restore(&self, archived: &Path) -> ItemResult {
        let result = self.move_pair(archived, &self.save_dir).await;
        if let Ok(to) = &result {
            log::info!("restored {} -> {}", archived.display(), to.display());
            self.events.emit(LibraryEvent::FileRestored {
                from: archived.to_path_buf(),
                to: to.clone(),
            });
        }
        self.finish(archived, "restore", result.map(Some))
    }

    /// Permanent deletes unlink image and sidecar. Soft deletes move both into
    /// the trash and remember them in the recovery cache.
    pub async fn delete(&self, path: &Path, permanent: bool) -> ItemResult {
        let result = if permanent {
            self.delete_permanently(path).await.map(|_| None)
        } else {
            self.soft_delete(path).await.map(Some)
        };
        if result.is_ok() {
            self.forget_in_catalog(path).await;
            self.events.emit(LibraryEvent::FileDeleted {
                path: path.to_path_buf(),
                permanent,
            });
        }
        self.finish(path, "delete", result)
    }

    pub async fn archive_many(&self, paths: &[PathBuf]) -> BatchResult {
        self.run_batch(BulkOperation::Archive, paths, false).await
    }

    pub async fn restore_many(&self, paths: &[PathBuf]) -> BatchResult {
        self.run_batch(BulkOperation::Restore, paths, false).await
    }

    pub async fn delete_many(&self, paths: &[PathBuf], permanent: bool) -> BatchResult {
        self.run_batch(BulkOperation::Delete, paths, permanent).await
    }

    /// Soft-deleted items still recoverable, newest first.
    pub async fn recently_deleted(&self) -> Vec<DeletedItem> {
        self.recovery.lock().await.items()
    }

    /// Drops expired recovery entries and deletes their trashed files.
    pub async fn purge_expired(&self) -> usize {
        let expired = self.recovery.lock().await.purge_expired(Utc::now());
        let purged = expired.len();
        if purged > 0 {
            log::debug!("purged {} expired recovery entries", purged);
        }
        self.purge_trashed(expired).await;
        purged
    }

    pub async fn forget_deleted(&self, original_path: &Path) -> Option<DeletedItem> {
        self.recovery.lock().await.take(original_path)
    }

    /// Moves a soft-deleted image (and its sidecar) back to where it was.
    pub async fn undo_delete(&self, original_path: &Path) -> ItemResult {
        let Some(item) = self.recovery.lock().await.take(original_path) else {
            return self.finish(
                original_path,
                "undo delete",
                Err(ShotError::NotFound(format!(
                    "{} is not in the recovery cache",
                    original_path.display()
                ))),
            );
        };
        let result = self.restore_from_trash(&item).await;
        if result.is_err() {
            // keep it recoverable
            self.remember(item).await;
        } else {
            self.refresh_catalog(None, original_path).await;
        }
        self.finish(original_path, "undo delete", result.map(|_| Some(original_path.to_path_buf())))
    }

    /// Deletes sidecars in `dir` whose image is gone. Returns how many.
    pub async fn cleanup_orphaned_sidecars(&self, dir: &Path) -> Result<usize> {
        let mut removed = 0;
        let mut rd = tokio::fs::read_dir(dir).await?;
        while let Some(entry) = rd.next_entry().await? {
            let path = entry.path();
            if !is_sidecar(&path) || !entry.file_type().await?.is_file() {
                continue;
            }
            if image_for_sidecar(&path).await.is_none() {
                match tokio::fs::remove_file(&path).await {
                    Ok(()) => {
                        log::info!("removed orphaned sidecar {}", path.display());
                        removed += 1;
                    }
                    Err(e) => log::warn!("could not remove {}: {}", path.display(), e),
                }
            }
        }
        Ok(removed)
    }

    async fn run_batch(
        &self,
        operation: BulkOperation,
        paths: &[PathBuf],
        permanent: bool,
    ) -> BatchResult {
        let total = paths.len();
        let mut result = BatchResult {
            total_count: total,
            ..Default::default()
        };
        let mut processed = 0;
        for chunk in paths.chunks(self.batch_size) {
            for path in chunk {
                let item = match operation {
                    BulkOperation::Archive => self.archive(path).await,
                    BulkOperation::Restore => self.restore(path).await,
                    BulkOperation::Delete => self.delete(path, permanent).await,
                };
                if item.success {
                    result.success.push(item);
                } else {
                    result.failed.push(item);
                }
                processed += 1;
            }
            self.events.emit(LibraryEvent::BulkProgress {
                operation,
                processed,
                total,
            });
            tokio::task::yield_now().await;
        }
        self.events.emit(LibraryEvent::BulkCompleted {
            operation,
            succeeded: result.success.len(),
            failed: result.failed.len(),
        });
        result
    }

    /// Moves image then sidecar into `dest_dir`, keeping the file name.
    async fn move_pair(&self, src: &Path, dest_dir: &Path) -> Result<PathBuf> {
        if !tokio::fs::try_exists(src).await? {
            return Err(ShotError::NotFound(src.display().to_string()));
        }
        let name = src
            .file_name()
            .ok_or_else(|| ShotError::InvalidInput(format!("no file name: {}", src.display())))?;
        let dest = dest_dir.join(name);
        if dest == src {
            return Err(ShotError::Collision(format!(
                "{} is already in {}",
                src.display(),
                dest_dir.display()
            )));
        }
        let src_sidecar = sidecar_path(src);
        let dest_sidecar = sidecar_path(&dest);
        let has_sidecar = tokio::fs::try_exists(&src_sidecar).await?;
        if tokio::fs::try_exists(&dest).await?
            || (has_sidecar && tokio::fs::try_exists(&dest_sidecar).await?)
        {
            return Err(ShotError::Collision(dest.display().to_string()));
        }

        tokio::fs::create_dir_all(dest_dir).await?;
        move_no_clobber(src, &dest).await?;
        if has_sidecar {
            if let Err(e) = move_no_clobber(&src_sidecar, &dest_sidecar).await {
                // put the image back so the pair stays together
                if let Err(undo) = move_no_clobber(&dest, src).await {
                    log::error!(
                        "could not roll back move of {}: {}",
                        dest.display(),
                        undo
                    );
                }
                return Err(e);
            }
            if let Err(e) = self.sidecars.relink(&dest).await {
                log::warn!("could not relink sidecar for {}: {}", dest.display(), e);
            }
        }

        self.refresh_catalog(Some(src), &dest).await;
        Ok(dest)
    }

    async fn delete_permanently(&self, path: &Path) -> Result<()> {
        tokio::fs::remove_file(path).await.map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => ShotError::NotFound(path.display().to_string()),
            _ => ShotError::Io(e),
        })?;
        if let Err(e) = self.sidecars.delete(path).await {
            log::warn!("image removed but sidecar remains for {}: {}", path.display(), e);
        }
        Ok(())
    }

    async fn soft_delete(&self, path: &Path) -> Result<PathBuf> {
        if !tokio::fs::try_exists(path).await? {
            return Err(ShotError::NotFound(path.display().to_string()));
        }
        let sidecar_data = self.sidecars.load_data(path).await.ok().flatten();

        let trash = self.trash.clone();
        let image = path.to_path_buf();
        let trashed_path = tokio::task::spawn_blocking(move || trash.trash(&image)).await??;

        let sidecar = sidecar_path(path);
        let trashed_sidecar = if tokio::fs::try_exists(&sidecar).await.unwrap_or(false) {
            let trash = self.trash.clone();
            match tokio::task::spawn_blocking(move || trash.trash(&sidecar)).await? {
                Ok(p) => Some(p),
                Err(e) => {
                    log::warn!("sidecar for {} not trashed: {}", path.display(), e);
                    None
                }
            }
        } else {
            None
        };

        self.remember(DeletedItem {
            original_path: path.to_path_buf(),
            file_name: path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            deleted_at: Utc::now(),
            trashed_path: trashed_path.clone(),
            trashed_sidecar,
            sidecar_data,
        })
        .await;
        Ok(trashed_path)
    }

    /// Records a soft delete; whatever the cache lets go of leaves the trash.
    async fn remember(&self, item: DeletedItem) {
        let dropped = self.recovery.lock().await.push(item);
        self.purge_trashed(dropped).await;
    }

    async fn purge_trashed(&self, items: Vec<DeletedItem>) {
        for item in items {
            let files = std::iter::once(item.trashed_path).chain(item.trashed_sidecar);
            for file in files {
                let trash = self.trash.clone();
                let target = file.clone();
                let purged = tokio::task::spawn_blocking(move || trash.purge(&target))
                    .await
                    .map_err(ShotError::from)
                    .and_then(|r| r);
                if let Err(e) = purged {
                    log::warn!("could not purge {} from trash: {}", file.display(), e);
                }
            }
        }
    }

    async fn restore_from_trash(&self, item: &DeletedItem) -> Result<()> {
        let trash = self.trash.clone();
        let (from, to) = (item.trashed_path.clone(), item.original_path.clone());
        tokio::task::spawn_blocking(move || trash.restore(&from, &to)).await??;

        if let Some(trashed_sidecar) = &item.trashed_sidecar {
            let trash = self.trash.clone();
            let from = trashed_sidecar.clone();
            let to = sidecar_path(&item.original_path);
            if let Err(e) = tokio::task::spawn_blocking(move || trash.restore(&from, &to)).await? {
                log::warn!(
                    "restored {} without its sidecar: {}",
                    item.original_path.display(),
                    e
                );
            }
        }
        Ok(())
    }

    async fn refresh_catalog(&self, old: Option<&Path>, new: &Path) {
        if let Some(old) = old {
            self.forget_in_catalog(old).await;
        }
        if let Some(index) = &self.index {
            if let Err(e) = index.add_image(new).await {
                log::warn!("could not index {}: {}", new.display(), e);
            }
        }
    }

    async fn forget_in_catalog(&self, path: &Path) {
        if let Some(index) = &self.index {
            index.remove_by_path(path).await;
        }
        if let Some(thumbnails) = &self.thumbnails {
            if let Err(e) = thumbnails.remove_thumbnail(path).await {
                log::warn!("could not drop thumbnails of {}: {}", path.display(), e);
            }
        }
    }

    fn finish(&self, path: &Path, op: &str, result: Result<Option<PathBuf>>) -> ItemResult {
        if let Err(e) = &result {
            log::warn!("{} failed for {}: {}", op, path.display(), e);
        }
        ItemResult::from_result(path, result)
    }
}
