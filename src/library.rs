use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::config::{LibraryConfig, LibraryPaths};
use crate::errors::Result;
use crate::events::EventBus;
use crate::index::LibraryIndex;
use crate::lifecycle::LifecycleManager;
use crate::sidecar::SidecarStore;
use crate::storage::json::JsonCatalogStore;
use crate::thumbnail::{ThumbnailCache, ThumbnailOptions};
use crate::trash::DirectoryTrash;

/// Every service for one library root, wired to a shared event bus.
pub struct Library {
    pub paths: LibraryPaths,
    pub config: LibraryConfig,
    pub events: EventBus,
    pub sidecars: SidecarStore,
    pub index: LibraryIndex,
    pub thumbnails: ThumbnailCache,
    pub lifecycle: Arc<LifecycleManager>,
    sweeper: JoinHandle<()>,
}

impl Library {
    /// Creates the directory layout, loads the persisted catalog, sweeps the
    /// recovery cache once and keeps sweeping it in the background.
    pub async fn open(paths: LibraryPaths, config: LibraryConfig) -> Result<Self> {
        paths.ensure_dirs().await?;

        let events = EventBus::new();
        let sidecars = SidecarStore::new();
        let index = LibraryIndex::new(
            Arc::new(JsonCatalogStore::new(paths.catalog_path.clone())),
            sidecars.clone(),
            events.clone(),
            &config,
        );
        let thumbnails = ThumbnailCache::with_options(
            paths.thumbnail_dir.clone(),
            events.clone(),
            ThumbnailOptions::from_config(&config),
        );
        let lifecycle = LifecycleManager::new(
            &paths,
            &config,
            sidecars.clone(),
            Arc::new(DirectoryTrash::new(paths.trash_dir.clone())),
            events.clone(),
        )?
        .with_index(index.clone())
        .with_thumbnails(thumbnails.clone());
        let lifecycle = Arc::new(lifecycle);

        index.load().await?;
        lifecycle.purge_expired().await;
        let sweeper = spawn_recovery_sweep(lifecycle.clone(), config.recovery_sweep());

        Ok(Self {
            paths,
            config,
            events,
            sidecars,
            index,
            thumbnails,
            lifecycle,
            sweeper,
        })
    }

    /// Reads `config.json` from the library's state folder, then opens it.
    pub async fn open_at(paths: LibraryPaths) -> Result<Self> {
        let config = LibraryConfig::load_or_default(&paths.config_path)?;
        Self::open(paths, config).await
    }

    pub fn thumbnail_options(&self) -> ThumbnailOptions {
        ThumbnailOptions::from_config(&self.config)
    }

    /// Scans the save directory if the catalog could not be trusted.
    pub async fn ensure_scanned(&self) -> Result<()> {
        if self.index.needs_full_scan() {
            self.index.start_scan(&self.paths.save_dir).await?;
        }
        Ok(())
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.sweeper.abort();
        self.index.shutdown().await
    }
}

impl Drop for Library {
    fn drop(&mut self) {
        self.sweeper.abort();
    }
}

fn spawn_recovery_sweep(lifecycle: Arc<LifecycleManager>, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // the first tick is immediate; open() already swept
        ticker.tick().await;
        loop {
            ticker.tick().await;
            let purged = lifecycle.purge_expired().await;
            if purged > 0 {
                log::info!("recovery sweep dropped {} expired item(s)", purged);
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{LibraryEvent, drain};
    use crate::sidecar::models::CaptureMetadata;
    use std::collections::BTreeSet;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_open_scan_search_and_reopen() {
        let dir = TempDir::new().unwrap();
        let paths = LibraryPaths::from_base(dir.path().to_path_buf());
        let lib = Library::open_at(paths).await.unwrap();
        assert!(lib.paths.archive_dir.is_dir());
        assert!(lib.index.needs_full_scan());

        let shot = lib.paths.save_dir.join("payment failure.png");
        image::RgbImage::new(8, 8).save(&shot).unwrap();
        lib.sidecars
            .create(
                &shot,
                CaptureMetadata::default(),
                ["stripe".to_string()].into_iter().collect::<BTreeSet<_>>(),
                "",
                vec![],
            )
            .await
            .unwrap();

        lib.ensure_scanned().await.unwrap();
        assert_eq!(lib.index.search("stripe payment", 10).await.len(), 1);
        lib.shutdown().await.unwrap();

        let reopened = Library::open_at(LibraryPaths::from_base(dir.path().to_path_buf()))
            .await
            .unwrap();
        assert!(!reopened.index.needs_full_scan());
        assert_eq!(reopened.index.len().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovery_cache_is_swept_periodically() {
        let dir = TempDir::new().unwrap();
        let config = LibraryConfig {
            recovery_retention_days: 0,
            recovery_sweep_secs: 60,
            ..Default::default()
        };
        let lib = Library::open(LibraryPaths::from_base(dir.path().to_path_buf()), config)
            .await
            .unwrap();
        let shot = lib.paths.save_dir.join("old.png");
        image::RgbImage::new(4, 4).save(&shot).unwrap();
        assert!(lib.lifecycle.delete(&shot, false).await.success);
        assert_eq!(lib.lifecycle.recently_deleted().await.len(), 1);

        tokio::time::sleep(Duration::from_secs(61)).await;
        for _ in 0..100 {
            let trash_empty = std::fs::read_dir(&lib.paths.trash_dir).unwrap().count() == 0;
            if trash_empty && lib.lifecycle.recently_deleted().await.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(lib.lifecycle.recently_deleted().await.is_empty());
        assert_eq!(std::fs::read_dir(&lib.paths.trash_dir).unwrap().count(), 0);

        lib.shutdown().await.unwrap();
        for _ in 0..10 {
            if lib.sweeper.is_finished() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert!(lib.sweeper.is_finished());
    }

    #[tokio::test]
    async fn test_thumbnail_removed_by_a_later_process() {
        let dir = TempDir::new().unwrap();
        let paths = || LibraryPaths::from_base(dir.path().to_path_buf());
        let first = Library::open_at(paths()).await.unwrap();
        let shot = first.paths.save_dir.join("a.png");
        image::RgbImage::new(300, 300).save(&shot).unwrap();
        first.index.add_image(&shot).await.unwrap();
        let thumb = first
            .thumbnails
            .get_thumbnail(&shot, first.thumbnail_options())
            .await
            .unwrap()
            .unwrap();
        first.shutdown().await.unwrap();
        drop(first);

        let second = Library::open_at(paths()).await.unwrap();
        assert!(second.lifecycle.delete(&shot, true).await.success);
        assert!(!thumb.exists());
        second.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_services_share_one_event_bus() {
        let dir = TempDir::new().unwrap();
        let lib = Library::open(
            LibraryPaths::from_base(dir.path().to_path_buf()),
            LibraryConfig::default(),
        )
        .await
        .unwrap();
        let mut rx = lib.events.subscribe();

        let shot = lib.paths.save_dir.join("a.png");
        image::RgbImage::new(4, 4).save(&shot).unwrap();
        lib.index.add_image(&shot).await.unwrap();
        lib.thumbnails
            .get_thumbnail(&shot, lib.thumbnail_options())
            .await
            .unwrap();
        assert!(lib.lifecycle.archive(&shot).await.success);

        let events = drain(&mut rx);
        assert!(events.iter().any(|e| matches!(e, LibraryEvent::ImageIndexed { .. })));
        assert!(events.iter().any(|e| matches!(e, LibraryEvent::ThumbnailGenerated { .. })));
        assert!(events.iter().any(|e| matches!(e, LibraryEvent::FileArchived { .. })));
        assert!(events.iter().any(|e| matches!(e, LibraryEvent::ThumbnailRemoved { .. })));
    }
}
