pub mod json;
pub mod models;
pub mod schema;

use std::io::ErrorKind;
use std::path::Path;

use crate::errors::{Result, ShotError};
use schema::PersistedCatalog;

/// Durable home of the catalog snapshot. Implementations are synchronous;
/// the index drives them from a blocking task.
pub trait CatalogStore: Send + Sync {
    /// `Ok(None)` when nothing has been persisted yet.
    fn load(&self) -> Result<Option<PersistedCatalog>>;
    fn save(&self, catalog: &PersistedCatalog) -> Result<()>;
}

/// Writes `data` next to `path` and renames it into place, so readers never
/// observe a half-written file.
pub(crate) async fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| ShotError::InvalidInput(format!("no parent: {}", path.display())))?;
    tokio::fs::create_dir_all(dir).await?;
    let tmp = tmp_path(path);
    tokio::fs::write(&tmp, data).await?;
    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(ShotError::Io(e));
    }
    Ok(())
}

pub(crate) fn write_atomic_blocking(path: &Path, data: &[u8]) -> Result<()> {
    let dir = path
        .parent()
        .ok_or_else(|| ShotError::InvalidInput(format!("no parent: {}", path.display())))?;
    std::fs::create_dir_all(dir)?;
    let tmp = tmp_path(path);
    std::fs::write(&tmp, data)?;
    if let Err(e) = std::fs::rename(&tmp, path) {
        let _ = std::fs::remove_file(&tmp);
        return Err(ShotError::Io(e));
    }
    Ok(())
}

/// Moves `src` to `dest` without ever replacing an existing `dest`.
///
/// Links first so the kernel rejects an occupied destination atomically;
/// falls back to check-then-rename where hard links are unavailable.
pub(crate) async fn move_no_clobber(src: &Path, dest: &Path) -> Result<()> {
    match tokio::fs::hard_link(src, dest).await {
        Ok(()) => {
            if let Err(e) = tokio::fs::remove_file(src).await {
                let _ = tokio::fs::remove_file(dest).await;
                return Err(ShotError::Io(e));
            }
            Ok(())
        }
        Err(e) => match e.kind() {
            ErrorKind::AlreadyExists => Err(ShotError::Collision(dest.display().to_string())),
            ErrorKind::NotFound => Err(ShotError::NotFound(src.display().to_string())),
            ErrorKind::CrossesDevices | ErrorKind::Unsupported | ErrorKind::PermissionDenied => {
                log::debug!("hard link unavailable for {}: {}", dest.display(), e);
                if tokio::fs::try_exists(dest).await? {
                    return Err(ShotError::Collision(dest.display().to_string()));
                }
                tokio::fs::rename(src, dest).await?;
                Ok(())
            }
            _ => Err(ShotError::Io(e)),
        },
    }
}

pub(crate) fn move_no_clobber_blocking(src: &Path, dest: &Path) -> Result<()> {
    match std::fs::hard_link(src, dest) {
        Ok(()) => {
            if let Err(e) = std::fs::remove_file(src) {
                let _ = std::fs::remove_file(dest);
                return Err(ShotError::Io(e));
            }
            Ok(())
        }
        Err(e) => match e.kind() {
            ErrorKind::AlreadyExists => Err(ShotError::Collision(dest.display().to_string())),
            ErrorKind::NotFound => Err(ShotError::NotFound(src.display().to_string())),
            ErrorKind::CrossesDevices | ErrorKind::Unsupported | ErrorKind::PermissionDenied => {
                log::debug!("hard link unavailable for {}: {}", dest.display(), e);
                if dest.try_exists()? {
                    return Err(ShotError::Collision(dest.display().to_string()));
                }
                std::fs::rename(src, dest)?;
                Ok(())
            }
            _ => Err(ShotError::Io(e)),
        },
    }
}

fn tmp_path(path: &Path) -> std::path::PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(".tmp");
    path.with_file_name(name)
}
